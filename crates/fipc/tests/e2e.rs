//! End-to-end scenarios over real UNIX domain sockets.

mod common;

use std::io::Write as _;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use fipc::{Error, Permissions, Server, Socket, SocketEventArgs, ENDPOINT_PREFIX};

use common::{admitting_server, cb, connected_client, pump_until, unique_name};

#[test]
fn test_single_echo() {
    let name = unique_name("echo");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();

    let client = connected_client(&name);
    assert!(client.is_open());

    let peer = pump_until(&server, None, || admitted.lock().unwrap().first().cloned());

    // Server: read one packet, write it straight back.
    let (server_tx, server_rx) = mpsc::channel::<Vec<u8>>();
    peer.read(
        cb(move |sock, result| {
            let payload = result.unwrap().to_vec();
            sock.write(&payload, cb(|_, result| { result.unwrap(); }), None)
                .unwrap();
            server_tx.send(payload).unwrap();
        }),
        None,
    )
    .unwrap();

    // Client: queue the reply read, then send.
    let (client_tx, client_rx) = mpsc::channel::<Vec<u8>>();
    client
        .read(
            cb(move |_sock, result| {
                client_tx.send(result.unwrap().to_vec()).unwrap();
            }),
            None,
        )
        .unwrap();
    client
        .write(
            b"Hello",
            cb(|_sock, result| {
                assert_eq!(result.unwrap(), b"Hello");
            }),
            None,
        )
        .unwrap();

    let echoed = pump_until(&server, Some(&client), || client_rx.try_recv().ok());
    assert_eq!(echoed, b"Hello");
    assert_eq!(server_rx.try_recv().unwrap(), b"Hello".to_vec());

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_rejected_admission() {
    let name = unique_name("reject");
    let server = fipc::server();
    server.set_path(&name).unwrap();
    // No listener sets `allow`, so every connection is rejected.
    server.open().unwrap();

    let client = fipc::socket().unwrap();
    client.set_path(&name).unwrap();
    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = closed.clone();
        client.events().closed.add(move |args: &mut SocketEventArgs| {
            assert_eq!(args.status, Err(Error::SocketClosed));
            closed.store(true, Ordering::SeqCst);
        });
    }
    // Transport-level connect succeeds; the rejection arrives as a close.
    client.open().unwrap();

    pump_until(&server, Some(&client), || {
        closed.load(Ordering::SeqCst).then_some(())
    });
    assert!(!client.is_open());
    assert_eq!(
        client
            .write(b"x", cb(|_, _| panic!("callback must not fire")), None)
            .unwrap_err(),
        Error::NotSupported
    );

    // The rejected slot was rearmed, not lost.
    assert_eq!(server.free_sockets(), 8);
    server.close().unwrap();
}

#[test]
fn test_backlog_replenishment() {
    let name = unique_name("backlog");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();
    assert_eq!(server.free_sockets(), 8);

    let mut clients = Vec::new();
    for round in 1..=3 {
        let client = connected_client(&name);
        pump_until(&server, None, || {
            (admitted.lock().unwrap().len() == round && server.free_sockets() == 8).then_some(())
        });
        clients.push(client);
    }
    assert_eq!(admitted.lock().unwrap().len(), 3);

    server.close().unwrap();
}

#[test]
fn test_oversize_header_closes_socket() {
    let name = unique_name("oversize");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();

    // A raw peer that speaks the framing by hand.
    let mut raw =
        std::os::unix::net::UnixStream::connect(format!("{ENDPOINT_PREFIX}{name}")).unwrap();

    let peer = pump_until(&server, None, || admitted.lock().unwrap().first().cloned());
    let closed = Arc::new(AtomicBool::new(false));
    {
        let closed = closed.clone();
        peer.events().closed.add(move |_args: &mut SocketEventArgs| {
            closed.store(true, Ordering::SeqCst);
        });
    }
    let (error_tx, error_rx) = mpsc::channel::<Error>();
    peer.read(
        cb(move |_sock, result| {
            error_tx.send(result.unwrap_err()).unwrap();
        }),
        None,
    )
    .unwrap();

    // Header declaring 2 MiB + 1, over the 1 MiB limit.
    raw.write_all(&0x0020_0001u32.to_le_bytes()).unwrap();

    let err = pump_until(&server, None, || error_rx.try_recv().ok());
    assert_eq!(err, Error::BadSize);
    pump_until(&server, None, || {
        closed.load(Ordering::SeqCst).then_some(())
    });
    assert!(!peer.is_open());

    server.close().unwrap();
}

#[test]
fn test_write_ordering() {
    let name = unique_name("order");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();
    let client = connected_client(&name);
    let peer = pump_until(&server, Some(&client), || {
        admitted.lock().unwrap().first().cloned()
    });

    // Three reads queued up front; their callbacks fire in order.
    let received: Arc<Mutex<Vec<Vec<u8>>>> = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..3 {
        let received = received.clone();
        peer.read(
            cb(move |_sock, result| {
                received.lock().unwrap().push(result.unwrap().to_vec());
            }),
            None,
        )
        .unwrap();
    }

    // Three writes back-to-back with distinct callbacks.
    let write_order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));
    for (payload, tag) in [(&b"A"[..], "A"), (&b"BB"[..], "BB"), (&b"CCC"[..], "CCC")] {
        let write_order = write_order.clone();
        client
            .write(
                payload,
                cb(move |_sock, result| {
                    result.unwrap();
                    write_order.lock().unwrap().push(tag);
                }),
                None,
            )
            .unwrap();
    }

    pump_until(&server, Some(&client), || {
        (received.lock().unwrap().len() == 3 && write_order.lock().unwrap().len() == 3)
            .then_some(())
    });

    assert_eq!(
        *received.lock().unwrap(),
        vec![b"A".to_vec(), b"BB".to_vec(), b"CCC".to_vec()]
    );
    assert_eq!(*write_order.lock().unwrap(), vec!["A", "BB", "CCC"]);

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_empty_payload_roundtrip() {
    let name = unique_name("empty");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();
    let client = connected_client(&name);
    let peer = pump_until(&server, Some(&client), || {
        admitted.lock().unwrap().first().cloned()
    });

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    peer.read(
        cb(move |_sock, result| {
            tx.send(result.unwrap().to_vec()).unwrap();
        }),
        None,
    )
    .unwrap();
    client
        .write(b"", cb(|_sock, result| assert_eq!(result.unwrap(), b"")), None)
        .unwrap();

    let payload = pump_until(&server, Some(&client), || rx.try_recv().ok());
    assert!(payload.is_empty());

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_maximum_packet_roundtrip() {
    let name = unique_name("maxpkt");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();
    let client = connected_client(&name);
    let peer = pump_until(&server, Some(&client), || {
        admitted.lock().unwrap().first().cloned()
    });

    // Exactly the 1 MiB limit; large enough to force short reads and
    // writes on the stream.
    let mut payload = vec![0u8; fipc::MAXIMUM_PACKET_SIZE];
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte = (i % 251) as u8;
    }

    let (tx, rx) = mpsc::channel::<Vec<u8>>();
    peer.read(
        cb(move |_sock, result| {
            tx.send(result.unwrap().to_vec()).unwrap();
        }),
        None,
    )
    .unwrap();
    let sent = payload.clone();
    client
        .write(
            &payload,
            cb(move |_sock, result| assert_eq!(result.unwrap().len(), sent.len())),
            None,
        )
        .unwrap();

    let received = pump_until(&server, Some(&client), || rx.try_recv().ok());
    assert_eq!(received, payload);

    // One byte more is rejected synchronously, before any I/O.
    let oversize = vec![0u8; fipc::MAXIMUM_PACKET_SIZE + 1];
    assert_eq!(
        client
            .write(&oversize, cb(|_, _| panic!("callback must not fire")), None)
            .unwrap_err(),
        Error::BadSize
    );

    client.close().unwrap();
    server.close().unwrap();
}

#[test]
fn test_close_semantics() {
    let name = unique_name("close");
    let (server, _admitted) = admitting_server(&name);
    server.open().unwrap();
    let client = connected_client(&name);

    // set_path is rejected while open, on sockets and servers alike.
    assert_eq!(client.set_path("elsewhere").unwrap_err(), Error::NotSupported);
    assert_eq!(server.set_path("elsewhere").unwrap_err(), Error::NotSupported);
    assert_eq!(
        server.set_permissions(Permissions::WORLD).unwrap_err(),
        Error::NotSupported
    );

    // Queued requests fail with SocketClosed when the socket closes.
    let failed = Arc::new(AtomicUsize::new(0));
    {
        let failed = failed.clone();
        client
            .read(
                cb(move |_sock, result| {
                    assert_eq!(result.unwrap_err(), Error::SocketClosed);
                    failed.fetch_add(1, Ordering::SeqCst);
                }),
                None,
            )
            .unwrap();
    }
    client.close().unwrap();
    assert_eq!(failed.load(Ordering::SeqCst), 1);

    // Closing twice is a no-op; reads and writes after close fail fast.
    client.close().unwrap();
    assert!(!client.is_open());
    assert_eq!(
        client
            .read(cb(|_, _| panic!("callback must not fire")), None)
            .unwrap_err(),
        Error::NotSupported
    );
    assert_eq!(
        client
            .write(b"x", cb(|_, _| panic!("callback must not fire")), None)
            .unwrap_err(),
        Error::NotSupported
    );

    server.close().unwrap();
    server.close().unwrap();
    assert!(!server.is_open());
}

#[test]
fn test_permissions_applied_to_socket_file() {
    use std::os::unix::fs::PermissionsExt;

    let name = unique_name("perms");
    let server = fipc::server();
    server.set_path(&name).unwrap();
    server
        .set_permissions(Permissions::USER | Permissions::GROUP)
        .unwrap();
    server.open().unwrap();

    let metadata = std::fs::metadata(format!("{ENDPOINT_PREFIX}{name}")).unwrap();
    assert_eq!(metadata.permissions().mode() & 0o777, 0o660);

    server.close().unwrap();
    // The socket file is removed on close.
    assert!(std::fs::metadata(format!("{ENDPOINT_PREFIX}{name}")).is_err());
}

#[test]
fn test_server_reopen_same_path() {
    let name = unique_name("reopen");
    let (server, admitted) = admitting_server(&name);
    server.open().unwrap();
    let first = connected_client(&name);
    pump_until(&server, None, || {
        (!admitted.lock().unwrap().is_empty()).then_some(())
    });
    first.close().unwrap();
    server.close().unwrap();

    server.open().unwrap();
    let second = connected_client(&name);
    pump_until(&server, None, || {
        (admitted.lock().unwrap().len() >= 2).then_some(())
    });
    assert!(second.is_open());
    second.close().unwrap();
    server.close().unwrap();
}
