//! Many clients, many worker threads, one server.

mod common;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use fipc::{ConnectedArgs, Server, Socket};

use common::{cb, unique_name};

const CLIENTS: usize = 1000;
const WORKERS: usize = 4;

#[test]
fn test_concurrent_workers() {
    let name = unique_name("workers");
    let server = fipc::server();
    server.set_path(&name).unwrap();

    // Every admitted socket immediately reads one message into the sink.
    let (sink_tx, sink_rx) = mpsc::channel::<Vec<u8>>();
    server.connected().add(move |args: &mut ConnectedArgs| {
        args.allow = true;
        let sink_tx = sink_tx.clone();
        let _ = args.socket.read(
            cb(move |_sock, result| {
                if let Ok(payload) = result {
                    let _ = sink_tx.send(payload.to_vec());
                }
            }),
            None,
        );
    });
    server.open().unwrap();

    let done = Arc::new(AtomicBool::new(false));
    let mut workers = Vec::new();
    for _ in 0..WORKERS {
        let server = server.clone();
        let done = done.clone();
        workers.push(std::thread::spawn(move || loop {
            let _ = server.work(Duration::from_secs(60));
            if done.load(Ordering::Acquire) {
                break;
            }
        }));
    }

    // Each client connects, sends one message, and closes once the write
    // has completed.
    for i in 0..CLIENTS {
        let client = fipc::socket().unwrap();
        client.set_path(&name).unwrap();
        client.open().unwrap();

        let (ack_tx, ack_rx) = mpsc::channel::<()>();
        client
            .write(
                format!("message-{i}").as_bytes(),
                cb(move |_sock, result| {
                    result.unwrap();
                    let _ = ack_tx.send(());
                }),
                None,
            )
            .unwrap();
        let deadline = Instant::now() + Duration::from_secs(10);
        while ack_rx.try_recv().is_err() {
            assert!(Instant::now() < deadline, "write ack timed out");
            let _ = client.work(Duration::from_millis(5));
        }
        client.close().unwrap();
    }

    // All messages arrive, each exactly once.
    let mut seen = HashSet::new();
    let deadline = Instant::now() + Duration::from_secs(30);
    while seen.len() < CLIENTS {
        let remaining = deadline
            .checked_duration_since(Instant::now())
            .expect("collection timed out");
        let payload = sink_rx
            .recv_timeout(remaining.min(Duration::from_secs(5)))
            .expect("missing messages");
        assert!(seen.insert(payload), "message dispatched twice");
    }
    assert_eq!(seen.len(), CLIENTS);

    // close() must unblock every worker.
    done.store(true, Ordering::Release);
    server.close().unwrap();
    for worker in workers {
        worker.join().unwrap();
    }
}
