//! Shared helpers for the end-to-end tests.
#![allow(dead_code)] // not every test binary uses every helper

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use fipc::{ClientSocket, ConnectedArgs, IoCallback, Result, Server, Socket, UdsServer};

/// Unique endpoint name per test, so parallel tests never collide.
pub fn unique_name(tag: &str) -> String {
    static COUNTER: AtomicU32 = AtomicU32::new(0);
    format!(
        "t{}-{}-{}",
        std::process::id(),
        tag,
        COUNTER.fetch_add(1, Ordering::SeqCst)
    )
}

/// Wrap a two-argument closure as an I/O callback.
pub fn cb(
    f: impl FnOnce(&Arc<dyn Socket>, Result<&[u8]>) + Send + 'static,
) -> IoCallback {
    Box::new(move |sock, result, _data| f(sock, result))
}

/// Drive the server (and optionally a client) until `poll` yields a value.
pub fn pump_until<T>(
    server: &Arc<UdsServer>,
    client: Option<&Arc<ClientSocket>>,
    mut poll: impl FnMut() -> Option<T>,
) -> T {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Some(value) = poll() {
            return value;
        }
        assert!(Instant::now() < deadline, "test deadline exceeded");
        let _ = server.work(Duration::from_millis(10));
        if let Some(client) = client {
            let _ = client.work(Duration::from_millis(5));
        }
    }
}

/// Build a server on `name` that admits every connection and collects the
/// admitted sockets.
pub fn admitting_server(name: &str) -> (Arc<UdsServer>, Arc<Mutex<Vec<Arc<dyn Socket>>>>) {
    let server = fipc::server();
    server.set_path(name).unwrap();
    let admitted: Arc<Mutex<Vec<Arc<dyn Socket>>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let admitted = admitted.clone();
        server.connected().add(move |args: &mut ConnectedArgs| {
            args.allow = true;
            admitted.lock().unwrap().push(args.socket.clone());
        });
    }
    (server, admitted)
}

/// A connected client on `name`.
pub fn connected_client(name: &str) -> Arc<ClientSocket> {
    let client = fipc::socket().unwrap();
    client.set_path(name).unwrap();
    client.open().unwrap();
    client
}
