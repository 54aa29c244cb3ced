//! # FIPC — low-latency local IPC
//!
//! Bidirectional message channels between processes on the same host:
//! length-prefixed packets over a UNIX domain stream socket, with
//! completion-driven asynchronous I/O that application threads pump via
//! `work(time_limit)`. The library spawns no threads of its own.
//!
//! ```no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use fipc::{ConnectedArgs, Server, Socket};
//!
//! // Server: listen, admit everyone, echo the first packet back.
//! let server = fipc::server();
//! server.set_path("echo-1")?;
//! server.connected().add(|args: &mut ConnectedArgs| {
//!     args.allow = true;
//!     let _ = args.socket.read(
//!         Box::new(|sock, result, _data| {
//!             if let Ok(payload) = result {
//!                 let _ = sock.write(payload, Box::new(|_, _, _| {}), None);
//!             }
//!         }),
//!         None,
//!     );
//! });
//! server.open()?;
//!
//! // Client: connect and send a packet.
//! let client = fipc::socket()?;
//! client.set_path("echo-1")?;
//! client.open()?;
//! client.write(b"Hello", Box::new(|_, result, _| { result.unwrap(); }), None)?;
//!
//! // Drive completions until done.
//! loop {
//!     let _ = server.work(Duration::from_millis(10));
//!     let _ = client.work(Duration::from_millis(10));
//!     # break;
//! }
//! # Ok::<(), fipc::Error>(())
//! ```

use std::sync::Arc;

pub use fipc_core::{
    endpoint_path, CallbackData, ConnectedArgs, Error, Event, IoCallback, ListenerId, PacketSize,
    Permissions, Result, Server, Socket, SocketEventArgs, SocketEvents, ENDPOINT_PREFIX,
    HEADER_SIZE, INFINITE_TIME_LIMIT_MS, MAXIMUM_PACKET_SIZE,
};
pub use fipc_uring::{
    ClientSocket, CompletionRecord, CompletionStatus, Dispatcher, RecordState, ServerSocket,
    UdsServer,
};

/// Create a new server for inter-process communication.
pub fn server() -> Arc<UdsServer> {
    UdsServer::create()
}

/// Create a new client socket with its own dispatcher.
pub fn socket() -> Result<Arc<ClientSocket>> {
    ClientSocket::create()
}
