//! The socket seam: a reliable, ordered, bidirectional stream of discrete
//! byte packets over a local stream transport.
//!
//! # Contract
//!
//! - `read`/`write`/`open` never block: they enqueue work and return.
//!   Completion callbacks fire later, on whichever thread is inside
//!   `work()` when the completion is dequeued.
//! - Per direction, callbacks fire in submission order: the N-th `read`
//!   observes the N-th packet, the N-th `write`'s bytes appear N-th on the
//!   wire.
//! - At most one transport read and one transport write are in flight per
//!   socket at any instant.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::Event;

/// Opaque per-request payload handed back to the request's callback.
pub type CallbackData = Option<Arc<dyn Any + Send + Sync>>;

/// One-shot completion callback for a read or write request.
///
/// Receives the socket, the payload (or the error that ended the request),
/// and the request's opaque payload.
pub type IoCallback = Box<dyn FnOnce(&Arc<dyn Socket>, Result<&[u8]>, CallbackData) + Send>;

/// Arguments for the `opened` / `closed` socket events.
pub struct SocketEventArgs {
    pub status: Result<()>,
    pub socket: Arc<dyn Socket>,
}

/// Lifecycle events every socket exposes.
///
/// `opened` fires when the connection is established end-to-end; `closed`
/// fires exactly once per connection, after all preceding read/write
/// completions on that socket.
pub struct SocketEvents {
    pub opened: Event<SocketEventArgs>,
    pub closed: Event<SocketEventArgs>,
}

impl SocketEvents {
    pub fn new() -> Self {
        Self {
            opened: Event::new(),
            closed: Event::new(),
        }
    }
}

impl Default for SocketEvents {
    fn default() -> Self {
        Self::new()
    }
}

/// A framed connection endpoint.
pub trait Socket: Send + Sync {
    /// Set the endpoint name to connect to. Only valid while closed.
    ///
    /// Server-side sockets reject this with `NotSupported`; their path
    /// belongs to the owning server.
    fn set_path(&self, name: &str) -> Result<()>;

    /// Transition Closed → Open.
    ///
    /// Client sockets connect to the endpoint; server-side sockets arm an
    /// asynchronous wait for a client and return immediately.
    fn open(&self) -> Result<()>;

    /// Transition Open → Closed: cancel outstanding I/O, disconnect the
    /// transport, and fail every queued request with `SocketClosed`.
    /// Idempotent.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Service this socket's completion dispatcher with the given budget.
    ///
    /// Client sockets own a private dispatcher; server-side sockets share
    /// the server's, so this is a no-op for them.
    fn work(&self, time_limit: Duration) -> Result<()>;

    /// Enqueue a receive request. If the read pipeline was idle, the
    /// transport read is issued before returning.
    fn read(&self, callback: IoCallback, data: CallbackData) -> Result<()>;

    /// Frame `payload` with its length prefix and enqueue the packet. If
    /// the write pipeline was idle, the transport write is issued before
    /// returning.
    fn write(&self, payload: &[u8], callback: IoCallback, data: CallbackData) -> Result<()>;

    fn events(&self) -> &SocketEvents;
}
