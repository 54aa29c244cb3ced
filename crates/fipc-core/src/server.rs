//! The server seam: a listening endpoint with a pre-warmed pool of
//! server-side sockets and an admission event.

use std::sync::Arc;
use std::time::Duration;

use crate::error::Result;
use crate::event::Event;
use crate::perms::Permissions;
use crate::socket::Socket;

/// Arguments for the `connected` admission event.
///
/// `allow` starts `false`; any listener may set it, and the value after
/// the last listener has run decides whether the connection is admitted.
pub struct ConnectedArgs {
    pub allow: bool,
    pub socket: Arc<dyn Socket>,
}

/// A listening endpoint.
pub trait Server: Send + Sync {
    /// Set the endpoint name to listen on. Fails with `NotSupported` while
    /// the server is open.
    fn set_path(&self, name: &str) -> Result<()>;

    /// Configure who the OS should allow to connect. Fails with
    /// `NotSupported` while the server is open.
    fn set_permissions(&self, permissions: Permissions) -> Result<()>;

    /// Create the dispatcher, bind the listener, and arm the socket pool.
    fn open(&self) -> Result<()>;

    /// Stop all sockets, cancel pending waits, wake every worker thread,
    /// and tear the dispatcher down. Idempotent.
    fn close(&self) -> Result<()>;

    fn is_open(&self) -> bool;

    /// Dequeue at most one completion and run its callback.
    ///
    /// Safe to call from any number of threads concurrently; each call
    /// services at most one completion. Returns `Err(TimedOut)` when the
    /// budget elapses without progress.
    fn work(&self, time_limit: Duration) -> Result<()>;

    /// Admission event, fired from within `work()` whenever a pooled
    /// socket finishes its wait and a peer is connected.
    fn connected(&self) -> &Event<ConnectedArgs>;

    /// Number of pooled sockets currently awaiting a connection.
    fn free_sockets(&self) -> usize;
}
