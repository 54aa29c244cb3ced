//! # fipc-uring — the Linux engine behind FIPC
//!
//! Implements the `fipc-core` socket and server seams over UNIX domain
//! stream sockets, with all asynchronous I/O driven through one `io_uring`
//! per dispatcher.
//!
//! ```text
//!  application threads              kernel
//!  ───────────────────             ────────
//!  read()/write() ──► SQE push ──► io_uring ──► CQE
//!  work(budget)   ◄── callback ◄── dispatcher reap
//! ```
//!
//! The library never spawns threads of its own. Application threads make
//! progress by calling `work(time_limit)` on a server (shared dispatcher)
//! or a client socket (private dispatcher); each call dequeues at most one
//! completion and runs its callback before returning.

pub mod client;
pub mod dispatcher;
pub mod record;
pub mod server;
pub mod server_socket;
mod socket;
mod sys;

pub use client::ClientSocket;
pub use dispatcher::Dispatcher;
pub use record::{CompletionRecord, CompletionStatus, RecordState};
pub use server::UdsServer;
pub use server_socket::ServerSocket;
