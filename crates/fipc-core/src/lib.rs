//! # fipc-core — shared vocabulary for FIPC
//!
//! Platform-independent pieces of the FIPC local IPC library:
//!
//! - [`error`] — the closed error taxonomy and `Result<T>` alias
//! - [`event`] — a small multicast event helper (add/remove/fire)
//! - [`path`] — endpoint name validation and rendezvous path mapping
//! - [`perms`] — the User/Group/World permission bitmask
//! - [`socket`] / [`server`] — the public trait seams implemented by the
//!   platform engine (`fipc-uring` on Linux)
//!
//! The wire format is fixed here: every message is a 4-byte little-endian
//! payload length followed by exactly that many payload bytes. The length
//! does not include the prefix itself and may not exceed
//! [`MAXIMUM_PACKET_SIZE`].

pub mod error;
pub mod event;
pub mod path;
pub mod perms;
pub mod server;
pub mod socket;

pub use error::{Error, Result};
pub use event::{Event, ListenerId};
pub use path::{endpoint_path, ENDPOINT_PREFIX};
pub use perms::Permissions;
pub use server::{ConnectedArgs, Server};
pub use socket::{CallbackData, IoCallback, Socket, SocketEventArgs, SocketEvents};

/// Largest payload a single packet may carry, in bytes.
///
/// A header declaring more than this is a protocol error (`BadSize`) and
/// desynchronizes the stream, so the receiving socket closes.
pub const MAXIMUM_PACKET_SIZE: usize = 1_048_576;

/// Byte width of the on-wire length prefix.
pub const HEADER_SIZE: usize = 4;

/// On-wire representation of a packet's payload length (little-endian).
pub type PacketSize = u32;

/// `work(time_limit)` budgets above this many milliseconds mean
/// "wait forever".
pub const INFINITE_TIME_LIMIT_MS: u128 = 2_147_483_647;
