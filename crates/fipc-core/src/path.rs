//! Endpoint path validation.
//!
//! Applications name endpoints with short rendezvous names like
//! `"my-service"`. The transport maps those onto the filesystem under a
//! fixed prefix; the name itself must not contain path separators or
//! control characters, and prefix + name must fit a `sockaddr_un`.

use std::path::PathBuf;

use crate::error::{Error, Result};

/// Filesystem prefix prepended to every endpoint name.
pub const ENDPOINT_PREFIX: &str = "/tmp/fipc.";

/// Longest usable socket path: `sun_path` is 108 bytes including the
/// terminating NUL on Linux.
const SOCKET_PATH_MAX: usize = 107;

/// Validate an endpoint name and map it to its rendezvous path.
///
/// Rejected with [`Error::InvalidPath`]: empty names, names containing
/// `/`, `\` or control characters, and names that would overflow the
/// transport's address limit.
pub fn endpoint_path(name: &str) -> Result<PathBuf> {
    if name.is_empty() {
        return Err(Error::InvalidPath);
    }
    if name
        .chars()
        .any(|c| c == '/' || c == '\\' || c.is_control())
    {
        return Err(Error::InvalidPath);
    }
    if ENDPOINT_PREFIX.len() + name.len() > SOCKET_PATH_MAX {
        return Err(Error::InvalidPath);
    }
    Ok(PathBuf::from(format!("{ENDPOINT_PREFIX}{name}")))
}
