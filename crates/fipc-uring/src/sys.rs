//! Raw UNIX-domain-socket plumbing.
//!
//! Thin libc wrappers for the few synchronous transport calls the engine
//! needs: listener setup, client connect, and errno translation. All
//! asynchronous I/O goes through the dispatcher's ring instead.

use std::ffi::CString;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use fipc_core::{Error, Permissions, Result};

pub(crate) fn errno() -> i32 {
    // Safety: __errno_location is always valid on Linux.
    unsafe { *libc::__errno_location() }
}

/// Map a raw errno into the library taxonomy.
///
/// Disconnect-class errors collapse into `SocketClosed`; a cancelled
/// operation reports the same, since only a local or remote close can
/// cancel it.
pub(crate) fn error_from_errno(err: i32) -> Error {
    match err {
        libc::EPIPE
        | libc::ECONNRESET
        | libc::ECONNABORTED
        | libc::ENOTCONN
        | libc::ESHUTDOWN
        | libc::ECANCELED => Error::SocketClosed,
        libc::ETIME | libc::ETIMEDOUT => Error::TimedOut,
        libc::ENAMETOOLONG => Error::InvalidPath,
        _ => Error::Failure,
    }
}

fn sockaddr_for(path: &Path) -> Result<(libc::sockaddr_un, libc::socklen_t)> {
    let bytes = path.as_os_str().as_bytes();
    // Safety: sockaddr_un is plain old data; zeroed is a valid value.
    let mut addr: libc::sockaddr_un = unsafe { std::mem::zeroed() };
    if bytes.len() >= addr.sun_path.len() {
        return Err(Error::InvalidPath);
    }
    addr.sun_family = libc::AF_UNIX as libc::sa_family_t;
    for (dst, src) in addr.sun_path.iter_mut().zip(bytes.iter()) {
        *dst = *src as libc::c_char;
    }
    let len = (std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((addr, len))
}

fn stream_socket() -> Result<OwnedFd> {
    let fd = unsafe { libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0) };
    if fd < 0 {
        return Err(error_from_errno(errno()));
    }
    // Safety: fd is a freshly created, unowned descriptor.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Create, bind and arm a listening socket at `path` with the given
/// permission mode applied to the socket file.
pub(crate) fn unix_listener(path: &Path, perms: Permissions, backlog: usize) -> Result<OwnedFd> {
    let (addr, len) = sockaddr_for(path)?;
    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| Error::InvalidPath)?;
    let fd = stream_socket()?;

    unsafe {
        // A stale socket file from a crashed predecessor would make bind fail.
        libc::unlink(c_path.as_ptr());

        if libc::bind(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        ) != 0
        {
            return Err(error_from_errno(errno()));
        }
        if libc::chmod(c_path.as_ptr(), perms.mode()) != 0 {
            return Err(error_from_errno(errno()));
        }
        if libc::listen(fd.as_raw_fd(), backlog as libc::c_int) != 0 {
            return Err(error_from_errno(errno()));
        }
    }
    Ok(fd)
}

/// Connect to a listening endpoint. Local connects complete immediately
/// or fail; there is no in-between worth waiting on.
pub(crate) fn unix_connect(path: &Path) -> Result<OwnedFd> {
    let (addr, len) = sockaddr_for(path)?;
    let fd = stream_socket()?;
    let ret = unsafe {
        libc::connect(
            fd.as_raw_fd(),
            &addr as *const libc::sockaddr_un as *const libc::sockaddr,
            len,
        )
    };
    if ret != 0 {
        return Err(error_from_errno(errno()));
    }
    Ok(fd)
}

/// Remove the socket file left behind by a listener.
pub(crate) fn unlink_path(path: &Path) {
    if let Ok(c_path) = CString::new(path.as_os_str().as_bytes()) {
        unsafe {
            libc::unlink(c_path.as_ptr());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(error_from_errno(libc::EPIPE), Error::SocketClosed);
        assert_eq!(error_from_errno(libc::ECONNRESET), Error::SocketClosed);
        assert_eq!(error_from_errno(libc::ECANCELED), Error::SocketClosed);
        assert_eq!(error_from_errno(libc::ETIME), Error::TimedOut);
        assert_eq!(error_from_errno(libc::ENOMEM), Error::Failure);
    }

    #[test]
    fn test_sockaddr_length_guard() {
        let long = PathBuf::from(format!("/tmp/{}", "x".repeat(200)));
        assert_eq!(sockaddr_for(&long).unwrap_err(), Error::InvalidPath);
    }

    #[test]
    fn test_connect_to_missing_endpoint_fails() {
        let path = PathBuf::from("/tmp/fipc.test-no-such-endpoint");
        assert!(unix_connect(&path).is_err());
    }

    #[test]
    fn test_listener_roundtrip() {
        let path = PathBuf::from(format!("/tmp/fipc.test-sys-{}", std::process::id()));
        let listener = unix_listener(&path, Permissions::USER, 8).unwrap();
        assert!(listener.as_raw_fd() >= 0);
        let client = unix_connect(&path).unwrap();
        assert!(client.as_raw_fd() >= 0);
        drop(client);
        drop(listener);
        unlink_path(&path);
    }
}
