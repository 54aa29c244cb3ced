//! FIPC error taxonomy.
//!
//! I/O errors are expected traffic here, not exceptional control flow:
//! they travel through request callbacks as plain values. Only
//! configuration and lifecycle calls (`set_path`, `open`, `close`) return
//! them directly.

use std::fmt;

/// Every error the library can report, as a closed sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Error {
    /// Uncategorized OS error.
    Unknown,
    /// Recoverable generic error; the caller may retry.
    Failure,
    /// Unrecoverable error; the owning object is in an undefined state
    /// and should be closed.
    CriticalFailure,
    /// A bounded wait elapsed without progress.
    TimedOut,
    /// The operation is invalid in the object's current state.
    NotSupported,
    /// Peer disconnected, transport broken, or the socket was closed locally.
    SocketClosed,
    /// The endpoint path was rejected.
    InvalidPath,
    /// A framed read received fewer bytes than the 4-byte header.
    BadHeader,
    /// The header declared a length exceeding the maximum packet size.
    BadSize,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown error"),
            Self::Failure => write!(f, "operation failed"),
            Self::CriticalFailure => write!(f, "unrecoverable failure"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::NotSupported => write!(f, "operation not supported in this state"),
            Self::SocketClosed => write!(f, "socket closed"),
            Self::InvalidPath => write!(f, "invalid endpoint path"),
            Self::BadHeader => write!(f, "malformed packet header"),
            Self::BadSize => write!(f, "packet size exceeds limit"),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_is_stable() {
        assert_eq!(Error::SocketClosed.to_string(), "socket closed");
        assert_eq!(Error::BadSize.to_string(), "packet size exceeds limit");
    }

    #[test]
    fn test_errors_compare() {
        assert_eq!(Error::TimedOut, Error::TimedOut);
        assert_ne!(Error::Failure, Error::CriticalFailure);
    }

    #[test]
    fn test_result_alias() {
        let ok: Result<u32> = Ok(1);
        let err: Result<u32> = Err(Error::NotSupported);
        assert!(ok.is_ok());
        assert_eq!(err.unwrap_err(), Error::NotSupported);
    }
}
