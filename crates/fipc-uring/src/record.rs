//! `CompletionRecord` — one outstanding asynchronous I/O operation.
//!
//! A record pairs a submitted SQE with the closure that handles its CQE.
//! Its heap address doubles as the correlation token carried in the SQE's
//! `user_data`; the dispatcher resolves the token back to the record
//! through its in-flight table, which also holds the strong references
//! that pin the record (and the buffers the kernel writes into) for the
//! whole Pending interval.
//!
//! **Contract:** while a record is Pending it must not be destroyed or
//! moved, and none of its configuration may change. The dispatcher's
//! in-flight table enforces the first half; the state checks here enforce
//! the second.

use std::os::fd::RawFd;
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use fipc_core::{CallbackData, Error, Result};

use crate::dispatcher::Dispatcher;
use crate::sys;

/// Lifecycle of one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Idle,
    Pending,
    Completed,
    Cancelled,
    Failed,
}

const S_IDLE: u8 = 0;
const S_PENDING: u8 = 1;
const S_COMPLETED: u8 = 2;
const S_CANCELLED: u8 = 3;
const S_FAILED: u8 = 4;

fn state_from(raw: u8) -> RecordState {
    match raw {
        S_PENDING => RecordState::Pending,
        S_COMPLETED => RecordState::Completed,
        S_CANCELLED => RecordState::Cancelled,
        S_FAILED => RecordState::Failed,
        _ => RecordState::Idle,
    }
}

/// Non-blocking answer to "how did this operation end?".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionStatus {
    /// Finished; carries bytes transferred (or the raw positive result).
    Ok(usize),
    /// Not finished yet.
    Pending,
    /// The transport reported peer disconnection or a broken pipe.
    SocketClosed,
    /// Cancelled before it could finish.
    Cancelled,
    /// Failed with the contained errno.
    Failed(i32),
}

/// Dispatch closure bound to a record. Invoked by the dispatcher with the
/// record itself and the bytes transferred.
pub type DispatchFn = Arc<dyn Fn(&CompletionRecord, usize) + Send + Sync>;

pub struct CompletionRecord {
    /// Transport handle; non-owning, valid for the operation's duration.
    handle: AtomicI32,
    state: AtomicU8,
    /// Raw CQE result: bytes transferred, or a negative errno.
    result: AtomicI32,
    callback: Mutex<Option<DispatchFn>>,
    data: Mutex<CallbackData>,
    dispatcher: Mutex<Weak<Dispatcher>>,
}

impl CompletionRecord {
    pub fn new() -> Arc<CompletionRecord> {
        Arc::new(CompletionRecord {
            handle: AtomicI32::new(-1),
            state: AtomicU8::new(S_IDLE),
            result: AtomicI32::new(0),
            callback: Mutex::new(None),
            data: Mutex::new(None),
            dispatcher: Mutex::new(Weak::new()),
        })
    }

    /// Correlation token: the record's stable heap address.
    pub(crate) fn token(&self) -> u64 {
        self as *const CompletionRecord as u64
    }

    pub fn state(&self) -> RecordState {
        state_from(self.state.load(Ordering::Acquire))
    }

    pub fn handle(&self) -> RawFd {
        self.handle.load(Ordering::Acquire)
    }

    pub fn set_handle(&self, fd: RawFd) -> Result<()> {
        self.ensure_not_pending()?;
        self.handle.store(fd, Ordering::Release);
        Ok(())
    }

    pub fn data(&self) -> CallbackData {
        self.data.lock().unwrap().clone()
    }

    pub fn set_data(&self, data: CallbackData) -> Result<()> {
        self.ensure_not_pending()?;
        *self.data.lock().unwrap() = data;
        Ok(())
    }

    pub fn set_callback(&self, callback: DispatchFn) -> Result<()> {
        self.ensure_not_pending()?;
        *self.callback.lock().unwrap() = Some(callback);
        Ok(())
    }

    pub(crate) fn clear_callback(&self) {
        *self.callback.lock().unwrap() = None;
    }

    /// Raw CQE result of the last completion.
    pub fn result(&self) -> i32 {
        self.result.load(Ordering::Acquire)
    }

    /// Best-effort cancellation of the in-flight operation. A no-op when
    /// nothing is pending. Does not free the record; the completion (with
    /// a cancelled status) still arrives through the dispatcher.
    pub fn cancel(&self) {
        if self.state.load(Ordering::Acquire) != S_PENDING {
            return;
        }
        if let Some(dispatcher) = self.dispatcher.lock().unwrap().upgrade() {
            dispatcher.cancel_token(self.token());
        }
    }

    /// Whether the operation has finished (in any terminal state).
    pub fn is_completed(&self) -> bool {
        matches!(
            self.state.load(Ordering::Acquire),
            S_COMPLETED | S_CANCELLED | S_FAILED
        )
    }

    /// Return a finished record to Idle, zeroing its completion state.
    pub fn reset(&self) -> Result<()> {
        self.ensure_not_pending()?;
        self.result.store(0, Ordering::Release);
        self.state.store(S_IDLE, Ordering::Release);
        Ok(())
    }

    /// Map the completion state onto the library's error taxonomy.
    pub fn status(&self) -> CompletionStatus {
        match self.state.load(Ordering::Acquire) {
            S_COMPLETED => CompletionStatus::Ok(self.result().max(0) as usize),
            S_CANCELLED => CompletionStatus::Cancelled,
            S_FAILED => {
                let err = -self.result();
                match sys::error_from_errno(err) {
                    Error::SocketClosed => CompletionStatus::SocketClosed,
                    _ => CompletionStatus::Failed(err),
                }
            }
            _ => CompletionStatus::Pending,
        }
    }

    /// The error to report through a request callback, if any.
    pub(crate) fn failure(&self) -> Option<Error> {
        match self.status() {
            CompletionStatus::Ok(_) => None,
            CompletionStatus::Pending => Some(Error::Failure),
            CompletionStatus::SocketClosed | CompletionStatus::Cancelled => {
                Some(Error::SocketClosed)
            }
            CompletionStatus::Failed(err) => Some(sys::error_from_errno(err)),
        }
    }

    // ── Dispatcher interface ─────────────────────────────────────────

    pub(crate) fn attach(&self, dispatcher: Weak<Dispatcher>) {
        *self.dispatcher.lock().unwrap() = dispatcher;
    }

    /// Idle → Pending, claiming the record for one submission.
    pub(crate) fn begin_submit(&self) -> Result<()> {
        self.state
            .compare_exchange(S_IDLE, S_PENDING, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| Error::NotSupported)
    }

    /// Roll back a submission that never reached the ring.
    pub(crate) fn abort_submit(&self) {
        let _ = self.state.compare_exchange(
            S_PENDING,
            S_IDLE,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Record the CQE outcome.
    pub(crate) fn complete(&self, raw_result: i32) {
        self.result.store(raw_result, Ordering::Release);
        let next = if raw_result == -libc::ECANCELED {
            S_CANCELLED
        } else if raw_result < 0 {
            S_FAILED
        } else {
            S_COMPLETED
        };
        self.state.store(next, Ordering::Release);
    }

    /// Delegate to the bound dispatch closure, if any.
    pub(crate) fn invoke(&self, bytes: usize) {
        let callback = self.callback.lock().unwrap().clone();
        if let Some(callback) = callback {
            callback(self, bytes);
        }
    }

    fn ensure_not_pending(&self) -> Result<()> {
        if self.state.load(Ordering::Acquire) == S_PENDING {
            return Err(Error::NotSupported);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_fresh_record_is_idle() {
        let rec = CompletionRecord::new();
        assert_eq!(rec.state(), RecordState::Idle);
        assert_eq!(rec.status(), CompletionStatus::Pending);
        assert!(!rec.is_completed());
    }

    #[test]
    fn test_configuration_locked_while_pending() {
        let rec = CompletionRecord::new();
        rec.set_handle(7).unwrap();
        rec.begin_submit().unwrap();

        assert_eq!(rec.set_handle(8).unwrap_err(), Error::NotSupported);
        assert_eq!(rec.set_data(None).unwrap_err(), Error::NotSupported);
        assert_eq!(rec.reset().unwrap_err(), Error::NotSupported);
        // A second submission cannot claim a pending record.
        assert_eq!(rec.begin_submit().unwrap_err(), Error::NotSupported);

        rec.abort_submit();
        assert_eq!(rec.state(), RecordState::Idle);
        rec.set_handle(8).unwrap();
    }

    #[test]
    fn test_completion_outcomes() {
        let rec = CompletionRecord::new();

        rec.begin_submit().unwrap();
        rec.complete(16);
        assert_eq!(rec.state(), RecordState::Completed);
        assert_eq!(rec.status(), CompletionStatus::Ok(16));
        assert!(rec.failure().is_none());

        rec.reset().unwrap();
        rec.begin_submit().unwrap();
        rec.complete(-libc::EPIPE);
        assert_eq!(rec.state(), RecordState::Failed);
        assert_eq!(rec.status(), CompletionStatus::SocketClosed);
        assert_eq!(rec.failure(), Some(Error::SocketClosed));

        rec.reset().unwrap();
        rec.begin_submit().unwrap();
        rec.complete(-libc::ECANCELED);
        assert_eq!(rec.state(), RecordState::Cancelled);
        assert_eq!(rec.status(), CompletionStatus::Cancelled);
        assert_eq!(rec.failure(), Some(Error::SocketClosed));

        rec.reset().unwrap();
        rec.begin_submit().unwrap();
        rec.complete(-libc::ENOMEM);
        assert_eq!(rec.status(), CompletionStatus::Failed(libc::ENOMEM));
        assert_eq!(rec.failure(), Some(Error::Failure));
    }

    #[test]
    fn test_invoke_delegates() {
        let rec = CompletionRecord::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        rec.set_callback(Arc::new(move |_rec, bytes| {
            assert_eq!(bytes, 5);
            hits2.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
        rec.invoke(5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        rec.clear_callback();
        rec.invoke(5);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_token_is_stable() {
        let rec = CompletionRecord::new();
        let t1 = rec.token();
        let clone = rec.clone();
        assert_eq!(t1, clone.token());
        assert_ne!(t1, 0);
    }
}
