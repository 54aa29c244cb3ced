//! `Dispatcher` — demultiplexes ring completions back to their records.
//!
//! One `io_uring` per dispatcher. Submission is serialized by a lock;
//! reaping uses a leader/follower discipline: whichever `work()` caller
//! wins the drive lock waits in the kernel and drains the completion
//! queue into a lock-free handoff queue, then every waiter (leader
//! included) races to pop exactly one completion and dispatch it.
//!
//! The dispatcher owns no threads. Shutdown wakes every thread currently
//! inside `work()` with a sentinel completion (token `0`) that is returned
//! without dispatch.
//!
//! The in-flight table maps each submitted SQE's `user_data` token to its
//! record plus a keep-alive reference for whatever owns the I/O buffers.
//! Entries live from submission until their CQE is dispatched, which is
//! what keeps record addresses and buffers stable while the kernel may
//! still write to them.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use io_uring::{opcode, squeue, types, IoUring};

use fipc_core::{Error, Result, INFINITE_TIME_LIMIT_MS};

use crate::record::CompletionRecord;

/// `user_data` value that never names a record: shutdown sentinels, the
/// cancel operations themselves, and the wakeup nop all carry it.
pub(crate) const SENTINEL_TOKEN: u64 = 0;

/// Ring size for a client socket's private dispatcher.
pub(crate) const CLIENT_ENTRIES: u32 = 64;

/// Ring size for a server's shared dispatcher.
pub(crate) const SERVER_ENTRIES: u32 = 256;

/// How long a follower parks before re-checking the handoff queue when it
/// has no deadline of its own.
const FOLLOWER_PARK: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy)]
struct Completion {
    token: u64,
    result: i32,
}

struct Inflight {
    record: Arc<CompletionRecord>,
    /// Pins whatever owns the buffers referenced by the submitted SQE.
    #[allow(dead_code)]
    keepalive: Option<Arc<dyn Any + Send + Sync>>,
}

pub struct Dispatcher {
    /// Handed to records so `cancel()` can reach the ring.
    this: Weak<Dispatcher>,
    ring: IoUring,
    /// Serializes submission-queue pushes and non-waiting submits.
    sq_lock: Mutex<()>,
    /// Held by the single thread waiting in the kernel.
    drive: Mutex<()>,
    /// Reaped completions awaiting dispatch.
    ready: ArrayQueue<Completion>,
    /// Parking lot for follower workers.
    parked: Mutex<()>,
    wakeup: Condvar,
    inflight: Mutex<HashMap<u64, Inflight>>,
    workers: AtomicUsize,
    closing: AtomicBool,
}

impl Dispatcher {
    pub fn new(entries: u32) -> Result<Arc<Dispatcher>> {
        let ring = IoUring::builder()
            .build(entries)
            .map_err(|_| Error::Failure)?;
        Ok(Arc::new_cyclic(|this| Dispatcher {
            this: this.clone(),
            ring,
            sq_lock: Mutex::new(()),
            drive: Mutex::new(()),
            ready: ArrayQueue::new(entries as usize * 2 + 64),
            parked: Mutex::new(()),
            wakeup: Condvar::new(),
            inflight: Mutex::new(HashMap::new()),
            workers: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        }))
    }

    /// Threads currently inside `work()`.
    pub fn worker_count(&self) -> usize {
        self.workers.load(Ordering::SeqCst)
    }

    /// Operations submitted but not yet dispatched.
    pub fn inflight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }

    // ── Submission ───────────────────────────────────────────────────

    /// Submit one SQE on behalf of `record`.
    ///
    /// The entry's `user_data` is stamped with the record's token, and the
    /// record plus `keepalive` are pinned in the in-flight table until the
    /// completion is dispatched.
    pub(crate) fn submit(
        &self,
        record: &Arc<CompletionRecord>,
        entry: squeue::Entry,
        keepalive: Option<Arc<dyn Any + Send + Sync>>,
    ) -> Result<()> {
        if self.closing.load(Ordering::Acquire) {
            return Err(Error::NotSupported);
        }
        record.begin_submit()?;
        record.attach(self.this.clone());
        let token = record.token();
        let entry = entry.user_data(token);
        self.inflight.lock().unwrap().insert(
            token,
            Inflight {
                record: record.clone(),
                keepalive,
            },
        );
        if let Err(err) = self.push_and_flush(entry) {
            self.inflight.lock().unwrap().remove(&token);
            record.abort_submit();
            return Err(err);
        }
        Ok(())
    }

    /// Ask the kernel to cancel the operation carrying `token`.
    pub(crate) fn cancel_token(&self, token: u64) {
        let entry = opcode::AsyncCancel::new(token)
            .build()
            .user_data(SENTINEL_TOKEN);
        let _ = self.push_and_flush(entry);
    }

    /// Cancel everything still in flight.
    pub(crate) fn cancel_all(&self) {
        let tokens: Vec<u64> = self.inflight.lock().unwrap().keys().copied().collect();
        for token in tokens {
            self.cancel_token(token);
        }
    }

    fn push_and_flush(&self, entry: squeue::Entry) -> Result<()> {
        {
            let _guard = self.sq_lock.unwrap_or_poison();
            // Safety: the sq lock serializes every access to the shared
            // submission queue; the queue syncs back to the ring on drop.
            unsafe {
                let mut sq = self.ring.submission_shared();
                if sq.push(&entry).is_err() {
                    // Ring full: flush what is queued, then retry once.
                    drop(sq);
                    self.ring.submitter().submit().map_err(|_| Error::Failure)?;
                    let mut sq = self.ring.submission_shared();
                    sq.push(&entry).map_err(|_| Error::Failure)?;
                }
            }
        }
        self.ring.submitter().submit().map_err(|_| Error::Failure)?;
        Ok(())
    }

    // ── Work loop ────────────────────────────────────────────────────

    /// Block up to `time_limit` for one completion and run its callback.
    ///
    /// Returns `Ok(())` after dispatching one completion (or observing a
    /// shutdown sentinel) and `Err(TimedOut)` when the budget elapses
    /// first. Budgets above `INFINITE_TIME_LIMIT_MS` wait forever.
    pub fn work(&self, time_limit: Duration) -> Result<()> {
        let deadline = if time_limit.as_millis() > INFINITE_TIME_LIMIT_MS {
            None
        } else {
            Some(Instant::now() + time_limit)
        };

        self.workers.fetch_add(1, Ordering::SeqCst);
        let completion = self.wait_one(deadline);
        self.workers.fetch_sub(1, Ordering::SeqCst);

        match completion {
            Some(completion) => {
                self.dispatch(completion);
                Ok(())
            }
            None if self.closing.load(Ordering::Acquire) => Ok(()),
            None => Err(Error::TimedOut),
        }
    }

    fn wait_one(&self, deadline: Option<Instant>) -> Option<Completion> {
        loop {
            if let Some(completion) = self.ready.pop() {
                return Some(completion);
            }
            if self.closing.load(Ordering::Acquire) {
                return None;
            }
            let remaining = match deadline {
                None => None,
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    Some(deadline - now)
                }
            };

            match self.try_lead() {
                Some(_leader) => {
                    self.kernel_wait(remaining);
                    self.reap();
                }
                None => {
                    // Follower: park until the leader publishes completions.
                    let guard = self.parked.unwrap_or_poison();
                    if self.ready.is_empty() && !self.closing.load(Ordering::Acquire) {
                        let park = remaining.unwrap_or(FOLLOWER_PARK);
                        let _ = self
                            .wakeup
                            .wait_timeout(guard, park)
                            .unwrap_or_else(|poison| poison.into_inner());
                    }
                }
            }
        }
    }

    /// Try to become the thread that drives the ring. A poisoned drive
    /// lock (a worker panicked mid-reap) is taken over, not inherited as
    /// a permanent stall.
    fn try_lead(&self) -> Option<std::sync::MutexGuard<'_, ()>> {
        match self.drive.try_lock() {
            Ok(guard) => Some(guard),
            Err(std::sync::TryLockError::Poisoned(poison)) => Some(poison.into_inner()),
            Err(std::sync::TryLockError::WouldBlock) => None,
        }
    }

    /// Enter the kernel waiting for at least one CQE, bounded by `timeout`.
    fn kernel_wait(&self, timeout: Option<Duration>) {
        let submitter = self.ring.submitter();
        let outcome = match timeout {
            Some(timeout) => {
                let ts = types::Timespec::new()
                    .sec(timeout.as_secs())
                    .nsec(timeout.subsec_nanos());
                let args = types::SubmitArgs::new().timespec(&ts);
                submitter.submit_with_args(1, &args)
            }
            None => submitter.submit_and_wait(1),
        };
        if let Err(err) = outcome {
            match err.raw_os_error() {
                // ETIME: the bounded wait elapsed. EINTR: signal. EBUSY:
                // completion queue needs draining before more submits.
                Some(libc::ETIME) | Some(libc::EINTR) | Some(libc::EBUSY) => {}
                _ => tracing::warn!(error = %err, "io_uring wait failed"),
            }
        }
    }

    /// Drain the completion queue into the handoff queue and wake parked
    /// followers.
    fn reap(&self) {
        let mut batch: Vec<Completion> = Vec::new();
        {
            // Safety: the drive lock (held by our caller) serializes every
            // access to the shared completion queue.
            let cq = unsafe { self.ring.completion_shared() };
            for cqe in cq {
                batch.push(Completion {
                    token: cqe.user_data(),
                    result: cqe.result(),
                });
            }
        }
        if batch.is_empty() {
            return;
        }
        let _guard = self.parked.unwrap_or_poison();
        for completion in batch {
            let mut retries = 0;
            while self.ready.push(completion).is_err() {
                // Handoff queue full: workers are slow. Spin briefly; the
                // queue is sized for the ring, so this resolves quickly.
                retries += 1;
                if retries > 10_000 {
                    tracing::warn!(token = completion.token, "dropping completion: handoff queue full");
                    break;
                }
                std::hint::spin_loop();
            }
        }
        self.wakeup.notify_all();
    }

    /// Resolve one completion back to its record and run its callback.
    fn dispatch(&self, completion: Completion) {
        if completion.token == SENTINEL_TOKEN {
            return;
        }
        let entry = self.inflight.lock().unwrap().remove(&completion.token);
        let Some(entry) = entry else {
            // A record can only be missing if it was force-removed during
            // teardown; nothing left to do.
            return;
        };
        entry.record.complete(completion.result);
        let bytes = completion.result.max(0) as usize;
        entry.record.invoke(bytes);
    }

    // ── Shutdown ─────────────────────────────────────────────────────

    /// Wake every thread currently inside `work()` without marking the
    /// dispatcher as closing: one sentinel per waiter, plus a nop to kick
    /// the kernel waiter.
    pub(crate) fn wake_workers(&self) {
        let waiters = self.workers.load(Ordering::SeqCst);
        {
            let _guard = self.parked.unwrap_or_poison();
            for _ in 0..waiters {
                let _ = self.ready.push(Completion {
                    token: SENTINEL_TOKEN,
                    result: 0,
                });
            }
            self.wakeup.notify_all();
        }
        let nop = opcode::Nop::new().build().user_data(SENTINEL_TOKEN);
        let _ = self.push_and_flush(nop);
    }

    /// Begin shutdown: refuse new submissions and wake all workers.
    pub(crate) fn shutdown(&self) {
        self.closing.store(true, Ordering::Release);
        self.wake_workers();
    }

    /// Drive the ring until nothing is in flight, dispatching callbacks on
    /// the calling thread. Used by `close()` so in-flight callbacks unwind
    /// before teardown.
    pub(crate) fn drain(&self, limit: Duration) -> Result<()> {
        let deadline = Instant::now() + limit;
        loop {
            while let Some(completion) = self.ready.pop() {
                self.dispatch(completion);
            }
            if self.inflight.lock().unwrap().is_empty() {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(Error::TimedOut);
            }
            match self.try_lead() {
                Some(_leader) => {
                    self.kernel_wait(Some(Duration::from_millis(10)));
                    self.reap();
                }
                None => std::thread::yield_now(),
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let pending = std::mem::take(&mut *self.inflight.lock().unwrap());
        if !pending.is_empty() {
            // The kernel may still write into buffers owned by these
            // entries after the ring fd closes; leaking them is the only
            // sound option left.
            tracing::warn!(
                count = pending.len(),
                "dispatcher dropped with operations in flight; leaking their records"
            );
            std::mem::forget(pending);
        }
    }
}

/// `Mutex::lock` with poison-tolerance: a worker that panicked inside a
/// user callback must not wedge every other worker.
trait UnwrapOrPoison<'a, T> {
    fn unwrap_or_poison(&'a self) -> std::sync::MutexGuard<'a, T>;
}

impl<'a, T> UnwrapOrPoison<'a, T> for Mutex<T> {
    fn unwrap_or_poison(&'a self) -> std::sync::MutexGuard<'a, T> {
        self.lock().unwrap_or_else(|poison| poison.into_inner())
    }
}
