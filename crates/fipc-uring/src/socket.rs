//! Shared framed-socket core.
//!
//! Both socket roles (client and server-side) own one of these: the
//! per-direction request FIFOs, the read/write state machines that frame
//! length-prefixed packets over the stream, the peer-hangup watch, and the
//! close/drain logic.
//!
//! # Pipelines
//!
//! Read side:
//!
//! ```text
//! Idle ──read()──► Header(4B) ──parse L──► Body(L) ──► Dispatch ──┐
//!  ▲                   │ L==0 ───────────────────────►    │       │
//!  └───────────────────┴── queue empty ◄───────────── callback ◄──┘
//! ```
//!
//! Write side is single-phase: frame, send, pop, dispatch.
//!
//! The head request owns the socket's single in-flight operation per
//! direction. A completed request is popped and the pipeline parked in
//! `Dispatch` *before* its callback runs, and the next operation is armed
//! only *after* the callback returns. Callbacks therefore fire in
//! submission order even with many `work()` threads, and they may freely
//! re-enter `read`/`write` on the same socket.
//!
//! `SOCK_STREAM` may complete a body read or a frame write short; the
//! pipeline re-arms for the remainder with a fill offset. A short *header*
//! is a protocol error (`BadHeader`): the 4-byte prefix is the stream's
//! synchronization point.

use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};

use io_uring::{opcode, types};

use fipc_core::{
    CallbackData, Error, Event, IoCallback, Result, Socket, SocketEventArgs, SocketEvents,
    PacketSize, HEADER_SIZE, MAXIMUM_PACKET_SIZE,
};

use crate::dispatcher::Dispatcher;
use crate::record::CompletionRecord;

pub(crate) const STATE_CLOSED: u8 = 0;
pub(crate) const STATE_OPENING: u8 = 1;
pub(crate) const STATE_OPEN: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadPhase {
    /// No request in flight.
    Idle,
    /// Waiting for the 4-byte length prefix.
    Header,
    /// Waiting for the declared payload.
    Body,
    /// A completed request's callback is running; arming is deferred.
    Dispatch,
}

struct ReadRequest {
    callback: Option<IoCallback>,
    data: CallbackData,
}

struct ReadPipeline {
    queue: VecDeque<ReadRequest>,
    /// One growable buffer, reused for headers and resized per body.
    buffer: Vec<u8>,
    /// Bytes of `buffer` already filled by short completions.
    filled: usize,
    phase: ReadPhase,
}

struct WriteRequest {
    /// Complete frame: length prefix followed by the payload.
    packet: Vec<u8>,
    callback: Option<IoCallback>,
    data: CallbackData,
}

struct WritePipeline {
    queue: VecDeque<WriteRequest>,
    /// Bytes of the head packet already on the wire.
    sent: usize,
    /// Covers both the armed send and the callback dispatch window.
    busy: bool,
}

/// Per-connection completion records. Replaced wholesale on every
/// `attach`, so a late completion from a previous connection can never be
/// mistaken for one of the current connection's operations.
struct IoRecords {
    read: Arc<CompletionRecord>,
    write: Arc<CompletionRecord>,
    watch: Arc<CompletionRecord>,
}

pub(crate) struct SocketCore {
    /// Self-reference for dispatch closures and submission keep-alives.
    this_core: Weak<SocketCore>,
    fd: AtomicI32,
    state: AtomicU8,
    dispatcher: Arc<Dispatcher>,
    /// The owning socket, as handed to user callbacks.
    this: Mutex<Option<Weak<dyn Socket>>>,
    io: Mutex<IoRecords>,
    read: Mutex<ReadPipeline>,
    write: Mutex<WritePipeline>,
    pub(crate) events: SocketEvents,
    /// Owner bookkeeping (pool recycling); fires after the public event.
    pub(crate) internal_closed: Event<SocketEventArgs>,
    closed_emitted: AtomicBool,
    /// Peer hangup observed while requests were still draining; the close
    /// happens once both pipelines park.
    hangup: AtomicBool,
}

impl SocketCore {
    pub(crate) fn new(dispatcher: Arc<Dispatcher>) -> Arc<SocketCore> {
        Arc::new_cyclic(|this_core| SocketCore {
            this_core: this_core.clone(),
            fd: AtomicI32::new(-1),
            state: AtomicU8::new(STATE_CLOSED),
            dispatcher,
            this: Mutex::new(None),
            io: Mutex::new(IoRecords {
                read: CompletionRecord::new(),
                write: CompletionRecord::new(),
                watch: CompletionRecord::new(),
            }),
            read: Mutex::new(ReadPipeline {
                queue: VecDeque::new(),
                buffer: Vec::with_capacity(64 * 1024),
                filled: 0,
                phase: ReadPhase::Idle,
            }),
            write: Mutex::new(WritePipeline {
                queue: VecDeque::new(),
                sent: 0,
                busy: false,
            }),
            events: SocketEvents::new(),
            internal_closed: Event::new(),
            closed_emitted: AtomicBool::new(false),
            hangup: AtomicBool::new(false),
        })
    }

    pub(crate) fn bind_self(&self, this: Weak<dyn Socket>) {
        *self.this.lock().unwrap() = Some(this);
    }

    pub(crate) fn this(&self) -> Option<Arc<dyn Socket>> {
        self.this.lock().unwrap().as_ref()?.upgrade()
    }

    pub(crate) fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.fd.load(Ordering::Acquire)
    }

    pub(crate) fn is_open(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_OPEN
    }

    pub(crate) fn mark_opening(&self) {
        self.state.store(STATE_OPENING, Ordering::Release);
    }

    /// Take ownership of a connected fd: swap in fresh completion records,
    /// reset both pipelines, and arm the hangup watch.
    pub(crate) fn attach(&self, fd: RawFd) {
        let read_rec = CompletionRecord::new();
        let write_rec = CompletionRecord::new();
        let watch_rec = CompletionRecord::new();
        let _ = read_rec.set_handle(fd);
        let _ = write_rec.set_handle(fd);
        let _ = watch_rec.set_handle(fd);

        let weak = self.this_core.clone();
        let _ = read_rec.set_callback(Arc::new({
            let weak = weak.clone();
            move |rec, bytes| {
                if let Some(core) = weak.upgrade() {
                    core.on_read_complete(rec, bytes);
                }
            }
        }));
        let _ = write_rec.set_callback(Arc::new({
            let weak = weak.clone();
            move |rec, bytes| {
                if let Some(core) = weak.upgrade() {
                    core.on_write_complete(rec, bytes);
                }
            }
        }));
        let _ = watch_rec.set_callback(Arc::new(move |rec, _bytes| {
            if let Some(core) = weak.upgrade() {
                core.on_watch_complete(rec);
            }
        }));

        {
            let mut io = self.io.lock().unwrap();
            io.read = read_rec;
            io.write = write_rec;
            io.watch = watch_rec;
        }
        {
            let mut g = self.read.lock().unwrap();
            g.queue.clear();
            g.filled = 0;
            g.phase = ReadPhase::Idle;
        }
        {
            let mut g = self.write.lock().unwrap();
            g.queue.clear();
            g.sent = 0;
            g.busy = false;
        }

        self.fd.store(fd, Ordering::Release);
        self.closed_emitted.store(false, Ordering::Release);
        self.hangup.store(false, Ordering::Release);
        self.state.store(STATE_OPEN, Ordering::Release);
    }

    fn rec_read(&self) -> Arc<CompletionRecord> {
        self.io.lock().unwrap().read.clone()
    }

    fn rec_write(&self) -> Arc<CompletionRecord> {
        self.io.lock().unwrap().write.clone()
    }

    fn is_current(&self, rec: &CompletionRecord) -> bool {
        let io = self.io.lock().unwrap();
        std::ptr::eq(Arc::as_ptr(&io.read), rec)
            || std::ptr::eq(Arc::as_ptr(&io.write), rec)
            || std::ptr::eq(Arc::as_ptr(&io.watch), rec)
    }

    /// Strong reference pinned in the dispatcher's in-flight table for the
    /// duration of a submitted operation, keeping the I/O buffers alive.
    fn keepalive(&self) -> Option<Arc<dyn std::any::Any + Send + Sync>> {
        self.this_core
            .upgrade()
            .map(|core| core as Arc<dyn std::any::Any + Send + Sync>)
    }

    // ── Read pipeline ────────────────────────────────────────────────

    pub(crate) fn queue_read(&self, callback: IoCallback, data: CallbackData) -> Result<()> {
        if !self.is_open() {
            return Err(Error::NotSupported);
        }
        let mut g = self.read.lock().unwrap();
        g.queue.push_back(ReadRequest {
            callback: Some(callback),
            data,
        });
        // Only the first request in an idle pipeline issues I/O; everything
        // else waits its turn in the FIFO.
        if g.queue.len() == 1 && g.phase == ReadPhase::Idle {
            if let Err(err) = self.arm_header_read(&mut g) {
                g.queue.pop_back();
                g.phase = ReadPhase::Idle;
                g.filled = 0;
                return Err(err);
            }
        }
        Ok(())
    }

    fn arm_header_read(&self, g: &mut ReadPipeline) -> Result<()> {
        g.buffer.clear();
        g.buffer.resize(HEADER_SIZE, 0);
        g.filled = 0;
        g.phase = ReadPhase::Header;
        let rec = self.rec_read();
        rec.reset()?;
        let entry = opcode::Recv::new(
            types::Fd(self.fd()),
            g.buffer.as_mut_ptr(),
            HEADER_SIZE as u32,
        )
        .build();
        self.dispatcher
            .submit(&rec, entry, self.keepalive())
    }

    /// Issue (or continue) the body read for the declared packet size.
    fn arm_body_read(&self, g: &mut ReadPipeline) -> Result<()> {
        g.phase = ReadPhase::Body;
        let remaining = g.buffer.len() - g.filled;
        let rec = self.rec_read();
        rec.reset()?;
        // Safety: the buffer lives in the pipeline behind this core's Arc,
        // which the dispatcher pins until the completion is dispatched; it
        // is not resized while the read is in flight.
        let ptr = unsafe { g.buffer.as_mut_ptr().add(g.filled) };
        let entry = opcode::Recv::new(types::Fd(self.fd()), ptr, remaining as u32).build();
        self.dispatcher
            .submit(&rec, entry, self.keepalive())
    }

    fn on_read_complete(&self, rec: &CompletionRecord, bytes: usize) {
        if !self.is_current(rec) {
            return;
        }
        if let Some(err) = rec.failure() {
            self.fail_head_read_and_close(err);
            return;
        }
        if bytes == 0 {
            // Orderly peer shutdown.
            self.handle_remote_close();
            return;
        }

        let mut g = self.read.lock().unwrap();
        match g.phase {
            ReadPhase::Header => {
                g.filled += bytes;
                if g.filled != HEADER_SIZE {
                    // The remote sent a truncated prefix; the stream can no
                    // longer be trusted to be aligned on packet boundaries.
                    let req = g.queue.pop_front();
                    g.phase = ReadPhase::Dispatch;
                    drop(g);
                    self.fire_read_callback(req, Err(Error::BadHeader));
                    self.close_after_protocol_error();
                    return;
                }
                let declared =
                    PacketSize::from_le_bytes(g.buffer[..HEADER_SIZE].try_into().unwrap()) as usize;
                if declared > MAXIMUM_PACKET_SIZE {
                    let req = g.queue.pop_front();
                    g.phase = ReadPhase::Dispatch;
                    drop(g);
                    self.fire_read_callback(req, Err(Error::BadSize));
                    self.close_after_protocol_error();
                    return;
                }
                if declared == 0 {
                    let req = g.queue.pop_front();
                    g.phase = ReadPhase::Dispatch;
                    drop(g);
                    self.fire_read_callback(req, Ok(&[]));
                    self.resume_read();
                    return;
                }
                g.buffer.clear();
                g.buffer.resize(declared, 0);
                g.filled = 0;
                if self.arm_body_read(&mut g).is_err() {
                    drop(g);
                    self.handle_remote_close();
                }
            }
            ReadPhase::Body => {
                g.filled += bytes;
                if g.filled < g.buffer.len() {
                    // Stream delivered part of the body; collect the rest.
                    if self.arm_body_read(&mut g).is_err() {
                        drop(g);
                        self.handle_remote_close();
                    }
                    return;
                }
                let payload = std::mem::take(&mut g.buffer);
                let req = g.queue.pop_front();
                g.filled = 0;
                g.phase = ReadPhase::Dispatch;
                drop(g);
                self.fire_read_callback(req, Ok(&payload));
                self.resume_read();
            }
            ReadPhase::Idle | ReadPhase::Dispatch => {
                // Stale completion after a close raced us; nothing to do.
            }
        }
    }

    /// After a read callback returns: arm the next queued request, or park.
    fn resume_read(&self) {
        if !self.is_open() {
            return;
        }
        let mut g = self.read.lock().unwrap();
        if g.phase != ReadPhase::Dispatch {
            return;
        }
        if g.queue.is_empty() {
            g.phase = ReadPhase::Idle;
            drop(g);
            self.maybe_close_after_hangup();
            return;
        }
        if self.arm_header_read(&mut g).is_err() {
            drop(g);
            self.handle_remote_close();
        }
    }

    fn fire_read_callback(&self, req: Option<ReadRequest>, result: Result<&[u8]>) {
        let Some(mut req) = req else { return };
        let Some(callback) = req.callback.take() else {
            return;
        };
        if let Some(this) = self.this() {
            callback(&this, result, req.data.take());
        }
    }

    /// The in-flight read ended in an error: fail the head request, then
    /// tear the connection down.
    fn fail_head_read_and_close(&self, err: Error) {
        let req = {
            let mut g = self.read.lock().unwrap();
            g.phase = ReadPhase::Dispatch;
            g.queue.pop_front()
        };
        self.fire_read_callback(req, Err(err));
        self.close_internal(Error::SocketClosed, true);
    }

    // ── Write pipeline ───────────────────────────────────────────────

    pub(crate) fn queue_write(
        &self,
        payload: &[u8],
        callback: IoCallback,
        data: CallbackData,
    ) -> Result<()> {
        if payload.len() > MAXIMUM_PACKET_SIZE {
            return Err(Error::BadSize);
        }
        if !self.is_open() {
            return Err(Error::NotSupported);
        }
        let mut packet = Vec::with_capacity(HEADER_SIZE + payload.len());
        packet.extend_from_slice(&(payload.len() as PacketSize).to_le_bytes());
        packet.extend_from_slice(payload);

        let mut g = self.write.lock().unwrap();
        g.queue.push_back(WriteRequest {
            packet,
            callback: Some(callback),
            data,
        });
        if !g.busy {
            if let Err(err) = self.arm_write(&mut g) {
                g.queue.pop_back();
                g.busy = false;
                return Err(err);
            }
        }
        Ok(())
    }

    fn arm_write(&self, g: &mut WritePipeline) -> Result<()> {
        let front = g.queue.front().ok_or(Error::Failure)?;
        let remaining = front.packet.len() - g.sent;
        let rec = self.rec_write();
        rec.reset()?;
        // Safety: the packet lives in the head request behind this core's
        // Arc, pinned by the dispatcher until completion; it is only popped
        // after the send finishes.
        let ptr = unsafe { front.packet.as_ptr().add(g.sent) };
        let entry = opcode::Send::new(types::Fd(self.fd()), ptr, remaining as u32)
            .flags(libc::MSG_NOSIGNAL)
            .build();
        g.busy = true;
        self.dispatcher
            .submit(&rec, entry, self.keepalive())
    }

    fn on_write_complete(&self, rec: &CompletionRecord, bytes: usize) {
        if !self.is_current(rec) {
            return;
        }
        if let Some(err) = rec.failure() {
            let req = {
                let mut g = self.write.lock().unwrap();
                g.sent = 0;
                g.queue.pop_front()
            };
            self.fire_write_callback(req, Err(err));
            self.close_internal(Error::SocketClosed, true);
            return;
        }

        let mut g = self.write.lock().unwrap();
        g.sent += bytes;
        let head_len = match g.queue.front() {
            Some(front) => front.packet.len(),
            None => return, // close raced the completion
        };
        if g.sent < head_len {
            if self.arm_write(&mut g).is_err() {
                drop(g);
                self.handle_remote_close();
            }
            return;
        }
        let mut req = g.queue.pop_front().unwrap();
        g.sent = 0;
        // `busy` stays set: the callback below owns the dispatch window.
        drop(g);

        if let (Some(callback), Some(this)) = (req.callback.take(), self.this()) {
            callback(&this, Ok(&req.packet[HEADER_SIZE..]), req.data.take());
        }
        self.resume_write();
    }

    fn resume_write(&self) {
        if !self.is_open() {
            return;
        }
        let mut g = self.write.lock().unwrap();
        if g.queue.is_empty() {
            g.busy = false;
            drop(g);
            self.maybe_close_after_hangup();
            return;
        }
        if self.arm_write(&mut g).is_err() {
            drop(g);
            self.handle_remote_close();
        }
    }

    fn fire_write_callback(&self, req: Option<WriteRequest>, result: Result<&[u8]>) {
        let Some(mut req) = req else { return };
        let Some(callback) = req.callback.take() else {
            return;
        };
        if let Some(this) = self.this() {
            callback(&this, result, req.data.take());
        }
    }

    // ── Hangup watch ─────────────────────────────────────────────────

    /// Arm a poll for peer hangup so disconnects surface even while no
    /// read is pending (a rejected client would otherwise never learn).
    pub(crate) fn arm_watch(&self) {
        let fd = self.fd();
        if fd < 0 {
            return;
        }
        let watch = self.io.lock().unwrap().watch.clone();
        let mask = (libc::POLLRDHUP | libc::POLLHUP | libc::POLLERR) as u32;
        let entry = opcode::PollAdd::new(types::Fd(fd), mask).build();
        let _ = self
            .dispatcher
            .submit(&watch, entry, self.keepalive());
    }

    fn on_watch_complete(&self, rec: &CompletionRecord) {
        if !self.is_current(rec) {
            return;
        }
        // Cancellation means a local close already ran; a successful poll
        // completion here only ever reports hangup or error bits.
        if rec.failure().is_some() {
            return;
        }
        // The peer may have written before hanging up. Let the pipelines
        // drain what the kernel still buffers; the read path observes EOF
        // (or this flag) once the data runs out.
        self.hangup.store(true, Ordering::Release);
        self.maybe_close_after_hangup();
    }

    /// Complete a deferred hangup once both pipelines are parked.
    fn maybe_close_after_hangup(&self) {
        if !self.hangup.load(Ordering::Acquire) {
            return;
        }
        let reads_active = {
            let g = self.read.lock().unwrap();
            g.phase != ReadPhase::Idle || !g.queue.is_empty()
        };
        let writes_active = {
            let g = self.write.lock().unwrap();
            g.busy || !g.queue.is_empty()
        };
        if !reads_active && !writes_active {
            self.handle_remote_close();
        }
    }

    // ── Close ────────────────────────────────────────────────────────

    fn handle_remote_close(&self) {
        self.close_internal(Error::SocketClosed, true);
    }

    fn close_after_protocol_error(&self) {
        self.close_internal(Error::SocketClosed, true);
    }

    /// Transition to Closed exactly once: cancel outstanding I/O, fail
    /// every queued request with `err`, disconnect the transport, and
    /// (optionally) emit the `closed` events.
    ///
    /// Returns whether this call performed the transition.
    pub(crate) fn close_internal(&self, err: Error, emit: bool) -> bool {
        let prev = self.state.swap(STATE_CLOSED, Ordering::AcqRel);
        if prev == STATE_CLOSED {
            return false;
        }

        // Stop routing completions into the (now dead) pipelines, then ask
        // the kernel to abandon whatever is still in flight.
        {
            let io = self.io.lock().unwrap();
            io.read.clear_callback();
            io.write.clear_callback();
            io.watch.clear_callback();
            io.read.cancel();
            io.write.cancel();
            io.watch.cancel();
        }

        self.fail_all_pending(err);

        let fd = self.fd.swap(-1, Ordering::AcqRel);
        if fd >= 0 {
            unsafe {
                libc::shutdown(fd, libc::SHUT_RDWR);
                libc::close(fd);
            }
        }

        if emit {
            self.emit_closed(err);
        }
        true
    }

    fn fail_all_pending(&self, err: Error) {
        let reads: Vec<ReadRequest> = {
            let mut g = self.read.lock().unwrap();
            g.phase = ReadPhase::Idle;
            g.filled = 0;
            g.queue.drain(..).collect()
        };
        let writes: Vec<WriteRequest> = {
            let mut g = self.write.lock().unwrap();
            g.busy = false;
            g.sent = 0;
            g.queue.drain(..).collect()
        };
        for req in reads {
            self.fire_read_callback(Some(req), Err(err));
        }
        for req in writes {
            self.fire_write_callback(Some(req), Err(err));
        }
    }

    fn emit_closed(&self, err: Error) {
        if self
            .closed_emitted
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(this) = self.this() else { return };
        tracing::trace!("socket closed");
        let mut args = SocketEventArgs {
            status: Err(err),
            socket: this.clone(),
        };
        self.events.closed.fire(&mut args);
        let mut args = SocketEventArgs {
            status: Err(err),
            socket: this,
        };
        self.internal_closed.fire(&mut args);
    }
}
