//! Server-side socket.
//!
//! Pooled by the server and armed with an asynchronous accept on the
//! shared listener. Differences from a client socket:
//!
//! 1. It shares the server's dispatcher, so `work()` is a no-op here.
//! 2. `set_path` is not supported; the path belongs to the server.
//! 3. `open()` arms the accept wait and returns immediately; the server
//!    mediates admission when the wait completes.
//! 4. After its connection ends, the server may rearm it for a new peer.

use std::cell::UnsafeCell;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use io_uring::{opcode, types};

use fipc_core::{
    CallbackData, Error, Event, IoCallback, Result, Socket, SocketEventArgs, SocketEvents,
};

use crate::dispatcher::Dispatcher;
use crate::record::CompletionRecord;
use crate::server::UdsServer;
use crate::socket::SocketCore;
use crate::sys;

/// Pinned storage for the kernel's accept address writeback.
struct AcceptSlot {
    addr: UnsafeCell<libc::sockaddr_un>,
    len: UnsafeCell<libc::socklen_t>,
}

// Safety: the kernel is the only writer while an accept is in flight, and
// the accept state machine guarantees at most one in-flight accept per
// slot; the slot is never read until the completion has been dispatched.
unsafe impl Send for AcceptSlot {}
unsafe impl Sync for AcceptSlot {}

impl AcceptSlot {
    fn new() -> Self {
        Self {
            // Safety: sockaddr_un is plain old data.
            addr: UnsafeCell::new(unsafe { std::mem::zeroed() }),
            len: UnsafeCell::new(0),
        }
    }
}

pub struct ServerSocket {
    core: Arc<SocketCore>,
    server: Weak<UdsServer>,
    this: Mutex<Weak<ServerSocket>>,
    listener_fd: RawFd,
    /// The accept in flight, if any; replaced on every rearm.
    rec_accept: Mutex<Arc<CompletionRecord>>,
    accept_slot: Box<AcceptSlot>,
    accepting: AtomicBool,
}

impl ServerSocket {
    pub(crate) fn new(
        server: Weak<UdsServer>,
        listener_fd: RawFd,
        dispatcher: Arc<Dispatcher>,
    ) -> Arc<ServerSocket> {
        let core = SocketCore::new(dispatcher);
        let socket = Arc::new(ServerSocket {
            core: core.clone(),
            server,
            this: Mutex::new(Weak::new()),
            listener_fd,
            rec_accept: Mutex::new(CompletionRecord::new()),
            accept_slot: Box::new(AcceptSlot::new()),
            accepting: AtomicBool::new(false),
        });
        *socket.this.lock().unwrap() = Arc::downgrade(&socket);
        let this: Arc<dyn Socket> = socket.clone();
        core.bind_self(Arc::downgrade(&this));
        socket
    }

    pub(crate) fn internal_closed(&self) -> &Event<SocketEventArgs> {
        &self.core.internal_closed
    }

    /// Arm the asynchronous wait-for-client. Valid only while closed.
    pub(crate) fn arm_accept(&self) -> Result<()> {
        if self.core.is_open() || self.accepting.load(Ordering::Acquire) {
            return Err(Error::NotSupported);
        }
        let this = self
            .this
            .lock()
            .unwrap()
            .upgrade()
            .ok_or(Error::Failure)?;

        let rec = CompletionRecord::new();
        rec.set_handle(self.listener_fd)?;
        let weak = Arc::downgrade(&this);
        rec.set_callback(Arc::new(move |rec, _bytes| {
            if let Some(socket) = weak.upgrade() {
                socket.on_accept_complete(rec);
            }
        }))?;

        // Safety: at most one accept is in flight, so the slot is ours.
        unsafe {
            *self.accept_slot.len.get() =
                std::mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
        }
        let entry = opcode::Accept::new(
            types::Fd(self.listener_fd),
            self.accept_slot.addr.get() as *mut libc::sockaddr,
            self.accept_slot.len.get(),
        )
        .flags(libc::SOCK_CLOEXEC)
        .build();

        self.core.mark_opening();
        self.accepting.store(true, Ordering::Release);
        *self.rec_accept.lock().unwrap() = rec.clone();

        let dispatcher = self.core.dispatcher().clone();
        if let Err(err) = dispatcher.submit(
            &rec,
            entry,
            Some(this as Arc<dyn std::any::Any + Send + Sync>),
        ) {
            self.accepting.store(false, Ordering::Release);
            self.core.close_internal(Error::SocketClosed, false);
            return Err(err);
        }
        Ok(())
    }

    /// Put a finished socket back into the awaiting-connection state.
    pub(crate) fn rearm(&self) -> Result<()> {
        self.arm_accept()
    }

    /// Close without firing events; used for rejection and server teardown.
    pub(crate) fn close_quiet(&self) {
        if self.accepting.swap(false, Ordering::AcqRel) {
            self.rec_accept.lock().unwrap().cancel();
        }
        self.core.close_internal(Error::SocketClosed, false);
    }

    fn on_accept_complete(&self, rec: &CompletionRecord) {
        {
            let current = self.rec_accept.lock().unwrap();
            if !std::ptr::eq(Arc::as_ptr(&current), rec) {
                return;
            }
        }
        let Some(this) = self.this.lock().unwrap().upgrade() else {
            return;
        };
        let raw = rec.result();
        if !self.accepting.swap(false, Ordering::AcqRel) {
            // Abandoned by a concurrent close; don't leak a won connection.
            if raw >= 0 {
                unsafe {
                    libc::close(raw);
                }
            }
            return;
        }
        if raw < 0 {
            if raw == -libc::ECANCELED {
                return;
            }
            tracing::warn!(errno = -raw, "accept failed");
            if let Some(server) = self.server.upgrade() {
                server.on_socket_opened(Err(sys::error_from_errno(-raw)), &this);
            }
            return;
        }

        self.core.attach(raw as RawFd);
        tracing::debug!(fd = raw, "peer connected");

        // Admission runs first; the public opened event observes the
        // post-admission state of the socket.
        if let Some(server) = self.server.upgrade() {
            server.on_socket_opened(Ok(()), &this);
        }
        if let Some(this) = self.core.this() {
            let mut args = SocketEventArgs {
                status: Ok(()),
                socket: this,
            };
            self.core.events.opened.fire(&mut args);
        }
        // Armed after admission so a hangup racing the handshake cannot
        // close the socket out from under the listener's first read.
        self.core.arm_watch();
    }
}

impl Socket for ServerSocket {
    fn set_path(&self, _name: &str) -> Result<()> {
        Err(Error::NotSupported)
    }

    fn open(&self) -> Result<()> {
        self.arm_accept()
    }

    fn close(&self) -> Result<()> {
        if self.accepting.swap(false, Ordering::AcqRel) {
            self.rec_accept.lock().unwrap().cancel();
            self.core.close_internal(Error::SocketClosed, false);
            return Ok(());
        }
        // Events fire so the owning server can recycle the pool slot.
        self.core.close_internal(Error::SocketClosed, true);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn work(&self, _time_limit: Duration) -> Result<()> {
        // Server-side sockets share the server's dispatcher.
        Ok(())
    }

    fn read(&self, callback: IoCallback, data: CallbackData) -> Result<()> {
        self.core.queue_read(callback, data)
    }

    fn write(&self, payload: &[u8], callback: IoCallback, data: CallbackData) -> Result<()> {
        self.core.queue_write(payload, callback, data)
    }

    fn events(&self) -> &SocketEvents {
        &self.core.events
    }
}
