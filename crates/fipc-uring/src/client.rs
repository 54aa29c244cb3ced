//! Client-side socket.
//!
//! A client socket owns a private dispatcher: the application services it
//! by calling `work()` on the socket itself. `open()` performs the
//! transport connect synchronously (local connects either succeed at once
//! or fail) and fires the `opened` event before returning.

use std::os::fd::IntoRawFd;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use fipc_core::{
    endpoint_path, CallbackData, Error, IoCallback, Result, Socket, SocketEventArgs, SocketEvents,
};

use crate::dispatcher::{Dispatcher, CLIENT_ENTRIES};
use crate::socket::SocketCore;
use crate::sys;

pub struct ClientSocket {
    core: Arc<SocketCore>,
    path: Mutex<Option<PathBuf>>,
}

impl ClientSocket {
    /// Create a disconnected client socket with its own dispatcher.
    pub fn create() -> Result<Arc<ClientSocket>> {
        let dispatcher = Dispatcher::new(CLIENT_ENTRIES)?;
        let core = SocketCore::new(dispatcher);
        let socket = Arc::new(ClientSocket {
            core: core.clone(),
            path: Mutex::new(None),
        });
        let this: Arc<dyn Socket> = socket.clone();
        core.bind_self(Arc::downgrade(&this));
        Ok(socket)
    }
}

impl Socket for ClientSocket {
    fn set_path(&self, name: &str) -> Result<()> {
        if self.core.is_open() {
            return Err(Error::NotSupported);
        }
        let path = endpoint_path(name)?;
        *self.path.lock().unwrap() = Some(path);
        Ok(())
    }

    fn open(&self) -> Result<()> {
        // Reopening an open socket starts from a clean slate.
        self.close()?;
        let path = self
            .path
            .lock()
            .unwrap()
            .clone()
            .ok_or(Error::InvalidPath)?;
        let fd = sys::unix_connect(&path)?;
        self.core.attach(fd.into_raw_fd());
        self.core.arm_watch();
        tracing::debug!(path = %path.display(), "client connected");

        if let Some(this) = self.core.this() {
            let mut args = SocketEventArgs {
                status: Ok(()),
                socket: this,
            };
            self.core.events.opened.fire(&mut args);
        }
        Ok(())
    }

    fn close(&self) -> Result<()> {
        if !self.core.close_internal(Error::SocketClosed, true) {
            return Ok(());
        }
        // Wake any thread blocked in work() and absorb the cancellation
        // completions so the records settle before this call returns.
        self.core.dispatcher().wake_workers();
        let _ = self.core.dispatcher().drain(Duration::from_millis(250));
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn work(&self, time_limit: Duration) -> Result<()> {
        if !self.core.is_open() {
            return Ok(());
        }
        self.core.dispatcher().work(time_limit)
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

impl Drop for ClientSocket {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
