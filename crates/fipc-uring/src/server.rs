//! Listening server.
//!
//! One listener fd, one shared dispatcher, and a pool of `BACKLOG`
//! server-side sockets armed with accepts:
//!
//! - `open()` binds the listener and fills the pool.
//! - When a pooled socket's wait completes, the `connected` event decides
//!   admission. Admitted sockets leave the free set and the pool is
//!   replenished up to `BACKLOG`; rejected peers are disconnected and the
//!   socket is rearmed.
//! - When an admitted socket closes, it is rearmed (pool under `BACKLOG`)
//!   or retired.
//! - `close()` stops every socket, cancels pending waits, wakes each
//!   worker with a sentinel, and drains the dispatcher so in-flight
//!   callbacks unwind before teardown.

use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use fipc_core::{
    endpoint_path, ConnectedArgs, Error, Event, Permissions, Result, Server, Socket,
};

use crate::dispatcher::{Dispatcher, SERVER_ENTRIES};
use crate::server_socket::ServerSocket;
use crate::sys;

/// Pre-created sockets kept awaiting connections.
pub(crate) const BACKLOG: usize = 8;

struct ServerState {
    path: Option<PathBuf>,
    perms: Permissions,
    listener: Option<OwnedFd>,
    dispatcher: Option<Arc<Dispatcher>>,
    sockets: Vec<Arc<ServerSocket>>,
}

pub struct UdsServer {
    state: Mutex<ServerState>,
    opened: AtomicBool,
    free: AtomicUsize,
    connected: Event<ConnectedArgs>,
    this: Mutex<Weak<UdsServer>>,
}

impl UdsServer {
    pub fn create() -> Arc<UdsServer> {
        let server = Arc::new(UdsServer {
            state: Mutex::new(ServerState {
                path: None,
                perms: Permissions::default(),
                listener: None,
                dispatcher: None,
                sockets: Vec::new(),
            }),
            opened: AtomicBool::new(false),
            free: AtomicUsize::new(0),
            connected: Event::new(),
            this: Mutex::new(Weak::new()),
        });
        *server.this.lock().unwrap() = Arc::downgrade(&server);
        server
    }

    fn open_inner(&self) -> Result<()> {
        let mut st = self.state.lock().unwrap();
        let path = st.path.clone().ok_or(Error::InvalidPath)?;
        let dispatcher = Dispatcher::new(SERVER_ENTRIES)?;
        let listener = sys::unix_listener(&path, st.perms, BACKLOG)?;
        let listener_fd = listener.as_raw_fd();
        st.dispatcher = Some(dispatcher.clone());
        st.listener = Some(listener);
        for _ in 0..BACKLOG {
            let socket = self.spawn_socket(listener_fd, &dispatcher)?;
            st.sockets.push(socket);
        }
        drop(st);
        self.free.store(BACKLOG, Ordering::SeqCst);
        self.opened.store(true, Ordering::SeqCst);
        tracing::debug!(path = %path.display(), backlog = BACKLOG, "server open");
        Ok(())
    }

    /// Build one pooled socket: subscribe the recycle hook, arm its accept.
    fn spawn_socket(
        &self,
        listener_fd: RawFd,
        dispatcher: &Arc<Dispatcher>,
    ) -> Result<Arc<ServerSocket>> {
        let weak_server = self.this.lock().unwrap().clone();
        let socket = ServerSocket::new(weak_server.clone(), listener_fd, dispatcher.clone());
        let weak_socket = Arc::downgrade(&socket);
        socket.internal_closed().add(move |_args| {
            if let (Some(server), Some(socket)) = (weak_server.upgrade(), weak_socket.upgrade()) {
                server.on_socket_closed(&socket);
            }
        });
        socket.arm_accept()?;
        Ok(socket)
    }

    fn remove_socket(&self, socket: &Arc<ServerSocket>) {
        self.state
            .lock()
            .unwrap()
            .sockets
            .retain(|s| !Arc::ptr_eq(s, socket));
    }

    /// A pooled socket's wait finished: mediate admission.
    pub(crate) fn on_socket_opened(&self, status: Result<()>, socket: &Arc<ServerSocket>) {
        if status.is_err() {
            return;
        }
        if !self.opened.load(Ordering::Acquire) {
            socket.close_quiet();
            return;
        }

        let dyn_socket: Arc<dyn Socket> = socket.clone();
        let mut args = ConnectedArgs {
            allow: false,
            socket: dyn_socket,
        };
        self.connected.fire(&mut args);

        if args.allow {
            tracing::debug!("connection admitted");
            let _ = self
                .free
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |v| {
                    Some(v.saturating_sub(1))
                });
            if self.free.load(Ordering::SeqCst) >= BACKLOG {
                return;
            }
            let (listener_fd, dispatcher) = {
                let st = self.state.lock().unwrap();
                match (&st.listener, &st.dispatcher) {
                    (Some(listener), Some(dispatcher)) => {
                        (listener.as_raw_fd(), dispatcher.clone())
                    }
                    _ => return,
                }
            };
            match self.spawn_socket(listener_fd, &dispatcher) {
                Ok(replacement) => {
                    self.state.lock().unwrap().sockets.push(replacement);
                    self.free.fetch_add(1, Ordering::SeqCst);
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to replenish socket pool");
                }
            }
        } else {
            tracing::debug!("connection rejected");
            socket.close_quiet();
            let pool_len = self.state.lock().unwrap().sockets.len();
            if pool_len <= BACKLOG {
                if socket.rearm().is_err() {
                    self.remove_socket(socket);
                }
            } else {
                self.remove_socket(socket);
            }
        }
    }

    /// An admitted socket transitioned to Closed: rearm it or retire it.
    pub(crate) fn on_socket_closed(&self, socket: &Arc<ServerSocket>) {
        if !self.opened.load(Ordering::Acquire) {
            return;
        }
        if self.free.load(Ordering::SeqCst) < BACKLOG {
            if socket.rearm().is_ok() {
                self.free.fetch_add(1, Ordering::SeqCst);
            } else {
                self.remove_socket(socket);
            }
        } else {
            self.remove_socket(socket);
        }
    }
}

impl Server for UdsServer {
    fn set_path(&self, name: &str) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            return Err(Error::NotSupported);
        }
        let path = endpoint_path(name)?;
        self.state.lock().unwrap().path = Some(path);
        Ok(())
    }

    fn set_permissions(&self, permissions: Permissions) -> Result<()> {
        if self.opened.load(Ordering::Acquire) {
            return Err(Error::NotSupported);
        }
        self.state.lock().unwrap().perms = permissions;
        Ok(())
    }

    fn open(&self) -> Result<()> {
        self.close()?;
        let result = self.open_inner();
        if result.is_err() {
            let _ = self.close();
        }
        result
    }

    fn close(&self) -> Result<()> {
        self.opened.store(false, Ordering::SeqCst);
        let (sockets, dispatcher) = {
            let mut st = self.state.lock().unwrap();
            (std::mem::take(&mut st.sockets), st.dispatcher.take())
        };
        for socket in &sockets {
            socket.close_quiet();
        }
        drop(sockets);

        if let Some(dispatcher) = dispatcher {
            dispatcher.cancel_all();
            dispatcher.shutdown();
            if dispatcher.drain(Duration::from_secs(1)).is_err() {
                tracing::warn!("dispatcher drain timed out during server close");
            }
        }

        let (listener, path) = {
            let mut st = self.state.lock().unwrap();
            (st.listener.take(), st.path.clone())
        };
        if let Some(listener) = listener {
            drop(listener);
            if let Some(path) = path {
                sys::unlink_path(&path);
            }
            tracing::debug!("server closed");
        }
        self.free.store(0, Ordering::SeqCst);
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.opened.load(Ordering::Acquire)
    }

    fn work(&self, time_limit: Duration) -> Result<()> {
        let dispatcher = {
            let st = self.state.lock().unwrap();
            if !self.opened.load(Ordering::Acquire) {
                return Ok(());
            }
            st.dispatcher.clone()
        };
        match dispatcher {
            Some(dispatcher) => dispatcher.work(time_limit),
            None => Ok(()),
        }
    }

    fn connected(&self) -> &Event<ConnectedArgs> {
        &self.connected
    }

    fn free_sockets(&self) -> usize {
        self.free.load(Ordering::SeqCst)
    }
}

impl Drop for UdsServer {
    fn drop(&mut self) {
        let _ = self.close();
    }
}
