//! Multicast event helper.
//!
//! A plain list of callables with add/remove/fire. Listeners receive the
//! event arguments by `&mut`, so an event like connection admission can
//! thread a decision through every listener. The final value after all
//! listeners have run is authoritative.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

type Listener<A> = Arc<dyn Fn(&mut A) + Send + Sync>;

/// Handle returned by [`Event::add`], used to remove the listener again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(u64);

/// An ordered list of listeners for one event.
pub struct Event<A> {
    listeners: Mutex<Vec<(u64, Listener<A>)>>,
    next_id: AtomicU64,
}

impl<A> Event<A> {
    pub fn new() -> Self {
        Self {
            listeners: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Append a listener. Listeners fire in registration order.
    pub fn add(&self, listener: impl Fn(&mut A) + Send + Sync + 'static) -> ListenerId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners
            .lock()
            .unwrap()
            .push((id, Arc::new(listener)));
        ListenerId(id)
    }

    /// Remove a previously added listener. Returns whether it was present.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut listeners = self.listeners.lock().unwrap();
        let before = listeners.len();
        listeners.retain(|(lid, _)| *lid != id.0);
        listeners.len() != before
    }

    pub fn clear(&self) {
        self.listeners.lock().unwrap().clear();
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.lock().unwrap().is_empty()
    }

    pub fn len(&self) -> usize {
        self.listeners.lock().unwrap().len()
    }

    /// Invoke every listener in order with the same mutable arguments.
    ///
    /// The listener list is snapshotted first, so a listener may add or
    /// remove listeners without deadlocking; changes take effect on the
    /// next fire.
    pub fn fire(&self, args: &mut A) {
        let snapshot: Vec<Listener<A>> = self
            .listeners
            .lock()
            .unwrap()
            .iter()
            .map(|(_, l)| l.clone())
            .collect();
        for listener in snapshot {
            listener(args);
        }
    }
}

impl<A> Default for Event<A> {
    fn default() -> Self {
        Self::new()
    }
}
