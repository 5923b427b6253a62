//! Typed publish/subscribe signal.
//!
//! The event-notification backbone for the core: entity creation/deletion,
//! damage, tick phases, routed and posted packets.
//!
//! - `connect` / `once` return a [`Connection`] that can be disconnected.
//! - `fire` dispatches to a snapshot of the current subscribers. Each
//!   subscriber runs isolated: a panic is caught and logged and the rest of
//!   the subscribers still run.
//! - `wait` suspends an async task until the next firing.

use std::{
    any::Any,
    fmt,
    future::Future,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Mutex, MutexGuard, Weak},
};

use tokio::sync::oneshot;
use tracing::error;

type Callback<T> = Arc<dyn Fn(T) + Send + Sync>;

struct Subscriber<T> {
    id: u64,
    once: bool,
    callback: Callback<T>,
}

struct Inner<T> {
    next_id: u64,
    subscribers: Vec<Subscriber<T>>,
    waiters: Vec<oneshot::Sender<T>>,
}

/// Typed signal. Cloning shares the subscriber list.
pub struct Signal<T> {
    name: &'static str,
    inner: Arc<Mutex<Inner<T>>>,
}

impl<T> Clone for Signal<T> {
    fn clone(&self) -> Self {
        Self {
            name: self.name,
            inner: self.inner.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Signal<T> {
    fn default() -> Self {
        Self::new("signal")
    }
}

impl<T> fmt::Debug for Signal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let count = lock(&self.inner).subscribers.len();
        f.debug_struct("Signal")
            .field("name", &self.name)
            .field("subscribers", &count)
            .finish()
    }
}

impl<T: Clone + Send + 'static> Signal<T> {
    /// Creates a signal. The name only shows up in diagnostics.
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Arc::new(Mutex::new(Inner {
                next_id: 0,
                subscribers: Vec::new(),
                waiters: Vec::new(),
            })),
        }
    }

    pub fn connect<F>(&self, f: F) -> Connection
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(false, Arc::new(f))
    }

    /// Subscribes for the next firing only.
    pub fn once<F>(&self, f: F) -> Connection
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.subscribe(true, Arc::new(f))
    }

    fn subscribe(&self, once: bool, callback: Callback<T>) -> Connection {
        let mut inner = lock(&self.inner);
        let id = inner.next_id;
        inner.next_id += 1;
        inner.subscribers.push(Subscriber { id, once, callback });
        drop(inner);

        let inner: Arc<dyn Detach> = self.inner.clone();
        let weak = Arc::downgrade(&inner);
        Connection {
            target: Some(weak),
            id,
        }
    }

    /// Dispatches `value` to every subscriber connected at the time of the
    /// call, then wakes every pending [`Signal::wait`].
    pub fn fire(&self, value: T) {
        let (callbacks, waiters) = {
            let mut inner = lock(&self.inner);
            let callbacks: Vec<Callback<T>> = inner
                .subscribers
                .iter()
                .map(|s| s.callback.clone())
                .collect();
            inner.subscribers.retain(|s| !s.once);
            (callbacks, std::mem::take(&mut inner.waiters))
        };

        for callback in callbacks {
            let value = value.clone();
            isolated(self.name, move || callback(value));
        }
        for waiter in waiters {
            let _ = waiter.send(value.clone());
        }
    }

    /// Resolves with the value of the next firing, or `None` if the signal
    /// is cleared first.
    pub fn wait(&self) -> impl Future<Output = Option<T>> + Send + 'static {
        let (tx, rx) = oneshot::channel();
        lock(&self.inner).waiters.push(tx);
        async move { rx.await.ok() }
    }

    /// Drops every subscriber and cancels every pending wait.
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.subscribers.clear();
        inner.waiters.clear();
    }

    pub fn subscriber_count(&self) -> usize {
        lock(&self.inner).subscribers.len()
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    // Subscribers never run under the lock, so poisoning carries no torn state.
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

trait Detach: Send + Sync {
    fn detach(&self, id: u64);
    fn contains(&self, id: u64) -> bool;
}

impl<T: Send> Detach for Mutex<Inner<T>> {
    fn detach(&self, id: u64) {
        lock(self).subscribers.retain(|s| s.id != id);
    }

    fn contains(&self, id: u64) -> bool {
        lock(self).subscribers.iter().any(|s| s.id == id)
    }
}

/// Handle returned by [`Signal::connect`]. Dropping it does *not*
/// disconnect; call [`Connection::disconnect`].
pub struct Connection {
    target: Option<Weak<dyn Detach>>,
    id: u64,
}

impl Connection {
    /// A connection that is not attached to anything.
    pub fn detached() -> Self {
        Self {
            target: None,
            id: 0,
        }
    }

    /// Idempotent.
    pub fn disconnect(&self) {
        if let Some(target) = self.target.as_ref().and_then(Weak::upgrade) {
            target.detach(self.id);
        }
    }

    pub fn is_connected(&self) -> bool {
        self.target
            .as_ref()
            .and_then(Weak::upgrade)
            .is_some_and(|t| t.contains(self.id))
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("connected", &self.is_connected())
            .finish()
    }
}

/// Runs `f`, catching and logging a panic instead of unwinding into the
/// caller. Returns `None` if `f` panicked.
pub fn isolated<R>(label: &str, f: impl FnOnce() -> R) -> Option<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(r) => Some(r),
        Err(payload) => {
            error!(%label, panic = %panic_message(payload.as_ref()), "Isolated callback panicked");
            None
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn connect_fire_disconnect() {
        let signal = Signal::<u32>::new("test");
        let total = Arc::new(AtomicU32::new(0));
        let t = total.clone();
        let conn = signal.connect(move |v| {
            t.fetch_add(v, Ordering::SeqCst);
        });
        signal.fire(3);
        signal.fire(4);
        assert_eq!(total.load(Ordering::SeqCst), 7);

        assert!(conn.is_connected());
        conn.disconnect();
        conn.disconnect();
        assert!(!conn.is_connected());
        signal.fire(100);
        assert_eq!(total.load(Ordering::SeqCst), 7);
    }

    #[test]
    fn once_fires_a_single_time() {
        let signal = Signal::<()>::new("test");
        let hits = Arc::new(AtomicU32::new(0));
        let h = hits.clone();
        signal.once(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.fire(());
        signal.fire(());
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[test]
    fn panicking_subscriber_is_isolated() {
        let signal = Signal::<u32>::new("test");
        let hits = Arc::new(AtomicU32::new(0));
        signal.connect(|_| panic!("boom"));
        let h = hits.clone();
        signal.connect(move |_| {
            h.fetch_add(1, Ordering::SeqCst);
        });
        signal.fire(1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn subscriber_may_disconnect_during_dispatch() {
        let signal = Signal::<u32>::new("test");
        let slot: Arc<Mutex<Option<Connection>>> = Arc::new(Mutex::new(None));
        let s = slot.clone();
        let conn = signal.connect(move |_| {
            if let Some(c) = s.lock().unwrap().as_ref() {
                c.disconnect();
            }
        });
        *slot.lock().unwrap() = Some(conn);
        signal.fire(1);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_resolves_on_fire_and_on_clear() {
        let signal = Signal::<u32>::new("test");
        let waiting = signal.wait();
        signal.fire(9);
        assert_eq!(waiting.await, Some(9));

        let waiting = signal.wait();
        signal.clear();
        assert_eq!(waiting.await, None);
    }
}
