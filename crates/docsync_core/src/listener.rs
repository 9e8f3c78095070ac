//! Revocable listener registrations.
//!
//! A [`ListenerRegistry`] holds callbacks of one shape. Registering returns a
//! [`ListenerToken`]; removing or dropping the token unregisters the callback.
//!
//! Removal is linearizable with delivery: each registration carries a
//! reentrant "alive" lock that is held for the duration of every invocation.
//! Revoking takes the same lock, so once `remove` returns no invocation of
//! that callback is running on another thread and none will start. Removing a
//! listener from inside its own callback is allowed.

use parking_lot::{Mutex, ReentrantMutex};
use std::cell::Cell;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

/// A registered callback.
pub struct Registration<F: ?Sized> {
    id: u64,
    scope: Option<String>,
    alive: ReentrantMutex<Cell<bool>>,
    callback: Box<F>,
}

impl<F: ?Sized> Registration<F> {
    /// Runs `call` with the callback unless the registration was revoked.
    ///
    /// Returns false if the callback was not invoked.
    pub fn invoke(&self, call: impl FnOnce(&F)) -> bool {
        let alive = self.alive.lock();
        if !alive.get() {
            return false;
        }
        call(&self.callback);
        true
    }

    /// Scope key the callback was registered under.
    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }
}

trait Revocable: Send + Sync {
    fn revoke(&self);
}

impl<F: ?Sized + Send + Sync> Revocable for Registration<F> {
    fn revoke(&self) {
        self.alive.lock().set(false);
    }
}

trait Unregister: Send + Sync {
    fn unregister(&self, id: u64);
}

/// A set of callbacks of one type.
pub struct ListenerRegistry<F: ?Sized> {
    next_id: AtomicU64,
    entries: Mutex<Vec<Arc<Registration<F>>>>,
}

impl<F: ?Sized + Send + Sync + 'static> ListenerRegistry<F> {
    /// Creates an empty registry.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_id: AtomicU64::new(1),
            entries: Mutex::new(Vec::new()),
        })
    }

    /// Registers a callback, optionally scoped to a key such as a document ID.
    pub fn add(self: &Arc<Self>, scope: Option<String>, callback: Box<F>) -> ListenerToken {
        let registration = Arc::new(Registration {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            scope,
            alive: ReentrantMutex::new(Cell::new(true)),
            callback,
        });
        self.entries.lock().push(Arc::clone(&registration));

        let registry: Weak<dyn Unregister> = Arc::downgrade(self) as Weak<dyn Unregister>;
        ListenerToken {
            id: registration.id,
            registry,
            registration,
            removed: false,
        }
    }

    /// All live registrations, in registration order.
    pub fn snapshot(&self) -> Vec<Arc<Registration<F>>> {
        self.entries.lock().clone()
    }

    /// Live registrations scoped to `key`.
    pub fn snapshot_scoped(&self, key: &str) -> Vec<Arc<Registration<F>>> {
        self.entries
            .lock()
            .iter()
            .filter(|registration| registration.scope() == Some(key))
            .cloned()
            .collect()
    }

    /// Number of registrations.
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// True if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<F: ?Sized + Send + Sync + 'static> Unregister for ListenerRegistry<F> {
    fn unregister(&self, id: u64) {
        self.entries.lock().retain(|registration| registration.id != id);
    }
}

/// Owns one listener registration.
///
/// Dropping the token removes the listener.
#[must_use = "dropping a ListenerToken removes the listener immediately"]
pub struct ListenerToken {
    id: u64,
    registry: Weak<dyn Unregister>,
    registration: Arc<dyn Revocable>,
    removed: bool,
}

impl ListenerToken {
    /// Removes the listener.
    ///
    /// Blocks while the callback is running on another thread; after this
    /// returns the callback is never invoked again.
    pub fn remove(mut self) {
        self.revoke();
    }

    fn revoke(&mut self) {
        if self.removed {
            return;
        }
        self.removed = true;
        if let Some(registry) = self.registry.upgrade() {
            registry.unregister(self.id);
        }
        self.registration.revoke();
    }
}

impl Drop for ListenerToken {
    fn drop(&mut self) {
        self.revoke();
    }
}

impl fmt::Debug for ListenerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ListenerToken")
            .field("id", &self.id)
            .field("removed", &self.removed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    type Callback = dyn Fn(u32) + Send + Sync;

    fn fire(registry: &ListenerRegistry<Callback>, value: u32) -> usize {
        registry
            .snapshot()
            .iter()
            .filter(|registration| registration.invoke(|cb| cb(value)))
            .count()
    }

    #[test]
    fn add_fire_remove() {
        let registry = ListenerRegistry::<Callback>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = registry.add(
            None,
            Box::new(move |n: u32| {
                counter.fetch_add(n as usize, Ordering::SeqCst);
            }),
        );

        assert_eq!(fire(&registry, 2), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        token.remove();
        assert!(registry.is_empty());
        assert_eq!(fire(&registry, 2), 0);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn drop_unregisters() {
        let registry = ListenerRegistry::<Callback>::new();
        {
            let _token = registry.add(None, Box::new(|_: u32| {}));
            assert_eq!(registry.len(), 1);
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn revoked_snapshot_entry_is_skipped() {
        let registry = ListenerRegistry::<Callback>::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let token = registry.add(
            None,
            Box::new(move |_: u32| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        // Snapshot taken before removal, as an in-flight delivery would.
        let snapshot = registry.snapshot();
        token.remove();
        for registration in &snapshot {
            assert!(!registration.invoke(|cb| cb(1)));
        }
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn scoped_snapshot_filters_by_key() {
        let registry = ListenerRegistry::<Callback>::new();
        let _a = registry.add(Some("foo".into()), Box::new(|_: u32| {}));
        let _b = registry.add(Some("bar".into()), Box::new(|_: u32| {}));
        assert_eq!(registry.snapshot_scoped("foo").len(), 1);
        assert!(registry.snapshot_scoped("baz").is_empty());
    }

    #[test]
    fn token_outlives_registry() {
        let registry = ListenerRegistry::<Callback>::new();
        let token = registry.add(None, Box::new(|_: u32| {}));
        drop(registry);
        token.remove();
    }

    #[test]
    fn remove_waits_for_in_flight_callback() {
        let registry = ListenerRegistry::<Callback>::new();
        let (entered_tx, entered_rx) = mpsc::channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let done = Arc::clone(&finished);
        let token = registry.add(
            None,
            Box::new(move |_: u32| {
                entered_tx.send(()).unwrap();
                thread::sleep(Duration::from_millis(50));
                done.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let deliver = {
            let registry = Arc::clone(&registry);
            thread::spawn(move || fire(&registry, 1))
        };
        entered_rx.recv().unwrap();
        token.remove();
        // The callback had already started, so removal waited for it.
        assert_eq!(finished.load(Ordering::SeqCst), 1);
        assert_eq!(deliver.join().unwrap(), 1);
        assert_eq!(fire(&registry, 1), 0);
    }
}
