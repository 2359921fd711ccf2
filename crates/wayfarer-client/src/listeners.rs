//! Ordered listener registry.
//!
//! Listeners are keyed by a small `Copy` kind (an event enum discriminant, or `()`
//! for single-topic registries). Delivery follows registration order, and handlers
//! run without the registry lock held, so a handler may subscribe or unsubscribe.

use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};

/// A shared event callback.
pub type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct Entry<K, E> {
    id: u64,
    kind: K,
    handler: Handler<E>,
}

struct Registry<K, E> {
    next_id: u64,
    entries: Vec<Entry<K, E>>,
}

/// Listeners for events of type `E`, filtered by kind `K`.
pub struct Listeners<K, E> {
    inner: Arc<Mutex<Registry<K, E>>>,
}

impl<K, E> Clone for Listeners<K, E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K, E> Default for Listeners<K, E> {
    fn default() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Registry {
                next_id: 0,
                entries: Vec::new(),
            })),
        }
    }
}

impl<K, E> fmt::Debug for Listeners<K, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Listeners")
            .field("len", &self.inner.lock().entries.len())
            .finish()
    }
}

impl<K, E> Listeners<K, E>
where
    K: Copy + PartialEq + Send + 'static,
    E: 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `kind`. Registering the same handler twice yields two
    /// independent deliveries.
    pub fn add(&self, kind: K, handler: Handler<E>) -> Subscription {
        let id = {
            let mut registry = self.inner.lock();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.entries.push(Entry { id, kind, handler });
            id
        };

        let weak: Weak<Mutex<Registry<K, E>>> = Arc::downgrade(&self.inner);
        Subscription::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner.lock().entries.retain(|e| e.id != id);
            }
        })
    }

    /// Remove every registration of `handler` for `kind`; returns how many were removed.
    pub fn remove(&self, kind: K, handler: &Handler<E>) -> usize {
        let mut registry = self.inner.lock();
        let before = registry.entries.len();
        registry
            .entries
            .retain(|e| !(e.kind == kind && Arc::ptr_eq(&e.handler, handler)));
        before - registry.entries.len()
    }

    /// Deliver `event` to every handler registered for `kind`, in registration order.
    pub fn emit(&self, kind: K, event: &E) {
        let handlers: Vec<Handler<E>> = self
            .inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .map(|e| Arc::clone(&e.handler))
            .collect();

        for handler in handlers {
            handler(event);
        }
    }

    pub fn count(&self, kind: K) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .count()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to a registration. Dropping it unsubscribes; [`detach`](Self::detach)
/// keeps the registration alive for as long as its owner.
#[must_use = "dropping a Subscription immediately unsubscribes it"]
pub struct Subscription {
    unsubscribe: Option<Box<dyn FnOnce() + Send>>,
}

impl Subscription {
    pub fn new(unsubscribe: impl FnOnce() + Send + 'static) -> Self {
        Self {
            unsubscribe: Some(Box::new(unsubscribe)),
        }
    }

    /// Remove the registration now.
    pub fn unsubscribe(mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }

    /// Keep the registration without holding the handle.
    pub fn detach(mut self) {
        self.unsubscribe.take();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.unsubscribe.is_some())
            .finish()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(f) = self.unsubscribe.take() {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq)]
    enum Topic {
        A,
        B,
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&'static str) -> Handler<u32>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let make = {
            let log = log.clone();
            move |name: &'static str| -> Handler<u32> {
                let log = log.clone();
                Arc::new(move |v: &u32| log.lock().push(format!("{name}:{v}")))
            }
        };
        (log, make)
    }

    #[test]
    fn delivers_in_registration_order() {
        let listeners = Listeners::<Topic, u32>::new();
        let (log, make) = recorder();
        let _a = listeners.add(Topic::A, make("first"));
        let _b = listeners.add(Topic::A, make("second"));
        let _c = listeners.add(Topic::B, make("other"));

        listeners.emit(Topic::A, &7);

        assert_eq!(*log.lock(), vec!["first:7", "second:7"]);
    }

    #[test]
    fn unsubscribe_removes_only_that_registration() {
        let listeners = Listeners::<Topic, u32>::new();
        let (log, make) = recorder();
        let handler = make("h");
        let first = listeners.add(Topic::A, handler.clone());
        let _second = listeners.add(Topic::A, handler);

        first.unsubscribe();
        listeners.emit(Topic::A, &1);

        assert_eq!(*log.lock(), vec!["h:1"]);
    }

    #[test]
    fn remove_drops_every_matching_handler() {
        let listeners = Listeners::<Topic, u32>::new();
        let (log, make) = recorder();
        let handler = make("dup");
        listeners.add(Topic::A, handler.clone()).detach();
        listeners.add(Topic::A, handler.clone()).detach();
        listeners.add(Topic::A, make("keep")).detach();

        assert_eq!(listeners.remove(Topic::A, &handler), 2);
        assert_eq!(listeners.remove(Topic::A, &handler), 0);
        listeners.emit(Topic::A, &2);

        assert_eq!(*log.lock(), vec!["keep:2"]);
    }

    #[test]
    fn dropping_subscription_unsubscribes() {
        let listeners = Listeners::<(), u32>::new();
        let (_log, make) = recorder();
        {
            let _sub = listeners.add((), make("x"));
            assert_eq!(listeners.len(), 1);
        }
        assert!(listeners.is_empty());
    }

    #[test]
    fn handler_may_subscribe_during_emit() {
        let listeners = Listeners::<(), u32>::new();
        let inner = listeners.clone();
        listeners
            .add(
                (),
                Arc::new(move |_| inner.add((), Arc::new(|_| {})).detach()),
            )
            .detach();

        listeners.emit((), &0);
        assert_eq!(listeners.count(()), 2);
    }

    #[test]
    fn subscription_outliving_registry_is_harmless() {
        let listeners = Listeners::<(), u32>::new();
        let sub = listeners.add((), Arc::new(|_| {}));
        drop(listeners);
        sub.unsubscribe();
    }
}
