//! Typed observer registration with disposable handles.
//!
//! Observers subscribe with a closure and get back a [`Subscription`]. The
//! observer stays registered until the handle is disposed or dropped, so a
//! collaborator that goes away can never leave a dangling callback behind.

use std::{
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, warn};

type Handler<E> = Arc<dyn Fn(&E) + Send + Sync>;

// ── Subscriber table ────────────────────────────────────────────────────────

struct Subscribers<E> {
    entries: Mutex<Vec<(u64, Handler<E>)>>,
    next_id: AtomicU64,
}

impl<E> Subscribers<E> {
    fn remove(&self, id: u64) -> bool {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        let before = entries.len();
        entries.retain(|(entry_id, _)| *entry_id != id);
        entries.len() != before
    }
}

// ── EventBus ────────────────────────────────────────────────────────────────

/// Fan-out of events of type `E` to registered observers.
///
/// Cloning the bus is cheap and every clone shares the same observers.
pub struct EventBus<E> {
    subscribers: Arc<Subscribers<E>>,
}

impl<E: 'static> EventBus<E> {
    pub fn new() -> Self {
        Self {
            subscribers: Arc::new(Subscribers {
                entries: Mutex::new(Vec::new()),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Register `handler` for every emitted event.
    pub fn subscribe(&self, handler: impl Fn(&E) + Send + Sync + 'static) -> Subscription {
        let id = self.subscribers.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, Arc::new(handler)));
        debug!(subscription = id, "event observer registered");

        let weak: Weak<Subscribers<E>> = Arc::downgrade(&self.subscribers);
        Subscription {
            id,
            release: Some(Box::new(move || {
                weak.upgrade().is_some_and(|subscribers| subscribers.remove(id))
            })),
        }
    }

    /// Register `handler` only for events accepted by `filter`.
    pub fn subscribe_filtered(
        &self,
        filter: impl Fn(&E) -> bool + Send + Sync + 'static,
        handler: impl Fn(&E) + Send + Sync + 'static,
    ) -> Subscription {
        self.subscribe(move |event| {
            if filter(event) {
                handler(event);
            }
        })
    }

    /// Deliver `event` to every current observer.
    ///
    /// The subscriber list is snapshotted first, so observers may subscribe
    /// or dispose from inside their callback. A panicking observer is logged
    /// and skipped.
    pub fn emit(&self, event: &E) {
        let handlers: Vec<(u64, Handler<E>)> = self
            .subscribers
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for (id, handler) in handlers {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(subscription = id, "event observer panicked");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<E: 'static> Default for EventBus<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> Clone for EventBus<E> {
    fn clone(&self) -> Self {
        Self {
            subscribers: Arc::clone(&self.subscribers),
        }
    }
}

// ── Subscription ────────────────────────────────────────────────────────────

/// Handle returned by [`EventBus::subscribe`]. Dropping it unsubscribes.
#[must_use = "dropping a Subscription unsubscribes the observer immediately"]
pub struct Subscription {
    id: u64,
    release: Option<Box<dyn FnOnce() -> bool + Send + Sync>>,
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Unsubscribe now. Returns false if the bus was already gone.
    pub fn dispose(mut self) -> bool {
        self.release.take().is_some_and(|release| release())
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.release.is_some())
            .finish()
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    #[test]
    fn emit_reaches_every_subscriber() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));

        let a = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |v| {
                seen.fetch_add(*v as usize, Ordering::SeqCst);
            })
        };
        let b = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |v| {
                seen.fetch_add(*v as usize, Ordering::SeqCst);
            })
        };

        bus.emit(&2);
        assert_eq!(seen.load(Ordering::SeqCst), 4);
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn dispose_stops_delivery() {
        let bus: EventBus<&'static str> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |v| seen.lock().unwrap().push(*v))
        };

        bus.emit(&"first");
        assert!(sub.dispose());
        bus.emit(&"second");

        assert_eq!(*seen.lock().unwrap(), vec!["first"]);
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dropping_handle_unsubscribes() {
        let bus: EventBus<()> = EventBus::new();
        {
            let _sub = bus.subscribe(|_| {});
            assert_eq!(bus.subscriber_count(), 1);
        }
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn dispose_after_bus_dropped_is_harmless() {
        let bus: EventBus<()> = EventBus::new();
        let sub = bus.subscribe(|_| {});
        drop(bus);
        assert!(!sub.dispose());
    }

    #[test]
    fn filtered_subscription_skips_rejected_events() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = Arc::clone(&seen);
            bus.subscribe_filtered(|v| v % 2 == 0, move |v| seen.lock().unwrap().push(*v))
        };

        for v in 1..=4 {
            bus.emit(&v);
        }
        assert_eq!(*seen.lock().unwrap(), vec![2, 4]);
    }

    #[test]
    fn panicking_observer_does_not_block_others() {
        let bus: EventBus<()> = EventBus::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let _bad = bus.subscribe(|_| panic!("observer bug"));
        let _good = {
            let seen = Arc::clone(&seen);
            bus.subscribe(move |_| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
        };

        bus.emit(&());
        assert_eq!(seen.load(Ordering::SeqCst), 1);
    }
}
