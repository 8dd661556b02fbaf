//! Explicit listener registration with synchronous fan-out.

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

type Listener<E> = Arc<dyn Fn(&E) + Send + Sync>;

struct ListenerList<E> {
    next_id: u64,
    listeners: Vec<(u64, Listener<E>)>,
}

/// Listeners for one entity's events.
///
/// Listeners run on the emitting thread, inside the mutation that raised the
/// event, in registration order.
pub struct Observers<E> {
    list: Arc<Mutex<ListenerList<E>>>,
}

impl<E: 'static> Observers<E> {
    pub fn new() -> Self {
        Self {
            list: Arc::new(Mutex::new(ListenerList {
                next_id: 0,
                listeners: Vec::new(),
            })),
        }
    }

    /// Register a listener; it stays registered until the handle is cancelled.
    pub fn subscribe(&self, listener: impl Fn(&E) + Send + Sync + 'static) -> SubscriptionHandle {
        let mut list = self.list.lock();
        let id = list.next_id;
        list.next_id += 1;
        list.listeners.push((id, Arc::new(listener)));

        let weak: Weak<Mutex<ListenerList<E>>> = Arc::downgrade(&self.list);
        SubscriptionHandle {
            cancel: Some(Box::new(move || {
                if let Some(list) = weak.upgrade() {
                    list.lock().listeners.retain(|(lid, _)| *lid != id);
                }
            })),
        }
    }

    /// Deliver an event to every listener.
    pub fn emit(&self, event: &E) {
        // snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<Listener<E>> = self
            .list
            .lock()
            .listeners
            .iter()
            .map(|(_, l)| Arc::clone(l))
            .collect();
        for listener in listeners {
            listener(event);
        }
    }

    pub fn len(&self) -> usize {
        self.list.lock().listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<E: 'static> Default for Observers<E> {
    fn default() -> Self {
        Self::new()
    }
}

/// Returned by `subscribe`; dropping it keeps the listener registered.
#[must_use = "keep the handle to be able to unsubscribe"]
pub struct SubscriptionHandle {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl SubscriptionHandle {
    /// Unregister the listener.
    pub fn cancel(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn fan_out_in_order() {
        let observers: Observers<u32> = Observers::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let s1 = Arc::clone(&seen);
        let _h1 = observers.subscribe(move |e| s1.lock().push(("first", *e)));
        let s2 = Arc::clone(&seen);
        let _h2 = observers.subscribe(move |e| s2.lock().push(("second", *e)));

        observers.emit(&7);
        assert_eq!(*seen.lock(), vec![("first", 7), ("second", 7)]);
    }

    #[test]
    fn cancel_stops_delivery() {
        let observers: Observers<()> = Observers::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let handle = observers.subscribe(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });

        observers.emit(&());
        handle.cancel();
        observers.emit(&());

        assert_eq!(count.load(Ordering::SeqCst), 1);
        assert!(observers.is_empty());
    }

    #[test]
    fn cancel_after_owner_dropped_is_noop() {
        let observers: Observers<()> = Observers::new();
        let handle = observers.subscribe(|_| {});
        drop(observers);
        handle.cancel();
    }

    #[test]
    fn listener_may_subscribe_during_emit() {
        let observers: Arc<Observers<()>> = Arc::new(Observers::new());
        let inner = Arc::clone(&observers);
        let _h = observers.subscribe(move |_| {
            let _nested = inner.subscribe(|_| {});
        });
        observers.emit(&());
        assert_eq!(observers.len(), 2);
    }
}
