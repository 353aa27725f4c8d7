//! Callback registry for event subscriptions.
//!
//! Used by the item manager (object update notifications) and the network
//! adapter (peer lifecycle events). Observers are registered with an id and
//! removed either individually or all at once on teardown.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

/// A unique identifier for a subscription.
pub type SubscriptionId = u64;

/// Callback function type for events of type `E`.
///
/// Callbacks receive a reference to the event and should not block for extended periods.
pub type EventCallback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Thread-safe registry for managing event subscriptions.
///
/// Callbacks are invoked in subscription order.
pub struct CallbackRegistry<E> {
    callbacks: RwLock<BTreeMap<SubscriptionId, EventCallback<E>>>,
    next_id: AtomicU64,
}

impl<E> CallbackRegistry<E> {
    /// Create a new empty callback registry.
    pub fn new() -> Self {
        Self {
            callbacks: RwLock::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Subscribe to events.
    ///
    /// Returns a subscription ID that can be used to unsubscribe later.
    pub fn subscribe(&self, callback: EventCallback<E>) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.insert(id, callback);
        id
    }

    /// Returns `true` if the subscription was found and removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.remove(&id).is_some()
    }

    /// Emit an event to all registered callbacks.
    ///
    /// If a callback panics, it does not affect other callbacks.
    pub fn emit(&self, event: &E) {
        // Snapshot the callbacks so observers may (un)subscribe re-entrantly.
        let callbacks: Vec<EventCallback<E>> = {
            let callbacks = self.callbacks.read().unwrap();
            callbacks.values().cloned().collect()
        };
        for callback in callbacks {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                callback(event);
            }));
            if outcome.is_err() {
                log::error!("Observer panicked while handling event");
            }
        }
    }

    pub fn subscriber_count(&self) -> usize {
        let callbacks = self.callbacks.read().unwrap();
        callbacks.len()
    }

    pub fn has_subscribers(&self) -> bool {
        let callbacks = self.callbacks.read().unwrap();
        !callbacks.is_empty()
    }

    /// Clear all subscriptions.
    pub fn clear(&self) {
        let mut callbacks = self.callbacks.write().unwrap();
        callbacks.clear();
    }
}

impl<E> Default for CallbackRegistry<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for CallbackRegistry<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackRegistry")
            .field("subscriber_count", &self.subscriber_count())
            .field("next_id", &self.next_id.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_subscribe_and_emit() {
        let registry: CallbackRegistry<u32> = CallbackRegistry::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let seen_clone = Arc::clone(&seen);
        registry.subscribe(Arc::new(move |event| {
            seen_clone.lock().unwrap().push(*event);
        }));

        registry.emit(&7);
        registry.emit(&9);
        assert_eq!(*seen.lock().unwrap(), vec![7, 9]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let registry: CallbackRegistry<()> = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let counter_clone = Arc::clone(&counter);
        let id = registry.subscribe(Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        assert!(registry.unsubscribe(id));
        assert!(!registry.unsubscribe(id));
        registry.emit(&());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_clear() {
        let registry: CallbackRegistry<()> = CallbackRegistry::new();
        registry.subscribe(Arc::new(|_| {}));
        registry.subscribe(Arc::new(|_| {}));
        assert_eq!(registry.subscriber_count(), 2);

        registry.clear();
        assert!(!registry.has_subscribers());
    }

    #[test]
    fn test_callback_panic_isolation() {
        let registry: CallbackRegistry<()> = CallbackRegistry::new();
        let counter = Arc::new(AtomicUsize::new(0));

        registry.subscribe(Arc::new(|_| {
            panic!("Test panic");
        }));
        let counter_clone = Arc::clone(&counter);
        registry.subscribe(Arc::new(move |_| {
            counter_clone.fetch_add(1, Ordering::SeqCst);
        }));

        registry.emit(&());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
