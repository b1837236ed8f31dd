//! Connection-state observer registry.
//!
//! Listeners are plain callbacks receiving `true` on connect and `false` on
//! any transition out of `Connected` (failure, loss, disconnect). Each
//! subscription returns a [`ConnectionSubscription`] token; calling
//! [`unsubscribe`](ConnectionSubscription::unsubscribe) removes exactly that
//! listener and may be called any number of times.
//!
//! Delivery snapshots the registry first, so subscribing or unsubscribing
//! from inside a callback never disturbs the listeners being notified. A
//! panicking callback is caught and logged; the remaining listeners still
//! run.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use tracing::warn;

/// Callback type stored in the registry.
pub type ConnectionCallback = dyn Fn(bool) + Send + Sync;

struct ListenerSlot {
    id: u64,
    active: AtomicBool,
    callback: Box<ConnectionCallback>,
}

#[derive(Default)]
pub(crate) struct ListenerRegistry {
    next_id: AtomicU64,
    slots: Mutex<Vec<Arc<ListenerSlot>>>,
}

impl ListenerRegistry {
    pub(crate) fn subscribe(
        self: &Arc<Self>,
        callback: impl Fn(bool) + Send + Sync + 'static,
    ) -> ConnectionSubscription {
        let slot = Arc::new(ListenerSlot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            active: AtomicBool::new(true),
            callback: Box::new(callback),
        });
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&slot));
        ConnectionSubscription {
            slot,
            registry: Arc::downgrade(self),
        }
    }

    /// Deliver `connected` to every active listener. Returns how many ran.
    pub(crate) fn notify(&self, connected: bool) -> usize {
        let snapshot: Vec<Arc<ListenerSlot>> = self
            .slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        let mut delivered = 0;
        for slot in snapshot {
            // Unsubscribed after the snapshot was taken.
            if !slot.active.load(Ordering::Acquire) {
                continue;
            }
            let outcome = catch_unwind(AssertUnwindSafe(|| (slot.callback)(connected)));
            if outcome.is_err() {
                warn!(
                    "Connection listener {} panicked while handling connected={connected}",
                    slot.id
                );
            }
            delivered += 1;
        }
        delivered
    }

    pub(crate) fn len(&self) -> usize {
        self.slots.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn remove(&self, id: u64) {
        self.slots
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|slot| slot.id != id);
    }
}

/// Handle for one registered connection listener.
///
/// Dropping the handle does not unsubscribe; call
/// [`unsubscribe`](Self::unsubscribe) explicitly.
pub struct ConnectionSubscription {
    slot: Arc<ListenerSlot>,
    registry: Weak<ListenerRegistry>,
}

impl ConnectionSubscription {
    /// Remove this listener. Idempotent.
    pub fn unsubscribe(&self) {
        self.slot.active.store(false, Ordering::Release);
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.slot.id);
        }
    }

    /// Whether the listener is still registered.
    pub fn is_active(&self) -> bool {
        self.slot.active.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for ConnectionSubscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionSubscription")
            .field("id", &self.slot.id)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recorder() -> (Arc<Mutex<Vec<bool>>>, impl Fn(bool) + Send + Sync + 'static) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        (seen, move |c| sink.lock().unwrap().push(c))
    }

    #[test]
    fn every_listener_sees_transitions() {
        let registry = Arc::new(ListenerRegistry::default());
        let (a, cb_a) = recorder();
        let (b, cb_b) = recorder();
        let _sa = registry.subscribe(cb_a);
        let _sb = registry.subscribe(cb_b);

        assert_eq!(registry.notify(true), 2);
        registry.notify(false);

        assert_eq!(*a.lock().unwrap(), vec![true, false]);
        assert_eq!(*b.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn unsubscribe_is_idempotent_and_isolated() {
        let registry = Arc::new(ListenerRegistry::default());
        let (a, cb_a) = recorder();
        let (b, cb_b) = recorder();
        let sa = registry.subscribe(cb_a);
        let _sb = registry.subscribe(cb_b);

        registry.notify(true);
        sa.unsubscribe();
        sa.unsubscribe();
        registry.notify(false);

        assert!(!sa.is_active());
        assert_eq!(registry.len(), 1);
        assert_eq!(*a.lock().unwrap(), vec![true]);
        assert_eq!(*b.lock().unwrap(), vec![true, false]);
    }

    #[test]
    fn panicking_listener_does_not_block_others() {
        let registry = Arc::new(ListenerRegistry::default());
        let _bad = registry.subscribe(|_| panic!("listener bug"));
        let (seen, cb) = recorder();
        let _good = registry.subscribe(cb);

        assert_eq!(registry.notify(true), 2);
        assert_eq!(*seen.lock().unwrap(), vec![true]);
    }

    #[test]
    fn unsubscribe_during_delivery_skips_removed_listener() {
        let registry = Arc::new(ListenerRegistry::default());
        let (late, cb_late) = recorder();

        let handle: Arc<Mutex<Option<ConnectionSubscription>>> = Arc::new(Mutex::new(None));
        let handle_in_cb = Arc::clone(&handle);
        let _first = registry.subscribe(move |_| {
            if let Some(sub) = handle_in_cb.lock().unwrap().as_ref() {
                sub.unsubscribe();
            }
        });
        *handle.lock().unwrap() = Some(registry.subscribe(cb_late));

        assert_eq!(registry.notify(true), 1);
        assert!(late.lock().unwrap().is_empty());
    }

    #[test]
    fn unsubscribe_after_registry_dropped_is_harmless() {
        let registry = Arc::new(ListenerRegistry::default());
        let sub = registry.subscribe(|_| {});
        drop(registry);
        sub.unsubscribe();
        assert!(!sub.is_active());
    }
}
