use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::sync::MutexExt;

/// Stable handle returned by [`Subscribers::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(u64);

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Ordered publish/subscribe registry.
///
/// Handlers run synchronously on the publishing task, in subscription order.
/// They must not block; hand work off to a channel if it needs to await.
pub struct Subscribers<T> {
    next_id: AtomicU64,
    handlers: Mutex<BTreeMap<SubscriptionId, Handler<T>>>,
}

impl<T> Default for Subscribers<T> {
    fn default() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            handlers: Mutex::new(BTreeMap::new()),
        }
    }
}

impl<T> Subscribers<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, handler: impl Fn(&T) + Send + Sync + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.handlers
            .lock_or_recover("Subscribers::subscribe")
            .insert(id, Arc::new(handler));
        id
    }

    /// Returns `false` if the handle was not (or no longer) registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.handlers
            .lock_or_recover("Subscribers::unsubscribe")
            .remove(&id)
            .is_some()
    }

    pub fn len(&self) -> usize {
        self.handlers.lock_or_recover("Subscribers::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn publish(&self, value: &T) {
        // Snapshot so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Handler<T>> = self
            .handlers
            .lock_or_recover("Subscribers::publish")
            .values()
            .cloned()
            .collect();
        for handler in handlers {
            handler(value);
        }
    }
}

impl<T> std::fmt::Debug for Subscribers<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscribers")
            .field("len", &self.len())
            .finish()
    }
}
