//! Subscriber registry for published views

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use aurum_core::ConnectionState;

use crate::reconciliation::LiveView;

type Listener = Arc<dyn Fn(&LiveView, ConnectionState) + Send + Sync>;

/// Listeners keyed by registration order
#[derive(Default)]
pub struct SubscriberRegistry {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<u64, Listener>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; it stays registered until the returned handle is
    /// unsubscribed or dropped.
    pub fn subscribe<F>(self: &Arc<Self>, listener: F) -> Subscription
    where
        F: Fn(&LiveView, ConnectionState) + Send + Sync + 'static,
    {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().insert(id, Arc::new(listener));
        Subscription {
            id,
            registry: Arc::downgrade(self),
        }
    }

    fn remove(&self, id: u64) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    /// Call every listener in registration order. The list is copied first so
    /// a listener may subscribe or unsubscribe while being called.
    pub fn notify(&self, view: &LiveView, state: ConnectionState) {
        let listeners: Vec<Listener> = self.listeners.read().values().cloned().collect();
        for listener in listeners {
            listener(view, state);
        }
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for SubscriberRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriberRegistry")
            .field("listeners", &self.len())
            .finish()
    }
}

/// Handle for one registered listener
#[derive(Debug)]
#[must_use = "dropping a Subscription unsubscribes it"]
pub struct Subscription {
    id: u64,
    registry: Weak<SubscriberRegistry>,
}

impl Subscription {
    pub fn unsubscribe(self) {
        // Drop does the work
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.remove(self.id);
        }
    }
}
