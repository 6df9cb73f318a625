//! Synchronous publish/subscribe event bus.
//!
//! Every other component reports through a bus instance handed to it by the
//! caller. Delivery is synchronous and runs handlers in registration order on
//! a snapshot taken when `publish` starts, so handlers may subscribe,
//! unsubscribe or publish again without affecting the in-flight delivery.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};

use serde_json::Value;

/// Store slice was created via `init`.
pub const STORE_INITED: &str = "store:inited";
/// Store slice was replaced via `set` or `update`.
pub const STORE_CHANGED: &str = "store:changed";
/// Persistence layer finished a save attempt.
pub const PERSISTENCE_STATUS: &str = "persistence:status";

/// An event handler. Identity is the `Arc` allocation, so cloning a handler and
/// subscribing both clones registers it once.
pub type Handler = Arc<dyn Fn(&Value) -> anyhow::Result<()> + Send + Sync>;

/// Wrap a closure as a [`Handler`].
pub fn handler<F>(f: F) -> Handler
where
    F: Fn(&Value) -> anyhow::Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Name of the per-key variant of a namespaced event, e.g. `store:changed:project`.
pub fn keyed(event: &str, key: &str) -> String {
    format!("{}:{}", event, key)
}

#[derive(Clone, Default)]
pub struct EventBus {
    topics: Arc<Mutex<HashMap<String, Vec<Handler>>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `event`. Returns a handle that removes it again.
    pub fn subscribe(&self, event: &str, handler: Handler) -> Subscription {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        let handlers = topics.entry(event.to_string()).or_default();
        if !handlers.iter().any(|h| Arc::ptr_eq(h, &handler)) {
            handlers.push(handler.clone());
        }
        Subscription {
            bus: self.clone(),
            event: event.to_string(),
            handler,
        }
    }

    pub fn unsubscribe(&self, event: &str, handler: &Handler) {
        let mut topics = self.topics.lock().expect("event bus lock poisoned");
        if let Some(handlers) = topics.get_mut(event) {
            handlers.retain(|h| !Arc::ptr_eq(h, handler));
            if handlers.is_empty() {
                topics.remove(event);
            }
        }
    }

    pub fn publish(&self, event: &str, payload: &Value) {
        let snapshot = {
            let topics = self.topics.lock().expect("event bus lock poisoned");
            match topics.get(event) {
                Some(handlers) => handlers.clone(),
                None => return,
            }
        };

        for handler in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(payload))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(event, "event handler failed: {:#}", e),
                Err(_) => tracing::error!(event, "event handler panicked"),
            }
        }
    }

    /// Drop every subscription.
    pub fn clear(&self) {
        self.topics.lock().expect("event bus lock poisoned").clear();
    }

    pub fn subscriber_count(&self, event: &str) -> usize {
        self.topics
            .lock()
            .expect("event bus lock poisoned")
            .get(event)
            .map_or(0, Vec::len)
    }

    pub fn has_topic(&self, event: &str) -> bool {
        self.topics
            .lock()
            .expect("event bus lock poisoned")
            .contains_key(event)
    }
}

/// Handle returned by [`EventBus::subscribe`].
///
/// Dropping it does not unsubscribe; call [`Subscription::unsubscribe`].
pub struct Subscription {
    bus: EventBus,
    event: String,
    handler: Handler,
}

impl Subscription {
    pub fn event(&self) -> &str {
        &self.event
    }

    pub fn unsubscribe(self) {
        self.bus.unsubscribe(&self.event, &self.handler);
    }
}
