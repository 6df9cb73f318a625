//! Keyed state store with change notification.
//!
//! Slices are `serde_json::Value`s, so only JSON-safe state can be stored and
//! every copy the store hands out or takes in is a plain structural clone.
//! Callers never get a reference into the stored value.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};

use crate::bus::{self, EventBus};

#[derive(Clone, Default)]
pub struct Store {
    slices: Arc<Mutex<BTreeMap<String, Value>>>,
    bus: Option<EventBus>,
}

impl Store {
    /// A store that publishes nothing.
    pub fn new() -> Self {
        Self::default()
    }

    /// A store that publishes `store:*` events on `bus`.
    pub fn with_bus(bus: EventBus) -> Self {
        Self {
            slices: Arc::default(),
            bus: Some(bus),
        }
    }

    pub fn bus(&self) -> Option<&EventBus> {
        self.bus.as_ref()
    }

    pub fn has(&self, key: &str) -> bool {
        self.slices
            .lock()
            .expect("store lock poisoned")
            .contains_key(key)
    }

    /// Copy of the slice under `key`.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.slices
            .lock()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.slices
            .lock()
            .expect("store lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// Create the slice if it does not exist yet. Returns `false` when the slice
    /// was already present and nothing changed.
    pub fn init(&self, key: &str, initial: &Value) -> bool {
        let state = {
            let mut slices = self.slices.lock().expect("store lock poisoned");
            if slices.contains_key(key) {
                return false;
            }
            slices.insert(key.to_string(), initial.clone());
            initial.clone()
        };
        tracing::debug!(key, "store slice initialised");
        self.emit(bus::STORE_INITED, key, state);
        true
    }

    /// Replace the slice wholesale.
    pub fn set(&self, key: &str, value: Value) {
        let state = value.clone();
        self.slices
            .lock()
            .expect("store lock poisoned")
            .insert(key.to_string(), value);
        self.emit(bus::STORE_CHANGED, key, state);
    }

    /// Copy-on-write mutation. The mutator works on a draft copied from the
    /// current slice (`null` if absent); the draft becomes the new slice.
    pub fn update<F>(&self, key: &str, mutator: F)
    where
        F: FnOnce(&mut Value),
    {
        let mut draft = self.get(key).unwrap_or(Value::Null);
        mutator(&mut draft);
        self.set(key, draft);
    }

    /// Deep copy of the whole store.
    pub fn snapshot(&self) -> BTreeMap<String, Value> {
        self.slices.lock().expect("store lock poisoned").clone()
    }

    fn emit(&self, event: &str, key: &str, state: Value) {
        let Some(bus) = &self.bus else {
            return;
        };
        let payload = json!({ "key": key, "state": state });
        bus.publish(event, &payload);
        bus.publish(&bus::keyed(event, key), &payload);
    }
}
