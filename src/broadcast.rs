//! Named state shared across consumers and processes.
//!
//! A [`BroadcastHub`] owns one slot per key: the single in-memory copy of
//! that key's value in this process. Consumers open a
//! [`LocalBroadcastChannel`] on a key to read it, write it, and be told when
//! it changes.
//!
//! # Propagation
//!
//! ```text
//!  process A                                   process B
//!  channel.update_data(v)                      storage listener
//!    ├── identical to slot? ── no-op             │
//!    ├── store.set(key, json) ───── storage ───► StorageEvent
//!    ├── slot = v                                ├── slot = v
//!    ├── bus: BroadcastEvent(Local)              ├── local callbacks
//!    └── own callback, then other consumers      └── bus: BroadcastEvent(Remote)
//! ```
//!
//! Remote changes are applied and announced locally but never written back
//! to storage, so they cannot bounce between processes.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::constants::BROADCAST_BUS_CAPACITY;
use crate::error::SyncError;
use crate::storage::{KeyValueStore, StorageEvent};

/// Invoked with `(new, old)` when a key's value changes.
pub type BroadcastCallback = Arc<dyn Fn(&Value, Option<&Value>) + Send + Sync>;

/// Where a change came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    /// `update_data` on the channel with this id, in this process.
    Local(Uuid),
    /// Another process (or store handle) wrote the key.
    Remote,
}

/// A change to one key, published on the hub's in-process bus.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastEvent {
    /// Key that changed.
    pub key: String,
    /// New value (`null` when removed remotely).
    pub new_data: Value,
    /// Previous value, if any.
    pub old_data: Option<Value>,
    /// Who made the change.
    pub origin: Origin,
}

struct Slot {
    value: Option<Value>,
    /// Compact serialization of `value`, compared on every update.
    serialized: Option<String>,
    consumers: usize,
    callbacks: Vec<(Uuid, BroadcastCallback)>,
}

struct HubInner {
    store: Arc<dyn KeyValueStore>,
    slots: Mutex<HashMap<String, Slot>>,
    bus: broadcast::Sender<BroadcastEvent>,
}

/// Registry of shared keys for one process.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl std::fmt::Debug for BroadcastHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let keys: Vec<String> = self
            .inner
            .slots
            .lock()
            .map(|slots| slots.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("BroadcastHub")
            .field("store", &self.inner.store)
            .field("keys", &keys)
            .finish()
    }
}

impl BroadcastHub {
    /// Create a hub persisting through `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        let (bus, _rx) = broadcast::channel(BROADCAST_BUS_CAPACITY);
        Self {
            inner: Arc::new(HubInner {
                store,
                slots: Mutex::new(HashMap::new()),
                bus,
            }),
        }
    }

    /// Open a channel on `key`.
    ///
    /// The first channel on a key loads its persisted value. A stored value
    /// that is not valid JSON is logged and treated as absent.
    pub fn channel(
        &self,
        key: impl Into<String>,
        on_data_change: Option<BroadcastCallback>,
    ) -> LocalBroadcastChannel {
        let key = key.into();
        let id = Uuid::new_v4();

        let mut slots = self.inner.slots.lock().expect("slots lock poisoned");
        let slot = slots
            .entry(key.clone())
            .or_insert_with(|| self.load_slot(&key));
        slot.consumers += 1;
        if let Some(callback) = on_data_change {
            slot.callbacks.push((id, callback));
        }
        drop(slots);

        log::debug!("[broadcast] Opened channel {} on '{}'", id, key);
        LocalBroadcastChannel {
            id,
            key,
            hub: self.clone(),
        }
    }

    fn load_slot(&self, key: &str) -> Slot {
        let value = match self.inner.store.get(key) {
            Ok(Some(raw)) => match serde_json::from_str::<Value>(&raw) {
                Ok(value) => Some(value),
                Err(e) => {
                    log::warn!("[broadcast] Ignoring corrupt stored value for '{key}': {e}");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                log::warn!("[broadcast] Failed to read '{key}': {e}");
                None
            }
        };

        Slot {
            serialized: value.as_ref().map(Value::to_string),
            value,
            consumers: 0,
            callbacks: Vec::new(),
        }
    }

    /// Current value of `key`, if a channel has it open.
    pub fn value(&self, key: &str) -> Option<Value> {
        self.inner
            .slots
            .lock()
            .expect("slots lock poisoned")
            .get(key)
            .and_then(|slot| slot.value.clone())
    }

    /// Observe every change in this process.
    pub fn subscribe(&self) -> broadcast::Receiver<BroadcastEvent> {
        self.inner.bus.subscribe()
    }

    /// Apply changes made by other processes as they arrive.
    ///
    /// Must be called from within a tokio runtime. The task ends when the
    /// hub is dropped or the store stops reporting.
    pub fn spawn_storage_listener(&self) -> anyhow::Result<JoinHandle<()>> {
        let mut events = self.inner.store.watch()?;
        let hub: Weak<HubInner> = Arc::downgrade(&self.inner);

        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                let Some(inner) = hub.upgrade() else { break };
                BroadcastHub { inner }.apply_remote(event);
            }
            log::debug!("[broadcast] Storage listener stopped");
        }))
    }

    /// Replace a slot from a storage event. Never writes back.
    fn apply_remote(&self, event: StorageEvent) {
        let new_value = match event
            .new_value
            .as_deref()
            .map(|raw| serde_json::from_str::<Value>(raw))
        {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                log::warn!("[broadcast] Ignoring corrupt remote value for '{}': {e}", event.key);
                return;
            }
            None => Value::Null,
        };
        let serialized = new_value.to_string();

        let (old, callbacks) = {
            let mut slots = self.inner.slots.lock().expect("slots lock poisoned");
            let Some(slot) = slots.get_mut(&event.key) else {
                return;
            };
            if slot.serialized.as_deref() == Some(serialized.as_str()) {
                return;
            }
            slot.serialized = Some(serialized);
            let old = slot.value.replace(new_value.clone());
            let callbacks: Vec<BroadcastCallback> =
                slot.callbacks.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (old, callbacks)
        };

        log::debug!("[broadcast] '{}' changed remotely", event.key);
        for callback in &callbacks {
            callback(&new_value, old.as_ref());
        }

        let _ = self.inner.bus.send(BroadcastEvent {
            key: event.key,
            new_data: new_value,
            old_data: old,
            origin: Origin::Remote,
        });
    }

    fn update(&self, channel_id: Uuid, key: &str, value: Value) -> Result<bool, SyncError> {
        let serialized = serde_json::to_string(&value)?;

        let (old, own, others) = {
            let mut slots = self.inner.slots.lock().expect("slots lock poisoned");
            let slot = slots
                .get_mut(key)
                .ok_or_else(|| SyncError::Storage(format!("no open channel for '{key}'")))?;

            if slot.serialized.as_deref() == Some(serialized.as_str()) {
                log::debug!("[broadcast] '{key}' unchanged, skipping write");
                return Ok(false);
            }

            self.inner
                .store
                .set(key, &serialized)
                .map_err(|e| SyncError::Storage(e.to_string()))?;

            slot.serialized = Some(serialized);
            let old = slot.value.replace(value.clone());

            let (own, others): (Vec<_>, Vec<_>) = slot
                .callbacks
                .iter()
                .map(|(id, cb)| (*id, Arc::clone(cb)))
                .partition(|(id, _)| *id == channel_id);
            (old, own, others)
        };

        let _ = self.inner.bus.send(BroadcastEvent {
            key: key.to_string(),
            new_data: value.clone(),
            old_data: old.clone(),
            origin: Origin::Local(channel_id),
        });

        for (_, callback) in own.iter().chain(others.iter()) {
            callback(&value, old.as_ref());
        }
        Ok(true)
    }

    fn close(&self, channel_id: Uuid, key: &str) {
        let Ok(mut slots) = self.inner.slots.lock() else {
            return;
        };
        if let Some(slot) = slots.get_mut(key) {
            slot.callbacks.retain(|(id, _)| *id != channel_id);
            slot.consumers = slot.consumers.saturating_sub(1);
            if slot.consumers == 0 {
                slots.remove(key);
            }
        }
    }
}

/// One consumer's view of a shared key. Dropping it unregisters.
pub struct LocalBroadcastChannel {
    id: Uuid,
    key: String,
    hub: BroadcastHub,
}

impl std::fmt::Debug for LocalBroadcastChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalBroadcastChannel")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

impl LocalBroadcastChannel {
    /// Channel id, used as the origin of local events.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Shared key.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Current value.
    pub fn data(&self) -> Option<Value> {
        self.hub.value(&self.key)
    }

    /// Set the shared value.
    ///
    /// Returns `Ok(false)` without writing or notifying when the value
    /// serializes identically to the current one. On a storage failure the
    /// in-memory value is left unchanged.
    pub fn update_data(&self, value: Value) -> Result<bool, SyncError> {
        self.hub.update(self.id, &self.key, value)
    }
}

impl Drop for LocalBroadcastChannel {
    fn drop(&mut self) {
        self.hub.close(self.id, &self.key);
        log::debug!("[broadcast] Closed channel {} on '{}'", self.id, self.key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use serde_json::json;
    use std::time::Duration;

    type Calls = Arc<Mutex<Vec<(Value, Option<Value>)>>>;

    fn recording() -> (BroadcastCallback, Calls) {
        let calls: Calls = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&calls);
        let callback: BroadcastCallback = Arc::new(move |new: &Value, old: Option<&Value>| {
            sink.lock().unwrap().push((new.clone(), old.cloned()));
        });
        (callback, calls)
    }

    #[test]
    fn test_identical_update_is_noop() {
        let store = Arc::new(MemoryStore::new());
        let hub = BroadcastHub::new(store.clone());
        let (callback, calls) = recording();
        let channel = hub.channel("cart", Some(callback));

        assert!(channel.update_data(json!({"v": 1})).unwrap());
        assert_eq!(calls.lock().unwrap().len(), 1);

        assert!(!channel.update_data(json!({"v": 1})).unwrap());
        assert_eq!(store.writes(), 1);
        assert_eq!(calls.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_update_persists_compact_json() {
        let store = Arc::new(MemoryStore::new());
        let hub = BroadcastHub::new(store.clone());
        let channel = hub.channel("cart", None);

        channel.update_data(json!({"b": 2, "a": 1})).unwrap();
        assert_eq!(store.get("cart").unwrap().as_deref(), Some(r#"{"a":1,"b":2}"#));
        assert_eq!(channel.data(), Some(json!({"a": 1, "b": 2})));
    }

    #[test]
    fn test_initial_value_loaded_from_store() {
        let store = Arc::new(MemoryStore::new());
        store.set("prefs", r#"{ "theme": "dark" }"#).unwrap();
        let hub = BroadcastHub::new(store.clone());

        let channel = hub.channel("prefs", None);
        assert_eq!(channel.data(), Some(json!({"theme": "dark"})));

        // Same value with different formatting is not a change.
        assert!(!channel.update_data(json!({"theme": "dark"})).unwrap());
        assert_eq!(store.writes(), 1);
    }

    #[test]
    fn test_corrupt_initial_value_is_absent() {
        let store = Arc::new(MemoryStore::new());
        store.set("prefs", "{not json").unwrap();
        let hub = BroadcastHub::new(store);

        let channel = hub.channel("prefs", None);
        assert_eq!(channel.data(), None);
        assert!(channel.update_data(json!(1)).unwrap());
    }

    #[test]
    fn test_local_consumers_share_one_copy() {
        let hub = BroadcastHub::new(Arc::new(MemoryStore::new()));
        let (cb_a, calls_a) = recording();
        let (cb_b, calls_b) = recording();
        let a = hub.channel("cart", Some(cb_a));
        let b = hub.channel("cart", Some(cb_b));

        a.update_data(json!([1])).unwrap();

        assert_eq!(b.data(), Some(json!([1])));
        assert_eq!(calls_a.lock().unwrap().clone(), vec![(json!([1]), None)]);
        assert_eq!(calls_b.lock().unwrap().clone(), vec![(json!([1]), None)]);
    }

    #[derive(Debug)]
    struct FullStore;

    impl KeyValueStore for FullStore {
        fn get(&self, _key: &str) -> anyhow::Result<Option<String>> {
            Ok(None)
        }

        fn set(&self, _key: &str, _value: &str) -> anyhow::Result<()> {
            anyhow::bail!("quota exceeded")
        }

        fn remove(&self, _key: &str) -> anyhow::Result<()> {
            Ok(())
        }

        fn watch(&self) -> anyhow::Result<crate::storage::StorageEvents> {
            let (_tx, rx) = tokio::sync::mpsc::unbounded_channel();
            Ok(rx)
        }
    }

    #[test]
    fn test_failed_write_leaves_memory_untouched() {
        let hub = BroadcastHub::new(Arc::new(FullStore));
        let (callback, calls) = recording();
        let channel = hub.channel("cart", Some(callback));

        let result = channel.update_data(json!({"v": 1}));

        assert!(matches!(result, Err(SyncError::Storage(_))));
        assert_eq!(channel.data(), None);
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_dropped_channel_stops_receiving() {
        let hub = BroadcastHub::new(Arc::new(MemoryStore::new()));
        let (callback, calls) = recording();
        let writer = hub.channel("cart", None);
        let reader = hub.channel("cart", Some(callback));

        drop(reader);
        writer.update_data(json!(5)).unwrap();
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_last_close_releases_slot() {
        let store = Arc::new(MemoryStore::new());
        let hub = BroadcastHub::new(store.clone());
        let channel = hub.channel("cart", None);
        channel.update_data(json!(1)).unwrap();
        drop(channel);

        assert_eq!(hub.value("cart"), None);
        // Reopening reloads from storage.
        assert_eq!(hub.channel("cart", None).data(), Some(json!(1)));
    }

    #[tokio::test]
    async fn test_bus_reports_local_origin() {
        let hub = BroadcastHub::new(Arc::new(MemoryStore::new()));
        let mut bus = hub.subscribe();
        let channel = hub.channel("cart", None);

        channel.update_data(json!({"v": 1})).unwrap();

        let event = bus.recv().await.unwrap();
        assert_eq!(event.key, "cart");
        assert_eq!(event.new_data, json!({"v": 1}));
        assert_eq!(event.old_data, None);
        assert_eq!(event.origin, Origin::Local(channel.id()));
    }

    #[tokio::test]
    async fn test_remote_update_converges_without_rebroadcast() {
        let store_a = Arc::new(MemoryStore::new());
        let store_b = Arc::new(store_a.fork());
        let hub_a = BroadcastHub::new(store_a.clone());
        let hub_b = BroadcastHub::new(store_b.clone());
        let listener_a = hub_a.spawn_storage_listener().unwrap();
        let listener_b = hub_b.spawn_storage_listener().unwrap();

        let (callback_b, calls_b) = recording();
        let channel_a = hub_a.channel("shared", None);
        let channel_b = hub_b.channel("shared", Some(callback_b));
        let mut bus_a = hub_a.subscribe();
        let mut bus_b = hub_b.subscribe();

        channel_a.update_data(json!({"v": 1})).unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), bus_b.recv())
            .await
            .expect("timed out waiting for remote event")
            .unwrap();
        assert_eq!(event.origin, Origin::Remote);
        assert_eq!(channel_b.data(), Some(json!({"v": 1})));
        assert_eq!(calls_b.lock().unwrap().clone(), vec![(json!({"v": 1}), None)]);

        // B applied the change without writing it back.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(store_b.writes(), 0);
        assert_eq!(store_a.writes(), 1);
        let local = bus_a.recv().await.unwrap();
        assert_eq!(local.origin, Origin::Local(channel_a.id()));
        assert!(bus_a.try_recv().is_err());

        listener_a.abort();
        listener_b.abort();
    }

    #[tokio::test]
    async fn test_remote_event_for_unopened_key_is_ignored() {
        let store_a = Arc::new(MemoryStore::new());
        let hub_b = BroadcastHub::new(Arc::new(store_a.fork()));
        let listener = hub_b.spawn_storage_listener().unwrap();
        let mut bus_b = hub_b.subscribe();

        store_a.set("other", "1").unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(bus_b.try_recv().is_err());
        assert_eq!(hub_b.value("other"), None);
        listener.abort();
    }
}
