//! In-process shared store.

// Rust guideline compliant 2026-02

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use tokio::sync::mpsc;

use super::{KeyValueStore, StorageEvent, StorageEvents};

#[derive(Debug, Default)]
struct Shared {
    map: Mutex<HashMap<String, String>>,
    /// Subscribers tagged with the id of the handle that owns them.
    watchers: Mutex<Vec<(u64, mpsc::UnboundedSender<StorageEvent>)>>,
    next_handle: AtomicU64,
}

/// A handle onto an in-memory map shared by every fork.
///
/// Each handle plays the part of one "tab": writes through it are reported
/// to watchers of every other handle, never to its own.
#[derive(Debug)]
pub struct MemoryStore {
    id: u64,
    shared: Arc<Shared>,
    writes: AtomicUsize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::with_shared(Arc::new(Shared::default()))
    }

    fn with_shared(shared: Arc<Shared>) -> Self {
        let id = shared.next_handle.fetch_add(1, Ordering::Relaxed);
        Self {
            id,
            shared,
            writes: AtomicUsize::new(0),
        }
    }

    /// Open another handle over the same data.
    #[must_use]
    pub fn fork(&self) -> Self {
        Self::with_shared(Arc::clone(&self.shared))
    }

    /// Number of `set`/`remove` calls made through this handle.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    fn publish(&self, key: &str, old_value: Option<String>, new_value: Option<String>) {
        let mut watchers = self.shared.watchers.lock().expect("watchers lock poisoned");
        watchers.retain(|(owner, tx)| {
            if *owner == self.id {
                return !tx.is_closed();
            }
            tx.send(StorageEvent {
                key: key.to_string(),
                new_value: new_value.clone(),
                old_value: old_value.clone(),
            })
            .is_ok()
        });
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        let map = self.shared.map.lock().expect("map lock poisoned");
        Ok(map.get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let old = self
            .shared
            .map
            .lock()
            .expect("map lock poisoned")
            .insert(key.to_string(), value.to_string());
        self.publish(key, old, Some(value.to_string()));
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let old = self.shared.map.lock().expect("map lock poisoned").remove(key);
        if old.is_some() {
            self.publish(key, old, None);
        }
        Ok(())
    }

    fn watch(&self) -> Result<StorageEvents> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .watchers
            .lock()
            .expect("watchers lock poisoned")
            .push((self.id, tx));
        Ok(rx)
    }
}
