//! Persisted key-value storage.
//!
//! The sync layer persists shared state and the auth token in a small
//! string-to-string store. Several handles (processes, or forked handles in
//! one process) may share the same backing storage; each handle can
//! [`watch`](KeyValueStore::watch) for changes made by the *others*, which
//! is how broadcast channels converge across processes.
//!
//! # Backends
//!
//! - [`MemoryStore`]: shared in-process map. `fork()` opens another handle.
//! - [`FileStore`]: JSON object in a file, watched with `notify`.
//!
//! Writes are last-writer-wins per key.

// Rust guideline compliant 2026-02

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::sync::Arc;

use anyhow::Result;
use tokio::sync::mpsc;

use crate::constants::AUTH_TOKEN_KEY;

/// A change made to the store by another handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageEvent {
    /// Key that changed.
    pub key: String,
    /// New value, `None` when removed.
    pub new_value: Option<String>,
    /// Previous value as this handle knew it.
    pub old_value: Option<String>,
}

/// Stream of [`StorageEvent`]s. Dropping it ends the subscription.
pub type StorageEvents = mpsc::UnboundedReceiver<StorageEvent>;

/// String key-value storage shared between handles.
pub trait KeyValueStore: Send + Sync + std::fmt::Debug {
    /// Read a value.
    fn get(&self, key: &str) -> Result<Option<String>>;

    /// Write a value.
    fn set(&self, key: &str, value: &str) -> Result<()>;

    /// Delete a value. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    /// Subscribe to changes made through other handles.
    ///
    /// Writes made through this handle are never reported back to it.
    fn watch(&self) -> Result<StorageEvents>;
}

/// Auth token storage under the application-scoped key.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    store: Arc<dyn KeyValueStore>,
}

impl CredentialStore {
    /// Wrap a store.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    /// The saved bearer token, if any. Blank tokens count as missing.
    pub fn token(&self) -> Result<Option<String>> {
        Ok(self
            .store
            .get(AUTH_TOKEN_KEY)?
            .filter(|token| !token.trim().is_empty()))
    }

    /// Save the bearer token.
    pub fn set_token(&self, token: &str) -> Result<()> {
        self.store.set(AUTH_TOKEN_KEY, token)
    }

    /// Forget the bearer token.
    pub fn clear_token(&self) -> Result<()> {
        self.store.remove(AUTH_TOKEN_KEY)
    }
}
