//! File-backed store shared between processes.
//!
//! The whole store is one JSON object (`{"key": "value", ...}`). Every write
//! is a read-modify-write of that object under an exclusive lock on a
//! sidecar `<file>.lock`, so concurrent writers to different keys never lose
//! each other's changes. The new contents go to a fresh temp file in the same
//! directory which is then renamed over the store, so readers never see a
//! partial file.
//!
//! Each handle keeps a cache of the values it last knew; on a file change the
//! watcher reloads the file and reports every key whose value differs from
//! that cache. Own writes update the cache under the same lock the watcher
//! diffs under, so they are never reported back.

// Rust guideline compliant 2026-02

use std::collections::{BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs::{self, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tokio::sync::mpsc;

use super::{KeyValueStore, StorageEvent, StorageEvents};
use crate::file_watcher::FileWatcher;

type Map = HashMap<String, String>;

/// JSON-file store.
#[derive(Debug)]
pub struct FileStore {
    path: PathBuf,
    lock_path: PathBuf,
    /// Values as this handle last knew them.
    known: Arc<Mutex<Map>>,
    writes: AtomicUsize,
}

impl FileStore {
    /// Open (or lazily create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the parent directory cannot be created or an
    /// existing store file cannot be read.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
        let known = load_map(&path)?.unwrap_or_default();

        Ok(Self {
            lock_path: sidecar(&path, ".lock"),
            path,
            known: Arc::new(Mutex::new(known)),
            writes: AtomicUsize::new(0),
        })
    }

    /// Location of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of `set`/`remove` calls made through this handle.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Read-modify-write under the handle's cache lock and the
    /// cross-process file lock.
    ///
    /// Fails without writing when the current file cannot be read. A file
    /// that is not a JSON object is copied to `<file>.corrupt` before being
    /// replaced.
    fn modify(&self, key: &str, value: Option<&str>) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut known = self.known.lock().expect("known lock poisoned");

        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&self.lock_path)
            .with_context(|| format!("Failed to open {}", self.lock_path.display()))?;
        let mut lock = fd_lock::RwLock::new(lock_file);
        let _guard = lock
            .write()
            .with_context(|| format!("Failed to lock {}", self.lock_path.display()))?;

        let mut map = load_map(&self.path)?.unwrap_or_default();
        match value {
            Some(v) => {
                map.insert(key.to_string(), v.to_string());
            }
            None => {
                map.remove(key);
            }
        }
        write_map(&self.path, &map)?;

        match value {
            Some(v) => known.insert(key.to_string(), v.to_string()),
            None => known.remove(key),
        };
        Ok(())
    }
}

impl KeyValueStore for FileStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(load_map(&self.path)?.and_then(|mut map| map.remove(key)))
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        self.modify(key, Some(value))
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.modify(key, None)
    }

    /// Must be called from within a tokio runtime.
    fn watch(&self) -> Result<StorageEvents> {
        let mut watcher = FileWatcher::watch_file(&self.path)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let path = self.path.clone();
        let known = Arc::clone(&self.known);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    event = watcher.recv() => {
                        let Some(event) = event else { break };
                        if !event.kind.is_mutation() {
                            continue;
                        }
                        // Coalesce bursts from a single rewrite.
                        let _ = watcher.poll();

                        let changes = match refresh(&known, &path) {
                            Ok(changes) => changes,
                            Err(e) => {
                                log::warn!("Skipping storage reload: {e:#}");
                                continue;
                            }
                        };
                        for change in changes {
                            if tx.send(change).is_err() {
                                return;
                            }
                        }
                    }
                }
            }
            log::debug!("Storage watcher for {} stopped", path.display());
        });

        Ok(rx)
    }
}

/// Reload the file and diff it against `known`.
///
/// The file is read while `known` is held so an own write cannot land
/// between the read and the diff.
fn refresh(known: &Mutex<Map>, path: &Path) -> Result<Vec<StorageEvent>> {
    let mut known = known.lock().expect("known lock poisoned");
    let current = load_map(path)?.unwrap_or_default();
    Ok(diff_against(&mut known, current))
}

/// Replace `known` with `current`, returning one event per changed key.
fn diff_against(known: &mut Map, current: Map) -> Vec<StorageEvent> {
    let keys: BTreeSet<&String> = known.keys().chain(current.keys()).collect();
    let changes = keys
        .into_iter()
        .filter(|key| known.get(*key) != current.get(*key))
        .map(|key| StorageEvent {
            key: key.clone(),
            new_value: current.get(key).cloned(),
            old_value: known.get(key).cloned(),
        })
        .collect();

    *known = current;
    changes
}

/// Load the map.
///
/// A missing file is `Ok(Some(empty))`. A corrupt file is backed up to
/// `<file>.corrupt`, logged, and read as `Ok(None)`. Any other I/O error is
/// returned.
fn load_map(path: &Path) -> Result<Option<Map>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Some(Map::new())),
        Err(e) => return Err(e).with_context(|| format!("Failed to read {}", path.display())),
    };

    match serde_json::from_str(&content) {
        Ok(map) => Ok(Some(map)),
        Err(e) => {
            let backup = sidecar(path, ".corrupt");
            log::warn!(
                "Corrupt storage file {} ({e}), saving a copy to {}",
                path.display(),
                backup.display()
            );
            fs::write(&backup, content.as_bytes())
                .with_context(|| format!("Failed to back up {}", path.display()))?;
            Ok(None)
        }
    }
}

fn write_map(path: &Path, map: &Map) -> Result<()> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("Failed to create temp file in {}", dir.display()))?;
    tmp.write_all(serde_json::to_string_pretty(map)?.as_bytes())
        .with_context(|| format!("Failed to write {}", tmp.path().display()))?;
    tmp.as_file().sync_all()?;

    // Owner read/write only: the auth token lives here.
    #[cfg(unix)]
    fs::set_permissions(tmp.path(), fs::Permissions::from_mode(0o600))?;

    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

/// `<path><suffix>`, e.g. `storage.json.lock`.
fn sidecar(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}
