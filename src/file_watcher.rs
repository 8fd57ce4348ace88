//! File change monitoring for persisted storage.
//!
//! Provides a [`FileWatcher`] backed by OS-native mechanisms (kqueue on
//! macOS, inotify on Linux) via the `notify` crate. The watcher observes
//! the parent directory of a single file so that atomic replace-by-rename
//! writes are seen, and forwards only events about that file over a tokio
//! channel.
//!
//! This is the cross-process change signal behind
//! [`FileStore::watch`](crate::storage::FileStore).

// Rust guideline compliant 2026-02

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

/// Classification of a file system event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileEventKind {
    /// The file was created (including being renamed into place).
    Create,
    /// File content or metadata was modified.
    Modify,
    /// The file was renamed or moved.
    Rename,
    /// The file was deleted.
    Delete,
    /// Access events, watcher-internal events, etc.
    Other,
}

impl FileEventKind {
    /// Whether the event can have changed the file's contents.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Other)
    }
}

/// A single file system event with path and classification.
#[derive(Debug, Clone)]
pub struct FileEvent {
    /// Path of the affected file.
    pub path: PathBuf,
    /// What happened to the file.
    pub kind: FileEventKind,
}

/// Watches one file for changes.
pub struct FileWatcher {
    // Dropping the watcher stops delivery.
    _watcher: RecommendedWatcher,
    rx: mpsc::UnboundedReceiver<FileEvent>,
}

impl std::fmt::Debug for FileWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileWatcher").finish_non_exhaustive()
    }
}

impl FileWatcher {
    /// Start watching `path`.
    ///
    /// The file itself need not exist yet, but its parent directory must.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS file watcher cannot be initialized or the
    /// parent directory cannot be watched.
    pub fn watch_file(path: &Path) -> Result<Self> {
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
            .to_path_buf();
        let file_name: OsString = path
            .file_name()
            .with_context(|| format!("Not a file path: {}", path.display()))?
            .to_os_string();

        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    for file_event in Self::classify_event(&event) {
                        if file_event.path.file_name() == Some(file_name.as_os_str()) {
                            let _ = tx.send(file_event);
                        }
                    }
                }
                Err(e) => log::warn!("File watcher error: {e}"),
            }
        })
        .context("Failed to create file watcher")?;

        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("Failed to watch: {}", dir.display()))?;

        log::debug!("Watching for file changes: {:?}", path);
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    /// Wait for the next event about the watched file.
    pub async fn recv(&mut self) -> Option<FileEvent> {
        self.rx.recv().await
    }

    /// Drain buffered events without waiting.
    #[must_use]
    pub fn poll(&mut self) -> Vec<FileEvent> {
        let mut events = Vec::new();
        while let Ok(event) = self.rx.try_recv() {
            events.push(event);
        }
        events
    }

    /// Split a raw `notify::Event` into per-path [`FileEvent`] items.
    pub fn classify_event(event: &notify::Event) -> Vec<FileEvent> {
        let kind = Self::classify(&event.kind);
        event
            .paths
            .iter()
            .map(|p| FileEvent {
                path: p.clone(),
                kind,
            })
            .collect()
    }

    /// Map `notify::EventKind` to [`FileEventKind`].
    fn classify(kind: &notify::EventKind) -> FileEventKind {
        match kind {
            notify::EventKind::Create(_) => FileEventKind::Create,
            notify::EventKind::Modify(notify::event::ModifyKind::Name(_)) => FileEventKind::Rename,
            notify::EventKind::Modify(_) => FileEventKind::Modify,
            notify::EventKind::Remove(_) => FileEventKind::Delete,
            _ => FileEventKind::Other,
        }
    }
}
