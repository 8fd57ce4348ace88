//! Polling sync with change detection.
//!
//! A [`PollingSyncChannel`] fetches one API endpoint immediately and then on
//! every interval tick. Each payload is hashed; the held value is replaced
//! and `on_data_change(new, old)` is invoked only when the hash differs from
//! the previous one. The very first successful fetch establishes the
//! baseline without invoking the callback.
//!
//! # Overlap
//!
//! At most one fetch is in flight. A tick or forced refresh that arrives
//! while a fetch is still pending aborts it, and results are tagged with a
//! generation number so a late reply can never overwrite a newer one.
//!
//! # Teardown
//!
//! [`PollingSyncChannel::stop`] (also run on drop) clears the mounted flag
//! under the same lock that applies results, then waits out a callback that
//! is already running. Once it returns no snapshot update and no callback can
//! happen. The callback runs with no lock held, so it may itself stop or
//! drop the channel.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, ThreadId};
use std::time::Duration;

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use serde_json::Value;
use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::api::ApiClient;
use crate::constants::POLL_INTERVAL;
use crate::error::SyncError;

/// Invoked with `(new, old)` when a polled payload changes.
pub type DataChangeCallback = Box<dyn Fn(&Value, &Value) + Send + Sync>;

/// What to poll and how often.
#[derive(Debug, Clone)]
pub struct PollOptions {
    /// Endpoint path relative to the API base URL.
    pub endpoint: String,
    /// Delay between fetches.
    pub interval: Duration,
    /// When false, nothing is fetched.
    pub enabled: bool,
}

impl PollOptions {
    /// Poll `endpoint` at the default interval.
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            interval: POLL_INTERVAL,
            enabled: true,
        }
    }

    /// Builder-style interval setter.
    #[must_use]
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Builder-style enabled setter.
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }
}

/// SHA-256 hex digest of the canonical JSON form of `value`.
///
/// Object keys serialize in sorted order, so structurally equal payloads
/// hash equally.
pub fn payload_hash(value: &Value) -> String {
    HEXLOWER.encode(&Sha256::digest(value.to_string().as_bytes()))
}

/// Outcome of offering a payload to a [`SyncedResource`].
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// First payload; nothing to compare against.
    Baseline,
    /// Same hash as before. Nothing replaced.
    Unchanged,
    /// Replaced; carries the previous value.
    Changed {
        /// Value before this payload.
        old: Value,
    },
}

/// A remotely sourced value plus the hash of its last payload.
#[derive(Debug, Clone, Default)]
pub struct SyncedResource {
    /// Endpoint the value comes from.
    pub key: String,
    last_payload_hash: Option<String>,
    value: Option<Value>,
    last_updated: Option<DateTime<Utc>>,
}

impl SyncedResource {
    /// Empty resource for `key`.
    pub fn new(key: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            ..Self::default()
        }
    }

    /// Current value.
    pub fn value(&self) -> Option<&Value> {
        self.value.as_ref()
    }

    /// Hash of the last accepted payload.
    pub fn last_payload_hash(&self) -> Option<&str> {
        self.last_payload_hash.as_deref()
    }

    /// When the value last changed.
    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.last_updated
    }

    /// Replace the value only if `payload` differs from the last one.
    pub fn replace_if_changed(&mut self, payload: Value) -> Change {
        let hash = payload_hash(&payload);
        if self.last_payload_hash.as_deref() == Some(hash.as_str()) {
            return Change::Unchanged;
        }

        self.last_payload_hash = Some(hash);
        self.last_updated = Some(Utc::now());
        match self.value.replace(payload) {
            Some(old) => Change::Changed { old },
            None => Change::Baseline,
        }
    }
}

/// Observable state of a polling channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollSnapshot {
    /// Latest payload.
    pub data: Option<Value>,
    /// When `data` last changed.
    pub last_updated: Option<DateTime<Utc>>,
    /// A fetch is in flight.
    pub loading: bool,
    /// Error from the most recent fetch, cleared by the next success.
    pub error: Option<String>,
    /// The driver task is running.
    pub active: bool,
    /// Completed fetches, successful or not.
    pub fetches: u64,
}

struct Inner {
    endpoint: String,
    mounted: AtomicBool,
    snapshot: watch::Sender<PollSnapshot>,
    /// Held while a result is applied; `stop` takes it to fence teardown.
    resource: Mutex<SyncedResource>,
    on_change: Option<DataChangeCallback>,
    /// Held while `on_change` runs.
    callback_fence: Mutex<()>,
    /// Thread running `on_change`, so a `stop` from inside it does not wait
    /// on itself.
    callback_thread: Mutex<Option<ThreadId>>,
}

impl std::fmt::Debug for Inner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Inner")
            .field("endpoint", &self.endpoint)
            .field("mounted", &self.mounted)
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn is_mounted(&self) -> bool {
        self.mounted.load(Ordering::SeqCst)
    }

    fn set_loading(&self) {
        let _guard = self.resource.lock().expect("resource lock poisoned");
        if self.is_mounted() {
            self.snapshot.send_modify(|s| s.loading = true);
        }
    }

    fn apply(&self, result: Result<Value, SyncError>) {
        let (change, value) = {
            let mut resource = self.resource.lock().expect("resource lock poisoned");
            if !self.is_mounted() {
                return;
            }

            match result {
                Ok(payload) => {
                    let change = resource.replace_if_changed(payload);
                    let value = resource.value().cloned();
                    let last_updated = resource.last_updated();

                    self.snapshot.send_modify(|s| {
                        s.loading = false;
                        s.error = None;
                        s.fetches += 1;
                        if change != Change::Unchanged {
                            s.data = value.clone();
                            s.last_updated = last_updated;
                        }
                    });
                    (change, value)
                }
                Err(e) => {
                    log::warn!("[poll] {}: {e}", self.endpoint);
                    self.snapshot.send_modify(|s| {
                        s.loading = false;
                        s.error = Some(e.to_string());
                        s.fetches += 1;
                    });
                    return;
                }
            }
        };

        match change {
            Change::Changed { old } => {
                log::debug!("[poll] {} changed", self.endpoint);
                if let (Some(callback), Some(new)) = (&self.on_change, value.as_ref()) {
                    self.notify(callback, new, &old);
                }
            }
            Change::Baseline => log::debug!("[poll] {} baseline loaded", self.endpoint),
            Change::Unchanged => {}
        }
    }

    fn notify(&self, callback: &DataChangeCallback, new: &Value, old: &Value) {
        let _fence = self.callback_fence.lock().expect("callback fence poisoned");
        if !self.is_mounted() {
            return;
        }

        self.set_callback_thread(Some(thread::current().id()));
        callback(new, old);
        self.set_callback_thread(None);
    }

    fn set_callback_thread(&self, id: Option<ThreadId>) {
        *self
            .callback_thread
            .lock()
            .expect("callback thread lock poisoned") = id;
    }

    /// Wait for a running callback to finish, unless we are inside it.
    fn wait_for_callback(&self) {
        let current = thread::current().id();
        let inside = *self
            .callback_thread
            .lock()
            .expect("callback thread lock poisoned")
            == Some(current);
        if !inside {
            drop(self.callback_fence.lock().expect("callback fence poisoned"));
        }
    }
}

/// Periodically fetches one endpoint and reports genuine changes.
#[derive(Debug)]
pub struct PollingSyncChannel {
    inner: Arc<Inner>,
    refresh_tx: Option<mpsc::UnboundedSender<()>>,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl PollingSyncChannel {
    /// Start polling. Fetches immediately when enabled.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(
        api: ApiClient,
        options: PollOptions,
        on_change: Option<DataChangeCallback>,
    ) -> Self {
        let (snapshot, _rx) = watch::channel(PollSnapshot {
            active: options.enabled,
            ..PollSnapshot::default()
        });

        let inner = Arc::new(Inner {
            endpoint: options.endpoint.clone(),
            mounted: AtomicBool::new(true),
            snapshot,
            resource: Mutex::new(SyncedResource::new(options.endpoint.clone())),
            on_change,
            callback_fence: Mutex::new(()),
            callback_thread: Mutex::new(None),
        });
        let cancel = CancellationToken::new();

        if !options.enabled {
            log::debug!("[poll] {} disabled", options.endpoint);
            return Self {
                inner,
                refresh_tx: None,
                cancel,
                task: Mutex::new(None),
            };
        }

        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(drive(
            api,
            options,
            Arc::clone(&inner),
            refresh_rx,
            cancel.clone(),
        ));

        Self {
            inner,
            refresh_tx: Some(refresh_tx),
            cancel,
            task: Mutex::new(Some(task)),
        }
    }

    /// Fetch now, out of band. Returns `false` when not running.
    pub fn force_refresh(&self) -> bool {
        self.inner.is_mounted()
            && self
                .refresh_tx
                .as_ref()
                .is_some_and(|tx| tx.send(()).is_ok())
    }

    /// Stop polling. No snapshot update or callback happens afterwards.
    pub fn stop(&self) {
        {
            let _guard = self.inner.resource.lock().expect("resource lock poisoned");
            self.inner.mounted.store(false, Ordering::SeqCst);
        }
        self.inner.wait_for_callback();
        self.cancel.cancel();
        if let Some(task) = self.task.lock().expect("task lock poisoned").take() {
            task.abort();
        }
        self.inner.snapshot.send_modify(|s| {
            s.active = false;
            s.loading = false;
        });
    }

    /// Current state.
    pub fn snapshot(&self) -> PollSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    /// Observe state changes.
    pub fn subscribe(&self) -> watch::Receiver<PollSnapshot> {
        self.inner.snapshot.subscribe()
    }

    /// Whether polling is running.
    pub fn is_active(&self) -> bool {
        self.inner.snapshot.borrow().active
    }
}

impl Drop for PollingSyncChannel {
    fn drop(&mut self) {
        if self.inner.is_mounted() {
            self.stop();
        }
    }
}

/// Driver loop: ticks, forced refreshes, and fetch results.
async fn drive(
    api: ApiClient,
    options: PollOptions,
    inner: Arc<Inner>,
    mut refresh_rx: mpsc::UnboundedReceiver<()>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(options.interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<(u64, Result<Value, SyncError>)>();
    let mut generation: u64 = 0;
    let mut in_flight: Option<JoinHandle<()>> = None;

    loop {
        let fetch_now = tokio::select! {
            biased;

            () = cancel.cancelled() => break,

            Some((fetch_generation, result)) = result_rx.recv() => {
                if fetch_generation == generation {
                    in_flight = None;
                    inner.apply(result);
                } else {
                    log::debug!("[poll] Discarding stale result for {}", options.endpoint);
                }
                false
            }

            Some(()) = refresh_rx.recv() => true,

            _ = ticker.tick() => true,
        };

        if !fetch_now {
            continue;
        }

        if let Some(previous) = in_flight.take() {
            log::debug!("[poll] Superseding in-flight fetch of {}", options.endpoint);
            previous.abort();
        }

        generation += 1;
        inner.set_loading();

        let api = api.clone();
        let endpoint = options.endpoint.clone();
        let tx = result_tx.clone();
        let fetch_generation = generation;
        in_flight = Some(tokio::spawn(async move {
            let result = api.get_json(&endpoint).await;
            let _ = tx.send((fetch_generation, result));
        }));
    }

    if let Some(pending) = in_flight {
        pending.abort();
    }
}
