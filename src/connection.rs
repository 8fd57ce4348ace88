//! Reconnecting realtime WebSocket connection.
//!
//! [`WebSocketConnection`] keeps exactly one logical connection to the
//! realtime server. It owns a background task that connects, authenticates,
//! sends heartbeats, forwards inbound JSON, and reconnects on close with a
//! fixed delay and a bounded attempt count.
//!
//! # Architecture
//!
//! ```text
//!   WebSocketConnection                 background task
//!         │ connect(url, token) ──────► run_connection_loop
//!         │                                 │ connector.connect(url)
//!         │ send_message(msg) ── mpsc ───►  │ run_session (select!)
//!         │                                 │   ├── inbound frames ──► ConnectionEvent::Message
//!         │ state() ◄──── watch ─────────── │   ├── outgoing queue ──► sink
//!         │                                 │   └── heartbeat tick ──► {"type":"ping"}
//!         │ disconnect() ── cancel ───────► │ close, no reconnect
//! ```
//!
//! # Reconnect policy
//!
//! Any close (server close frame, read error, stream end, failed handshake)
//! moves the state to `Disconnected`. With auto-reconnect enabled and
//! `attempt < max_attempts`, the attempt counter is bumped and a reconnect
//! runs after the fixed interval. Once exhausted the connection stays down
//! until the next explicit [`WebSocketConnection::connect`]. A successful
//! open resets the counter. Requests that cannot even be built (bad URL)
//! land in `Error` and are never retried.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::constants::{
    CLOSE_CODE_ABNORMAL, CLOSE_CODE_NORMAL, HEARTBEAT_INTERVAL, MAX_RECONNECT_ATTEMPTS,
    RECONNECT_INTERVAL,
};
use crate::messages::OutboundMessage;
use crate::ws::{Connector, FrameSink, FrameSource, TransportError, WsMessage};

/// Connection lifecycle state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// Handshake in progress.
    Connecting,
    /// Socket open.
    Connected,
    /// No socket; a reconnect may be pending.
    #[default]
    Disconnected,
    /// The connection could not be constructed. Not retried.
    Error(String),
}

/// Reconnect bookkeeping.
///
/// `attempt` never exceeds `max_attempts` and resets to 0 on every
/// successful open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Reconnects made since the last successful open.
    pub attempt: u32,
    /// Reconnects allowed before giving up.
    pub max_attempts: u32,
    /// Fixed delay before each reconnect.
    pub interval: Duration,
}

impl ReconnectPolicy {
    /// Fresh policy with no attempts recorded.
    #[must_use]
    pub fn new(max_attempts: u32, interval: Duration) -> Self {
        Self {
            attempt: 0,
            max_attempts,
            interval,
        }
    }

    /// Record the next attempt, or `None` when the budget is spent.
    pub fn next_attempt(&mut self) -> Option<u32> {
        if self.attempt >= self.max_attempts {
            return None;
        }
        self.attempt += 1;
        Some(self.attempt)
    }

    /// Forget previous attempts.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

/// Tunables for [`WebSocketConnection`].
#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    /// Reconnect after a close.
    pub auto_reconnect: bool,
    /// Fixed delay between reconnects.
    pub reconnect_interval: Duration,
    /// Reconnects allowed before giving up.
    pub max_reconnect_attempts: u32,
    /// Interval between `ping` messages while connected.
    pub heartbeat_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_interval: RECONNECT_INTERVAL,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }
}

/// Lifecycle notification delivered to the connection's owner.
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    /// The socket opened (and `auth` was sent if a token was given).
    Connected,
    /// A JSON frame arrived.
    Message(Value),
    /// The socket closed.
    Disconnected {
        /// WebSocket close code.
        code: u16,
        /// Close reason or error description.
        reason: String,
    },
    /// A connection error, logged and surfaced for display.
    Error(String),
    /// A reconnect will run after `delay`.
    ReconnectScheduled {
        /// Attempt number, starting at 1.
        attempt: u32,
        /// Delay before the attempt.
        delay: Duration,
    },
    /// All reconnect attempts were used; waiting for an explicit connect.
    ReconnectExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// Receiving end of a connection's lifecycle events.
pub type ConnectionEvents = mpsc::UnboundedReceiver<ConnectionEvent>;

/// State shared between the handle and its background task.
#[derive(Debug)]
struct Shared {
    state: watch::Sender<ConnectionState>,
    policy: Mutex<ReconnectPolicy>,
    /// Present only while a socket is open.
    outgoing: Mutex<Option<mpsc::UnboundedSender<String>>>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
}

impl Shared {
    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }

    fn emit(&self, event: ConnectionEvent) {
        // Owner dropped the receiver; nothing left to tell.
        let _ = self.events.send(event);
    }

    fn set_outgoing(&self, tx: Option<mpsc::UnboundedSender<String>>) {
        *self.outgoing.lock().expect("outgoing lock poisoned") = tx;
    }
}

/// Handle to the running background task.
#[derive(Debug)]
struct TaskHandle {
    cancel: CancellationToken,
    join: JoinHandle<()>,
}

/// A single reconnecting WebSocket connection.
#[derive(Debug)]
pub struct WebSocketConnection {
    connector: Arc<dyn Connector>,
    options: ConnectionOptions,
    shared: Arc<Shared>,
    task: Mutex<Option<TaskHandle>>,
}

impl WebSocketConnection {
    /// Create a disconnected connection and its event receiver.
    #[must_use]
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
    ) -> (Self, ConnectionEvents) {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Disconnected);

        let shared = Arc::new(Shared {
            state: state_tx,
            policy: Mutex::new(ReconnectPolicy::new(
                options.max_reconnect_attempts,
                options.reconnect_interval,
            )),
            outgoing: Mutex::new(None),
            events: events_tx,
        });

        let connection = Self {
            connector,
            options,
            shared,
            task: Mutex::new(None),
        };
        (connection, events_rx)
    }

    /// Open the connection unless it is already open or connecting.
    ///
    /// Cancels a pending reconnect timer. Must be called from within a
    /// tokio runtime.
    pub fn connect(&self, url: &str, token: Option<&str>) {
        let mut task = self.task.lock().expect("task lock poisoned");

        match *self.shared.state.borrow() {
            ConnectionState::Connecting | ConnectionState::Connected => {
                log::debug!("[ws] connect() ignored, already open or connecting");
                return;
            }
            ConnectionState::Disconnected | ConnectionState::Error(_) => {}
        }

        if let Some(previous) = task.take() {
            let _policy = self.shared.policy.lock().expect("policy lock poisoned");
            previous.cancel.cancel();
        }

        self.shared.set_state(ConnectionState::Connecting);

        let cancel = CancellationToken::new();
        let join = tokio::spawn(run_connection_loop(
            Arc::clone(&self.connector),
            url.to_string(),
            token.map(str::to_string),
            self.options.clone(),
            Arc::clone(&self.shared),
            cancel.clone(),
        ));

        *task = Some(TaskHandle { cancel, join });
    }

    /// Close the connection and cancel any pending reconnect.
    ///
    /// An explicit disconnect never triggers auto-reconnect.
    pub async fn disconnect(&self) {
        let handle = self.task.lock().expect("task lock poisoned").take();

        if let Some(handle) = handle {
            handle.cancel.cancel();
            if let Err(e) = handle.join.await {
                log::warn!("[ws] Connection task ended abnormally: {e}");
            }
        }

        self.shared.set_outgoing(None);
        self.shared.set_state(ConnectionState::Disconnected);
    }

    /// Send a message if the socket is open.
    ///
    /// Returns `false` (and logs) when not connected. Messages are never
    /// queued for later delivery.
    pub fn send_message(&self, message: &OutboundMessage) -> bool {
        log::debug!("[ws] Sending {}", message.kind());
        self.send_json(&message.to_value())
    }

    /// Send an arbitrary JSON value if the socket is open.
    pub fn send_json(&self, value: &Value) -> bool {
        let outgoing = self.shared.outgoing.lock().expect("outgoing lock poisoned");
        match outgoing.as_ref() {
            Some(tx) if tx.send(value.to_string()).is_ok() => true,
            _ => {
                log::warn!(
                    "[ws] Not connected, dropping {} message",
                    value.get("type").and_then(Value::as_str).unwrap_or("untyped")
                );
                false
            }
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.shared.state.borrow().clone()
    }

    /// Watch state transitions.
    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state.subscribe()
    }

    /// Whether the socket is open.
    pub fn is_connected(&self) -> bool {
        matches!(*self.shared.state.borrow(), ConnectionState::Connected)
    }

    /// Snapshot of the reconnect counter.
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        *self.shared.policy.lock().expect("policy lock poisoned")
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(handle) = task.take() {
                handle.cancel.cancel();
            }
        }
    }
}

/// How a single open socket ended.
enum SessionExit {
    /// Explicit disconnect.
    Shutdown,
    /// Remote close or transport failure.
    Closed { code: u16, reason: String },
}

/// Connect, run the session, and reconnect per policy until cancelled,
/// exhausted, or the request is invalid.
async fn run_connection_loop(
    connector: Arc<dyn Connector>,
    url: String,
    token: Option<String>,
    options: ConnectionOptions,
    shared: Arc<Shared>,
    cancel: CancellationToken,
) {
    loop {
        shared.set_state(ConnectionState::Connecting);
        log::info!("[ws] Connecting to {}", url);

        let transport = tokio::select! {
            result = connector.connect(&url) => result,
            () = cancel.cancelled() => return,
        };

        let (code, reason) = match transport {
            Ok((mut sink, mut source)) => {
                if cancel.is_cancelled() {
                    let _ = sink.close().await;
                    return;
                }

                let (out_tx, mut out_rx) = mpsc::unbounded_channel();
                shared.policy.lock().expect("policy lock poisoned").reset();
                shared.set_outgoing(Some(out_tx));
                shared.set_state(ConnectionState::Connected);
                log::info!("[ws] Connected");

                if let Some(ref token) = token {
                    let auth = OutboundMessage::Auth {
                        token: token.clone(),
                    };
                    if let Err(e) = sink.send_text(&auth.to_value().to_string()).await {
                        log::warn!("[ws] Failed to send auth: {e}");
                    }
                }
                shared.emit(ConnectionEvent::Connected);

                let exit = run_session(
                    sink.as_mut(),
                    source.as_mut(),
                    &mut out_rx,
                    &options,
                    &shared,
                    &cancel,
                )
                .await;
                shared.set_outgoing(None);

                match exit {
                    SessionExit::Shutdown => {
                        if let Err(e) = sink.close().await {
                            log::debug!("[ws] Close on shutdown failed: {e}");
                        }
                        shared.set_state(ConnectionState::Disconnected);
                        shared.emit(ConnectionEvent::Disconnected {
                            code: CLOSE_CODE_NORMAL,
                            reason: "client requested close".to_string(),
                        });
                        return;
                    }
                    SessionExit::Closed { code, reason } => (code, reason),
                }
            }
            Err(TransportError::InvalidRequest(msg)) => {
                log::error!("[ws] Cannot connect to {}: {}", url, msg);
                shared.set_state(ConnectionState::Error(msg.clone()));
                shared.emit(ConnectionEvent::Error(msg));
                return;
            }
            Err(TransportError::Handshake(msg)) => {
                log::warn!("[ws] Connection to {} failed: {}", url, msg);
                shared.emit(ConnectionEvent::Error(msg.clone()));
                (CLOSE_CODE_ABNORMAL, msg)
            }
        };

        log::info!("[ws] Disconnected (code {code}): {reason}");
        shared.set_state(ConnectionState::Disconnected);
        shared.emit(ConnectionEvent::Disconnected { code, reason });

        if !options.auto_reconnect {
            return;
        }

        // Checked under the policy lock, which `connect` also holds while
        // cancelling, so a superseded loop never touches the new loop's count.
        let attempt = {
            let mut policy = shared.policy.lock().expect("policy lock poisoned");
            if cancel.is_cancelled() {
                return;
            }
            let Some(attempt) = policy.next_attempt() else {
                log::warn!(
                    "[ws] Giving up after {} reconnect attempts",
                    options.max_reconnect_attempts
                );
                shared.emit(ConnectionEvent::ReconnectExhausted {
                    attempts: options.max_reconnect_attempts,
                });
                return;
            };
            shared.emit(ConnectionEvent::ReconnectScheduled {
                attempt,
                delay: options.reconnect_interval,
            });
            attempt
        };

        log::info!(
            "[ws] Reconnecting in {}ms (attempt {}/{})",
            options.reconnect_interval.as_millis(),
            attempt,
            options.max_reconnect_attempts
        );

        tokio::select! {
            () = tokio::time::sleep(options.reconnect_interval) => {}
            () = cancel.cancelled() => return,
        }
    }
}

/// Pump one open socket until it closes or the connection is cancelled.
async fn run_session(
    sink: &mut dyn FrameSink,
    source: &mut dyn FrameSource,
    out_rx: &mut mpsc::UnboundedReceiver<String>,
    options: &ConnectionOptions,
    shared: &Shared,
    cancel: &CancellationToken,
) -> SessionExit {
    let start = tokio::time::Instant::now() + options.heartbeat_interval;
    let mut heartbeat = tokio::time::interval_at(start, options.heartbeat_interval);
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let ping = OutboundMessage::Ping.to_value().to_string();

    loop {
        tokio::select! {
            () = cancel.cancelled() => return SessionExit::Shutdown,

            frame = source.recv() => match frame {
                Some(Ok(WsMessage::Text(text))) => forward_frame(shared, &text),
                Some(Ok(WsMessage::Binary(data))) => {
                    forward_frame(shared, &String::from_utf8_lossy(&data));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    if let Err(e) = sink.send_pong(data).await {
                        return closed_by_error(&e);
                    }
                }
                Some(Ok(WsMessage::Pong(_))) => {}
                Some(Ok(WsMessage::Close { code, reason })) => {
                    return SessionExit::Closed { code, reason };
                }
                Some(Err(e)) => return closed_by_error(&e),
                None => {
                    return SessionExit::Closed {
                        code: CLOSE_CODE_ABNORMAL,
                        reason: "stream ended".to_string(),
                    };
                }
            },

            Some(text) = out_rx.recv() => {
                if let Err(e) = sink.send_text(&text).await {
                    return closed_by_error(&e);
                }
            }

            _ = heartbeat.tick() => {
                log::debug!("[ws] Sending heartbeat");
                if let Err(e) = sink.send_text(&ping).await {
                    return closed_by_error(&e);
                }
            }
        }
    }
}

fn closed_by_error(err: &anyhow::Error) -> SessionExit {
    log::warn!("[ws] Transport error: {err}");
    SessionExit::Closed {
        code: CLOSE_CODE_ABNORMAL,
        reason: err.to_string(),
    }
}

/// Parse an inbound frame and hand it to the owner. Malformed JSON is
/// logged and dropped.
fn forward_frame(shared: &Shared, text: &str) {
    match serde_json::from_str::<Value>(text) {
        Ok(value) => shared.emit(ConnectionEvent::Message(value)),
        Err(e) => log::warn!("[ws] Dropping malformed frame: {e}"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::ws::Transport;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// What the next `connect()` call does.
    #[derive(Debug, Clone)]
    pub(crate) enum Script {
        /// Fail the handshake.
        Fail,
        /// Reject the request outright.
        Invalid,
        /// Open, deliver these frames, then stay idle.
        Open(Vec<WsMessage>),
    }

    /// Connector that follows a script and records outgoing frames.
    #[derive(Debug, Default)]
    pub(crate) struct ScriptedConnector {
        pub(crate) calls: AtomicUsize,
        script: Mutex<VecDeque<Script>>,
        /// Used once the script runs out.
        fallback: Mutex<Option<Script>>,
        pub(crate) sent: Arc<Mutex<Vec<String>>>,
    }

    impl ScriptedConnector {
        pub(crate) fn new(script: Vec<Script>, fallback: Script) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                script: Mutex::new(script.into()),
                fallback: Mutex::new(Some(fallback)),
                sent: Arc::new(Mutex::new(Vec::new())),
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        pub(crate) fn sent(&self) -> Vec<String> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[derive(Debug)]
    struct RecordingSink {
        sent: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl FrameSink for RecordingSink {
        async fn send_text(&mut self, text: &str) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }

        async fn send_pong(&mut self, _data: Vec<u8>) -> anyhow::Result<()> {
            Ok(())
        }

        async fn close(&mut self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[derive(Debug)]
    struct QueuedSource {
        frames: VecDeque<WsMessage>,
    }

    #[async_trait]
    impl FrameSource for QueuedSource {
        async fn recv(&mut self) -> Option<anyhow::Result<WsMessage>> {
            match self.frames.pop_front() {
                Some(frame) => Some(Ok(frame)),
                None => std::future::pending().await,
            }
        }
    }

    #[async_trait]
    impl Connector for ScriptedConnector {
        async fn connect(&self, _url: &str) -> Result<Transport, TransportError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let step = self
                .script
                .lock()
                .unwrap()
                .pop_front()
                .or_else(|| self.fallback.lock().unwrap().clone())
                .unwrap();

            match step {
                Script::Fail => Err(TransportError::Handshake("connection refused".into())),
                Script::Invalid => Err(TransportError::InvalidRequest("bad url".into())),
                Script::Open(frames) => Ok((
                    Box::new(RecordingSink {
                        sent: Arc::clone(&self.sent),
                    }),
                    Box::new(QueuedSource {
                        frames: frames.into(),
                    }),
                )),
            }
        }
    }

    pub(crate) fn fast_options() -> ConnectionOptions {
        ConnectionOptions {
            auto_reconnect: true,
            reconnect_interval: Duration::from_millis(10),
            max_reconnect_attempts: 5,
            heartbeat_interval: Duration::from_secs(3600),
        }
    }

    pub(crate) async fn next_event(events: &mut ConnectionEvents) -> ConnectionEvent {
        tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .expect("timed out waiting for connection event")
            .expect("event channel closed")
    }

    fn text(s: &str) -> WsMessage {
        WsMessage::Text(s.to_string())
    }

    #[test]
    fn test_policy_bounds_attempts() {
        let mut policy = ReconnectPolicy::new(2, Duration::from_millis(1));
        assert_eq!(policy.next_attempt(), Some(1));
        assert_eq!(policy.next_attempt(), Some(2));
        assert_eq!(policy.next_attempt(), None);
        assert_eq!(policy.attempt, 2);

        policy.reset();
        assert_eq!(policy.attempt, 0);
    }

    #[test]
    fn test_default_options() {
        let options = ConnectionOptions::default();
        assert!(options.auto_reconnect);
        assert_eq!(options.max_reconnect_attempts, 5);
        assert_eq!(options.reconnect_interval, Duration::from_millis(3000));
    }

    #[tokio::test]
    async fn test_six_closes_make_exactly_five_reconnects() {
        let connector = ScriptedConnector::new(vec![], Script::Fail);
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", None);

        let mut disconnects = 0;
        let mut scheduled = 0;
        loop {
            match next_event(&mut events).await {
                ConnectionEvent::Disconnected { .. } => disconnects += 1,
                ConnectionEvent::ReconnectScheduled { .. } => scheduled += 1,
                ConnectionEvent::ReconnectExhausted { attempts } => {
                    assert_eq!(attempts, 5);
                    break;
                }
                _ => {}
            }
        }

        assert_eq!(disconnects, 6);
        assert_eq!(scheduled, 5);
        assert_eq!(connector.calls(), 6);
        assert_eq!(conn.reconnect_policy().attempt, 5);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.calls(), 6);
        assert_eq!(conn.state(), ConnectionState::Disconnected);

        // Only an explicit connect tries again.
        conn.connect("ws://test/ws", None);
        loop {
            if let ConnectionEvent::Disconnected { .. } = next_event(&mut events).await {
                break;
            }
        }
        assert_eq!(connector.calls(), 7);
    }

    #[tokio::test]
    async fn test_open_sends_auth_then_reports_connected() {
        let connector = ScriptedConnector::new(vec![], Script::Open(vec![]));
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", Some("secret"));
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        assert_eq!(conn.state(), ConnectionState::Connected);
        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        let auth: Value = serde_json::from_str(&sent[0]).unwrap();
        assert_eq!(auth["type"], "auth");
        assert_eq!(auth["token"], "secret");
    }

    #[tokio::test]
    async fn test_connect_while_open_is_noop() {
        let connector = ScriptedConnector::new(vec![], Script::Open(vec![]));
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", None);
        // Second call lands while still connecting.
        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        conn.connect("ws://test/ws", None);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_send_only_while_open() {
        let connector = ScriptedConnector::new(vec![], Script::Open(vec![]));
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        assert!(!conn.send_message(&OutboundMessage::Ping));

        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        assert!(conn.send_message(&OutboundMessage::SubscribeRestaurant { restaurant_id: 4 }));
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = connector.sent();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].contains("subscribe_restaurant"));
    }

    #[tokio::test]
    async fn test_malformed_frame_is_dropped() {
        let connector = ScriptedConnector::new(
            vec![],
            Script::Open(vec![text("{not json"), text(r#"{"type":"pong"}"#)]),
        );
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Message(serde_json::json!({"type": "pong"}))
        );
        assert!(conn.is_connected());
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried() {
        let connector = ScriptedConnector::new(vec![], Script::Invalid);
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("not a url", None);
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Error(_)
        ));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.calls(), 1);
        assert!(matches!(conn.state(), ConnectionState::Error(_)));
    }

    #[tokio::test]
    async fn test_explicit_disconnect_does_not_reconnect() {
        let connector = ScriptedConnector::new(vec![], Script::Open(vec![]));
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);

        conn.disconnect().await;
        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert!(!conn.send_message(&OutboundMessage::Ping));

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.calls(), 1);
    }

    /// Fails the handshake after cancelling the loop that called it, like a
    /// `connect()` that supersedes the loop right as it disconnects.
    #[derive(Debug)]
    struct SupersededConnector {
        cancel: CancellationToken,
    }

    #[async_trait]
    impl Connector for SupersededConnector {
        async fn connect(&self, _url: &str) -> Result<Transport, TransportError> {
            self.cancel.cancel();
            Err(TransportError::Handshake("refused".to_string()))
        }
    }

    #[tokio::test]
    async fn test_superseded_loop_leaves_reconnect_count_alone() {
        let (conn, mut events) =
            WebSocketConnection::new(ScriptedConnector::new(vec![], Script::Fail), fast_options());
        let cancel = CancellationToken::new();
        let connector = Arc::new(SupersededConnector {
            cancel: cancel.clone(),
        });

        tokio::time::timeout(
            Duration::from_secs(5),
            run_connection_loop(
                connector,
                "ws://test/ws".to_string(),
                None,
                fast_options(),
                Arc::clone(&conn.shared),
                cancel,
            ),
        )
        .await
        .expect("superseded loop kept running");

        assert_eq!(conn.reconnect_policy().attempt, 0);
        while let Ok(event) = events.try_recv() {
            assert!(
                !matches!(event, ConnectionEvent::ReconnectScheduled { .. }),
                "stray {event:?}"
            );
        }
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let connector = ScriptedConnector::new(vec![], Script::Fail);
        let mut options = fast_options();
        options.reconnect_interval = Duration::from_millis(200);
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), options);

        conn.connect("ws://test/ws", None);
        loop {
            if let ConnectionEvent::ReconnectScheduled { .. } = next_event(&mut events).await {
                break;
            }
        }
        conn.disconnect().await;

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_successful_reopen_resets_attempts() {
        let connector = ScriptedConnector::new(
            vec![
                Script::Open(vec![WsMessage::Close {
                    code: 1001,
                    reason: "going away".to_string(),
                }]),
                Script::Fail,
            ],
            Script::Open(vec![]),
        );
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), fast_options());

        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        assert_eq!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected {
                code: 1001,
                reason: "going away".to_string()
            }
        );

        loop {
            if next_event(&mut events).await == ConnectionEvent::Connected {
                break;
            }
        }
        assert_eq!(connector.calls(), 3);
        assert_eq!(conn.reconnect_policy().attempt, 0);
    }

    #[tokio::test]
    async fn test_no_reconnect_when_disabled() {
        let connector = ScriptedConnector::new(vec![], Script::Fail);
        let mut options = fast_options();
        options.auto_reconnect = false;
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), options);

        conn.connect("ws://test/ws", None);
        loop {
            if let ConnectionEvent::Disconnected { .. } = next_event(&mut events).await {
                break;
            }
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(connector.calls(), 1);
    }

    #[tokio::test]
    async fn test_heartbeat_sends_ping() {
        let connector = ScriptedConnector::new(vec![], Script::Open(vec![]));
        let mut options = fast_options();
        options.heartbeat_interval = Duration::from_millis(20);
        let (conn, mut events) = WebSocketConnection::new(connector.clone(), options);

        conn.connect("ws://test/ws", None);
        assert_eq!(next_event(&mut events).await, ConnectionEvent::Connected);
        tokio::time::sleep(Duration::from_millis(100)).await;

        let pings = connector
            .sent()
            .iter()
            .filter(|s| s.as_str() == r#"{"type":"ping"}"#)
            .count();
        assert!(pings >= 2, "expected heartbeats, got {pings}");
    }
}
