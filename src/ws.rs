//! Shared WebSocket transport.
//!
//! Thin wrapper around `tokio-tungstenite` providing type-isolated
//! reader/writer halves, plus the [`Connector`] seam the realtime
//! connection is written against. Production code uses
//! [`TungsteniteConnector`]; tests substitute scripted transports.
//!
//! # Architecture
//!
//! ```text
//! WebSocketConnection
//!     │ connector.connect(url)
//!     ▼
//! Connector (trait) ──► TungsteniteConnector ──► connect()
//!     │
//!     └── (Box<dyn FrameSink>, Box<dyn FrameSource>)
//! ```

// Rust guideline compliant 2026-02

use anyhow::{Context, Result};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite;

/// Concrete WebSocket stream type (avoids repeating the generic everywhere).
type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;

/// Received WebSocket message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    /// UTF-8 text frame.
    Text(String),
    /// Binary frame.
    Binary(Vec<u8>),
    /// Ping frame with payload.
    Ping(Vec<u8>),
    /// Pong frame with payload.
    Pong(Vec<u8>),
    /// Close frame with status code and reason.
    Close {
        /// WebSocket close code (1000 = normal, 1005 = no code).
        code: u16,
        /// Human-readable close reason.
        reason: String,
    },
}

/// Failure to establish a transport.
///
/// The split matters to the reconnect policy: a request that cannot even be
/// built is a configuration fault and is never retried, while a failed
/// handshake behaves like any other close.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// URL or headers could not form a valid request.
    InvalidRequest(String),
    /// Network or handshake failure.
    Handshake(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidRequest(msg) => write!(f, "Invalid WebSocket request: {msg}"),
            Self::Handshake(msg) => write!(f, "WebSocket handshake failed: {msg}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outgoing half of a transport.
#[async_trait]
pub trait FrameSink: Send + std::fmt::Debug {
    /// Send a UTF-8 text frame.
    async fn send_text(&mut self, text: &str) -> Result<()>;

    /// Answer a protocol-level ping.
    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()>;

    /// Send a close frame and flush.
    async fn close(&mut self) -> Result<()>;
}

/// Incoming half of a transport.
#[async_trait]
pub trait FrameSource: Send + std::fmt::Debug {
    /// Receive the next message, returning `None` when the stream ends.
    async fn recv(&mut self) -> Option<Result<WsMessage>>;
}

/// A connected transport, split for use in `tokio::select!` loops.
pub type Transport = (Box<dyn FrameSink>, Box<dyn FrameSource>);

/// Opens transports for a URL.
#[async_trait]
pub trait Connector: Send + Sync + std::fmt::Debug {
    /// Open a new transport to `url`.
    async fn connect(&self, url: &str) -> Result<Transport, TransportError>;
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_text(&mut self, text: &str) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Text(text.to_string()))
            .await
            .context("WebSocket send_text failed")
    }

    async fn send_pong(&mut self, data: Vec<u8>) -> Result<()> {
        self.sink
            .send(tungstenite::Message::Pong(data))
            .await
            .context("WebSocket send_pong failed")
    }

    async fn close(&mut self) -> Result<()> {
        // Best effort: the peer may already be gone.
        let _ = self.sink.send(tungstenite::Message::Close(None)).await;
        self.sink.close().await.context("WebSocket close failed")
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv(&mut self) -> Option<Result<WsMessage>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(WsMessage::Text(text)));
                }
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(WsMessage::Binary(data)));
                }
                Some(Ok(tungstenite::Message::Ping(data))) => {
                    return Some(Ok(WsMessage::Ping(data)));
                }
                Some(Ok(tungstenite::Message::Pong(data))) => {
                    return Some(Ok(WsMessage::Pong(data)));
                }
                Some(Ok(tungstenite::Message::Close(close_frame))) => {
                    let (code, reason) = close_frame
                        .map(|cf| (cf.code.into(), cf.reason.to_string()))
                        .unwrap_or((1005, String::new()));
                    return Some(Ok(WsMessage::Close { code, reason }));
                }
                Some(Ok(tungstenite::Message::Frame(_))) => {
                    // Raw frames, skip
                    continue;
                }
                Some(Err(e)) => {
                    return Some(Err(anyhow::anyhow!("WebSocket read error: {e}")));
                }
                None => return None,
            }
        }
    }
}

/// Connect to a WebSocket URL with optional headers.
///
/// Builds an HTTP request from `url`, inserts each `(name, value)` header,
/// then performs the WebSocket handshake. Returns split (writer, reader)
/// halves for independent use in `tokio::select!` loops.
///
/// # Errors
///
/// [`TransportError::InvalidRequest`] if the URL or headers are malformed,
/// [`TransportError::Handshake`] if the connection or handshake fails.
pub async fn connect(
    url: &str,
    headers: &[(String, String)],
) -> Result<(WsWriter, WsReader), TransportError> {
    use tungstenite::client::IntoClientRequest;

    let mut request = url
        .into_client_request()
        .map_err(|e| TransportError::InvalidRequest(format!("{url}: {e}")))?;

    for (name, value) in headers {
        let header_name = tungstenite::http::HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| TransportError::InvalidRequest(format!("header name {name}: {e}")))?;
        let header_value = tungstenite::http::HeaderValue::from_str(value)
            .map_err(|e| TransportError::InvalidRequest(format!("header value for {name}: {e}")))?;
        request.headers_mut().insert(header_name, header_value);
    }

    let (ws_stream, _response) = tokio_tungstenite::connect_async(request)
        .await
        .map_err(|e| TransportError::Handshake(e.to_string()))?;

    let (sink, stream) = ws_stream.split();

    Ok((WsWriter { sink }, WsReader { stream }))
}

/// Production connector backed by `tokio-tungstenite`.
#[derive(Debug, Clone, Default)]
pub struct TungsteniteConnector {
    headers: Vec<(String, String)>,
}

impl TungsteniteConnector {
    /// Create a connector that sends no extra headers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a header sent with every handshake.
    #[must_use]
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

#[async_trait]
impl Connector for TungsteniteConnector {
    async fn connect(&self, url: &str) -> Result<Transport, TransportError> {
        let (writer, reader) = connect(url, &self.headers).await?;
        Ok((Box::new(writer), Box::new(reader)))
    }
}

/// Convert an HTTP(S) URL to WS(S) scheme.
///
/// Passes `ws://` and `wss://` through unchanged.
#[must_use]
pub fn http_to_ws_scheme(url: &str) -> String {
    if url.starts_with("wss://") || url.starts_with("ws://") {
        url.to_string()
    } else {
        url.replace("https://", "wss://")
            .replace("http://", "ws://")
    }
}
