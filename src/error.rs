//! Error types for the sync subsystems.
//!
//! Every variant is terminal to the current operation only: a failed poll
//! ends that tick, a failed frame is dropped, a failed write leaves the
//! in-memory value untouched.

// Rust guideline compliant 2026-01

/// Errors surfaced by polling, the REST client, storage, and message parsing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// No bearer token in the credential store. The request was not issued.
    MissingToken,
    /// Network failure before a response arrived.
    Transport(String),
    /// Server answered with a non-success status.
    Http {
        /// HTTP status code.
        status: u16,
        /// Response body, possibly empty.
        body: String,
    },
    /// Response was not `application/json`.
    UnexpectedContentType(String),
    /// Payload could not be decoded.
    Parse(String),
    /// Persisted storage could not be read or written.
    Storage(String),
    /// A realtime message failed validation at the parse boundary.
    InvalidMessage(String),
}

impl std::fmt::Display for SyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingToken => write!(f, "No authentication token found"),
            Self::Transport(msg) => write!(f, "Request failed: {msg}"),
            Self::Http { status, body } if body.is_empty() => {
                write!(f, "Server returned HTTP {status}")
            }
            Self::Http { status, body } => write!(f, "Server returned HTTP {status}: {body}"),
            Self::UnexpectedContentType(ct) => {
                write!(f, "Expected application/json response, got '{ct}'")
            }
            Self::Parse(msg) => write!(f, "Invalid JSON payload: {msg}"),
            Self::Storage(msg) => write!(f, "Storage error: {msg}"),
            Self::InvalidMessage(msg) => write!(f, "Invalid realtime message: {msg}"),
        }
    }
}

impl std::error::Error for SyncError {}

impl From<reqwest::Error> for SyncError {
    fn from(err: reqwest::Error) -> Self {
        Self::Transport(err.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        Self::Parse(err.to_string())
    }
}
