//! Application-wide constants for menu-sync.
//!
//! This module centralizes the timing defaults and storage keys shared by
//! the sync subsystems so they can be tuned in one place.
//!
//! # Categories
//!
//! - **Timeouts**: Network request timeouts
//! - **Realtime**: WebSocket reconnect and heartbeat timing
//! - **Polling**: Default polling cadence
//! - **Storage**: Persisted key names

use std::time::Duration;

// ============================================================================
// Timeouts
// ============================================================================

/// HTTP client request timeout for REST API calls.
///
/// Polling itself has no per-request deadline; this only bounds a request
/// that hangs at the socket level.
pub const HTTP_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

// ============================================================================
// Realtime
// ============================================================================

/// Delay between reconnect attempts. Fixed, not exponential.
pub const RECONNECT_INTERVAL: Duration = Duration::from_millis(3000);

/// Reconnect attempts allowed before the connection gives up.
pub const MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Interval between application-level `ping` messages while connected.
///
/// Keeps intermediary proxies from closing an idle socket. The server's
/// `pong` reply is accepted and ignored.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// Close code reported when the stream ends without a close frame.
pub const CLOSE_CODE_ABNORMAL: u16 = 1006;

/// Close code reported for a client-requested close.
pub const CLOSE_CODE_NORMAL: u16 = 1000;

// ============================================================================
// Polling
// ============================================================================

/// Default interval between polls of a resource endpoint.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5000);

// ============================================================================
// Storage
// ============================================================================

/// Storage key holding the bearer token for the REST API.
pub const AUTH_TOKEN_KEY: &str = "menu_sync.auth_token";

/// File name of the persisted key-value store inside the config directory.
pub const STORAGE_FILE_NAME: &str = "storage.json";

/// Capacity of the in-process broadcast bus.
pub const BROADCAST_BUS_CAPACITY: usize = 256;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_defaults() {
        assert_eq!(RECONNECT_INTERVAL, Duration::from_secs(3));
        assert_eq!(MAX_RECONNECT_ATTEMPTS, 5);
    }

    #[test]
    fn test_heartbeat_is_thirty_seconds() {
        assert_eq!(HEARTBEAT_INTERVAL.as_secs(), 30);
    }

    #[test]
    fn test_poll_interval_default() {
        assert_eq!(POLL_INTERVAL.as_millis(), 5000);
    }
}
