//! Configuration loading and persistence.
//!
//! Handles reading and writing `config.json` in the menu-sync config
//! directory. Every field can be overridden from the environment. The auth
//! token is not part of the file; it lives in the credential store, or comes
//! from `MENU_SYNC_TOKEN`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;
use std::{
    fs,
    path::{Path, PathBuf},
};

use crate::connection::ConnectionOptions;
use crate::constants::{
    HEARTBEAT_INTERVAL, MAX_RECONNECT_ATTEMPTS, POLL_INTERVAL, RECONNECT_INTERVAL,
    STORAGE_FILE_NAME,
};
use crate::ws::http_to_ws_scheme;

const CONFIG_FILE_NAME: &str = "config.json";

/// Configuration for the menu-sync client.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Base URL of the REST API.
    pub server_url: String,
    /// Realtime endpoint. Derived from `server_url` when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ws_url: Option<String>,
    /// Interval in milliseconds between polls.
    pub poll_interval_ms: u64,
    /// Delay in milliseconds between reconnect attempts.
    pub reconnect_interval_ms: u64,
    /// Reconnect attempts before giving up.
    pub max_reconnect_attempts: u32,
    /// Reconnect after the socket closes.
    pub auto_reconnect: bool,
    /// Desktop-notification bridge. Notifications are only logged when unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub notify_url: Option<String>,
    /// Token from the environment - NOT serialized to disk.
    #[serde(skip)]
    pub token: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            ws_url: None,
            poll_interval_ms: POLL_INTERVAL.as_millis() as u64,
            reconnect_interval_ms: RECONNECT_INTERVAL.as_millis() as u64,
            max_reconnect_attempts: MAX_RECONNECT_ATTEMPTS,
            auto_reconnect: true,
            notify_url: None,
            token: None,
        }
    }
}

impl Config {
    /// Returns the configuration directory path, creating it if necessary.
    ///
    /// `MENU_SYNC_CONFIG_DIR` overrides the platform config directory
    /// (macOS: ~/Library/Application Support/menu-sync).
    pub fn config_dir() -> Result<PathBuf> {
        let dir = if let Ok(dir) = std::env::var("MENU_SYNC_CONFIG_DIR") {
            PathBuf::from(dir)
        } else {
            dirs::config_dir()
                .context("Could not determine config directory")?
                .join("menu-sync")
        };
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create {}", dir.display()))?;
        Ok(dir)
    }

    /// Loads configuration from the config directory, with environment
    /// variable overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_dir()?)
    }

    /// Loads configuration from `dir`, with environment variable overrides.
    ///
    /// A missing file yields defaults; an unreadable one is an error.
    pub fn load_from(dir: &Path) -> Result<Self> {
        let mut config = Self::read_file(&dir.join(CONFIG_FILE_NAME))?;
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    fn read_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Apply `MENU_SYNC_*` overrides using `lookup` to read variables.
    ///
    /// Values that fail to parse are ignored with a warning.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(server_url) = lookup("MENU_SYNC_SERVER_URL") {
            self.server_url = server_url;
        }

        if let Some(ws_url) = lookup("MENU_SYNC_WS_URL") {
            self.ws_url = Some(ws_url);
        }

        if let Some(notify_url) = lookup("MENU_SYNC_NOTIFY_URL") {
            self.notify_url = Some(notify_url);
        }

        // Token from env var (for CI/CD)
        if let Some(token) = lookup("MENU_SYNC_TOKEN").filter(|t| !t.is_empty()) {
            self.token = Some(token);
        }

        parse_into(&lookup, "MENU_SYNC_POLL_INTERVAL_MS", &mut self.poll_interval_ms);
        parse_into(
            &lookup,
            "MENU_SYNC_RECONNECT_INTERVAL_MS",
            &mut self.reconnect_interval_ms,
        );
        parse_into(
            &lookup,
            "MENU_SYNC_MAX_RECONNECT_ATTEMPTS",
            &mut self.max_reconnect_attempts,
        );
        parse_into(&lookup, "MENU_SYNC_AUTO_RECONNECT", &mut self.auto_reconnect);
    }

    /// Persists the configuration to the config directory.
    /// Note: the token is NOT saved here.
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::config_dir()?)
    }

    /// Persists the configuration to `dir`.
    pub fn save_to(&self, dir: &Path) -> Result<()> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        fs::write(&config_path, serde_json::to_string_pretty(self)?)
            .with_context(|| format!("Failed to write {}", config_path.display()))?;

        // Set restrictive permissions (owner read/write only)
        #[cfg(unix)]
        fs::set_permissions(&config_path, fs::Permissions::from_mode(0o600))?;

        Ok(())
    }

    /// Realtime URL: `ws_url`, or `server_url` with a ws scheme and `/ws`.
    pub fn ws_url(&self) -> String {
        match &self.ws_url {
            Some(url) => url.clone(),
            None => format!(
                "{}/ws",
                http_to_ws_scheme(self.server_url.trim_end_matches('/'))
            ),
        }
    }

    /// Interval between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Options for the realtime connection.
    pub fn connection_options(&self) -> ConnectionOptions {
        ConnectionOptions {
            auto_reconnect: self.auto_reconnect,
            reconnect_interval: Duration::from_millis(self.reconnect_interval_ms),
            max_reconnect_attempts: self.max_reconnect_attempts,
            heartbeat_interval: HEARTBEAT_INTERVAL,
        }
    }

    /// Path of the persisted key-value store inside `dir`.
    pub fn storage_path(dir: &Path) -> PathBuf {
        dir.join(STORAGE_FILE_NAME)
    }
}

fn parse_into<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.trim().parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => log::warn!("Ignoring invalid {name}={raw}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.poll_interval_ms, 5000);
        assert_eq!(config.reconnect_interval_ms, 3000);
        assert_eq!(config.max_reconnect_attempts, 5);
        assert!(config.auto_reconnect);
    }

    #[test]
    fn test_config_serialization_excludes_token() {
        let config = Config {
            token: Some("secret_token".to_string()),
            ..Config::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        assert!(!json.contains("secret_token"));
        assert!(!json.contains("token"));
    }

    #[test]
    fn test_overrides() {
        let mut config = Config::default();
        config.apply_overrides(env(&[
            ("MENU_SYNC_SERVER_URL", "https://menu.example.com"),
            ("MENU_SYNC_POLL_INTERVAL_MS", "250"),
            ("MENU_SYNC_AUTO_RECONNECT", "false"),
            ("MENU_SYNC_MAX_RECONNECT_ATTEMPTS", "2"),
            ("MENU_SYNC_TOKEN", "tok"),
        ]));

        assert_eq!(config.server_url, "https://menu.example.com");
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
        assert!(!config.auto_reconnect);
        assert_eq!(config.max_reconnect_attempts, 2);
        assert_eq!(config.token.as_deref(), Some("tok"));
    }

    #[test]
    fn test_invalid_override_is_ignored() {
        let mut config = Config::default();
        config.apply_overrides(env(&[("MENU_SYNC_POLL_INTERVAL_MS", "soon")]));
        assert_eq!(config.poll_interval_ms, 5000);
    }

    #[test]
    fn test_ws_url_derived_from_server_url() {
        let config = Config {
            server_url: "https://menu.example.com/".to_string(),
            ..Config::default()
        };
        assert_eq!(config.ws_url(), "wss://menu.example.com/ws");

        let explicit = Config {
            ws_url: Some("ws://localhost:9001".to_string()),
            ..Config::default()
        };
        assert_eq!(explicit.ws_url(), "ws://localhost:9001");
    }

    #[test]
    fn test_save_and_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config {
            poll_interval_ms: 1234,
            notify_url: Some("http://localhost:9000/notify".to_string()),
            ..Config::default()
        };
        config.save_to(dir.path()).unwrap();

        let loaded = Config::read_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded, config);

        #[cfg(unix)]
        {
            let mode = fs::metadata(dir.path().join(CONFIG_FILE_NAME))
                .unwrap()
                .permissions()
                .mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = Config::read_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded, Config::default());
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(CONFIG_FILE_NAME),
            r#"{"server_url": "http://api.local"}"#,
        )
        .unwrap();
        let loaded = Config::read_file(&dir.path().join(CONFIG_FILE_NAME)).unwrap();
        assert_eq!(loaded.server_url, "http://api.local");
        assert_eq!(loaded.max_reconnect_attempts, 5);
    }

    #[test]
    fn test_connection_options_from_config() {
        let config = Config {
            reconnect_interval_ms: 100,
            ..Config::default()
        };
        let options = config.connection_options();
        assert_eq!(options.reconnect_interval, Duration::from_millis(100));
        assert_eq!(options.heartbeat_interval, HEARTBEAT_INTERVAL);
    }
}
