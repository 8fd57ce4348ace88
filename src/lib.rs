//! Menu Sync - real-time data synchronization for the restaurant menu service.
//!
//! This crate keeps restaurants, orders and menu items in step with the
//! server and between every consumer of the same data, whether in this
//! process or in another one sharing the same storage.
//!
//! # Architecture
//!
//! - **WebSocketConnection** - One reconnecting realtime socket with auth and heartbeat
//! - **RealtimeCoordinator** - Routes pushed messages into typed collections
//! - **PollingSyncChannel** - Periodic fetch with change-only callbacks
//! - **BroadcastHub** - Named state shared in-process and across processes
//!
//! # Modules
//!
//! - [`connection`] - WebSocket lifecycle and reconnect policy
//! - [`coordinator`] - Message dispatch into collections
//! - [`polling`] - Polling sync with payload hashing
//! - [`broadcast`] - Local broadcast channels
//! - [`storage`] - Persisted key-value stores and credentials
//! - [`api`] - REST client
//! - [`config`] - Configuration loading/saving

pub mod api;
pub mod broadcast;
pub mod config;
pub mod connection;
pub mod constants;
pub mod coordinator;
pub mod error;
pub mod file_watcher;
pub mod messages;
pub mod models;
pub mod notifications;
pub mod polling;
pub mod storage;
pub mod ws;

// Re-export commonly used types
pub use api::ApiClient;
pub use broadcast::{BroadcastEvent, BroadcastHub, LocalBroadcastChannel, Origin};
pub use config::Config;
pub use connection::{ConnectionEvent, ConnectionOptions, ConnectionState, WebSocketConnection};
pub use coordinator::{Collections, RealtimeCoordinator};
pub use error::SyncError;
pub use messages::{OutboundMessage, SyncMessage};
pub use models::{Collection, Entity, EntityKind};
pub use polling::{PollOptions, PollSnapshot, PollingSyncChannel, SyncedResource};
pub use storage::{CredentialStore, FileStore, KeyValueStore, MemoryStore};
