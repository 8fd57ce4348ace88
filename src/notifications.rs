//! User-facing notifications for realtime changes.
//!
//! When the coordinator applies a change it builds a [`Notification`] and
//! hands it to a [`Notifier`]. Delivery is best-effort and permission-gated:
//! without permission the notification is only logged, and a failed delivery
//! never touches the synchronized data.
//!
//! # Notifiers
//!
//! - [`LogNotifier`]: logs only. Used when no push endpoint is configured.
//! - [`HttpNotifier`]: posts `{title, body, tag}` to a desktop-notification
//!   bridge.
//!
//! # Example
//!
//! ```ignore
//! let notifier = HttpNotifier::new(client, "http://localhost:9000/notify".to_string());
//! notifications::deliver(&notifier, &Notification::new("Order updated", "Order 7 changed")).await;
//! ```

// Rust guideline compliant 2026-01

use anyhow::Result;
use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;

/// Whether the user allowed notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Permission {
    /// Notifications may be shown.
    Granted,
    /// The user refused.
    Denied,
    /// The user has not been asked.
    Default,
}

/// A notification about a change the user should see.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    /// Short heading.
    pub title: String,
    /// Body text.
    pub body: String,
    /// Groups related notifications so a newer one replaces an older one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

impl Notification {
    /// Create an untagged notification.
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            tag: None,
        }
    }

    /// Builder-style tag setter.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tag = Some(tag.into());
        self
    }
}

/// Shows notifications to the user.
#[async_trait]
pub trait Notifier: Send + Sync + std::fmt::Debug {
    /// Current permission state.
    fn permission(&self) -> Permission;

    /// Show a notification. Only called when permission is granted.
    async fn show(&self, notification: &Notification) -> Result<()>;
}

/// Notifier that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    fn permission(&self) -> Permission {
        Permission::Default
    }

    async fn show(&self, notification: &Notification) -> Result<()> {
        log::info!("{}: {}", notification.title, notification.body);
        Ok(())
    }
}

/// Posts notifications to a desktop-notification bridge over HTTP.
#[derive(Debug, Clone)]
pub struct HttpNotifier {
    client: Client,
    endpoint: String,
}

impl HttpNotifier {
    /// Creates a notifier posting to `endpoint`.
    pub fn new(client: Client, endpoint: String) -> Self {
        Self { client, endpoint }
    }
}

#[async_trait]
impl Notifier for HttpNotifier {
    fn permission(&self) -> Permission {
        if self.endpoint.is_empty() {
            Permission::Denied
        } else {
            Permission::Granted
        }
    }

    async fn show(&self, notification: &Notification) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(notification)
            .send()
            .await?;

        if response.status().is_success() {
            log::debug!("Sent notification: {}", notification.title);
            Ok(())
        } else {
            anyhow::bail!(
                "Failed to send notification: {} - {}",
                response.status(),
                response.text().await.unwrap_or_default()
            )
        }
    }
}

/// Show `notification` if permitted, otherwise log it.
///
/// Never fails: delivery errors are logged and swallowed.
pub async fn deliver(notifier: &dyn Notifier, notification: &Notification) {
    match notifier.permission() {
        Permission::Granted => {
            if let Err(e) = notifier.show(notification).await {
                log::warn!("Notification not shown: {e}");
            }
        }
        Permission::Denied | Permission::Default => {
            log::info!("{}: {}", notification.title, notification.body);
        }
    }
}
