//! Realtime coordinator.
//!
//! Binds one [`WebSocketConnection`] to the in-memory restaurant, order and
//! menu-item collections. Every inbound frame is validated into a
//! [`SyncMessage`] and routed by an exhaustive match; collection mutations
//! produce a user-facing [`Notification`].
//!
//! Collections live in a `watch` channel: observers see a new snapshot only
//! when a message actually changed something.

// Rust guideline compliant 2026-02

use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::watch;

use crate::connection::{
    ConnectionEvent, ConnectionEvents, ConnectionOptions, ConnectionState, WebSocketConnection,
};
use crate::messages::{OutboundMessage, SyncMessage};
use crate::models::{Collection, Entity, EntityKind};
use crate::notifications::{self, Notification, Notifier};
use crate::ws::Connector;

/// The three synchronized collections.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Collections {
    /// Restaurants owned by the signed-in user.
    pub restaurants: Collection,
    /// Orders, most recent first.
    pub orders: Collection,
    /// Menu items of the subscribed restaurants.
    pub menu_items: Collection,
}

impl Collections {
    fn of_mut(&mut self, kind: EntityKind) -> &mut Collection {
        match kind {
            EntityKind::Restaurant => &mut self.restaurants,
            EntityKind::Order => &mut self.orders,
            EntityKind::MenuItem => &mut self.menu_items,
        }
    }
}

/// Routes realtime messages into typed collections.
#[derive(Debug)]
pub struct RealtimeCoordinator {
    connection: WebSocketConnection,
    events: tokio::sync::Mutex<ConnectionEvents>,
    collections: watch::Sender<Collections>,
    notifier: Arc<dyn Notifier>,
    /// Restaurants to (re)subscribe to on every open.
    subscriptions: Mutex<Vec<i64>>,
}

impl RealtimeCoordinator {
    /// Create a coordinator with empty collections and a disconnected socket.
    pub fn new(
        connector: Arc<dyn Connector>,
        options: ConnectionOptions,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (connection, events) = WebSocketConnection::new(connector, options);
        let (collections, _rx) = watch::channel(Collections::default());

        Self {
            connection,
            events: tokio::sync::Mutex::new(events),
            collections,
            notifier,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Open the realtime connection.
    pub fn connect(&self, url: &str, token: Option<&str>) {
        self.connection.connect(url, token);
    }

    /// Close the realtime connection without reconnecting.
    pub async fn disconnect(&self) {
        self.connection.disconnect().await;
    }

    /// Connection lifecycle state.
    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    /// Ask the server for pushes about one restaurant.
    ///
    /// The subscription is remembered and re-sent after every reconnect.
    /// Returns whether the request went out now.
    pub fn subscribe_to_restaurant(&self, restaurant_id: i64) -> bool {
        {
            let mut subscriptions = self.subscriptions.lock().expect("subscriptions lock poisoned");
            if !subscriptions.contains(&restaurant_id) {
                subscriptions.push(restaurant_id);
            }
        }
        self.connection
            .send_message(&OutboundMessage::SubscribeRestaurant { restaurant_id })
    }

    /// Replace the restaurant list, e.g. from an initial REST load.
    pub fn set_restaurants(&self, items: Vec<Entity>) {
        self.replace(EntityKind::Restaurant, items);
    }

    /// Replace the order list.
    pub fn set_orders(&self, items: Vec<Entity>) {
        self.replace(EntityKind::Order, items);
    }

    /// Replace the menu-item list.
    pub fn set_menu_items(&self, items: Vec<Entity>) {
        self.replace(EntityKind::MenuItem, items);
    }

    fn replace(&self, kind: EntityKind, items: Vec<Entity>) {
        self.collections.send_modify(|c| c.of_mut(kind).replace_all(items));
    }

    /// Clone of all collections.
    pub fn snapshot(&self) -> Collections {
        self.collections.borrow().clone()
    }

    /// Observe collection changes.
    pub fn subscribe(&self) -> watch::Receiver<Collections> {
        self.collections.subscribe()
    }

    /// Process connection events until the connection is dropped.
    pub async fn run(&self) {
        let mut events = self.events.lock().await;
        while let Some(event) = events.recv().await {
            self.handle_event(event).await;
        }
        log::debug!("[realtime] Event stream ended");
    }

    /// React to one connection event.
    pub async fn handle_event(&self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Connected => {
                log::info!("[realtime] Connected");
                let subscriptions = self
                    .subscriptions
                    .lock()
                    .expect("subscriptions lock poisoned")
                    .clone();
                for restaurant_id in subscriptions {
                    self.connection
                        .send_message(&OutboundMessage::SubscribeRestaurant { restaurant_id });
                }
            }
            ConnectionEvent::Message(value) => match SyncMessage::parse(value) {
                Ok(message) => {
                    log::debug!("[realtime] Received {}", message.kind());
                    if let Some(notification) = self.dispatch(message) {
                        notifications::deliver(self.notifier.as_ref(), &notification).await;
                    }
                }
                Err(e) => log::warn!("[realtime] Dropping message: {e}"),
            },
            ConnectionEvent::Disconnected { code, reason } => {
                log::info!("[realtime] Disconnected ({code}): {reason}");
            }
            ConnectionEvent::Error(e) => log::warn!("[realtime] Connection error: {e}"),
            ConnectionEvent::ReconnectScheduled { attempt, delay } => {
                log::debug!(
                    "[realtime] Reconnect {} scheduled in {}ms",
                    attempt,
                    delay.as_millis()
                );
            }
            ConnectionEvent::ReconnectExhausted { attempts } => {
                log::warn!("[realtime] Gave up reconnecting after {attempts} attempts");
            }
        }
    }

    /// Apply one message to the collections.
    ///
    /// Returns the notification to show when something changed.
    pub fn dispatch(&self, message: SyncMessage) -> Option<Notification> {
        match message {
            SyncMessage::RestaurantUpdated { restaurant } => {
                self.apply_update(EntityKind::Restaurant, &restaurant)
            }
            SyncMessage::OrderUpdated { order, .. } => self.apply_update(EntityKind::Order, &order),
            SyncMessage::MenuItemUpdated { item, .. } => {
                self.apply_update(EntityKind::MenuItem, &item)
            }
            SyncMessage::NewOrder { order, .. } => {
                let notification = Notification::new("New order", describe(EntityKind::Order, &order))
                    .with_tag(format!("order-{}", order.id));
                self.collections.send_modify(|c| c.orders.prepend(order));
                Some(notification)
            }
            SyncMessage::RestaurantDeleted { id } => {
                let mut removed = None;
                self.collections.send_if_modified(|c| {
                    removed = c.restaurants.remove(id);
                    removed.is_some()
                });
                match removed {
                    Some(restaurant) => Some(Notification::new(
                        "Restaurant deleted",
                        describe(EntityKind::Restaurant, &restaurant),
                    )),
                    None => {
                        log::debug!("[realtime] restaurant_deleted for unknown id {id}");
                        None
                    }
                }
            }
            SyncMessage::AuthSuccess { .. } => {
                log::info!("[realtime] Authenticated");
                None
            }
            SyncMessage::SubscriptionSuccess { restaurant_id } => {
                log::info!("[realtime] Subscribed to restaurant {:?}", restaurant_id);
                None
            }
            SyncMessage::Pong => None,
            SyncMessage::Unknown { kind } => {
                log::warn!("[realtime] Ignoring unknown message type '{kind}'");
                None
            }
        }
    }

    /// Update-only merge; no match means no insert and no notification.
    fn apply_update(&self, kind: EntityKind, patch: &Entity) -> Option<Notification> {
        let mut merged = None;
        self.collections.send_if_modified(|c| {
            let collection = c.of_mut(kind);
            if collection.update(patch) {
                merged = collection.get(patch.id).cloned();
                true
            } else {
                false
            }
        });

        match merged {
            Some(entity) => Some(
                Notification::new(format!("{kind} updated"), describe(kind, &entity))
                    .with_tag(format!("{}-{}", kind.label().to_lowercase(), entity.id)),
            ),
            None => {
                log::debug!("[realtime] No {kind} with id {} to update", patch.id);
                None
            }
        }
    }
}

/// Short human description: the entity's `name`, else `"<Kind> #<id>"`.
fn describe(kind: EntityKind, entity: &Entity) -> String {
    entity
        .get("name")
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .unwrap_or_else(|| format!("{kind} #{}", entity.id))
}
