//! Realtime message types.
//!
//! Inbound frames have the shape `{"type": ..., "data": ..., "restaurant_id"?: ...}`.
//! They are validated into [`SyncMessage`] before dispatch so handlers only
//! ever see well-formed payloads. Unrecognized `type` tags become
//! [`SyncMessage::Unknown`] instead of an error; a recognized tag with a
//! malformed payload is an error.

// Rust guideline compliant 2026-02

use serde::Deserialize;
use serde_json::{json, Value};

use crate::error::SyncError;
use crate::models::{parse_id, Entity};

/// Raw frame envelope before validation.
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
    #[serde(default)]
    restaurant_id: Option<Value>,
}

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncMessage {
    /// Fields of an existing restaurant changed.
    RestaurantUpdated {
        /// Partial restaurant carrying the changed fields.
        restaurant: Entity,
    },
    /// A diner placed a new order.
    NewOrder {
        /// The full order.
        order: Entity,
        /// Restaurant the order belongs to, when the server says.
        restaurant_id: Option<i64>,
    },
    /// An existing order changed (status, items, ...).
    OrderUpdated {
        /// Partial order carrying the changed fields.
        order: Entity,
        /// Restaurant the order belongs to, when the server says.
        restaurant_id: Option<i64>,
    },
    /// A menu item changed.
    MenuItemUpdated {
        /// Partial menu item carrying the changed fields.
        item: Entity,
        /// Restaurant the item belongs to, when the server says.
        restaurant_id: Option<i64>,
    },
    /// A restaurant was deleted.
    RestaurantDeleted {
        /// Id of the deleted restaurant.
        id: i64,
    },
    /// The server accepted our `auth` message.
    AuthSuccess {
        /// Whatever the server attached (user info, etc.).
        data: Value,
    },
    /// The server accepted a `subscribe_restaurant` request.
    SubscriptionSuccess {
        /// Restaurant the subscription is for.
        restaurant_id: Option<i64>,
    },
    /// Reply to our heartbeat.
    Pong,
    /// Any type tag this client does not know.
    Unknown {
        /// The unrecognized `type` tag.
        kind: String,
    },
}

impl SyncMessage {
    /// Validate a parsed JSON frame.
    pub fn parse(value: Value) -> Result<Self, SyncError> {
        let envelope: Envelope = serde_json::from_value(value)
            .map_err(|e| SyncError::InvalidMessage(format!("bad envelope: {e}")))?;
        let restaurant_id = envelope.restaurant_id.as_ref().and_then(parse_id);

        let message = match envelope.kind.as_str() {
            "restaurant_updated" => Self::RestaurantUpdated {
                restaurant: Entity::try_from(envelope.data)?,
            },
            "new_order" => Self::NewOrder {
                order: Entity::try_from(envelope.data)?,
                restaurant_id,
            },
            "order_updated" => Self::OrderUpdated {
                order: Entity::try_from(envelope.data)?,
                restaurant_id,
            },
            "menu_item_updated" => Self::MenuItemUpdated {
                item: Entity::try_from(envelope.data)?,
                restaurant_id,
            },
            "restaurant_deleted" => Self::RestaurantDeleted {
                id: deleted_id(&envelope.data).ok_or_else(|| {
                    SyncError::InvalidMessage("restaurant_deleted without id".to_string())
                })?,
            },
            "auth_success" => Self::AuthSuccess {
                data: envelope.data,
            },
            "subscription_success" => Self::SubscriptionSuccess {
                restaurant_id: restaurant_id
                    .or_else(|| envelope.data.get("restaurant_id").and_then(parse_id)),
            },
            "pong" => Self::Pong,
            _ => Self::Unknown {
                kind: envelope.kind,
            },
        };

        Ok(message)
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &str {
        match self {
            Self::RestaurantUpdated { .. } => "restaurant_updated",
            Self::NewOrder { .. } => "new_order",
            Self::OrderUpdated { .. } => "order_updated",
            Self::MenuItemUpdated { .. } => "menu_item_updated",
            Self::RestaurantDeleted { .. } => "restaurant_deleted",
            Self::AuthSuccess { .. } => "auth_success",
            Self::SubscriptionSuccess { .. } => "subscription_success",
            Self::Pong => "pong",
            Self::Unknown { kind } => kind,
        }
    }
}

/// `restaurant_deleted` carries either `{"id": n}` or a bare id.
fn deleted_id(data: &Value) -> Option<i64> {
    data.get("id").and_then(parse_id).or_else(|| parse_id(data))
}

/// A message this client sends to the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundMessage {
    /// Authenticate the socket with the API bearer token.
    Auth {
        /// Bearer token.
        token: String,
    },
    /// Ask for pushes scoped to one restaurant.
    SubscribeRestaurant {
        /// Restaurant to subscribe to.
        restaurant_id: i64,
    },
    /// Heartbeat.
    Ping,
}

impl OutboundMessage {
    /// JSON form sent over the socket.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Auth { token } => json!({"type": "auth", "token": token}),
            Self::SubscribeRestaurant { restaurant_id } => {
                json!({"type": "subscribe_restaurant", "restaurant_id": restaurant_id})
            }
            Self::Ping => json!({"type": "ping"}),
        }
    }

    /// The wire `type` tag of this message.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth { .. } => "auth",
            Self::SubscribeRestaurant { .. } => "subscribe_restaurant",
            Self::Ping => "ping",
        }
    }
}
