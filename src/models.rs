//! Domain records kept in the realtime collections.
//!
//! The REST API and the WebSocket server both send restaurants, orders and
//! menu items as loosely-shaped JSON objects. Only `id` is interpreted; every
//! other field is carried through untouched so that updates can be applied
//! as shallow merges without this crate knowing the full schema.

// Rust guideline compliant 2026-01

use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::SyncError;

/// Which collection an entity belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    /// A restaurant managed from the owner dashboard.
    Restaurant,
    /// A diner order placed from a table.
    Order,
    /// A dish on a restaurant menu.
    MenuItem,
}

impl EntityKind {
    /// Human-readable label used in notifications and logs.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Restaurant => "Restaurant",
            Self::Order => "Order",
            Self::MenuItem => "Menu item",
        }
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.label())
    }
}

/// A record identified by a numeric id with arbitrary extra fields.
#[derive(Debug, Clone, PartialEq, Serialize, serde::Deserialize)]
#[serde(try_from = "Value")]
pub struct Entity {
    /// Server-assigned identifier.
    pub id: i64,
    /// All other fields, flattened on the wire.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Entity {
    /// Create an entity with no extra fields.
    #[must_use]
    pub fn new(id: i64) -> Self {
        Self {
            id,
            fields: Map::new(),
        }
    }

    /// Builder-style field setter.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Look up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.get(name)
    }

    /// Shallow merge: every field in `patch` overwrites the same field here.
    ///
    /// Fields absent from `patch` are kept; nested objects are replaced
    /// whole, not merged.
    pub fn merge_from(&mut self, patch: &Entity) {
        for (name, value) in &patch.fields {
            self.fields.insert(name.clone(), value.clone());
        }
    }
}

impl TryFrom<Value> for Entity {
    type Error = SyncError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        let Value::Object(mut fields) = value else {
            return Err(SyncError::InvalidMessage(
                "entity payload is not an object".to_string(),
            ));
        };

        let id = fields
            .remove("id")
            .as_ref()
            .and_then(parse_id)
            .ok_or_else(|| SyncError::InvalidMessage("entity payload has no usable id".to_string()))?;

        Ok(Self { id, fields })
    }
}

/// Read an identifier that may arrive as a number or a numeric string.
///
/// The PHP backend is inconsistent about this, so both are accepted.
pub fn parse_id(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// An ordered list of entities with id-based mutation helpers.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Collection {
    items: Vec<Entity>,
}

impl Collection {
    /// Create a collection from an initial list, preserving order.
    #[must_use]
    pub fn new(items: Vec<Entity>) -> Self {
        Self { items }
    }

    /// Items in display order.
    pub fn items(&self) -> &[Entity] {
        &self.items
    }

    /// Number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the collection is empty.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Find an item by id.
    pub fn get(&self, id: i64) -> Option<&Entity> {
        self.items.iter().find(|e| e.id == id)
    }

    /// Whether an item with this id exists.
    pub fn contains(&self, id: i64) -> bool {
        self.get(id).is_some()
    }

    /// Index of the item with this id.
    pub fn position(&self, id: i64) -> Option<usize> {
        self.items.iter().position(|e| e.id == id)
    }

    /// Merge `patch` into the item with the same id.
    ///
    /// Update-only: returns `false` and leaves the collection untouched when
    /// no item matches.
    pub fn update(&mut self, patch: &Entity) -> bool {
        match self.items.iter_mut().find(|e| e.id == patch.id) {
            Some(existing) => {
                existing.merge_from(patch);
                true
            }
            None => false,
        }
    }

    /// Insert at the front. An existing item with the same id is dropped
    /// first so ids stay unique.
    pub fn prepend(&mut self, entity: Entity) {
        self.items.retain(|e| e.id != entity.id);
        self.items.insert(0, entity);
    }

    /// Remove the item with this id.
    pub fn remove(&mut self, id: i64) -> Option<Entity> {
        let index = self.position(id)?;
        Some(self.items.remove(index))
    }

    /// Replace every item, e.g. after an initial REST load.
    pub fn replace_all(&mut self, items: Vec<Entity>) {
        self.items = items;
    }
}
