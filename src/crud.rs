//! The generic CRUD contract a sync session consumes.
//!
//! A backend only has to list records, push result sets to a subscriber and
//! optionally create, update or delete single records. Records are JSON
//! objects; [`CrudFields`] tells the session which field identifies a record
//! and which one orders records, so the session never needs the domain schema.

use std::fmt::{Display, Formatter};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ChatError;
use crate::transport::Unsubscribe;

/// How a listed result set is folded into the confirmed records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    /// The result set replaces every confirmed record.
    Set,
    /// Each listed record replaces the confirmed record with its identifier.
    Assign,
    /// Each listed record is merged field by field into the confirmed record.
    #[default]
    Merge,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CrudOp {
    Create,
    Update,
    Delete,
}

impl Display for CrudOp {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            CrudOp::Create => write!(f, "create"),
            CrudOp::Update => write!(f, "update"),
            CrudOp::Delete => write!(f, "delete"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrudFields {
    pub field_id: String,
    pub field_created_at: String,
    pub mode: SyncMode,
}

impl Default for CrudFields {
    fn default() -> Self {
        Self {
            field_id: "localId".to_string(),
            field_created_at: "localCreatedAt".to_string(),
            mode: SyncMode::Merge,
        }
    }
}

/// Receives every pushed result set, or the error that replaced it.
pub type ListCallback = Arc<dyn Fn(Result<Vec<JsonValue>, ChatError>) + Send + Sync>;

pub trait CrudBackend: Send + Sync {
    fn fields(&self) -> &CrudFields;

    fn list(&self) -> Result<Vec<JsonValue>, ChatError>;

    /// `Ok(None)` when the backend has no live updates.
    fn subscribe(&self, on_update: ListCallback) -> Result<Option<Unsubscribe>, ChatError>;

    /// The mutation wrappers return `Ok(None)` when the operation is not
    /// configured; the session then keeps the change local.
    fn create(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError>;

    fn update(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError>;

    fn delete(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError>;

    fn supports(&self, op: CrudOp) -> bool;
}

/// Field-by-field merge of `patch` into `target`. Nested objects merge recursively.
pub fn merge_json(target: &mut JsonValue, patch: &JsonValue) {
    match (target, patch) {
        (JsonValue::Object(target), JsonValue::Object(patch)) => {
            for (key, value) in patch {
                let nested = value.is_object() && target.get(key).is_some_and(JsonValue::is_object);
                if nested {
                    if let Some(existing) = target.get_mut(key) {
                        merge_json(existing, value);
                    }
                } else {
                    target.insert(key.clone(), value.clone());
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Reads `field` of a record as a string identifier.
pub fn record_id<'a>(record: &'a JsonValue, field: &str) -> Option<&'a str> {
    record.get(field).and_then(JsonValue::as_str)
}
