//! Data model definitions for chat messages.
//!
//! Two shapes exist for the same message. [`StoredMessage`] is the document
//! kept by the record store and carries the store-assigned `_id` and
//! `_creationTime`. [`MessageRecord`] is what callers see: the internal
//! identifier is dropped and the store creation time is renamed to
//! `serverCreatedAt`.
//!
//! The argument types ([`CreateArgs`], [`UpdateArgs`], [`RemoveArgs`],
//! [`ListArgs`]) reject unknown fields, so a caller that forwards store
//! bookkeeping fields to a mutation gets a validation error.

use serde::{Deserialize, Serialize};

/// Store-assigned identifier. Monotonically increasing per store.
pub type StoreId = u64;

/// A message document as persisted by the record store.
///
/// # Examples
///
/// ```rust
/// use realtime_chat_core::message_model::StoredMessage;
///
/// let doc = StoredMessage {
///     id: 7,
///     creation_time: 1_700_000_000_000.0,
///     local_id: "a1".to_string(),
///     local_created_at: 1_699_999_999_000.0,
///     author: "alice".to_string(),
///     body: "hi".to_string(),
/// };
///
/// let record = doc.to_record();
/// assert_eq!(record.local_id, "a1");
/// assert_eq!(record.server_created_at, Some(1_700_000_000_000.0));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    /// Internal identifier, never returned to clients.
    #[serde(rename = "_id")]
    pub id: StoreId,

    /// Store creation time in milliseconds since the Unix epoch.
    #[serde(rename = "_creationTime")]
    pub creation_time: f64,

    /// Client-generated unique key. Indexed.
    #[serde(rename = "localId")]
    pub local_id: String,

    /// Client-supplied logical timestamp, independent of `creation_time`.
    #[serde(rename = "localCreatedAt")]
    pub local_created_at: f64,

    pub author: String,

    pub body: String,
}

impl StoredMessage {
    /// Builds the client-facing shape of this document.
    pub fn to_record(&self) -> MessageRecord {
        MessageRecord {
            local_id: self.local_id.clone(),
            local_created_at: self.local_created_at,
            server_created_at: Some(self.creation_time),
            author: self.author.clone(),
            body: self.body.clone(),
        }
    }
}

/// Client-facing message shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageRecord {
    pub local_id: String,
    pub local_created_at: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_created_at: Option<f64>,
    pub author: String,
    pub body: String,
}

/// Arguments of `messages:list`. The query takes none.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListArgs {}

/// Arguments of `messages:create`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CreateArgs {
    pub local_id: String,
    pub local_created_at: f64,
    pub author: String,
    pub body: String,
}

/// Arguments of `messages:update`. Only the provided fields change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpdateArgs {
    pub local_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_created_at: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl UpdateArgs {
    /// Merges the provided fields onto `doc`, leaving the rest untouched.
    pub fn apply_to(&self, doc: &mut StoredMessage) {
        if let Some(local_created_at) = self.local_created_at {
            doc.local_created_at = local_created_at;
        }
        if let Some(author) = &self.author {
            doc.author = author.clone();
        }
        if let Some(body) = &self.body {
            doc.body = body.clone();
        }
    }
}

/// Arguments of `messages:remove`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RemoveArgs {
    pub local_id: String,
}
