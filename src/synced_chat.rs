//! Adapter from the message server functions to the [`CrudBackend`] contract.
//!
//! ```no_run
//! use realtime_chat_core::config::StoreConfig;
//! use realtime_chat_core::functions::api;
//! use realtime_chat_core::server::MessageServer;
//! use realtime_chat_core::synced_chat::{synced_chat, SyncedChatProps};
//! use realtime_chat_core::transport::{connect, TransportKind};
//!
//! let server = MessageServer::open(&StoreConfig::named("chat"))?;
//! let transport = connect(TransportKind::Push, server);
//! let backend = synced_chat(SyncedChatProps {
//!     create: Some(api::messages::CREATE),
//!     update: Some(api::messages::UPDATE),
//!     delete: Some(api::messages::REMOVE),
//!     ..SyncedChatProps::new(transport, api::messages::LIST)
//! })?;
//! # Ok::<(), realtime_chat_core::error::ChatError>(())
//! ```

use std::sync::Arc;

use log::{debug, warn};
use serde_json::Value as JsonValue;

use crate::config::SyncConfig;
use crate::crud::{CrudBackend, CrudFields, CrudOp, ListCallback, SyncMode};
use crate::error::ChatError;
use crate::functions::{api, FunctionKind, FunctionRef};
use crate::transport::{ResultCallback, SyncTransport, Unsubscribe};

pub struct SyncedChatProps {
    pub transport: Arc<dyn SyncTransport>,
    pub query: FunctionRef,
    pub query_args: JsonValue,
    pub create: Option<FunctionRef>,
    pub update: Option<FunctionRef>,
    pub delete: Option<FunctionRef>,
    pub mode: Option<SyncMode>,
    pub field_id: String,
    pub field_created_at: String,
    pub strip_fields: Vec<String>,
}

impl SyncedChatProps {
    /// Read-only props for `query` with the default field mapping.
    pub fn new(transport: Arc<dyn SyncTransport>, query: FunctionRef) -> Self {
        let defaults = SyncConfig::default();
        Self {
            transport,
            query,
            query_args: JsonValue::Object(Default::default()),
            create: None,
            update: None,
            delete: None,
            mode: None,
            field_id: defaults.field_id,
            field_created_at: defaults.field_created_at,
            strip_fields: defaults.strip_fields,
        }
    }

    /// Props wired to every `messages` function, using the mapping in `config`.
    pub fn messages(transport: Arc<dyn SyncTransport>, config: &SyncConfig) -> Self {
        Self {
            create: Some(api::messages::CREATE),
            update: Some(api::messages::UPDATE),
            delete: Some(api::messages::REMOVE),
            mode: Some(config.mode),
            field_id: config.field_id.clone(),
            field_created_at: config.field_created_at.clone(),
            strip_fields: config.strip_fields.clone(),
            ..Self::new(transport, api::messages::LIST)
        }
    }
}

pub struct SyncedChat {
    transport: Arc<dyn SyncTransport>,
    query: FunctionRef,
    query_args: JsonValue,
    create: Option<FunctionRef>,
    update: Option<FunctionRef>,
    delete: Option<FunctionRef>,
    strip_fields: Vec<String>,
    fields: CrudFields,
}

/// Validates the props and builds the adapter.
pub fn synced_chat(props: SyncedChatProps) -> Result<SyncedChat, ChatError> {
    if props.query.kind != FunctionKind::Query {
        return Err(ChatError::BadRequest(format!("{} is not a query", props.query)));
    }
    for mutation in [props.create, props.update, props.delete].into_iter().flatten() {
        if mutation.kind != FunctionKind::Mutation {
            return Err(ChatError::BadRequest(format!("{mutation} is not a mutation")));
        }
    }
    if !props.query_args.is_object() {
        return Err(ChatError::BadRequest("query arguments must be an object".to_string()));
    }

    Ok(SyncedChat {
        transport: props.transport,
        query: props.query,
        query_args: props.query_args,
        create: props.create,
        update: props.update,
        delete: props.delete,
        strip_fields: props.strip_fields,
        fields: CrudFields {
            field_id: props.field_id,
            field_created_at: props.field_created_at,
            mode: props.mode.unwrap_or_default(),
        },
    })
}

fn into_records(result: JsonValue) -> Result<Vec<JsonValue>, ChatError> {
    match result {
        JsonValue::Array(records) => Ok(records),
        other => Err(ChatError::Transport(format!(
            "list query returned {} instead of an array",
            match other {
                JsonValue::Null => "null",
                JsonValue::Object(_) => "an object",
                _ => "a scalar",
            }
        ))),
    }
}

impl SyncedChat {
    pub fn transport(&self) -> &Arc<dyn SyncTransport> {
        &self.transport
    }

    /// Copy of `record` without the fields the server functions do not accept.
    pub fn strip_bookkeeping(&self, record: &JsonValue) -> JsonValue {
        let mut stripped = record.clone();
        if let JsonValue::Object(fields) = &mut stripped {
            for name in &self.strip_fields {
                fields.remove(name);
            }
        }
        stripped
    }

    fn run_mutation(
        &self,
        op: CrudOp,
        mutation: Option<FunctionRef>,
        record: &JsonValue,
    ) -> Result<Option<JsonValue>, ChatError> {
        let Some(mutation) = mutation else {
            debug!("No {op} mutation configured; keeping change local");
            return Ok(None);
        };
        let args = self.strip_bookkeeping(record);
        let result = self.transport.mutation(mutation, args)?;
        debug!("{op} via {} confirmed", mutation.name);
        Ok(Some(result))
    }
}

impl CrudBackend for SyncedChat {
    fn fields(&self) -> &CrudFields {
        &self.fields
    }

    fn list(&self) -> Result<Vec<JsonValue>, ChatError> {
        let result = self.transport.query(self.query, self.query_args.clone())?;
        let records = into_records(result)?;
        debug!("Listed {} records from {}", records.len(), self.query.name);
        Ok(records)
    }

    fn subscribe(&self, on_update: ListCallback) -> Result<Option<Unsubscribe>, ChatError> {
        let query = self.query;
        let forward: ResultCallback = Arc::new(move |result: Result<JsonValue, ChatError>| {
            let records = result.and_then(into_records);
            if let Err(e) = &records {
                warn!("Subscription to {} failed: {e}", query.name);
            }
            on_update(records);
        });
        let handle = self
            .transport
            .subscribe(self.query, self.query_args.clone(), forward)?;
        Ok(Some(handle))
    }

    fn create(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError> {
        self.run_mutation(CrudOp::Create, self.create, record)
    }

    fn update(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError> {
        self.run_mutation(CrudOp::Update, self.update, record)
    }

    /// Deletes send only the identifier field.
    fn delete(&self, record: &JsonValue) -> Result<Option<JsonValue>, ChatError> {
        let id_only = match record.get(&self.fields.field_id) {
            Some(id) => {
                let mut args = serde_json::Map::new();
                args.insert(self.fields.field_id.clone(), id.clone());
                JsonValue::Object(args)
            }
            None => {
                return Err(ChatError::BadRequest(format!(
                    "record has no {} field",
                    self.fields.field_id
                )))
            }
        };
        self.run_mutation(CrudOp::Delete, self.delete, &id_only)
    }

    fn supports(&self, op: CrudOp) -> bool {
        match op {
            CrudOp::Create => self.create.is_some(),
            CrudOp::Update => self.update.is_some(),
            CrudOp::Delete => self.delete.is_some(),
        }
    }
}
