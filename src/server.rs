//! Server functions for the `messages` table.
//!
//! Each operation is a direct translation of one store operation. After a
//! successful mutation the [`QueryHub`] is notified so live queries refresh.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::config::StoreConfig;
use crate::error::ChatError;
use crate::functions::{api, FunctionKind, FunctionRef};
use crate::live::{InvalidateFn, QueryHub, WatchHandle};
use crate::message_model::{CreateArgs, ListArgs, MessageRecord, RemoveArgs, UpdateArgs};
use crate::message_store::MessageStore;

/// Maximum number of messages returned by `messages:list`.
pub const RECENT_MESSAGE_LIMIT: usize = 100;

pub struct MessageServer {
    store: MessageStore,
    hub: Arc<QueryHub>,
}

fn parse_args<T: DeserializeOwned>(function: FunctionRef, args: JsonValue) -> Result<T, ChatError> {
    let args = if args.is_null() { JsonValue::Object(Default::default()) } else { args };
    serde_json::from_value(args)
        .map_err(|e| ChatError::BadRequest(format!("invalid arguments for {}: {e}", function.name)))
}

impl MessageServer {
    pub fn new(store: MessageStore) -> Arc<Self> {
        Arc::new(Self {
            store,
            hub: QueryHub::new(),
        })
    }

    pub fn open(config: &StoreConfig) -> Result<Arc<Self>, ChatError> {
        Ok(Self::new(MessageStore::open(config)?))
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    pub fn hub(&self) -> &Arc<QueryHub> {
        &self.hub
    }

    /// The most recent messages, newest first.
    pub fn list(&self, _args: ListArgs) -> Result<Vec<MessageRecord>, ChatError> {
        let docs = self.store.take_recent(RECENT_MESSAGE_LIMIT)?;
        Ok(docs.iter().map(|doc| doc.to_record()).collect())
    }

    pub fn create(&self, args: CreateArgs) -> Result<MessageRecord, ChatError> {
        let doc = self.store.insert(args)?;
        info!("Created message {}", doc.local_id);
        self.hub.notify_table_changed();
        Ok(doc.to_record())
    }

    pub fn update(&self, args: UpdateArgs) -> Result<MessageRecord, ChatError> {
        let doc = self
            .store
            .update_by_local_id(&args.local_id, |doc| args.apply_to(doc))?;
        info!("Updated message {}", doc.local_id);
        self.hub.notify_table_changed();
        Ok(doc.to_record())
    }

    pub fn remove(&self, args: RemoveArgs) -> Result<MessageRecord, ChatError> {
        let doc = self.store.delete_by_local_id(&args.local_id)?;
        info!("Removed message {}", doc.local_id);
        self.hub.notify_table_changed();
        Ok(doc.to_record())
    }

    /// Removes every message and refreshes live queries. Returns how many were removed.
    pub fn clear_all_records(&self) -> Result<usize, ChatError> {
        let cleared = self.store.clear_all_records()?;
        self.hub.notify_table_changed();
        Ok(cleared)
    }

    /// Runs a function by reference with JSON arguments and a JSON result.
    pub fn call(&self, function: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError> {
        let known = api::lookup(function.name)
            .ok_or_else(|| ChatError::BadRequest(format!("unknown function {}", function.name)))?;
        if known.kind != function.kind {
            return Err(ChatError::BadRequest(format!(
                "{} cannot be called as a {}",
                known,
                match function.kind {
                    FunctionKind::Query => "query",
                    FunctionKind::Mutation => "mutation",
                }
            )));
        }
        debug!("Calling {known}");

        let result = if known == api::messages::LIST {
            serde_json::to_value(self.list(parse_args(known, args)?)?)?
        } else if known == api::messages::CREATE {
            serde_json::to_value(self.create(parse_args(known, args)?)?)?
        } else if known == api::messages::UPDATE {
            serde_json::to_value(self.update(parse_args(known, args)?)?)?
        } else {
            serde_json::to_value(self.remove(parse_args(known, args)?)?)?
        };
        Ok(result)
    }

    /// Runs a function given only its name.
    pub fn call_by_name(&self, name: &str, args: JsonValue) -> Result<JsonValue, ChatError> {
        let function =
            api::lookup(name).ok_or_else(|| ChatError::BadRequest(format!("unknown function {name}")))?;
        self.call(function, args)
    }

    /// Registers a live query. `on_invalidate` runs after every committed write.
    pub fn watch(&self, query: FunctionRef, on_invalidate: InvalidateFn) -> Result<WatchHandle, ChatError> {
        if !query.is_query() {
            warn!("Refusing to watch {query}");
            return Err(ChatError::BadRequest(format!("{query} is not a query")));
        }
        Ok(self.hub.watch(query.name, on_invalidate))
    }
}
