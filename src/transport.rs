//! Client transports to the message server.
//!
//! Two variants implement [`SyncTransport`]:
//!
//! - [`PushTransport`] keeps a local result per watched query. The server
//!   pushes an invalidation, the transport refreshes its cached result and the
//!   subscriber reads it back through [`PushTransport::local_query_result`].
//! - [`PollTransport`] registers the subscriber callback directly; each change
//!   delivers a freshly fetched result set.
//!
//! Which one a client gets is decided by configuration through [`connect`].
//!
//! Writers on different threads notify concurrently. Each transport runs
//! "fetch the result, hand it to the subscriber" under a delivery gate, so a
//! subscriber never receives a result set older than one it already has.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::ChatError;
use crate::functions::{FunctionKind, FunctionRef};
use crate::server::MessageServer;

/// Receives each result set of a subscribed query.
pub type ResultCallback = Arc<dyn Fn(Result<JsonValue, ChatError>) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    #[default]
    Push,
    Poll,
}

/// Cancels a subscription when called or dropped.
pub struct Unsubscribe {
    cancel: Option<Box<dyn FnOnce() + Send>>,
}

impl Unsubscribe {
    pub fn new(cancel: impl FnOnce() + Send + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("active", &self.cancel.is_some())
            .finish()
    }
}

impl Drop for Unsubscribe {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

pub trait SyncTransport: Send + Sync {
    fn kind(&self) -> TransportKind;

    fn query(&self, query: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError>;

    fn mutation(&self, mutation: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError>;

    /// Delivers the current result once, then again after every change,
    /// until the returned handle is cancelled.
    fn subscribe(
        &self,
        query: FunctionRef,
        args: JsonValue,
        callback: ResultCallback,
    ) -> Result<Unsubscribe, ChatError>;
}

/// Builds the transport selected by `kind`.
pub fn connect(kind: TransportKind, server: Arc<MessageServer>) -> Arc<dyn SyncTransport> {
    debug!("Connecting {kind:?} transport");
    match kind {
        TransportKind::Push => Arc::new(PushTransport::new(server)),
        TransportKind::Poll => Arc::new(PollTransport::new(server)),
    }
}

fn expect_kind(function: FunctionRef, kind: FunctionKind) -> Result<(), ChatError> {
    if function.kind == kind {
        Ok(())
    } else {
        Err(ChatError::BadRequest(format!("{function} used as {kind:?}")))
    }
}

fn server_gone() -> ChatError {
    ChatError::Transport("message server is no longer running".to_string())
}

#[derive(Default)]
struct CachedQuery {
    result: Option<JsonValue>,
    subscribers: usize,
}

type QueryCache = Arc<Mutex<HashMap<String, CachedQuery>>>;

/// Serializes fetch-and-deliver for a subscription.
type DeliveryGate = Arc<Mutex<()>>;

fn cache_key(query: FunctionRef, args: &JsonValue) -> String {
    format!("{}({})", query.name, args)
}

pub struct PushTransport {
    server: Arc<MessageServer>,
    cache: QueryCache,
    gate: DeliveryGate,
}

impl PushTransport {
    pub fn new(server: Arc<MessageServer>) -> Self {
        Self {
            server,
            cache: Arc::new(Mutex::new(HashMap::new())),
            gate: Arc::new(Mutex::new(())),
        }
    }

    /// The last result pushed for a watched query, if any.
    pub fn local_query_result(&self, query: FunctionRef, args: &JsonValue) -> Option<JsonValue> {
        read_cached(&self.cache, &cache_key(query, args))
    }
}

fn read_cached(cache: &QueryCache, key: &str) -> Option<JsonValue> {
    cache
        .lock()
        .ok()
        .and_then(|entries| entries.get(key).and_then(|entry| entry.result.clone()))
}

/// Re-runs the query, stores the result and hands the cached copy to `callback`.
fn refresh_cached(
    server: &MessageServer,
    gate: &Mutex<()>,
    cache: &QueryCache,
    key: &str,
    query: FunctionRef,
    args: &JsonValue,
    callback: &ResultCallback,
) {
    let _delivering = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    match server.call(query, args.clone()) {
        Ok(result) => {
            if let Ok(mut entries) = cache.lock() {
                entries.entry(key.to_string()).or_default().result = Some(result);
            }
            match read_cached(cache, key) {
                Some(value) => callback(Ok(value)),
                None => warn!("No cached result for {key} after refresh"),
            }
        }
        Err(e) => callback(Err(e)),
    }
}

impl SyncTransport for PushTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Push
    }

    fn query(&self, query: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError> {
        expect_kind(query, FunctionKind::Query)?;
        if let Some(cached) = self.local_query_result(query, &args) {
            debug!("Serving {} from the local query cache", query.name);
            return Ok(cached);
        }
        self.server.call(query, args)
    }

    fn mutation(&self, mutation: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError> {
        expect_kind(mutation, FunctionKind::Mutation)?;
        self.server.call(mutation, args)
    }

    fn subscribe(
        &self,
        query: FunctionRef,
        args: JsonValue,
        callback: ResultCallback,
    ) -> Result<Unsubscribe, ChatError> {
        expect_kind(query, FunctionKind::Query)?;
        let key = cache_key(query, &args);

        let weak_server: Weak<MessageServer> = Arc::downgrade(&self.server);
        let cache = Arc::clone(&self.cache);
        let gate = Arc::clone(&self.gate);
        let watch_key = key.clone();
        let watch_args = args.clone();
        let watch_callback = Arc::clone(&callback);
        let handle = self.server.watch(
            query,
            Arc::new(move || match weak_server.upgrade() {
                Some(server) => {
                    refresh_cached(&server, &gate, &cache, &watch_key, query, &watch_args, &watch_callback)
                }
                None => watch_callback(Err(server_gone())),
            }),
        )?;

        if let Ok(mut entries) = self.cache.lock() {
            entries.entry(key.clone()).or_default().subscribers += 1;
        }
        refresh_cached(&self.server, &self.gate, &self.cache, &key, query, &args, &callback);

        let cache = Arc::clone(&self.cache);
        Ok(Unsubscribe::new(move || {
            drop(handle);
            if let Ok(mut entries) = cache.lock() {
                let remaining = entries.get_mut(&key).map(|entry| {
                    entry.subscribers = entry.subscribers.saturating_sub(1);
                    entry.subscribers
                });
                if remaining == Some(0) {
                    entries.remove(&key);
                }
            }
            debug!("Push subscription to {key} closed");
        }))
    }
}

pub struct PollTransport {
    server: Arc<MessageServer>,
}

impl PollTransport {
    pub fn new(server: Arc<MessageServer>) -> Self {
        Self { server }
    }
}

impl SyncTransport for PollTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Poll
    }

    fn query(&self, query: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError> {
        expect_kind(query, FunctionKind::Query)?;
        self.server.call(query, args)
    }

    fn mutation(&self, mutation: FunctionRef, args: JsonValue) -> Result<JsonValue, ChatError> {
        expect_kind(mutation, FunctionKind::Mutation)?;
        self.server.call(mutation, args)
    }

    fn subscribe(
        &self,
        query: FunctionRef,
        args: JsonValue,
        callback: ResultCallback,
    ) -> Result<Unsubscribe, ChatError> {
        expect_kind(query, FunctionKind::Query)?;

        let gate: DeliveryGate = Arc::new(Mutex::new(()));
        let weak_server: Weak<MessageServer> = Arc::downgrade(&self.server);
        let watch_gate = Arc::clone(&gate);
        let watch_args = args.clone();
        let watch_callback = Arc::clone(&callback);
        let handle = self.server.watch(
            query,
            Arc::new(move || {
                let _delivering = watch_gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                match weak_server.upgrade() {
                    Some(server) => watch_callback(server.call(query, watch_args.clone())),
                    None => watch_callback(Err(server_gone())),
                }
            }),
        )?;

        let delivering = gate.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        callback(self.server.call(query, args));
        drop(delivering);
        Ok(Unsubscribe::new(move || handle.unsubscribe()))
    }
}
