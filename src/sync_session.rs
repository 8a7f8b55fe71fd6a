//! Reactive sync session over a [`CrudBackend`].
//!
//! A session is created with [`SyncSession::init`], stays active until
//! [`SyncSession::dispose`], and keeps two layers of state:
//!
//! - confirmed records, as last listed or returned by the server, keyed by the
//!   backend's identifier field;
//! - an overlay of pending optimistic writes keyed by [`OperationId`].
//!
//! Reads see the overlay applied on top of the confirmed records. A write
//! enters the overlay, goes to the backend, and then either replaces the
//! confirmed record with the server's answer or is rolled back. Failures are
//! handed to the session's error handler and returned to the caller.
//!
//! With persistence configured, both layers are written to a [`LocalCache`];
//! pending writes found there at start-up are replayed when `retry_sync` is set.

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use log::{debug, error, info, warn};
use serde::de::DeserializeOwned;
use serde_json::Value as JsonValue;

use crate::config::{PersistConfig, SyncConfig};
use crate::crud::{merge_json, record_id, CrudBackend, CrudFields, CrudOp, ListCallback, SyncMode};
use crate::error::ChatError;
use crate::local_cache::{LocalCache, OperationId, PendingWrite};
use crate::transport::Unsubscribe;

/// Receives every error the session runs into.
pub type ErrorHandler = Arc<dyn Fn(&ChatError) + Send + Sync>;

#[derive(Clone, Default)]
pub struct SessionConfig {
    pub persist: Option<PersistConfig>,
    /// Defaults to logging the error.
    pub on_error: Option<ErrorHandler>,
}

impl SessionConfig {
    pub fn from_sync_config(config: &SyncConfig) -> Self {
        Self {
            persist: config.persist.clone(),
            on_error: None,
        }
    }

    pub fn with_error_handler(mut self, on_error: ErrorHandler) -> Self {
        self.on_error = Some(on_error);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Active,
    Disposed,
}

struct SessionData {
    state: SessionState,
    confirmed: BTreeMap<String, JsonValue>,
    pending: BTreeMap<OperationId, PendingWrite>,
    next_op: OperationId,
    listeners: Vec<Sender<Vec<JsonValue>>>,
}

struct SessionInner {
    backend: Arc<dyn CrudBackend>,
    fields: CrudFields,
    cache: Option<LocalCache>,
    on_error: ErrorHandler,
    data: Mutex<SessionData>,
    subscription: Mutex<Option<Unsubscribe>>,
}

pub struct SyncSession {
    inner: Arc<SessionInner>,
}

fn default_error_handler() -> ErrorHandler {
    Arc::new(|e: &ChatError| error!("Sync error {e}"))
}

fn created_at(record: &JsonValue, field: &str) -> f64 {
    record.get(field).and_then(JsonValue::as_f64).unwrap_or(f64::NEG_INFINITY)
}

impl SyncSession {
    /// Starts a session: restores cached state, lists, subscribes and, when
    /// configured, replays pending writes from an earlier run.
    ///
    /// A failing list does not prevent start-up; it is reported to the error
    /// handler and the session serves cached state until the next update.
    pub fn init(backend: Arc<dyn CrudBackend>, config: SessionConfig) -> Result<Self, ChatError> {
        let fields = backend.fields().clone();
        let on_error = config.on_error.unwrap_or_else(default_error_handler);

        let (cache, confirmed, pending) = match &config.persist {
            Some(persist) => {
                let cache = LocalCache::open(persist)?;
                let confirmed = cache.load_confirmed()?;
                let pending: BTreeMap<OperationId, PendingWrite> = cache
                    .load_pending()?
                    .into_iter()
                    .map(|write| (write.op, write))
                    .collect();
                (Some(cache), confirmed, pending)
            }
            None => (None, BTreeMap::new(), BTreeMap::new()),
        };
        let next_op = pending.keys().next_back().map_or(1, |op| op + 1);
        let restored = pending.len();

        let inner = Arc::new(SessionInner {
            backend,
            fields,
            cache,
            on_error,
            data: Mutex::new(SessionData {
                state: SessionState::Active,
                confirmed,
                pending,
                next_op,
                listeners: Vec::new(),
            }),
            subscription: Mutex::new(None),
        });
        let session = Self { inner };

        if let Err(e) = session.refresh() {
            warn!("Initial list failed, continuing with cached state: {e}");
        }
        session.start_subscription()?;

        let retry = config.persist.as_ref().is_some_and(|p| p.retry_sync);
        if restored > 0 {
            if retry {
                info!("Replaying {restored} pending writes");
                session.retry_pending();
            } else {
                info!("{restored} pending writes restored without replay");
            }
        }

        Ok(session)
    }

    fn start_subscription(&self) -> Result<(), ChatError> {
        let weak: Weak<SessionInner> = Arc::downgrade(&self.inner);
        let on_update: ListCallback = Arc::new(move |records: Result<Vec<JsonValue>, ChatError>| {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            match records {
                Ok(records) => inner.apply_snapshot(records),
                Err(e) => (inner.on_error)(&e),
            }
        });
        let handle = self.inner.backend.subscribe(on_update)?;
        if let Some(handle) = handle {
            *self.inner.lock_subscription() = Some(handle);
        }
        Ok(())
    }

    pub fn state(&self) -> SessionState {
        self.inner.lock_data().state
    }

    pub fn fields(&self) -> &CrudFields {
        &self.inner.fields
    }

    /// Fresh client identifier for a new record.
    pub fn generate_id() -> String {
        uuid::Uuid::new_v4().to_string()
    }

    /// All records with pending writes applied, newest `field_created_at` first.
    pub fn get(&self) -> Vec<JsonValue> {
        let data = self.inner.lock_data();
        self.inner.view(&data)
    }

    pub fn get_by_id(&self, id: &str) -> Option<JsonValue> {
        let data = self.inner.lock_data();
        self.inner.view_record(&data, id)
    }

    /// The current view deserialized into `T`.
    pub fn records_as<T: DeserializeOwned>(&self) -> Result<Vec<T>, ChatError> {
        self.get()
            .into_iter()
            .map(|record| serde_json::from_value(record).map_err(ChatError::from))
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock_data().pending.len()
    }

    /// Receives the full view after every change to it.
    pub fn watch(&self) -> Receiver<Vec<JsonValue>> {
        let (sender, receiver) = mpsc::channel();
        self.inner.lock_data().listeners.push(sender);
        receiver
    }

    /// Creates the record `id` when it does not exist, otherwise updates it by
    /// merging `fields` into it. Returns the record as confirmed by the backend.
    pub fn assign(&self, id: &str, fields: JsonValue) -> Result<JsonValue, ChatError> {
        if !fields.is_object() {
            return Err(ChatError::BadRequest("assigned fields must be an object".to_string()));
        }
        let existing = {
            let data = self.inner.lock_data();
            self.inner.ensure_active(&data)?;
            self.inner.view_record(&data, id)
        };

        let (kind, mut value) = match existing {
            Some(mut record) => {
                merge_json(&mut record, &fields);
                (CrudOp::Update, record)
            }
            None => (CrudOp::Create, fields),
        };
        if let JsonValue::Object(map) = &mut value {
            map.insert(self.inner.fields.field_id.clone(), JsonValue::String(id.to_string()));
        }

        let write = self.inner.enqueue(kind, id, value)?;
        self.inner.send(write)
    }

    /// Merges `fields` into the existing record `id`. Never creates; an unknown
    /// `id` fails with [`ChatError::NotFound`] without reaching the backend.
    pub fn update(&self, id: &str, fields: JsonValue) -> Result<JsonValue, ChatError> {
        if !fields.is_object() {
            return Err(ChatError::BadRequest("updated fields must be an object".to_string()));
        }
        let existing = {
            let data = self.inner.lock_data();
            self.inner.ensure_active(&data)?;
            self.inner.view_record(&data, id)
        };
        let Some(mut record) = existing else {
            return Err(ChatError::NotFound(id.to_string()));
        };
        merge_json(&mut record, &fields);
        if let JsonValue::Object(map) = &mut record {
            map.insert(self.inner.fields.field_id.clone(), JsonValue::String(id.to_string()));
        }

        let write = self.inner.enqueue(CrudOp::Update, id, record)?;
        self.inner.send(write)
    }

    pub fn delete(&self, id: &str) -> Result<(), ChatError> {
        let existing = {
            let data = self.inner.lock_data();
            self.inner.ensure_active(&data)?;
            self.inner.view_record(&data, id)
        };
        let Some(record) = existing else {
            return Err(ChatError::NotFound(id.to_string()));
        };

        let write = self.inner.enqueue(CrudOp::Delete, id, record)?;
        self.inner.send(write)?;
        Ok(())
    }

    /// Lists from the backend and folds the result into the confirmed records.
    pub fn refresh(&self) -> Result<(), ChatError> {
        self.inner.ensure_active(&self.inner.lock_data())?;
        match self.inner.backend.list() {
            Ok(records) => {
                self.inner.apply_snapshot(records);
                Ok(())
            }
            Err(e) => {
                (self.inner.on_error)(&e);
                Err(e)
            }
        }
    }

    /// Sends every pending write again, oldest first. Returns how many were confirmed.
    pub fn retry_pending(&self) -> usize {
        let writes: Vec<PendingWrite> = self.inner.lock_data().pending.values().cloned().collect();
        writes
            .into_iter()
            .filter(|write| self.inner.send(write.clone()).is_ok())
            .count()
    }

    /// Stops live updates, persists the final state and closes watchers.
    /// Every later operation fails with [`ChatError::SessionDisposed`].
    pub fn dispose(&self) {
        let subscription = self.inner.lock_subscription().take();
        if let Some(subscription) = subscription {
            subscription.unsubscribe();
        }

        let mut data = self.inner.lock_data();
        if data.state == SessionState::Disposed {
            return;
        }
        data.state = SessionState::Disposed;
        data.listeners.clear();
        self.inner.persist_confirmed(&data);
        info!("Sync session disposed with {} pending writes", data.pending.len());
    }
}

impl SessionInner {
    fn lock_data(&self) -> MutexGuard<'_, SessionData> {
        self.data.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_subscription(&self) -> MutexGuard<'_, Option<Unsubscribe>> {
        self.subscription
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn ensure_active(&self, data: &SessionData) -> Result<(), ChatError> {
        match data.state {
            SessionState::Active => Ok(()),
            SessionState::Disposed => Err(ChatError::SessionDisposed),
        }
    }

    fn overlay(&self, data: &SessionData) -> BTreeMap<String, JsonValue> {
        let mut merged = data.confirmed.clone();
        for write in data.pending.values() {
            match write.kind {
                CrudOp::Create | CrudOp::Update => {
                    merged
                        .entry(write.record_id.clone())
                        .and_modify(|record| merge_json(record, &write.value))
                        .or_insert_with(|| write.value.clone());
                }
                CrudOp::Delete => {
                    merged.remove(&write.record_id);
                }
            }
        }
        merged
    }

    fn view(&self, data: &SessionData) -> Vec<JsonValue> {
        let field = &self.fields.field_created_at;
        let mut records: Vec<(String, JsonValue)> = self.overlay(data).into_iter().collect();
        records.sort_by(|(a_id, a), (b_id, b)| {
            created_at(b, field)
                .partial_cmp(&created_at(a, field))
                .unwrap_or(Ordering::Equal)
                .then_with(|| a_id.cmp(b_id))
        });
        records.into_iter().map(|(_, record)| record).collect()
    }

    fn view_record(&self, data: &SessionData, id: &str) -> Option<JsonValue> {
        self.overlay(data).remove(id)
    }

    /// Subscription snapshots arrive in fetch order; the transports gate
    /// delivery per subscription. A concurrent explicit `refresh` may still
    /// interleave with one.
    fn apply_snapshot(&self, records: Vec<JsonValue>) {
        let mut data = self.lock_data();
        if data.state == SessionState::Disposed {
            return;
        }

        let mut incoming = BTreeMap::new();
        for record in records {
            match record_id(&record, &self.fields.field_id) {
                Some(id) => {
                    incoming.insert(id.to_string(), record);
                }
                None => warn!("Ignoring listed record without {}", self.fields.field_id),
            }
        }
        debug!("Applying snapshot of {} records ({:?})", incoming.len(), self.fields.mode);

        match self.fields.mode {
            SyncMode::Set => data.confirmed = incoming,
            SyncMode::Assign => data.confirmed.extend(incoming),
            SyncMode::Merge => {
                for (id, record) in incoming {
                    let existing = data
                        .confirmed
                        .entry(id)
                        .or_insert_with(|| JsonValue::Object(Default::default()));
                    merge_json(existing, &record);
                }
            }
        }

        self.persist_confirmed(&data);
        self.notify(&mut data);
    }

    /// Puts a write into the overlay and the cache.
    fn enqueue(&self, kind: CrudOp, id: &str, value: JsonValue) -> Result<PendingWrite, ChatError> {
        let mut data = self.lock_data();
        self.ensure_active(&data)?;

        let write = PendingWrite {
            op: data.next_op,
            kind,
            record_id: id.to_string(),
            value,
        };
        data.next_op += 1;
        data.pending.insert(write.op, write.clone());
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put_pending(&write) {
                (self.on_error)(&e);
            }
        }
        debug!("Queued {} of {id} as operation {}", write.kind, write.op);

        self.notify(&mut data);
        Ok(write)
    }

    /// Sends a queued write and reconciles the outcome. Must not be called
    /// with the data lock held: the backend may push a snapshot synchronously.
    fn send(&self, write: PendingWrite) -> Result<JsonValue, ChatError> {
        let result = match write.kind {
            CrudOp::Create => self.backend.create(&write.value),
            CrudOp::Update => self.backend.update(&write.value),
            CrudOp::Delete => self.backend.delete(&write.value),
        };

        let mut data = self.lock_data();
        if data.pending.remove(&write.op).is_none() {
            debug!("Operation {} was already reconciled", write.op);
        }
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.remove_pending(write.op) {
                (self.on_error)(&e);
            }
        }

        let outcome = match result {
            Ok(confirmed) => {
                // Without a configured mutation the local value is authoritative.
                let record = confirmed.unwrap_or_else(|| write.value.clone());
                match write.kind {
                    CrudOp::Create | CrudOp::Update => {
                        data.confirmed.insert(write.record_id.clone(), record.clone());
                    }
                    CrudOp::Delete => {
                        data.confirmed.remove(&write.record_id);
                    }
                }
                self.persist_confirmed(&data);
                Ok(record)
            }
            Err(e) => {
                if e.is_rejection() {
                    warn!("{} of {} rejected: {e}", write.kind, write.record_id);
                }
                Err(e)
            }
        };

        self.notify(&mut data);
        drop(data);

        if let Err(e) = &outcome {
            (self.on_error)(e);
        }
        outcome
    }

    fn persist_confirmed(&self, data: &SessionData) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save_confirmed(&data.confirmed) {
                (self.on_error)(&e);
            }
        }
    }

    fn notify(&self, data: &mut SessionData) {
        if data.listeners.is_empty() {
            return;
        }
        let view = self.view(data);
        data.listeners
            .retain(|listener| listener.send(view.clone()).is_ok());
    }
}
