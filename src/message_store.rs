//! LMDB-backed record store for message documents.
//!
//! The environment holds three named databases:
//!
//! - `messages`: document JSON keyed by `u64::MAX - _id` in big-endian form, so a
//!   forward cursor walks the table newest first.
//! - `by_local_id`: secondary index from the SHA-256 digest of `localId` to
//!   `_id`. LMDB keys must be 1 to 511 bytes; the digest lets any `localId`,
//!   empty or long, be indexed. The full `localId` lives in the document and
//!   is compared on every lookup.
//! - `meta`: the `_id` sequence.
//!
//! Every public operation runs inside a single LMDB transaction. Writes that
//! depend on an existence check (`insert`, `update_by_local_id`,
//! `delete_by_local_id`) perform the check inside the same write transaction,
//! and LMDB serializes write transactions, so two concurrent inserts of the
//! same `localId` cannot both succeed.

use std::path::{Path, PathBuf};

use chrono::Utc;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, RwTransaction, Transaction, WriteFlags};
use log::{debug, info, warn};
use sha2::{Digest, Sha256};

use crate::config::StoreConfig;
use crate::error::ChatError;
use crate::message_model::{CreateArgs, StoreId, StoredMessage};

const MESSAGES_DB: &str = "messages";
const INDEX_DB: &str = "by_local_id";
const META_DB: &str = "meta";
const NEXT_ID_KEY: &str = "next_id";

pub struct MessageStore {
    env: Environment,
    messages: Database,
    by_local_id: Database,
    meta: Database,
    path: PathBuf,
}

fn document_key(id: StoreId) -> [u8; 8] {
    (u64::MAX - id).to_be_bytes()
}

/// Fixed-width LMDB key for a client identifier.
pub(crate) fn local_id_key(local_id: &str) -> [u8; 32] {
    Sha256::digest(local_id.as_bytes()).into()
}

fn decode_id(bytes: &[u8]) -> Result<StoreId, ChatError> {
    let raw: [u8; 8] = bytes
        .try_into()
        .map_err(|_| ChatError::BadRequest(format!("corrupt store id of {} bytes", bytes.len())))?;
    Ok(u64::from_be_bytes(raw))
}

fn now_millis() -> f64 {
    Utc::now().timestamp_millis() as f64
}

impl MessageStore {
    /// Opens (creating if needed) the store at `<name>.lmdb` with default sizing.
    pub fn init(name: String) -> Result<Self, ChatError> {
        Self::open(&StoreConfig::named(name))
    }

    pub fn open(config: &StoreConfig) -> Result<Self, ChatError> {
        let path = config.lmdb_dir();
        std::fs::create_dir_all(&path)?;
        info!("Opening message store at {}", path.display());

        let env = Environment::new()
            .set_max_dbs(3)
            .set_map_size(config.map_size)
            .open(&path)
            .map_err(|e| {
                warn!("Failed to open LMDB environment at {}: {e}", path.display());
                e
            })?;

        let messages = env.create_db(Some(MESSAGES_DB), DatabaseFlags::empty())?;
        let by_local_id = env.create_db(Some(INDEX_DB), DatabaseFlags::empty())?;
        let meta = env.create_db(Some(META_DB), DatabaseFlags::empty())?;

        Ok(Self {
            env,
            messages,
            by_local_id,
            meta,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Point lookup through the `localId` index.
    pub fn get_by_local_id(&self, local_id: &str) -> Result<Option<StoredMessage>, ChatError> {
        let txn = self.env.begin_ro_txn()?;
        self.find_in(&txn, local_id)
    }

    /// Inserts a new document, assigning `_id` and `_creationTime`.
    ///
    /// Fails with [`ChatError::DuplicateIdentifier`] when the `localId` is taken.
    pub fn insert(&self, args: CreateArgs) -> Result<StoredMessage, ChatError> {
        let mut txn = self.env.begin_rw_txn()?;
        let index_key = local_id_key(&args.local_id);

        match txn.get(self.by_local_id, &index_key) {
            Ok(bytes) => {
                let taken_by = decode_id(bytes)?;
                if self.find_in(&txn, &args.local_id)?.is_some() {
                    return Err(ChatError::DuplicateIdentifier(args.local_id));
                }
                warn!("Index slot of {} is held by _id {taken_by}", args.local_id);
                return Err(ChatError::BadRequest(format!(
                    "localId {} collides with an indexed identifier",
                    args.local_id
                )));
            }
            Err(lmdb::Error::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let id = self.next_id(&mut txn)?;
        let doc = StoredMessage {
            id,
            creation_time: now_millis(),
            local_id: args.local_id,
            local_created_at: args.local_created_at,
            author: args.author,
            body: args.body,
        };

        let json = serde_json::to_vec(&doc)?;
        txn.put(self.messages, &document_key(id), &json, WriteFlags::NO_OVERWRITE)?;
        txn.put(self.by_local_id, &index_key, &id.to_be_bytes(), WriteFlags::NO_OVERWRITE)
            .map_err(|e| match e {
                lmdb::Error::KeyExist => ChatError::DuplicateIdentifier(doc.local_id.clone()),
                other => other.into(),
            })?;
        txn.commit()?;

        debug!("Inserted message {} as _id {}", doc.local_id, id);
        Ok(doc)
    }

    /// Reads the document for `local_id`, lets `modify` change it and replaces
    /// the stored row wholesale. `_id`, `_creationTime` and `localId` are kept.
    pub fn update_by_local_id<F>(&self, local_id: &str, modify: F) -> Result<StoredMessage, ChatError>
    where
        F: FnOnce(&mut StoredMessage),
    {
        let mut txn = self.env.begin_rw_txn()?;
        let mut doc = self.load_in(&txn, local_id)?;
        let (id, creation_time) = (doc.id, doc.creation_time);

        modify(&mut doc);
        doc.id = id;
        doc.creation_time = creation_time;
        doc.local_id = local_id.to_string();

        let json = serde_json::to_vec(&doc)?;
        txn.put(self.messages, &document_key(id), &json, WriteFlags::empty())?;
        txn.commit()?;

        debug!("Replaced message {local_id}");
        Ok(doc)
    }

    /// Deletes the document for `local_id` and returns it.
    pub fn delete_by_local_id(&self, local_id: &str) -> Result<StoredMessage, ChatError> {
        let mut txn = self.env.begin_rw_txn()?;
        let doc = self.load_in(&txn, local_id)?;

        txn.del(self.messages, &document_key(doc.id), None)?;
        txn.del(self.by_local_id, &local_id_key(local_id), None)?;
        txn.commit()?;

        debug!("Deleted message {local_id}");
        Ok(doc)
    }

    /// The `limit` most recently inserted documents, newest first.
    pub fn take_recent(&self, limit: usize) -> Result<Vec<StoredMessage>, ChatError> {
        let txn = self.env.begin_ro_txn()?;
        let mut docs = Vec::with_capacity(limit.min(128));
        {
            let mut cursor = txn.open_ro_cursor(self.messages)?;
            for (_key, value) in cursor.iter_start().take(limit) {
                docs.push(serde_json::from_slice(value)?);
            }
        }
        Ok(docs)
    }

    pub fn count(&self) -> Result<usize, ChatError> {
        let txn = self.env.begin_ro_txn()?;
        let mut cursor = txn.open_ro_cursor(self.messages)?;
        let count = cursor.iter_start().count();
        Ok(count)
    }

    /// Removes every document and index entry. The `_id` sequence keeps counting.
    pub fn clear_all_records(&self) -> Result<usize, ChatError> {
        let cleared = self.count()?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.messages)?;
        txn.clear_db(self.by_local_id)?;
        txn.commit()?;

        info!("Cleared {cleared} messages from {}", self.path.display());
        Ok(cleared)
    }

    fn load_in(&self, txn: &RwTransaction<'_>, local_id: &str) -> Result<StoredMessage, ChatError> {
        self.find_in(txn, local_id)?
            .ok_or_else(|| ChatError::NotFound(local_id.to_string()))
    }

    /// Resolves `local_id` through the index and checks the document really
    /// carries that identifier.
    fn find_in<T: Transaction>(&self, txn: &T, local_id: &str) -> Result<Option<StoredMessage>, ChatError> {
        let id = match txn.get(self.by_local_id, &local_id_key(local_id)) {
            Ok(bytes) => decode_id(bytes)?,
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let doc: StoredMessage = match txn.get(self.messages, &document_key(id)) {
            Ok(bytes) => serde_json::from_slice(bytes)?,
            Err(lmdb::Error::NotFound) => {
                warn!("Index entry for {local_id} points at missing document {id}");
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        };
        if doc.local_id != local_id {
            warn!("Index entry for {local_id} resolves to {}", doc.local_id);
            return Ok(None);
        }
        Ok(Some(doc))
    }

    fn next_id(&self, txn: &mut RwTransaction<'_>) -> Result<StoreId, ChatError> {
        let id = match txn.get(self.meta, &NEXT_ID_KEY) {
            Ok(bytes) => decode_id(bytes)?,
            Err(lmdb::Error::NotFound) => 1,
            Err(e) => return Err(e.into()),
        };
        txn.put(self.meta, &NEXT_ID_KEY, &(id + 1).to_be_bytes(), WriteFlags::empty())?;
        Ok(id)
    }
}
