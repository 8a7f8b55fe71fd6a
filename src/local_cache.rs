//! LMDB persistence for a sync session.
//!
//! A session persists two things: the records the server has confirmed,
//! keyed by the digest of the record identifier (identifiers of any length
//! are allowed, LMDB keys are not), and the optimistic writes it has not heard
//! back about yet, keyed by operation id. Both survive a restart, which is
//! what lets a session show the last known messages before the first list
//! completes and replay unconfirmed writes.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction, WriteFlags};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::config::PersistConfig;
use crate::crud::CrudOp;
use crate::error::ChatError;
use crate::message_store::local_id_key;

pub type OperationId = u64;

/// An optimistic write waiting for the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingWrite {
    pub op: OperationId,
    pub kind: CrudOp,
    pub record_id: String,
    /// Full record for creates and updates, the last known record for deletes.
    pub value: JsonValue,
}

/// Stored value of the `confirmed` database.
#[derive(Serialize, Deserialize)]
struct CachedRecord {
    id: String,
    record: JsonValue,
}

pub struct LocalCache {
    env: Environment,
    confirmed: Database,
    pending: Database,
    path: PathBuf,
}

impl LocalCache {
    pub fn open(config: &PersistConfig) -> Result<Self, ChatError> {
        let path = config.lmdb_dir();
        std::fs::create_dir_all(&path)?;
        info!("Opening local cache at {}", path.display());

        let env = Environment::new()
            .set_max_dbs(2)
            .set_map_size(config.map_size)
            .open(&path)?;
        let confirmed = env.create_db(Some("confirmed"), DatabaseFlags::empty())?;
        let pending = env.create_db(Some("pending"), DatabaseFlags::empty())?;

        Ok(Self {
            env,
            confirmed,
            pending,
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load_confirmed(&self) -> Result<BTreeMap<String, JsonValue>, ChatError> {
        let txn = self.env.begin_ro_txn()?;
        let mut records = BTreeMap::new();
        {
            let mut cursor = txn.open_ro_cursor(self.confirmed)?;
            for (_key, value) in cursor.iter_start() {
                match serde_json::from_slice::<CachedRecord>(value) {
                    Ok(cached) => {
                        records.insert(cached.id, cached.record);
                    }
                    Err(e) => warn!("Skipping unreadable cached record: {e}"),
                }
            }
        }
        debug!("Loaded {} confirmed records from cache", records.len());
        Ok(records)
    }

    /// Replaces the stored confirmed records with `records`.
    pub fn save_confirmed(&self, records: &BTreeMap<String, JsonValue>) -> Result<(), ChatError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.confirmed)?;
        for (id, record) in records {
            let json = serde_json::to_vec(&CachedRecord {
                id: id.clone(),
                record: record.clone(),
            })?;
            txn.put(self.confirmed, &local_id_key(id), &json, WriteFlags::empty())?;
        }
        txn.commit()?;
        Ok(())
    }

    /// Pending writes in operation order.
    pub fn load_pending(&self) -> Result<Vec<PendingWrite>, ChatError> {
        let txn = self.env.begin_ro_txn()?;
        let mut writes = Vec::new();
        {
            let mut cursor = txn.open_ro_cursor(self.pending)?;
            for (_key, value) in cursor.iter_start() {
                writes.push(serde_json::from_slice(value)?);
            }
        }
        Ok(writes)
    }

    pub fn put_pending(&self, write: &PendingWrite) -> Result<(), ChatError> {
        let json = serde_json::to_vec(write)?;
        let mut txn = self.env.begin_rw_txn()?;
        txn.put(self.pending, &write.op.to_be_bytes(), &json, WriteFlags::empty())?;
        txn.commit()?;
        Ok(())
    }

    /// Returns false when no such operation was stored.
    pub fn remove_pending(&self, op: OperationId) -> Result<bool, ChatError> {
        let mut txn = self.env.begin_rw_txn()?;
        match txn.del(self.pending, &op.to_be_bytes(), None) {
            Ok(()) => {
                txn.commit()?;
                Ok(true)
            }
            Err(lmdb::Error::NotFound) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    pub fn clear_all_records(&self) -> Result<(), ChatError> {
        let mut txn = self.env.begin_rw_txn()?;
        txn.clear_db(self.confirmed)?;
        txn.clear_db(self.pending)?;
        txn.commit()?;
        info!("Cleared local cache at {}", self.path.display());
        Ok(())
    }
}
