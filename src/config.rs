//! Configuration for the record store and sync sessions.
//!
//! Every field has a default, so an empty JSON object is a valid configuration:
//!
//! ```rust
//! use realtime_chat_core::config::SyncConfig;
//!
//! let config = SyncConfig::from_json_str("{}").unwrap();
//! assert_eq!(config.field_id, "localId");
//! assert!(config.persist.is_none());
//! ```

use std::path::{Path, PathBuf};

use log::info;
use serde::{Deserialize, Serialize};

use crate::crud::SyncMode;
use crate::error::ChatError;
use crate::transport::TransportKind;

const DEFAULT_MAP_SIZE: usize = 10 * 1024 * 1024;

/// Where and how large the LMDB record store is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Base name; the environment lives in `<name>.lmdb`.
    pub name: String,
    pub map_size: usize,
}

impl StoreConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn lmdb_dir(&self) -> PathBuf {
        PathBuf::from(format!("{}.lmdb", self.name))
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: "messages".to_string(),
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}

/// Local persistence of a sync session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistConfig {
    /// Base name; the cache lives in `<name>.lmdb`.
    pub name: String,
    /// Replay pending writes left over from a previous run when the session starts.
    pub retry_sync: bool,
    pub map_size: usize,
}

impl PersistConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn lmdb_dir(&self) -> PathBuf {
        PathBuf::from(format!("{}.lmdb", self.name))
    }
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            name: "chat_cache".to_string(),
            retry_sync: true,
            map_size: DEFAULT_MAP_SIZE,
        }
    }
}

/// Top-level configuration of a chat client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub store: StoreConfig,
    pub transport: TransportKind,
    pub mode: SyncMode,
    /// Field the sync engine treats as the record identifier.
    pub field_id: String,
    /// Field the sync engine orders records by.
    pub field_created_at: String,
    /// Fields removed from a record before it is sent to a mutation.
    pub strip_fields: Vec<String>,
    pub persist: Option<PersistConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            store: StoreConfig::default(),
            transport: TransportKind::default(),
            mode: SyncMode::default(),
            field_id: "localId".to_string(),
            field_created_at: "localCreatedAt".to_string(),
            strip_fields: vec![
                "_id".to_string(),
                "_creationTime".to_string(),
                "serverCreatedAt".to_string(),
            ],
            persist: None,
        }
    }
}

impl SyncConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ChatError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ChatError> {
        let path = path.as_ref();
        info!("Loading sync configuration from {}", path.display());
        let raw = std::fs::read_to_string(path)?;
        Self::from_json_str(&raw)
    }
}
