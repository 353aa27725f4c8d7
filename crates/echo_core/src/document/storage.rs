//! Persistence for CRDT documents.
//!
//! Each document has a compacted state blob plus an append-only log of
//! incremental updates. Loading a document applies the state and then every
//! update recorded after it.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{EchoError, Result};

/// Where an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateOrigin {
    /// Made on this replica.
    Local,
    /// Received from a peer.
    Remote,
    /// Produced by a sync handshake.
    Sync,
    /// Produced by a schema migration.
    Migration,
}

impl UpdateOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            UpdateOrigin::Local => "local",
            UpdateOrigin::Remote => "remote",
            UpdateOrigin::Sync => "sync",
            UpdateOrigin::Migration => "migration",
        }
    }
}

impl fmt::Display for UpdateOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UpdateOrigin {
    type Err = EchoError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "local" => Ok(UpdateOrigin::Local),
            "remote" => Ok(UpdateOrigin::Remote),
            "sync" => Ok(UpdateOrigin::Sync),
            "migration" => Ok(UpdateOrigin::Migration),
            other => Err(EchoError::Storage(format!("unknown update origin '{}'", other))),
        }
    }
}

/// A stored incremental update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CrdtUpdate {
    pub update_id: i64,
    pub doc_name: String,
    pub data: Vec<u8>,
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    pub origin: UpdateOrigin,
}

/// Trait for CRDT document storage backends.
pub trait CrdtStorage: Send + Sync {
    /// Load the compacted document state. `None` if the document doesn't exist.
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>>;

    /// Save the compacted document state, replacing any previous one.
    ///
    /// Updates already folded into `state` are dropped from the log.
    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()>;

    /// Delete a document and all its updates.
    fn delete_doc(&self, name: &str) -> Result<()>;

    /// List all document names in storage.
    fn list_docs(&self) -> Result<Vec<String>>;

    /// Append an incremental update, returning its id.
    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64>;

    /// Updates with an id greater than `since_id`, oldest first.
    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>>;

    fn get_all_updates(&self, name: &str) -> Result<Vec<CrdtUpdate>> {
        self.get_updates_since(name, 0)
    }

    /// Id of the newest update, or 0 if there are none.
    fn get_latest_update_id(&self, name: &str) -> Result<i64>;

    /// Keep only the newest `keep_updates` entries of the update log.
    fn compact(&self, name: &str, keep_updates: usize) -> Result<()>;
}
