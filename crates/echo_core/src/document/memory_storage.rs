//! In-memory CRDT storage for tests and ephemeral documents.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::storage::{CrdtStorage, CrdtUpdate, UpdateOrigin};
use crate::error::Result;

/// In-memory CRDT storage.
///
/// Thread-safe via `RwLock`; data is lost when dropped.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    docs: Arc<RwLock<HashMap<String, Vec<u8>>>>,
    updates: Arc<RwLock<HashMap<String, Vec<CrdtUpdate>>>>,
    next_id: Arc<RwLock<i64>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_update_id(&self) -> i64 {
        let mut id = self.next_id.write().unwrap();
        *id += 1;
        *id
    }
}

impl CrdtStorage for MemoryStorage {
    fn load_doc(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let docs = self.docs.read().unwrap();
        Ok(docs.get(name).cloned())
    }

    fn save_doc(&self, name: &str, state: &[u8]) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();
        docs.insert(name.to_string(), state.to_vec());
        updates.remove(name);
        Ok(())
    }

    fn delete_doc(&self, name: &str) -> Result<()> {
        let mut docs = self.docs.write().unwrap();
        let mut updates = self.updates.write().unwrap();
        docs.remove(name);
        updates.remove(name);
        Ok(())
    }

    fn list_docs(&self) -> Result<Vec<String>> {
        let docs = self.docs.read().unwrap();
        let updates = self.updates.read().unwrap();
        let mut names: Vec<String> = docs.keys().chain(updates.keys()).cloned().collect();
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn append_update(&self, name: &str, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        let id = self.next_update_id();
        let stored = CrdtUpdate {
            update_id: id,
            doc_name: name.to_string(),
            data: update.to_vec(),
            timestamp: chrono::Utc::now().timestamp_millis(),
            origin,
        };

        let mut updates = self.updates.write().unwrap();
        updates.entry(name.to_string()).or_default().push(stored);
        Ok(id)
    }

    fn get_updates_since(&self, name: &str, since_id: i64) -> Result<Vec<CrdtUpdate>> {
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .map(|log| {
                log.iter()
                    .filter(|update| update.update_id > since_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    fn get_latest_update_id(&self, name: &str) -> Result<i64> {
        let updates = self.updates.read().unwrap();
        Ok(updates
            .get(name)
            .and_then(|log| log.last())
            .map(|update| update.update_id)
            .unwrap_or(0))
    }

    fn compact(&self, name: &str, keep_updates: usize) -> Result<()> {
        let mut updates = self.updates.write().unwrap();
        if let Some(log) = updates.get_mut(name)
            && log.len() > keep_updates
        {
            let drain_count = log.len() - keep_updates;
            log.drain(0..drain_count);
        }
        Ok(())
    }
}
