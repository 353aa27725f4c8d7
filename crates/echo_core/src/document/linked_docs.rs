//! Cache of linked documents.
//!
//! A link is only a string reference: dropping a link from the root document
//! does not unload or delete the linked document.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use super::space_doc::SpaceDoc;
use super::storage::CrdtStorage;
use crate::error::Result;

/// Loads, caches and saves the linked documents of a space.
///
/// # Example
///
/// ```ignore
/// use echo_core::document::{LinkedDocManager, MemoryStorage};
/// use std::sync::Arc;
///
/// let manager = LinkedDocManager::new(Arc::new(MemoryStorage::new()));
/// let doc = manager.get_or_create("root:4f1c");
/// manager.save_all()?;
/// ```
pub struct LinkedDocManager {
    storage: Arc<dyn CrdtStorage>,
    docs: RwLock<HashMap<String, Arc<SpaceDoc>>>,
}

impl LinkedDocManager {
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        Self {
            storage,
            docs: RwLock::new(HashMap::new()),
        }
    }

    pub fn storage(&self) -> &Arc<dyn CrdtStorage> {
        &self.storage
    }

    /// Get a document, loading it from storage if necessary.
    ///
    /// Returns `None` if storage has neither a state nor updates for it.
    pub fn get(&self, doc_id: &str) -> Option<Arc<SpaceDoc>> {
        {
            let docs = self.docs.read().unwrap();
            if let Some(doc) = docs.get(doc_id) {
                return Some(Arc::clone(doc));
            }
        }

        if !self.exists_in_storage(doc_id) {
            return None;
        }

        let mut docs = self.docs.write().unwrap();
        // Another thread may have loaded it while we waited
        if let Some(doc) = docs.get(doc_id) {
            return Some(Arc::clone(doc));
        }

        match SpaceDoc::load_with_name(Arc::clone(&self.storage), doc_id.to_string()) {
            Ok(doc) => {
                let doc = Arc::new(doc);
                docs.insert(doc_id.to_string(), Arc::clone(&doc));
                Some(doc)
            }
            Err(e) => {
                log::error!("Failed to load linked document {}: {}", doc_id, e);
                None
            }
        }
    }

    /// Get a document, creating an empty one if it doesn't exist.
    pub fn get_or_create(&self, doc_id: &str) -> Arc<SpaceDoc> {
        {
            let docs = self.docs.read().unwrap();
            if let Some(doc) = docs.get(doc_id) {
                return Arc::clone(doc);
            }
        }

        let mut docs = self.docs.write().unwrap();
        if let Some(doc) = docs.get(doc_id) {
            return Arc::clone(doc);
        }

        let doc = match SpaceDoc::load_with_name(Arc::clone(&self.storage), doc_id.to_string()) {
            Ok(doc) => doc,
            Err(e) => {
                log::warn!("Recreating unreadable linked document {}: {}", doc_id, e);
                SpaceDoc::with_name(Arc::clone(&self.storage), doc_id.to_string())
            }
        };
        let doc = Arc::new(doc);
        docs.insert(doc_id.to_string(), Arc::clone(&doc));
        doc
    }

    /// Create a new empty document, replacing any cached one.
    pub fn create(&self, doc_id: &str) -> Arc<SpaceDoc> {
        let doc = Arc::new(SpaceDoc::with_name(
            Arc::clone(&self.storage),
            doc_id.to_string(),
        ));
        self.insert(doc_id, Arc::clone(&doc));
        doc
    }

    /// Cache an already built document.
    pub fn insert(&self, doc_id: &str, doc: Arc<SpaceDoc>) {
        let mut docs = self.docs.write().unwrap();
        docs.insert(doc_id.to_string(), doc);
    }

    pub fn is_loaded(&self, doc_id: &str) -> bool {
        let docs = self.docs.read().unwrap();
        docs.contains_key(doc_id)
    }

    /// Drop a document from the cache. Storage is untouched.
    pub fn unload(&self, doc_id: &str) -> Option<Arc<SpaceDoc>> {
        let mut docs = self.docs.write().unwrap();
        docs.remove(doc_id)
    }

    /// Ids of the cached documents, sorted.
    pub fn loaded_docs(&self) -> Vec<String> {
        let docs = self.docs.read().unwrap();
        let mut ids: Vec<String> = docs.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Save every cached document.
    pub fn save_all(&self) -> Result<()> {
        let docs = self.docs.read().unwrap();
        for doc in docs.values() {
            doc.save()?;
        }
        Ok(())
    }

    /// Save one cached document. Returns `false` if it isn't loaded.
    pub fn save(&self, doc_id: &str) -> Result<bool> {
        let docs = self.docs.read().unwrap();
        match docs.get(doc_id) {
            Some(doc) => {
                doc.save()?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn exists_in_storage(&self, doc_id: &str) -> bool {
        match self.storage.load_doc(doc_id) {
            Ok(Some(_)) => true,
            Ok(None) => self
                .storage
                .get_latest_update_id(doc_id)
                .is_ok_and(|id| id > 0),
            Err(e) => {
                log::warn!("Failed to check linked document {}: {}", doc_id, e);
                false
            }
        }
    }
}

impl std::fmt::Debug for LinkedDocManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LinkedDocManager")
            .field("loaded_docs", &self.loaded_docs())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::{MemoryStorage, ObjectStructure};
    use crate::keys::ObjectId;

    fn create_manager() -> LinkedDocManager {
        LinkedDocManager::new(Arc::new(MemoryStorage::new()))
    }

    #[test]
    fn test_get_or_create_caches() {
        let manager = create_manager();
        let first = manager.get_or_create("doc-1");
        let second = manager.get_or_create("doc-1");
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.is_loaded("doc-1"));
        assert_eq!(manager.loaded_docs(), vec!["doc-1".to_string()]);
    }

    #[test]
    fn test_get_missing_returns_none() {
        let manager = create_manager();
        assert!(manager.get("nope").is_none());
    }

    #[test]
    fn test_unload_then_get_reloads_from_storage() {
        let manager = create_manager();
        let id = ObjectId::from("o1");
        let doc = manager.create("doc-1");
        doc.create_object(&id, &ObjectStructure::default()).unwrap();

        manager.unload("doc-1");
        assert!(!manager.is_loaded("doc-1"));

        let reloaded = manager.get("doc-1").unwrap();
        assert!(reloaded.get_object(&id).unwrap().is_some());
    }

    #[test]
    fn test_save() {
        let manager = create_manager();
        manager.create("doc-1");
        assert!(manager.save("doc-1").unwrap());
        assert!(!manager.save("doc-2").unwrap());
        manager.save_all().unwrap();
        assert!(manager.storage().load_doc("doc-1").unwrap().is_some());
    }
}
