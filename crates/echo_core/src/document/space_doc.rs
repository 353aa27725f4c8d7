//! The root CRDT document of a space.
//!
//! # Structure
//!
//! ```text
//! Y.Doc
//! ├── Y.Map "objects"
//! │   ├── "<object-id>" → Y.Map { system, meta, data }
//! │   └── ...
//! └── Y.Map "links"
//!     └── "<object-id>" → "<linked document id>"
//! ```
//!
//! Small objects are stored inline under `objects`. An object promoted to its
//! own document is removed from `objects` and recorded under `links`; the
//! linked document holds it under its own `objects` map.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde_json::{Map as JsonMap, Value};
use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Any, Assoc, Doc, IndexedSequence, Map, MapRef, Origin, Out, ReadTxn, StateVector,
    StickyIndex, TextPrelim, Transact, TransactionMut, Update,
};

use super::convert::{apply_text_diff, insert_json, map_to_json, out_to_json};
use super::linked_docs::LinkedDocManager;
use super::migration;
use super::storage::{CrdtStorage, CrdtUpdate, UpdateOrigin};
use super::types::ObjectStructure;
use crate::dxn::Dxn;
use crate::error::{EchoError, Result};
use crate::keys::ObjectId;
use crate::snapshot::{DocumentSnapshot, EncodedDoc};

/// Name of the Y.Map holding inline objects.
pub const OBJECTS_MAP_NAME: &str = "objects";

/// Name of the Y.Map holding links to promoted objects.
pub const LINKS_MAP_NAME: &str = "links";

/// Document name used for the root document in storage.
const ROOT_DOC_NAME: &str = "root";

const SYSTEM_KEY: &str = "system";
const DATA_KEY: &str = "data";
const DELETED_KEY: &str = "deleted";

/// What a reference points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResolvedRef {
    /// An object stored inline in this document.
    Inline(ObjectId),
    /// An object promoted to the linked document `doc_id`.
    Linked { object_id: ObjectId, doc_id: String },
    /// A schema type. Types are resolved by the schema registry, not here.
    Type(Dxn),
    /// An object in another space or a queue; not checked locally.
    External(Dxn),
}

/// A position in an object's text field that follows concurrent edits.
#[derive(Debug, Clone)]
pub struct Cursor {
    object_id: ObjectId,
    field: String,
    position: StickyIndex,
}

impl Cursor {
    pub fn object_id(&self) -> &ObjectId {
        &self.object_id
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Binary encoding of the anchored position.
    pub fn encode_position(&self) -> Vec<u8> {
        self.position.encode_v1()
    }
}

/// The CRDT document holding a space's object graph.
///
/// Every local edit is recorded in storage as an incremental update, so a
/// document can be rebuilt with [`SpaceDoc::load`].
pub struct SpaceDoc {
    doc: Doc,
    objects: MapRef,
    links: MapRef,
    storage: Arc<dyn CrdtStorage>,
    doc_name: String,
}

impl SpaceDoc {
    /// Create a new empty root document.
    pub fn new(storage: Arc<dyn CrdtStorage>) -> Self {
        Self::with_name(storage, ROOT_DOC_NAME.to_string())
    }

    /// Create a new empty document stored under `doc_name`.
    pub fn with_name(storage: Arc<dyn CrdtStorage>, doc_name: String) -> Self {
        Self::from_doc(storage, doc_name, Doc::new())
    }

    /// Wrap an existing yrs document.
    pub fn from_doc(storage: Arc<dyn CrdtStorage>, doc_name: String, doc: Doc) -> Self {
        let objects = doc.get_or_insert_map(OBJECTS_MAP_NAME);
        let links = doc.get_or_insert_map(LINKS_MAP_NAME);
        Self {
            doc,
            objects,
            links,
            storage,
            doc_name,
        }
    }

    /// Build a document from an encoded full state, without touching storage.
    pub fn from_state(storage: Arc<dyn CrdtStorage>, doc_name: String, state: &[u8]) -> Result<Self> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            apply_encoded(&mut txn, state)?;
        }
        Ok(Self::from_doc(storage, doc_name, doc))
    }

    /// Load the root document from storage, or create an empty one.
    pub fn load(storage: Arc<dyn CrdtStorage>) -> Result<Self> {
        Self::load_with_name(storage, ROOT_DOC_NAME.to_string())
    }

    /// Load `doc_name` from its stored state plus every update recorded after it.
    pub fn load_with_name(storage: Arc<dyn CrdtStorage>, doc_name: String) -> Result<Self> {
        let doc = Doc::new();
        {
            let mut txn = doc.transact_mut();
            if let Some(state) = storage.load_doc(&doc_name)? {
                apply_encoded(&mut txn, &state)?;
            }

            for crdt_update in storage.get_all_updates(&doc_name)? {
                if let Err(e) = apply_encoded(&mut txn, &crdt_update.data) {
                    log::warn!(
                        "Skipping update {} of document {}: {}",
                        crdt_update.update_id,
                        doc_name,
                        e
                    );
                }
            }
        }
        Ok(Self::from_doc(storage, doc_name, doc))
    }

    pub fn doc(&self) -> &Doc {
        &self.doc
    }

    pub fn doc_name(&self) -> &str {
        &self.doc_name
    }

    pub fn storage(&self) -> &Arc<dyn CrdtStorage> {
        &self.storage
    }

    // ==================== Objects ====================

    /// Insert a new inline object.
    ///
    /// Relations are checked first: both endpoints must resolve.
    pub fn create_object(&self, id: &ObjectId, structure: &ObjectStructure) -> Result<()> {
        if self.contains_object(id) {
            return Err(EchoError::Invariant(format!("object {} already exists", id)));
        }
        if structure.is_relation() {
            self.check_endpoints(id, structure)?;
        }
        let value = structure.to_json()?;

        self.record(|txn| {
            insert_json(&self.objects, txn, id.as_str(), &value);
            Ok(())
        })?;
        log::debug!("Created object {} in {}", id, self.doc_name);
        Ok(())
    }

    /// Insert a relation from `source` to `target`.
    pub fn create_relation(
        &self,
        id: &ObjectId,
        type_ref: Option<Dxn>,
        source: Dxn,
        target: Dxn,
        data: JsonMap<String, Value>,
    ) -> Result<()> {
        let structure = ObjectStructure::relation(type_ref, source, target, data);
        self.create_object(id, &structure)
    }

    /// Get an inline object.
    pub fn get_object(&self, id: &ObjectId) -> Result<Option<ObjectStructure>> {
        let txn = self.doc.transact();
        match self.objects.get(&txn, id.as_str()) {
            Some(out) => Ok(Some(ObjectStructure::from_json(&out_to_json(&out, &txn))?)),
            None => Ok(None),
        }
    }

    /// Whether `id` is stored inline or linked from this document.
    pub fn contains_object(&self, id: &ObjectId) -> bool {
        let txn = self.doc.transact();
        self.objects.contains_key(&txn, id.as_str()) || self.links.contains_key(&txn, id.as_str())
    }

    /// All inline objects, including deleted ones, ordered by id.
    pub fn list_objects(&self) -> Result<Vec<(ObjectId, ObjectStructure)>> {
        let txn = self.doc.transact();
        let mut objects = self
            .objects
            .iter(&txn)
            .map(|(id, out)| {
                let structure = ObjectStructure::from_json(&out_to_json(&out, &txn))?;
                Ok((ObjectId::from(id), structure))
            })
            .collect::<Result<Vec<_>>>()?;
        objects.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(objects)
    }

    /// Inline objects that are not deleted.
    pub fn list_active_objects(&self) -> Result<Vec<(ObjectId, ObjectStructure)>> {
        Ok(self
            .list_objects()?
            .into_iter()
            .filter(|(_, structure)| !structure.is_deleted())
            .collect())
    }

    pub fn object_count(&self) -> usize {
        let txn = self.doc.transact();
        self.objects.len(&txn) as usize
    }

    /// Read one data field of an inline object.
    pub fn get_field(&self, id: &ObjectId, key: &str) -> Option<Value> {
        let txn = self.doc.transact();
        let data = section(&self.objects, &txn, id, DATA_KEY)?;
        data.get(&txn, key).map(|out| out_to_json(&out, &txn))
    }

    /// Write one data field of an inline object.
    pub fn set_field(&self, id: &ObjectId, key: &str, value: &Value) -> Result<()> {
        self.record(|txn| {
            let data = existing_section(&self.objects, txn, id, DATA_KEY)?;
            insert_json(&data, txn, key, value);
            Ok(())
        })
    }

    /// Remove one data field of an inline object.
    pub fn unset_field(&self, id: &ObjectId, key: &str) -> Result<()> {
        self.record(|txn| {
            let data = existing_section(&self.objects, txn, id, DATA_KEY)?;
            data.remove(txn, key);
            Ok(())
        })
    }

    /// Write a collaborative text field.
    ///
    /// An existing text is edited with a minimal diff; a plain value is
    /// replaced by a new text.
    pub fn set_text(&self, id: &ObjectId, key: &str, content: &str) -> Result<()> {
        self.record(|txn| {
            let data = existing_section(&self.objects, txn, id, DATA_KEY)?;
            match data.get(&*txn, key) {
                Some(Out::YText(text)) => {
                    apply_text_diff(&text, txn, content);
                }
                _ => {
                    data.insert(txn, key, TextPrelim::new(content));
                }
            }
            Ok(())
        })
    }

    /// Mark an object deleted. Objects are never removed.
    pub fn delete_object(&self, id: &ObjectId) -> Result<()> {
        self.record(|txn| {
            let system = existing_section(&self.objects, txn, id, SYSTEM_KEY)?;
            system.insert(txn, DELETED_KEY, Any::Bool(true));
            Ok(())
        })?;
        log::debug!("Deleted object {} in {}", id, self.doc_name);
        Ok(())
    }

    // ==================== Links ====================

    /// Record that `id` lives in the linked document `doc_id`.
    pub fn link_object(&self, id: &ObjectId, doc_id: &str) -> Result<()> {
        self.record(|txn| {
            self.links.insert(txn, id.as_str(), doc_id);
            Ok(())
        })
    }

    /// Linked document id of `id`, if it was promoted.
    pub fn linked_doc_id(&self, id: &ObjectId) -> Option<String> {
        let txn = self.doc.transact();
        match self.links.get(&txn, id.as_str()) {
            Some(Out::Any(Any::String(doc_id))) => Some(doc_id.to_string()),
            _ => None,
        }
    }

    /// Every link, keyed by object id.
    pub fn links(&self) -> BTreeMap<ObjectId, String> {
        let txn = self.doc.transact();
        self.links
            .iter(&txn)
            .filter_map(|(id, out)| match out {
                Out::Any(Any::String(doc_id)) => Some((ObjectId::from(id), doc_id.to_string())),
                _ => None,
            })
            .collect()
    }

    /// Move an inline object into its own linked document.
    ///
    /// Returns the new document id. The root keeps only the link.
    pub fn promote_to_linked(&self, id: &ObjectId, manager: &LinkedDocManager) -> Result<String> {
        let structure = self
            .get_object(id)?
            .ok_or_else(|| EchoError::UnresolvedReference(format!("object {} not found", id)))?;

        let doc_id = format!("{}:{}", self.doc_name, uuid::Uuid::new_v4());
        let linked = manager.create(&doc_id);
        linked.create_object(id, &structure)?;

        self.record(|txn| {
            self.objects.remove(txn, id.as_str());
            self.links.insert(txn, id.as_str(), doc_id.as_str());
            Ok(())
        })?;
        log::info!("Promoted object {} to linked document {}", id, doc_id);
        Ok(doc_id)
    }

    // ==================== References ====================

    /// Dereference `dxn` against this document.
    ///
    /// Local object references that match neither an inline object nor a
    /// link fail with `UnresolvedReference`.
    pub fn resolve(&self, dxn: &Dxn) -> Result<ResolvedRef> {
        match dxn {
            Dxn::Type { .. } => Ok(ResolvedRef::Type(dxn.clone())),
            Dxn::Echo {
                space: Some(_), ..
            }
            | Dxn::Queue { .. } => Ok(ResolvedRef::External(dxn.clone())),
            Dxn::Echo {
                space: None,
                object,
            } => {
                let txn = self.doc.transact();
                if self.objects.contains_key(&txn, object.as_str()) {
                    return Ok(ResolvedRef::Inline(object.clone()));
                }
                match self.links.get(&txn, object.as_str()) {
                    Some(Out::Any(Any::String(doc_id))) => Ok(ResolvedRef::Linked {
                        object_id: object.clone(),
                        doc_id: doc_id.to_string(),
                    }),
                    _ => Err(EchoError::UnresolvedReference(dxn.to_string())),
                }
            }
        }
    }

    /// Check every inline relation's endpoints, returning one error per
    /// broken relation.
    pub fn validate_relations(&self) -> Result<Vec<EchoError>> {
        let mut errors = Vec::new();
        for (id, structure) in self.list_objects()? {
            if structure.is_relation()
                && let Err(e) = self.check_endpoints(&id, &structure)
            {
                errors.push(e);
            }
        }
        Ok(errors)
    }

    fn check_endpoints(&self, id: &ObjectId, structure: &ObjectStructure) -> Result<()> {
        for endpoint in [&structure.system.source, &structure.system.target] {
            let Some(dxn) = endpoint else {
                return Err(EchoError::InvalidReference(format!(
                    "relation {} is missing an endpoint",
                    id
                )));
            };
            match self.resolve(dxn) {
                Ok(ResolvedRef::Type(_)) => {
                    return Err(EchoError::InvalidReference(format!(
                        "relation {} points at type {}",
                        id, dxn
                    )));
                }
                Ok(_) => {}
                Err(_) => {
                    return Err(EchoError::UnresolvedReference(format!(
                        "relation {} endpoint {}",
                        id, dxn
                    )));
                }
            }
        }
        Ok(())
    }

    // ==================== Cursors ====================

    /// Anchor a cursor at `index` in a text field.
    ///
    /// The cursor sticks to the character after it, so inserts before that
    /// character shift the resolved index.
    pub fn cursor(&self, id: &ObjectId, field: &str, index: u32) -> Result<Cursor> {
        let mut txn = self.doc.transact_mut();
        let data = existing_section(&self.objects, &mut txn, id, DATA_KEY)?;
        let Some(Out::YText(text)) = data.get(&txn, field) else {
            return Err(EchoError::Invariant(format!(
                "field '{}' of {} is not a text",
                field, id
            )));
        };
        let position = text.sticky_index(&mut txn, index, Assoc::After).ok_or_else(|| {
            EchoError::Invariant(format!("index {} out of range for '{}'", index, field))
        })?;

        Ok(Cursor {
            object_id: id.clone(),
            field: field.to_string(),
            position,
        })
    }

    /// Current index of `cursor`, or `None` if its anchor is gone.
    pub fn resolve_cursor(&self, cursor: &Cursor) -> Option<u32> {
        let txn = self.doc.transact();
        cursor.position.get_offset(&txn).map(|offset| offset.index)
    }

    // ==================== Migration ====================

    /// The whole document as plain data: `{"objects": {...}, "links": {...}}`.
    pub fn to_json(&self) -> Value {
        let txn = self.doc.transact();
        let mut root = JsonMap::new();
        root.insert(OBJECTS_MAP_NAME.to_string(), map_to_json(&self.objects, &txn));
        root.insert(LINKS_MAP_NAME.to_string(), map_to_json(&self.links, &txn));
        Value::Object(root)
    }

    /// A new document equal to `target`, forked from this one.
    ///
    /// Unchanged parts keep their history, so cursors into untouched text
    /// fields resolve the same way in the result.
    pub fn migrate(&self, target: &Value) -> Result<SpaceDoc> {
        let target = with_root_maps(target)?;
        let migrated = migration::migrate_document(&self.doc, &target)?;
        Ok(Self::from_doc(
            Arc::clone(&self.storage),
            self.doc_name.clone(),
            migrated,
        ))
    }

    /// Rewrite this document to equal `target` in one transaction.
    pub fn migrate_in_place(&self, target: &Value) -> Result<()> {
        let target = with_root_maps(target)?;
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        migration::migrate_in_place(&self.doc, &target)?;
        self.persist_since(&sv_before, UpdateOrigin::Migration)
    }

    // ==================== Snapshots ====================

    /// Capture this document and its linked documents.
    ///
    /// Linked documents are looked up through `manager`, loading them from
    /// storage when needed. Loaded documents without a link are included too.
    pub fn snapshot(&self, manager: &LinkedDocManager) -> DocumentSnapshot {
        let mut doc_ids: BTreeSet<String> = self.links().into_values().collect();
        doc_ids.extend(manager.loaded_docs());

        let mut linked = BTreeMap::new();
        for doc_id in doc_ids {
            match manager.get(&doc_id) {
                Some(doc) => {
                    linked.insert(doc_id, EncodedDoc(doc.encode_state_as_update()));
                }
                None => log::warn!("Linked document {} missing from snapshot", doc_id),
            }
        }

        DocumentSnapshot {
            root: self.encode_state_as_update(),
            linked,
        }
    }

    /// Rebuild the root and linked documents from a snapshot and save them.
    pub fn restore(
        storage: Arc<dyn CrdtStorage>,
        snapshot: &DocumentSnapshot,
    ) -> Result<(SpaceDoc, LinkedDocManager)> {
        let root = SpaceDoc::from_state(
            Arc::clone(&storage),
            ROOT_DOC_NAME.to_string(),
            &snapshot.root,
        )?;
        root.save()?;

        let manager = LinkedDocManager::new(Arc::clone(&storage));
        for (doc_id, state) in &snapshot.linked {
            let doc = SpaceDoc::from_state(Arc::clone(&storage), doc_id.clone(), &state.0)?;
            doc.save()?;
            manager.insert(doc_id, Arc::new(doc));
        }
        log::info!(
            "Restored root document with {} linked documents",
            snapshot.linked.len()
        );
        Ok((root, manager))
    }

    // ==================== Sync Operations ====================

    /// Encode the current state vector for the sync handshake.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full document state as an update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode only what a peer with `remote_state_vector` is missing.
    pub fn encode_diff(&self, remote_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = StateVector::decode_v1(remote_state_vector)
            .map_err(|e| EchoError::Crdt(format!("Failed to decode state vector: {}", e)))?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update from a peer and persist it. Returns the stored update id.
    ///
    /// The transaction is tagged with `origin` so observers can tell peer
    /// updates from local edits.
    pub fn apply_update(&self, update: &[u8], origin: UpdateOrigin) -> Result<i64> {
        {
            let mut txn = self.doc.transact_mut_with(origin.as_str());
            apply_encoded(&mut txn, update)?;
        }
        self.storage.append_update(&self.doc_name, update, origin)
    }

    // ==================== Persistence ====================

    /// Save the full state, folding the update log into it.
    pub fn save(&self) -> Result<()> {
        let state = self.encode_state_as_update();
        self.storage.save_doc(&self.doc_name, &state)
    }

    pub fn get_history(&self) -> Result<Vec<CrdtUpdate>> {
        self.storage.get_all_updates(&self.doc_name)
    }

    pub fn get_updates_since(&self, since_id: i64) -> Result<Vec<CrdtUpdate>> {
        self.storage.get_updates_since(&self.doc_name, since_id)
    }

    /// Run `change` in one transaction and record the resulting update.
    fn record<F, R>(&self, change: F) -> Result<R>
    where
        F: FnOnce(&mut TransactionMut) -> Result<R>,
    {
        let sv_before = {
            let txn = self.doc.transact();
            txn.state_vector()
        };
        let result = {
            let mut txn = self.doc.transact_mut();
            change(&mut txn)?
        };
        self.persist_since(&sv_before, UpdateOrigin::Local)?;
        Ok(result)
    }

    fn persist_since(&self, sv_before: &StateVector, origin: UpdateOrigin) -> Result<()> {
        let update = {
            let txn = self.doc.transact();
            txn.encode_state_as_update_v1(sv_before)
        };
        if !update.is_empty() {
            self.storage.append_update(&self.doc_name, &update, origin)?;
        }
        Ok(())
    }

    // ==================== Observers ====================

    /// Subscribe to document updates.
    ///
    /// The callback receives each committed transaction's binary update.
    /// Dropping the subscription unsubscribes.
    pub fn observe_updates<F>(&self, callback: F) -> Result<yrs::Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |_txn, event| {
                callback(&event.update);
            })
            .map_err(|e| EchoError::Crdt(format!("Failed to observe document updates: {}", e)))
    }

    /// Like [`observe_updates`](Self::observe_updates), skipping updates that
    /// arrived from peers through [`apply_update`](Self::apply_update).
    pub fn observe_local_updates<F>(&self, callback: F) -> Result<yrs::Subscription>
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        let from_peers: [Origin; 2] = [
            UpdateOrigin::Remote.as_str().into(),
            UpdateOrigin::Sync.as_str().into(),
        ];
        self.doc
            .observe_update_v1(move |txn, event| {
                if txn.origin().is_some_and(|origin| from_peers.contains(origin)) {
                    return;
                }
                callback(&event.update);
            })
            .map_err(|e| EchoError::Crdt(format!("Failed to observe document updates: {}", e)))
    }
}

impl std::fmt::Debug for SpaceDoc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SpaceDoc")
            .field("doc_name", &self.doc_name)
            .field("object_count", &self.object_count())
            .finish()
    }
}

fn apply_encoded(txn: &mut TransactionMut, update: &[u8]) -> Result<()> {
    let update = Update::decode_v1(update)
        .map_err(|e| EchoError::Crdt(format!("Failed to decode update: {}", e)))?;
    txn.apply_update(update)
        .map_err(|e| EchoError::Crdt(format!("Failed to apply update: {}", e)))
}

/// The `section` map (`system`, `meta` or `data`) of object `id`.
fn section<T: ReadTxn>(objects: &MapRef, txn: &T, id: &ObjectId, name: &str) -> Option<MapRef> {
    match objects.get(txn, id.as_str()) {
        Some(Out::YMap(object)) => match object.get(txn, name) {
            Some(Out::YMap(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// Like [`section`], creating the section map when the object lacks it.
fn existing_section(
    objects: &MapRef,
    txn: &mut TransactionMut,
    id: &ObjectId,
    name: &str,
) -> Result<MapRef> {
    let Some(Out::YMap(object)) = objects.get(&*txn, id.as_str()) else {
        return Err(EchoError::UnresolvedReference(format!("object {} not found", id)));
    };
    if let Some(map) = section(objects, &*txn, id, name) {
        return Ok(map);
    }
    Ok(object.insert(txn, name, yrs::MapPrelim::default()))
}

/// Fill in the root maps a migration target leaves out.
fn with_root_maps(target: &Value) -> Result<Value> {
    let Some(fields) = target.as_object() else {
        return Err(EchoError::InvalidMutation(
            "migration target must be an object".to_string(),
        ));
    };
    let mut fields = fields.clone();
    for name in [OBJECTS_MAP_NAME, LINKS_MAP_NAME] {
        fields
            .entry(name.to_string())
            .or_insert_with(|| Value::Object(JsonMap::new()));
    }
    Ok(Value::Object(fields))
}
