//! Keeps the set of materialized items and routes mutations to their models.

use std::sync::Arc;
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use super::envelope::MutationMeta;
use super::item::{Item, PendingMutation};
use super::model::{Model, ModelRegistry};
use crate::config::EchoConfig;
use crate::error::{EchoError, Result};
use crate::keys::ObjectId;
use crate::observer::{CallbackRegistry, EventCallback, SubscriptionId};
use crate::snapshot::{ObjectSnapshot, PendingSnapshot};

/// What happened to an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemUpdateKind {
    Created,
    Mutated,
    Deleted,
    /// The item's model was registered and its buffered mutations replayed.
    ModelResolved,
}

/// Notification emitted after an item changes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemUpdate {
    pub object_id: ObjectId,
    pub kind: ItemUpdateKind,
}

/// Result of routing one mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationOutcome {
    Applied,
    /// Already applied (or already buffered); nothing changed.
    Duplicate,
    /// Held until the item's model is registered.
    Buffered,
}

/// Selection of items for [`ItemManager::query`].
#[derive(Debug, Clone, Default)]
pub struct ItemFilter {
    pub model_type: Option<String>,
    pub ids: Option<Vec<ObjectId>>,
    pub include_deleted: bool,
}

impl ItemFilter {
    pub fn model_type(model_type: impl Into<String>) -> Self {
        Self {
            model_type: Some(model_type.into()),
            ..Self::default()
        }
    }

    fn matches(&self, item: &Item) -> bool {
        if item.is_deleted() && !self.include_deleted {
            return false;
        }
        if let Some(model_type) = &self.model_type
            && item.model_type() != model_type
        {
            return false;
        }
        if let Some(ids) = &self.ids
            && !ids.contains(item.id())
        {
            return false;
        }
        true
    }
}

/// Owns every item of a space, in creation order.
///
/// Items whose model is not yet registered are kept with a bounded buffer of
/// pending mutations. Registering the model later replays that buffer in
/// arrival order, so late binding never loses a mutation that fit in the
/// buffer window.
pub struct ItemManager {
    registry: Arc<ModelRegistry>,
    items: IndexMap<ObjectId, Item>,
    updates: CallbackRegistry<ItemUpdate>,
    buffer_capacity: usize,
    buffer_window: Duration,
}

impl ItemManager {
    pub fn new(registry: Arc<ModelRegistry>, config: &EchoConfig) -> Self {
        Self {
            registry,
            items: IndexMap::new(),
            updates: CallbackRegistry::new(),
            buffer_capacity: config.model_buffer_capacity,
            buffer_window: config.model_buffer_window(),
        }
    }

    pub fn registry(&self) -> &Arc<ModelRegistry> {
        &self.registry
    }

    // ==================== Queries ====================

    pub fn get(&self, object_id: &ObjectId) -> Option<&Item> {
        self.items.get(object_id)
    }

    pub fn contains(&self, object_id: &ObjectId) -> bool {
        self.items.contains_key(object_id)
    }

    /// All items, including tombstones, in creation order.
    pub fn items(&self) -> impl Iterator<Item = &Item> {
        self.items.values()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Resolved items matching `filter`, in creation order.
    pub fn query(&self, filter: &ItemFilter) -> Vec<&Item> {
        self.items
            .values()
            .filter(|item| item.is_resolved() && filter.matches(item))
            .collect()
    }

    // ==================== Observers ====================

    /// Subscribe to item updates.
    pub fn subscribe(&self, callback: EventCallback<ItemUpdate>) -> SubscriptionId {
        self.updates.subscribe(callback)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.updates.unsubscribe(id)
    }

    fn notify(&self, object_id: &ObjectId, kind: ItemUpdateKind) {
        self.updates.emit(&ItemUpdate {
            object_id: object_id.clone(),
            kind,
        });
    }

    // ==================== Mutation routing ====================

    /// Create an item from a genesis envelope.
    ///
    /// Returns `false` if an identical genesis was already processed. Links
    /// must name endpoints that already exist. An `initial` mutation is applied
    /// (or buffered) under the genesis record's own `(peer, seq)`; if it fails
    /// the item still exists and the error is returned.
    pub fn construct_item(
        &mut self,
        object_id: ObjectId,
        model_type: &str,
        source: Option<ObjectId>,
        target: Option<ObjectId>,
        initial: Option<&[u8]>,
        meta: &MutationMeta,
    ) -> Result<bool> {
        if let Some(existing) = self.items.get(&object_id) {
            if existing.model_type() == model_type {
                log::debug!("Ignoring duplicate genesis for {}", object_id);
                return Ok(false);
            }
            return Err(EchoError::CorruptMutation {
                object_id,
                peer: meta.peer_id.clone(),
                seq: meta.seq,
                reason: format!(
                    "genesis for model '{}' conflicts with existing model '{}'",
                    model_type,
                    existing.model_type()
                ),
            });
        }

        for endpoint in source.iter().chain(target.iter()) {
            if !self.items.contains_key(endpoint) {
                return Err(EchoError::UnresolvedReference(format!(
                    "link {} endpoint {} does not exist",
                    object_id, endpoint
                )));
            }
        }

        let model = self.registry.get(model_type);
        if model.is_none() {
            log::info!(
                "Model '{}' not registered yet; buffering mutations for {}",
                model_type,
                object_id
            );
        }

        let mut item = Item::new(object_id.clone(), model_type.to_string(), model);
        item.source = source;
        item.target = target;
        let mut result = Ok(true);
        match (initial, item.model.clone()) {
            (Some(payload), Some(model)) => {
                if let Err(err) = apply_to_item(&mut item, model.as_ref(), payload, meta) {
                    result = Err(err);
                }
            }
            // Left unmarked so the replay on registration picks it up.
            (Some(payload), None) => item.pending.push_back(PendingMutation {
                meta: meta.clone(),
                payload: payload.to_vec(),
                received_at: Instant::now(),
            }),
            (None, _) => item.applied.advance(&meta.peer_id, meta.seq),
        }
        self.items.insert(object_id.clone(), item);
        self.notify(&object_id, ItemUpdateKind::Created);
        result
    }

    /// Route a mutation to its item's model.
    pub fn process_mutation(
        &mut self,
        object_id: &ObjectId,
        payload: &[u8],
        meta: &MutationMeta,
    ) -> Result<MutationOutcome> {
        let capacity = self.buffer_capacity;
        let item = self
            .items
            .get_mut(object_id)
            .ok_or_else(|| EchoError::UnknownObject {
                object_id: object_id.clone(),
                peer: meta.peer_id.clone(),
                seq: meta.seq,
            })?;

        if item.has_applied(&meta.peer_id, meta.seq) {
            return Ok(MutationOutcome::Duplicate);
        }

        let Some(model) = item.model.clone() else {
            if item.has_pending(&meta.peer_id, meta.seq) {
                return Ok(MutationOutcome::Duplicate);
            }
            if item.pending.len() >= capacity {
                log::warn!(
                    "Dropping mutation {}:{} for {}: buffer full while waiting for model '{}'",
                    meta.peer_id,
                    meta.seq,
                    object_id,
                    item.model_type
                );
                return Err(EchoError::BufferOverflow {
                    object_id: object_id.clone(),
                    capacity,
                });
            }
            item.pending.push_back(PendingMutation {
                meta: meta.clone(),
                payload: payload.to_vec(),
                received_at: Instant::now(),
            });
            return Ok(MutationOutcome::Buffered);
        };

        let result = apply_to_item(item, model.as_ref(), payload, meta);
        if result.is_ok() {
            self.notify(object_id, ItemUpdateKind::Mutated);
        }
        result.map(|_| MutationOutcome::Applied)
    }

    /// Tombstone an item.
    pub fn process_delete(&mut self, object_id: &ObjectId, meta: &MutationMeta) -> Result<bool> {
        let item = self
            .items
            .get_mut(object_id)
            .ok_or_else(|| EchoError::UnknownObject {
                object_id: object_id.clone(),
                peer: meta.peer_id.clone(),
                seq: meta.seq,
            })?;
        if item.has_applied(&meta.peer_id, meta.seq) || item.deleted {
            item.applied.advance(&meta.peer_id, meta.seq);
            return Ok(false);
        }
        item.deleted = true;
        item.applied.advance(&meta.peer_id, meta.seq);
        self.notify(object_id, ItemUpdateKind::Deleted);
        Ok(true)
    }

    // ==================== Late model binding ====================

    /// Register a model and replay buffered mutations of every item waiting on it.
    ///
    /// Errors from individual buffered mutations are returned; the rest of the
    /// buffer is still applied.
    pub fn register_model(&mut self, model: Arc<dyn Model>) -> Vec<EchoError> {
        let type_name = model.type_name().to_string();
        self.registry.register(Arc::clone(&model));

        let mut errors = Vec::new();
        let mut resolved = Vec::new();
        for item in self.items.values_mut() {
            if item.model.is_some() || item.model_type != type_name {
                continue;
            }
            item.model = Some(Arc::clone(&model));
            if item.state.is_null() {
                item.state = model.initial_state();
            }

            let pending = std::mem::take(&mut item.pending);
            log::info!(
                "Model '{}' registered; replaying {} buffered mutations for {}",
                type_name,
                pending.len(),
                item.id
            );
            for mutation in pending {
                if item.has_applied(&mutation.meta.peer_id, mutation.meta.seq) {
                    continue;
                }
                if let Err(err) =
                    apply_to_item(item, model.as_ref(), &mutation.payload, &mutation.meta)
                {
                    log::warn!("{}", err);
                    errors.push(err);
                }
            }
            resolved.push(item.id.clone());
        }

        for object_id in resolved {
            self.notify(&object_id, ItemUpdateKind::ModelResolved);
        }
        errors
    }

    /// Drop buffered mutations that waited longer than the buffer window.
    ///
    /// Returns one [`EchoError::UnresolvedModel`] per affected object.
    pub fn expire_buffers(&mut self, now: Instant) -> Vec<EchoError> {
        let window = self.buffer_window;
        let mut errors = Vec::new();
        for item in self.items.values_mut() {
            if item.model.is_some() || item.pending.is_empty() {
                continue;
            }
            let before = item.pending.len();
            item.pending
                .retain(|pending| now.saturating_duration_since(pending.received_at) <= window);
            let dropped = before - item.pending.len();
            if dropped > 0 {
                log::warn!(
                    "Dropped {} buffered mutations for {}: model '{}' not registered within {:?}",
                    dropped,
                    item.id,
                    item.model_type,
                    window
                );
                errors.push(EchoError::UnresolvedModel {
                    object_id: item.id.clone(),
                    model_type: item.model_type.clone(),
                });
            }
        }
        errors
    }

    // ==================== Snapshots ====================

    /// Capture every item (including buffered mutations) in creation order.
    pub fn snapshot_objects(&self) -> Vec<ObjectSnapshot> {
        self.items
            .values()
            .map(|item| ObjectSnapshot {
                id: item.id.clone(),
                model_type: item.model_type.clone(),
                state: item.state.clone(),
                deleted: item.deleted,
                source: item.source.clone(),
                target: item.target.clone(),
                applied: item.applied.clone(),
                pending: item
                    .pending
                    .iter()
                    .map(|pending| PendingSnapshot {
                        meta: pending.meta.clone(),
                        payload: pending.payload.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    /// Replace all items with the given snapshot.
    pub fn restore_objects(&mut self, objects: Vec<ObjectSnapshot>) {
        let now = Instant::now();
        self.items.clear();
        for object in objects {
            let model = self.registry.get(&object.model_type);
            let mut item = Item::new(object.id.clone(), object.model_type, model);
            item.state = object.state;
            if item.state.is_null()
                && let Some(model) = &item.model
            {
                item.state = model.initial_state();
            }
            item.deleted = object.deleted;
            item.source = object.source;
            item.target = object.target;
            item.applied = object.applied;
            item.pending = object
                .pending
                .into_iter()
                .map(|pending| PendingMutation {
                    meta: pending.meta,
                    payload: pending.payload,
                    received_at: now,
                })
                .collect();
            self.items.insert(object.id, item);
        }

        // Models registered since the snapshot was taken pick up their buffers now.
        let waiting: Vec<Arc<dyn Model>> = self
            .items
            .values()
            .filter(|item| !item.is_resolved())
            .filter_map(|item| self.registry.get(&item.model_type))
            .collect();
        for model in waiting {
            for err in self.register_model(model) {
                log::warn!("Replay after restore failed: {}", err);
            }
        }
    }
}

/// Apply one mutation through `model`, keeping the previous state on failure.
///
/// The mutation is marked as consumed either way so replays stay idempotent.
fn apply_to_item(
    item: &mut Item,
    model: &dyn Model,
    payload: &[u8],
    meta: &MutationMeta,
) -> Result<()> {
    let result = model.apply(&item.state, payload, meta);
    item.applied.advance(&meta.peer_id, meta.seq);
    match result {
        Ok(state) => {
            item.state = state;
            Ok(())
        }
        Err(err) => Err(EchoError::CorruptMutation {
            object_id: item.id.clone(),
            peer: meta.peer_id.clone(),
            seq: meta.seq,
            reason: err.to_string(),
        }),
    }
}

impl std::fmt::Debug for ItemManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ItemManager")
            .field("items", &self.items.len())
            .field("registry", &self.registry)
            .finish()
    }
}
