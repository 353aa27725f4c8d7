//! Materialized objects.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use serde_json::Value;

use super::envelope::MutationMeta;
use super::model::Model;
use crate::keys::{ObjectId, PeerId};
use crate::timeframe::Timeframe;

/// A mutation waiting for its object's model to be registered.
#[derive(Debug, Clone)]
pub struct PendingMutation {
    pub meta: MutationMeta,
    pub payload: Vec<u8>,
    pub received_at: Instant,
}

/// An object reconstructed from its feed history.
///
/// Items are created by a genesis envelope and only ever change through the
/// item manager. Deleted items stay in place as tombstones.
pub struct Item {
    pub(super) id: ObjectId,
    pub(super) model_type: String,
    pub(super) model: Option<Arc<dyn Model>>,
    pub(super) state: Value,
    pub(super) deleted: bool,
    pub(super) source: Option<ObjectId>,
    pub(super) target: Option<ObjectId>,
    /// Highest sequence applied to this object, per peer.
    pub(super) applied: Timeframe,
    pub(super) pending: VecDeque<PendingMutation>,
}

impl Item {
    pub(super) fn new(id: ObjectId, model_type: String, model: Option<Arc<dyn Model>>) -> Self {
        let state = model
            .as_ref()
            .map(|model| model.initial_state())
            .unwrap_or(Value::Null);
        Self {
            id,
            model_type,
            model,
            state,
            deleted: false,
            source: None,
            target: None,
            applied: Timeframe::new(),
            pending: VecDeque::new(),
        }
    }

    pub fn id(&self) -> &ObjectId {
        &self.id
    }

    pub fn model_type(&self) -> &str {
        &self.model_type
    }

    /// Whether the item's model has been registered.
    pub fn is_resolved(&self) -> bool {
        self.model.is_some()
    }

    /// Raw model state. `Null` while the model is unresolved.
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Application-facing state as rendered by the model.
    pub fn materialized(&self) -> Value {
        match &self.model {
            Some(model) => model.materialize(&self.state),
            None => Value::Null,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Whether this item is a link between two other items.
    pub fn is_link(&self) -> bool {
        self.source.is_some() && self.target.is_some()
    }

    pub fn source(&self) -> Option<&ObjectId> {
        self.source.as_ref()
    }

    pub fn target(&self) -> Option<&ObjectId> {
        self.target.as_ref()
    }

    pub fn applied(&self) -> &Timeframe {
        &self.applied
    }

    /// Number of mutations buffered until the model is registered.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub(super) fn has_applied(&self, peer: &PeerId, seq: u64) -> bool {
        self.applied.get(peer).is_some_and(|applied| applied >= seq)
    }

    pub(super) fn has_pending(&self, peer: &PeerId, seq: u64) -> bool {
        self.pending
            .iter()
            .any(|pending| &pending.meta.peer_id == peer && pending.meta.seq == seq)
    }
}

impl std::fmt::Debug for Item {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Item")
            .field("id", &self.id)
            .field("model_type", &self.model_type)
            .field("resolved", &self.is_resolved())
            .field("deleted", &self.deleted)
            .field("pending", &self.pending.len())
            .finish()
    }
}
