//! Mutation pipeline: feeds in, materialized items out.
//!
//! The [`Pipeline`] reads every peer feed of a space, orders records causally
//! (see [`selector`]), decodes each record's [`EchoEnvelope`] and hands it to
//! the [`ItemManager`]. Local writes go through the same path: they are
//! appended to the writer's feed and then processed like any remote record.
//!
//! Per-object failures (corrupt payloads, unknown objects, full buffers) are
//! collected in the [`ProcessReport`] and never stop the pipeline.
//!
//! # Example
//!
//! ```ignore
//! use echo_core::feed::MemoryFeedStore;
//! use echo_core::pipeline::{KeyValueModel, ModelRegistry, Pipeline};
//!
//! let mut pipeline = Pipeline::new(space_key, Arc::new(MemoryFeedStore::new()),
//!     Arc::new(ModelRegistry::with_defaults()), &EchoConfig::default());
//! let id = pipeline.create_object_with(&peer, KeyValueModel::TYPE,
//!     KeyValueModel::set("title", json!("hello")))?;
//! pipeline.mutate(&peer, &id, KeyValueModel::set("done", json!(false)))?;
//! ```

mod envelope;
mod item;
mod item_manager;
mod model;
pub mod selector;

pub use envelope::{ENVELOPE_TYPE, EchoEnvelope, MutationMeta};
pub use item::{Item, PendingMutation};
pub use item_manager::{ItemFilter, ItemManager, ItemUpdate, ItemUpdateKind, MutationOutcome};
pub use model::{
    DocumentModel, KeyValueModel, KeyValueOp, Model, ModelRegistry, NoopModel, merge_patch,
};

use std::sync::Arc;
use std::time::Instant;

use selector::FeedHead;

use crate::config::EchoConfig;
use crate::error::{EchoError, Result};
use crate::feed::{FeedStore, LogRecord};
use crate::keys::{ObjectId, PeerId, SpaceKey};
use crate::snapshot::SpaceSnapshot;
use crate::timeframe::Timeframe;

/// Counters and per-object errors from one [`Pipeline::process`] run.
#[derive(Debug, Default)]
pub struct ProcessReport {
    pub applied: usize,
    pub duplicates: usize,
    pub buffered: usize,
    pub errors: Vec<EchoError>,
    /// Records remain whose causal dependencies have not arrived yet.
    pub stalled: bool,
}

impl ProcessReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && !self.stalled
    }

    fn take_error_for(&mut self, object_id: &ObjectId) -> Option<EchoError> {
        let index = self
            .errors
            .iter()
            .position(|err| err.object_id() == Some(object_id))?;
        Some(self.errors.remove(index))
    }
}

/// Replays a space's feeds into an [`ItemManager`].
pub struct Pipeline {
    space_key: SpaceKey,
    feed: Arc<dyn FeedStore>,
    items: ItemManager,
    timeframe: Timeframe,
    stalled: bool,
}

impl Pipeline {
    pub fn new(
        space_key: SpaceKey,
        feed: Arc<dyn FeedStore>,
        registry: Arc<ModelRegistry>,
        config: &EchoConfig,
    ) -> Self {
        Self {
            space_key,
            feed,
            items: ItemManager::new(registry, config),
            timeframe: Timeframe::new(),
            stalled: false,
        }
    }

    pub fn space_key(&self) -> &SpaceKey {
        &self.space_key
    }

    pub fn feed(&self) -> &Arc<dyn FeedStore> {
        &self.feed
    }

    pub fn items(&self) -> &ItemManager {
        &self.items
    }

    /// Timeframe of the last record applied from each feed.
    pub fn timeframe(&self) -> &Timeframe {
        &self.timeframe
    }

    /// Timeframe of the last record present in each feed.
    pub fn end_timeframe(&self) -> Result<Timeframe> {
        self.feed.end_timeframe()
    }

    pub fn is_stalled(&self) -> bool {
        self.stalled
    }

    // ==================== Processing ====================

    /// Apply every record that is causally ready.
    pub fn process(&mut self) -> Result<ProcessReport> {
        let mut report = ProcessReport {
            errors: self.items.expire_buffers(Instant::now()),
            ..ProcessReport::default()
        };

        let mut heads = self.load_heads()?;
        while let Some(index) = selector::select_next(&heads, &self.timeframe) {
            let head = heads.swap_remove(index);
            self.apply_record(&head, &mut report);
            self.timeframe.advance(&head.peer, head.seq);
            if let Some(next) = self.read_head(&head.peer, head.seq + 1)? {
                heads.push(next);
            }
        }

        self.stalled = !heads.is_empty();
        report.stalled = self.stalled;
        if self.stalled {
            let waiting: Vec<String> = heads
                .iter()
                .map(|head| format!("{}[{}]", head.peer, head.seq))
                .collect();
            log::warn!(
                "Pipeline for space {} stalled at {}; waiting records: {}",
                self.space_key,
                self.timeframe,
                waiting.join(", ")
            );
        }

        log::debug!(
            "Processed space {}: {} applied, {} duplicate, {} buffered, {} errors",
            self.space_key,
            report.applied,
            report.duplicates,
            report.buffered,
            report.errors.len()
        );
        Ok(report)
    }

    fn load_heads(&self) -> Result<Vec<FeedHead>> {
        let mut heads = Vec::new();
        for peer in self.feed.peers()? {
            let next = self.timeframe.get(&peer).map_or(0, |seq| seq + 1);
            if let Some(head) = self.read_head(&peer, next)? {
                heads.push(head);
            }
        }
        Ok(heads)
    }

    fn read_head(&self, peer: &PeerId, seq: u64) -> Result<Option<FeedHead>> {
        if seq >= self.feed.length(peer)? {
            return Ok(None);
        }
        Ok(Some(FeedHead {
            peer: peer.clone(),
            seq,
            record: self.feed.read(peer, seq)?,
        }))
    }

    fn apply_record(&mut self, head: &FeedHead, report: &mut ProcessReport) {
        let meta = MutationMeta::new(head.peer.clone(), head.seq, head.record.timeframe.clone());

        let envelope = match EchoEnvelope::decode(&head.record.data) {
            Ok(envelope) => envelope,
            Err(err) => {
                let err = EchoError::CorruptRecord {
                    peer: head.peer.clone(),
                    seq: head.seq,
                    reason: err.to_string(),
                };
                log::warn!("{}", err);
                report.errors.push(err);
                return;
            }
        };

        let outcome = match envelope {
            EchoEnvelope::Genesis {
                object_id,
                model_type,
                source,
                target,
                payload,
            } => self
                .items
                .construct_item(object_id, &model_type, source, target, payload.as_deref(), &meta)
                .map(created_outcome),
            EchoEnvelope::Mutation { object_id, payload } => {
                self.items.process_mutation(&object_id, &payload, &meta)
            }
            EchoEnvelope::Delete { object_id } => self
                .items
                .process_delete(&object_id, &meta)
                .map(created_outcome),
        };

        match outcome {
            Ok(MutationOutcome::Applied) => report.applied += 1,
            Ok(MutationOutcome::Duplicate) => report.duplicates += 1,
            Ok(MutationOutcome::Buffered) => report.buffered += 1,
            Err(err) => {
                log::warn!("{}", err);
                report.errors.push(err);
            }
        }
    }

    // ==================== Local writes ====================

    /// Append an envelope to `peer`'s feed without processing it.
    pub fn write(&self, peer: &PeerId, envelope: &EchoEnvelope) -> Result<MutationMeta> {
        let data = envelope.encode()?;
        let seq = self
            .feed
            .append(peer, LogRecord::new(data, self.timeframe.clone()))?;
        Ok(MutationMeta::new(peer.clone(), seq, self.timeframe.clone()))
    }

    /// Write, process, and surface any failure concerning `object_id`.
    fn write_and_process(
        &mut self,
        peer: &PeerId,
        envelope: &EchoEnvelope,
    ) -> Result<ProcessReport> {
        self.write(peer, envelope)?;
        let mut report = self.process()?;
        if let Some(err) = report.take_error_for(envelope.object_id()) {
            return Err(err);
        }
        Ok(report)
    }

    /// Create a new object bound to `model_type`.
    pub fn create_object(&mut self, peer: &PeerId, model_type: &str) -> Result<ObjectId> {
        let object_id = ObjectId::random();
        self.write_and_process(peer, &EchoEnvelope::genesis(object_id.clone(), model_type))?;
        Ok(object_id)
    }

    /// Create a new object and apply `initial_mutation` to it, in one record.
    pub fn create_object_with(
        &mut self,
        peer: &PeerId,
        model_type: &str,
        initial_mutation: Vec<u8>,
    ) -> Result<ObjectId> {
        let object_id = ObjectId::random();
        let envelope = EchoEnvelope::genesis_with(object_id.clone(), model_type, initial_mutation);
        self.write_and_process(peer, &envelope)?;
        Ok(object_id)
    }

    /// Create a link object between two existing objects.
    pub fn create_relation(
        &mut self,
        peer: &PeerId,
        model_type: &str,
        source: &ObjectId,
        target: &ObjectId,
    ) -> Result<ObjectId> {
        for endpoint in [source, target] {
            if !self.items.contains(endpoint) {
                return Err(EchoError::UnresolvedReference(format!(
                    "relation endpoint {} does not exist",
                    endpoint
                )));
            }
        }
        let object_id = ObjectId::random();
        let envelope = EchoEnvelope::Genesis {
            object_id: object_id.clone(),
            model_type: model_type.to_string(),
            source: Some(source.clone()),
            target: Some(target.clone()),
            payload: None,
        };
        self.write_and_process(peer, &envelope)?;
        Ok(object_id)
    }

    /// Append a model mutation for an existing object.
    pub fn mutate(&mut self, peer: &PeerId, object_id: &ObjectId, payload: Vec<u8>) -> Result<()> {
        self.ensure_exists(peer, object_id)?;
        self.write_and_process(peer, &EchoEnvelope::mutation(object_id.clone(), payload))?;
        Ok(())
    }

    /// Tombstone an object.
    pub fn delete(&mut self, peer: &PeerId, object_id: &ObjectId) -> Result<()> {
        self.ensure_exists(peer, object_id)?;
        let envelope = EchoEnvelope::Delete {
            object_id: object_id.clone(),
        };
        self.write_and_process(peer, &envelope)?;
        Ok(())
    }

    fn ensure_exists(&self, peer: &PeerId, object_id: &ObjectId) -> Result<()> {
        if self.items.contains(object_id) {
            return Ok(());
        }
        Err(EchoError::UnknownObject {
            object_id: object_id.clone(),
            peer: peer.clone(),
            seq: self.feed.length(peer)?,
        })
    }

    // ==================== Models ====================

    /// Register a model, replaying mutations buffered for it.
    pub fn register_model(&mut self, model: Arc<dyn Model>) -> Vec<EchoError> {
        self.items.register_model(model)
    }

    // ==================== Snapshots ====================

    /// Capture the processed state.
    pub fn snapshot(&self) -> SpaceSnapshot {
        SpaceSnapshot::new(
            self.space_key.clone(),
            self.timeframe.clone(),
            self.items.snapshot_objects(),
        )
    }

    /// Reset to a snapshot. Call [`process`](Self::process) afterwards to
    /// replay records written after the snapshot's timeframe.
    pub fn restore(&mut self, snapshot: SpaceSnapshot) -> Result<()> {
        if snapshot.space_key != self.space_key {
            return Err(EchoError::Invariant(format!(
                "snapshot of space {} cannot be restored into space {}",
                snapshot.space_key, self.space_key
            )));
        }
        log::info!(
            "Restoring space {} from snapshot at {}",
            self.space_key,
            snapshot.timeframe
        );
        self.timeframe = snapshot.timeframe;
        self.items.restore_objects(snapshot.objects);
        self.stalled = false;
        Ok(())
    }
}

fn created_outcome(changed: bool) -> MutationOutcome {
    if changed {
        MutationOutcome::Applied
    } else {
        MutationOutcome::Duplicate
    }
}

impl std::fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pipeline")
            .field("space_key", &self.space_key)
            .field("timeframe", &self.timeframe)
            .field("items", &self.items.len())
            .field("stalled", &self.stalled)
            .finish()
    }
}
