//! Space snapshots.
//!
//! A [`SpaceSnapshot`] captures the processed timeframe, every object's model
//! state and, optionally, the CRDT documents of the space. Snapshots are
//! content-addressed: the key is the lowercase hex SHA-256 of the canonical
//! encoding, so storing the same snapshot twice is a no-op.
//!
//! Restoring a snapshot and replaying feed records after its timeframe yields
//! the same state as replaying the feeds from the start.

mod monitor;
mod store;

pub use monitor::{SnapshotMonitor, SnapshotTicket};
pub use store::{RemoteObjectSync, SnapshotStore};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::codec::{Codec, JsonCodec, base64_bytes};
use crate::error::Result;
use crate::keys::{ObjectId, SpaceKey};
use crate::pipeline::{MutationMeta, Pipeline};
use crate::timeframe::Timeframe;

/// Type name under which snapshots are encoded.
pub const SNAPSHOT_TYPE: &str = "echo.snapshot.SpaceSnapshot";

const SNAPSHOT_CODEC: JsonCodec<SpaceSnapshot> = JsonCodec::new(SNAPSHOT_TYPE);

/// A mutation that was still waiting for its model when the snapshot was taken.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingSnapshot {
    pub meta: MutationMeta,
    #[serde(with = "base64_bytes")]
    pub payload: Vec<u8>,
}

/// One object's state at the snapshot timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSnapshot {
    pub id: ObjectId,
    pub model_type: String,
    pub state: Value,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<ObjectId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<ObjectId>,
    /// Highest sequence per peer already folded into `state`.
    pub applied: Timeframe,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending: Vec<PendingSnapshot>,
}

/// Full CRDT state of the space's documents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DocumentSnapshot {
    /// Encoded state of the root document.
    #[serde(with = "base64_bytes")]
    pub root: Vec<u8>,
    /// Encoded state of each linked document, keyed by document id.
    #[serde(default)]
    pub linked: BTreeMap<String, EncodedDoc>,
}

/// Wrapper so linked document states serialize as base64.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EncodedDoc(#[serde(with = "base64_bytes")] pub Vec<u8>);

/// A space's state at a given timeframe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SpaceSnapshot {
    pub space_key: SpaceKey,
    pub timeframe: Timeframe,
    /// Objects in creation order.
    pub objects: Vec<ObjectSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document: Option<DocumentSnapshot>,
}

impl SpaceSnapshot {
    pub fn new(space_key: SpaceKey, timeframe: Timeframe, objects: Vec<ObjectSnapshot>) -> Self {
        Self {
            space_key,
            timeframe,
            objects,
            document: None,
        }
    }

    /// Attach the document-layer state.
    pub fn with_document(mut self, document: DocumentSnapshot) -> Self {
        self.document = Some(document);
        self
    }

    /// Canonical byte encoding.
    ///
    /// Field order is fixed by the struct definitions, maps are ordered, and
    /// objects keep creation order, so equal snapshots encode identically.
    pub fn encode(&self) -> Result<Vec<u8>> {
        SNAPSHOT_CODEC.encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        SNAPSHOT_CODEC.decode(bytes)
    }

    /// Content address of this snapshot.
    pub fn content_hash(&self) -> Result<String> {
        Ok(content_hash(&self.encode()?))
    }
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Snapshot `pipeline` if the monitor says it is due, returning the stored key.
///
/// The monitor's epoch advances only when the snapshot was stored.
pub async fn snapshot_if_due(
    monitor: &SnapshotMonitor,
    pipeline: &Pipeline,
    store: &SnapshotStore,
) -> Result<Option<String>> {
    let Some(ticket) = monitor.try_begin(pipeline.timeframe()) else {
        return Ok(None);
    };

    let snapshot = pipeline.snapshot();
    match store.store(&snapshot).await {
        Ok(key) => {
            monitor.complete(ticket);
            Ok(Some(key))
        }
        Err(err) => {
            log::error!("Snapshot of space {} failed: {}", pipeline.space_key(), err);
            monitor.abort(ticket);
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PeerId;
    use serde_json::json;

    fn sample() -> SpaceSnapshot {
        let mut timeframe = Timeframe::new();
        timeframe.set(PeerId::from("a"), 3);
        SpaceSnapshot::new(
            SpaceKey::from("space"),
            timeframe.clone(),
            vec![ObjectSnapshot {
                id: ObjectId::from("x"),
                model_type: "echo.model/document".into(),
                state: json!({"b": 1, "a": 2}),
                deleted: false,
                source: None,
                target: None,
                applied: timeframe,
                pending: Vec::new(),
            }],
        )
    }

    #[test]
    fn test_hash_is_stable_and_hex() {
        let snapshot = sample();
        let hash = snapshot.content_hash().unwrap();
        assert_eq!(hash.len(), 64);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
        assert_eq!(hash, sample().content_hash().unwrap());
    }

    #[test]
    fn test_decode_restores_equal_snapshot() {
        let snapshot = sample().with_document(DocumentSnapshot {
            root: vec![1, 2, 3],
            linked: BTreeMap::from([("doc-1".to_string(), EncodedDoc(vec![9]))]),
        });
        let decoded = SpaceSnapshot::decode(&snapshot.encode().unwrap()).unwrap();
        assert_eq!(decoded, snapshot);
        assert_eq!(decoded.content_hash().unwrap(), snapshot.content_hash().unwrap());
    }

    #[test]
    fn test_known_digest() {
        assert_eq!(
            content_hash(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
