use serde::Serialize;
use thiserror::Error;

use crate::keys::{ObjectId, PeerId};

/// Unified error type for echo operations
#[derive(Debug, Error)]
pub enum EchoError {
    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Config errors
    #[error("Config parse error: {0}")]
    ConfigParse(#[from] toml::de::Error),

    #[error("Config serialize error: {0}")]
    ConfigSerialize(#[from] toml::ser::Error),

    // Feed errors
    #[error("No record {seq} in feed of peer {peer}")]
    NotFound { peer: PeerId, seq: u64 },

    #[error("Record {seq} for peer {peer} would leave a gap (feed length {length})")]
    FeedGap { peer: PeerId, seq: u64, length: u64 },

    #[error("Corrupt record {seq} in feed of peer {peer}: {reason}")]
    CorruptRecord {
        peer: PeerId,
        seq: u64,
        reason: String,
    },

    // Pipeline errors
    #[error("Mutation {peer}:{seq} for object {object_id} could not be applied: {reason}")]
    CorruptMutation {
        object_id: ObjectId,
        peer: PeerId,
        seq: u64,
        reason: String,
    },

    #[error("Invalid mutation payload: {0}")]
    InvalidMutation(String),

    #[error("Mutation {peer}:{seq} targets unknown object {object_id}")]
    UnknownObject {
        object_id: ObjectId,
        peer: PeerId,
        seq: u64,
    },

    #[error("Model '{model_type}' for object {object_id} was never registered")]
    UnresolvedModel {
        object_id: ObjectId,
        model_type: String,
    },

    #[error("Mutation buffer for object {object_id} is full ({capacity} pending)")]
    BufferOverflow { object_id: ObjectId, capacity: usize },

    // Reference errors
    #[error("Reference could not be resolved: {0}")]
    UnresolvedReference(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    // Invariant violations
    #[error("Invariant violated: {0}")]
    Invariant(String),

    // CRDT errors
    #[error("CRDT error: {0}")]
    Crdt(String),

    // Snapshot errors
    #[error("Snapshot {key} is corrupt (content hash {actual})")]
    CorruptSnapshot { key: String, actual: String },

    // Storage / remote errors
    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Remote fetch failed: {0}")]
    Remote(String),

    #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type alias for echo operations
pub type Result<T> = std::result::Result<T, EchoError>;

impl EchoError {
    /// I/O or remote failures that may succeed when retried.
    pub fn is_transient(&self) -> bool {
        match self {
            EchoError::Io(_) | EchoError::Storage(_) | EchoError::Remote(_) => true,
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            EchoError::Sqlite(_) => true,
            _ => false,
        }
    }

    /// Programming or protocol errors (missing extension, bad reference shape,
    /// dangling relation endpoint, out-of-order feed insert).
    pub fn is_invariant_violation(&self) -> bool {
        matches!(
            self,
            EchoError::Invariant(_)
                | EchoError::FeedGap { .. }
                | EchoError::InvalidReference(_)
                | EchoError::UnresolvedReference(_)
        )
    }

    /// Errors tied to a single object or record. These are reported and the
    /// pipeline keeps going.
    pub fn is_data_error(&self) -> bool {
        matches!(
            self,
            EchoError::CorruptMutation { .. }
                | EchoError::CorruptRecord { .. }
                | EchoError::CorruptSnapshot { .. }
                | EchoError::InvalidMutation(_)
                | EchoError::UnknownObject { .. }
                | EchoError::UnresolvedModel { .. }
                | EchoError::BufferOverflow { .. }
        )
    }

    /// The object this error is about, if any.
    pub fn object_id(&self) -> Option<&ObjectId> {
        match self {
            EchoError::CorruptMutation { object_id, .. }
            | EchoError::UnknownObject { object_id, .. }
            | EchoError::UnresolvedModel { object_id, .. }
            | EchoError::BufferOverflow { object_id, .. } => Some(object_id),
            _ => None,
        }
    }

    /// Convert to a serializable representation for IPC
    pub fn to_serializable(&self) -> SerializableError {
        SerializableError::from(self)
    }
}

/// A serializable representation of EchoError for IPC and CLI output
#[derive(Debug, Clone, Serialize)]
pub struct SerializableError {
    /// Error kind/variant name
    pub kind: String,
    /// Human-readable error message
    pub message: String,
    /// Object the error refers to (if applicable)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub object_id: Option<String>,
}

impl From<&EchoError> for SerializableError {
    fn from(err: &EchoError) -> Self {
        let kind = match err {
            EchoError::Io(_) => "Io",
            EchoError::Json(_) => "Json",
            EchoError::ConfigParse(_) => "ConfigParse",
            EchoError::ConfigSerialize(_) => "ConfigSerialize",
            EchoError::NotFound { .. } => "NotFound",
            EchoError::FeedGap { .. } => "FeedGap",
            EchoError::CorruptRecord { .. } => "CorruptRecord",
            EchoError::CorruptSnapshot { .. } => "CorruptSnapshot",
            EchoError::CorruptMutation { .. } => "CorruptMutation",
            EchoError::InvalidMutation(_) => "InvalidMutation",
            EchoError::UnknownObject { .. } => "UnknownObject",
            EchoError::UnresolvedModel { .. } => "UnresolvedModel",
            EchoError::BufferOverflow { .. } => "BufferOverflow",
            EchoError::UnresolvedReference(_) => "UnresolvedReference",
            EchoError::InvalidReference(_) => "InvalidReference",
            EchoError::Invariant(_) => "Invariant",
            EchoError::Crdt(_) => "Crdt",
            EchoError::Storage(_) => "Storage",
            EchoError::Remote(_) => "Remote",
            #[cfg(all(not(target_arch = "wasm32"), feature = "sqlite"))]
            EchoError::Sqlite(_) => "Sqlite",
        }
        .to_string();

        SerializableError {
            kind,
            message: err.to_string(),
            object_id: err.object_id().map(|id| id.to_string()),
        }
    }
}

impl From<EchoError> for SerializableError {
    fn from(err: EchoError) -> Self {
        SerializableError::from(&err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        let err = EchoError::CorruptMutation {
            object_id: ObjectId::from("obj-1"),
            peer: PeerId::from("peer-a"),
            seq: 3,
            reason: "bad payload".into(),
        };
        assert!(err.is_data_error());
        assert!(!err.is_transient());
        assert!(!err.is_invariant_violation());

        assert!(EchoError::Invariant("no extension".into()).is_invariant_violation());
        assert!(EchoError::Remote("timeout".into()).is_transient());
    }

    #[test]
    fn test_serializable_carries_object_id() {
        let err = EchoError::UnresolvedModel {
            object_id: ObjectId::from("obj-9"),
            model_type: "example.com/model/Task".into(),
        };
        let serializable = err.to_serializable();
        assert_eq!(serializable.kind, "UnresolvedModel");
        assert_eq!(serializable.object_id.as_deref(), Some("obj-9"));
        assert!(serializable.message.contains("example.com/model/Task"));
    }
}
