//! Feed record payloads.

use serde::{Deserialize, Serialize};

use crate::codec::{Codec, JsonCodec, base64_bytes, base64_bytes_opt};
use crate::error::Result;
use crate::keys::{ObjectId, PeerId};
use crate::timeframe::Timeframe;

/// Type name under which envelopes are encoded.
pub const ENVELOPE_TYPE: &str = "echo.pipeline.EchoEnvelope";

const ENVELOPE_CODEC: JsonCodec<EchoEnvelope> = JsonCodec::new(ENVELOPE_TYPE);

/// A tagged message stored in a feed record.
///
/// ```json
/// {"kind":"genesis","objectId":"...","modelType":"echo.model/key-value"}
/// {"kind":"genesis","objectId":"...","modelType":"...","payload":"<base64>"}
/// {"kind":"mutation","objectId":"...","payload":"<base64>"}
/// {"kind":"delete","objectId":"..."}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum EchoEnvelope {
    /// Creates an object bound to a model type. Links also name their endpoints.
    ///
    /// `payload` is an initial mutation applied as part of the same record.
    Genesis {
        object_id: ObjectId,
        model_type: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        source: Option<ObjectId>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<ObjectId>,
        #[serde(
            default,
            skip_serializing_if = "Option::is_none",
            with = "base64_bytes_opt"
        )]
        payload: Option<Vec<u8>>,
    },
    /// Opaque model-specific mutation.
    Mutation {
        object_id: ObjectId,
        #[serde(with = "base64_bytes")]
        payload: Vec<u8>,
    },
    /// Tombstones the object.
    Delete { object_id: ObjectId },
}

impl EchoEnvelope {
    pub fn genesis(object_id: ObjectId, model_type: impl Into<String>) -> Self {
        EchoEnvelope::Genesis {
            object_id,
            model_type: model_type.into(),
            source: None,
            target: None,
            payload: None,
        }
    }

    /// Genesis carrying an initial mutation.
    pub fn genesis_with(object_id: ObjectId, model_type: impl Into<String>, payload: Vec<u8>) -> Self {
        EchoEnvelope::Genesis {
            object_id,
            model_type: model_type.into(),
            source: None,
            target: None,
            payload: Some(payload),
        }
    }

    pub fn mutation(object_id: ObjectId, payload: Vec<u8>) -> Self {
        EchoEnvelope::Mutation { object_id, payload }
    }

    /// The object this envelope is addressed to.
    pub fn object_id(&self) -> &ObjectId {
        match self {
            EchoEnvelope::Genesis { object_id, .. }
            | EchoEnvelope::Mutation { object_id, .. }
            | EchoEnvelope::Delete { object_id } => object_id,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        ENVELOPE_CODEC.encode(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        ENVELOPE_CODEC.decode(bytes)
    }
}

/// Out-of-band metadata accompanying each envelope.
///
/// Derived from the record's position in the feed, never from its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationMeta {
    pub peer_id: PeerId,
    pub seq: u64,
    /// Timeframe the writer had processed when it appended the record.
    pub timeframe: Timeframe,
}

impl MutationMeta {
    pub fn new(peer_id: PeerId, seq: u64, timeframe: Timeframe) -> Self {
        Self {
            peer_id,
            seq,
            timeframe,
        }
    }

    /// Deterministic total order used to break ties between concurrent messages.
    pub fn ordering_key(&self) -> (u64, &PeerId, u64) {
        (self.timeframe.total_messages(), &self.peer_id, self.seq)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let envelope = EchoEnvelope::genesis(ObjectId::from("x"), "echo.model/key-value");
        let json: serde_json::Value = serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"kind": "genesis", "objectId": "x", "modelType": "echo.model/key-value"})
        );

        let mutation = EchoEnvelope::mutation(ObjectId::from("x"), b"hi".to_vec());
        let json: serde_json::Value = serde_json::from_slice(&mutation.encode().unwrap()).unwrap();
        assert_eq!(json["payload"], "aGk=");
        assert_eq!(EchoEnvelope::decode(&mutation.encode().unwrap()).unwrap(), mutation);
    }

    #[test]
    fn test_genesis_with_initial_mutation() {
        let envelope = EchoEnvelope::genesis_with(ObjectId::from("x"), "m", b"hi".to_vec());
        let bytes = envelope.encode().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["payload"], "aGk=");
        assert_eq!(EchoEnvelope::decode(&bytes).unwrap(), envelope);

        // Older records without a payload still decode
        let plain = EchoEnvelope::decode(br#"{"kind":"genesis","objectId":"x","modelType":"m"}"#).unwrap();
        assert_eq!(plain, EchoEnvelope::genesis(ObjectId::from("x"), "m"));
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        assert!(EchoEnvelope::decode(br#"{"kind":"bogus","objectId":"x"}"#).is_err());
    }

    #[test]
    fn test_ordering_key() {
        let mut tf = Timeframe::new();
        tf.set(PeerId::from("a"), 0);
        let early = MutationMeta::new(PeerId::from("b"), 0, Timeframe::new());
        let late = MutationMeta::new(PeerId::from("a"), 1, tf);
        assert!(early.ordering_key() < late.ordering_key());
    }
}
