//! Models: pure state machines that fold mutations into object state.
//!
//! A model is looked up by its type name when an object's genesis is
//! processed. Models may be registered after objects using them already
//! exist; see [`ItemManager::register_model`](super::ItemManager::register_model).

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::envelope::MutationMeta;
use crate::error::{EchoError, Result};

/// A state machine for one object type.
///
/// `apply` must be pure: on error the caller keeps the previous state, so a
/// failed mutation never leaves a partially applied object behind.
pub trait Model: Send + Sync {
    /// Registry key, matched against the genesis `modelType`.
    fn type_name(&self) -> &str;

    /// State of a freshly created object.
    fn initial_state(&self) -> Value {
        Value::Object(Map::new())
    }

    /// Fold one mutation into `state`, returning the new state.
    fn apply(&self, state: &Value, mutation: &[u8], meta: &MutationMeta) -> Result<Value>;

    /// Application-facing view of the state.
    fn materialize(&self, state: &Value) -> Value {
        state.clone()
    }
}

/// Thread-safe map from model type name to model.
#[derive(Default)]
pub struct ModelRegistry {
    models: RwLock<HashMap<String, Arc<dyn Model>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in models.
    pub fn with_defaults() -> Self {
        let registry = Self::new();
        registry.register(Arc::new(KeyValueModel));
        registry.register(Arc::new(DocumentModel));
        registry.register(Arc::new(NoopModel));
        registry
    }

    /// Register (or replace) a model. Returns the previous model of that type.
    pub fn register(&self, model: Arc<dyn Model>) -> Option<Arc<dyn Model>> {
        let mut models = self.models.write().unwrap();
        models.insert(model.type_name().to_string(), model)
    }

    pub fn get(&self, type_name: &str) -> Option<Arc<dyn Model>> {
        let models = self.models.read().unwrap();
        models.get(type_name).cloned()
    }

    pub fn contains(&self, type_name: &str) -> bool {
        let models = self.models.read().unwrap();
        models.contains_key(type_name)
    }

    pub fn type_names(&self) -> Vec<String> {
        let models = self.models.read().unwrap();
        let mut names: Vec<String> = models.keys().cloned().collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for ModelRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelRegistry")
            .field("models", &self.type_names())
            .finish()
    }
}

// ==================== Key-value model ====================

/// Operations understood by [`KeyValueModel`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum KeyValueOp {
    Set { key: String, value: Value },
    Unset { key: String },
}

/// Last-writer-wins map of JSON values.
///
/// Each key remembers the ordering key of the mutation that last wrote it, so
/// concurrent writes converge regardless of the order they are applied in.
///
/// Stored state: `{"<key>": {"value": <json>, "clock": [total, "peer", seq]}}`.
/// Unset keys keep their clock with a `null` value and are hidden by
/// [`materialize`](Model::materialize).
#[derive(Debug, Default, Clone, Copy)]
pub struct KeyValueModel;

impl KeyValueModel {
    pub const TYPE: &'static str = "echo.model/key-value";

    /// Encode a `set` mutation.
    pub fn set(key: impl Into<String>, value: Value) -> Vec<u8> {
        Self::encode(&KeyValueOp::Set {
            key: key.into(),
            value,
        })
    }

    /// Encode an `unset` mutation.
    pub fn unset(key: impl Into<String>) -> Vec<u8> {
        Self::encode(&KeyValueOp::Unset { key: key.into() })
    }

    fn encode(op: &KeyValueOp) -> Vec<u8> {
        // Serializing a plain enum of strings and JSON values cannot fail.
        serde_json::to_vec(op).unwrap_or_default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
struct Clock(u64, String, u64);

#[derive(Debug, Serialize, Deserialize)]
struct Register {
    value: Value,
    clock: Clock,
}

impl Model for KeyValueModel {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn apply(&self, state: &Value, mutation: &[u8], meta: &MutationMeta) -> Result<Value> {
        let op: KeyValueOp = serde_json::from_slice(mutation)
            .map_err(|e| EchoError::InvalidMutation(format!("key-value op: {}", e)))?;
        let mut entries = match state {
            Value::Object(map) => map.clone(),
            Value::Null => Map::new(),
            other => {
                return Err(EchoError::InvalidMutation(format!(
                    "key-value state must be an object, got {}",
                    other
                )));
            }
        };

        let (key, value) = match op {
            KeyValueOp::Set { key, value } => (key, value),
            KeyValueOp::Unset { key } => (key, Value::Null),
        };
        let clock = Clock(
            meta.timeframe.total_messages(),
            meta.peer_id.to_string(),
            meta.seq,
        );

        let current: Option<Register> = entries
            .get(&key)
            .and_then(|entry| serde_json::from_value(entry.clone()).ok());
        if current.is_some_and(|register| register.clock >= clock) {
            return Ok(Value::Object(entries));
        }

        entries.insert(key, serde_json::to_value(Register { value, clock })?);
        Ok(Value::Object(entries))
    }

    fn materialize(&self, state: &Value) -> Value {
        let Value::Object(entries) = state else {
            return Value::Object(Map::new());
        };
        let visible = entries
            .iter()
            .filter_map(|(key, entry)| {
                let value = entry.get("value")?;
                (!value.is_null()).then(|| (key.clone(), value.clone()))
            })
            .collect();
        Value::Object(visible)
    }
}

// ==================== Document model ====================

/// Structured JSON document updated with JSON merge patches (RFC 7396).
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentModel;

impl DocumentModel {
    pub const TYPE: &'static str = "echo.model/document";

    /// Encode a merge-patch mutation.
    pub fn patch(patch: &Value) -> Vec<u8> {
        serde_json::to_vec(patch).unwrap_or_default()
    }
}

/// Apply an RFC 7396 merge patch in place.
pub fn merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(patch) = patch else {
        *target = patch.clone();
        return;
    };
    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Value::Object(target) = target {
        for (key, value) in patch {
            if value.is_null() {
                target.remove(key);
            } else {
                merge_patch(target.entry(key.clone()).or_insert(Value::Null), value);
            }
        }
    }
}

impl Model for DocumentModel {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn apply(&self, state: &Value, mutation: &[u8], _meta: &MutationMeta) -> Result<Value> {
        let patch: Value = serde_json::from_slice(mutation)
            .map_err(|e| EchoError::InvalidMutation(format!("merge patch: {}", e)))?;
        let mut next = state.clone();
        merge_patch(&mut next, &patch);
        Ok(next)
    }
}

// ==================== No-op model ====================

/// Accepts every mutation and never changes state.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopModel;

impl NoopModel {
    pub const TYPE: &'static str = "echo.model/noop";
}

impl Model for NoopModel {
    fn type_name(&self) -> &str {
        Self::TYPE
    }

    fn apply(&self, state: &Value, _mutation: &[u8], _meta: &MutationMeta) -> Result<Value> {
        Ok(state.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::PeerId;
    use crate::timeframe::Timeframe;
    use serde_json::json;

    fn meta(peer: &str, seq: u64, total: u64) -> MutationMeta {
        let mut timeframe = Timeframe::new();
        if total > 0 {
            timeframe.set(PeerId::from("clock"), total - 1);
        }
        MutationMeta::new(PeerId::from(peer), seq, timeframe)
    }

    #[test]
    fn test_key_value_set_and_unset() {
        let model = KeyValueModel;
        let state = model.initial_state();
        let state = model
            .apply(&state, &KeyValueModel::set("title", json!("hello")), &meta("a", 0, 0))
            .unwrap();
        assert_eq!(model.materialize(&state), json!({"title": "hello"}));

        let state = model
            .apply(&state, &KeyValueModel::unset("title"), &meta("a", 1, 1))
            .unwrap();
        assert_eq!(model.materialize(&state), json!({}));
    }

    #[test]
    fn test_key_value_concurrent_sets_commute() {
        let model = KeyValueModel;
        let first = (KeyValueModel::set("k", json!(1)), meta("a", 0, 0));
        let second = (KeyValueModel::set("k", json!(2)), meta("b", 0, 0));

        let forward = model.apply(&model.initial_state(), &first.0, &first.1).unwrap();
        let forward = model.apply(&forward, &second.0, &second.1).unwrap();
        let backward = model.apply(&model.initial_state(), &second.0, &second.1).unwrap();
        let backward = model.apply(&backward, &first.0, &first.1).unwrap();

        assert_eq!(forward, backward);
        assert_eq!(model.materialize(&forward), json!({"k": 2}));
    }

    #[test]
    fn test_key_value_rejects_garbage() {
        let err = KeyValueModel
            .apply(&json!({}), b"{nope", &meta("a", 0, 0))
            .unwrap_err();
        assert!(matches!(err, EchoError::InvalidMutation(_)));
    }

    #[test]
    fn test_document_merge_patch() {
        let model = DocumentModel;
        let state = json!({"title": "a", "tags": {"x": true, "y": true}});
        let next = model
            .apply(
                &state,
                &DocumentModel::patch(&json!({"title": "b", "tags": {"y": null}})),
                &meta("a", 0, 0),
            )
            .unwrap();
        assert_eq!(next, json!({"title": "b", "tags": {"x": true}}));
    }

    #[test]
    fn test_registry() {
        let registry = ModelRegistry::with_defaults();
        assert!(registry.contains(KeyValueModel::TYPE));
        assert!(registry.get("unknown").is_none());
        assert_eq!(registry.type_names().len(), 3);
    }
}
