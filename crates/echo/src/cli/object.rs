//! Object commands.

use serde_json::{Map, Value, json};

use echo_core::error::{EchoError, Result};
use echo_core::keys::ObjectId;
use echo_core::pipeline::{DocumentModel, Item, KeyValueModel};

use super::Session;

/// Handle the create command
pub(super) fn handle_create(
    session: &mut Session,
    model_type: &str,
    source: Option<String>,
    target: Option<String>,
) -> Result<()> {
    let peer = session.peer_id();
    let id = match (source, target) {
        (Some(source), Some(target)) => session.pipeline.create_relation(
            &peer,
            model_type,
            &ObjectId::from(source),
            &ObjectId::from(target),
        )?,
        _ => session.pipeline.create_object(&peer, model_type)?,
    };
    session.checkpoint()?;
    println!("{}", id);
    Ok(())
}

/// Handle the set command
pub(super) fn handle_set(session: &mut Session, id: &str, key: &str, value: &str) -> Result<()> {
    let value = serde_json::from_str(value).unwrap_or_else(|_| Value::String(value.to_string()));
    update_field(session, id, key, Some(value))?;
    println!("✓ Set {} on {}", key, id);
    Ok(())
}

/// Handle the unset command
pub(super) fn handle_unset(session: &mut Session, id: &str, key: &str) -> Result<()> {
    update_field(session, id, key, None)?;
    println!("✓ Removed {} from {}", key, id);
    Ok(())
}

/// Handle the delete command
pub(super) fn handle_delete(session: &mut Session, id: &str) -> Result<()> {
    let peer = session.peer_id();
    session.pipeline.delete(&peer, &ObjectId::from(id))?;
    session.checkpoint()?;
    println!("✓ Deleted {}", id);
    Ok(())
}

/// Handle the show command
pub(super) fn handle_show(session: &Session, id: Option<&str>, all: bool) -> Result<()> {
    let items = session.pipeline.items();
    let output = match id {
        Some(id) => {
            let object_id = ObjectId::from(id);
            let item = items.get(&object_id).ok_or_else(|| {
                EchoError::UnresolvedReference(format!("object {} not found", object_id))
            })?;
            item_json(item)
        }
        None => Value::Array(
            items
                .items()
                .filter(|item| all || !item.is_deleted())
                .map(item_json)
                .collect(),
        ),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

fn update_field(session: &mut Session, id: &str, key: &str, value: Option<Value>) -> Result<()> {
    let object_id = ObjectId::from(id);
    let model_type = match session.pipeline.items().get(&object_id) {
        Some(item) => item.model_type().to_string(),
        None => {
            return Err(EchoError::UnresolvedReference(format!(
                "object {} not found",
                object_id
            )));
        }
    };

    let payload = field_payload(&model_type, key, value)?;
    let peer = session.peer_id();
    session.pipeline.mutate(&peer, &object_id, payload)?;
    session.checkpoint()
}

/// Encode a single-field change for objects of `model_type`.
fn field_payload(model_type: &str, key: &str, value: Option<Value>) -> Result<Vec<u8>> {
    if model_type == KeyValueModel::TYPE {
        return Ok(match value {
            Some(value) => KeyValueModel::set(key, value),
            None => KeyValueModel::unset(key),
        });
    }
    if model_type == DocumentModel::TYPE {
        // A null member removes the key under merge-patch semantics
        let mut patch = Map::new();
        patch.insert(key.to_string(), value.unwrap_or(Value::Null));
        return Ok(DocumentModel::patch(&Value::Object(patch)));
    }
    Err(EchoError::InvalidMutation(format!(
        "objects of type '{}' have no editable fields",
        model_type
    )))
}

fn item_json(item: &Item) -> Value {
    let mut output = json!({
        "id": item.id(),
        "type": item.model_type(),
        "state": item.materialized(),
    });
    if item.is_deleted() {
        output["deleted"] = json!(true);
    }
    if let (Some(source), Some(target)) = (item.source(), item.target()) {
        output["source"] = json!(source);
        output["target"] = json!(target);
    }
    if item.pending_len() > 0 {
        output["pending"] = json!(item.pending_len());
    }
    output
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_field_payload_by_model() {
        assert_eq!(
            field_payload(KeyValueModel::TYPE, "title", Some(json!("x"))).unwrap(),
            KeyValueModel::set("title", json!("x"))
        );
        assert_eq!(
            field_payload(DocumentModel::TYPE, "title", None).unwrap(),
            DocumentModel::patch(&json!({"title": null}))
        );
        assert!(field_payload("echo.model/noop", "title", None).is_err());
    }
}
