//! Schema migration of CRDT documents.
//!
//! A migration rewrites a document so that, read as plain data, it equals a
//! target value. The target is coalesced into the existing structure:
//!
//! - maps are merged key by key, and keys missing from the target are removed
//! - arrays are merged position by position, then truncated or extended
//! - text fields are edited with a minimal diff
//! - values that already match are left alone
//! - anything else, including a container of the wrong kind, is replaced
//!
//! Untouched parts keep their item ids, so their history and any cursor
//! anchored in them survive. All changes happen in one transaction, so
//! observers see a single update.

use serde_json::{Map as JsonMap, Value};
use yrs::updates::decoder::Decode;
use yrs::{
    Array, ArrayRef, Doc, Map, MapRef, Out, ReadTxn, StateVector, Transact, TransactionMut, Update,
};

use super::convert::{any_to_json, apply_text_diff, insert_json, insert_json_at};
use crate::dxn::is_encoded_reference;
use crate::error::{EchoError, Result};

/// Fork `source` and migrate the fork to `target`.
///
/// `source` is not modified. Every top-level value of `target` must be an
/// object; each names a root map of the document. Root maps not named in
/// `target` are left as they are.
pub fn migrate_document(source: &Doc, target: &Value) -> Result<Doc> {
    let state = {
        let txn = source.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    };

    let fork = Doc::new();
    {
        let update = Update::decode_v1(&state)
            .map_err(|e| EchoError::Crdt(format!("Failed to decode document state: {}", e)))?;
        let mut txn = fork.transact_mut();
        txn.apply_update(update)
            .map_err(|e| EchoError::Crdt(format!("Failed to fork document: {}", e)))?;
    }

    migrate_in_place(&fork, target)?;
    Ok(fork)
}

/// Migrate `doc` itself to `target` in a single transaction.
pub fn migrate_in_place(doc: &Doc, target: &Value) -> Result<()> {
    let roots = root_targets(target)?;

    // Root types must be resolved before the transaction is opened
    let maps: Vec<(MapRef, &JsonMap<String, Value>)> = roots
        .into_iter()
        .map(|(name, fields)| (doc.get_or_insert_map(name.as_str()), fields))
        .collect();

    let mut txn = doc.transact_mut();
    for (map, fields) in &maps {
        coalesce_map(&mut txn, map, fields);
    }
    log::debug!("Migrated {} root maps", maps.len());
    Ok(())
}

fn root_targets(target: &Value) -> Result<Vec<(&String, &JsonMap<String, Value>)>> {
    let Some(roots) = target.as_object() else {
        return Err(EchoError::InvalidMutation(
            "migration target must be an object".to_string(),
        ));
    };
    roots
        .iter()
        .map(|(name, value)| match value {
            Value::Object(fields) => Ok((name, fields)),
            other => Err(EchoError::InvalidMutation(format!(
                "root '{}' must be an object, got {}",
                name, other
            ))),
        })
        .collect()
}

fn coalesce_map(txn: &mut TransactionMut, map: &MapRef, target: &JsonMap<String, Value>) {
    let stale: Vec<String> = map
        .keys(&*txn)
        .filter(|key| !target.contains_key(*key))
        .map(String::from)
        .collect();
    for key in stale {
        map.remove(txn, &key);
    }

    for (key, value) in target {
        let existing = map.get(&*txn, key);
        if !coalesce_value(txn, existing.as_ref(), value) {
            insert_json(map, txn, key, value);
        }
    }
}

fn coalesce_array(txn: &mut TransactionMut, array: &ArrayRef, target: &[Value]) {
    let len = array.len(&*txn) as usize;
    let shared = len.min(target.len());

    for (index, value) in target.iter().enumerate().take(shared) {
        let existing = array.get(&*txn, index as u32);
        if !coalesce_value(txn, existing.as_ref(), value) {
            array.remove_range(txn, index as u32, 1);
            insert_json_at(array, txn, index as u32, value);
        }
    }

    if len > target.len() {
        array.remove_range(txn, target.len() as u32, (len - target.len()) as u32);
    }
    for (index, value) in target.iter().enumerate().skip(len) {
        insert_json_at(array, txn, index as u32, value);
    }
}

/// Bring `existing` in line with `target` where the shapes are compatible.
///
/// Returns `false` when the caller must replace the value instead.
fn coalesce_value(txn: &mut TransactionMut, existing: Option<&Out>, target: &Value) -> bool {
    match (existing, target) {
        (Some(Out::YMap(map)), Value::Object(fields)) if !is_encoded_reference(target) => {
            coalesce_map(txn, map, fields);
            true
        }
        (Some(Out::YArray(array)), Value::Array(items)) => {
            coalesce_array(txn, array, items);
            true
        }
        (Some(Out::YText(text)), Value::String(content)) => {
            apply_text_diff(text, txn, content);
            true
        }
        (Some(Out::Any(any)), _) => any_to_json(any) == *target,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::document::convert::map_to_json;
    use serde_json::json;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use yrs::{Assoc, IndexedSequence, Text, TextPrelim};

    fn seeded_doc() -> Doc {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("objects");
        let mut txn = doc.transact_mut();
        insert_json(
            &root,
            &mut txn,
            "a",
            &json!({"title": "x", "count": 1, "tags": ["p", "q"], "nested": {"k": true}}),
        );
        drop(txn);
        doc
    }

    fn root_json(doc: &Doc) -> Value {
        let root = doc.get_or_insert_map("objects");
        let txn = doc.transact();
        map_to_json(&root, &txn)
    }

    #[test]
    fn test_result_equals_target() {
        let source = seeded_doc();
        let target = json!({
            "objects": {
                "a": {"title": "y", "tags": ["p", {"z": 1}, "r"], "nested": [1]},
                "b": {"fresh": null}
            }
        });
        let migrated = migrate_document(&source, &target).unwrap();
        assert_eq!(root_json(&migrated), target["objects"]);

        // Source untouched
        assert_eq!(root_json(&source)["a"]["title"], json!("x"));
    }

    #[test]
    fn test_single_update_observed() {
        let doc = seeded_doc();
        let updates = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&updates);
        let _sub = doc
            .observe_update_v1(move |_, _| {
                seen.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        migrate_in_place(&doc, &json!({"objects": {"a": {"title": "y"}, "b": {}}})).unwrap();
        assert_eq!(updates.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_cursor_survives_unrelated_edit() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("objects");
        let cursor = {
            let mut txn = doc.transact_mut();
            let text = root.insert(&mut txn, "body", TextPrelim::new("hello world"));
            root.insert(&mut txn, "title", "old");
            text.sticky_index(&mut txn, 6, Assoc::After).unwrap()
        };

        let target = json!({"objects": {"body": "hello world", "title": "new"}});
        let migrated = migrate_document(&doc, &target).unwrap();
        let txn = migrated.transact();
        assert_eq!(cursor.get_offset(&txn).unwrap().index, 6);
    }

    #[test]
    fn test_text_edit_moves_cursor() {
        let doc = Doc::new();
        let root = doc.get_or_insert_map("objects");
        let cursor = {
            let mut txn = doc.transact_mut();
            let text = root.insert(&mut txn, "body", TextPrelim::new(""));
            text.insert(&mut txn, 0, "hello world");
            text.sticky_index(&mut txn, 6, Assoc::After).unwrap()
        };

        let target = json!({"objects": {"body": "hello brave world"}});
        let migrated = migrate_document(&doc, &target).unwrap();
        let txn = migrated.transact();
        assert_eq!(cursor.get_offset(&txn).unwrap().index, 12);
    }

    #[test]
    fn test_rejects_non_object_roots() {
        let doc = Doc::new();
        assert!(migrate_in_place(&doc, &json!([])).is_err());
        assert!(migrate_in_place(&doc, &json!({"objects": 1})).is_err());
    }
}
