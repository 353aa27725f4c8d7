//! Conversions between JSON values and yrs shared types.
//!
//! Objects become `Y.Map`s and arrays become `Y.Array`s so nested fields merge
//! independently. Encoded references (`{"/": "<dxn>"}`) stay atomic values.
//! Strings are stored as plain values unless written through
//! [`apply_text_diff`] into a `Y.Text`.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{Map, Number, Value};
use yrs::{
    Any, Array, ArrayPrelim, ArrayRef, GetString, Map as _, MapPrelim, MapRef, Out, ReadTxn, Text,
    TextRef, TransactionMut,
};

use crate::dxn::is_encoded_reference;

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Convert a JSON value to a yrs [`Any`].
///
/// Integers become [`Any::BigInt`] so they read back as integers.
pub fn json_to_any(value: &Value) -> Any {
    match value {
        Value::Null => Any::Null,
        Value::Bool(b) => Any::Bool(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => Any::BigInt(i),
            None => Any::Number(n.as_f64().unwrap_or(f64::NAN)),
        },
        Value::String(s) => Any::String(Arc::from(s.as_str())),
        Value::Array(items) => {
            let items: Vec<Any> = items.iter().map(json_to_any).collect();
            Any::Array(Arc::from(items))
        }
        Value::Object(map) => {
            let map: HashMap<String, Any> = map
                .iter()
                .map(|(key, value)| (key.clone(), json_to_any(value)))
                .collect();
            Any::Map(Arc::new(map))
        }
    }
}

/// Convert a yrs [`Any`] to JSON.
///
/// Whole doubles in the safe integer range read back as integers, matching
/// values written by JavaScript peers.
pub fn any_to_json(any: &Any) -> Value {
    match any {
        Any::Null | Any::Undefined => Value::Null,
        Any::Bool(b) => Value::Bool(*b),
        Any::Number(n) => {
            if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                Value::from(*n as i64)
            } else {
                Number::from_f64(*n).map(Value::Number).unwrap_or(Value::Null)
            }
        }
        Any::BigInt(i) => Value::from(*i),
        Any::String(s) => Value::String(s.to_string()),
        Any::Buffer(bytes) => Value::Array(bytes.iter().map(|b| Value::from(*b)).collect()),
        Any::Array(items) => Value::Array(items.iter().map(any_to_json).collect()),
        Any::Map(map) => {
            let mut object = Map::new();
            for (key, value) in map.iter() {
                object.insert(key.clone(), any_to_json(value));
            }
            Value::Object(object)
        }
    }
}

/// Read any yrs value as JSON.
pub fn out_to_json<T: ReadTxn>(out: &Out, txn: &T) -> Value {
    match out {
        Out::Any(any) => any_to_json(any),
        Out::YText(text) => Value::String(text.get_string(txn)),
        Out::YMap(map) => map_to_json(map, txn),
        Out::YArray(array) => array_to_json(array, txn),
        _ => Value::Null,
    }
}

pub fn map_to_json<T: ReadTxn>(map: &MapRef, txn: &T) -> Value {
    let mut object = Map::new();
    for (key, value) in map.iter(txn) {
        object.insert(key.to_string(), out_to_json(&value, txn));
    }
    Value::Object(object)
}

pub fn array_to_json<T: ReadTxn>(array: &ArrayRef, txn: &T) -> Value {
    Value::Array(
        array
            .iter(txn)
            .map(|value| out_to_json(&value, txn))
            .collect(),
    )
}

/// Write `value` under `key`, replacing whatever was there.
pub fn insert_json(map: &MapRef, txn: &mut TransactionMut, key: &str, value: &Value) {
    match value {
        Value::Object(fields) if !is_encoded_reference(value) => {
            let nested = map.insert(txn, key, MapPrelim::default());
            fill_map(&nested, txn, fields);
        }
        Value::Array(items) => {
            let nested = map.insert(txn, key, ArrayPrelim::default());
            fill_array(&nested, txn, items);
        }
        _ => {
            map.insert(txn, key, json_to_any(value));
        }
    }
}

/// Insert `value` into `array` at `index`.
pub fn insert_json_at(array: &ArrayRef, txn: &mut TransactionMut, index: u32, value: &Value) {
    match value {
        Value::Object(fields) if !is_encoded_reference(value) => {
            let nested = array.insert(txn, index, MapPrelim::default());
            fill_map(&nested, txn, fields);
        }
        Value::Array(items) => {
            let nested = array.insert(txn, index, ArrayPrelim::default());
            fill_array(&nested, txn, items);
        }
        _ => {
            array.insert(txn, index, json_to_any(value));
        }
    }
}

fn fill_map(map: &MapRef, txn: &mut TransactionMut, fields: &Map<String, Value>) {
    for (key, value) in fields {
        insert_json(map, txn, key, value);
    }
}

fn fill_array(array: &ArrayRef, txn: &mut TransactionMut, items: &[Value]) {
    for (index, item) in items.iter().enumerate() {
        insert_json_at(array, txn, index as u32, item);
    }
}

/// Rewrite `text` to `content` with a single delete and a single insert.
///
/// Only the span between the common prefix and suffix changes, so positions
/// anchored outside that span survive the edit. Returns whether the text
/// changed.
pub fn apply_text_diff(text: &TextRef, txn: &mut TransactionMut, content: &str) -> bool {
    let current = text.get_string(&*txn);
    if current == content {
        return false;
    }

    let current_chars: Vec<char> = current.chars().collect();
    let new_chars: Vec<char> = content.chars().collect();

    let common_prefix = current_chars
        .iter()
        .zip(new_chars.iter())
        .take_while(|(a, b)| a == b)
        .count();

    let remaining_current = current_chars.len() - common_prefix;
    let remaining_new = new_chars.len() - common_prefix;
    let common_suffix = current_chars[common_prefix..]
        .iter()
        .rev()
        .zip(new_chars[common_prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .take(remaining_current.min(remaining_new))
        .count();

    // Text offsets are UTF-8 byte offsets
    let start = utf8_len(&current_chars[..common_prefix]);
    let delete_len = utf8_len(&current_chars[common_prefix..current_chars.len() - common_suffix]);
    let insert: String = new_chars[common_prefix..new_chars.len() - common_suffix]
        .iter()
        .collect();

    if delete_len > 0 {
        text.remove_range(txn, start, delete_len);
    }
    if !insert.is_empty() {
        text.insert(txn, start, &insert);
    }
    true
}

fn utf8_len(chars: &[char]) -> u32 {
    chars.iter().map(|c| c.len_utf8() as u32).sum()
}
