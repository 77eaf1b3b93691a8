//! Partial-modification merging for update changes.
//!
//! Update changes carry a flat map whose keys may be dotted paths into
//! nested objects (`"meta.labels.0"`). Before such a change can be sent
//! upstream it is unflattened and merged over the record currently in the
//! local store, then projected back down to the keys the change touched.

use crate::record::EntityRecord;
use serde_json::{Map, Value};

/// Expands dotted-path keys into a nested JSON object.
///
/// `{"a.b": 1, "a.c": 2, "d": 3}` becomes `{"a": {"b": 1, "c": 2}, "d": 3}`.
/// A later key that collides with a scalar replaces it.
pub fn unflatten(mods: &Map<String, Value>) -> Map<String, Value> {
    let mut root = Map::new();
    for (path, value) in mods {
        let mut segments = path.split('.').peekable();
        let mut node = &mut root;
        while let Some(segment) = segments.next() {
            if segments.peek().is_none() {
                node.insert(segment.to_string(), value.clone());
            } else {
                let child = node
                    .entry(segment.to_string())
                    .or_insert_with(|| Value::Object(Map::new()));
                if !child.is_object() {
                    *child = Value::Object(Map::new());
                }
                node = child.as_object_mut().unwrap();
            }
        }
    }
    root
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (k, v) in overlay_map {
                match base_map.get_mut(k) {
                    Some(existing) => deep_merge(existing, v),
                    None => {
                        base_map.insert(k.clone(), v.clone());
                    }
                }
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Applies a flat modification map onto a record in place.
pub fn apply_mods(record: &mut EntityRecord, mods: &Map<String, Value>) {
    let nested = unflatten(mods);
    let mut base = Value::Object(record.clone().into_map());
    deep_merge(&mut base, &Value::Object(nested));
    if let Value::Object(merged) = base {
        *record = EntityRecord::from_map(merged);
    }
}

/// Merges a flat modification map over the stored record and returns only
/// the top-level fields the modifications touched, plus the record id.
///
/// This is the shape the batch-update endpoint expects: a partial entity
/// whose modified fields are fully resolved against local state.
pub fn merge_mods(stored: &EntityRecord, key: &str, mods: &Map<String, Value>) -> EntityRecord {
    let nested = unflatten(mods);
    let mut merged = stored.clone();
    apply_mods(&mut merged, mods);

    let mut out = Map::new();
    for field in nested.keys() {
        if let Some(value) = merged.get(field) {
            out.insert(field.clone(), value.clone());
        }
    }
    out.insert("id".into(), Value::from(key.to_string()));
    EntityRecord::from_map(out)
}
