//! Dotted-path accessors over JSON documents. Stages use these pervasively to
//! read inputs and write enrichment results ("doc.lang", "meta.error").
//!
//! `get_path` returns `Option` so "path missing" stays distinguishable from
//! "path holds null" (or any other falsy value).

use serde_json::{Map, Value};

/// Read the value at a dotted path. Object keys are matched literally; a
/// segment that parses as an index steps into arrays. An empty path never
/// resolves.
pub fn get_path<'a>(root: &'a Value, dotted: &str) -> Option<&'a Value> {
    if dotted.is_empty() {
        return None;
    }
    let mut current = root;
    for segment in dotted.split('.') {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(current)
}

/// Write `value` at a dotted path, creating intermediate objects for missing
/// segments. An intermediate that exists but is not an object is replaced by
/// one. An empty path is a no-op.
pub fn set_path(root: &mut Value, dotted: &str, value: Value) {
    if dotted.is_empty() {
        return;
    }
    let mut current = root;
    let mut segments = dotted.split('.').peekable();
    while let Some(segment) = segments.next() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("just ensured object");
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        current = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
