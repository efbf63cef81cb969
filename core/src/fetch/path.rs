use bytes::Bytes;
use gather_protocol::NestedIdentity;
use serde_json::Map;
use serde_json::Value;
use std::collections::BTreeMap;
use wildmatch::WildMatch;

use crate::error::FetchError;

pub(crate) fn parse_source(raw: &Bytes) -> Result<Value, FetchError> {
    serde_json::from_slice(raw).map_err(|err| FetchError::InvalidSource {
        message: err.to_string(),
    })
}

pub(crate) fn serialize_source(value: &Value) -> Result<Bytes, FetchError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| FetchError::InvalidSource {
            message: err.to_string(),
        })
}

pub(crate) fn compile_patterns(patterns: &[String]) -> Vec<WildMatch> {
    patterns.iter().map(|pattern| WildMatch::new(pattern)).collect()
}

/// Applies an include/exclude projection. An include that names an object
/// keeps its whole subtree; excludes always win.
pub(crate) fn filter_source(value: &Value, includes: &[WildMatch], excludes: &[WildMatch]) -> Value {
    match value {
        Value::Object(map) => Value::Object(filter_object(
            map,
            "",
            includes.is_empty(),
            includes,
            excludes,
        )),
        other => other.clone(),
    }
}

fn filter_object(
    map: &Map<String, Value>,
    prefix: &str,
    included: bool,
    includes: &[WildMatch],
    excludes: &[WildMatch],
) -> Map<String, Value> {
    let mut filtered = Map::new();
    for (key, value) in map {
        let path = join(prefix, key);
        if let Some(kept) = filter_value(value, &path, included, includes, excludes) {
            filtered.insert(key.clone(), kept);
        }
    }
    filtered
}

fn filter_value(
    value: &Value,
    path: &str,
    included: bool,
    includes: &[WildMatch],
    excludes: &[WildMatch],
) -> Option<Value> {
    if excludes.iter().any(|pattern| pattern.matches(path)) {
        return None;
    }
    let included = included || includes.iter().any(|pattern| pattern.matches(path));
    match value {
        Value::Object(map) => {
            let filtered = filter_object(map, path, included, includes, excludes);
            if filtered.is_empty() && !(included && map.is_empty()) {
                None
            } else {
                Some(Value::Object(filtered))
            }
        }
        Value::Array(items) if items.iter().any(Value::is_object) => {
            let kept: Vec<Value> = items
                .iter()
                .filter_map(|item| match item {
                    Value::Object(_) => filter_value(item, path, included, includes, excludes),
                    scalar if included => Some(scalar.clone()),
                    _ => None,
                })
                .collect();
            if kept.is_empty() { None } else { Some(Value::Array(kept)) }
        }
        leaf => included.then(|| leaf.clone()),
    }
}

/// The nested child a hit refers to, cut out of its root document.
pub(crate) fn extract_nested(root: &Value, nested: &NestedIdentity) -> Result<Value, FetchError> {
    let mut current = root;
    for segment in nested.field.split('.') {
        current = current.get(segment).ok_or_else(|| missing_nested(nested))?;
    }
    match current {
        Value::Array(items) => items
            .get(nested.offset)
            .cloned()
            .ok_or_else(|| missing_nested(nested)),
        Value::Object(_) if nested.offset == 0 => Ok(current.clone()),
        _ => Err(missing_nested(nested)),
    }
}

fn missing_nested(nested: &NestedIdentity) -> FetchError {
    FetchError::InvalidSource {
        message: format!(
            "nested path [{}] has no entry at offset {}",
            nested.field, nested.offset
        ),
    }
}

/// Values under a dotted path. Arrays along the way are flattened.
pub(crate) fn collect_values(value: &Value, path: &str) -> Vec<Value> {
    let mut out = Vec::new();
    let segments: Vec<&str> = path.split('.').collect();
    collect_into(value, &segments, &mut out);
    out
}

fn collect_into(value: &Value, segments: &[&str], out: &mut Vec<Value>) {
    match (value, segments.split_first()) {
        (Value::Array(items), _) => {
            for item in items {
                collect_into(item, segments, out);
            }
        }
        (_, None) => {
            if !value.is_null() {
                out.push(value.clone());
            }
        }
        (Value::Object(map), Some((head, rest))) => {
            if let Some(child) = map.get(*head) {
                collect_into(child, rest, out);
            }
        }
        _ => {}
    }
}

/// Every leaf of `value` keyed by its dotted path.
pub(crate) fn flatten_leaves(value: &Value) -> BTreeMap<String, Vec<Value>> {
    let mut leaves = BTreeMap::new();
    flatten_into(value, "", &mut leaves);
    leaves
}

fn flatten_into(value: &Value, path: &str, leaves: &mut BTreeMap<String, Vec<Value>>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                flatten_into(child, &join(path, key), leaves);
            }
        }
        Value::Array(items) => {
            for item in items {
                flatten_into(item, path, leaves);
            }
        }
        Value::Null => {}
        leaf => {
            if !path.is_empty() {
                leaves.entry(path.to_string()).or_default().push(leaf.clone());
            }
        }
    }
}

fn join(prefix: &str, key: &str) -> String {
    if prefix.is_empty() {
        key.to_string()
    } else {
        format!("{prefix}.{key}")
    }
}
