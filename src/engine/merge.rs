//! Deep merge of specification fragments.
//!
//! Objects merge key by key. Two different arrays under the same key cannot
//! be merged blindly, so they become a conflict node
//! `{"mergeConflict": [first, second, ...]}` that
//! [`resolve_merge_conflicts`] reconciles afterwards. Any other collision
//! takes the later value.

use serde_json::{Map, Value};
use tracing::warn;

/// Tag of a conflict node.
pub const MERGE_CONFLICT: &str = "mergeConflict";

/// Keys whose conflicting lists are concatenated.
const CONCAT_KEYS: [&str; 3] = ["then", "when", "extensions"];

fn conflict_variants(value: &Value) -> Option<&Vec<Value>> {
    match value {
        Value::Object(map) if map.len() == 1 => map.get(MERGE_CONFLICT).and_then(Value::as_array),
        _ => None,
    }
}

fn conflict(variants: Vec<Value>) -> Value {
    let mut map = Map::new();
    map.insert(MERGE_CONFLICT.to_string(), Value::Array(variants));
    Value::Object(map)
}

/// Merges `b` into `a`; `b` is the later fragment.
#[must_use]
pub fn merge(a: Value, b: Value) -> Value {
    match (a, b) {
        (Value::Object(mut left), Value::Object(right)) => {
            if left.len() == 1 {
                if let Some(Value::Array(variants)) = left.get_mut(MERGE_CONFLICT) {
                    variants.push(Value::Object(right));
                    return Value::Object(left);
                }
            }
            for (key, value) in right {
                match left.get_mut(&key) {
                    Some(existing) => {
                        let previous = std::mem::take(existing);
                        *existing = merge(previous, value);
                    }
                    None => {
                        left.insert(key, value);
                    }
                }
            }
            Value::Object(left)
        }
        (Value::Array(left), Value::Array(right)) => {
            if left == right {
                Value::Array(left)
            } else {
                conflict(vec![Value::Array(left), Value::Array(right)])
            }
        }
        (existing, later @ Value::Array(_)) if conflict_variants(&existing).is_some() => {
            let mut variants = conflict_variants(&existing).cloned().unwrap_or_default();
            variants.push(later);
            conflict(variants)
        }
        (_, later) => later,
    }
}

/// Folds fragments left to right.
#[must_use]
pub fn merge_all(fragments: impl IntoIterator<Item = Value>) -> Value {
    fragments
        .into_iter()
        .fold(Value::Object(Map::new()), merge)
}

/// Reconciles conflict nodes.
///
/// Lists under `then`, `when` and `extensions`, and the action list of a
/// behaviour (`actions.<name>`), are concatenated in fragment order. Every
/// other conflict keeps the last variant and is reported. Returns the
/// resolved spec and the dotted paths of conflicts that needed the fallback.
#[must_use]
pub fn resolve_merge_conflicts(spec: Value) -> (Value, Vec<String>) {
    let mut unresolved = Vec::new();
    let mut path = Vec::new();
    let resolved = resolve(spec, &mut path, &mut unresolved);
    (resolved, unresolved)
}

fn concatenates(path: &[String]) -> bool {
    match path {
        [.., last] if CONCAT_KEYS.contains(&last.as_str()) => true,
        [.., parent, _] => parent == "actions",
        _ => false,
    }
}

fn resolve(value: Value, path: &mut Vec<String>, unresolved: &mut Vec<String>) -> Value {
    if let Some(variants) = conflict_variants(&value) {
        let variants: Vec<Value> = variants
            .iter()
            .cloned()
            .map(|v| resolve(v, path, unresolved))
            .collect();
        if concatenates(path) {
            let mut out = Vec::new();
            for variant in variants {
                match variant {
                    Value::Array(items) => out.extend(items),
                    other => out.push(other),
                }
            }
            return Value::Array(out);
        }
        let joined = path.join(".");
        warn!(path = %joined, variants = variants.len(), "unresolved merge conflict, keeping the last fragment");
        unresolved.push(joined);
        return variants.into_iter().last().unwrap_or(Value::Null);
    }
    match value {
        Value::Object(map) => {
            let mut out = Map::new();
            for (key, child) in map {
                path.push(key.clone());
                out.insert(key, resolve(child, path, unresolved));
                path.pop();
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(
            items
                .into_iter()
                .map(|item| resolve(item, path, unresolved))
                .collect(),
        ),
        other => other,
    }
}
