//! Structural diffing and shallow comparison over JSON state trees.
//!
//! [`changed_paths`] computes the minimal set of changed leaf/branch paths
//! between two trees: it recurses into plain objects and treats arrays as
//! opaque values compared by deep equality. `serde_json::Value` trees are
//! acyclic by construction; a recursion-depth cap turns pathological
//! nesting into an opaque comparison instead of a stack overflow.

use serde_json::Value;

use crate::path::StatePath;

/// Subtrees nested deeper than this are compared as opaque values.
const MAX_DIFF_DEPTH: usize = 64;

/// Compute the minimal changed paths between `old` and `new`.
///
/// Paths are returned in a stable order (object key order of the newer
/// tree first, then keys removed from the old tree).
pub fn changed_paths(old: &Value, new: &Value) -> Vec<StatePath> {
    let mut changed = Vec::new();
    diff_into(old, new, StatePath::root(), 0, &mut changed);
    changed
}

/// Dedup the top-level keys under which `paths` fall, preserving order.
pub fn top_level_keys(paths: &[StatePath]) -> Vec<String> {
    let mut keys: Vec<String> = Vec::new();
    for path in paths {
        if let Some(top) = path.top_level() {
            if !keys.iter().any(|k| k == top) {
                keys.push(top.to_string());
            }
        }
    }
    keys
}

fn diff_into(
    old: &Value,
    new: &Value,
    prefix: StatePath,
    depth: usize,
    changed: &mut Vec<StatePath>,
) {
    match (old, new) {
        (Value::Object(old_map), Value::Object(new_map)) if depth < MAX_DIFF_DEPTH => {
            for (key, new_value) in new_map {
                let child = prefix.clone().key(key.clone());
                match old_map.get(key) {
                    Some(old_value) => diff_into(old_value, new_value, child, depth + 1, changed),
                    None => changed.push(child),
                }
            }
            for key in old_map.keys() {
                if !new_map.contains_key(key) {
                    changed.push(prefix.clone().key(key.clone()));
                }
            }
        }
        // Arrays and scalars are leaves: deep equality, one path on change.
        _ => {
            if old != new {
                changed.push(prefix);
            }
        }
    }
}

/// Default comparator of the shallow-compare middleware.
///
/// Two values are shallowly equal when they are equal primitives, or
/// containers of the same shape whose entries are equal one level deep.
pub fn shallow_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Object(a_map), Value::Object(b_map)) => {
            a_map.len() == b_map.len()
                && a_map
                    .iter()
                    .all(|(key, value)| b_map.get(key) == Some(value))
        }
        (Value::Array(a_items), Value::Array(b_items)) => a_items == b_items,
        _ => a == b,
    }
}

// ── tests ────────────────────────────────────────────────────────────
