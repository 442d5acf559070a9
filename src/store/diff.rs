//! Snapshot diffing.

use crate::model::PluginSnapshot;
use serde_json::Value;

/// Minimal object describing the transition from `old` to `new`:
/// added/changed keys map to their new value, removed keys map to an
/// explicit `null`. Returns `None` when there is no difference, so callers
/// can skip emitting a `Delta` when there's nothing new.
pub fn diff_snapshots(old: &PluginSnapshot, new: &PluginSnapshot) -> Option<Value> {
    let mut out = serde_json::Map::new();

    for (key, new_value) in &new.0 {
        match old.0.get(key) {
            Some(old_value) if old_value == new_value => {}
            _ => {
                out.insert(key.clone(), new_value.clone());
            }
        }
    }

    for key in old.0.keys() {
        if !new.0.contains_key(key) {
            out.insert(key.clone(), Value::Null);
        }
    }

    if out.is_empty() {
        None
    } else {
        Some(Value::Object(out))
    }
}

/// Apply a previously-computed diff to `base`, producing the snapshot the
/// backend would now have on file. Used by `UpdateState` bookkeeping and by
/// tests asserting the store/backend-snapshot invariant.
pub fn apply_diff(base: &PluginSnapshot, diff: &Value) -> PluginSnapshot {
    let mut result = base.0.clone();
    if let Value::Object(map) = diff {
        for (key, value) in map {
            if value.is_null() {
                result.remove(key);
            } else {
                result.insert(key.clone(), value.clone());
            }
        }
    }
    PluginSnapshot(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{InventoryItem, PluginSnapshot};

    fn snap(pairs: &[(&str, Value)]) -> PluginSnapshot {
        PluginSnapshot::from_items(
            pairs
                .iter()
                .map(|(k, v)| InventoryItem { sort_key: k.to_string(), value: v.clone() })
                .collect(),
        )
    }

    #[test]
    fn no_diff_when_equal() {
        let a = snap(&[("x", serde_json::json!({"v": 1}))]);
        let b = snap(&[("x", serde_json::json!({"v": 1}))]);
        assert!(diff_snapshots(&a, &b).is_none());
    }

    #[test]
    fn removed_key_becomes_explicit_null() {
        let old = snap(&[("x", serde_json::json!({"v": 1})), ("y", serde_json::json!({"v": 2}))]);
        let new = snap(&[("x", serde_json::json!({"v": 1}))]);
        let diff = diff_snapshots(&old, &new).unwrap();
        assert_eq!(diff, serde_json::json!({"y": null}));
    }

    #[test]
    fn added_and_changed_keys_carry_new_values() {
        let old = snap(&[("x", serde_json::json!({"v": 1}))]);
        let new = snap(&[("x", serde_json::json!({"v": 2})), ("y", serde_json::json!({"v": 3}))]);
        let diff = diff_snapshots(&old, &new).unwrap();
        assert_eq!(diff, serde_json::json!({"x": {"v": 2}, "y": {"v": 3}}));
    }

    #[test]
    fn apply_diff_round_trips_with_diff_snapshots() {
        let old = snap(&[("x", serde_json::json!({"v": 1})), ("y", serde_json::json!({"v": 2}))]);
        let new = snap(&[("x", serde_json::json!({"v": 9})), ("z", serde_json::json!({"v": 3}))]);
        let diff = diff_snapshots(&old, &new).unwrap();
        let applied = apply_diff(&old, &diff);
        assert_eq!(applied, new);
    }
}
