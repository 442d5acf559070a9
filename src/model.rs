//! Wire/storage data types.

use crate::entity::{EntityId, EntityKey, PluginId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// Anything that can be placed into a `PluginSnapshot`; ordered by
/// `sort_key()` before storage.
pub trait SortableItem {
    fn sort_key(&self) -> String;
    fn into_value(self) -> Value;
}

/// A single `(sortKey, value)` pair as submitted by a plugin, before
/// canonicalization.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub sort_key: String,
    pub value: Value,
}

impl SortableItem for InventoryItem {
    fn sort_key(&self) -> String {
        self.sort_key.clone()
    }

    fn into_value(self) -> Value {
        self.value
    }
}

/// What a plugin reports for one entity on one reap cycle.
#[derive(Debug, Clone)]
pub struct PluginOutput {
    pub plugin_id: PluginId,
    pub entity: EntityKey,
    pub data: Vec<InventoryItem>,
    /// `true` means "this plugin does not apply on this host" — a
    /// tombstone; such outputs are never stored.
    pub not_applicable: bool,
}

impl PluginOutput {
    pub fn new(plugin_id: PluginId, entity: EntityKey, data: Vec<InventoryItem>) -> Self {
        Self {
            plugin_id,
            entity,
            data,
            not_applicable: false,
        }
    }

    pub fn not_applicable(plugin_id: PluginId, entity: EntityKey) -> Self {
        Self {
            plugin_id,
            entity,
            data: Vec::new(),
            not_applicable: true,
        }
    }
}

/// Canonical per-(entity, plugin) snapshot: `sortKey -> object`, with object
/// keys sorted lexicographically. `BTreeMap` gives us that ordering for
/// free and makes two semantically-equal snapshots byte-identical once
/// serialized.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginSnapshot(pub BTreeMap<String, Value>);

impl PluginSnapshot {
    pub fn from_items(items: Vec<InventoryItem>) -> Self {
        let mut map = BTreeMap::new();
        for item in items {
            map.insert(item.sort_key, canonicalize(item.value));
        }
        PluginSnapshot(map)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Recursively sort object keys so that semantically-equal JSON values
/// serialize identically regardless of the order a plugin built them in.
pub fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut sorted = serde_json::Map::new();
            let mut keys: Vec<_> = map.keys().cloned().collect();
            keys.sort();
            for k in keys {
                sorted.insert(k.clone(), canonicalize(map[&k].clone()));
            }
            Value::Object(sorted)
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

/// A `(pluginID, sequenceID, jsonDiff)` triple.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub plugin_id: PluginId,
    pub sequence_id: u64,
    #[serde(rename = "diff")]
    pub json_diff: Value,
}

/// Ordered sequence of deltas whose serialized size fits within the
/// configured per-request budget.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeltaBlock {
    pub deltas: Vec<Delta>,
}

impl DeltaBlock {
    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(usize::MAX)
    }
}

/// Pre/post-registration remote entity record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterEntity {
    pub key: EntityKey,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<EntityId>,
}

/// A command-channel command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Command {
    pub id: String,
    pub hash: String,
    pub name: String,
    #[serde(default)]
    pub metadata: BTreeMap<String, Value>,
    /// Handler-specific payload. Named `arguments` on the wire.
    #[serde(rename = "arguments", default)]
    pub args: Value,
}

/// Body of the deltas-ingest POST response.
#[derive(Debug, Clone, Deserialize)]
pub struct DeltasResponse {
    pub reset: ResetVerdict,
    #[serde(default)]
    pub state_map: BTreeMap<String, PluginState>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResetVerdict {
    All,
    None,
}

#[derive(Debug, Clone, Copy, Deserialize)]
pub struct PluginState {
    pub last_stored_id: u64,
}

/// Body of the identity `connect`/`connect/update` response.
#[derive(Debug, Clone, Deserialize)]
pub struct ConnectResponse {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub guid: String,
    #[serde(default)]
    pub retry_after: Option<u64>,
    #[serde(default)]
    pub max_back_off: Option<u64>,
}

/// The established agent identity, held by the identity service and
/// broadcast to listeners.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: EntityId,
    pub guid: String,
}

/// An in-process event, as an open map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    #[serde(flatten)]
    pub fields: BTreeMap<String, Value>,
}

impl Event {
    pub fn new() -> Self {
        Self { fields: BTreeMap::new() }
    }

    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn serialized_len(&self) -> usize {
        serde_json::to_vec(self).map(|b| b.len()).unwrap_or(usize::MAX)
    }
}

impl Default for Event {
    fn default() -> Self {
        Self::new()
    }
}

/// A per-entity bundle of events ready to POST.
#[derive(Debug, Clone, Serialize)]
pub struct MetricPost {
    pub entity_id: EntityId,
    pub entity_key: EntityKey,
    pub is_agent: bool,
    pub events: Vec<Event>,
    pub reporting_agent_id: EntityId,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalize_sorts_nested_object_keys() {
        let value = serde_json::json!({"b": 1, "a": {"z": 1, "y": 2}});
        let canon = canonicalize(value);
        let rendered = serde_json::to_string(&canon).unwrap();
        assert_eq!(rendered, r#"{"a":{"y":2,"z":1},"b":1}"#);
    }

    #[test]
    fn snapshot_from_items_orders_by_sort_key() {
        let items = vec![
            InventoryItem { sort_key: "z".into(), value: serde_json::json!({"v": 1}) },
            InventoryItem { sort_key: "a".into(), value: serde_json::json!({"v": 2}) },
        ];
        let snap = PluginSnapshot::from_items(items);
        let keys: Vec<_> = snap.0.keys().cloned().collect();
        assert_eq!(keys, vec!["a".to_string(), "z".to_string()]);
    }
}
