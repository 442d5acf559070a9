//! The delta store: a content-addressed store of per-entity,
//! per-plugin inventory snapshots, which diffs and queues deltas for the
//! patch sender.

mod diff;
mod paths;

pub use diff::{apply_diff, diff_snapshots};
pub use paths::{atomic_write, StorePaths};

use crate::clock::SharedClock;
use crate::entity::{sanitize_entity_key, EntityId, EntityKey, PluginId};
use crate::error::AgentResult;
use crate::model::{Delta, DeltaBlock, InventoryItem, PluginSnapshot};
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::Path;
use std::sync::Mutex;

/// Configuration the store needs from `AgentConfig`.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub max_inventory_size: usize,
    pub disable_inventory_split: bool,
    /// Lowercased `category/term/sortKey` entries to drop on save.
    pub ignored_inventory_paths: HashSet<String>,
    pub compact_enabled: bool,
    pub compact_threshold_bytes: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            max_inventory_size: 1_000_000,
            disable_inventory_split: false,
            ignored_inventory_paths: HashSet::new(),
            compact_enabled: false,
            compact_threshold_bytes: 10 * 1024 * 1024,
        }
    }
}

type EntityPlugin = (EntityKey, PluginId);

/// In-memory mirror of the on-disk delta store, guarded by a single mutex
/// since the reaper is the only writer per (entity, plugin) file.
struct StoreState {
    current: HashMap<EntityPlugin, PluginSnapshot>,
    last_sent: HashMap<EntityPlugin, PluginSnapshot>,
    sequence_ids: HashMap<EntityPlugin, u64>,
    /// Cross-plugin insertion-ordered queue of not-yet-acknowledged deltas,
    /// per entity.
    pending: HashMap<EntityKey, Vec<Delta>>,
    last_submission: HashMap<EntityKey, DateTime<Utc>>,
    last_entity_id: HashMap<EntityKey, EntityId>,
    /// Alias from the empty entity key to the current agent key
    /// (`ChangeDefaultEntity`).
    default_entity: Option<EntityKey>,
}

pub struct DeltaStore {
    paths: StorePaths,
    config: StoreConfig,
    clock: SharedClock,
    state: Mutex<StoreState>,
}

impl DeltaStore {
    pub fn open(root: impl Into<std::path::PathBuf>, config: StoreConfig, clock: SharedClock) -> AgentResult<Self> {
        let paths = StorePaths::new(root.into());
        let sequence_ids = load_sequence_ids(&paths)?;
        let store = Self {
            paths,
            config,
            clock,
            state: Mutex::new(StoreState {
                current: HashMap::new(),
                last_sent: HashMap::new(),
                sequence_ids,
                pending: HashMap::new(),
                last_submission: HashMap::new(),
                last_entity_id: HashMap::new(),
                default_entity: None,
            }),
        };
        Ok(store)
    }

    fn resolve_entity(&self, entity: &EntityKey, state: &StoreState) -> EntityKey {
        if entity.0.is_empty() {
            state.default_entity.clone().unwrap_or_else(|| entity.clone())
        } else {
            entity.clone()
        }
    }

    /// Rebind the empty entity key to `new_key`.
    pub fn change_default_entity(&self, new_key: EntityKey) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.default_entity = Some(new_key);
    }

    /// Write the canonical-form snapshot atomically, honoring
    /// `IgnoredInventoryPaths`.
    pub fn save_plugin_source(
        &self,
        entity: &EntityKey,
        category: &str,
        term: &str,
        items: Vec<InventoryItem>,
    ) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);

        let filtered: Vec<InventoryItem> = items
            .into_iter()
            .filter(|item| {
                let dotted = format!("{category}/{term}/{}", item.sort_key).to_lowercase();
                !self.config.ignored_inventory_paths.contains(&dotted)
            })
            .collect();

        let snapshot = PluginSnapshot::from_items(filtered);
        let plugin_id = PluginId::new(category, term);

        let path = self.paths.current_snapshot(category, &entity.0, term);
        let bytes = serde_json::to_vec_pretty(&rendered_snapshot(&snapshot))?;
        atomic_write(&path, &bytes)?;

        state.current.insert((entity, plugin_id), snapshot);
        Ok(())
    }

    /// Diff current snapshots against the last-sent baseline for every
    /// plugin known for `entity`, appending a `Delta` for each plugin whose
    /// snapshot changed, and advance the baseline to match. Idempotent when
    /// nothing changed.
    pub fn update_plugins_inventory_cache(&self, entity: &EntityKey) -> AgentResult<usize> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);

        let plugin_ids: Vec<PluginId> = state
            .current
            .keys()
            .filter(|(e, _)| *e == entity)
            .map(|(_, p)| p.clone())
            .collect();

        let mut emitted = 0usize;
        for plugin_id in plugin_ids {
            let key = (entity.clone(), plugin_id.clone());
            let current = state.current.get(&key).cloned().unwrap_or_default();
            let baseline = state.last_sent.get(&key).cloned().unwrap_or_default();

            let Some(json_diff) = diff_snapshots(&baseline, &current) else {
                continue;
            };

            let seq = state.sequence_ids.entry(key.clone()).or_insert(0);
            *seq += 1;
            let sequence_id = *seq;

            persist_sequence_ids(&self.paths, &state.sequence_ids)?;

            state.last_sent.insert(key.clone(), current.clone());
            let last_sent_path = self
                .paths
                .last_sent_snapshot(&plugin_id.category, &entity.0, &plugin_id.term);
            let bytes = serde_json::to_vec_pretty(&rendered_snapshot(&current))?;
            atomic_write(&last_sent_path, &bytes)?;

            let delta = Delta { plugin_id: plugin_id.clone(), sequence_id, json_diff };
            state.pending.entry(entity.clone()).or_default().push(delta);
            emitted += 1;
        }

        Ok(emitted)
    }

    /// Split the entity's pending deltas into blocks no larger than
    /// `max_inventory_size` bytes serialized.
    pub fn read_deltas(&self, entity: &EntityKey) -> Vec<DeltaBlock> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        let Some(deltas) = state.pending.get(&entity) else {
            return Vec::new();
        };
        if deltas.is_empty() {
            return Vec::new();
        }
        if self.config.disable_inventory_split {
            return vec![DeltaBlock { deltas: deltas.clone() }];
        }

        let mut blocks = Vec::new();
        let mut current = DeltaBlock::default();
        for delta in deltas {
            let mut candidate = current.clone();
            candidate.deltas.push(delta.clone());
            if candidate.serialized_len() > self.config.max_inventory_size && !current.deltas.is_empty() {
                blocks.push(current);
                current = DeltaBlock { deltas: vec![delta.clone()] };
            } else {
                current = candidate;
            }
        }
        if !current.deltas.is_empty() {
            blocks.push(current);
        }
        blocks
    }

    /// Advance the acknowledgment watermark: drop pending deltas whose
    /// plugin appears in `state_map` with `sequence_id <= last_stored_id`.
    pub fn update_state(&self, entity: &EntityKey, state_map: &BTreeMap<String, u64>) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        if let Some(deltas) = state.pending.get_mut(&entity) {
            deltas.retain(|d| {
                match state_map.get(&d.plugin_id.rendered()) {
                    Some(last_stored) => d.sequence_id > *last_stored,
                    None => true,
                }
            });
        }
        let now = self.clock.now_utc();
        state.last_submission.insert(entity.clone(), now);
        persist_timestamp(&self.paths, &entity, now)?;
        Ok(())
    }

    /// Refresh `last_submission` without requiring any deltas to have been
    /// sent (used for the "ping on empty" normalization).
    pub fn touch_last_submission(&self, entity: &EntityKey) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        let now = self.clock.now_utc();
        state.last_submission.insert(entity.clone(), now);
        persist_timestamp(&self.paths, &entity, now)?;
        Ok(())
    }

    pub fn last_submission(&self, entity: &EntityKey) -> Option<DateTime<Utc>> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.last_submission.get(&entity).copied()
    }

    pub fn last_entity_id(&self, entity: &EntityKey) -> Option<EntityId> {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.last_entity_id.get(&entity).copied()
    }

    pub fn set_last_entity_id(&self, entity: &EntityKey, id: EntityId) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.last_entity_id.insert(entity.clone(), id);
        let path = self.paths.last_entity_id(&entity.0);
        atomic_write(&path, id.0.to_string().as_bytes())?;
        Ok(())
    }

    /// Discard pending deltas and cached snapshots for the entity; zero
    /// sequence counters.
    pub fn reset_all_deltas(&self, entity: &EntityKey) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.pending.remove(&entity);
        let keys: Vec<EntityPlugin> = state
            .last_sent
            .keys()
            .filter(|(e, _)| *e == entity)
            .cloned()
            .collect();
        for key in &keys {
            state.last_sent.remove(key);
            state.sequence_ids.remove(key);
        }
        persist_sequence_ids(&self.paths, &state.sequence_ids)?;
        let repo_dir = self.paths.entity_state_dir(&entity.0);
        let _ = std::fs::remove_dir_all(&repo_dir);
        Ok(())
    }

    /// Remove every file for the entity.
    pub fn remove_entity(&self, entity: &EntityKey) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.pending.remove(&entity);
        state.last_submission.remove(&entity);
        state.last_entity_id.remove(&entity);
        let keys: Vec<EntityPlugin> = state
            .current
            .keys()
            .chain(state.last_sent.keys())
            .filter(|(e, _)| *e == entity)
            .cloned()
            .collect();
        for key in &keys {
            state.current.remove(key);
            state.last_sent.remove(key);
            state.sequence_ids.remove(key);
        }
        persist_sequence_ids(&self.paths, &state.sequence_ids)?;

        let sanitized = sanitize_entity_key(&entity.0);
        let _ = std::fs::remove_dir_all(self.paths.entity_state_dir(&entity.0));
        if let Ok(entries) = std::fs::read_dir(self.paths.root()) {
            for entry in entries.flatten() {
                if !entry.path().is_dir() {
                    continue;
                }
                let category_dir = entry.path();
                let entity_dir = category_dir.join(&sanitized);
                if entity_dir.is_dir() {
                    let _ = std::fs::remove_dir_all(&entity_dir);
                }
            }
        }
        Ok(())
    }

    /// Remove the current and last-sent snapshot files and sequence counter
    /// for one plugin that's been deprecated for `entity`. Leaves every
    /// other plugin's state untouched.
    pub fn remove_plugin(&self, entity: &EntityKey, plugin_id: &PluginId) -> AgentResult<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        let key = (entity.clone(), plugin_id.clone());
        state.current.remove(&key);
        state.last_sent.remove(&key);
        state.sequence_ids.remove(&key);
        persist_sequence_ids(&self.paths, &state.sequence_ids)?;

        let current_path = self.paths.current_snapshot(&plugin_id.category, &entity.0, &plugin_id.term);
        let _ = std::fs::remove_file(current_path);
        let last_sent_path = self.paths.last_sent_snapshot(&plugin_id.category, &entity.0, &plugin_id.term);
        let _ = std::fs::remove_file(last_sent_path);
        Ok(())
    }

    /// Rewrite files to shrink disk usage if the entity's on-disk footprint
    /// exceeds `threshold_bytes`. Archived
    /// (already-acknowledged) deltas are discarded; the current/last-sent
    /// snapshots are unaffected since they're already minimal.
    pub fn compact_storage(&self, entity: &EntityKey, threshold_bytes: u64) -> AgentResult<bool> {
        let size = self.entity_disk_size(entity)?;
        if size <= threshold_bytes {
            return Ok(false);
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let entity = self.resolve_entity(entity, &state);
        state.pending.remove(&entity);
        Ok(true)
    }

    fn entity_disk_size(&self, entity: &EntityKey) -> AgentResult<u64> {
        let mut total = 0u64;
        if let Ok(entries) = std::fs::read_dir(self.paths.root()) {
            for entry in entries.flatten() {
                let category_dir = entry.path();
                if !category_dir.is_dir() {
                    continue;
                }
                let entity_dir = category_dir.join(sanitize_entity_key(&entity.0));
                total += dir_size(&entity_dir);
            }
        }
        Ok(total)
    }

    /// Enumerate entity directories under the store root that don't belong
    /// to any currently-known entity.
    pub fn scan_entity_folders(&self, known_keys: &HashSet<EntityKey>) -> Vec<std::path::PathBuf> {
        let known_sanitized: HashSet<String> =
            known_keys.iter().map(|k| sanitize_entity_key(&k.0)).collect();
        let mut stray = Vec::new();
        let Ok(entries) = std::fs::read_dir(self.paths.root()) else {
            return stray;
        };
        for entry in entries.flatten() {
            let category_dir = entry.path();
            if !category_dir.is_dir() || category_dir.file_name().map(|n| n == paths::DELTA_REPO_DIR).unwrap_or(false) {
                continue;
            }
            let Ok(subentries) = std::fs::read_dir(&category_dir) else {
                continue;
            };
            for sub in subentries.flatten() {
                let p = sub.path();
                if p.is_dir() {
                    let name = p.file_name().and_then(|n| n.to_str()).unwrap_or("").to_string();
                    if !known_sanitized.contains(&name) {
                        stray.push(p);
                    }
                }
            }
        }
        stray
    }

    /// Delete a stray entity folder previously returned by
    /// `scan_entity_folders`.
    pub fn remove_entity_folder(&self, folder: &Path) -> AgentResult<()> {
        std::fs::remove_dir_all(folder)?;
        Ok(())
    }
}

fn dir_size(dir: &Path) -> u64 {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return 0;
    };
    let mut total = 0u64;
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            total += dir_size(&path);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

fn rendered_snapshot(snapshot: &PluginSnapshot) -> Value {
    serde_json::to_value(&snapshot.0).unwrap_or(Value::Null)
}

fn load_sequence_ids(paths: &StorePaths) -> AgentResult<HashMap<EntityPlugin, u64>> {
    let path = paths.delta_id_file();
    if !path.exists() {
        return Ok(HashMap::new());
    }
    let bytes = std::fs::read(&path)?;
    if bytes.is_empty() {
        // Treated as "no snapshot" rather than an error.
        return Ok(HashMap::new());
    }
    let raw: BTreeMap<String, u64> = match serde_json::from_slice(&bytes) {
        Ok(v) => v,
        Err(_) => return Ok(HashMap::new()),
    };
    let mut map = HashMap::new();
    for (k, v) in raw {
        if let Some((entity, plugin)) = decode_seq_key(&k) {
            map.insert((entity, plugin), v);
        }
    }
    Ok(map)
}

fn persist_sequence_ids(paths: &StorePaths, map: &HashMap<EntityPlugin, u64>) -> AgentResult<()> {
    let raw: BTreeMap<String, u64> = map
        .iter()
        .map(|((entity, plugin), seq)| (encode_seq_key(entity, plugin), *seq))
        .collect();
    let bytes = serde_json::to_vec_pretty(&raw)?;
    atomic_write(&paths.delta_id_file(), &bytes)?;
    Ok(())
}

fn encode_seq_key(entity: &EntityKey, plugin: &PluginId) -> String {
    format!("{}\u{1f}{}", entity.0, plugin.rendered())
}

fn decode_seq_key(key: &str) -> Option<(EntityKey, PluginId)> {
    let (entity, plugin) = key.split_once('\u{1f}')?;
    let (category, term) = plugin.split_once('/')?;
    Some((EntityKey(entity.to_string()), PluginId::new(category, term)))
}

fn persist_timestamp(paths: &StorePaths, entity: &EntityKey, when: DateTime<Utc>) -> AgentResult<()> {
    let path = paths.last_submission(&entity.0);
    atomic_write(&path, when.to_rfc3339().as_bytes())?;
    Ok(())
}
