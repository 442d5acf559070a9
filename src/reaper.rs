//! Patch Reaper: stateless — turns just-saved `PluginOutput`s
//! into `Delta`s for one entity, and cleans up files for plugins that no
//! longer exist.

use crate::entity::{EntityKey, PluginId};
use crate::error::AgentResult;
use crate::store::DeltaStore;
use std::sync::Arc;

pub struct PatchReaper {
    store: Arc<DeltaStore>,
}

impl PatchReaper {
    pub fn new(store: Arc<DeltaStore>) -> Self {
        Self { store }
    }

    /// Diff current plugin snapshots against last-sent ones for `entity`,
    /// producing new `Delta`s. Returns the number of deltas emitted.
    pub fn reap(&self, entity: &EntityKey) -> AgentResult<usize> {
        self.store.update_plugins_inventory_cache(entity)
    }

    /// Remove on-disk state for plugins that are no longer registered.
    pub fn cleanup_old_plugins(&self, entity: &EntityKey, deprecated: &[PluginId]) -> AgentResult<()> {
        for plugin_id in deprecated {
            tracing::debug!(entity = %entity, plugin = %plugin_id, "cleaning up deprecated plugin");
            self.store.remove_plugin(entity, plugin_id)?;
        }
        Ok(())
    }
}
