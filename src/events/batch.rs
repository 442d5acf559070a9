//! Pure batching/grouping logic for the event pipeline, kept
//! separate from the async plumbing in `mod.rs` so it can be unit-tested
//! without spinning up channels and tasks.

use crate::entity::{EntityId, EntityKey};
use crate::model::{Event, MetricPost};
use std::collections::BTreeMap;

/// One event tagged with the entity it resolved to, ready to enter a batch.
#[derive(Debug, Clone)]
pub struct TaggedEvent {
    pub entity_id: EntityId,
    pub entity_key: EntityKey,
    pub is_agent: bool,
    pub event: Event,
}

/// `true` when appending `next_event_bytes` would cross either budget (spec
/// §4.D accumulator flush condition (a)/(b)); the timer condition (c) is
/// driven by the caller's own tick, not this function.
pub fn should_flush(current_batch_len: usize, current_batch_bytes: usize, next_event_bytes: usize, max_count: usize, max_bytes: usize) -> bool {
    if current_batch_len == 0 {
        return false;
    }
    current_batch_len >= max_count || current_batch_bytes + next_event_bytes > max_bytes
}

/// Group a flushed batch into one `MetricPost` per entity.
pub fn group_into_metric_posts(batch: Vec<TaggedEvent>, reporting_agent_id: EntityId) -> Vec<MetricPost> {
    let mut grouped: BTreeMap<EntityKey, (EntityId, bool, Vec<Event>)> = BTreeMap::new();
    for tagged in batch {
        let entry = grouped.entry(tagged.entity_key.clone()).or_insert_with(|| (tagged.entity_id, tagged.is_agent, Vec::new()));
        entry.2.push(tagged.event);
    }
    grouped
        .into_iter()
        .map(|(entity_key, (entity_id, is_agent, events))| MetricPost {
            entity_id,
            entity_key,
            is_agent,
            events,
            reporting_agent_id,
        })
        .collect()
}
