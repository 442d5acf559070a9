//! Patch Sender: drains delta blocks for one entity and POSTs
//! them to inventory ingest, handling reset, long-offline recovery, retry
//! backoff, and entity-ID changes.

mod backoff;

pub use backoff::Backoff;

use crate::clock::SharedClock;
use crate::entity::{EntityId, EntityKey};
use crate::error::{AgentError, AgentResult};
use crate::http::{HttpClient, HttpRequest, Method};
use crate::model::{DeltaBlock, DeltasResponse, ResetVerdict};
use crate::register::{KnownIds, RegisterClient, RegisterState};
use crate::store::DeltaStore;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::watch;

/// Which wire shape the sender uses to identify the entity on each POST.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SenderMode {
    /// `{ externalKeys, isAgent }` — classic Connect-V1 shape.
    Standard,
    /// `{ entityID, isAgent }`, resolved via Register.
    Vortex,
}

pub struct SenderConfig {
    pub collector_url: String,
    pub inventory_ingest_endpoint: String,
    pub reset_if_offline: Duration,
    pub compact_enabled: bool,
    pub compact_threshold: u64,
    pub mode: SenderMode,
    pub rate_limited_backoff: Duration,
}

pub enum ProcessOutcome {
    NoDeltas,
    Sent { blocks: usize },
    NeedReset,
    RateLimited { retry_after: Duration },
}

struct EntityRuntimeState {
    last_delta_removal: Option<Instant>,
    backoff: Backoff,
}

pub struct PatchSender {
    store: Arc<DeltaStore>,
    http: Arc<dyn HttpClient>,
    clock: SharedClock,
    config: SenderConfig,
    register: Option<Arc<RegisterClient>>,
    known_ids: Option<Arc<KnownIds>>,
    runtime: Mutex<HashMap<EntityKey, EntityRuntimeState>>,
    reconnect_tx: watch::Sender<u64>,
    reconnect_rx: watch::Receiver<u64>,
}

impl PatchSender {
    pub fn new(
        store: Arc<DeltaStore>,
        http: Arc<dyn HttpClient>,
        clock: SharedClock,
        config: SenderConfig,
        register: Option<Arc<RegisterClient>>,
        known_ids: Option<Arc<KnownIds>>,
    ) -> Self {
        let (reconnect_tx, reconnect_rx) = watch::channel(0);
        Self {
            store,
            http,
            clock,
            config,
            register,
            known_ids,
            runtime: Mutex::new(HashMap::new()),
            reconnect_tx,
            reconnect_rx,
        }
    }

    /// Subscribe to the reconnect signal fired after a successful POST that
    /// followed a long-offline reset.
    pub fn subscribe_reconnect(&self) -> watch::Receiver<u64> {
        self.reconnect_rx.clone()
    }

    /// Current retry backoff for `entity`, for the runtime's send-timer to
    /// consult after a `process` error.
    pub fn current_backoff(&self, entity: &EntityKey) -> Duration {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        runtime.entry(entity.clone()).or_insert_with(default_runtime_state).backoff.current()
    }

    fn entity_url(&self) -> String {
        format!(
            "{}/{}/deltas",
            self.config.collector_url.trim_end_matches('/'),
            self.config.inventory_ingest_endpoint
        )
    }

    /// Drains and submits deltas for `entity`. `agent_id` is the current
    /// agent identity (needed to detect an agent-ID change); `is_agent_entity`
    /// marks whether `entity` is the agent's own entity.
    pub async fn process(&self, entity: &EntityKey, agent_id: EntityId, is_agent_entity: bool) -> AgentResult<ProcessOutcome> {
        if is_agent_entity {
            if let Some(previous) = self.store.last_entity_id(entity) {
                if previous != agent_id && !previous.is_empty() {
                    self.store.remove_entity(entity)?;
                    self.store.set_last_entity_id(entity, agent_id)?;
                    return Ok(ProcessOutcome::NeedReset);
                }
            }
            self.store.set_last_entity_id(entity, agent_id)?;
        }

        if self.is_long_offline(entity) {
            self.store.remove_entity(entity)?;
            self.mark_delta_removal(entity);
            return Ok(ProcessOutcome::NeedReset);
        }

        let blocks = self.store.read_deltas(entity);
        if blocks.is_empty() {
            // Refresh-on-empty: avoids long-offline firing on inactive-but-healthy agents.
            self.store.touch_last_submission(entity)?;
            return Ok(ProcessOutcome::NoDeltas);
        }

        let came_from_long_offline = self.took_long_offline_recovery(entity);
        let mut sent = 0usize;

        for block in blocks {
            match self.post_block(entity, is_agent_entity, &block).await {
                Ok(PostOutcome::Accepted(state_map)) => {
                    self.store.update_state(entity, &state_map)?;
                    self.clear_backoff(entity);
                    sent += 1;
                }
                Ok(PostOutcome::ResetAll) => {
                    self.store.reset_all_deltas(entity)?;
                    break;
                }
                Ok(PostOutcome::Dropped) => {
                    // Vortex register failure: logged already, try next reap.
                    break;
                }
                Err(AgentError::RateLimited { retry_after }) => {
                    let d = retry_after.unwrap_or(self.config.rate_limited_backoff);
                    return Ok(ProcessOutcome::RateLimited { retry_after: d });
                }
                Err(e) => {
                    self.bump_backoff(entity);
                    return Err(e);
                }
            }
        }

        if came_from_long_offline && sent > 0 {
            self.reconnect_tx.send_modify(|v| *v = v.wrapping_add(1));
        }

        if self.config.compact_enabled {
            self.store.compact_storage(entity, self.config.compact_threshold)?;
        }

        Ok(ProcessOutcome::Sent { blocks: sent })
    }

    async fn post_block(&self, entity: &EntityKey, is_agent: bool, block: &DeltaBlock) -> AgentResult<PostOutcome> {
        let payload = match self.config.mode {
            SenderMode::Standard => serde_json::json!([{
                "externalKeys": [entity.0.clone()],
                "isAgent": is_agent,
                "deltas": block.deltas,
            }]),
            SenderMode::Vortex => {
                let Some(id) = self.resolve_vortex_entity_id(entity).await else {
                    return Ok(PostOutcome::Dropped);
                };
                serde_json::json!([{
                    "entityID": id.0,
                    "isAgent": is_agent,
                    "deltas": block.deltas,
                }])
            }
        };

        let request = HttpRequest::new(Method::Post, self.entity_url())
            .header("Content-Type", "application/json")
            .header("X-NRI-Entity-Key", entity.0.clone())
            .body(serde_json::to_vec(&payload)?);

        let resp = self.http.send(request).await?;
        if resp.is_rate_limited() {
            return Err(AgentError::RateLimited { retry_after: resp.retry_after });
        }
        if !resp.is_success() {
            return Err(AgentError::transient(format!("deltas POST failed: HTTP {}", resp.status)));
        }

        let parsed: DeltasResponse = resp.json()?;
        if parsed.reset == ResetVerdict::All {
            return Ok(PostOutcome::ResetAll);
        }
        let state_map: BTreeMap<String, u64> = parsed
            .state_map
            .into_iter()
            .map(|(k, v)| (k, v.last_stored_id))
            .collect();
        Ok(PostOutcome::Accepted(state_map))
    }

    async fn resolve_vortex_entity_id(&self, entity: &EntityKey) -> Option<EntityId> {
        if let Some(known_ids) = &self.known_ids {
            if let Some(id) = known_ids.get(entity) {
                return Some(id);
            }
        }
        let register = self.register.as_ref()?;
        if register.state() != RegisterState::Healthy {
            tracing::debug!(entity = %entity, "register not healthy, dropping this reap's submission");
            return None;
        }
        match register.register_batch(vec![entity.clone()]).await {
            Ok(resolved) => {
                let id = resolved.get(entity).copied();
                if let (Some(id), Some(known_ids)) = (id, &self.known_ids) {
                    known_ids.insert(entity.clone(), id);
                }
                id
            }
            Err(e) => {
                tracing::warn!(entity = %entity, error = %e, "register failed, dropping this reap's submission");
                None
            }
        }
    }

    fn is_long_offline(&self, entity: &EntityKey) -> bool {
        let last_submission = match self.store.last_submission(entity) {
            Some(t) => t,
            None => return false,
        };
        let since_submission = self.clock.now_utc().signed_duration_since(last_submission);
        let reset_threshold = chrono::Duration::from_std(self.config.reset_if_offline).unwrap();
        if since_submission <= reset_threshold {
            return false;
        }

        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let Some(state) = runtime.get(entity) else {
            return true;
        };
        match state.last_delta_removal {
            None => true,
            Some(last_removal) => self.clock.now_instant().duration_since(last_removal) > self.config.reset_if_offline,
        }
    }

    fn mark_delta_removal(&self, entity: &EntityKey) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let state = runtime.entry(entity.clone()).or_insert_with(default_runtime_state);
        state.last_delta_removal = Some(self.clock.now_instant());
    }

    fn took_long_offline_recovery(&self, entity: &EntityKey) -> bool {
        let runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        runtime.get(entity).map(|s| s.last_delta_removal.is_some()).unwrap_or(false)
    }

    fn bump_backoff(&self, entity: &EntityKey) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let state = runtime.entry(entity.clone()).or_insert_with(default_runtime_state);
        state.backoff.bump();
    }

    fn clear_backoff(&self, entity: &EntityKey) {
        let mut runtime = self.runtime.lock().unwrap_or_else(|e| e.into_inner());
        let state = runtime.entry(entity.clone()).or_insert_with(default_runtime_state);
        state.backoff.reset();
    }
}

fn default_runtime_state() -> EntityRuntimeState {
    EntityRuntimeState { last_delta_removal: None, backoff: Backoff::new(Duration::from_secs(1), Duration::from_secs(120)) }
}

enum PostOutcome {
    Accepted(BTreeMap<String, u64>),
    ResetAll,
    Dropped,
}
