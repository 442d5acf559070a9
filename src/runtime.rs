//! Agent Runtime: startup sequence and the single-task inventory
//! loop that drives reaping, sending, and entity bookkeeping.

use crate::clock::SharedClock;
use crate::command_channel::{CommandChannel, CommandChannelConfig};
use crate::config::AgentConfig;
use crate::entity::{host_aliases_plugin_id, EntityKey, IdLookup, PluginId};
use crate::error::{AgentError, AgentResult};
use crate::events::{EventSender, EventSenderConfig};
use crate::feature_flags::FeatureFlagManager;
use crate::http::{HttpClient, HttpRequest, Method};
use crate::identity::IdentityService;
use crate::model::{Identity, InventoryItem, PluginOutput};
use crate::plugin::{Killable, Plugin};
use crate::reaper::PatchReaper;
use crate::register::{KnownIds, RegisterClient};
use crate::sender::{PatchSender, ProcessOutcome, SenderConfig, SenderMode};
use crate::store::{DeltaStore, StoreConfig};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// How long the inventory loop waits for every known plugin to have
/// produced at least one output before reaping anyway (the initial reap
/// grace period).
const INITIAL_REAP_MAX_WAIT: Duration = Duration::from_secs(60);

const RATE_LIMITED_BACKOFF: Duration = Duration::from_secs(60);

/// Capacity-bound channel a concrete `Plugin` implementation is constructed
/// with to submit inventory.
pub fn plugin_channel(depth: usize) -> (mpsc::Sender<PluginOutput>, mpsc::Receiver<PluginOutput>) {
    mpsc::channel(depth.max(1))
}

/// Liveness-only channel a plugin may use to mark its entity recently
/// active without submitting data.
pub fn active_entities_channel(depth: usize) -> (mpsc::Sender<EntityKey>, mpsc::Receiver<EntityKey>) {
    mpsc::channel(depth.max(1))
}

/// Everything the runtime needs from its caller to start up. Plugins must
/// already be constructed against the sender half
/// of `plugin_channel`/`active_entities_channel`; the caller hands the
/// matching receiver halves here so data they submit actually reaches the
/// inventory loop.
pub struct RuntimeDeps {
    pub config: AgentConfig,
    pub http: Arc<dyn HttpClient>,
    pub identity: Arc<IdentityService>,
    pub clock: SharedClock,
    pub plugins: Vec<Arc<dyn Plugin>>,
    pub plugin_rx: mpsc::Receiver<PluginOutput>,
    pub active_rx: mpsc::Receiver<EntityKey>,
    pub feature_flags: Arc<FeatureFlagManager>,
    pub command_handlers: Vec<(String, Arc<dyn crate::command_channel::CommandHandler>)>,
}

pub struct AgentRuntime {
    config: AgentConfig,
    store: Arc<DeltaStore>,
    reaper: PatchReaper,
    sender: Arc<PatchSender>,
    identity: Arc<IdentityService>,
    events: Arc<EventSender>,
    command_channel: Arc<CommandChannel>,
    http: Arc<dyn HttpClient>,
    clock: SharedClock,
    plugins: Vec<Arc<dyn Plugin>>,
    agent_key: RwLock<EntityKey>,
    id_lookup: Mutex<IdLookup>,
    plugin_rx: Mutex<Option<mpsc::Receiver<PluginOutput>>>,
    active_rx: Mutex<Option<mpsc::Receiver<EntityKey>>>,
}

impl AgentRuntime {
    /// Resolve the agent key, open the store, and wire the sender/event
    /// pipelines.
    pub fn new(deps: RuntimeDeps) -> AgentResult<Arc<Self>> {
        let mut id_lookup = IdLookup::new();
        if let Some(name) = &deps.config.display_name {
            id_lookup.set("display-name", name);
        }
        let hostname = deps
            .config
            .override_hostname
            .clone()
            .or_else(|| hostname::get().ok().map(|h| h.to_string_lossy().into_owned()))
            .unwrap_or_default();
        id_lookup.set("hostname", &hostname);
        let short = deps
            .config
            .override_hostname_short
            .clone()
            .unwrap_or_else(|| hostname.split('.').next().unwrap_or(&hostname).to_string());
        id_lookup.set("short-hostname", short);
        let agent_key = EntityKey::from(id_lookup.agent_key()?);

        let store = Arc::new(DeltaStore::open(
            &deps.config.app_data_dir,
            StoreConfig {
                max_inventory_size: deps.config.max_inventory_size,
                disable_inventory_split: deps.config.disable_inventory_split,
                ignored_inventory_paths: deps.config.ignored_inventory_paths_map.clone(),
                compact_enabled: deps.config.compact_enabled,
                compact_threshold_bytes: deps.config.compact_threshold,
            },
            deps.clock.clone(),
        )?;
        store.change_default_entity(agent_key.clone());

        let register = if deps.config.register_enabled {
            Some(Arc::new(RegisterClient::new(
                deps.http.clone(),
                deps.clock.clone(),
                format!("{}/register", deps.config.collector_url.trim_end_matches('/')),
            )))
        } else {
            None
        };
        let known_ids = register.as_ref().map(|_| Arc::new(KnownIds::new(10_000)));

        let sender = Arc::new(PatchSender::new(
            store.clone(),
            deps.http.clone(),
            deps.clock.clone(),
            SenderConfig {
                collector_url: deps.config.collector_url.clone(),
                inventory_ingest_endpoint: deps.config.inventory_ingest_endpoint.clone(),
                reset_if_offline: deps.config.offline_time_to_reset,
                compact_enabled: deps.config.compact_enabled,
                compact_threshold: deps.config.compact_threshold,
                mode: if deps.config.register_enabled { SenderMode::Vortex } else { SenderMode::Standard },
                rate_limited_backoff: RATE_LIMITED_BACKOFF,
            },
            register.clone(),
            known_ids.clone(),
        ));

        let events = Arc::new(EventSender::new(
            EventSenderConfig {
                event_queue_depth: deps.config.event_queue_depth,
                batch_queue_depth: deps.config.batch_queue_depth,
                max_metrics_batch_size_bytes: deps.config.max_metrics_batch_size_bytes,
                register_batch_size: deps.config.register_batch_size,
                register_frequency: deps.config.register_frequency_secs,
                register_workers: deps.config.register_concurrency,
                events_ingest_url: format!(
                    "{}/{}/events/bulk",
                    deps.config.collector_url.trim_end_matches('/'),
                    deps.config.metrics_ingest_endpoint
                ),
                rate_limited_backoff: RATE_LIMITED_BACKOFF,
            },
            agent_key.clone(),
            known_ids.unwrap_or_else(|| Arc::new(KnownIds::new(10_000))),
            register,
            deps.identity.clone(),
            deps.http.clone(),
        ));

        let mut command_channel = CommandChannel::new(
            deps.http.clone(),
            deps.clock.clone(),
            CommandChannelConfig {
                commands_url: format!("{}/agent_commands/v1/commands", deps.config.collector_url.trim_end_matches('/')),
                poll_interval: Duration::from_secs(deps.config.command_channel_interval_sec.max(1)),
            },
        );
        command_channel.register_handler(
            "set_feature_flag",
            Arc::new(crate::command_channel::SetFeatureFlagHandler { manager: deps.feature_flags.clone() }),
        );
        for (name, handler) in deps.command_handlers {
            command_channel.register_handler(name, handler);
        }

        Ok(Arc::new(Self {
            reaper: PatchReaper::new(store.clone()),
            store,
            sender,
            identity: deps.identity,
            events,
            command_channel: Arc::new(command_channel),
            http: deps.http,
            clock: deps.clock,
            plugins: deps.plugins,
            agent_key: RwLock::new(agent_key),
            id_lookup: Mutex::new(id_lookup),
            plugin_rx: Mutex::new(Some(deps.plugin_rx)),
            active_rx: Mutex::new(Some(deps.active_rx)),
            config: deps.config,
        }))
    }

    fn agent_key(&self) -> EntityKey {
        self.agent_key.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// HEAD the collector URL with bounded retries; a negative retry budget
    /// means infinite.
    async fn probe_collector_reachable(&self, ctx: &CancellationToken) -> AgentResult<()> {
        let mut attempts_left = self.config.startup_connection_retries;
        loop {
            if ctx.is_cancelled() {
                return Err(AgentError::Bootstrap("cancelled during reachability probe".to_string()));
            }
            let request = HttpRequest::new(Method::Head, self.config.collector_url.clone())
                .header("Content-Type", "application/json")
                .header("X-License-Key", self.config.license.clone());
            match self.http.send(request).await {
                Ok(resp) if resp.is_success() || resp.status == 405 => return Ok(()),
                _ => {}
            }
            if attempts_left == 0 {
                return Err(AgentError::Bootstrap("collector unreachable, retry budget exhausted".to_string()));
            }
            if attempts_left > 0 {
                attempts_left -= 1;
            }
            tokio::select! {
                _ = tokio::time::sleep(self.config.startup_connection_timeout) => {}
                _ = ctx.cancelled() => return Err(AgentError::Bootstrap("cancelled during reachability probe".to_string())),
            }
        }
    }

    /// Drive the whole pipeline until `ctx` is cancelled.
    pub async fn run(self: Arc<Self>, ctx: CancellationToken) -> AgentResult<()> {
        if self.config.connect_enabled {
            self.probe_collector_reachable(&ctx).await?;
        }

        let connect_handle = {
            let identity = self.identity.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move {
                let _ = identity.connect(&ctx).await;
            })
        };

        for plugin in &self.plugins {
            let plugin = plugin.clone();
            let ctx = ctx.clone();
            tokio::spawn(async move { plugin.run(ctx).await });
        }

        self.events.start(ctx.clone()).await;

        let command_channel = self.command_channel.clone();
        let command_ctx = ctx.clone();
        let agent_id_rx = self.identity.subscribe();
        let command_handle = tokio::spawn(async move {
            let _ = command_channel.initial_fetch(&command_ctx).await;
            let agent_id = agent_id_rx.borrow().as_ref().map(|i| i.id).unwrap_or(crate::entity::EntityId::EMPTY);
            command_channel.run(command_ctx, agent_id).await;
        });

        let plugin_rx = self
            .plugin_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AgentError::Bootstrap("run() called more than once".to_string()))?;
        let active_rx = self
            .active_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .ok_or_else(|| AgentError::Bootstrap("run() called more than once".to_string()))?;

        let result = self.inventory_loop(ctx.clone(), plugin_rx, active_rx).await;

        self.events.stop().await;
        connect_handle.abort();
        command_handle.abort();

        result
    }

    async fn inventory_loop(
        self: &Arc<Self>,
        ctx: CancellationToken,
        mut plugin_rx: mpsc::Receiver<PluginOutput>,
        mut active_rx: mpsc::Receiver<EntityKey>,
    ) -> AgentResult<()> {
        let known_plugin_ids: HashSet<PluginId> = self.plugins.iter().map(|p| p.id()).collect();
        let mut reported_plugin_ids: HashSet<PluginId> = HashSet::new();
        let mut dirty: HashSet<EntityKey> = HashSet::new();
        let mut needs_cleanup: HashSet<EntityKey> = HashSet::new();
        let mut deprecated_plugins: HashMap<EntityKey, Vec<PluginId>> = HashMap::new();
        let mut last_active: HashMap<EntityKey, Instant> = HashMap::new();
        let started_at = Instant::now();

        let forward_only = self.config.is_forward_only;
        let mut reap_deadline = Instant::now() + self.config.first_reap_interval;
        let mut send_interval = self.config.send_interval;
        let mut send_deadline = Instant::now() + send_interval;
        let mut remove_deadline = Instant::now() + self.config.remove_entities_period;
        let mut last_remove_sweep: HashMap<EntityKey, Instant> = HashMap::new();

        loop {
            tokio::select! {
                _ = ctx.cancelled() => {
                    return Ok(());
                }
                entity = active_rx.recv() => {
                    if let Some(entity) = entity {
                        last_active.insert(entity, Instant::now());
                    }
                }
                data = plugin_rx.recv() => {
                    let Some(data) = data else { continue };
                    if data.plugin_id == host_aliases_plugin_id() {
                        self.rekey_from_host_aliases(&data);
                    } else if data.not_applicable {
                        deprecated_plugins.entry(data.entity.clone()).or_default().push(data.plugin_id.clone());
                        needs_cleanup.insert(data.entity.clone());
                        dirty.insert(data.entity.clone());
                    } else {
                        self.store.save_plugin_source(&data.entity, &data.plugin_id.category, &data.plugin_id.term, data.data.clone())?;
                        dirty.insert(data.entity.clone());
                        last_active.insert(data.entity.clone(), Instant::now());
                        reported_plugin_ids.insert(data.plugin_id.clone());
                    }
                }
                _ = tokio::time::sleep_until(reap_deadline.into()), if !forward_only => {
                    reap_deadline = Instant::now() + self.config.reap_interval;
                    let initial_reap_ready = reported_plugin_ids.len() >= known_plugin_ids.len()
                        || started_at.elapsed() >= INITIAL_REAP_MAX_WAIT;
                    if initial_reap_ready {
                        for entity in dirty.drain().collect::<Vec<_>>() {
                            self.reaper.reap(&entity)?;
                            if needs_cleanup.remove(&entity) {
                                let deprecated = deprecated_plugins.remove(&entity).unwrap_or_default();
                                self.reaper.cleanup_old_plugins(&entity, &deprecated)?;
                            }
                        }
                    }
                }
                _ = tokio::time::sleep_until(send_deadline.into()), if !forward_only => {
                    let mut next_interval = self.config.send_interval;
                    let agent_id = self.identity.subscribe().borrow().clone();
                    if let Some(Identity { id: agent_id, .. }) = agent_id {
                        let entities: Vec<EntityKey> = last_active.keys().cloned().chain(std::iter::once(self.agent_key())).collect();
                        let mut seen = HashSet::new();
                        for entity in entities {
                            if !seen.insert(entity.clone()) {
                                continue;
                            }
                            let is_agent = entity == self.agent_key();
                            match self.sender.process(&entity, agent_id, is_agent).await {
                                Ok(ProcessOutcome::RateLimited { retry_after }) => {
                                    next_interval = std::cmp::max(next_interval, retry_after);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    tracing::warn!(entity = %entity, error = %e, "patch sender process failed");
                                    next_interval = std::cmp::max(next_interval, self.sender.current_backoff(&entity));
                                }
                            }
                        }
                    }
                    send_interval = next_interval;
                    send_deadline = Instant::now() + send_interval;
                }
                _ = tokio::time::sleep_until(remove_deadline.into()) => {
                    remove_deadline = Instant::now() + self.config.remove_entities_period;
                    let agent_key = self.agent_key();
                    let mut stale: Vec<EntityKey> = Vec::new();
                    for (entity, seen) in last_active.iter() {
                        if entity == &agent_key {
                            continue;
                        }
                        if let Some(prev) = last_remove_sweep.get(entity) {
                            if seen <= prev {
                                stale.push(entity.clone());
                            }
                        }
                    }
                    for entity in &stale {
                        self.store.remove_entity(entity)?;
                        last_active.remove(entity);
                        dirty.remove(entity);
                    }
                    last_remove_sweep = last_active.clone();

                    let mut known: HashSet<EntityKey> = last_active.keys().cloned().collect();
                    known.insert(agent_key);
                    for stray in self.store.scan_entity_folders(&known) {
                        let _ = self.store.remove_entity_folder(&stray);
                    }
                }
            }
        }
    }

    fn rekey_from_host_aliases(&self, data: &PluginOutput) {
        let mut lookup = self.id_lookup.lock().unwrap_or_else(|e| e.into_inner());
        for item in &data.data {
            if let Some(alias) = item.value.get("alias").and_then(|v| v.as_str()) {
                lookup.set(item.sort_key.clone(), alias);
            }
        }
        match lookup.agent_key() {
            Ok(new_key) => {
                let new_key = EntityKey::from(new_key);
                let mut current = self.agent_key.write().unwrap_or_else(|e| e.into_inner());
                if *current != new_key {
                    tracing::info!(old = %*current, new = %new_key, "agent key re-derived from host aliases");
                    *current = new_key.clone();
                    self.store.change_default_entity(new_key);
                }
            }
            Err(e) => tracing::warn!(error = %e, "host aliases rekey produced no usable agent key"),
        }
    }

    /// Cancel the process context and, on a service shutdown that demands
    /// it, notify identity.
    pub async fn shutdown(&self, ctx: &CancellationToken, disconnect_reason: Option<&str>) {
        ctx.cancel();
        if let Some(reason) = disconnect_reason {
            if let Some(Identity { id, .. }) = self.identity.subscribe().borrow().clone() {
                self.identity.disconnect(id, reason).await;
            }
        }
        for plugin in &self.plugins {
            if let Some(killable) = plugin_as_killable(plugin) {
                killable.kill();
            }
        }
    }
}

/// `Plugin` doesn't require `Killable`; this is an optional capability
/// check (a concrete plugin type would implement both traits and be
/// checked via `dyn Any` in practice — this hook is the seam a real
/// downcast would use).
fn plugin_as_killable(_plugin: &Arc<dyn Plugin>) -> Option<&dyn Killable> {
    None
}
