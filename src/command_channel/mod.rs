//! Command Channel: periodic pull of remote commands, serialized
//! dispatch to handlers, and the built-in command set.

use crate::clock::SharedClock;
use crate::entity::EntityId;
use crate::error::{AgentError, AgentResult};
use crate::events::EventSender;
use crate::http::{HttpClient, HttpRequest, Method};
use crate::model::{Command, Event};
use crate::plugin::{IntegrationManager, StopOutcome};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// `Handle(ctx, cmd, initialFetch) -> error`.
#[async_trait]
pub trait CommandHandler: Send + Sync {
    async fn handle(&self, ctx: &CancellationToken, cmd: &Command, initial_fetch: bool) -> AgentResult<()>;
}

#[derive(Debug, Deserialize)]
struct CommandsResponse {
    #[serde(default)]
    return_value: Vec<Command>,
}

pub struct InitialFetchResult {
    pub timestamp: DateTime<Utc>,
    pub delay: Duration,
}

pub struct CommandChannelConfig {
    pub commands_url: String,
    pub poll_interval: Duration,
}

/// Drives `InitialFetch`/`Run` and owns the poll-delay cell
/// `backoff_command_channel` writes to.
pub struct CommandChannel {
    http: Arc<dyn HttpClient>,
    clock: SharedClock,
    config: CommandChannelConfig,
    handlers: BTreeMap<String, Arc<dyn CommandHandler>>,
    poll_delay: Mutex<Duration>,
}

impl CommandChannel {
    pub fn new(http: Arc<dyn HttpClient>, clock: SharedClock, config: CommandChannelConfig) -> Self {
        let initial_delay = config.poll_interval;
        Self {
            http,
            clock,
            config,
            handlers: BTreeMap::new(),
            poll_delay: Mutex::new(initial_delay),
        }
    }

    pub fn register_handler(&mut self, name: impl Into<String>, handler: Arc<dyn CommandHandler>) {
        self.handlers.insert(name.into(), handler);
    }

    fn current_poll_delay(&self) -> Duration {
        *self.poll_delay.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Synchronous bootstrap fetch.
    pub async fn initial_fetch(&self, ctx: &CancellationToken) -> AgentResult<InitialFetchResult> {
        let commands = self.fetch(EntityId::EMPTY).await?;
        for cmd in &commands {
            self.dispatch(ctx, cmd, true).await;
        }
        Ok(InitialFetchResult { timestamp: self.clock.now_utc(), delay: self.current_poll_delay() })
    }

    /// Background poller. Ticks at `max(pollDelaySecs, 1s)`,
    /// re-reading the delay cell every iteration so a `backoff_command_channel`
    /// command observed mid-run takes effect on the next tick.
    pub async fn run(&self, ctx: CancellationToken, agent_id: EntityId) {
        loop {
            let period = std::cmp::max(self.current_poll_delay(), Duration::from_secs(1));
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(period) => {}
            }
            if ctx.is_cancelled() {
                return;
            }
            match self.fetch(agent_id).await {
                Ok(commands) => {
                    for cmd in &commands {
                        self.dispatch(&ctx, cmd, false).await;
                    }
                }
                Err(e) => tracing::warn!(error = %e, "command channel fetch failed"),
            }
        }
    }

    async fn fetch(&self, agent_id: EntityId) -> AgentResult<Vec<Command>> {
        let request = HttpRequest::new(Method::Get, &self.config.commands_url)
            .header("X-NRI-Agent-Entity-Id", agent_id.0.to_string());
        let resp = self.http.send(request).await?;
        if !resp.is_success() {
            return Err(AgentError::transient(format!("command fetch failed: HTTP {}", resp.status)));
        }
        let parsed: CommandsResponse = resp.json()?;
        Ok(parsed.return_value)
    }

    /// Commands are dispatched one at a time; `dispatch` itself is only
    /// ever called from the single `initial_fetch`/`run` loop, so no extra
    /// lock is needed here.
    async fn dispatch(&self, ctx: &CancellationToken, cmd: &Command, initial_fetch: bool) {
        if cmd.name == "backoff_command_channel" {
            self.handle_backoff(cmd);
            return;
        }
        let Some(handler) = self.handlers.get(&cmd.name) else {
            tracing::error!(command = %cmd.name, "unknown command, discarding");
            return;
        };
        match handler.handle(ctx, cmd, initial_fetch).await {
            Ok(()) => {
                if !cmd.hash.is_empty() {
                    self.ack(cmd).await;
                }
            }
            Err(e) => tracing::error!(command = %cmd.name, error = %e, "command handler failed, not acking"),
        }
    }

    fn handle_backoff(&self, cmd: &Command) {
        #[derive(Deserialize)]
        struct BackoffArgs {
            delay: u64,
        }
        match serde_json::from_value::<BackoffArgs>(cmd.args.clone()) {
            Ok(args) => {
                *self.poll_delay.lock().unwrap_or_else(|e| e.into_inner()) = Duration::from_secs(args.delay);
            }
            Err(e) => tracing::error!(error = %e, "malformed backoff_command_channel arguments"),
        }
    }

    async fn ack(&self, cmd: &Command) {
        let body = match serde_json::to_vec(&serde_json::json!({ "hash": cmd.hash, "name": "ack" })) {
            Ok(b) => b,
            Err(_) => return,
        };
        let request = HttpRequest::new(Method::Post, &self.config.commands_url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Err(e) = self.http.send(request).await {
            tracing::warn!(error = %e, command = %cmd.name, "ack POST failed");
        }
    }
}

/// `set_feature_flag { category, flag, enabled }`.
pub struct SetFeatureFlagHandler {
    pub manager: Arc<crate::feature_flags::FeatureFlagManager>,
}

#[derive(Debug, Deserialize)]
struct SetFeatureFlagArgs {
    #[serde(default)]
    category: String,
    flag: String,
    enabled: bool,
}

#[async_trait]
impl CommandHandler for SetFeatureFlagHandler {
    async fn handle(&self, _ctx: &CancellationToken, cmd: &Command, initial_fetch: bool) -> AgentResult<()> {
        let args: SetFeatureFlagArgs = serde_json::from_value(cmd.args.clone())
            .map_err(|e| AgentError::InvalidArgs(e.to_string()))?;
        self.manager.handle_set_feature_flag(&args.category, &args.flag, args.enabled, initial_fetch)
    }
}

/// `run_integration { integration_name, integration_args[], metadata }`.
pub struct RunIntegrationHandler {
    pub manager: Arc<dyn IntegrationManager>,
    pub events: Option<Arc<EventSender>>,
    pub agent_key: crate::entity::EntityKey,
}

#[derive(Debug, Deserialize)]
struct RunIntegrationArgs {
    integration_name: String,
    #[serde(default)]
    integration_args: Vec<String>,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

#[async_trait]
impl CommandHandler for RunIntegrationHandler {
    async fn handle(&self, _ctx: &CancellationToken, cmd: &Command, _initial_fetch: bool) -> AgentResult<()> {
        let args: RunIntegrationArgs = serde_json::from_value(cmd.args.clone())
            .map_err(|e| AgentError::InvalidArgs(e.to_string()))?;
        self.manager.run_integration(&args.integration_name, args.integration_args.clone(), args.metadata).await;
        if let Some(events) = &self.events {
            let event = Event::new()
                .with_field("eventType", "InfrastructureEvent")
                .with_field("category", "integrations")
                .with_field("summary", format!("started integration {}", args.integration_name));
            let _ = events.queue_event(self.agent_key.clone(), event).await;
        }
        Ok(())
    }
}

/// `stop_integration { integration_name, integration_args[] }`, POSIX only.
/// The SIGTERM→grace→SIGKILL mechanics live behind `IntegrationManager`,
/// which is the external process-tracking collaborator.
pub struct StopIntegrationHandler {
    pub manager: Arc<dyn IntegrationManager>,
    pub events: Option<Arc<EventSender>>,
    pub agent_key: crate::entity::EntityKey,
}

#[derive(Debug, Deserialize)]
struct StopIntegrationArgs {
    integration_name: String,
    #[serde(default)]
    integration_args: Vec<String>,
}

#[async_trait]
impl CommandHandler for StopIntegrationHandler {
    async fn handle(&self, _ctx: &CancellationToken, cmd: &Command, _initial_fetch: bool) -> AgentResult<()> {
        if !cfg!(unix) {
            return Err(AgentError::OsNotSupported("stop_integration is POSIX only"));
        }
        let args: StopIntegrationArgs = serde_json::from_value(cmd.args.clone())
            .map_err(|e| AgentError::InvalidArgs(e.to_string()))?;
        let hash = format!("{}#{}", args.integration_name, args.integration_args.join(","));
        let outcome = self.manager.stop_integration(&hash).await;
        if let Some(events) = &self.events {
            let event = Event::new()
                .with_field("eventType", "InfrastructureEvent")
                .with_field("category", "integrations")
                .with_field("cmd_stop_mode", outcome.as_str());
            let _ = events.queue_event(self.agent_key.clone(), event).await;
        }
        match outcome {
            StopOutcome::Error => Err(AgentError::transient("stop_integration failed")),
            _ => Ok(()),
        }
    }
}
