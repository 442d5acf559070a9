//! Event Sender: three-stage pipeline batching in-process
//! events and POSTing them to events ingest.

mod batch;

pub use batch::{group_into_metric_posts, should_flush, TaggedEvent};

use crate::entity::EntityKey;
use crate::error::{AgentError, AgentResult};
use crate::http::{HttpClient, HttpRequest, Method};
use crate::identity::IdentityService;
use crate::model::Event;
use crate::register::{KnownIds, RegisterClient, RegisterState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

pub const MAX_EVENT_BATCH_COUNT: usize = 500;
pub const EVENT_BATCH_TIMER_DURATION: Duration = Duration::from_secs(1);

pub struct EventSenderConfig {
    pub event_queue_depth: usize,
    pub batch_queue_depth: usize,
    pub max_metrics_batch_size_bytes: usize,
    pub register_batch_size: usize,
    pub register_frequency: Duration,
    pub register_workers: usize,
    pub events_ingest_url: String,
    pub rate_limited_backoff: Duration,
}

struct NotYetIdentified {
    key: EntityKey,
    event: Event,
}

/// Owns the queue side of the pipeline; the running stages are spawned by
/// `start` and torn down by `stop`. The pipeline can be restarted after a
/// stop, which is why this is a handle rather than a one-shot future.
pub struct EventSender {
    config: EventSenderConfig,
    agent_key: EntityKey,
    known_ids: Arc<KnownIds>,
    register: Option<Arc<RegisterClient>>,
    identity: Arc<IdentityService>,
    http: Arc<dyn HttpClient>,
    event_tx: Mutex<Option<mpsc::Sender<(EntityKey, Event)>>>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl EventSender {
    pub fn new(
        config: EventSenderConfig,
        agent_key: EntityKey,
        known_ids: Arc<KnownIds>,
        register: Option<Arc<RegisterClient>>,
        identity: Arc<IdentityService>,
        http: Arc<dyn HttpClient>,
    ) -> Self {
        Self {
            config,
            agent_key,
            known_ids,
            register,
            identity,
            http,
            event_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// `QueueEvent`: size-checks and pushes onto the
    /// bounded event queue; a full queue drops the event and returns an
    /// error rather than blocking the caller.
    pub async fn queue_event(&self, key: EntityKey, event: Event) -> AgentResult<()> {
        if event.serialized_len() > self.config.max_metrics_batch_size_bytes {
            return Err(AgentError::InvalidArgs("event exceeds maxMetricsBatchSizeBytes".to_string()));
        }
        let guard = self.event_tx.lock().await;
        let Some(tx) = guard.as_ref() else {
            return Err(AgentError::Transient("event sender is not running".to_string()));
        };
        tx.try_send((key, event)).map_err(|_| AgentError::Transient("event queue full, event dropped".to_string()))
    }

    /// Spawn the pipeline stages. Calling `start` again after `stop` rebuilds
    /// fresh channels, so a stopped service can be restarted in place rather
    /// than requiring a new instance.
    pub async fn start(self: &Arc<Self>, ctx: CancellationToken) {
        let (event_tx, event_rx) = mpsc::channel(self.config.event_queue_depth.max(1));
        let (with_id_tx, with_id_rx) = mpsc::unbounded_channel::<TaggedEvent>();
        let (without_id_tx, without_id_rx) = mpsc::channel::<NotYetIdentified>(self.config.event_queue_depth.max(1));
        let without_id_rx: async_channel_compat::SharedReceiver<NotYetIdentified> = without_id_rx.into();
        let (batch_tx, batch_rx) = mpsc::channel::<Vec<TaggedEvent>>(self.config.batch_queue_depth.max(1));

        *self.event_tx.lock().await = Some(event_tx);

        let mut tasks = Vec::new();
        tasks.push(tokio::spawn(Self::tagging_stage(
            self.clone(),
            event_rx,
            with_id_tx.clone(),
            without_id_tx,
            ctx.clone(),
        )));

        for _ in 0..self.config.register_workers.max(1) {
            tasks.push(tokio::spawn(Self::resolver_stage(
                self.clone(),
                without_id_rx.clone(),
                with_id_tx.clone(),
                ctx.clone(),
            )));
        }

        tasks.push(tokio::spawn(Self::accumulator_stage(self.clone(), with_id_rx, batch_tx, ctx.clone())));
        tasks.push(tokio::spawn(Self::sender_stage(self.clone(), batch_rx, ctx.clone())));

        *self.tasks.lock().await = tasks;
    }

    /// Abort every pipeline task and drop the queue handle. In-flight events
    /// buffered in channels are discarded.
    pub async fn stop(&self) {
        *self.event_tx.lock().await = None;
        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for t in tasks {
            t.abort();
        }
    }

    async fn tagging_stage(
        self: Arc<Self>,
        mut event_rx: mpsc::Receiver<(EntityKey, Event)>,
        with_id_tx: mpsc::UnboundedSender<TaggedEvent>,
        without_id_tx: mpsc::Sender<NotYetIdentified>,
        ctx: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                next = event_rx.recv() => {
                    let Some((key, event)) = next else { return };
                    if key == self.agent_key {
                        let identity = match self.identity.agent_id(&ctx).await {
                            Ok(id) => id,
                            Err(_) => return,
                        };
                        let _ = with_id_tx.send(TaggedEvent { entity_id: identity.id, entity_key: key, is_agent: true, event });
                    } else if let Some(id) = self.known_ids.get(&key) {
                        let _ = with_id_tx.send(TaggedEvent { entity_id: id, entity_key: key, is_agent: false, event });
                    } else if without_id_tx.send(NotYetIdentified { key, event }).await.is_err() {
                        return;
                    }
                }
            }
        }
    }

    async fn resolver_stage(
        self: Arc<Self>,
        without_id_rx: async_channel_compat::SharedReceiver<NotYetIdentified>,
        with_id_tx: mpsc::UnboundedSender<TaggedEvent>,
        ctx: CancellationToken,
    ) {
        let Some(register) = self.register.clone() else { return };
        let mut pending: Vec<NotYetIdentified> = Vec::new();
        loop {
            let deadline = tokio::time::sleep(self.config.register_frequency);
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = deadline => {}
                item = without_id_rx.recv() => {
                    match item {
                        Some(item) => {
                            pending.push(item);
                            if pending.len() < self.config.register_batch_size {
                                continue;
                            }
                        }
                        None => return,
                    }
                }
            }
            if pending.is_empty() {
                continue;
            }
            if register.state() != RegisterState::Healthy {
                tracing::debug!("register not healthy, dropping {} queued events", pending.len());
                pending.clear();
                continue;
            }
            let keys: Vec<EntityKey> = pending.iter().map(|p| p.key.clone()).collect();
            match register.register_batch(keys).await {
                Ok(resolved) => {
                    for item in pending.drain(..) {
                        if let Some(id) = resolved.get(&item.key).copied() {
                            self.known_ids.insert(item.key.clone(), id);
                            let _ = with_id_tx.send(TaggedEvent { entity_id: id, entity_key: item.key, is_agent: false, event: item.event });
                        } else {
                            tracing::debug!(key = %item.key, "register did not resolve key, dropping event");
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "register batch failed, dropping {} queued events", pending.len());
                    pending.clear();
                }
            }
        }
    }

    async fn accumulator_stage(
        self: Arc<Self>,
        mut with_id_rx: mpsc::UnboundedReceiver<TaggedEvent>,
        batch_tx: mpsc::Sender<Vec<TaggedEvent>>,
        ctx: CancellationToken,
    ) {
        let mut current: Vec<TaggedEvent> = Vec::new();
        let mut current_bytes = 0usize;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = tokio::time::sleep(EVENT_BATCH_TIMER_DURATION) => {
                    if !current.is_empty() {
                        let flushed = std::mem::take(&mut current);
                        current_bytes = 0;
                        if batch_tx.send(flushed).await.is_err() {
                            return;
                        }
                    }
                }
                next = with_id_rx.recv() => {
                    let Some(tagged) = next else { return };
                    let next_bytes = tagged.event.serialized_len();
                    if should_flush(current.len(), current_bytes, next_bytes, MAX_EVENT_BATCH_COUNT, self.config.max_metrics_batch_size_bytes) {
                        let flushed = std::mem::take(&mut current);
                        current_bytes = 0;
                        if batch_tx.send(flushed).await.is_err() {
                            return;
                        }
                    }
                    current_bytes += next_bytes;
                    current.push(tagged);
                    if current.len() >= MAX_EVENT_BATCH_COUNT {
                        let flushed = std::mem::take(&mut current);
                        current_bytes = 0;
                        if batch_tx.send(flushed).await.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }

    async fn sender_stage(self: Arc<Self>, mut batch_rx: mpsc::Receiver<Vec<TaggedEvent>>, ctx: CancellationToken) {
        let mut backoff = Duration::from_secs(1);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                next = batch_rx.recv() => {
                    let Some(batch) = next else { return };
                    let reporting_agent_id = match self.identity.agent_id(&ctx).await {
                        Ok(id) => id.id,
                        Err(_) => return,
                    };
                    let posts = group_into_metric_posts(batch, reporting_agent_id);
                    match self.post_batch(&posts).await {
                        Ok(()) => backoff = Duration::from_secs(1),
                        Err(AgentError::RateLimited { retry_after }) => {
                            let d = retry_after.unwrap_or(self.config.rate_limited_backoff);
                            tokio::select! {
                                _ = tokio::time::sleep(d) => {}
                                _ = ctx.cancelled() => return,
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "events POST failed, backing off");
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = ctx.cancelled() => return,
                            }
                            backoff = std::cmp::min(backoff * 2, Duration::from_secs(60));
                        }
                    }
                }
            }
        }
    }

    async fn post_batch(&self, posts: &[crate::model::MetricPost]) -> AgentResult<()> {
        let body = serde_json::to_vec(posts)?;
        let request = HttpRequest::new(Method::Post, &self.config.events_ingest_url)
            .header("Content-Type", "application/json")
            .body(body);
        let resp = self.http.send(request).await?;
        if resp.is_rate_limited() {
            return Err(AgentError::RateLimited { retry_after: resp.retry_after });
        }
        if !resp.is_success() {
            return Err(AgentError::transient(format!("events POST failed: HTTP {}", resp.status)));
        }
        Ok(())
    }
}

/// `mpsc::Receiver` isn't `Clone`, but several resolver workers need to
/// share one `without_id` channel. This thin wrapper gives a bounded mpsc
/// receiver a cloneable, async `recv` by sharing it behind a mutex.
mod async_channel_compat {
    use std::sync::Arc;
    use tokio::sync::{mpsc, Mutex};

    pub struct SharedReceiver<T> {
        inner: Arc<Mutex<mpsc::Receiver<T>>>,
    }

    impl<T> Clone for SharedReceiver<T> {
        fn clone(&self) -> Self {
            Self { inner: self.inner.clone() }
        }
    }

    impl<T> From<mpsc::Receiver<T>> for SharedReceiver<T> {
        fn from(rx: mpsc::Receiver<T>) -> Self {
            Self { inner: Arc::new(Mutex::new(rx)) }
        }
    }

    impl<T> SharedReceiver<T> {
        pub async fn recv(&self) -> Option<T> {
            self.inner.lock().await.recv().await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::http::fake::FakeHttpClient;
    use crate::plugin::Harvester;

    struct StaticHarvester;

    #[async_trait::async_trait]
    impl Harvester for StaticHarvester {
        async fn fingerprint(&self) -> Result<serde_json::Value, String> {
            Ok(serde_json::json!({"host": "fixed"}))
        }
        async fn metadata(&self) -> Result<std::collections::BTreeMap<String, serde_json::Value>, String> {
            Ok(Default::default())
        }
    }

    async fn identity_with_known_id(id: u64) -> Arc<IdentityService> {
        let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(serde_json::json!({"id": id, "guid": "g"})))]));
        let svc = Arc::new(IdentityService::new(http, Arc::new(StaticHarvester), system_clock(), "http://identity", "v1"));
        svc.connect(&CancellationToken::new()).await.unwrap();
        svc
    }

    fn sender(identity: Arc<IdentityService>, http: Arc<dyn HttpClient>) -> Arc<EventSender> {
        Arc::new(EventSender::new(
            EventSenderConfig {
                event_queue_depth: 8,
                batch_queue_depth: 8,
                max_metrics_batch_size_bytes: 1_000_000,
                register_batch_size: 10,
                register_frequency: Duration::from_millis(50),
                register_workers: 1,
                events_ingest_url: "http://collector/events".to_string(),
                rate_limited_backoff: Duration::from_secs(30),
            },
            EntityKey::from("agent-key"),
            Arc::new(KnownIds::new(64)),
            None,
            identity,
            http,
        ))
    }

    #[tokio::test]
    async fn oversized_event_is_rejected_before_queueing() {
        let identity = identity_with_known_id(1).await;
        let http = Arc::new(FakeHttpClient::new(vec![]));
        let config = EventSenderConfig {
            event_queue_depth: 8,
            batch_queue_depth: 8,
            max_metrics_batch_size_bytes: 10,
            register_batch_size: 10,
            register_frequency: Duration::from_millis(50),
            register_workers: 1,
            events_ingest_url: "http://collector/events".to_string(),
            rate_limited_backoff: Duration::from_secs(30),
        };
        let s = Arc::new(EventSender::new(config, EntityKey::from("agent-key"), Arc::new(KnownIds::new(8)), None, identity, http));
        let huge = Event::new().with_field("payload", "x".repeat(100));
        let result = s.queue_event(EntityKey::from("agent-key"), huge).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn queue_event_fails_when_sender_not_started() {
        let identity = identity_with_known_id(1).await;
        let http = Arc::new(FakeHttpClient::new(vec![]));
        let s = sender(identity, http);
        let result = s.queue_event(EntityKey::from("agent-key"), Event::new()).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn agent_event_reaches_collector() {
        let identity = identity_with_known_id(7).await;
        let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(serde_json::json!({})))]));
        let s = sender(identity, http.clone());
        let ctx = CancellationToken::new();
        s.start(ctx.clone()).await;

        s.queue_event(EntityKey::from("agent-key"), Event::new().with_field("kind", "test")).await.unwrap();
        tokio::time::sleep(Duration::from_millis(1200)).await;

        assert!(!http.requests.lock().unwrap().is_empty(), "expected at least one POST to events ingest");
        s.stop().await;
    }
}
