//! Identity Service: establishes and maintains the agent's
//! numeric ID and GUID, and broadcasts identity changes to listeners.

use crate::clock::SharedClock;
use crate::error::{AgentError, AgentResult};
use crate::http::{HttpClient, HttpRequest, Method};
use crate::model::{ConnectResponse, Identity};
use crate::plugin::Harvester;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityEvent {
    Connect,
    Reconnect,
}

struct Inner {
    fingerprint: Option<serde_json::Value>,
}

/// Holds the identity in a watch channel so `agent_id()` can block until
/// it's non-empty.
pub struct IdentityService {
    http: Arc<dyn HttpClient>,
    harvester: Arc<dyn Harvester>,
    clock: SharedClock,
    connect_url: String,
    connect_update_url: String,
    disconnect_url: String,
    tx: watch::Sender<Option<Identity>>,
    rx: watch::Receiver<Option<Identity>>,
    inner: Mutex<Inner>,
    backoff_cap: Duration,
}

impl IdentityService {
    pub fn new(
        http: Arc<dyn HttpClient>,
        harvester: Arc<dyn Harvester>,
        clock: SharedClock,
        identity_url: &str,
        identity_ingest_endpoint: &str,
    ) -> Self {
        let (tx, rx) = watch::channel(None);
        Self {
            http,
            harvester,
            clock,
            connect_url: format!("{identity_url}/{identity_ingest_endpoint}/connect"),
            connect_update_url: format!("{identity_url}/{identity_ingest_endpoint}/connect/update"),
            disconnect_url: format!("{identity_url}/{identity_ingest_endpoint}/disconnect"),
            tx,
            rx,
            inner: Mutex::new(Inner { fingerprint: None }),
            backoff_cap: Duration::from_secs(60),
        }
    }

    /// Subscribe to identity changes; the returned receiver yields on both
    /// the first non-empty ID (`Connect`) and any later change
    /// (`Reconnect`).
    pub fn subscribe(&self) -> watch::Receiver<Option<Identity>> {
        self.rx.clone()
    }

    /// Blocks until the identity is known, or the token is cancelled.
    pub async fn agent_id(&self, ctx: &CancellationToken) -> AgentResult<Identity> {
        let mut rx = self.rx.clone();
        loop {
            if let Some(identity) = rx.borrow().clone() {
                return Ok(identity);
            }
            tokio::select! {
                _ = ctx.cancelled() => return Err(AgentError::EmptyEntityId),
                changed = rx.changed() => {
                    if changed.is_err() {
                        return Err(AgentError::EmptyEntityId);
                    }
                }
            }
        }
    }

    /// Blocking bootstrap call.
    pub async fn connect(&self, ctx: &CancellationToken) -> AgentResult<Identity> {
        let mut backoff = Duration::from_secs(1);
        loop {
            if ctx.is_cancelled() {
                return Err(AgentError::Bootstrap("cancelled during connect".to_string()));
            }

            let fingerprint = match self.harvester.fingerprint().await {
                Ok(f) => f,
                Err(e) => {
                    tracing::warn!(error = %e, "fingerprint harvest failed, retrying in 1s");
                    if sleep_or_cancel(ctx, Duration::from_secs(1)).await {
                        return Err(AgentError::Bootstrap("cancelled".to_string()));
                    }
                    continue;
                }
            };

            let metadata = match self.harvester.metadata().await {
                Ok(m) => m,
                Err(e) => {
                    tracing::info!(error = %e, "metadata harvest failed, continuing without it");
                    Default::default()
                }
            };

            let body = serde_json::to_vec(&serde_json::json!({
                "fingerprint": fingerprint,
                "metadata": metadata,
            }))?;
            let request = HttpRequest::new(Method::Post, &self.connect_url)
                .header("Content-Type", "application/json")
                .body(body);

            let resp = match self.http.send(request).await {
                Ok(r) => r,
                Err(e) => {
                    tracing::warn!(error = %e, backoff = ?backoff, "connect failed, backing off");
                    if sleep_or_cancel(ctx, backoff).await {
                        return Err(AgentError::Bootstrap("cancelled".to_string()));
                    }
                    backoff = next_backoff(backoff, self.backoff_cap);
                    continue;
                }
            };

            let parsed: ConnectResponse = resp.json()?;
            if parsed.id != 0 {
                let identity = Identity { id: crate::entity::EntityId(parsed.id), guid: parsed.guid };
                self.inner.lock().await.fingerprint = Some(fingerprint);
                let _ = self.tx.send(Some(identity.clone()));
                return Ok(identity);
            }

            if let Some(secs) = parsed.retry_after {
                if sleep_or_cancel(ctx, Duration::from_secs(secs)).await {
                    return Err(AgentError::Bootstrap("cancelled".to_string()));
                }
                backoff = Duration::from_secs(1);
                continue;
            }

            let cap = parsed.max_back_off.map(Duration::from_secs).unwrap_or(self.backoff_cap);
            if sleep_or_cancel(ctx, backoff).await {
                return Err(AgentError::Bootstrap("cancelled".to_string()));
            }
            backoff = next_backoff(backoff, cap);
        }
    }

    /// Periodic fingerprint-change check.
    pub async fn connect_update(&self, ctx: &CancellationToken, current: Identity) -> AgentResult<Identity> {
        let fingerprint = self.harvester.fingerprint().await.map_err(AgentError::Bootstrap)?;

        {
            let inner = self.inner.lock().await;
            if inner.fingerprint.as_ref() == Some(&fingerprint) {
                return Ok(current);
            }
        }

        let mut backoff = Duration::from_secs(1);
        loop {
            let body = serde_json::to_vec(&serde_json::json!({ "fingerprint": fingerprint }))?;
            let request = HttpRequest::new(Method::Post, &self.connect_update_url)
                .header("Content-Type", "application/json")
                .body(body);

            match self.http.send(request).await {
                Ok(resp) if resp.is_success() => {
                    let parsed: ConnectResponse = resp.json()?;
                    self.inner.lock().await.fingerprint = Some(fingerprint);
                    let identity = if parsed.id != 0 {
                        Identity { id: crate::entity::EntityId(parsed.id), guid: parsed.guid }
                    } else {
                        current
                    };
                    if self.rx.borrow().as_ref() != Some(&identity) {
                        let _ = self.tx.send(Some(identity.clone()));
                    }
                    return Ok(identity);
                }
                Ok(resp) if resp.is_rate_limited() => {
                    let d = resp.retry_after.unwrap_or(self.backoff_cap);
                    if sleep_or_cancel(ctx, d).await {
                        return Ok(current);
                    }
                }
                Ok(_) | Err(_) => {
                    if sleep_or_cancel(ctx, backoff).await {
                        return Ok(current);
                    }
                    backoff = next_backoff(backoff, self.backoff_cap);
                }
            }
        }
    }

    /// Fire-once shutdown notification. Failure is
    /// logged, not retried — the process is already on its way down.
    pub async fn disconnect(&self, id: crate::entity::EntityId, reason: &str) {
        let body = serde_json::to_vec(&serde_json::json!({ "reason": reason, "id": id.0 })).unwrap_or_default();
        let request = HttpRequest::new(Method::Post, &self.disconnect_url)
            .header("Content-Type", "application/json")
            .body(body);
        if let Err(e) = self.http.send(request).await {
            tracing::warn!(error = %e, "disconnect notification failed");
        }
    }
}

async fn sleep_or_cancel(ctx: &CancellationToken, d: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(d) => false,
        _ = ctx.cancelled() => true,
    }
}

fn next_backoff(current: Duration, cap: Duration) -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..250);
    std::cmp::min((current * 2) + Duration::from_millis(jitter_ms), cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::system_clock;
    use crate::http::fake::FakeHttpClient;

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

    #[tokio::test]
    async fn connect_succeeds_on_first_non_empty_id() {
        let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(
            serde_json::json!({"id": 7, "guid": "g-1"}),
        ))]));
        let svc = IdentityService::new(http, Arc::new(StaticHarvester), system_clock(), "http://identity", "v1");
        let ctx = CancellationToken::new();
        let identity = svc.connect(&ctx).await.unwrap();
        assert_eq!(identity.id.0, 7);
        assert_eq!(identity.guid, "g-1");
    }

    #[tokio::test]
    async fn connect_honors_retry_after_then_succeeds() {
        let http = Arc::new(FakeHttpClient::new(vec![
            Ok(FakeHttpClient::ok(serde_json::json!({"id": 0, "retryAfter": 0}))),
            Ok(FakeHttpClient::ok(serde_json::json!({"id": 9, "guid": "g-9"}))),
        ]));
        let svc = IdentityService::new(http, Arc::new(StaticHarvester), system_clock(), "http://identity", "v1");
        let ctx = CancellationToken::new();
        let identity = svc.connect(&ctx).await.unwrap();
        assert_eq!(identity.id.0, 9);
    }

    #[tokio::test]
    async fn agent_id_unblocks_after_connect_publishes() {
        let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(
            serde_json::json!({"id": 3, "guid": "g-3"}),
        ))]));
        let svc = Arc::new(IdentityService::new(http, Arc::new(StaticHarvester), system_clock(), "http://identity", "v1"));
        let ctx = CancellationToken::new();
        svc.connect(&ctx).await.unwrap();
        let identity = svc.agent_id(&ctx).await.unwrap();
        assert_eq!(identity.id.0, 3);
    }

    #[tokio::test]
    async fn connect_update_is_noop_when_fingerprint_unchanged() {
        let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(
            serde_json::json!({"id": 1, "guid": "g"}),
        ))]));
        let svc = IdentityService::new(http.clone(), Arc::new(StaticHarvester), system_clock(), "http://identity", "v1");
        let ctx = CancellationToken::new();
        let identity = svc.connect(&ctx).await.unwrap();

        let before = http.requests.lock().unwrap().len();
        let updated = svc.connect_update(&ctx, identity.clone()).await.unwrap();
        assert_eq!(updated, identity);
        assert_eq!(http.requests.lock().unwrap().len(), before, "unchanged fingerprint makes no request");
    }
}
