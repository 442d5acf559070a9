//! Register Client + State Machine: batched registration of
//! remote entity keys to IDs.

use crate::clock::SharedClock;
use crate::entity::{EntityId, EntityKey};
use crate::error::{AgentError, AgentResult};
use crate::http::{HttpClient, HttpRequest, Method};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Register state machine states.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RegisterState {
    Healthy,
    RetryAfter,
    RetryBackoff,
}

struct Machine {
    state: RegisterState,
    retry_deadline: Option<Instant>,
}

/// A bounded LRU of `key -> id`, shared by the patch sender (Vortex mode)
/// and the event sender's accumulator.
pub struct KnownIds {
    capacity: usize,
    // order.back() is most-recently-used.
    order: Mutex<(HashMap<EntityKey, EntityId>, Vec<EntityKey>)>,
}

impl KnownIds {
    pub fn new(capacity: usize) -> Self {
        Self { capacity, order: Mutex::new((HashMap::new(), Vec::new())) }
    }

    pub fn get(&self, key: &EntityKey) -> Option<EntityId> {
        let mut guard = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let (map, order) = &mut *guard;
        let id = map.get(key).copied();
        if id.is_some() {
            order.retain(|k| k != key);
            order.push(key.clone());
        }
        id
    }

    pub fn insert(&self, key: EntityKey, id: EntityId) {
        let mut guard = self.order.lock().unwrap_or_else(|e| e.into_inner());
        let (map, order) = &mut *guard;
        if !map.contains_key(&key) {
            order.push(key.clone());
        } else {
            order.retain(|k| k != &key);
            order.push(key.clone());
        }
        map.insert(key, id);
        while order.len() > self.capacity {
            let evicted = order.remove(0);
            map.remove(&evicted);
        }
    }

    pub fn len(&self) -> usize {
        self.order.lock().unwrap_or_else(|e| e.into_inner()).0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Batched registration client, gating calls behind the state machine
/// below.
pub struct RegisterClient {
    http: Arc<dyn HttpClient>,
    clock: SharedClock,
    register_url: String,
    machine: Mutex<Machine>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl RegisterClient {
    pub fn new(http: Arc<dyn HttpClient>, clock: SharedClock, register_url: impl Into<String>) -> Self {
        Self {
            http,
            clock,
            register_url: register_url.into(),
            machine: Mutex::new(Machine { state: RegisterState::Healthy, retry_deadline: None }),
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(60),
        }
    }

    /// `State()` lazily promotes to `Healthy` once any pending retry
    /// deadline has passed.
    pub fn state(&self) -> RegisterState {
        let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        if machine.state != RegisterState::Healthy {
            if let Some(deadline) = machine.retry_deadline {
                if self.clock.now_instant() >= deadline {
                    machine.state = RegisterState::Healthy;
                    machine.retry_deadline = None;
                }
            }
        }
        machine.state
    }

    /// Register a batch of keys. Callers must consult `state()` first;
    /// calling while non-healthy is a programming error and
    /// this will short-circuit with a `RateLimited` error rather than make
    /// a request.
    pub async fn register_batch(&self, keys: Vec<EntityKey>) -> AgentResult<HashMap<EntityKey, EntityId>> {
        if self.state() != RegisterState::Healthy {
            return Err(AgentError::RateLimited { retry_after: None });
        }
        if keys.is_empty() {
            return Ok(HashMap::new());
        }

        let body = serde_json::to_vec(&keys.iter().map(|k| &k.0).collect::<Vec<_>>())?;
        let request = HttpRequest::new(Method::Post, &self.register_url)
            .header("Content-Type", "application/json")
            .body(body);

        match self.http.send(request).await {
            Ok(resp) if resp.is_success() => {
                self.transition_healthy();
                let raw: Vec<RegisteredEntry> = resp.json()?;
                Ok(raw
                    .into_iter()
                    .map(|e| (EntityKey(e.key), EntityId(e.id)))
                    .collect())
            }
            Ok(resp) if resp.is_rate_limited() => {
                let retry_after = resp.retry_after.unwrap_or(self.backoff_cap);
                self.transition_retry_after(retry_after);
                Err(AgentError::RateLimited { retry_after: Some(retry_after) })
            }
            Ok(resp) => {
                self.transition_backoff();
                Err(AgentError::Transient(format!("register failed: HTTP {}", resp.status)))
            }
            Err(e) => {
                self.transition_backoff();
                Err(e)
            }
        }
    }

    fn transition_healthy(&self) {
        let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        machine.state = RegisterState::Healthy;
        machine.retry_deadline = None;
    }

    fn transition_retry_after(&self, d: Duration) {
        let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        machine.state = RegisterState::RetryAfter;
        machine.retry_deadline = Some(self.clock.now_instant() + d);
    }

    fn transition_backoff(&self) {
        let mut machine = self.machine.lock().unwrap_or_else(|e| e.into_inner());
        machine.state = RegisterState::RetryBackoff;
        machine.retry_deadline = Some(self.clock.now_instant() + self.backoff_base.min(self.backoff_cap));
    }
}

#[derive(Debug, serde::Deserialize)]
struct RegisteredEntry {
    key: String,
    id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::fake::FakeClock;
    use crate::http::fake::FakeHttpClient;

    #[test]
    fn known_ids_evicts_least_recently_used() {
        let cache = KnownIds::new(2);
        cache.insert(EntityKey::from("a"), EntityId(1));
        cache.insert(EntityKey::from("b"), EntityId(2));
        cache.get(&EntityKey::from("a"));
        cache.insert(EntityKey::from("c"), EntityId(3));
        assert!(cache.get(&EntityKey::from("a")).is_some());
        assert!(cache.get(&EntityKey::from("b")).is_none());
        assert!(cache.get(&EntityKey::from("c")).is_some());
    }

    #[tokio::test]
    async fn state_is_healthy_iff_no_retry_deadline_pending() {
        let clock = FakeClock::new(chrono::Utc::now());
        let http = Arc::new(FakeHttpClient::new(vec![Ok(crate::http::fake::FakeHttpClient::ok(
            serde_json::json!([]),
        ))]));
        let client = RegisterClient::new(http, clock.clone(), "http://collector/register");
        assert_eq!(client.state(), RegisterState::Healthy);
    }

    #[tokio::test]
    async fn rate_limit_response_sets_retry_after_state_until_deadline() {
        let clock = FakeClock::new(chrono::Utc::now());
        let rate_limited = crate::http::HttpResponse {
            status: 429,
            retry_after: Some(Duration::from_secs(30)),
            body: b"{}".to_vec(),
        };
        let http = Arc::new(FakeHttpClient::new(vec![Ok(rate_limited)]));
        let client = RegisterClient::new(http, clock.clone(), "http://collector/register");

        let result = client.register_batch(vec![EntityKey::from("k")]).await;
        assert!(result.is_err());
        assert_eq!(client.state(), RegisterState::RetryAfter);

        clock.advance(Duration::from_secs(31));
        assert_eq!(client.state(), RegisterState::Healthy);
    }

    #[tokio::test]
    async fn successful_register_resolves_keys_to_ids() {
        let clock = FakeClock::new(chrono::Utc::now());
        let resp = FakeHttpClient::ok(serde_json::json!([{"key": "remoteKey", "id": 42}]));
        let http = Arc::new(FakeHttpClient::new(vec![Ok(resp)]));
        let client = RegisterClient::new(http, clock, "http://collector/register");

        let resolved = client.register_batch(vec![EntityKey::from("remoteKey")]).await.unwrap();
        assert_eq!(resolved.get(&EntityKey::from("remoteKey")), Some(&EntityId(42)));
    }
}
