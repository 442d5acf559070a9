use infra_agent::clock::system_clock;
use infra_agent::entity::{EntityId, EntityKey};
use infra_agent::http::fake::FakeHttpClient;
use infra_agent::model::InventoryItem;
use infra_agent::reaper::PatchReaper;
use infra_agent::register::{KnownIds, RegisterClient};
use infra_agent::sender::{PatchSender, ProcessOutcome, SenderConfig, SenderMode};
use infra_agent::store::{DeltaStore, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

/// In Vortex mode, an entity with no cached ID is resolved through
/// `RegisterClient` before the deltas POST goes out, and the resolved ID
/// is cached for next time.
#[tokio::test]
async fn vortex_mode_resolves_entity_id_through_register_then_caches_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DeltaStore::open(dir.path(), StoreConfig::default(), system_clock()).unwrap());
    let entity = EntityKey::from("remote-host");
    store
        .save_plugin_source(&entity, "system", "processes", vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }])
        .unwrap();
    PatchReaper::new(store.clone()).reap(&entity).unwrap();

    let register_response = FakeHttpClient::ok(serde_json::json!([{"key": "remote-host", "id": 99}]));
    let deltas_response = FakeHttpClient::ok(serde_json::json!({"reset": "none"}));
    let http = Arc::new(FakeHttpClient::new(vec![Ok(register_response), Ok(deltas_response)]));

    let register = Arc::new(RegisterClient::new(http.clone(), system_clock(), "http://collector/register"));
    let known_ids = Arc::new(KnownIds::new(100));
    let sender = PatchSender::new(
        store.clone(),
        http.clone(),
        system_clock(),
        SenderConfig {
            collector_url: "http://collector".to_string(),
            inventory_ingest_endpoint: "inventory".to_string(),
            reset_if_offline: Duration::from_secs(24 * 3600),
            compact_enabled: false,
            compact_threshold: u64::MAX,
            mode: SenderMode::Vortex,
            rate_limited_backoff: Duration::from_secs(60),
        },
        Some(register),
        Some(known_ids.clone()),
    );

    let outcome = sender.process(&entity, EntityId(1), false).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Sent { blocks: 1 }));

    let requests = http.requests.lock().unwrap();
    assert_eq!(requests.len(), 2, "expected one register call followed by one deltas POST");
    let deltas_body: serde_json::Value = serde_json::from_slice(&requests[1].body).unwrap();
    assert_eq!(deltas_body[0]["entityID"], 99);

    assert_eq!(known_ids.get(&entity), Some(EntityId(99)));
}

/// While the register client is mid-backoff, the Vortex sender should
/// silently drop this reap's submission instead of erroring.
#[tokio::test]
async fn vortex_mode_drops_submission_while_register_is_rate_limited() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DeltaStore::open(dir.path(), StoreConfig::default(), system_clock()).unwrap());
    let entity = EntityKey::from("remote-host-2");
    store
        .save_plugin_source(&entity, "system", "processes", vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }])
        .unwrap();
    PatchReaper::new(store.clone()).reap(&entity).unwrap();

    let rate_limited = infra_agent::http::HttpResponse {
        status: 429,
        retry_after: Some(Duration::from_secs(30)),
        body: b"{}".to_vec(),
    };
    let http = Arc::new(FakeHttpClient::new(vec![Ok(rate_limited)]));
    let register = Arc::new(RegisterClient::new(http.clone(), system_clock(), "http://collector/register"));
    // Put the register client into RetryAfter state before the sender ever touches it.
    assert!(register.register_batch(vec![entity.clone()]).await.is_err());

    let sender = PatchSender::new(
        store.clone(),
        http.clone(),
        system_clock(),
        SenderConfig {
            collector_url: "http://collector".to_string(),
            inventory_ingest_endpoint: "inventory".to_string(),
            reset_if_offline: Duration::from_secs(24 * 3600),
            compact_enabled: false,
            compact_threshold: u64::MAX,
            mode: SenderMode::Vortex,
            rate_limited_backoff: Duration::from_secs(60),
        },
        Some(register),
        None,
    );

    let outcome = sender.process(&entity, EntityId(1), false).await.unwrap();
    assert!(matches!(outcome, ProcessOutcome::Sent { blocks: 0 }), "the block should be dropped, not sent or errored");
    assert!(!store.read_deltas(&entity).is_empty(), "a dropped submission leaves the delta pending for the next reap");
}
