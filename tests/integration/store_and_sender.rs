use infra_agent::clock::system_clock;
use infra_agent::entity::{EntityId, EntityKey};
use infra_agent::http::fake::FakeHttpClient;
use infra_agent::model::InventoryItem;
use infra_agent::reaper::PatchReaper;
use infra_agent::sender::{PatchSender, ProcessOutcome, SenderConfig, SenderMode};
use infra_agent::store::{DeltaStore, StoreConfig};
use std::sync::Arc;
use std::time::Duration;

fn sender_config() -> SenderConfig {
    SenderConfig {
        collector_url: "http://collector".to_string(),
        inventory_ingest_endpoint: "inventory".to_string(),
        reset_if_offline: Duration::from_secs(24 * 3600),
        compact_enabled: false,
        compact_threshold: u64::MAX,
        mode: SenderMode::Standard,
        rate_limited_backoff: Duration::from_secs(60),
    }
}

/// A plugin saving inventory, a reap emitting a delta, and a patch-sender
/// POST draining it end to end, with nothing mocked below the HTTP layer.
#[tokio::test]
async fn saved_inventory_flows_through_reap_and_one_post_drains_it() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DeltaStore::open(dir.path(), StoreConfig::default(), system_clock()).unwrap());
    let entity = EntityKey::from("host-1");

    store
        .save_plugin_source(
            &entity,
            "system",
            "processes",
            vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }],
        )
        .unwrap();

    let reaper = PatchReaper::new(store.clone());
    assert_eq!(reaper.reap(&entity).unwrap(), 1);
    assert!(!store.read_deltas(&entity).is_empty());

    let ok_response = FakeHttpClient::ok(serde_json::json!({
        "reset": "none",
        "state_map": {"system/processes": {"last_stored_id": 1}},
    }));
    let http = Arc::new(FakeHttpClient::new(vec![Ok(ok_response)]));
    let sender = PatchSender::new(store.clone(), http.clone(), system_clock(), sender_config(), None, None);

    let outcome = sender.process(&entity, EntityId(42), true).await.unwrap();
    match outcome {
        ProcessOutcome::Sent { blocks } => assert_eq!(blocks, 1),
        _ => panic!("expected Sent, got a different outcome"),
    }
    assert!(store.read_deltas(&entity).is_empty(), "the acknowledged delta should have been dropped");
    assert_eq!(http.requests.lock().unwrap().len(), 1);

    // Nothing changed since the last reap, so a second one is a no-op.
    assert_eq!(reaper.reap(&entity).unwrap(), 0);
}

/// A plugin whose reported inventory shrinks between two reaps should
/// produce a delta that nulls out the removed key, and the sender should
/// carry that null through to the wire payload untouched.
#[tokio::test]
async fn shrinking_inventory_round_trips_a_null_delta_to_the_wire() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DeltaStore::open(dir.path(), StoreConfig::default(), system_clock()).unwrap());
    let entity = EntityKey::from("host-2");
    let reaper = PatchReaper::new(store.clone());

    store
        .save_plugin_source(
            &entity,
            "system",
            "processes",
            vec![
                InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) },
                InventoryItem { sort_key: "p2".into(), value: serde_json::json!({"pid": 2}) },
            ],
        )
        .unwrap();
    reaper.reap(&entity).unwrap();

    store
        .save_plugin_source(&entity, "system", "processes", vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }])
        .unwrap();
    reaper.reap(&entity).unwrap();

    let ok_response = FakeHttpClient::ok(serde_json::json!({"reset": "none"}));
    let http = Arc::new(FakeHttpClient::new(vec![Ok(ok_response)]));
    let sender = PatchSender::new(store.clone(), http.clone(), system_clock(), sender_config(), None, None);
    sender.process(&entity, EntityId(1), false).await.unwrap();

    let body: serde_json::Value = serde_json::from_slice(&http.requests.lock().unwrap()[0].body).unwrap();
    let deltas = body[0]["deltas"].as_array().unwrap();
    assert_eq!(deltas.len(), 2, "expected one delta per reap round");
    assert_eq!(deltas[1]["diff"], serde_json::json!({"p2": null}));
}

/// A failing POST should leave the pending deltas in place so the next
/// send attempt can retry them.
#[tokio::test]
async fn failed_post_leaves_pending_deltas_for_retry() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(DeltaStore::open(dir.path(), StoreConfig::default(), system_clock()).unwrap());
    let entity = EntityKey::from("host-3");
    store
        .save_plugin_source(&entity, "system", "processes", vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }])
        .unwrap();
    PatchReaper::new(store.clone()).reap(&entity).unwrap();

    let failing = infra_agent::http::HttpResponse { status: 500, retry_after: None, body: Vec::new() };
    let http = Arc::new(FakeHttpClient::new(vec![Ok(failing)]));
    let sender = PatchSender::new(store.clone(), http, system_clock(), sender_config(), None, None);

    assert!(sender.process(&entity, EntityId(1), false).await.is_err());
    assert!(!store.read_deltas(&entity).is_empty(), "a failed POST must not drop pending deltas");
}
