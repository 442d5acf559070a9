use crate::common::{test_agent_config, StaticHarvester};
use infra_agent::clock::system_clock;
use infra_agent::entity::{EntityKey, PluginId};
use infra_agent::feature_flags::FeatureFlagManager;
use infra_agent::http::fake::FakeHttpClient;
use infra_agent::identity::IdentityService;
use infra_agent::model::{InventoryItem, PluginOutput};
use infra_agent::runtime::{active_entities_channel, plugin_channel, AgentRuntime, RuntimeDeps};
use infra_agent::store::StorePaths;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn build_runtime(dir: &std::path::Path) -> (Arc<AgentRuntime>, tokio::sync::mpsc::Sender<PluginOutput>) {
    let mut config = test_agent_config(dir);
    config.first_reap_interval = Duration::from_millis(20);
    config.reap_interval = Duration::from_millis(20);
    config.send_interval = Duration::from_secs(3600);
    config.remove_entities_period = Duration::from_secs(3600);

    let http = Arc::new(FakeHttpClient::new(vec![]));
    let identity = Arc::new(IdentityService::new(http.clone(), Arc::new(StaticHarvester), system_clock(), "http://identity", "v1"));
    let feature_flags = Arc::new(FeatureFlagManager::new(&config, None, None));
    let (plugin_tx, plugin_rx) = plugin_channel(8);
    let (_active_tx, active_rx) = active_entities_channel(8);

    let runtime = AgentRuntime::new(RuntimeDeps {
        config,
        http,
        identity,
        clock: system_clock(),
        plugins: Vec::new(),
        plugin_rx,
        active_rx,
        feature_flags,
        command_handlers: Vec::new(),
    })
    .unwrap();

    (runtime, plugin_tx)
}

/// Data submitted on the plugin channel after `run()` starts should reach
/// the on-disk store within one inventory cycle, and a cancelled context
/// should bring `run()` back down cleanly.
#[tokio::test]
async fn plugin_output_reaches_the_delta_store_during_one_inventory_cycle() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, plugin_tx) = build_runtime(dir.path());

    let ctx = CancellationToken::new();
    let run_ctx = ctx.clone();
    let run_handle = tokio::spawn(async move { runtime.run(run_ctx).await });

    plugin_tx
        .send(PluginOutput::new(
            PluginId::new("system", "processes"),
            EntityKey::from("test-host"),
            vec![InventoryItem { sort_key: "p1".into(), value: serde_json::json!({"pid": 1}) }],
        ))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.cancel();
    run_handle.await.unwrap().unwrap();

    let paths = StorePaths::new(dir.path());
    let snapshot_path = paths.current_snapshot("system", "test-host", "processes");
    assert!(snapshot_path.exists(), "expected a current-snapshot file for the reported plugin");

    let last_sent_path = paths.last_sent_snapshot("system", "test-host", "processes");
    assert!(last_sent_path.exists(), "one reap cycle should have advanced the last-sent baseline too");
}

/// A `not_applicable` plugin output must never be written to the store.
#[tokio::test]
async fn not_applicable_plugin_output_is_never_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let (runtime, plugin_tx) = build_runtime(dir.path());

    let ctx = CancellationToken::new();
    let run_ctx = ctx.clone();
    let run_handle = tokio::spawn(async move { runtime.run(run_ctx).await });

    plugin_tx
        .send(PluginOutput::not_applicable(PluginId::new("system", "gpu"), EntityKey::from("test-host")))
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(150)).await;
    ctx.cancel();
    run_handle.await.unwrap().unwrap();

    let paths = StorePaths::new(dir.path());
    assert!(!paths.current_snapshot("system", "test-host", "gpu").exists());
}
