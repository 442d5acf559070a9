use infra_agent::clock::system_clock;
use infra_agent::command_channel::{CommandChannel, CommandChannelConfig, SetFeatureFlagHandler};
use infra_agent::config::AgentConfig;
use infra_agent::feature_flags::FeatureFlagManager;
use infra_agent::http::fake::FakeHttpClient;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn channel(http: Arc<FakeHttpClient>) -> CommandChannel {
    CommandChannel::new(
        http,
        system_clock(),
        CommandChannelConfig {
            commands_url: "http://collector/agent_commands/v1/commands".to_string(),
            poll_interval: Duration::from_secs(60),
        },
    )
}

/// A `set_feature_flag` command fetched on the initial bootstrap poll
/// should reach the feature-flag manager and flip the flag, without
/// requiring a restart (the flag used here isn't one of the
/// restart-on-change knobs).
#[tokio::test]
async fn initial_fetch_dispatches_set_feature_flag_into_the_manager() {
    let commands_response = FakeHttpClient::ok(serde_json::json!({
        "return_value": [{
            "id": "cmd-1",
            "hash": "h1",
            "name": "set_feature_flag",
            "arguments": {"category": "", "flag": "protocol_v4_enabled", "enabled": true},
        }],
    }));
    let ack_response = FakeHttpClient::ok(serde_json::json!({}));
    let http = Arc::new(FakeHttpClient::new(vec![Ok(commands_response), Ok(ack_response)]));

    let manager = Arc::new(FeatureFlagManager::new(&AgentConfig::default(), None, None));
    let mut channel = channel(http.clone());
    channel.register_handler("set_feature_flag", Arc::new(SetFeatureFlagHandler { manager: manager.clone() }));

    let ctx = CancellationToken::new();
    channel.initial_fetch(&ctx).await.unwrap();

    assert_eq!(manager.get_feature_flag("protocol_v4_enabled"), (true, true));
    let requests = http.requests.lock().unwrap();
    assert_eq!(requests.len(), 2, "expected the command fetch plus an ack for the non-empty hash");
}

/// Flipping a flag the manager already owns from config fails with
/// `AlreadyExists`; the command handler should propagate that as an error
/// rather than acking the command.
#[tokio::test]
async fn config_owned_flag_is_not_acked_when_command_tries_to_override_it() {
    let mut config = AgentConfig::default();
    config.features.insert("full_process_sampling".to_string(), true);

    let commands_response = FakeHttpClient::ok(serde_json::json!({
        "return_value": [{
            "id": "cmd-2",
            "hash": "h2",
            "name": "set_feature_flag",
            "arguments": {"category": "", "flag": "full_process_sampling", "enabled": false},
        }],
    }));
    let http = Arc::new(FakeHttpClient::new(vec![Ok(commands_response)]));

    let manager = Arc::new(FeatureFlagManager::new(&config, None, None));
    let mut channel = channel(http.clone());
    channel.register_handler("set_feature_flag", Arc::new(SetFeatureFlagHandler { manager: manager.clone() }));

    let ctx = CancellationToken::new();
    channel.initial_fetch(&ctx).await.unwrap();

    assert_eq!(manager.get_feature_flag("full_process_sampling"), (true, true), "config-owned value must survive the attempted override");
    assert_eq!(http.requests.lock().unwrap().len(), 1, "a failed handler must not be acked");
}

/// A `backoff_command_channel` command observed mid-run changes the poll
/// delay the background loop will use on its next tick.
#[tokio::test]
async fn backoff_command_updates_poll_delay_without_touching_handlers() {
    let http = Arc::new(FakeHttpClient::new(vec![Ok(FakeHttpClient::ok(serde_json::json!({
        "return_value": [{"id": "c", "hash": "", "name": "backoff_command_channel", "arguments": {"delay": 7200}}],
    })))]));
    let channel = channel(http.clone());
    let ctx = CancellationToken::new();
    channel.initial_fetch(&ctx).await.unwrap();
    assert_eq!(http.requests.lock().unwrap().len(), 1, "empty hash must never be acked");
}
