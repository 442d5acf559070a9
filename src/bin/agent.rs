//! Minimal CLI entry point: locate a config file, wire the runtime's
//! collaborators, and drive it until a shutdown signal arrives.

use clap::Parser;
use infra_agent::clock::system_clock;
use infra_agent::config::AgentConfig;
use infra_agent::feature_flags::FeatureFlagManager;
use infra_agent::http::{HttpClient, ReqwestHttpClient};
use infra_agent::identity::IdentityService;
use infra_agent::plugin::SystemHarvester;
use infra_agent::runtime::{active_entities_channel, plugin_channel, AgentRuntime, RuntimeDeps};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "infra-agent", about = "Host-resident telemetry agent")]
struct Args {
    /// Path to a TOML config file. Falls back to built-in defaults plus
    /// environment overrides when omitted.
    #[arg(long)]
    config: Option<std::path::PathBuf>,

    /// Override `isForwardOnly` regardless of what the config says.
    #[arg(long)]
    forward_only: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let args = Args::parse();
    let mut config = AgentConfig::load(args.config.as_deref())?;
    if args.forward_only {
        config.is_forward_only = true;
    }

    let http: Arc<dyn HttpClient> = Arc::new(ReqwestHttpClient::new(
        config.startup_connection_timeout,
        config.payload_compression_level,
    )?);
    let harvester = Arc::new(SystemHarvester::new(config.license.as_bytes().to_vec()));
    let identity = Arc::new(IdentityService::new(
        http.clone(),
        harvester,
        system_clock(),
        &config.identity_url,
        &config.identity_ingest_endpoint,
    ));
    let feature_flags = Arc::new(FeatureFlagManager::new(&config, None, None));

    // No built-in harvester plugins are wired up yet; the sender halves are
    // kept so a future plugin can be constructed against them before this
    // binary passes the receivers on.
    let (_plugin_tx, plugin_rx) = plugin_channel(config.event_queue_depth.max(100));
    let (_active_tx, active_rx) = active_entities_channel(64);

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
    })?;

    let ctx = CancellationToken::new();
    let shutdown_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_ctx.cancel();
    });

    runtime.run(ctx).await?;
    Ok(())
}
