use infra_agent::config::AgentConfig;
use infra_agent::plugin::Harvester;
use std::collections::BTreeMap;

/// A minimal config pointed at a fresh temp dir, with the startup
/// reachability probe disabled so tests don't need to script a HEAD
/// response for every runtime they build.
pub fn test_agent_config(dir: &std::path::Path) -> AgentConfig {
    let mut config = AgentConfig::default();
    config.app_data_dir = dir.to_string_lossy().into_owned();
    config.display_name = Some("test-host".to_string());
    config.connect_enabled = false;
    config
}

/// Fixed fingerprint/metadata, for identity tests that don't care what the
/// harvested host looks like.
pub struct StaticHarvester;

#[async_trait::async_trait]
impl Harvester for StaticHarvester {
    async fn fingerprint(&self) -> Result<serde_json::Value, String> {
        Ok(serde_json::json!({"host": "fixed"}))
    }

    async fn metadata(&self) -> Result<BTreeMap<String, serde_json::Value>, String> {
        Ok(BTreeMap::new())
    }
}
