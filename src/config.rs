//! `AgentConfig` and its figment-based loader.

use crate::error::{AgentError, AgentResult};
use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

fn default_collector_url() -> String {
    "https://infra-api.example.invalid".to_string()
}
fn default_identity_url() -> String {
    "https://identity-api.example.invalid".to_string()
}
fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub collector_url: String,
    pub identity_url: String,
    pub metrics_ingest_endpoint: String,
    pub inventory_ingest_endpoint: String,
    pub identity_ingest_endpoint: String,
    pub license: String,

    /// `0` = off.
    pub payload_compression_level: u32,

    /// `< 0` = infinite retries. Represented as `i64` to preserve
    /// that sentinel.
    pub startup_connection_retries: i64,
    #[serde(with = "duration_secs")]
    pub startup_connection_timeout: Duration,

    #[serde(with = "duration_secs")]
    pub first_reap_interval: Duration,
    #[serde(with = "duration_secs")]
    pub reap_interval: Duration,
    #[serde(with = "duration_secs")]
    pub send_interval: Duration,
    #[serde(with = "duration_secs")]
    pub remove_entities_period: Duration,
    #[serde(with = "duration_secs")]
    pub offline_time_to_reset: Duration,

    pub max_inventory_size: usize,
    pub disable_inventory_split: bool,
    pub compact_enabled: bool,
    pub compact_threshold: u64,

    pub event_queue_depth: usize,
    pub batch_queue_depth: usize,
    pub max_metrics_batch_size_bytes: usize,

    pub register_enabled: bool,
    pub register_concurrency: usize,
    pub register_batch_size: usize,
    #[serde(with = "duration_secs")]
    pub register_frequency_secs: Duration,

    pub ignored_inventory_paths_map: HashSet<String>,
    pub trunc_text_values: bool,
    pub include_metrics_matchers: Vec<String>,
    pub exclude_metrics_matchers: Vec<String>,
    pub enable_process_metrics: bool,
    pub is_forward_only: bool,
    pub connect_enabled: bool,
    pub k8s_integration: bool,

    /// Config-provenance feature flags; config provenance is sticky.
    pub features: BTreeMap<String, bool>,

    pub override_hostname: Option<String>,
    pub override_hostname_short: Option<String>,
    pub display_name: Option<String>,
    pub dns_hostname_resolution: bool,
    pub cloud_provider: Option<String>,
    pub disable_cloud_metadata: bool,
    pub cloud_max_retry_count: u32,
    pub cloud_retry_back_off_sec: u64,
    pub cloud_metadata_expiry_in_sec: u64,

    pub cpu_profile: Option<String>,
    pub mem_profile: Option<String>,
    pub mem_profile_interval: Option<u64>,
    pub debug_log_sec: Option<u64>,
    pub fingerprint_update_freq_sec: u64,

    pub agent_dir: String,
    pub app_data_dir: String,

    pub command_channel_interval_sec: u64,
    pub async_inventory_handler_enabled: bool,
    pub inventory_queue_len: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            collector_url: default_collector_url(),
            identity_url: default_identity_url(),
            metrics_ingest_endpoint: "metrics".to_string(),
            inventory_ingest_endpoint: "inventory".to_string(),
            identity_ingest_endpoint: "identity/v1".to_string(),
            license: String::new(),
            payload_compression_level: 0,
            startup_connection_retries: -1,
            startup_connection_timeout: secs(10),
            first_reap_interval: secs(5),
            reap_interval: secs(10),
            send_interval: secs(10),
            remove_entities_period: secs(48 * 3600),
            offline_time_to_reset: secs(24 * 3600),
            max_inventory_size: 1_000_000,
            disable_inventory_split: false,
            compact_enabled: false,
            compact_threshold: 10 * 1024 * 1024,
            event_queue_depth: 1000,
            batch_queue_depth: 100,
            max_metrics_batch_size_bytes: 1_000_000,
            register_enabled: false,
            register_concurrency: 4,
            register_batch_size: 100,
            register_frequency_secs: secs(1),
            ignored_inventory_paths_map: HashSet::new(),
            trunc_text_values: false,
            include_metrics_matchers: Vec::new(),
            exclude_metrics_matchers: Vec::new(),
            enable_process_metrics: true,
            is_forward_only: false,
            connect_enabled: true,
            k8s_integration: false,
            features: BTreeMap::new(),
            override_hostname: None,
            override_hostname_short: None,
            display_name: None,
            dns_hostname_resolution: true,
            cloud_provider: None,
            disable_cloud_metadata: false,
            cloud_max_retry_count: 3,
            cloud_retry_back_off_sec: 5,
            cloud_metadata_expiry_in_sec: 300,
            cpu_profile: None,
            mem_profile: None,
            mem_profile_interval: None,
            debug_log_sec: None,
            fingerprint_update_freq_sec: 60,
            agent_dir: "/var/db/infra-agent".to_string(),
            app_data_dir: "/var/db/infra-agent/data".to_string(),
            command_channel_interval_sec: 60,
            async_inventory_handler_enabled: false,
            inventory_queue_len: 100,
        }
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

impl AgentConfig {
    /// Load from an optional TOML file, `INFRA_AGENT_`-prefixed env vars,
    /// and the `DEV_*_INGEST_URL` overrides, then validate.
    pub fn load(config_path: Option<&std::path::Path>) -> AgentResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(AgentConfig::default()));
        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }
        figment = figment.merge(Env::prefixed("INFRA_AGENT_"));

        let mut config: AgentConfig = figment
            .extract()
            .map_err(|e| AgentError::Config(e.to_string()))?;

        apply_dev_overrides(&mut config);
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> AgentResult<()> {
        if self.first_reap_interval.is_zero() || self.reap_interval.is_zero() || self.send_interval.is_zero() {
            return Err(AgentError::Config(
                "firstReapInterval/reapInterval/sendInterval must be non-zero".to_string(),
            ));
        }
        if self.max_inventory_size == 0 && !self.disable_inventory_split {
            return Err(AgentError::Config(
                "maxInventorySize must be non-zero unless disableInventorySplit is set".to_string(),
            ));
        }
        Ok(())
    }
}

/// `DEV_IDENTITY_INGEST_URL`, `DEV_METRICS_INGEST_URL`, `DEV_INVENTORY_INGEST_URL`
/// replace the corresponding constructed URL when non-empty.
/// Figment's env provider can't express this directly since the env names
/// don't match the config's field names, so it's applied as an explicit
/// step after the merge.
fn apply_dev_overrides(config: &mut AgentConfig) {
    if let Ok(v) = std::env::var("DEV_IDENTITY_INGEST_URL") {
        if !v.is_empty() {
            config.identity_ingest_endpoint = v;
        }
    }
    if let Ok(v) = std::env::var("DEV_METRICS_INGEST_URL") {
        if !v.is_empty() {
            config.metrics_ingest_endpoint = v;
        }
    }
    if let Ok(v) = std::env::var("DEV_INVENTORY_INGEST_URL") {
        if !v.is_empty() {
            config.inventory_ingest_endpoint = v;
        }
    }
}
