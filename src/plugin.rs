//! `Plugin` and `Harvester` capability interfaces. The core only calls
//! through these; concrete plugins (OS samplers, process listers,
//! cloud-metadata probes) are external collaborators.

use crate::model::{ConnectResponse, PluginOutput};
use async_trait::async_trait;
use std::collections::BTreeMap;

/// One source of inventory or events. Plugins submit through the channels
/// the runtime owns; this trait is their lifecycle surface.
#[async_trait]
pub trait Plugin: Send + Sync {
    fn id(&self) -> crate::entity::PluginId;

    /// Start producing output. Implementations run until the process
    /// context is cancelled.
    async fn run(&self, ctx: tokio_util::sync::CancellationToken);

    fn log_info(&self) -> String {
        self.id().rendered()
    }

    fn is_external(&self) -> bool {
        false
    }

    fn external_plugin_name(&self) -> Option<&str> {
        None
    }

    fn schedule_health_check(&self) -> bool {
        false
    }
}

/// Optional capability probed at shutdown.
pub trait Killable {
    fn kill(&self);
}

/// Host-identifying probe used by the identity service. Fingerprinting and
/// cloud-metadata harvesting are opaque; only this interface is fixed.
#[async_trait]
pub trait Harvester: Send + Sync {
    async fn fingerprint(&self) -> Result<serde_json::Value, String>;
    async fn metadata(&self) -> Result<BTreeMap<String, serde_json::Value>, String>;
}

/// A non-production `Harvester`: fingerprints the host from its hostname
/// and OS family, HMAC-hashed the same way outbound webhook payloads are
/// signed elsewhere in this codebase.
pub struct SystemHarvester {
    salt: Vec<u8>,
}

impl SystemHarvester {
    pub fn new(salt: impl Into<Vec<u8>>) -> Self {
        Self { salt: salt.into() }
    }
}

#[async_trait]
impl Harvester for SystemHarvester {
    async fn fingerprint(&self) -> Result<serde_json::Value, String> {
        use hmac::{Hmac, Mac};
        use sha2::Sha256;

        let host = hostname::get()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown-host".to_string());

        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.salt)
            .map_err(|e| format!("fingerprint hmac key: {e}"))?;
        mac.update(host.as_bytes());
        let digest = hex::encode(mac.finalize().into_bytes());

        Ok(serde_json::json!({
            "host": host,
            "os": std::env::consts::OS,
            "arch": std::env::consts::ARCH,
            "digest": digest,
        }))
    }

    async fn metadata(&self) -> Result<BTreeMap<String, serde_json::Value>, String> {
        // Cloud-metadata probing is explicitly out of scope; a
        // default harvester simply reports nothing extra.
        Ok(BTreeMap::new())
    }
}

/// Sink `run_integration`/`stop_integration` hand off to. The
/// concrete queue/process-manager is external; the command channel only
/// needs to enqueue a definition or tear one down.
#[async_trait]
pub trait IntegrationManager: Send + Sync {
    async fn run_integration(&self, name: &str, args: Vec<String>, metadata: BTreeMap<String, String>);

    /// Returns `true` if a tracked process for `hash` existed and a stop
    /// attempt was made.
    async fn stop_integration(&self, hash: &str) -> StopOutcome;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    Sigterm,
    Sigkill,
    Error,
    ProcessNotFound,
}

impl StopOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopOutcome::Sigterm => "sigterm",
            StopOutcome::Sigkill => "sigkill",
            StopOutcome::Error => "error",
            StopOutcome::ProcessNotFound => "process-not-found",
        }
    }
}

/// Helper used by the identity service to turn a raw `connect` response
/// plus a freshly-harvested fingerprint into the pieces it needs; kept
/// here since both live at the plugin/harvester boundary.
pub fn connect_response_identity(resp: &ConnectResponse) -> Option<crate::model::Identity> {
    if resp.id == 0 {
        None
    } else {
        Some(crate::model::Identity { id: crate::entity::EntityId(resp.id), guid: resp.guid.clone() })
    }
}
