//! Feature-Flag Manager & Handlers: a config-wins flag store plus
//! the per-flag behaviors the command channel's `set_feature_flag` routes
//! into.

use crate::config::AgentConfig;
use crate::error::{AgentError, AgentResult};
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

/// Distinct exit code FF handlers use to ask the process supervisor to
/// relaunch the agent.
pub const RESTART_EXIT_CODE: i32 = 75;

/// Optional collaborator for `fluent_bit_19_win`.
pub trait FbRestarter: Send + Sync {
    fn restart(&self);
}

/// Optional collaborator for OHI flags.
pub trait OhiEnabler: Send + Sync {
    fn enable_ohi_from_ff(&self, name: &str);
    fn disable_ohi_from_ff(&self, name: &str);
}

/// Config-wins feature-flag store plus the handful of knobs a handler can
/// absorb silently during bootstrap (`register_enabled`, inventory queue
/// parallelization, `async_inventory_handler_enabled`).
pub struct FeatureFlagManager {
    config_flags: HashSet<String>,
    config_baseline: BTreeMap<String, bool>,
    config_async_inventory_handler_enabled: bool,
    flags: Mutex<BTreeMap<String, bool>>,
    register_enabled: AtomicBool,
    inventory_queue_len: AtomicUsize,
    async_inventory_handler_enabled: AtomicBool,
    fb_restarter: Option<Arc<dyn FbRestarter>>,
    ohi_enabler: Option<Arc<dyn OhiEnabler>>,
    ohi_logged: Mutex<HashSet<String>>,
    exit_fn: Arc<dyn Fn(i32) + Send + Sync>,
}

impl FeatureFlagManager {
    pub fn new(config: &AgentConfig, fb_restarter: Option<Arc<dyn FbRestarter>>, ohi_enabler: Option<Arc<dyn OhiEnabler>>) -> Self {
        Self {
            config_flags: config.features.keys().cloned().collect(),
            config_baseline: config.features.clone(),
            config_async_inventory_handler_enabled: config.async_inventory_handler_enabled,
            flags: Mutex::new(config.features.clone()),
            register_enabled: AtomicBool::new(config.register_enabled),
            inventory_queue_len: AtomicUsize::new(config.inventory_queue_len),
            async_inventory_handler_enabled: AtomicBool::new(config.async_inventory_handler_enabled),
            fb_restarter,
            ohi_enabler,
            ohi_logged: Mutex::new(HashSet::new()),
            exit_fn: Arc::new(|code| std::process::exit(code)),
        }
    }

    /// Swap in a test double instead of `std::process::exit`.
    #[cfg(test)]
    pub fn with_exit_fn(mut self, f: Arc<dyn Fn(i32) + Send + Sync>) -> Self {
        self.exit_fn = f;
        self
    }

    pub fn inventory_queue_len(&self) -> usize {
        self.inventory_queue_len.load(Ordering::Relaxed)
    }

    pub fn register_enabled(&self) -> bool {
        self.register_enabled.load(Ordering::Relaxed)
    }

    pub fn async_inventory_handler_enabled(&self) -> bool {
        self.async_inventory_handler_enabled.load(Ordering::Relaxed)
    }

    /// `SetFeatureFlag`: config-owned flags
    /// and no-op value changes both fail with `AlreadyExists`.
    pub fn set_feature_flag(&self, name: &str, enabled: bool) -> AgentResult<()> {
        if self.config_flags.contains(name) {
            return Err(AgentError::AlreadyExists(name.to_string()));
        }
        let mut flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        if flags.get(name).copied() == Some(enabled) {
            return Err(AgentError::AlreadyExists(name.to_string()));
        }
        flags.insert(name.to_string(), enabled);
        Ok(())
    }

    /// `GetFeatureFlag`.
    pub fn get_feature_flag(&self, name: &str) -> (bool, bool) {
        let flags = self.flags.lock().unwrap_or_else(|e| e.into_inner());
        match flags.get(name) {
            Some(v) => (*v, true),
            None => (false, false),
        }
    }

    /// Entry point for the `set_feature_flag` command. `category` is
    /// accepted for parity with the wire command but none of the built-in
    /// handlers branch on it.
    pub fn handle_set_feature_flag(&self, _category: &str, name: &str, enabled: bool, initial_fetch: bool) -> AgentResult<()> {
        match name {
            "register_enabled" => self.handle_register_enabled(enabled, initial_fetch),
            "parallelize_inventory_enabled" => self.handle_parallelize_inventory(enabled, initial_fetch),
            "async_inventory_handler_enabled" => self.handle_async_inventory_handler(enabled, initial_fetch),
            "protocol_v4_enabled" | "full_process_sampling" | "dm_register_deprecated" => {
                self.set_feature_flag(name, enabled)
            }
            "fluent_bit_19_win" => {
                self.set_feature_flag(name, enabled)?;
                if let Some(restarter) = &self.fb_restarter {
                    restarter.restart();
                }
                Ok(())
            }
            other => self.handle_ohi_flag(other, enabled, initial_fetch),
        }
    }

    fn handle_register_enabled(&self, enabled: bool, initial_fetch: bool) -> AgentResult<()> {
        if initial_fetch {
            self.register_enabled.store(enabled, Ordering::Relaxed);
            return Ok(());
        }
        let baseline = self.config_baseline.get("register_enabled").copied().unwrap_or(self.register_enabled());
        if enabled != baseline {
            self.restart();
        }
        Ok(())
    }

    fn handle_parallelize_inventory(&self, enabled: bool, initial_fetch: bool) -> AgentResult<()> {
        if initial_fetch {
            self.inventory_queue_len.store(if enabled { 100 } else { 0 }, Ordering::Relaxed);
            return Ok(());
        }
        let baseline = self.config_baseline.get("parallelize_inventory_enabled").copied().unwrap_or(false);
        if enabled != baseline {
            self.restart();
        }
        Ok(())
    }

    fn handle_async_inventory_handler(&self, enabled: bool, initial_fetch: bool) -> AgentResult<()> {
        if initial_fetch {
            self.async_inventory_handler_enabled.store(enabled, Ordering::Relaxed);
            return Ok(());
        }
        if enabled != self.config_async_inventory_handler_enabled {
            self.restart();
        }
        Ok(())
    }

    /// OHI flags only invoke the enabler collaborator on a live command-
    /// channel fetch; the initial bootstrap fetch absorbs the value silently
    ///. A user-configured value for
    /// the same name always wins and suppresses the call entirely.
    fn handle_ohi_flag(&self, name: &str, enabled: bool, initial_fetch: bool) -> AgentResult<()> {
        if self.config_flags.contains(name) {
            return Ok(());
        }
        if initial_fetch {
            let _ = self.set_feature_flag(name, enabled);
            return Ok(());
        }
        match self.set_feature_flag(name, enabled) {
            Ok(()) => {
                if let Some(enabler) = &self.ohi_enabler {
                    if enabled {
                        enabler.enable_ohi_from_ff(name);
                    } else {
                        enabler.disable_ohi_from_ff(name);
                    }
                }
                self.mark_logged(name);
                Ok(())
            }
            Err(AgentError::AlreadyExists(_)) => {
                if !self.already_logged(name) {
                    tracing::debug!(flag = %name, "ohi flag unchanged");
                    self.mark_logged(name);
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn already_logged(&self, name: &str) -> bool {
        self.ohi_logged.lock().unwrap_or_else(|e| e.into_inner()).contains(name)
    }

    fn mark_logged(&self, name: &str) {
        self.ohi_logged.lock().unwrap_or_else(|e| e.into_inner()).insert(name.to_string());
    }

    fn restart(&self) {
        tracing::warn!("feature flag change requires restart, exiting with restart code");
        (self.exit_fn)(RESTART_EXIT_CODE);
    }
}
