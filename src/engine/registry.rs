//! Exchange Registry - config-driven adapter lifecycle
//!
//! Owns the venue configs and exactly one live adapter per connected
//! enabled venue. Lifecycle operations (initialize, reload, enable,
//! disable) are serialized by an async mutex; the config and adapter maps
//! themselves sit behind short-lived `parking_lot` locks that are never held
//! across an await.

use futures::future::join_all;
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::core::{EngineConfig, Error, ExchangeAdapter, ExchangeConfig, Result, Symbol};
use crate::engine::health::HealthMonitor;
use crate::exchanges::AdapterFactory;

/// Venue names touched by an initialize or reload pass, each list sorted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReloadReport {
    pub added: Vec<String>,
    pub removed: Vec<String>,
    pub reloaded: Vec<String>,
    /// Venues that should be live but failed to build or connect
    pub failed: Vec<String>,
}

pub struct ExchangeRegistry {
    factory: AdapterFactory,
    health: Arc<HealthMonitor>,
    connect_timeout: Duration,
    probe: Symbol,
    configs: RwLock<Vec<ExchangeConfig>>,
    adapters: RwLock<HashMap<String, Arc<dyn ExchangeAdapter>>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl ExchangeRegistry {
    pub fn new(factory: AdapterFactory, health: Arc<HealthMonitor>, engine: &EngineConfig) -> Self {
        Self {
            factory,
            health,
            connect_timeout: engine.connect_timeout(),
            probe: Symbol::new(engine.probe_symbol.clone()),
            configs: RwLock::new(Vec::new()),
            adapters: RwLock::new(HashMap::new()),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    pub fn create_adapter(&self, config: &ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>> {
        debug!("🔧 Building {} adapter for {}", config.exchange_type, config.name);
        self.factory.create(config)
    }

    /// Replace everything with `configs` and connect every enabled venue.
    ///
    /// Unreachable venues are logged and left out; startup never fails
    /// because of them.
    pub async fn initialize(&self, configs: Vec<ExchangeConfig>) -> ReloadReport {
        let _guard = self.lifecycle.lock().await;

        let old: Vec<String> = self.adapters.write().drain().map(|(name, _)| name).collect();
        for name in &old {
            self.health.remove(name);
        }

        let enabled: Vec<ExchangeConfig> = configs.iter().filter(|c| c.enabled).cloned().collect();
        *self.configs.write() = configs;

        let (added, failed) = self.activate_all(&enabled).await;
        info!(
            "🚀 Registry initialized: {} active, {} failed",
            added.len(),
            failed.len()
        );
        ReloadReport {
            added,
            failed,
            ..Default::default()
        }
    }

    /// Hot reload by name-set diff against the current enabled set.
    ///
    /// Removed venues lose their adapter and health entry; venues enabled on
    /// both sides are torn down and rebuilt; new ones are connected the same
    /// way `initialize` does it.
    pub async fn reload(&self, configs: Vec<ExchangeConfig>) -> Result<ReloadReport> {
        let mut names = BTreeSet::new();
        for config in &configs {
            if !names.insert(config.name.as_str()) {
                return Err(Error::Config(format!("duplicate exchange name: {}", config.name)));
            }
        }

        let _guard = self.lifecycle.lock().await;

        let old_enabled = enabled_names(&self.configs.read());
        let new_enabled = enabled_names(&configs);
        let removed: Vec<String> = old_enabled.difference(&new_enabled).cloned().collect();
        let added: Vec<String> = new_enabled.difference(&old_enabled).cloned().collect();
        let reloaded: Vec<String> = new_enabled.intersection(&old_enabled).cloned().collect();

        {
            let mut adapters = self.adapters.write();
            for name in removed.iter().chain(reloaded.iter()) {
                adapters.remove(name);
            }
        }
        for name in &removed {
            self.health.remove(name);
            info!("➖ {} removed", name);
        }
        // Rebuilt venues re-register on a successful reconnect.
        for name in &reloaded {
            self.health.remove(name);
        }
        let previous_names: BTreeSet<String> =
            self.configs.read().iter().map(|c| c.name.clone()).collect();
        for name in previous_names.iter().filter(|n| !names.contains(n.as_str())) {
            self.health.remove(name);
        }

        let to_activate: Vec<ExchangeConfig> = configs
            .iter()
            .filter(|c| c.enabled && (added.contains(&c.name) || reloaded.contains(&c.name)))
            .cloned()
            .collect();
        *self.configs.write() = configs;

        let (_, failed) = self.activate_all(&to_activate).await;
        info!(
            "🔄 Reload: +{} -{} ~{} ({} failed)",
            added.len(),
            removed.len(),
            reloaded.len(),
            failed.len()
        );
        Ok(ReloadReport {
            added,
            removed,
            reloaded,
            failed,
        })
    }

    /// Enable a venue and connect it. Returns `false` when it was already
    /// enabled and live.
    ///
    /// A failed connection leaves the config enabled, so calling this again
    /// retries.
    pub async fn enable(&self, name: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;

        let live = self.is_active(name);
        let config = {
            let mut configs = self.configs.write();
            let config = configs
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::UnknownVenue(name.to_string()))?;
            if config.enabled && live {
                debug!("{} already enabled", name);
                return Ok(false);
            }
            config.enabled = true;
            config.clone()
        };

        self.health.remove(name);
        self.activate(&config).await?;
        info!("✅ {} enabled", name);
        Ok(true)
    }

    /// Disable a venue and drop its adapter. Returns `false` when it was
    /// already disabled.
    pub async fn disable(&self, name: &str) -> Result<bool> {
        let _guard = self.lifecycle.lock().await;

        {
            let mut configs = self.configs.write();
            let config = configs
                .iter_mut()
                .find(|c| c.name == name)
                .ok_or_else(|| Error::UnknownVenue(name.to_string()))?;
            if !config.enabled {
                debug!("{} already disabled", name);
                return Ok(false);
            }
            config.enabled = false;
        }

        self.adapters.write().remove(name);
        self.health.mark_disabled(name);
        info!("⏸️ {} disabled", name);
        Ok(true)
    }

    pub fn adapter(&self, name: &str) -> Option<Arc<dyn ExchangeAdapter>> {
        self.adapters.read().get(name).cloned()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.adapters.read().contains_key(name)
    }

    /// Venues with a live adapter, in config order.
    pub fn active_venues(&self) -> Vec<String> {
        let configs = self.configs.read();
        let adapters = self.adapters.read();
        configs
            .iter()
            .filter(|c| adapters.contains_key(&c.name))
            .map(|c| c.name.clone())
            .collect()
    }

    /// Venues enabled in config, in config order, connected or not.
    pub fn enabled_venues(&self) -> Vec<String> {
        self.configs
            .read()
            .iter()
            .filter(|c| c.enabled)
            .map(|c| c.name.clone())
            .collect()
    }

    pub fn configs(&self) -> Vec<ExchangeConfig> {
        self.configs.read().clone()
    }

    async fn activate_all(&self, configs: &[ExchangeConfig]) -> (Vec<String>, Vec<String>) {
        let outcomes = join_all(configs.iter().map(|config| async move {
            (config.name.clone(), self.activate(config).await)
        }))
        .await;

        let mut added = Vec::new();
        let mut failed = Vec::new();
        for (name, outcome) in outcomes {
            match outcome {
                Ok(_) => added.push(name),
                Err(_) => failed.push(name),
            }
        }
        added.sort();
        failed.sort();
        (added, failed)
    }

    /// Build, probe within the connect timeout, then register.
    async fn activate(&self, config: &ExchangeConfig) -> Result<f64> {
        let adapter = match self.create_adapter(config) {
            Ok(adapter) => adapter,
            Err(e) => {
                warn!("⚠️ {} not created: {}", config.name, e);
                return Err(e);
            }
        };

        let started = Instant::now();
        let probe = tokio::time::timeout(self.connect_timeout, adapter.ping(&self.probe)).await;
        let response_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        match probe {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("⚠️ {} connectivity test failed: {}", config.name, e);
                return Err(e);
            }
            Err(_) => {
                warn!("⚠️ {} connectivity test timed out", config.name);
                return Err(Error::Timeout(self.connect_timeout));
            }
        }

        self.adapters.write().insert(config.name.clone(), adapter);
        self.health.register(&config.name, response_time_ms);
        info!("🔌 {} connected ({:.1}ms)", config.name, response_time_ms);
        Ok(response_time_ms)
    }
}

fn enabled_names(configs: &[ExchangeConfig]) -> BTreeSet<String> {
    configs
        .iter()
        .filter(|c| c.enabled)
        .map(|c| c.name.clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::health::VenueStatus;
    use crate::testkit::{MockVenue, TestHarness, mock_config};

    #[tokio::test]
    async fn test_initialize_skips_unreachable_venues() {
        let up = Arc::new(MockVenue::new("up"));
        let down = Arc::new(MockVenue::new("down"));
        down.set_ping_fails(true);
        let harness = TestHarness::start(&[up, down]).await;
        let registry = harness.engine.registry();

        assert_eq!(registry.active_venues(), vec!["up"]);
        assert_eq!(registry.enabled_venues(), vec!["up", "down"]);
        assert!(harness.engine.health().status("up").is_some());
        assert!(harness.engine.health().status("down").is_none());
    }

    #[tokio::test]
    async fn test_unknown_type_is_omitted() {
        let up = Arc::new(MockVenue::new("up"));
        let harness = TestHarness::start(&[up]).await;
        let registry = harness.engine.registry();

        let mut configs = registry.configs();
        configs.push(ExchangeConfig::new("weird", "carrier-pigeon"));
        let report = registry.reload(configs).await.unwrap();

        assert_eq!(report.added, vec!["weird"]);
        assert_eq!(report.failed, vec!["weird"]);
        assert!(!registry.is_active("weird"));
        assert!(registry.is_active("up"));
    }

    #[tokio::test]
    async fn test_reload_is_idempotent() {
        let a = Arc::new(MockVenue::new("a"));
        let b = Arc::new(MockVenue::new("b"));
        let harness = TestHarness::start(&[a, b]).await;
        let registry = harness.engine.registry();
        let configs = registry.configs();

        let first = registry.reload(configs.clone()).await.unwrap();
        let second = registry.reload(configs).await.unwrap();

        assert_eq!(first, second);
        assert!(second.added.is_empty());
        assert!(second.removed.is_empty());
        assert_eq!(second.reloaded, vec!["a", "b"]);
        assert_eq!(registry.active_venues(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_reload_diff() {
        let a = Arc::new(MockVenue::new("a"));
        let b = Arc::new(MockVenue::new("b"));
        let c = Arc::new(MockVenue::new("c"));
        let harness = TestHarness::start(&[a, b, c]).await;
        let registry = harness.engine.registry();
        let builds_before = harness.builds();

        // Drop "a", keep "b", turn "c" off, add "d".
        let d = Arc::new(MockVenue::new("d"));
        harness.add_venue(d);
        let configs = vec![mock_config("b"), mock_config("c").disabled(), mock_config("d")];
        let report = registry.reload(configs).await.unwrap();

        assert_eq!(report.removed, vec!["a", "c"]);
        assert_eq!(report.reloaded, vec!["b"]);
        assert_eq!(report.added, vec!["d"]);
        assert!(report.failed.is_empty());
        assert_eq!(registry.active_venues(), vec!["b", "d"]);
        assert!(harness.engine.health().status("a").is_none());
        assert!(harness.engine.health().status("c").is_none());
        // "b" rebuilt, "d" built fresh
        assert_eq!(harness.builds() - builds_before, 2);
    }

    #[tokio::test]
    async fn test_failed_reconnect_drops_health_entry() {
        let a = Arc::new(MockVenue::new("a"));
        let harness = TestHarness::start(&[a.clone()]).await;
        let registry = harness.engine.registry();
        harness.engine.health().record_failure("a", "stale", 1.0);

        a.set_ping_fails(true);
        let report = registry.reload(registry.configs()).await.unwrap();

        assert_eq!(report.reloaded, vec!["a"]);
        assert_eq!(report.failed, vec!["a"]);
        assert!(!registry.is_active("a"));
        assert!(harness.engine.health().status("a").is_none());

        a.set_ping_fails(false);
        let report = registry.reload(registry.configs()).await.unwrap();
        assert!(report.failed.is_empty());
        let status = harness.engine.health().status("a").unwrap();
        assert_eq!(status.status, VenueStatus::Healthy);
        assert_eq!(status.consecutive_errors, 0);
    }

    #[tokio::test]
    async fn test_reload_rejects_duplicate_names() {
        let harness = TestHarness::start(&[Arc::new(MockVenue::new("a"))]).await;
        let result = harness
            .engine
            .registry()
            .reload(vec![mock_config("a"), mock_config("a")])
            .await;
        assert!(matches!(result, Err(Error::Config(_))));
        assert!(harness.engine.registry().is_active("a"));
    }

    #[tokio::test]
    async fn test_enable_disable_are_idempotent() {
        let a = Arc::new(MockVenue::new("a"));
        let harness = TestHarness::start(&[a]).await;
        let registry = harness.engine.registry();

        assert!(!registry.enable("a").await.unwrap());
        assert!(registry.disable("a").await.unwrap());
        assert!(!registry.is_active("a"));
        assert_eq!(
            harness.engine.health().status("a").unwrap().status,
            VenueStatus::Disabled
        );

        let builds = harness.builds();
        assert!(!registry.disable("a").await.unwrap());
        assert_eq!(harness.builds(), builds);

        assert!(registry.enable("a").await.unwrap());
        assert!(registry.is_active("a"));
        assert_eq!(
            harness.engine.health().status("a").unwrap().status,
            VenueStatus::Healthy
        );
    }

    #[tokio::test]
    async fn test_enable_retries_failed_connection() {
        let flaky = Arc::new(MockVenue::new("flaky"));
        flaky.set_ping_fails(true);
        let harness = TestHarness::start(&[flaky.clone()]).await;
        let registry = harness.engine.registry();
        assert!(!registry.is_active("flaky"));

        assert!(registry.enable("flaky").await.is_err());
        flaky.set_ping_fails(false);
        assert!(registry.enable("flaky").await.unwrap());
        assert!(registry.is_active("flaky"));
    }

    #[tokio::test]
    async fn test_unknown_venue_errors() {
        let harness = TestHarness::start(&[]).await;
        let registry = harness.engine.registry();
        assert!(matches!(registry.enable("nope").await, Err(Error::UnknownVenue(_))));
        assert!(matches!(registry.disable("nope").await, Err(Error::UnknownVenue(_))));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_connect_timeout_bounds_activation() {
        let slow = Arc::new(MockVenue::new("slow"));
        slow.set_delay(Duration::from_secs(30));
        let started = Instant::now();
        let harness = TestHarness::start(&[slow]).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(harness.engine.registry().active_venues().is_empty());
    }
}
