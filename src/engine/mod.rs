//! Execution engine - the explicit context every caller shares
//!
//! `ExchangeEngine` is created once at startup and handed around by
//! reference (usually inside an `Arc`). It wires the registry, dispatcher,
//! health monitor, router and arbitrage components together and exposes the
//! monitoring surface.

pub mod arbitrage;
pub mod dispatcher;
pub mod health;
pub mod registry;
pub mod router;

pub use arbitrage::{
    ArbitrageExecution, ArbitrageExecutor, ArbitrageOpportunity, ArbitrageOutcome,
    ArbitrageScanner, scan_quotes,
};
pub use dispatcher::{
    ExecutionDispatcher, ExecutionRequest, ExecutionResponse, Operation, ParallelResult, Payload,
    RequestStats,
};
pub use health::{ConnectionReport, HealthMonitor, HealthStatus, VenueStatus};
pub use registry::{ExchangeRegistry, ReloadReport};
pub use router::{BestPriceFill, OrderRouter, SplitExecution};

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::core::{Balance, Config, EngineConfig, Error, ExchangeConfig, Result, Symbol, Ticker};
use crate::exchanges::AdapterFactory;

/// Counts over the configured venues.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConfigSummary {
    pub total: usize,
    pub enabled: usize,
    /// Enabled and connected
    pub active: usize,
    pub sandbox: usize,
    pub by_type: BTreeMap<String, usize>,
}

/// One configured venue as seen by monitoring.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExchangeInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub exchange_type: String,
    pub sandbox: bool,
    pub enabled: bool,
    pub active: bool,
    pub health: Option<HealthStatus>,
}

pub struct ExchangeEngine {
    settings: EngineConfig,
    initial: Vec<ExchangeConfig>,
    config_path: Option<PathBuf>,
    probe: Symbol,
    health: Arc<HealthMonitor>,
    registry: Arc<ExchangeRegistry>,
    dispatcher: Arc<ExecutionDispatcher>,
    router: OrderRouter,
    scanner: ArbitrageScanner,
    executor: ArbitrageExecutor,
}

impl ExchangeEngine {
    /// Wire the components. Nothing connects until [`start`](Self::start).
    pub fn new(config: Config, factory: AdapterFactory) -> Self {
        let Config { engine, exchanges } = config;
        let health = Arc::new(HealthMonitor::new());
        let registry = Arc::new(ExchangeRegistry::new(factory, health.clone(), &engine));
        let dispatcher = Arc::new(ExecutionDispatcher::new(
            registry.clone(),
            health.clone(),
            engine.max_concurrent_requests,
            engine.request_timeout(),
        ));
        Self {
            probe: Symbol::new(engine.probe_symbol.clone()),
            settings: engine,
            initial: exchanges,
            config_path: None,
            health,
            registry,
            router: OrderRouter::new(dispatcher.clone()),
            scanner: ArbitrageScanner::new(dispatcher.clone()),
            executor: ArbitrageExecutor::new(dispatcher.clone()),
            dispatcher,
        }
    }

    /// Persist config changes made through `enable`, `disable` and `reload`
    /// to this file.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Connect every enabled venue from the startup config.
    pub async fn start(&self) -> ReloadReport {
        info!("🚀 Starting engine with {} configured venues", self.initial.len());
        self.registry.initialize(self.initial.clone()).await
    }

    pub async fn reload(&self, configs: Vec<ExchangeConfig>) -> Result<ReloadReport> {
        let report = self.registry.reload(configs).await?;
        self.persist()?;
        Ok(report)
    }

    /// Re-read the config file given to [`with_config_path`](Self::with_config_path)
    /// and apply its venue list.
    pub async fn reload_from_file(&self) -> Result<ReloadReport> {
        let Some(path) = &self.config_path else {
            return Err(Error::Config("no config path set".into()));
        };
        let config = Config::load(path)?;
        self.registry.reload(config.exchanges).await
    }

    pub async fn enable(&self, name: &str) -> Result<bool> {
        let outcome = self.registry.enable(name).await;
        match &outcome {
            Ok(true) => self.persist()?,
            // A venue that failed to connect is still enabled in config; the
            // connect error is what the caller needs to see.
            Err(e) if !matches!(e, Error::UnknownVenue(_)) => {
                if let Err(persist_err) = self.persist() {
                    warn!("⚠️ Failed to save config after enabling {}: {}", name, persist_err);
                }
            }
            _ => {}
        }
        outcome
    }

    pub async fn disable(&self, name: &str) -> Result<bool> {
        let changed = self.registry.disable(name).await?;
        if changed {
            self.persist()?;
        }
        Ok(changed)
    }

    fn persist(&self) -> Result<()> {
        let Some(path) = &self.config_path else {
            return Ok(());
        };
        let config = Config {
            engine: self.settings.clone(),
            exchanges: self.registry.configs(),
        };
        config.save(path)?;
        debug!("💾 Config saved to {}", path.display());
        Ok(())
    }

    pub async fn test_all_connections(&self) -> ConnectionReport {
        self.health
            .test_all_connections(&self.dispatcher, &self.probe)
            .await
    }

    /// Probe all venues every `health_check_interval_secs` until the engine
    /// is dropped or the handle is aborted.
    pub fn spawn_health_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let engine: Weak<Self> = Arc::downgrade(self);
        let period = self.settings.health_check_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(engine) = engine.upgrade() else {
                    debug!("Health loop stopped, engine dropped");
                    break;
                };
                let report = engine.test_all_connections().await;
                if report.unhealthy > 0 {
                    warn!("🩺 {} of {} venues unhealthy", report.unhealthy, report.results.len());
                }
            }
        })
    }

    pub fn health_status(&self) -> HashMap<String, HealthStatus> {
        self.health.snapshot()
    }

    pub fn config_summary(&self) -> ConfigSummary {
        let mut summary = ConfigSummary::default();
        for config in self.registry.configs() {
            summary.total += 1;
            if config.enabled {
                summary.enabled += 1;
            }
            if config.enabled && self.registry.is_active(&config.name) {
                summary.active += 1;
            }
            if config.sandbox {
                summary.sandbox += 1;
            }
            *summary.by_type.entry(config.exchange_type.to_lowercase()).or_default() += 1;
        }
        summary
    }

    pub fn exchanges_info(&self) -> Vec<ExchangeInfo> {
        let health = self.health.snapshot();
        self.registry
            .configs()
            .into_iter()
            .map(|config| ExchangeInfo {
                active: self.registry.is_active(&config.name),
                health: health.get(&config.name).cloned(),
                name: config.name,
                exchange_type: config.exchange_type,
                sandbox: config.sandbox,
                enabled: config.enabled,
            })
            .collect()
    }

    pub fn request_stats(&self) -> HashMap<String, RequestStats> {
        self.dispatcher.stats()
    }

    /// Ticker for `symbol` from every live venue that returned one.
    pub async fn all_tickers(&self, symbol: &Symbol) -> HashMap<String, Ticker> {
        let venues = self.registry.active_venues();
        let batch = self
            .dispatcher
            .fan_out(&venues, Operation::GetTicker(symbol.clone()))
            .await;
        batch
            .successful
            .into_iter()
            .filter_map(|resp| match resp.payload {
                Some(Payload::Ticker(ticker)) => Some((resp.venue, ticker)),
                _ => None,
            })
            .collect()
    }

    /// Balances from every live venue that answered.
    pub async fn all_balances(&self) -> HashMap<String, Vec<Balance>> {
        let venues = self.registry.active_venues();
        let batch = self.dispatcher.fan_out(&venues, Operation::GetBalance).await;
        batch
            .successful
            .into_iter()
            .filter_map(|resp| match resp.payload {
                Some(Payload::Balances(balances)) => Some((resp.venue, balances)),
                _ => None,
            })
            .collect()
    }

    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<ExecutionDispatcher> {
        &self.dispatcher
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    pub fn router(&self) -> &OrderRouter {
        &self.router
    }

    pub fn scanner(&self) -> &ArbitrageScanner {
        &self.scanner
    }

    pub fn executor(&self) -> &ArbitrageExecutor {
        &self.executor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testkit::{MockVenue, TestHarness, mock_config};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    #[tokio::test]
    async fn test_monitoring_surface() {
        let a = Arc::new(MockVenue::new("a").with_ticker("BTC/USDT", dec!(1), dec!(2)));
        let b = Arc::new(MockVenue::new("b"));
        b.set_ping_fails(true);
        let harness = TestHarness::start(&[a, b]).await;
        let engine = &harness.engine;

        let summary = engine.config_summary();
        assert_eq!(summary.total, 2);
        assert_eq!(summary.enabled, 2);
        assert_eq!(summary.active, 1);
        assert_eq!(summary.by_type.get("mock"), Some(&2));

        let info = engine.exchanges_info();
        assert_eq!(info.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(), vec!["a", "b"]);
        assert!(info[0].active && info[0].health.is_some());
        assert!(!info[1].active && info[1].health.is_none());

        engine.all_tickers(&Symbol::new("BTC/USDT")).await;
        assert_eq!(engine.request_stats()["a:get_ticker"].successful_requests, 1);
        assert_eq!(engine.health_status().len(), 1);
    }

    #[tokio::test]
    async fn test_convenience_fan_outs() {
        let a = Arc::new(MockVenue::new("a").with_ticker("BTC/USDT", dec!(1), dec!(2)));
        let b = Arc::new(MockVenue::new("b"));
        let harness = TestHarness::start(&[a, b]).await;

        let tickers = harness.engine.all_tickers(&Symbol::new("BTC/USDT")).await;
        assert_eq!(tickers.len(), 1);
        assert_eq!(tickers["a"].ask, dec!(2));

        let balances = harness.engine.all_balances().await;
        assert_eq!(balances.len(), 2);
        assert_eq!(balances["b"][0].asset, "USDT");
    }

    #[tokio::test]
    async fn test_toggle_persists_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        let a = Arc::new(MockVenue::new("a"));
        let harness = TestHarness::start_with_config(
            &[a],
            EngineConfig::default(),
            Some(path.clone()),
        )
        .await;

        assert!(harness.engine.disable("a").await.unwrap());
        let saved = Config::load(&path).unwrap();
        assert!(!saved.exchange("a").unwrap().enabled);

        assert!(!harness.engine.disable("a").await.unwrap());
        assert!(harness.engine.enable("a").await.unwrap());
        assert!(Config::load(&path).unwrap().exchange("a").unwrap().enabled);

        assert!(matches!(harness.engine.enable("zzz").await, Err(Error::UnknownVenue(_))));
    }

    #[tokio::test]
    async fn test_enable_keeps_connect_error_when_save_fails() {
        let dir = tempfile::tempdir().unwrap();
        // A directory cannot be written as a file, so every save fails.
        let path = dir.path().to_path_buf();
        let a = Arc::new(MockVenue::new("a"));
        a.set_ping_fails(true);
        let harness =
            TestHarness::start_with_config(&[a], EngineConfig::default(), Some(path)).await;

        let err = harness.engine.enable("a").await.unwrap_err();
        assert!(matches!(err, Error::Adapter(msg) if msg.contains("unreachable")));
        assert!(harness.engine.registry().configs()[0].enabled);
    }

    #[tokio::test]
    async fn test_reload_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hub.toml");
        let a = Arc::new(MockVenue::new("a"));
        let b = Arc::new(MockVenue::new("b"));
        let harness = TestHarness::start_with_config(
            &[a, b],
            EngineConfig::default(),
            Some(path.clone()),
        )
        .await;

        let config = Config {
            engine: EngineConfig::default(),
            exchanges: vec![mock_config("b")],
        };
        config.save(&path).unwrap();

        let report = harness.engine.reload_from_file().await.unwrap();
        assert_eq!(report.removed, vec!["a"]);
        assert_eq!(harness.engine.registry().active_venues(), vec!["b"]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_health_loop_probes_periodically() {
        let a = Arc::new(MockVenue::new("a"));
        let engine = EngineConfig {
            health_check_interval_secs: 1,
            ..Default::default()
        };
        let harness = TestHarness::start_with_config(&[a.clone()], engine, None).await;
        a.clear_log();

        let handle = harness.engine.spawn_health_loop();
        tokio::time::sleep(Duration::from_millis(2_500)).await;
        handle.abort();

        assert_eq!(a.call_log(), vec!["ping", "ping"]);
    }

    #[tokio::test]
    async fn test_default_factory_with_paper_venues() {
        let config = Config::from_toml(
            r#"
            [[exchanges]]
            name = "paper-a"
            type = "paper"

            [[exchanges]]
            name = "paper-b"
            type = "paper"
            sandbox = true
            "#,
        )
        .unwrap();
        let engine = ExchangeEngine::new(config, AdapterFactory::with_defaults());
        let report = engine.start().await;
        assert_eq!(report.added, vec!["paper-a", "paper-b"]);
        assert_eq!(engine.config_summary().sandbox, 1);

        // Paper venues start without quotes.
        let tickers = engine.all_tickers(&Symbol::new("BTC/USDT")).await;
        assert!(tickers.is_empty());
    }
}
