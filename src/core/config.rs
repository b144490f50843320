//! Configuration - Type-safe, validated config

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::core::{Error, Result};

/// Application configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Engine settings
    #[serde(default)]
    pub engine: EngineConfig,

    /// Exchange configurations, in operator order
    #[serde(default)]
    pub exchanges: Vec<ExchangeConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Max remote calls in flight across all batches
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: usize,

    /// Default per-request timeout
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// Bound on the connectivity test run when a venue is registered
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Period of the background health loop
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,

    /// Symbol fetched by the connectivity probe
    #[serde(default = "default_probe_symbol")]
    pub probe_symbol: String,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_request_timeout() -> u64 {
    10_000
}
fn default_connect_timeout() -> u64 {
    5_000
}
fn default_health_interval() -> u64 {
    60
}
fn default_probe_symbol() -> String {
    "BTC/USDT".to_string()
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_requests: default_max_concurrent(),
            request_timeout_ms: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            health_check_interval_secs: default_health_interval(),
            probe_symbol: default_probe_symbol(),
        }
    }
}

impl EngineConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExchangeConfig {
    /// Unique venue name (e.g. "binance-main")
    pub name: String,

    /// Adapter type tag (binance, okx, paper, ...)
    #[serde(rename = "type")]
    pub exchange_type: String,

    /// API key (loaded from env if not provided)
    #[serde(default)]
    pub api_key: Option<String>,

    /// API secret (loaded from env if not provided)
    #[serde(default)]
    pub api_secret: Option<String>,

    /// API passphrase, for venues that require one
    #[serde(default)]
    pub passphrase: Option<String>,

    /// Use the venue's sandbox/testnet
    #[serde(default)]
    pub sandbox: bool,

    /// Requests per second allowed by the venue. Carried for operators and
    /// venue clients; the engine bounds load with `max_concurrent_requests`.
    #[serde(default = "default_rate_limit")]
    pub rate_limit: u32,

    /// Enable this exchange
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_rate_limit() -> u32 {
    10
}
fn default_enabled() -> bool {
    true
}

impl ExchangeConfig {
    pub fn new(name: impl Into<String>, exchange_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            exchange_type: exchange_type.into(),
            api_key: None,
            api_secret: None,
            passphrase: None,
            sandbox: false,
            rate_limit: default_rate_limit(),
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn sandbox(mut self) -> Self {
        self.sandbox = true;
        self
    }

    /// Fill missing credentials from `<NAME>_API_KEY`, `<NAME>_API_SECRET`
    /// and `<NAME>_PASSPHRASE`.
    pub fn resolve_credentials(&mut self) {
        let prefix = self.name.to_uppercase().replace(['-', '.', ' '], "_");
        let lookup = |suffix: &str| std::env::var(format!("{prefix}_{suffix}")).ok();
        if self.api_key.is_none() {
            self.api_key = lookup("API_KEY");
        }
        if self.api_secret.is_none() {
            self.api_secret = lookup("API_SECRET");
        }
        if self.passphrase.is_none() {
            self.passphrase = lookup("PASSPHRASE");
        }
    }
}

impl Config {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!("Failed to read {}: {}", path.as_ref().display(), e))
        })?;
        Self::from_toml(&content)
    }

    /// Load from TOML file, falling back to defaults when it is absent.
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        if !path.as_ref().exists() {
            tracing::warn!("⚠️ No config at {}, using defaults", path.as_ref().display());
            return Ok(Self::default());
        }
        Self::load(path)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(content)?;
        config.validate()?;
        for exchange in &mut config.exchanges {
            exchange.resolve_credentials();
        }
        Ok(config)
    }

    /// Save as pretty TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.engine.max_concurrent_requests == 0 {
            return Err(Error::Config("max_concurrent_requests must be > 0".into()));
        }
        let mut seen = HashSet::new();
        for exchange in &self.exchanges {
            if exchange.name.trim().is_empty() {
                return Err(Error::Config("exchange name must not be empty".into()));
            }
            if !seen.insert(exchange.name.as_str()) {
                return Err(Error::Config(format!("duplicate exchange name: {}", exchange.name)));
            }
        }
        Ok(())
    }

    /// Get exchange config by name
    pub fn exchange(&self, name: &str) -> Option<&ExchangeConfig> {
        self.exchanges.iter().find(|e| e.name == name)
    }
}
