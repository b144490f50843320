//! Exchange implementations - Pluggable exchange adapters
//!
//! Venues are built through [`AdapterFactory`], a table mapping the config
//! `type` tag to a constructor. New venue types are added by registering a
//! constructor, never by looking types up at runtime.

pub mod binance;
pub mod okx;
pub mod paper;

pub use binance::Binance;
pub use okx::Okx;
pub use paper::PaperExchange;

use std::collections::HashMap;
use std::sync::Arc;

use crate::core::{Error, ExchangeAdapter, ExchangeConfig, Result};

/// Builds a live adapter from its config snapshot.
pub type AdapterConstructor =
    Arc<dyn Fn(&ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>> + Send + Sync>;

/// Venue type tag -> constructor table
#[derive(Clone, Default)]
pub struct AdapterFactory {
    constructors: HashMap<String, AdapterConstructor>,
}

impl AdapterFactory {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Table with every built-in venue type.
    pub fn with_defaults() -> Self {
        let mut factory = Self::new();
        factory.register("binance", |config| Ok(Arc::new(Binance::new(config))));
        factory.register("okx", |config| Ok(Arc::new(Okx::new(config))));
        factory.register("paper", |config| Ok(Arc::new(PaperExchange::from_config(config))));
        factory
    }

    /// Register (or replace) the constructor for a type tag.
    pub fn register<F>(&mut self, type_tag: &str, constructor: F) -> &mut Self
    where
        F: Fn(&ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>> + Send + Sync + 'static,
    {
        self.constructors
            .insert(type_tag.to_lowercase(), Arc::new(constructor));
        self
    }

    pub fn supports(&self, type_tag: &str) -> bool {
        self.constructors.contains_key(&type_tag.to_lowercase())
    }

    pub fn supported_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.constructors.keys().cloned().collect();
        types.sort();
        types
    }

    /// Build the adapter for `config`.
    pub fn create(&self, config: &ExchangeConfig) -> Result<Arc<dyn ExchangeAdapter>> {
        let constructor = self
            .constructors
            .get(&config.exchange_type.to_lowercase())
            .ok_or_else(|| Error::UnsupportedVenueType(config.exchange_type.clone()))?;
        constructor(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_cover_builtin_types() {
        let factory = AdapterFactory::with_defaults();
        assert_eq!(factory.supported_types(), vec!["binance", "okx", "paper"]);
        assert!(factory.supports("Binance"));
    }

    #[test]
    fn test_create_uses_config_name() {
        let factory = AdapterFactory::with_defaults();
        let adapter = factory
            .create(&ExchangeConfig::new("paper-east", "PAPER"))
            .unwrap();
        assert_eq!(adapter.name(), "paper-east");
    }

    #[test]
    fn test_unknown_type_rejected() {
        let factory = AdapterFactory::with_defaults();
        let err = factory
            .create(&ExchangeConfig::new("x", "kraken"))
            .err()
            .unwrap();
        assert!(matches!(err, Error::UnsupportedVenueType(t) if t == "kraken"));
    }
}
