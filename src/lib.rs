//! Exchange Hub - multi-venue execution engine
//!
//! Owns a dynamic set of venue adapters, fans requests out to them with
//! bounded concurrency, tracks per-venue health, routes orders to the best
//! price and detects and executes cross-venue arbitrage.

pub mod core;
pub mod engine;
pub mod exchanges;

#[cfg(test)]
mod testkit;

// Re-exports
pub use core::{Config, Error, Result};
pub use engine::ExchangeEngine;
pub use exchanges::AdapterFactory;
