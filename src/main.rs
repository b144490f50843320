use anyhow::Context;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use exchange_hub::core::Symbol;
use exchange_hub::{AdapterFactory, Config, ExchangeEngine};

const DEFAULT_CONFIG_PATH: &str = "config.toml";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,exchange_hub=debug"));
    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("🦀 Exchange Hub starting...");

    let path = std::env::var("EXCHANGE_HUB_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
    let config = Config::load_or_default(&path).with_context(|| format!("loading {path}"))?;
    let probe = Symbol::new(config.engine.probe_symbol.clone());

    let engine = Arc::new(ExchangeEngine::new(config, AdapterFactory::with_defaults()).with_config_path(&path));
    let report = engine.start().await;
    if !report.failed.is_empty() {
        warn!("⚠️ Venues offline at startup: {:?}", report.failed);
    }

    let summary = engine.config_summary();
    info!(
        "📊 {} venues configured, {} enabled, {} active",
        summary.total, summary.enabled, summary.active
    );
    let tickers = engine.all_tickers(&probe).await;
    for (venue, ticker) in &tickers {
        info!("📈 {} {} bid={} ask={}", venue, ticker.symbol, ticker.bid, ticker.ask);
    }

    let health_loop = engine.spawn_health_loop();
    info!("⏳ Running. Press Ctrl-C to stop.");

    tokio::signal::ctrl_c().await.context("listening for ctrl-c")?;
    warn!("🛑 Shutdown signal received");
    health_loop.abort();

    for (key, stats) in engine.request_stats() {
        info!(
            "📦 {}: {} requests, {:.0}% ok, avg {:.1}ms",
            key,
            stats.total_requests,
            stats.success_rate * 100.0,
            stats.avg_response_time_ms
        );
    }
    Ok(())
}
