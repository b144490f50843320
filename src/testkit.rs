//! Test support: a scriptable in-memory venue and an engine harness.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use crate::core::{
    Balance, CancelRequest, Config, EngineConfig, Error, ExchangeAdapter, ExchangeConfig, Kline,
    KlineQuery, Order, OrderQuery, OrderRequest, OrderResponse, OrderStatus, Result, Symbol, Ticker,
};
use crate::engine::ExchangeEngine;
use crate::exchanges::AdapterFactory;

pub const MOCK_TYPE: &str = "mock";

pub fn mock_config(name: &str) -> ExchangeConfig {
    ExchangeConfig::new(name, MOCK_TYPE)
}

/// In-memory venue with injectable latency and failures.
pub struct MockVenue {
    name: String,
    tickers: RwLock<HashMap<Symbol, Ticker>>,
    delay: Mutex<Duration>,
    fail_all: AtomicBool,
    fail_orders: AtomicBool,
    ping_fails: AtomicBool,
    calls: Mutex<Vec<&'static str>>,
    placed: Mutex<Vec<OrderRequest>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl MockVenue {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            tickers: RwLock::new(HashMap::new()),
            delay: Mutex::new(Duration::ZERO),
            fail_all: AtomicBool::new(false),
            fail_orders: AtomicBool::new(false),
            ping_fails: AtomicBool::new(false),
            calls: Mutex::new(Vec::new()),
            placed: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
        }
    }

    pub fn with_ticker(self, symbol: &str, bid: Decimal, ask: Decimal) -> Self {
        let symbol = Symbol::new(symbol);
        self.tickers.write().insert(
            symbol.clone(),
            Ticker {
                symbol,
                bid,
                ask,
                last: ask,
                volume_24h: Decimal::ZERO,
                timestamp: Utc::now(),
            },
        );
        self
    }

    pub fn venue_name(&self) -> &str {
        &self.name
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    pub fn set_fail_all(&self, fail: bool) {
        self.fail_all.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_orders(&self, fail: bool) {
        self.fail_orders.store(fail, Ordering::SeqCst);
    }

    pub fn set_ping_fails(&self, fail: bool) {
        self.ping_fails.store(fail, Ordering::SeqCst);
    }

    pub fn call_log(&self) -> Vec<&'static str> {
        self.calls.lock().clone()
    }

    pub fn clear_log(&self) {
        self.calls.lock().clear();
    }

    pub fn orders_placed(&self) -> usize {
        self.placed.lock().len()
    }

    pub fn last_order_quantity(&self) -> Option<Decimal> {
        self.placed.lock().last().map(|o| o.quantity)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    /// Log the call, hold an in-flight slot for the configured delay, then
    /// fail if `fail_all` is set.
    async fn enter(&self, call: &'static str) -> Result<()> {
        self.calls.lock().push(call);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        if self.fail_all.load(Ordering::SeqCst) {
            return Err(Error::Adapter(format!("{}: injected failure", self.name)));
        }
        Ok(())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl ExchangeAdapter for MockVenue {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker> {
        self.enter("get_ticker").await?;
        self.tickers
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::Adapter(format!("{}: no quote for {}", self.name, symbol)))
    }

    async fn get_balance(&self) -> Result<Vec<Balance>> {
        self.enter("get_balance").await?;
        Ok(vec![Balance {
            asset: "USDT".into(),
            free: Decimal::ONE_THOUSAND,
            locked: Decimal::ZERO,
        }])
    }

    async fn get_orders(&self, _query: &OrderQuery) -> Result<Vec<Order>> {
        self.enter("get_orders").await?;
        Ok(vec![])
    }

    async fn get_klines(&self, _query: &KlineQuery) -> Result<Vec<Kline>> {
        self.enter("get_klines").await?;
        Ok(vec![])
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        self.enter("place_order").await?;
        if self.fail_orders.load(Ordering::SeqCst) {
            return Err(Error::Adapter(format!("{}: order rejected", self.name)));
        }
        let filled_price = self
            .tickers
            .read()
            .get(&order.symbol)
            .and_then(|t| t.price_for(order.side));
        let mut placed = self.placed.lock();
        placed.push(order.clone());
        Ok(OrderResponse {
            order_id: format!("{}-{}", self.name, placed.len()),
            symbol: order.symbol.clone(),
            side: order.side,
            status: OrderStatus::Filled,
            filled_quantity: order.quantity,
            filled_price,
            created_at: Utc::now(),
        })
    }

    async fn cancel_order(&self, _request: &CancelRequest) -> Result<()> {
        self.enter("cancel_order").await
    }

    async fn ping(&self, _probe: &Symbol) -> Result<()> {
        self.enter("ping").await?;
        if self.ping_fails.load(Ordering::SeqCst) {
            return Err(Error::Adapter(format!("{}: unreachable", self.name)));
        }
        Ok(())
    }
}

/// Running engine wired to a mock-only factory.
pub struct TestHarness {
    pub engine: Arc<ExchangeEngine>,
    venues: Arc<RwLock<HashMap<String, Arc<MockVenue>>>>,
    builds: Arc<AtomicUsize>,
}

impl TestHarness {
    pub async fn start(venues: &[Arc<MockVenue>]) -> Self {
        Self::start_with_limit(venues, 10).await
    }

    pub async fn start_with_limit(venues: &[Arc<MockVenue>], max_concurrent: usize) -> Self {
        let engine = EngineConfig {
            max_concurrent_requests: max_concurrent,
            request_timeout_ms: 2_000,
            connect_timeout_ms: 300,
            ..Default::default()
        };
        Self::start_with_config(venues, engine, None).await
    }

    pub async fn start_with_config(
        venues: &[Arc<MockVenue>],
        engine: EngineConfig,
        config_path: Option<std::path::PathBuf>,
    ) -> Self {
        let table: HashMap<String, Arc<MockVenue>> = venues
            .iter()
            .map(|v| (v.venue_name().to_string(), v.clone()))
            .collect();
        let venues_map = Arc::new(RwLock::new(table));
        let builds = Arc::new(AtomicUsize::new(0));

        let mut factory = AdapterFactory::new();
        let lookup = venues_map.clone();
        let counter = builds.clone();
        factory.register(MOCK_TYPE, move |config| {
            let venue = lookup
                .read()
                .get(&config.name)
                .cloned()
                .ok_or_else(|| Error::Config(format!("no mock venue named {}", config.name)))?;
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(venue as Arc<dyn ExchangeAdapter>)
        });

        let config = Config {
            engine,
            exchanges: venues.iter().map(|v| mock_config(v.venue_name())).collect(),
        };
        let mut built = ExchangeEngine::new(config, factory);
        if let Some(path) = config_path {
            built = built.with_config_path(path);
        }
        let engine = Arc::new(built);
        engine.start().await;

        Self {
            engine,
            venues: venues_map,
            builds,
        }
    }

    /// Make another mock venue constructible, e.g. before a reload adds it.
    pub fn add_venue(&self, venue: Arc<MockVenue>) {
        self.venues
            .write()
            .insert(venue.venue_name().to_string(), venue);
    }

    /// Adapters built by the factory so far.
    pub fn builds(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}
