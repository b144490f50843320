//! Core traits - the venue capability interface

use async_trait::async_trait;

use crate::core::{Result, types::*};

/// Capability interface every venue adapter implements.
///
/// One live instance exists per enabled venue and is shared across every
/// in-flight call, so implementations must tolerate concurrent use.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Venue name this instance was built for (the config `name`, not its type)
    fn name(&self) -> &str;

    /// Best bid/ask snapshot
    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker>;

    /// Account balances
    async fn get_balance(&self) -> Result<Vec<Balance>>;

    /// Orders matching the query
    async fn get_orders(&self, query: &OrderQuery) -> Result<Vec<Order>>;

    /// Historical candles
    async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>>;

    /// Place an order
    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse>;

    /// Cancel an order
    async fn cancel_order(&self, request: &CancelRequest) -> Result<()>;

    /// Lightweight connectivity probe. Defaults to a ticker fetch.
    async fn ping(&self, probe: &Symbol) -> Result<()> {
        self.get_ticker(probe).await.map(|_| ())
    }
}
