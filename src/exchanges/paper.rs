//! Paper exchange - in-memory simulated venue
//!
//! Quotes come from `set_ticker`; market orders fill immediately at the
//! quoted ask (buys) or bid (sells). Balances are tracked as net positions
//! and are allowed to go negative, the venue is never funded.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use rust_decimal::Decimal;
use std::collections::HashMap;
use tracing::debug;

use crate::core::{
    Balance, CancelRequest, Error, ExchangeAdapter, ExchangeConfig, Kline, KlineQuery, Order,
    OrderQuery, OrderRequest, OrderResponse, OrderStatus, OrderType, Result, Side, Symbol, Ticker,
};

pub struct PaperExchange {
    name: String,
    tickers: RwLock<HashMap<Symbol, Ticker>>,
    balances: RwLock<HashMap<String, Decimal>>,
    orders: RwLock<Vec<Order>>,
}

impl PaperExchange {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tickers: RwLock::new(HashMap::new()),
            balances: RwLock::new(HashMap::new()),
            orders: RwLock::new(Vec::new()),
        }
    }

    pub fn from_config(config: &ExchangeConfig) -> Self {
        Self::new(config.name.clone())
    }

    /// Set the quote for a symbol.
    pub fn set_ticker(&self, symbol: impl Into<Symbol>, bid: Decimal, ask: Decimal) {
        let symbol = symbol.into();
        let ticker = Ticker {
            symbol: symbol.clone(),
            bid,
            ask,
            last: bid.checked_add(ask).map_or(ask, |sum| sum / Decimal::TWO),
            volume_24h: Decimal::ZERO,
            timestamp: Utc::now(),
        };
        self.tickers.write().insert(symbol, ticker);
    }

    pub fn deposit(&self, asset: &str, amount: Decimal) {
        *self.balances.write().entry(asset.to_uppercase()).or_default() += amount;
    }

    fn settle(&self, symbol: &Symbol, side: Side, quantity: Decimal, price: Decimal) -> Result<()> {
        let (base, quote) = symbol
            .split()
            .ok_or_else(|| Error::Adapter(format!("{}: cannot settle {}", self.name, symbol)))?;
        let overflow = || Error::Adapter(format!("{}: {} settlement overflows", self.name, symbol));
        let notional = quantity.checked_mul(price).ok_or_else(overflow)?;
        let (base_delta, quote_delta) = match side {
            Side::Buy => (quantity, -notional),
            Side::Sell => (-quantity, notional),
        };

        let mut balances = self.balances.write();
        let base_total = balances
            .get(base)
            .copied()
            .unwrap_or_default()
            .checked_add(base_delta)
            .ok_or_else(overflow)?;
        let quote_total = balances
            .get(quote)
            .copied()
            .unwrap_or_default()
            .checked_add(quote_delta)
            .ok_or_else(overflow)?;
        balances.insert(base.to_string(), base_total);
        balances.insert(quote.to_string(), quote_total);
        Ok(())
    }
}

#[async_trait]
impl ExchangeAdapter for PaperExchange {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker> {
        self.tickers
            .read()
            .get(symbol)
            .cloned()
            .ok_or_else(|| Error::Adapter(format!("{}: no quote for {}", self.name, symbol)))
    }

    async fn get_balance(&self) -> Result<Vec<Balance>> {
        let mut balances: Vec<Balance> = self
            .balances
            .read()
            .iter()
            .map(|(asset, free)| Balance {
                asset: asset.clone(),
                free: *free,
                locked: Decimal::ZERO,
            })
            .collect();
        balances.sort_by(|a, b| a.asset.cmp(&b.asset));
        Ok(balances)
    }

    async fn get_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        Ok(self
            .orders
            .read()
            .iter()
            .filter(|o| query.symbol.as_ref().is_none_or(|s| &o.symbol == s))
            .filter(|o| query.status.is_none_or(|s| o.status == s))
            .cloned()
            .collect())
    }

    async fn get_klines(&self, _query: &KlineQuery) -> Result<Vec<Kline>> {
        // No history is simulated.
        Ok(vec![])
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        if order.quantity <= Decimal::ZERO {
            return Err(Error::Adapter(format!("{}: quantity must be positive", self.name)));
        }
        if order.symbol.split().is_none() {
            return Err(Error::Adapter(format!(
                "{}: symbol {} has no base/quote separator",
                self.name, order.symbol
            )));
        }
        let quote = self.get_ticker(&order.symbol).await?;
        let touch = quote
            .price_for(order.side)
            .ok_or_else(|| Error::Adapter(format!("{}: empty book for {}", self.name, order.symbol)))?;

        let fill_price = match (order.order_type, order.price) {
            (OrderType::Market, _) => Some(touch),
            (OrderType::Limit, Some(limit)) => {
                let crosses = match order.side {
                    Side::Buy => limit >= touch,
                    Side::Sell => limit <= touch,
                };
                crosses.then_some(touch)
            }
            (OrderType::Limit, None) => {
                return Err(Error::Adapter(format!("{}: limit order without price", self.name)));
            }
        };

        let now = Utc::now();
        let (status, filled_quantity) = match fill_price {
            Some(price) => {
                self.settle(&order.symbol, order.side, order.quantity, price)?;
                (OrderStatus::Filled, order.quantity)
            }
            None => (OrderStatus::Open, Decimal::ZERO),
        };
        let order_id = format!("paper_{}", uuid::Uuid::new_v4());
        self.orders.write().push(Order {
            id: order_id.clone(),
            symbol: order.symbol.clone(),
            side: order.side,
            order_type: order.order_type,
            quantity: order.quantity,
            price: order.price.or(fill_price),
            status,
            filled_quantity,
            created_at: now,
        });
        debug!("📝 {} {} {} {} -> {:?}", self.name, order.side, order.quantity, order.symbol, status);

        Ok(OrderResponse {
            order_id,
            symbol: order.symbol.clone(),
            side: order.side,
            status,
            filled_quantity,
            filled_price: fill_price,
            created_at: now,
        })
    }

    async fn cancel_order(&self, request: &CancelRequest) -> Result<()> {
        let mut orders = self.orders.write();
        let order = orders
            .iter_mut()
            .find(|o| o.id == request.order_id && o.symbol == request.symbol)
            .ok_or_else(|| Error::Adapter(format!("{}: unknown order {}", self.name, request.order_id)))?;
        if !order.status.is_open() {
            return Err(Error::Adapter(format!(
                "{}: order {} is already {:?}",
                self.name, order.id, order.status
            )));
        }
        order.status = OrderStatus::Cancelled;
        Ok(())
    }

    async fn ping(&self, _probe: &Symbol) -> Result<()> {
        Ok(())
    }
}
