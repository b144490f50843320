//! Core types - venue-agnostic values passed through the adapter interface

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Tradeable symbol (e.g., "BTC/USDT")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into().to_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Base and quote assets, split on '/', '-' or '_'.
    pub fn split(&self) -> Option<(&str, &str)> {
        self.0
            .split_once(['/', '-', '_'])
            .filter(|(base, quote)| !base.is_empty() && !quote.is_empty())
    }

    /// Venue symbol with the separator replaced, e.g. "BTC-USDT" or "BTCUSDT".
    pub fn joined(&self, sep: &str) -> String {
        match self.split() {
            Some((base, quote)) => format!("{base}{sep}{quote}"),
            None => self.0.clone(),
        }
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Symbol {
    fn from(s: &str) -> Self {
        Symbol::new(s)
    }
}

impl From<String> for Symbol {
    fn from(s: String) -> Self {
        Symbol::new(s)
    }
}

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

impl std::fmt::Display for OrderType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Order status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_open(self) -> bool {
        matches!(self, OrderStatus::Pending | OrderStatus::Open | OrderStatus::PartiallyFilled)
    }
}

/// Ticker/Market data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ticker {
    pub symbol: Symbol,
    pub bid: Decimal,
    pub ask: Decimal,
    pub last: Decimal,
    pub volume_24h: Decimal,
    pub timestamp: DateTime<Utc>,
}

impl Ticker {
    /// Reference price for an order on `side`: the ask for buys, the bid for
    /// sells. `None` when the venue quoted nothing usable on that side.
    pub fn price_for(&self, side: Side) -> Option<Decimal> {
        let price = match side {
            Side::Buy => self.ask,
            Side::Sell => self.bid,
        };
        (price > Decimal::ZERO).then_some(price)
    }
}

/// Account balance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

impl Balance {
    pub fn total(&self) -> Decimal {
        self.free + self.locked
    }
}

/// Order as reported by a venue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub created_at: DateTime<Utc>,
}

/// OHLCV candle
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Kline {
    pub open_time: DateTime<Utc>,
    pub open: Decimal,
    pub high: Decimal,
    pub low: Decimal,
    pub close: Decimal,
    pub volume: Decimal,
}

/// Order request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: Symbol,
    pub side: Side,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
}

impl OrderRequest {
    pub fn market(symbol: impl Into<Symbol>, side: Side, quantity: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Market,
            quantity,
            price: None,
        }
    }

    pub fn limit(symbol: impl Into<Symbol>, side: Side, quantity: Decimal, price: Decimal) -> Self {
        Self {
            symbol: symbol.into(),
            side,
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        }
    }

    /// Same order with a different quantity.
    pub fn with_quantity(&self, quantity: Decimal) -> Self {
        Self {
            quantity,
            ..self.clone()
        }
    }
}

/// Cancel request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CancelRequest {
    pub symbol: Symbol,
    pub order_id: String,
}

/// Order response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub symbol: Symbol,
    pub side: Side,
    pub status: OrderStatus,
    pub filled_quantity: Decimal,
    pub filled_price: Option<Decimal>,
    pub created_at: DateTime<Utc>,
}

/// Filter for `get_orders`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OrderQuery {
    pub symbol: Option<Symbol>,
    pub status: Option<OrderStatus>,
}

/// Candle query for `get_klines`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KlineQuery {
    pub symbol: Symbol,
    /// Venue-agnostic interval tag: "1m", "5m", "1h", "1d", ...
    pub interval: String,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    pub limit: Option<u32>,
}

impl KlineQuery {
    pub fn new(symbol: impl Into<Symbol>, interval: impl Into<String>) -> Self {
        Self {
            symbol: symbol.into(),
            interval: interval.into(),
            start: None,
            end: None,
            limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_symbol_normalization() {
        let sym = Symbol::new("btc/usdt");
        assert_eq!(sym.as_str(), "BTC/USDT");
        assert_eq!(sym.split(), Some(("BTC", "USDT")));
        assert_eq!(sym.joined(""), "BTCUSDT");
        assert_eq!(sym.joined("-"), "BTC-USDT");
        assert_eq!(Symbol::new("BTCUSDT").joined("-"), "BTCUSDT");
    }

    #[test]
    fn test_ticker_price_for_side() {
        let ticker = Ticker {
            symbol: Symbol::new("ETH/USDT"),
            bid: dec!(0),
            ask: dec!(2001.5),
            last: dec!(2001),
            volume_24h: dec!(10),
            timestamp: Utc::now(),
        };
        assert_eq!(ticker.price_for(Side::Buy), Some(dec!(2001.5)));
        assert_eq!(ticker.price_for(Side::Sell), None);
    }
}
