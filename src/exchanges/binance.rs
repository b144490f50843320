//! Binance spot REST adapter

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use tracing::{debug, info};

use crate::core::{
    Balance, CancelRequest, Error, ExchangeAdapter, ExchangeConfig, Kline, KlineQuery, Order,
    OrderQuery, OrderRequest, OrderResponse, OrderStatus, OrderType, Result, Side, Symbol, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

const RECV_WINDOW_MS: u64 = 5_000;

/// Binance exchange adapter
pub struct Binance {
    name: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    rest_url: String,
    client: reqwest::Client,
}

impl Binance {
    pub fn new(config: &ExchangeConfig) -> Self {
        let rest_url = if config.sandbox {
            "https://testnet.binance.vision/api"
        } else {
            "https://api.binance.com/api"
        };
        Self {
            name: config.name.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            rest_url: rest_url.to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// Sign request with HMAC SHA256
    fn sign(&self, secret: &str, query: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::Config(format!("{}: bad api secret: {}", self.name, e)))?;
        mac.update(query.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    async fn public(&self, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let url = format!("{}{}", self.rest_url, path);
        let request = self.client.get(&url).query(params);
        self.send(request).await
    }

    async fn signed(&self, method: Method, path: &str, params: &[(&str, String)]) -> Result<Value> {
        let (Some(key), Some(secret)) = (&self.api_key, &self.api_secret) else {
            return Err(Error::Config(format!("{}: missing API credentials", self.name)));
        };
        let mut query: Vec<String> = params.iter().map(|(k, v)| format!("{k}={v}")).collect();
        query.push(format!("recvWindow={RECV_WINDOW_MS}"));
        query.push(format!("timestamp={}", Utc::now().timestamp_millis()));
        let query = query.join("&");
        let signature = self.sign(secret, &query)?;

        let url = format!("{}{}?{}&signature={}", self.rest_url, path, query, signature);
        let request = self.client.request(method, &url).header("X-MBX-APIKEY", key);
        self.send(request).await
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let resp = request.send().await?;
        let status = resp.status();
        let body = resp.json::<Value>().await?;
        if !status.is_success() {
            return Err(Error::Adapter(format!(
                "{}: HTTP {} code={} msg={}",
                self.name,
                status.as_u16(),
                body["code"],
                body["msg"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(body)
    }
}

fn dec(v: &Value) -> Decimal {
    match v {
        Value::String(s) => s.parse().unwrap_or(Decimal::ZERO),
        Value::Number(n) => n.to_string().parse().unwrap_or(Decimal::ZERO),
        _ => Decimal::ZERO,
    }
}

fn millis(v: &Value) -> DateTime<Utc> {
    v.as_i64()
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "NEW" | "PENDING_CANCEL" => OrderStatus::Open,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "FILLED" => OrderStatus::Filled,
        "CANCELED" => OrderStatus::Cancelled,
        "REJECTED" => OrderStatus::Rejected,
        "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Expired,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(v: &Value, symbol: &Symbol) -> Order {
    let price = dec(&v["price"]);
    Order {
        id: v["orderId"].to_string(),
        symbol: symbol.clone(),
        side: if v["side"] == "SELL" { Side::Sell } else { Side::Buy },
        order_type: if v["type"] == "MARKET" { OrderType::Market } else { OrderType::Limit },
        quantity: dec(&v["origQty"]),
        price: (price > Decimal::ZERO).then_some(price),
        status: parse_status(v["status"].as_str().unwrap_or("")),
        filled_quantity: dec(&v["executedQty"]),
        created_at: millis(&v["time"]),
    }
}

#[async_trait]
impl ExchangeAdapter for Binance {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker> {
        let resp = self
            .public("/v3/ticker/24hr", &[("symbol", symbol.joined(""))])
            .await?;
        Ok(Ticker {
            symbol: symbol.clone(),
            bid: dec(&resp["bidPrice"]),
            ask: dec(&resp["askPrice"]),
            last: dec(&resp["lastPrice"]),
            volume_24h: dec(&resp["volume"]),
            timestamp: millis(&resp["closeTime"]),
        })
    }

    async fn get_balance(&self) -> Result<Vec<Balance>> {
        let resp = self.signed(Method::GET, "/v3/account", &[]).await?;
        Ok(resp["balances"]
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|b| Balance {
                        asset: b["asset"].as_str().unwrap_or_default().to_string(),
                        free: dec(&b["free"]),
                        locked: dec(&b["locked"]),
                    })
                    .filter(|b| b.total() > Decimal::ZERO)
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let open_only = query.status.is_none_or(OrderStatus::is_open);
        let resp = match (&query.symbol, open_only) {
            (symbol, true) => {
                let params: Vec<(&str, String)> =
                    symbol.iter().map(|s| ("symbol", s.joined(""))).collect();
                self.signed(Method::GET, "/v3/openOrders", &params).await?
            }
            (Some(symbol), false) => {
                self.signed(Method::GET, "/v3/allOrders", &[("symbol", symbol.joined(""))])
                    .await?
            }
            (None, false) => {
                return Err(Error::InvalidRequest(format!(
                    "{}: order history requires a symbol",
                    self.name
                )));
            }
        };
        let orders = resp
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(|v| {
                        let symbol = query
                            .symbol
                            .clone()
                            .unwrap_or_else(|| Symbol::new(v["symbol"].as_str().unwrap_or_default()));
                        parse_order(v, &symbol)
                    })
                    .filter(|o| query.status.is_none_or(|s| o.status == s))
                    .collect()
            })
            .unwrap_or_default();
        Ok(orders)
    }

    async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>> {
        let mut params = vec![
            ("symbol", query.symbol.joined("")),
            ("interval", query.interval.clone()),
        ];
        if let Some(start) = query.start {
            params.push(("startTime", start.timestamp_millis().to_string()));
        }
        if let Some(end) = query.end {
            params.push(("endTime", end.timestamp_millis().to_string()));
        }
        if let Some(limit) = query.limit {
            params.push(("limit", limit.to_string()));
        }
        let resp = self.public("/v3/klines", &params).await?;
        Ok(resp
            .as_array()
            .map(|rows| {
                rows.iter()
                    .map(|r| Kline {
                        open_time: millis(&r[0]),
                        open: dec(&r[1]),
                        high: dec(&r[2]),
                        low: dec(&r[3]),
                        close: dec(&r[4]),
                        volume: dec(&r[5]),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        let mut params = vec![
            ("symbol", order.symbol.joined("")),
            ("side", order.side.to_string()),
            ("type", order.order_type.to_string()),
            ("quantity", order.quantity.normalize().to_string()),
            ("newOrderRespType", "FULL".to_string()),
        ];
        if order.order_type == OrderType::Limit {
            let price = order
                .price
                .ok_or_else(|| Error::InvalidRequest(format!("{}: limit order without price", self.name)))?;
            params.push(("price", price.normalize().to_string()));
            params.push(("timeInForce", "GTC".to_string()));
        }

        info!("📤 {} placing {} {} {} @ {:?}", self.name, order.side, order.quantity, order.symbol, order.price);
        let resp = self.signed(Method::POST, "/v3/order", &params).await?;

        let filled_quantity = dec(&resp["executedQty"]);
        let quote_filled = dec(&resp["cummulativeQuoteQty"]);
        let filled_price = (filled_quantity > Decimal::ZERO).then(|| quote_filled / filled_quantity);
        Ok(OrderResponse {
            order_id: resp["orderId"].to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            status: parse_status(resp["status"].as_str().unwrap_or("")),
            filled_quantity,
            filled_price,
            created_at: millis(&resp["transactTime"]),
        })
    }

    async fn cancel_order(&self, request: &CancelRequest) -> Result<()> {
        debug!("Cancelling order {} on {}", request.order_id, self.name);
        self.signed(
            Method::DELETE,
            "/v3/order",
            &[
                ("symbol", request.symbol.joined("")),
                ("orderId", request.order_id.clone()),
            ],
        )
        .await?;
        Ok(())
    }

    async fn ping(&self, _probe: &Symbol) -> Result<()> {
        self.public("/v3/ping", &[]).await.map(|_| ())
    }
}
