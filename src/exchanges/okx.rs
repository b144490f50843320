//! OKX v5 spot REST adapter

use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use reqwest::Method;
use rust_decimal::Decimal;
use serde_json::{Value, json};
use sha2::Sha256;
use tracing::info;

use crate::core::{
    Balance, CancelRequest, Error, ExchangeAdapter, ExchangeConfig, Kline, KlineQuery, Order,
    OrderQuery, OrderRequest, OrderResponse, OrderStatus, OrderType, Result, Side, Symbol, Ticker,
};

type HmacSha256 = Hmac<Sha256>;

/// OKX exchange adapter
pub struct Okx {
    name: String,
    api_key: Option<String>,
    api_secret: Option<String>,
    passphrase: Option<String>,
    simulated: bool,
    base_url: String,
    client: reqwest::Client,
}

impl Okx {
    pub fn new(config: &ExchangeConfig) -> Self {
        Self {
            name: config.name.clone(),
            api_key: config.api_key.clone(),
            api_secret: config.api_secret.clone(),
            passphrase: config.passphrase.clone(),
            // OKX demo trading shares the production host.
            simulated: config.sandbox,
            base_url: "https://www.okx.com".to_string(),
            client: reqwest::Client::new(),
        }
    }

    /// base64(HMAC-SHA256(secret, timestamp + method + path + body))
    fn sign(secret: &str, timestamp: &str, method: &Method, path: &str, body: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|e| Error::Config(format!("bad api secret: {e}")))?;
        mac.update(format!("{timestamp}{}{path}{body}", method.as_str()).as_bytes());
        Ok(BASE64.encode(mac.finalize().into_bytes()))
    }

    async fn public(&self, path: &str) -> Result<Value> {
        let request = self.client.get(format!("{}{}", self.base_url, path));
        self.send(request).await
    }

    async fn private(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        let (Some(key), Some(secret), Some(passphrase)) =
            (&self.api_key, &self.api_secret, &self.passphrase)
        else {
            return Err(Error::Config(format!("{}: missing API credentials", self.name)));
        };
        let body = body.map(|b| b.to_string()).unwrap_or_default();
        let timestamp = Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string();
        let signature = Self::sign(secret, &timestamp, &method, path, &body)?;

        let mut request = self
            .client
            .request(method, format!("{}{}", self.base_url, path))
            .header("OK-ACCESS-KEY", key)
            .header("OK-ACCESS-SIGN", signature)
            .header("OK-ACCESS-TIMESTAMP", timestamp)
            .header("OK-ACCESS-PASSPHRASE", passphrase)
            .header("Content-Type", "application/json");
        if self.simulated {
            request = request.header("x-simulated-trading", "1");
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        self.send(request).await
    }

    /// Unwraps the `{code, msg, data}` envelope.
    async fn send(&self, request: reqwest::RequestBuilder) -> Result<Value> {
        let resp = request.send().await?.json::<Value>().await?;
        if resp["code"].as_str() != Some("0") {
            return Err(Error::Adapter(format!(
                "{}: code={} msg={}",
                self.name,
                resp["code"],
                resp["msg"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(resp["data"].clone())
    }
}

fn dec(v: &Value) -> Decimal {
    v.as_str()
        .filter(|s| !s.is_empty())
        .and_then(|s| s.parse().ok())
        .unwrap_or(Decimal::ZERO)
}

fn millis(v: &Value) -> DateTime<Utc> {
    v.as_str()
        .and_then(|s| s.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now)
}

/// "1h" -> "1H", "1d" -> "1D"; minutes stay lower-case.
fn bar(interval: &str) -> String {
    match interval.chars().last() {
        Some('h' | 'd' | 'w') => interval.to_uppercase(),
        _ => interval.to_string(),
    }
}

fn parse_status(s: &str) -> OrderStatus {
    match s {
        "live" => OrderStatus::Open,
        "partially_filled" => OrderStatus::PartiallyFilled,
        "filled" => OrderStatus::Filled,
        "canceled" | "mmp_canceled" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn parse_order(v: &Value) -> Order {
    let price = dec(&v["px"]);
    Order {
        id: v["ordId"].as_str().unwrap_or_default().to_string(),
        symbol: Symbol::new(v["instId"].as_str().unwrap_or_default().replace('-', "/")),
        side: if v["side"] == "sell" { Side::Sell } else { Side::Buy },
        order_type: if v["ordType"] == "market" { OrderType::Market } else { OrderType::Limit },
        quantity: dec(&v["sz"]),
        price: (price > Decimal::ZERO).then_some(price),
        status: parse_status(v["state"].as_str().unwrap_or("")),
        filled_quantity: dec(&v["accFillSz"]),
        created_at: millis(&v["cTime"]),
    }
}

#[async_trait]
impl ExchangeAdapter for Okx {
    fn name(&self) -> &str {
        &self.name
    }

    async fn get_ticker(&self, symbol: &Symbol) -> Result<Ticker> {
        let data = self
            .public(&format!("/api/v5/market/ticker?instId={}", symbol.joined("-")))
            .await?;
        let t = data
            .get(0)
            .ok_or_else(|| Error::Adapter(format!("{}: empty ticker for {}", self.name, symbol)))?;
        Ok(Ticker {
            symbol: symbol.clone(),
            bid: dec(&t["bidPx"]),
            ask: dec(&t["askPx"]),
            last: dec(&t["last"]),
            volume_24h: dec(&t["vol24h"]),
            timestamp: millis(&t["ts"]),
        })
    }

    async fn get_balance(&self) -> Result<Vec<Balance>> {
        let data = self.private(Method::GET, "/api/v5/account/balance", None).await?;
        Ok(data[0]["details"]
            .as_array()
            .map(|details| {
                details
                    .iter()
                    .map(|d| Balance {
                        asset: d["ccy"].as_str().unwrap_or_default().to_string(),
                        free: dec(&d["availBal"]),
                        locked: dec(&d["frozenBal"]),
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_orders(&self, query: &OrderQuery) -> Result<Vec<Order>> {
        let endpoint = if query.status.is_none_or(OrderStatus::is_open) {
            "/api/v5/trade/orders-pending"
        } else {
            "/api/v5/trade/orders-history"
        };
        let mut path = format!("{endpoint}?instType=SPOT");
        if let Some(symbol) = &query.symbol {
            path.push_str(&format!("&instId={}", symbol.joined("-")));
        }
        let data = self.private(Method::GET, &path, None).await?;
        Ok(data
            .as_array()
            .map(|arr| {
                arr.iter()
                    .map(parse_order)
                    .filter(|o| query.status.is_none_or(|s| o.status == s))
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn get_klines(&self, query: &KlineQuery) -> Result<Vec<Kline>> {
        let mut path = format!(
            "/api/v5/market/candles?instId={}&bar={}",
            query.symbol.joined("-"),
            bar(&query.interval)
        );
        // OKX paginates backwards: `after` bounds the newest row, `before` the oldest.
        if let Some(end) = query.end {
            path.push_str(&format!("&after={}", end.timestamp_millis()));
        }
        if let Some(start) = query.start {
            path.push_str(&format!("&before={}", start.timestamp_millis()));
        }
        if let Some(limit) = query.limit {
            path.push_str(&format!("&limit={limit}"));
        }
        let data = self.public(&path).await?;
        let mut klines: Vec<Kline> = data
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
            .unwrap_or_default();
        klines.sort_by_key(|k| k.open_time);
        Ok(klines)
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderResponse> {
        let mut body = json!({
            "instId": order.symbol.joined("-"),
            "tdMode": "cash",
            "side": if order.side == Side::Buy { "buy" } else { "sell" },
            "ordType": if order.order_type == OrderType::Market { "market" } else { "limit" },
            "sz": order.quantity.normalize().to_string(),
            "tgtCcy": "base_ccy",
        });
        if order.order_type == OrderType::Limit {
            let price = order
                .price
                .ok_or_else(|| Error::InvalidRequest(format!("{}: limit order without price", self.name)))?;
            body["px"] = json!(price.normalize().to_string());
        }

        info!("📤 {} placing {} {} {} @ {:?}", self.name, order.side, order.quantity, order.symbol, order.price);
        let data = self.private(Method::POST, "/api/v5/trade/order", Some(body)).await?;
        let ack = &data[0];
        if ack["sCode"].as_str() != Some("0") {
            return Err(Error::Adapter(format!(
                "{}: order rejected: {}",
                self.name,
                ack["sMsg"].as_str().unwrap_or("unknown")
            )));
        }
        Ok(OrderResponse {
            order_id: ack["ordId"].as_str().unwrap_or_default().to_string(),
            symbol: order.symbol.clone(),
            side: order.side,
            // Fill details arrive later via order queries.
            status: OrderStatus::Pending,
            filled_quantity: Decimal::ZERO,
            filled_price: None,
            created_at: millis(&ack["ts"]),
        })
    }

    async fn cancel_order(&self, request: &CancelRequest) -> Result<()> {
        let body = json!({
            "instId": request.symbol.joined("-"),
            "ordId": request.order_id,
        });
        let data = self
            .private(Method::POST, "/api/v5/trade/cancel-order", Some(body))
            .await?;
        match data[0]["sCode"].as_str() {
            Some("0") => Ok(()),
            _ => Err(Error::Adapter(format!(
                "{}: cancel rejected: {}",
                self.name,
                data[0]["sMsg"].as_str().unwrap_or("unknown")
            ))),
        }
    }

    async fn ping(&self, _probe: &Symbol) -> Result<()> {
        self.public("/api/v5/public/time").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_bar_mapping() {
        assert_eq!(bar("1m"), "1m");
        assert_eq!(bar("4h"), "4H");
        assert_eq!(bar("1d"), "1D");
    }

    #[test]
    fn test_signature_is_deterministic_base64() {
        let a = Okx::sign("secret", "2020-12-08T09:08:57.715Z", &Method::GET, "/api/v5/account/balance", "").unwrap();
        let b = Okx::sign("secret", "2020-12-08T09:08:57.715Z", &Method::GET, "/api/v5/account/balance", "").unwrap();
        assert_eq!(a, b);
        // 32-byte digest -> 44 base64 chars
        assert_eq!(a.len(), 44);
        assert_ne!(a, Okx::sign("secret", "2020-12-08T09:08:57.715Z", &Method::POST, "/api/v5/account/balance", "").unwrap());
    }

    #[test]
    fn test_parse_order_payload() {
        let raw = json!({
            "instId": "BTC-USDT",
            "ordId": "312269865356374016",
            "px": "",
            "sz": "0.01",
            "accFillSz": "0.01",
            "ordType": "market",
            "side": "buy",
            "state": "filled",
            "cTime": "1597026383085"
        });
        let order = parse_order(&raw);
        assert_eq!(order.symbol, Symbol::new("BTC/USDT"));
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.price, None);
        assert_eq!(order.filled_quantity, dec!(0.01));
    }
}
