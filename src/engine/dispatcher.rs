//! Execution Dispatcher - bounded concurrent fan-out to venue adapters
//!
//! A batch is sorted by priority (stable), then each request is spawned as
//! its own task once it holds one of the shared concurrency slots. Slots are
//! handed out in dispatch order, so an oversized batch queues instead of
//! dropping work. Every request carries its own timeout; a timeout or adapter
//! error becomes a failed [`ExecutionResponse`] and never affects siblings.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::core::{
    Balance, CancelRequest, Error, ExchangeAdapter, Kline, KlineQuery, Order, OrderQuery,
    OrderRequest, OrderResponse, Result, Symbol, Ticker,
};
use crate::engine::health::HealthMonitor;
use crate::engine::registry::ExchangeRegistry;

pub const DEFAULT_PRIORITY: u8 = 5;

/// One adapter call together with its parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    GetTicker(Symbol),
    GetBalance,
    GetOrders(OrderQuery),
    GetKlines(KlineQuery),
    PlaceOrder(OrderRequest),
    CancelOrder(CancelRequest),
    /// Connectivity check; carries the symbol used by ticker-based probes.
    Probe(Symbol),
}

impl Operation {
    /// Stable name, used in responses and as the statistics key.
    pub fn name(&self) -> &'static str {
        match self {
            Operation::GetTicker(_) => "get_ticker",
            Operation::GetBalance => "get_balance",
            Operation::GetOrders(_) => "get_orders",
            Operation::GetKlines(_) => "get_klines",
            Operation::PlaceOrder(_) => "place_order",
            Operation::CancelOrder(_) => "cancel_order",
            Operation::Probe(_) => "probe",
        }
    }

    async fn invoke(&self, adapter: &dyn ExchangeAdapter) -> Result<Payload> {
        Ok(match self {
            Operation::GetTicker(symbol) => Payload::Ticker(adapter.get_ticker(symbol).await?),
            Operation::GetBalance => Payload::Balances(adapter.get_balance().await?),
            Operation::GetOrders(query) => Payload::Orders(adapter.get_orders(query).await?),
            Operation::GetKlines(query) => Payload::Klines(adapter.get_klines(query).await?),
            Operation::PlaceOrder(order) => Payload::Order(adapter.place_order(order).await?),
            Operation::CancelOrder(request) => {
                adapter.cancel_order(request).await?;
                Payload::Cancelled
            }
            Operation::Probe(symbol) => {
                adapter.ping(symbol).await?;
                Payload::Pong
            }
        })
    }
}

/// Successful call result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Payload {
    Ticker(Ticker),
    Balances(Vec<Balance>),
    Orders(Vec<Order>),
    Klines(Vec<Kline>),
    Order(OrderResponse),
    Cancelled,
    Pong,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionRequest {
    pub venue: String,
    pub operation: Operation,
    /// Falls back to the engine-wide default when `None`.
    pub timeout: Option<Duration>,
    /// Lower runs first
    pub priority: u8,
}

impl ExecutionRequest {
    pub fn new(venue: impl Into<String>, operation: Operation) -> Self {
        Self {
            venue: venue.into(),
            operation,
            timeout: None,
            priority: DEFAULT_PRIORITY,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResponse {
    pub venue: String,
    pub operation: String,
    pub success: bool,
    pub payload: Option<Payload>,
    pub error: Option<String>,
    pub response_time_ms: f64,
    pub timestamp: DateTime<Utc>,
}

impl ExecutionResponse {
    fn ok(venue: &str, operation: &str, payload: Payload, response_time_ms: f64) -> Self {
        Self {
            venue: venue.to_string(),
            operation: operation.to_string(),
            success: true,
            payload: Some(payload),
            error: None,
            response_time_ms,
            timestamp: Utc::now(),
        }
    }

    fn failed(venue: &str, operation: &str, error: impl Into<String>, response_time_ms: f64) -> Self {
        Self {
            venue: venue.to_string(),
            operation: operation.to_string(),
            success: false,
            payload: None,
            error: Some(error.into()),
            response_time_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn ticker(&self) -> Option<&Ticker> {
        match &self.payload {
            Some(Payload::Ticker(t)) => Some(t),
            _ => None,
        }
    }

    pub fn order(&self) -> Option<&OrderResponse> {
        match &self.payload {
            Some(Payload::Order(o)) => Some(o),
            _ => None,
        }
    }

    pub fn error_text(&self) -> &str {
        self.error.as_deref().unwrap_or("unknown error")
    }
}

/// Fan-in of one batch
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParallelResult {
    pub successful: Vec<ExecutionResponse>,
    pub failed: Vec<ExecutionResponse>,
    pub total_time_ms: f64,
}

impl ParallelResult {
    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }

    pub fn success_rate(&self) -> f64 {
        match self.total() {
            0 => 0.0,
            n => self.successful.len() as f64 / n as f64,
        }
    }

    /// Successful response from `venue`, if any.
    pub fn success_for(&self, venue: &str) -> Option<&ExecutionResponse> {
        self.successful.iter().find(|r| r.venue == venue)
    }

    /// Any response from `venue`.
    pub fn response_for(&self, venue: &str) -> Option<&ExecutionResponse> {
        self.successful
            .iter()
            .chain(self.failed.iter())
            .find(|r| r.venue == venue)
    }
}

/// Rolling counters per venue + operation
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RequestStats {
    pub total_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub total_response_time_ms: f64,
    pub avg_response_time_ms: f64,
    pub success_rate: f64,
}

impl RequestStats {
    fn record(&mut self, success: bool, response_time_ms: f64) {
        self.total_requests += 1;
        if success {
            self.successful_requests += 1;
        } else {
            self.failed_requests += 1;
        }
        self.total_response_time_ms += response_time_ms;
        self.avg_response_time_ms = self.total_response_time_ms / self.total_requests as f64;
        self.success_rate = self.successful_requests as f64 / self.total_requests as f64;
    }
}

pub struct ExecutionDispatcher {
    registry: Arc<ExchangeRegistry>,
    health: Arc<HealthMonitor>,
    slots: Arc<Semaphore>,
    max_concurrent: usize,
    default_timeout: Duration,
    stats: RwLock<HashMap<String, RequestStats>>,
}

impl ExecutionDispatcher {
    pub fn new(
        registry: Arc<ExchangeRegistry>,
        health: Arc<HealthMonitor>,
        max_concurrent: usize,
        default_timeout: Duration,
    ) -> Self {
        let max_concurrent = max_concurrent.max(1);
        Self {
            registry,
            health,
            slots: Arc::new(Semaphore::new(max_concurrent)),
            max_concurrent,
            default_timeout,
            stats: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ExchangeRegistry> {
        &self.registry
    }

    pub fn max_concurrent(&self) -> usize {
        self.max_concurrent
    }

    /// Slots not currently held by an in-flight call.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Run a batch and wait for every request to finish or time out.
    pub async fn execute(&self, mut requests: Vec<ExecutionRequest>) -> ParallelResult {
        let started = Instant::now();
        let batch_size = requests.len();
        requests.sort_by_key(|r| r.priority);

        // (response, reached the adapter)
        let mut responses = Vec::with_capacity(batch_size);
        let mut in_flight = Vec::with_capacity(batch_size);
        for request in requests {
            let operation = request.operation.name();
            let Some(adapter) = self.registry.adapter(&request.venue) else {
                let error = Error::AdapterNotFound(request.venue.clone());
                responses.push((
                    ExecutionResponse::failed(&request.venue, operation, error.to_string(), 0.0),
                    false,
                ));
                continue;
            };
            let permit = match self.slots.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(e) => {
                    responses.push((
                        ExecutionResponse::failed(&request.venue, operation, e.to_string(), 0.0),
                        false,
                    ));
                    continue;
                }
            };
            let timeout = request.timeout.unwrap_or(self.default_timeout);
            let venue = request.venue.clone();
            let handle = tokio::spawn(async move {
                let _permit = permit;
                run_one(adapter, request, timeout).await
            });
            in_flight.push((venue, operation, handle));
        }

        let joined = join_all(in_flight.into_iter().map(|(venue, operation, handle)| async move {
            match handle.await {
                Ok(resp) => resp,
                Err(e) => ExecutionResponse::failed(&venue, operation, format!("task aborted: {e}"), 0.0),
            }
        }))
        .await;
        responses.extend(joined.into_iter().map(|resp| (resp, true)));

        let mut result = ParallelResult::default();
        for (resp, reached) in responses {
            self.observe(&resp, reached);
            if resp.success {
                result.successful.push(resp);
            } else {
                warn!("❌ {}:{} failed: {}", resp.venue, resp.operation, resp.error_text());
                result.failed.push(resp);
            }
        }
        result.total_time_ms = started.elapsed().as_secs_f64() * 1000.0;
        debug!(
            "📦 Batch of {} done in {:.1}ms ({} ok, {} failed)",
            batch_size,
            result.total_time_ms,
            result.successful.len(),
            result.failed.len()
        );
        result
    }

    /// Single request through the same path as a batch.
    pub async fn execute_one(&self, request: ExecutionRequest) -> ExecutionResponse {
        let venue = request.venue.clone();
        let operation = request.operation.name();
        let mut batch = self.execute(vec![request]).await;
        batch
            .successful
            .pop()
            .or_else(|| batch.failed.pop())
            .unwrap_or_else(|| ExecutionResponse::failed(&venue, operation, "no response", 0.0))
    }

    /// Same operation against every venue in `venues`.
    pub async fn fan_out(&self, venues: &[String], operation: Operation) -> ParallelResult {
        let requests = venues
            .iter()
            .map(|venue| ExecutionRequest::new(venue.clone(), operation.clone()))
            .collect();
        self.execute(requests).await
    }

    /// Stats always; health only when the call reached an adapter.
    fn observe(&self, resp: &ExecutionResponse, reached: bool) {
        self.stats
            .write()
            .entry(format!("{}:{}", resp.venue, resp.operation))
            .or_default()
            .record(resp.success, resp.response_time_ms);

        if !reached {
            return;
        }
        if resp.success {
            self.health.record_success(&resp.venue, resp.response_time_ms);
        } else {
            self.health
                .record_failure(&resp.venue, resp.error_text(), resp.response_time_ms);
        }
    }

    /// Snapshot keyed `"<venue>:<operation>"`.
    pub fn stats(&self) -> HashMap<String, RequestStats> {
        self.stats.read().clone()
    }

    pub fn reset_stats(&self) {
        self.stats.write().clear();
    }
}

async fn run_one(
    adapter: Arc<dyn ExchangeAdapter>,
    request: ExecutionRequest,
    timeout: Duration,
) -> ExecutionResponse {
    let started = Instant::now();
    let outcome = tokio::time::timeout(timeout, request.operation.invoke(adapter.as_ref())).await;
    let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;
    let operation = request.operation.name();
    match outcome {
        Ok(Ok(payload)) => ExecutionResponse::ok(&request.venue, operation, payload, elapsed_ms),
        Ok(Err(e)) => ExecutionResponse::failed(&request.venue, operation, e.to_string(), elapsed_ms),
        Err(_) => ExecutionResponse::failed(
            &request.venue,
            operation,
            Error::Timeout(timeout).to_string(),
            elapsed_ms,
        ),
    }
}
