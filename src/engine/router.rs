//! Order Router - best-execution venue selection and order splitting

use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use tracing::{info, warn};

use crate::core::{Error, OrderRequest, OrderResponse, Result, Side};
use crate::engine::dispatcher::{ExecutionDispatcher, ExecutionRequest, Operation};

/// Venue chosen for a best-price order and what it returned.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BestPriceFill {
    pub venue: String,
    /// Ask (buy) or bid (sell) that won the selection
    pub reference_price: Decimal,
    pub order: OrderResponse,
}

/// Per-venue outcome of a split order. Partial fills are reported, never
/// rolled back.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SplitExecution {
    pub legs: BTreeMap<String, std::result::Result<OrderResponse, String>>,
    pub success_rate: f64,
}

impl SplitExecution {
    pub fn is_complete(&self) -> bool {
        self.legs.values().all(|leg| leg.is_ok())
    }

    pub fn filled_quantity(&self) -> Decimal {
        self.legs
            .values()
            .filter_map(|leg| leg.as_ref().ok())
            .map(|order| order.filled_quantity)
            .sum()
    }
}

pub struct OrderRouter {
    dispatcher: Arc<ExecutionDispatcher>,
}

impl OrderRouter {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Quote every candidate, then place the whole order on the venue with
    /// the lowest ask (buy) or highest bid (sell). Ties go to the earliest
    /// candidate.
    pub async fn place_best_price(
        &self,
        order: &OrderRequest,
        candidates: &[String],
    ) -> Result<BestPriceFill> {
        let quotes = self
            .dispatcher
            .fan_out(candidates, Operation::GetTicker(order.symbol.clone()))
            .await;

        let mut best: Option<(&str, Decimal)> = None;
        for venue in candidates {
            let Some(price) = quotes
                .success_for(venue)
                .and_then(|resp| resp.ticker())
                .and_then(|ticker| ticker.price_for(order.side))
            else {
                continue;
            };
            let better = match (best, order.side) {
                (None, _) => true,
                (Some((_, current)), Side::Buy) => price < current,
                (Some((_, current)), Side::Sell) => price > current,
            };
            if better {
                best = Some((venue.as_str(), price));
            }
        }

        let (venue, reference_price) = best.ok_or_else(|| {
            Error::NoAvailableVenue(format!("no usable quote for {}", order.symbol))
        })?;
        info!("🎯 Best {} for {} on {} @ {}", order.side, order.symbol, venue, reference_price);

        let resp = self
            .dispatcher
            .execute_one(ExecutionRequest::new(venue, Operation::PlaceOrder(order.clone())))
            .await;
        match resp.order() {
            Some(placed) => Ok(BestPriceFill {
                venue: venue.to_string(),
                reference_price,
                order: placed.clone(),
            }),
            None => Err(Error::Adapter(format!("{}: {}", venue, resp.error_text()))),
        }
    }

    /// Place `order` on each venue with its allocated quantity, concurrently.
    pub async fn place_split(
        &self,
        order: &OrderRequest,
        venues: &[String],
        amounts: &[Decimal],
    ) -> Result<SplitExecution> {
        if venues.is_empty() {
            return Err(Error::InvalidRequest("split needs at least one venue".into()));
        }
        if venues.len() != amounts.len() {
            return Err(Error::InvalidRequest(format!(
                "{} venues but {} amounts",
                venues.len(),
                amounts.len()
            )));
        }
        let mut seen = HashSet::new();
        if let Some(dup) = venues.iter().find(|v| !seen.insert(v.as_str())) {
            return Err(Error::InvalidRequest(format!("venue {dup} listed twice")));
        }
        if let Some(amount) = amounts.iter().find(|a| **a <= Decimal::ZERO) {
            return Err(Error::InvalidRequest(format!("split amount {amount} must be positive")));
        }

        let requests = venues
            .iter()
            .zip(amounts)
            .map(|(venue, amount)| {
                ExecutionRequest::new(venue.clone(), Operation::PlaceOrder(order.with_quantity(*amount)))
            })
            .collect();
        let batch = self.dispatcher.execute(requests).await;

        let mut legs = BTreeMap::new();
        for resp in batch.successful.iter().chain(batch.failed.iter()) {
            let leg = match resp.order() {
                Some(placed) => Ok(placed.clone()),
                None => Err(resp.error_text().to_string()),
            };
            legs.insert(resp.venue.clone(), leg);
        }
        let split = SplitExecution {
            legs,
            success_rate: batch.success_rate(),
        };
        if !split.is_complete() {
            warn!(
                "⚠️ Split {} {} partially placed ({:.0}% of legs)",
                order.side,
                order.symbol,
                split.success_rate * 100.0
            );
        }
        Ok(split)
    }
}
