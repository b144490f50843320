//! Arbitrage - cross-venue spread detection and two-leg execution
//!
//! The two legs are placed concurrently and independently. When only one of
//! them fills the position is left open: nothing is unwound automatically,
//! the result says which leg filled and an operator reconciles it.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::core::{Error, OrderRequest, OrderResponse, Result, Side, Symbol, Ticker};
use crate::engine::dispatcher::{ExecutionDispatcher, ExecutionRequest, Operation};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageOpportunity {
    pub symbol: Symbol,
    pub buy_venue: String,
    pub sell_venue: String,
    pub buy_price: Decimal,
    pub sell_price: Decimal,
    /// (sell_price - buy_price) / buy_price
    pub profit_rate: Decimal,
    pub detected_at: DateTime<Utc>,
}

/// Every directed venue pair whose spread beats `min_profit`, best first.
///
/// `quotes` order decides pair generation order and therefore which of two
/// equally profitable pairs comes first.
pub fn scan_quotes(
    symbol: &Symbol,
    quotes: &[(String, Ticker)],
    min_profit: Decimal,
) -> Vec<ArbitrageOpportunity> {
    let now = Utc::now();
    let mut found = Vec::new();
    for (i, (buy_venue, buy)) in quotes.iter().enumerate() {
        for (j, (sell_venue, sell)) in quotes.iter().enumerate() {
            if i == j || buy.ask <= Decimal::ZERO || sell.bid <= Decimal::ZERO {
                continue;
            }
            // Quotes are external input; a spread that overflows is skipped.
            let Some(profit_rate) = sell
                .bid
                .checked_sub(buy.ask)
                .and_then(|spread| spread.checked_div(buy.ask))
            else {
                continue;
            };
            if profit_rate > min_profit {
                found.push(ArbitrageOpportunity {
                    symbol: symbol.clone(),
                    buy_venue: buy_venue.clone(),
                    sell_venue: sell_venue.clone(),
                    buy_price: buy.ask,
                    sell_price: sell.bid,
                    profit_rate,
                    detected_at: now,
                });
            }
        }
    }
    found.sort_by(|a, b| b.profit_rate.cmp(&a.profit_rate));
    found
}

pub struct ArbitrageScanner {
    dispatcher: Arc<ExecutionDispatcher>,
}

impl ArbitrageScanner {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Quote `symbol` on every enabled venue and rank the spreads.
    pub async fn find_opportunities(
        &self,
        symbol: &Symbol,
        min_profit: Decimal,
    ) -> Vec<ArbitrageOpportunity> {
        let venues = self.dispatcher.registry().enabled_venues();
        let batch = self
            .dispatcher
            .fan_out(&venues, Operation::GetTicker(symbol.clone()))
            .await;

        let quotes: Vec<(String, Ticker)> = venues
            .iter()
            .filter_map(|venue| {
                let ticker = batch.success_for(venue)?.ticker()?.clone();
                Some((venue.clone(), ticker))
            })
            .collect();

        let found = scan_quotes(symbol, &quotes, min_profit);
        if let Some(best) = found.first() {
            info!(
                "💰 {} opportunities on {}, best: buy {} @ {} / sell {} @ {} (rate {:.6})",
                found.len(),
                symbol,
                best.buy_venue,
                best.buy_price,
                best.sell_venue,
                best.sell_price,
                best.profit_rate
            );
        }
        found
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ArbitrageOutcome {
    Filled,
    /// Long exposure left on the buy venue
    BuyLegOnly,
    /// Short exposure left on the sell venue
    SellLegOnly,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrageExecution {
    pub opportunity: ArbitrageOpportunity,
    pub amount: Decimal,
    pub buy_result: Option<OrderResponse>,
    pub sell_result: Option<OrderResponse>,
    pub errors: Vec<String>,
}

impl ArbitrageExecution {
    pub fn success(&self) -> bool {
        self.outcome() == ArbitrageOutcome::Filled
    }

    pub fn outcome(&self) -> ArbitrageOutcome {
        match (&self.buy_result, &self.sell_result) {
            (Some(_), Some(_)) => ArbitrageOutcome::Filled,
            (Some(_), None) => ArbitrageOutcome::BuyLegOnly,
            (None, Some(_)) => ArbitrageOutcome::SellLegOnly,
            (None, None) => ArbitrageOutcome::Failed,
        }
    }
}

pub struct ArbitrageExecutor {
    dispatcher: Arc<ExecutionDispatcher>,
}

impl ArbitrageExecutor {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Market buy on `buy_venue` and market sell on `sell_venue`, both for
    /// `amount`, at the same time.
    pub async fn execute(
        &self,
        opportunity: &ArbitrageOpportunity,
        amount: Decimal,
    ) -> Result<ArbitrageExecution> {
        if amount <= Decimal::ZERO {
            return Err(Error::InvalidRequest(format!("arbitrage amount {amount} must be positive")));
        }
        if opportunity.buy_venue == opportunity.sell_venue {
            return Err(Error::InvalidRequest(format!(
                "buy and sell venue are both {}",
                opportunity.buy_venue
            )));
        }

        let leg = |venue: &str, side: Side| {
            ExecutionRequest::new(
                venue,
                Operation::PlaceOrder(OrderRequest::market(opportunity.symbol.clone(), side, amount)),
            )
            .with_priority(0)
        };
        let batch = self
            .dispatcher
            .execute(vec![
                leg(&opportunity.buy_venue, Side::Buy),
                leg(&opportunity.sell_venue, Side::Sell),
            ])
            .await;

        let buy_result = batch
            .success_for(&opportunity.buy_venue)
            .and_then(|r| r.order())
            .cloned();
        let sell_result = batch
            .success_for(&opportunity.sell_venue)
            .and_then(|r| r.order())
            .cloned();
        let errors = batch
            .failed
            .iter()
            .map(|r| {
                let side = if r.venue == opportunity.buy_venue { "buy" } else { "sell" };
                format!("{} leg on {}: {}", side, r.venue, r.error_text())
            })
            .collect();

        let execution = ArbitrageExecution {
            opportunity: opportunity.clone(),
            amount,
            buy_result,
            sell_result,
            errors,
        };
        match execution.outcome() {
            ArbitrageOutcome::Filled => info!(
                "✅ Arbitrage {} x{} filled: {} -> {}",
                opportunity.symbol, amount, opportunity.buy_venue, opportunity.sell_venue
            ),
            ArbitrageOutcome::BuyLegOnly => error!(
                "🚨 Arbitrage {} x{}: only BUY on {} filled, exposure left open: {:?}",
                opportunity.symbol, amount, opportunity.buy_venue, execution.errors
            ),
            ArbitrageOutcome::SellLegOnly => error!(
                "🚨 Arbitrage {} x{}: only SELL on {} filled, exposure left open: {:?}",
                opportunity.symbol, amount, opportunity.sell_venue, execution.errors
            ),
            ArbitrageOutcome::Failed => warn!(
                "❌ Arbitrage {} x{} failed on both legs: {:?}",
                opportunity.symbol, amount, execution.errors
            ),
        }
        Ok(execution)
    }
}
