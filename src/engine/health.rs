//! Health Monitor - per-venue status derived from probes and dispatch outcomes
//!
//! State machine: `healthy <-> unhealthy`, and `disabled` only through an
//! explicit registry disable. Repeated failures never demote a venue to
//! `disabled` on their own; an operator decides that.

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use tracing::{info, warn};

use crate::core::Symbol;
use crate::engine::dispatcher::{ExecutionDispatcher, ExecutionRequest, Operation};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VenueStatus {
    Healthy,
    Unhealthy,
    Disabled,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: VenueStatus,
    pub last_check: DateTime<Utc>,
    pub consecutive_errors: u32,
    pub last_response_time_ms: f64,
    pub last_error: Option<String>,
}

impl HealthStatus {
    fn healthy(response_time_ms: f64) -> Self {
        Self {
            status: VenueStatus::Healthy,
            last_check: Utc::now(),
            consecutive_errors: 0,
            last_response_time_ms: response_time_ms,
            last_error: None,
        }
    }
}

/// Outcome of a connectivity sweep.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ConnectionReport {
    /// venue -> probe succeeded
    pub results: BTreeMap<String, bool>,
    pub healthy: usize,
    pub unhealthy: usize,
}

/// Venue name -> health status
#[derive(Default)]
pub struct HealthMonitor {
    statuses: RwLock<HashMap<String, HealthStatus>>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start tracking a freshly connected venue as healthy.
    pub fn register(&self, venue: &str, response_time_ms: f64) {
        self.statuses
            .write()
            .insert(venue.to_string(), HealthStatus::healthy(response_time_ms));
    }

    pub fn remove(&self, venue: &str) {
        self.statuses.write().remove(venue);
    }

    pub fn mark_disabled(&self, venue: &str) {
        let mut statuses = self.statuses.write();
        let entry = statuses
            .entry(venue.to_string())
            .or_insert_with(|| HealthStatus::healthy(0.0));
        entry.status = VenueStatus::Disabled;
        entry.last_check = Utc::now();
    }

    pub fn record_success(&self, venue: &str, response_time_ms: f64) {
        let mut statuses = self.statuses.write();
        let Some(entry) = statuses.get_mut(venue) else {
            return;
        };
        if entry.status == VenueStatus::Disabled {
            return;
        }
        if entry.status == VenueStatus::Unhealthy {
            info!("💚 {} recovered after {} errors", venue, entry.consecutive_errors);
        }
        *entry = HealthStatus::healthy(response_time_ms);
    }

    pub fn record_failure(&self, venue: &str, error: &str, response_time_ms: f64) {
        let mut statuses = self.statuses.write();
        let Some(entry) = statuses.get_mut(venue) else {
            return;
        };
        if entry.status == VenueStatus::Disabled {
            return;
        }
        entry.status = VenueStatus::Unhealthy;
        entry.consecutive_errors += 1;
        entry.last_check = Utc::now();
        entry.last_response_time_ms = response_time_ms;
        entry.last_error = Some(error.to_string());
        if entry.consecutive_errors == 1 {
            warn!("💔 {} unhealthy: {}", venue, error);
        }
    }

    pub fn status(&self, venue: &str) -> Option<HealthStatus> {
        self.statuses.read().get(venue).cloned()
    }

    pub fn snapshot(&self) -> HashMap<String, HealthStatus> {
        self.statuses.read().clone()
    }

    /// Probe every enabled venue through the dispatcher.
    ///
    /// The dispatcher feeds each outcome back into this monitor, so statuses
    /// are already updated when the report is returned.
    pub async fn test_all_connections(
        &self,
        dispatcher: &ExecutionDispatcher,
        probe: &Symbol,
    ) -> ConnectionReport {
        let requests: Vec<ExecutionRequest> = dispatcher
            .registry()
            .enabled_venues()
            .into_iter()
            .map(|venue| ExecutionRequest::new(venue, Operation::Probe(probe.clone())))
            .collect();
        let batch = dispatcher.execute(requests).await;

        let mut report = ConnectionReport::default();
        for resp in batch.successful.iter().chain(batch.failed.iter()) {
            report.results.insert(resp.venue.clone(), resp.success);
        }
        report.healthy = batch.successful.len();
        report.unhealthy = batch.failed.len();
        info!("🩺 Connectivity: {} healthy, {} unhealthy", report.healthy, report.unhealthy);
        report
    }
}
