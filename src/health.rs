//! Health snapshots and failure escalation
//!
//! The live engine periodically persists a JSON snapshot of its status,
//! positions, and P&L. The failure tracker is a sliding ten-minute window
//! of component failures; three or more inside the window is critical.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::Path;

use crate::portfolio::Ledger;

/// Closed health status enumeration. The legacy `"healthy"` spelling some
/// tooling still emits maps to `Running` on ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Initializing,
    #[serde(alias = "healthy")]
    Running,
    Degraded,
    Stopped,
}

/// One persisted position line in the snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionSummary {
    pub symbol: String,
    pub quantity: i64,
    pub avg_price: f64,
    pub mark_price: f64,
}

/// Point-in-time engine health, persisted as JSON
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_secs: i64,
    pub positions: Vec<PositionSummary>,
    pub total_value: f64,
    pub realized_pnl: f64,
}

impl HealthSnapshot {
    pub fn capture(
        status: HealthStatus,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
        ledger: &Ledger,
        realized_pnl: f64,
    ) -> Self {
        let mut positions: Vec<PositionSummary> = ledger
            .positions()
            .map(|(symbol, p)| PositionSummary {
                symbol: symbol.as_str().to_string(),
                quantity: p.quantity,
                avg_price: p.avg_price,
                mark_price: p.mark_price,
            })
            .collect();
        positions.sort_by(|a, b| a.symbol.cmp(&b.symbol));

        HealthSnapshot {
            status,
            timestamp: now,
            uptime_secs: (now - started_at).num_seconds(),
            positions,
            total_value: ledger.total_value(),
            realized_pnl,
        }
    }

    pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path.as_ref(), json)
            .with_context(|| format!("failed to write health snapshot: {}", path.as_ref().display()))
    }

    pub fn read(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        serde_json::from_str(&contents).context("failed to parse health snapshot")
    }
}

/// Sliding window for failure escalation
const FAILURE_WINDOW_MINUTES: i64 = 10;

/// Count of windowed failures at which the engine must escalate
const CRITICAL_FAILURES: usize = 3;

/// Durable-ish failure counter with a sliding window
#[derive(Debug, Default)]
pub struct FailureTracker {
    failures: VecDeque<DateTime<Utc>>,
}

impl FailureTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure and return the count inside the current window
    pub fn record_failure(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.failures.push_back(now);
        self.failures.len()
    }

    /// True once the windowed count reaches the critical threshold
    pub fn is_critical(count: usize) -> bool {
        count >= CRITICAL_FAILURES
    }

    pub fn count(&mut self, now: DateTime<Utc>) -> usize {
        self.prune(now);
        self.failures.len()
    }

    fn prune(&mut self, now: DateTime<Utc>) {
        let cutoff = now - Duration::minutes(FAILURE_WINDOW_MINUTES);
        while self.failures.front().is_some_and(|&ts| ts <= cutoff) {
            self.failures.pop_front();
        }
    }
}
