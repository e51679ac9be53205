//! FIFO round-trip trade tracking and the equity time series
//!
//! Opening fills enqueue lots; closing fills peel lots from the queue head,
//! emitting one completed trade per peel. After every fill the per-symbol
//! lot total must agree with the ledger exactly.

use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};

use crate::error::EngineError;
use crate::oms::execution::FillReport;
use crate::oms::order::OrderId;
use crate::portfolio::Ledger;
use crate::types::{Side, Symbol};

/// One FIFO entry: an opening fill not yet fully matched against exits
#[derive(Debug, Clone)]
pub struct OpenLot {
    pub quantity: i64,
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    pub entry_order_id: OrderId,
}

/// A matched round trip with realized P&L
#[derive(Debug, Clone, PartialEq)]
pub struct CompletedTrade {
    pub symbol: Symbol,
    pub entry_time: DateTime<Utc>,
    pub exit_time: DateTime<Utc>,
    pub entry_price: f64,
    pub exit_price: f64,
    pub quantity: i64,
    pub realized_pnl: f64,
    /// (exit - entry) / entry
    pub return_pct: f64,
    pub holding_period: Duration,
}

/// FIFO matcher of opening against closing fills
#[derive(Debug, Default)]
pub struct TradeTracker {
    lots: HashMap<Symbol, VecDeque<OpenLot>>,
    completed: Vec<CompletedTrade>,
}

impl TradeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold a fill report into the lot queues.
    ///
    /// Buys enqueue a lot; sells peel from the queue head until the sold
    /// quantity is consumed. A sell with no lots left to match means the
    /// tracker and ledger have diverged (short opens are not modeled), which
    /// is fatal.
    pub fn apply_fill(
        &mut self,
        symbol: &Symbol,
        side: Side,
        report: &FillReport,
        timestamp: DateTime<Utc>,
        order_id: OrderId,
    ) -> Result<(), EngineError> {
        if !report.has_fill() {
            return Ok(());
        }

        match side {
            Side::Buy => {
                self.lots.entry(symbol.clone()).or_default().push_back(OpenLot {
                    quantity: report.filled_qty,
                    entry_price: report.fill_price,
                    entry_time: timestamp,
                    entry_order_id: order_id,
                });
                Ok(())
            }
            Side::Sell => self.match_exit(symbol, report, timestamp),
        }
    }

    fn match_exit(
        &mut self,
        symbol: &Symbol,
        report: &FillReport,
        exit_time: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let queue = self.lots.entry(symbol.clone()).or_default();
        let mut remaining = report.filled_qty;

        while remaining > 0 {
            let lot = queue.front_mut().ok_or_else(|| {
                EngineError::InvariantViolation(format!(
                    "sell of {} shares of {} exceeds open lots by {}",
                    report.filled_qty, symbol, remaining
                ))
            })?;

            let matched = remaining.min(lot.quantity);
            let entry_price = lot.entry_price;
            self.completed.push(CompletedTrade {
                symbol: symbol.clone(),
                entry_time: lot.entry_time,
                exit_time,
                entry_price,
                exit_price: report.fill_price,
                quantity: matched,
                realized_pnl: matched as f64 * (report.fill_price - entry_price),
                return_pct: (report.fill_price - entry_price) / entry_price,
                holding_period: exit_time - lot.entry_time,
            });

            lot.quantity -= matched;
            remaining -= matched;
            if lot.quantity == 0 {
                queue.pop_front();
            }
        }

        if queue.is_empty() {
            self.lots.remove(symbol);
        }
        Ok(())
    }

    /// Total open quantity for a symbol across its lots
    pub fn open_quantity(&self, symbol: &Symbol) -> i64 {
        self.lots
            .get(symbol)
            .map_or(0, |q| q.iter().map(|l| l.quantity).sum())
    }

    pub fn open_lots(&self, symbol: &Symbol) -> Option<&VecDeque<OpenLot>> {
        self.lots.get(symbol)
    }

    pub fn completed(&self) -> &[CompletedTrade] {
        &self.completed
    }

    pub fn into_completed(self) -> Vec<CompletedTrade> {
        self.completed
    }

    /// Assert that every symbol's lot total equals the ledger's position
    /// quantity, integer-exact. Divergence is a programming error.
    pub fn check_consistency(&self, ledger: &Ledger) -> Result<(), EngineError> {
        for (symbol, queue) in &self.lots {
            let lot_qty: i64 = queue.iter().map(|l| l.quantity).sum();
            let ledger_qty = ledger.position_qty(symbol);
            if lot_qty != ledger_qty {
                return Err(EngineError::InvariantViolation(format!(
                    "lot/ledger divergence for {}: lots={} ledger={}",
                    symbol, lot_qty, ledger_qty
                )));
            }
        }
        // Symbols the ledger holds but the tracker has never seen
        for (symbol, position) in ledger.positions() {
            if position.quantity != 0 && !self.lots.contains_key(symbol) {
                return Err(EngineError::InvariantViolation(format!(
                    "ledger holds {} shares of {} with no open lots",
                    position.quantity, symbol
                )));
            }
        }
        Ok(())
    }

    /// Realized P&L across all completed trades
    pub fn total_realized_pnl(&self) -> f64 {
        self.completed.iter().map(|t| t.realized_pnl).sum()
    }
}

/// Time series of total portfolio value, one point per tick
#[derive(Debug, Default, Clone)]
pub struct EquityTracker {
    points: Vec<(DateTime<Utc>, f64)>,
}

impl EquityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a point; timestamps must be non-decreasing
    pub fn record(&mut self, timestamp: DateTime<Utc>, value: f64) -> Result<(), EngineError> {
        if let Some(&(last_ts, _)) = self.points.last() {
            if timestamp < last_ts {
                return Err(EngineError::InvariantViolation(format!(
                    "equity timestamp regression: {} after {}",
                    timestamp, last_ts
                )));
            }
        }
        self.points.push((timestamp, value));
        Ok(())
    }

    pub fn points(&self) -> &[(DateTime<Utc>, f64)] {
        &self.points
    }

    pub fn last_value(&self) -> Option<f64> {
        self.points.last().map(|&(_, v)| v)
    }

    /// Peak-to-trough drawdown over the recorded series, as a fraction
    pub fn max_drawdown(&self) -> f64 {
        let mut peak = f64::MIN;
        let mut max_dd = 0.0;
        for &(_, equity) in &self.points {
            if equity > peak {
                peak = equity;
            }
            let dd = (peak - equity) / peak;
            if dd > max_dd {
                max_dd = dd;
            }
        }
        max_dd
    }
}
