//! Portfolio ledger: cash plus per-symbol positions
//!
//! Quantities are integer shares; cost basis is the volume-weighted average
//! of opening fills and is never touched by mark-to-market. The ledger is
//! mutated exclusively through `apply_fill`, fed by matching-engine reports.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;
use crate::oms::execution::FillReport;
use crate::types::{Side, Symbol};

/// One open position
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    /// Signed share count (long-only in practice, so >= 0)
    pub quantity: i64,
    /// Volume-weighted average cost of the open quantity
    pub avg_price: f64,
    /// Latest mark price; starts at the first fill price
    pub mark_price: f64,
}

impl Position {
    pub fn market_value(&self) -> f64 {
        self.quantity as f64 * self.mark_price
    }

    pub fn unrealized_pnl(&self) -> f64 {
        self.quantity as f64 * (self.mark_price - self.avg_price)
    }
}

/// Cash plus a flat symbol -> position map
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ledger {
    cash: f64,
    positions: HashMap<Symbol, Position>,
}

impl Ledger {
    pub fn new(initial_cash: f64) -> Self {
        Self {
            cash: initial_cash,
            positions: HashMap::new(),
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn position(&self, symbol: &Symbol) -> Option<&Position> {
        self.positions.get(symbol)
    }

    /// Signed share count for a symbol, zero when flat
    pub fn position_qty(&self, symbol: &Symbol) -> i64 {
        self.positions.get(symbol).map_or(0, |p| p.quantity)
    }

    pub fn positions(&self) -> impl Iterator<Item = (&Symbol, &Position)> {
        self.positions.iter()
    }

    pub fn open_position_count(&self) -> usize {
        self.positions.len()
    }

    /// Apply a fill report atomically: position quantity, cost basis, cash.
    ///
    /// Same-direction fills fold into the volume-weighted average cost;
    /// reducing fills retain the remaining side's basis so a partial exit
    /// does not reset it. A fill that would push the position through zero
    /// is corruption (short opens are not modeled) and fails fatally.
    pub fn apply_fill(
        &mut self,
        symbol: &Symbol,
        side: Side,
        report: &FillReport,
    ) -> Result<(), EngineError> {
        if !report.has_fill() {
            return Ok(());
        }

        let signed_qty = report.filled_qty * side.multiplier();
        let (prev_qty, prev_avg) = match self.positions.get(symbol) {
            Some(p) => (p.quantity, p.avg_price),
            None => (0, 0.0),
        };
        let new_qty = prev_qty + signed_qty;

        if new_qty < 0 {
            return Err(EngineError::InvariantViolation(format!(
                "fill would take {} from {} to {} shares",
                symbol, prev_qty, new_qty
            )));
        }

        self.cash -= report.filled_qty as f64 * report.fill_price * side.multiplier() as f64;

        if new_qty == 0 {
            self.positions.remove(symbol);
            return Ok(());
        }

        let same_direction = prev_qty == 0 || (prev_qty > 0) == (signed_qty > 0);
        let avg_price = if same_direction {
            (prev_qty as f64 * prev_avg + signed_qty as f64 * report.fill_price) / new_qty as f64
        } else {
            prev_avg
        };

        let entry = self.positions.entry(symbol.clone()).or_insert(Position {
            quantity: 0,
            avg_price: 0.0,
            mark_price: report.fill_price,
        });
        entry.quantity = new_qty;
        entry.avg_price = avg_price;

        Ok(())
    }

    /// Update marks from the given prices; positions without a quote keep
    /// their last mark. Cost basis is untouched.
    pub fn mark_to_market(&mut self, prices: &HashMap<Symbol, f64>) {
        for (symbol, position) in &mut self.positions {
            if let Some(&price) = prices.get(symbol) {
                position.mark_price = price;
            }
        }
    }

    /// cash + sum of quantity * mark over all positions
    pub fn total_value(&self) -> f64 {
        self.cash
            + self
                .positions
                .values()
                .map(Position::market_value)
                .sum::<f64>()
    }

    /// Sum of absolute position values, the exposure the validator caps
    pub fn total_exposure(&self) -> f64 {
        self.positions
            .values()
            .map(|p| p.market_value().abs())
            .sum()
    }
}
