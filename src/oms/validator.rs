//! Pre-trade order validation
//!
//! Checks run short-circuited in a fixed order; the first failure names the
//! rejection. Rate-limit windows are bounded rings of engine timestamps
//! (bar time in backtests, tick time live), so validation is deterministic
//! and never consults the wall clock.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};

use crate::error::RejectReason;
use crate::oms::order::Order;
use crate::portfolio::Ledger;
use crate::types::{Side, Symbol};

/// Validator limits
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskLimits {
    /// Submissions allowed in any trailing 60 s window, all symbols
    #[serde(default = "default_orders_per_minute")]
    pub max_orders_per_minute: usize,
    /// Submissions allowed in any trailing 60 s window, per symbol
    #[serde(default = "default_orders_per_minute_per_symbol")]
    pub max_orders_per_minute_per_symbol: usize,
    /// Cash that must remain untouched after a buy
    #[serde(default)]
    pub min_cash_buffer: f64,
    /// Largest absolute share count a position may reach
    #[serde(default = "default_max_position_size")]
    pub max_position_size: i64,
    /// Largest absolute dollar value a position may reach
    #[serde(default = "unbounded")]
    pub max_position_value: f64,
    /// Cap on total absolute position value plus the incoming order
    #[serde(default = "unbounded")]
    pub max_total_exposure: f64,
}

fn default_orders_per_minute() -> usize {
    60
}

fn default_orders_per_minute_per_symbol() -> usize {
    10
}

fn default_max_position_size() -> i64 {
    1_000_000
}

fn unbounded() -> f64 {
    f64::MAX
}

impl Default for RiskLimits {
    fn default() -> Self {
        Self {
            max_orders_per_minute: default_orders_per_minute(),
            max_orders_per_minute_per_symbol: default_orders_per_minute_per_symbol(),
            min_cash_buffer: 0.0,
            max_position_size: default_max_position_size(),
            max_position_value: unbounded(),
            max_total_exposure: unbounded(),
        }
    }
}

impl RiskLimits {
    pub fn with_max_orders_per_minute(mut self, n: usize) -> Self {
        self.max_orders_per_minute = n;
        self
    }

    pub fn with_max_orders_per_minute_per_symbol(mut self, n: usize) -> Self {
        self.max_orders_per_minute_per_symbol = n;
        self
    }

    pub fn with_min_cash_buffer(mut self, buffer: f64) -> Self {
        self.min_cash_buffer = buffer;
        self
    }

    pub fn with_max_position_size(mut self, shares: i64) -> Self {
        self.max_position_size = shares;
        self
    }

    pub fn with_max_position_value(mut self, value: f64) -> Self {
        self.max_position_value = value;
        self
    }

    pub fn with_max_total_exposure(mut self, value: f64) -> Self {
        self.max_total_exposure = value;
        self
    }
}

/// Sliding 60-second submission window
const RATE_WINDOW: i64 = 60;

/// Pre-trade validator owning the rate-limit rings
#[derive(Debug)]
pub struct OrderValidator {
    limits: RiskLimits,
    global_window: VecDeque<DateTime<Utc>>,
    symbol_windows: HashMap<Symbol, VecDeque<DateTime<Utc>>>,
}

impl OrderValidator {
    pub fn new(limits: RiskLimits) -> Self {
        Self {
            limits,
            global_window: VecDeque::new(),
            symbol_windows: HashMap::new(),
        }
    }

    pub fn limits(&self) -> &RiskLimits {
        &self.limits
    }

    /// Run all pre-trade checks against the current ledger state.
    ///
    /// A passing order is counted against both rate windows; a rejected
    /// order never reaches the wire and is not counted. Rejections carry a
    /// stable code and never mutate portfolio state.
    pub fn validate(
        &mut self,
        order: &Order,
        reference_price: f64,
        ledger: &Ledger,
        now: DateTime<Utc>,
    ) -> Result<(), RejectReason> {
        if !order.is_well_formed() || reference_price <= 0.0 {
            return Err(RejectReason::InvalidOrder);
        }

        prune(&mut self.global_window, now);
        if self.global_window.len() >= self.limits.max_orders_per_minute {
            return Err(RejectReason::RateLimit);
        }

        let symbol_window = self.symbol_windows.entry(order.symbol.clone()).or_default();
        prune(symbol_window, now);
        if symbol_window.len() >= self.limits.max_orders_per_minute_per_symbol {
            return Err(RejectReason::RateLimitSymbol);
        }

        let order_value = order.quantity as f64 * reference_price;

        if order.side == Side::Buy
            && order_value > ledger.cash() - self.limits.min_cash_buffer
        {
            return Err(RejectReason::InsufficientCapital);
        }

        let resulting_qty =
            (ledger.position_qty(&order.symbol) + order.quantity * order.side.multiplier()).abs();
        if resulting_qty > self.limits.max_position_size {
            return Err(RejectReason::PositionSizeExceeded);
        }

        if resulting_qty as f64 * reference_price > self.limits.max_position_value {
            return Err(RejectReason::PositionValueExceeded);
        }

        if ledger.total_exposure() + order_value > self.limits.max_total_exposure {
            return Err(RejectReason::ExposureExceeded);
        }

        self.global_window.push_back(now);
        self.symbol_windows
            .entry(order.symbol.clone())
            .or_default()
            .push_back(now);
        Ok(())
    }
}

/// Drop timestamps older than the trailing window
fn prune(window: &mut VecDeque<DateTime<Utc>>, now: DateTime<Utc>) {
    let cutoff = now - Duration::seconds(RATE_WINDOW);
    while window.front().is_some_and(|&ts| ts <= cutoff) {
        window.pop_front();
    }
}
