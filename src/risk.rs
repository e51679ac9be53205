//! Risk management: per-position stops and the portfolio circuit breaker
//!
//! Stop state for a symbol is created on its first opening fill and
//! destroyed when the position closes. On every price update the trailing
//! high-water mark only ever moves up. The circuit breaker tracks the
//! portfolio equity high-water mark plus today's starting equity, and once
//! tripped suppresses new entries (exits still run) until an explicit reset.
//!
//! The engines evaluate stops before strategy signals on every tick, so an
//! imminent exit cannot be overridden by a same-tick entry.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{info, warn};

use crate::portfolio::Ledger;
use crate::types::Symbol;

/// Stop and circuit-breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopConfig {
    /// Fixed stop distance from entry, e.g. 0.02 = exit 2% below entry.
    /// Absent disables the fixed stop; zero is a stop exactly at entry.
    #[serde(default)]
    pub position_stop_pct: Option<f64>,
    /// Trailing stop distance from the high-water mark
    #[serde(default)]
    pub trailing_stop_pct: Option<f64>,
    /// Master switch for trailing stops
    #[serde(default = "default_true")]
    pub use_trailing_stops: bool,
    /// Intraday loss from today's starting equity that trips the breaker
    #[serde(default = "default_portfolio_stop")]
    pub portfolio_stop_pct: f64,
    /// Drawdown from the equity high-water mark that trips the breaker
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_pct: f64,
    #[serde(default = "default_true")]
    pub enable_circuit_breaker: bool,
}

fn default_true() -> bool {
    true
}

fn default_portfolio_stop() -> f64 {
    0.05
}

fn default_max_drawdown() -> f64 {
    0.20
}

impl Default for StopConfig {
    fn default() -> Self {
        Self {
            position_stop_pct: Some(0.02),
            trailing_stop_pct: Some(0.05),
            use_trailing_stops: true,
            portfolio_stop_pct: default_portfolio_stop(),
            max_drawdown_pct: default_max_drawdown(),
            enable_circuit_breaker: true,
        }
    }
}

impl StopConfig {
    pub fn with_position_stop_pct(mut self, pct: f64) -> Self {
        self.position_stop_pct = Some(pct);
        self
    }

    pub fn with_trailing_stop_pct(mut self, pct: f64) -> Self {
        self.trailing_stop_pct = Some(pct);
        self
    }

    pub fn with_max_drawdown_pct(mut self, pct: f64) -> Self {
        self.max_drawdown_pct = pct;
        self
    }

    pub fn with_portfolio_stop_pct(mut self, pct: f64) -> Self {
        self.portfolio_stop_pct = pct;
        self
    }
}

/// Per-symbol stop state for an open long position
#[derive(Debug, Clone)]
pub struct PositionStop {
    pub entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Highest price seen since entry; monotone non-decreasing
    pub high_water_mark: f64,
    /// Absolute exit level, taken from the entry signal when present
    pub absolute_level: Option<f64>,
}

/// Why a position is being force-closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitReason {
    PositionStop,
    TrailingStop,
    Absolute,
    CircuitBreaker,
}

impl ExitReason {
    pub fn code(&self) -> &'static str {
        match self {
            ExitReason::PositionStop => "position_stop",
            ExitReason::TrailingStop => "trailing_stop",
            ExitReason::Absolute => "absolute",
            ExitReason::CircuitBreaker => "circuit_breaker",
        }
    }
}

/// A forced exit: always a full-position sell for a long
#[derive(Debug, Clone, PartialEq)]
pub struct ExitSignal {
    pub symbol: Symbol,
    pub quantity: i64,
    pub reason: ExitReason,
    pub trigger_price: f64,
    pub timestamp: DateTime<Utc>,
}

/// Risk manager owning stop state and the circuit breaker
#[derive(Debug)]
pub struct RiskManager {
    config: StopConfig,
    stops: HashMap<Symbol, PositionStop>,
    equity_high_water_mark: f64,
    day_start_equity: f64,
    current_day: Option<NaiveDate>,
    breaker_tripped: bool,
}

impl RiskManager {
    pub fn new(config: StopConfig, initial_equity: f64) -> Self {
        Self {
            config,
            stops: HashMap::new(),
            equity_high_water_mark: initial_equity,
            day_start_equity: initial_equity,
            current_day: None,
            breaker_tripped: false,
        }
    }

    pub fn config(&self) -> &StopConfig {
        &self.config
    }

    /// Register stop state on the first opening fill of a symbol.
    /// Later adds to the same position keep the original entry reference.
    pub fn track_entry(
        &mut self,
        symbol: &Symbol,
        entry_price: f64,
        entry_time: DateTime<Utc>,
        absolute_level: Option<f64>,
    ) {
        self.stops.entry(symbol.clone()).or_insert(PositionStop {
            entry_price,
            entry_time,
            high_water_mark: entry_price,
            absolute_level,
        });
    }

    /// Drop stop state once the position is closed
    pub fn clear(&mut self, symbol: &Symbol) {
        self.stops.remove(symbol);
    }

    pub fn stop_state(&self, symbol: &Symbol) -> Option<&PositionStop> {
        self.stops.get(symbol)
    }

    /// Evaluate all tracked stops against the latest prices.
    ///
    /// Emits at most one exit per symbol; when both the fixed and trailing
    /// stops would fire, the fixed stop names the exit. Symbols are visited
    /// in sorted order so runs are reproducible.
    pub fn evaluate(
        &mut self,
        prices: &HashMap<Symbol, f64>,
        ledger: &Ledger,
        timestamp: DateTime<Utc>,
    ) -> Vec<ExitSignal> {
        let mut symbols: Vec<Symbol> = self.stops.keys().cloned().collect();
        symbols.sort();

        let mut exits = Vec::new();
        for symbol in symbols {
            let quantity = ledger.position_qty(&symbol);
            if quantity <= 0 {
                continue;
            }
            let Some(&price) = prices.get(&symbol) else {
                continue;
            };
            let stop = self.stops.get_mut(&symbol).expect("tracked above");

            if self.config.use_trailing_stops
                && self.config.trailing_stop_pct.is_some()
                && price > stop.high_water_mark
            {
                stop.high_water_mark = price;
            }

            let fired = check_stop(&self.config, stop, price);
            if let Some((reason, trigger_price)) = fired {
                info!(
                    symbol = %symbol,
                    reason = reason.code(),
                    price,
                    trigger = trigger_price,
                    "stop fired"
                );
                exits.push(ExitSignal {
                    symbol,
                    quantity,
                    reason,
                    trigger_price,
                    timestamp,
                });
            }
        }
        exits
    }

    /// Emit a full exit for every tracked position, used when failure
    /// escalation demands liquidation
    pub fn liquidate_all(
        &self,
        prices: &HashMap<Symbol, f64>,
        ledger: &Ledger,
        timestamp: DateTime<Utc>,
    ) -> Vec<ExitSignal> {
        let mut symbols: Vec<Symbol> = self.stops.keys().cloned().collect();
        symbols.sort();

        symbols
            .into_iter()
            .filter_map(|symbol| {
                let quantity = ledger.position_qty(&symbol);
                let price = prices.get(&symbol).copied()?;
                (quantity > 0).then(|| ExitSignal {
                    symbol,
                    quantity,
                    reason: ExitReason::CircuitBreaker,
                    trigger_price: price,
                    timestamp,
                })
            })
            .collect()
    }

    /// Fold the latest portfolio equity into breaker state.
    ///
    /// Returns true when the breaker trips on this update. The equity
    /// high-water mark survives resets; today's starting equity rolls over
    /// on the first update of each calendar day.
    pub fn update_equity(&mut self, equity: f64, timestamp: DateTime<Utc>) -> bool {
        let day = timestamp.date_naive();
        if self.current_day != Some(day) {
            self.current_day = Some(day);
            self.day_start_equity = equity;
        }

        if equity > self.equity_high_water_mark {
            self.equity_high_water_mark = equity;
        }

        if !self.config.enable_circuit_breaker || self.breaker_tripped {
            return false;
        }

        let drawdown_hit =
            equity / self.equity_high_water_mark < 1.0 - self.config.max_drawdown_pct;
        let daily_hit = self.day_start_equity > 0.0
            && (equity - self.day_start_equity) / self.day_start_equity
                < -self.config.portfolio_stop_pct;

        if drawdown_hit || daily_hit {
            warn!(
                equity,
                high_water_mark = self.equity_high_water_mark,
                day_start = self.day_start_equity,
                "circuit breaker tripped; new entries suppressed"
            );
            self.breaker_tripped = true;
            return true;
        }
        false
    }

    /// While active, all new signal-driven entries are suppressed
    pub fn breaker_active(&self) -> bool {
        self.breaker_tripped
    }

    pub fn equity_high_water_mark(&self) -> f64 {
        self.equity_high_water_mark
    }

    /// Clear the tripped state. The equity high-water mark is retained.
    pub fn reset_breaker(&mut self) {
        self.breaker_tripped = false;
    }
}

/// First firing stop wins: fixed, then trailing, then absolute
fn check_stop(config: &StopConfig, stop: &PositionStop, price: f64) -> Option<(ExitReason, f64)> {
    if let Some(pct) = config.position_stop_pct {
        let trigger = stop.entry_price * (1.0 - pct);
        if price <= trigger {
            return Some((ExitReason::PositionStop, trigger));
        }
    }

    if config.use_trailing_stops {
        if let Some(pct) = config.trailing_stop_pct {
            let trigger = stop.high_water_mark * (1.0 - pct);
            if price <= trigger {
                return Some((ExitReason::TrailingStop, trigger));
            }
        }
    }

    if let Some(level) = stop.absolute_level {
        if price <= level {
            return Some((ExitReason::Absolute, level));
        }
    }

    None
}
