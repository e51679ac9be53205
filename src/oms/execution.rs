//! Matching engine: deterministic fill simulation against bar data
//!
//! Given the most recent bar for an order's symbol, produces exactly one
//! `FillReport` per attempt: reference price per `fill_at`, one-sided
//! slippage in basis points, a per-bar volume cap, and TIF policy. No RNG
//! anywhere; identical bar streams and submission order produce identical
//! reports.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{EngineError, RejectReason};
use crate::oms::order::{Order, OrderType, TimeInForce};
use crate::types::{Bar, Side, Symbol};

/// Which bar price anchors market fills
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FillAt {
    Open,
    Close,
    /// Typical price (high + low + close) / 3
    Vwap,
}

/// Matching engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MatchingConfig {
    #[serde(default = "default_fill_at")]
    pub fill_at: FillAt,
    /// Fraction of a bar's volume available to a single order, in [0, 1]
    #[serde(default = "default_max_volume_pct")]
    pub max_volume_pct: f64,
    /// One-sided slippage in basis points of the reference price
    #[serde(default)]
    pub slippage_bps: f64,
    #[serde(default = "default_tif")]
    pub default_tif: TimeInForce,
}

fn default_fill_at() -> FillAt {
    FillAt::Close
}

fn default_max_volume_pct() -> f64 {
    0.10
}

fn default_tif() -> TimeInForce {
    TimeInForce::Gtc
}

impl Default for MatchingConfig {
    fn default() -> Self {
        Self {
            fill_at: default_fill_at(),
            max_volume_pct: default_max_volume_pct(),
            slippage_bps: 0.0,
            default_tif: default_tif(),
        }
    }
}

impl MatchingConfig {
    pub fn with_fill_at(mut self, fill_at: FillAt) -> Self {
        self.fill_at = fill_at;
        self
    }

    pub fn with_max_volume_pct(mut self, pct: f64) -> Self {
        self.max_volume_pct = pct;
        self
    }

    pub fn with_slippage_bps(mut self, bps: f64) -> Self {
        self.slippage_bps = bps;
        self
    }
}

/// Fill outcome status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FillStatus {
    Filled,
    PartiallyFilled,
    Canceled,
    Rejected,
}

/// The single authoritative record of a matching attempt.
///
/// Ledger and trade tracker consume only this; the original order quantity
/// and price are never used downstream.
#[derive(Debug, Clone, PartialEq)]
pub struct FillReport {
    pub status: FillStatus,
    pub filled_qty: i64,
    pub fill_price: f64,
    /// |fill_price - reference price|
    pub slippage: f64,
    pub reason: Option<RejectReason>,
}

impl FillReport {
    fn rejected(reason: RejectReason) -> Self {
        FillReport {
            status: FillStatus::Rejected,
            filled_qty: 0,
            fill_price: 0.0,
            slippage: 0.0,
            reason: Some(reason),
        }
    }

    /// True when any quantity actually changed hands
    pub fn has_fill(&self) -> bool {
        self.filled_qty > 0
    }
}

/// True once a DAY order has outlived its session (calendar date change)
pub fn day_expired(order: &Order, now: DateTime<Utc>) -> bool {
    order.time_in_force == TimeInForce::Day && now.date_naive() > order.created_at.date_naive()
}

/// Deterministic fill simulator
pub struct MatchingEngine {
    config: MatchingConfig,
    /// Most recently seen bar per symbol (the bar context)
    bars: HashMap<Symbol, Bar>,
}

impl MatchingEngine {
    pub fn new(config: MatchingConfig) -> Self {
        Self {
            config,
            bars: HashMap::new(),
        }
    }

    pub fn config(&self) -> &MatchingConfig {
        &self.config
    }

    /// Update the bar context for the bar's symbol
    pub fn set_bar(&mut self, bar: Bar) {
        self.bars.insert(bar.symbol.clone(), bar);
    }

    pub fn bar(&self, symbol: &Symbol) -> Option<&Bar> {
        self.bars.get(symbol)
    }

    /// Reference price for a bar under the configured `fill_at`
    pub fn reference_price(&self, bar: &Bar) -> f64 {
        match self.config.fill_at {
            FillAt::Open => bar.open,
            FillAt::Close => bar.close,
            FillAt::Vwap => bar.vwap(),
        }
    }

    /// Reference price for a symbol from the current bar context
    pub fn reference_price_for(&self, symbol: &Symbol) -> Option<f64> {
        self.bars.get(symbol).map(|b| self.reference_price(b))
    }

    /// Reference price adjusted by one-sided slippage
    fn slipped_price(&self, reference: f64, side: Side) -> f64 {
        reference * (1.0 + side.slippage_sign() * self.config.slippage_bps / 10_000.0)
    }

    /// Attempt to fill a working order against the current bar context.
    ///
    /// Mutates the order per the outcome and returns the report. Returns an
    /// error only on state-machine violations, which indicate a bug in the
    /// caller rather than an unfillable order.
    pub fn execute(&self, order: &mut Order) -> Result<FillReport, EngineError> {
        let bar = match self.bars.get(&order.symbol) {
            Some(bar) => bar,
            None => {
                let report = FillReport::rejected(RejectReason::NoMarket);
                self.settle_no_fill(order, &report)?;
                return Ok(report);
            }
        };

        let reference = self.reference_price(bar);

        // Price at which this order could trade within this bar, if any
        let crossable = self.crossable_price(order, bar, reference);

        let available = (bar.volume * self.config.max_volume_pct).floor() as i64;
        if crossable.is_some() && available == 0 {
            // A dry bar rejects rather than reporting a zero-quantity
            // partial
            let report = FillReport::rejected(RejectReason::NoLiquidity);
            self.settle_no_fill(order, &report)?;
            return Ok(report);
        }

        let attempt_qty = match crossable {
            Some(_) => order.remaining().min(available),
            None => 0,
        };

        // FOK: all or nothing, checked before any state changes
        if order.time_in_force == TimeInForce::Fok && attempt_qty < order.remaining() {
            let report = FillReport::rejected(RejectReason::FokUnfillable);
            self.settle_no_fill(order, &report)?;
            return Ok(report);
        }

        let fill_price = crossable.unwrap_or(0.0);
        if attempt_qty > 0 {
            order.apply_fill(attempt_qty, fill_price)?;
        }

        // IOC: whatever did not fill right now is canceled atomically
        if order.time_in_force == TimeInForce::Ioc && order.remaining() > 0 {
            order.cancel()?;
            return Ok(FillReport {
                status: FillStatus::Canceled,
                filled_qty: attempt_qty,
                fill_price,
                slippage: if attempt_qty > 0 {
                    (fill_price - reference).abs()
                } else {
                    0.0
                },
                reason: None,
            });
        }

        let status = if order.remaining() == 0 {
            FillStatus::Filled
        } else {
            // GTC/DAY remainder keeps working
            FillStatus::PartiallyFilled
        };

        Ok(FillReport {
            status,
            filled_qty: attempt_qty,
            fill_price,
            slippage: if attempt_qty > 0 {
                (fill_price - reference).abs()
            } else {
                0.0
            },
            reason: None,
        })
    }

    /// The price this order trades at within the bar, or None if untouched
    fn crossable_price(&self, order: &Order, bar: &Bar, reference: f64) -> Option<f64> {
        match order.order_type {
            OrderType::Market => Some(self.slipped_price(reference, order.side)),

            OrderType::Limit => {
                let limit = order.limit_price?;
                self.limit_fill_price(order.side, limit, bar, reference)
            }

            OrderType::Stop => {
                let stop = order.stop_price?;
                if self.stop_armed(order, stop, bar) {
                    Some(self.slipped_price(reference, order.side))
                } else {
                    None
                }
            }

            OrderType::StopLimit => {
                let stop = order.stop_price?;
                let limit = order.limit_price?;
                if self.stop_armed(order, stop, bar) {
                    self.limit_fill_price(order.side, limit, bar, reference)
                } else {
                    None
                }
            }
        }
    }

    fn limit_fill_price(&self, side: Side, limit: f64, bar: &Bar, reference: f64) -> Option<f64> {
        let slipped = self.slipped_price(reference, side);
        match side {
            // Buy limit crossable when the bar traded at or below the limit
            Side::Buy if limit >= bar.low => Some(limit.min(slipped)),
            // Sell limit crossable when the bar traded at or above the limit
            Side::Sell if limit <= bar.high => Some(limit.max(slipped)),
            _ => None,
        }
    }

    /// Stop orders arm when the bar range crosses the stop price; a
    /// partially filled stop stays armed across bars
    fn stop_armed(&self, order: &Order, stop: f64, bar: &Bar) -> bool {
        if order.filled_quantity > 0 {
            return true;
        }
        match order.side {
            Side::Buy => bar.high >= stop,
            Side::Sell => bar.low <= stop,
        }
    }

    /// Terminal-ize an order that produced a rejection report.
    ///
    /// A FOK or no-market rejection leaves fill accounting untouched; the
    /// order itself is retired so it never lingers as working.
    fn settle_no_fill(&self, order: &mut Order, report: &FillReport) -> Result<(), EngineError> {
        debug_assert_eq!(report.status, FillStatus::Rejected);
        if order.is_working() {
            order.cancel()?;
        }
        Ok(())
    }
}
