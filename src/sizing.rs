//! Position sizing
//!
//! One closed family of sizers behind a single `qty` call. Sizers are pure:
//! quantity is a function of the signal, current equity, the reference
//! price, and (for the volatility variant) an ATR the engine supplies from
//! bar history. Sizing never touches portfolio state.

use serde::{Deserialize, Serialize};

use crate::types::Signal;

/// Quantity calculator variants, selected in configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PositionSizer {
    /// Constant share count per order
    Fixed { quantity: i64 },

    /// floor(equity * pct / price)
    PercentOfEquity { pct: f64 },

    /// floor(equity * risk_pct / stop_distance); the stop distance comes
    /// from the signal's stop-loss or from the configured default
    RiskBased {
        risk_pct: f64,
        #[serde(default)]
        default_stop_distance: Option<f64>,
    },

    /// Kelly fraction of equity, clamped to [0, cap]
    Kelly {
        win_rate: f64,
        payoff_ratio: f64,
        cap: f64,
    },

    /// floor(equity * risk_pct / (atr * atr_multiplier))
    Volatility { risk_pct: f64, atr_multiplier: f64 },
}

impl Default for PositionSizer {
    fn default() -> Self {
        PositionSizer::PercentOfEquity { pct: 0.10 }
    }
}

impl PositionSizer {
    /// Shares to order for a signal, always >= 0
    pub fn qty(&self, signal: &Signal, equity: f64, price: f64, atr: Option<f64>) -> i64 {
        if price <= 0.0 || equity <= 0.0 {
            return 0;
        }

        let qty = match *self {
            PositionSizer::Fixed { quantity } => quantity.max(0) as f64,

            PositionSizer::PercentOfEquity { pct } => (equity * pct / price).floor(),

            PositionSizer::RiskBased {
                risk_pct,
                default_stop_distance,
            } => {
                let stop_distance = signal
                    .stop_loss
                    .map(|stop| (signal.price - stop).abs())
                    .or(default_stop_distance)
                    .unwrap_or(0.0);
                if stop_distance <= 0.0 {
                    return 0;
                }
                (equity * risk_pct / stop_distance).floor()
            }

            PositionSizer::Kelly {
                win_rate,
                payoff_ratio,
                cap,
            } => {
                if payoff_ratio <= 0.0 {
                    return 0;
                }
                let q = 1.0 - win_rate;
                // A misconfigured negative cap sizes to zero instead of
                // feeding clamp an inverted range
                let fraction =
                    ((win_rate * payoff_ratio - q) / payoff_ratio).clamp(0.0, cap.max(0.0));
                (equity * fraction / price).floor()
            }

            PositionSizer::Volatility {
                risk_pct,
                atr_multiplier,
            } => {
                let Some(atr) = atr.filter(|a| *a > 0.0) else {
                    return 0;
                };
                (equity * risk_pct / (atr * atr_multiplier)).floor()
            }
        };

        if qty.is_finite() && qty > 0.0 {
            qty as i64
        } else {
            0
        }
    }
}
