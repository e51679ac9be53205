//! Error taxonomy
//!
//! Two families: `RejectReason` covers pre-trade and matching rejections
//! (recorded, never fatal, never mutate the ledger), `EngineError` covers
//! state-machine violations and invariant failures (fatal in backtests).
//! Every variant carries a stable machine-readable code for reporting.

use thiserror::Error;

use crate::oms::order::OrderState;
use crate::types::Symbol;

/// Why an order was turned away before or during matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    /// Global submissions-per-minute window exhausted
    RateLimit,
    /// Per-symbol submissions-per-minute window exhausted
    RateLimitSymbol,
    /// Buy value would breach cash minus the configured buffer
    InsufficientCapital,
    /// Resulting share count would exceed max_position_size
    PositionSizeExceeded,
    /// Resulting position value would exceed max_position_value
    PositionValueExceeded,
    /// Total exposure would exceed max_total_exposure
    ExposureExceeded,
    /// No bar context has been seen for the order's symbol
    NoMarket,
    /// Bar had no tradeable volume under the volume cap
    NoLiquidity,
    /// Fill-or-kill order could not be filled in full
    FokUnfillable,
    /// Circuit breaker active; new entries suppressed
    CircuitBreaker,
    /// Order shape invalid (zero quantity, missing limit price, ...)
    InvalidOrder,
    /// Broker submission deadline elapsed
    SubmitTimeout,
}

impl RejectReason {
    /// Stable code for audit records and dispatch; never match on strings
    pub fn code(&self) -> &'static str {
        match self {
            RejectReason::RateLimit => "rate_limit",
            RejectReason::RateLimitSymbol => "rate_limit_symbol",
            RejectReason::InsufficientCapital => "insufficient_capital",
            RejectReason::PositionSizeExceeded => "position_size_exceeded",
            RejectReason::PositionValueExceeded => "position_value_exceeded",
            RejectReason::ExposureExceeded => "exposure_exceeded",
            RejectReason::NoMarket => "no_market",
            RejectReason::NoLiquidity => "no_liquidity",
            RejectReason::FokUnfillable => "fok_unfillable",
            RejectReason::CircuitBreaker => "circuit_breaker",
            RejectReason::InvalidOrder => "invalid_order",
            RejectReason::SubmitTimeout => "submit_timeout",
        }
    }
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Errors that indicate a bug or corrupted state rather than a rejection
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("illegal order state transition {from:?} -> {to:?} (order {order_id})")]
    InvalidTransition {
        order_id: u64,
        from: OrderState,
        to: OrderState,
    },

    #[error("fill of {fill_qty} exceeds remaining {remaining} (order {order_id})")]
    Overfill {
        order_id: u64,
        fill_qty: i64,
        remaining: i64,
    },

    #[error("malformed bar for {symbol}: {detail}")]
    MalformedBar { symbol: Symbol, detail: String },

    #[error("invariant violated: {0}")]
    InvariantViolation(String),

    #[error("broker error: {0}")]
    Broker(String),
}

impl EngineError {
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidTransition { .. } => "invalid_transition",
            EngineError::Overfill { .. } => "overfill",
            EngineError::MalformedBar { .. } => "malformed_bar",
            EngineError::InvariantViolation(_) => "invariant_violation",
            EngineError::Broker(_) => "broker_error",
        }
    }
}
