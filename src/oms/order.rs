//! Order entity and its state machine
//!
//! States: NEW -> ACKED -> PARTIALLY_FILLED -> FILLED, NEW -> REJECTED,
//! {ACKED, PARTIALLY_FILLED} -> CANCELED. Terminal orders are immutable;
//! any other transition is an `InvalidTransition` error.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::EngineError;
use crate::types::{Side, Symbol};

/// Order ID type - u64 for cheap copying and map keys
pub type OrderId = u64;

/// Atomic counter for order ID generation
static ORDER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate next order ID (thread-safe)
pub fn next_order_id() -> OrderId {
    ORDER_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Order type - determines matching logic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    /// Fill at the reference price of the current bar
    Market,

    /// Fill only when the limit price is crossable within the bar range
    /// Buy limit: crossable when limit >= bar.low
    /// Sell limit: crossable when limit <= bar.high
    Limit,

    /// Converts to market once the bar range crosses the stop price
    /// Buy stop: arms when bar.high >= stop
    /// Sell stop: arms when bar.low <= stop
    Stop,

    /// Converts to a limit order once the stop triggers
    StopLimit,
}

/// Time-in-force specification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeInForce {
    /// Canceled at the session (calendar date) boundary
    Day,

    /// Good till cancelled
    Gtc,

    /// Fill what is available immediately, cancel the rest
    Ioc,

    /// Fill completely or reject
    Fok,
}

/// Order state machine states
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderState {
    /// Created, not yet accepted by the engine
    New,

    /// Accepted and eligible for matching
    Acked,

    /// Some quantity filled, remainder working
    PartiallyFilled,

    /// Completely filled (terminal)
    Filled,

    /// Cancelled with zero or partial fill (terminal)
    Canceled,

    /// Turned away before any fill (terminal)
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderState::Filled | OrderState::Canceled | OrderState::Rejected
        )
    }
}

/// Core order structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    /// Client-side order ID, unique within the process
    pub id: OrderId,

    pub symbol: Symbol,

    pub side: Side,

    pub order_type: OrderType,

    /// Total quantity in shares, always positive
    pub quantity: i64,

    /// Limit price (limit/stop-limit orders)
    pub limit_price: Option<f64>,

    /// Stop price (stop/stop-limit orders)
    pub stop_price: Option<f64>,

    pub time_in_force: TimeInForce,

    pub created_at: DateTime<Utc>,

    /// Filled quantity so far
    pub filled_quantity: i64,

    /// Size-weighted average fill price, meaningful iff filled_quantity > 0
    pub average_fill_price: f64,

    pub state: OrderState,

    /// Why the order was rejected, if it was
    pub reject_reason: Option<String>,
}

impl Order {
    /// Create a new order in state NEW.
    ///
    /// `created_at` comes from the engine clock (the current bar's timestamp
    /// in backtests) so that runs stay reproducible.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        side: Side,
        order_type: OrderType,
        quantity: i64,
        limit_price: Option<f64>,
        stop_price: Option<f64>,
        time_in_force: TimeInForce,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: next_order_id(),
            symbol,
            side,
            order_type,
            quantity,
            limit_price,
            stop_price,
            time_in_force,
            created_at,
            filled_quantity: 0,
            average_fill_price: 0.0,
            state: OrderState::New,
            reject_reason: None,
        }
    }

    /// Unfilled quantity, always >= 0
    pub fn remaining(&self) -> i64 {
        self.quantity - self.filled_quantity
    }

    /// Working orders are eligible for further fills
    pub fn is_working(&self) -> bool {
        matches!(self.state, OrderState::Acked | OrderState::PartiallyFilled)
    }

    /// Shape check before submission: positive quantity, required prices set
    pub fn is_well_formed(&self) -> bool {
        if self.quantity <= 0 {
            return false;
        }
        match self.order_type {
            OrderType::Market => true,
            OrderType::Limit => self.limit_price.is_some_and(|p| p > 0.0),
            OrderType::Stop => self.stop_price.is_some_and(|p| p > 0.0),
            OrderType::StopLimit => {
                self.limit_price.is_some_and(|p| p > 0.0) && self.stop_price.is_some_and(|p| p > 0.0)
            }
        }
    }

    /// NEW -> ACKED
    pub fn acknowledge(&mut self) -> Result<(), EngineError> {
        match self.state {
            OrderState::New => {
                self.state = OrderState::Acked;
                Ok(())
            }
            from => Err(self.bad_transition(from, OrderState::Acked)),
        }
    }

    /// NEW -> REJECTED
    pub fn reject(&mut self, reason: impl Into<String>) -> Result<(), EngineError> {
        match self.state {
            OrderState::New => {
                self.state = OrderState::Rejected;
                self.reject_reason = Some(reason.into());
                Ok(())
            }
            from => Err(self.bad_transition(from, OrderState::Rejected)),
        }
    }

    /// Apply a fill of `qty` at `price`.
    ///
    /// ACKED -> PARTIALLY_FILLED, PARTIALLY_FILLED -> PARTIALLY_FILLED, and
    /// to FILLED once filled_quantity reaches quantity. The average fill
    /// price is the size-weighted running mean of all fills.
    pub fn apply_fill(&mut self, qty: i64, price: f64) -> Result<(), EngineError> {
        if !self.is_working() {
            return Err(self.bad_transition(self.state, OrderState::PartiallyFilled));
        }
        if qty <= 0 || qty > self.remaining() {
            return Err(EngineError::Overfill {
                order_id: self.id,
                fill_qty: qty,
                remaining: self.remaining(),
            });
        }

        let prev_value = self.average_fill_price * self.filled_quantity as f64;
        self.filled_quantity += qty;
        self.average_fill_price = (prev_value + price * qty as f64) / self.filled_quantity as f64;

        self.state = if self.remaining() == 0 {
            OrderState::Filled
        } else {
            OrderState::PartiallyFilled
        };
        Ok(())
    }

    /// {ACKED, PARTIALLY_FILLED} -> CANCELED
    pub fn cancel(&mut self) -> Result<(), EngineError> {
        match self.state {
            OrderState::Acked | OrderState::PartiallyFilled => {
                self.state = OrderState::Canceled;
                Ok(())
            }
            from => Err(self.bad_transition(from, OrderState::Canceled)),
        }
    }

    fn bad_transition(&self, from: OrderState, to: OrderState) -> EngineError {
        EngineError::InvalidTransition {
            order_id: self.id,
            from,
            to,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap()
    }

    fn market_buy(qty: i64) -> Order {
        Order::new(
            Symbol::new("AAPL"),
            Side::Buy,
            OrderType::Market,
            qty,
            None,
            None,
            TimeInForce::Gtc,
            ts(),
        )
    }

    #[test]
    fn test_order_id_generation_is_monotonic() {
        let id1 = next_order_id();
        let id2 = next_order_id();
        assert!(id2 > id1);
    }

    #[test]
    fn test_lifecycle_to_filled() {
        let mut order = market_buy(100);
        assert_eq!(order.state, OrderState::New);

        order.acknowledge().unwrap();
        assert_eq!(order.state, OrderState::Acked);

        order.apply_fill(40, 100.0).unwrap();
        assert_eq!(order.state, OrderState::PartiallyFilled);
        assert_eq!(order.remaining(), 60);

        order.apply_fill(60, 102.0).unwrap();
        assert_eq!(order.state, OrderState::Filled);
        assert_eq!(order.remaining(), 0);

        // Weighted average: (40*100 + 60*102) / 100 = 101.2
        assert!((order.average_fill_price - 101.2).abs() < 1e-9);
    }

    #[test]
    fn test_overfill_is_rejected() {
        let mut order = market_buy(100);
        order.acknowledge().unwrap();
        order.apply_fill(90, 100.0).unwrap();

        let err = order.apply_fill(20, 100.0).unwrap_err();
        assert!(matches!(err, EngineError::Overfill { remaining: 10, .. }));
        // State untouched by the failed fill
        assert_eq!(order.filled_quantity, 90);
        assert_eq!(order.state, OrderState::PartiallyFilled);
    }

    #[test]
    fn test_fill_before_ack_is_illegal() {
        let mut order = market_buy(10);
        assert!(matches!(
            order.apply_fill(10, 100.0),
            Err(EngineError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_cancel_from_new_is_illegal() {
        let mut order = market_buy(10);
        assert!(order.cancel().is_err());
    }

    #[test]
    fn test_terminal_orders_are_immutable() {
        let mut order = market_buy(10);
        order.acknowledge().unwrap();
        order.apply_fill(10, 100.0).unwrap();
        assert_eq!(order.state, OrderState::Filled);

        assert!(order.cancel().is_err());
        assert!(order.acknowledge().is_err());
        assert!(order.apply_fill(1, 100.0).is_err());
    }

    #[test]
    fn test_reject_only_from_new() {
        let mut order = market_buy(10);
        order.acknowledge().unwrap();
        assert!(order.reject("too late").is_err());

        let mut fresh = market_buy(10);
        fresh.reject("rate_limit").unwrap();
        assert_eq!(fresh.state, OrderState::Rejected);
        assert_eq!(fresh.reject_reason.as_deref(), Some("rate_limit"));
    }

    #[test]
    fn test_well_formed_checks() {
        let order = market_buy(0);
        assert!(!order.is_well_formed());

        let limit = Order::new(
            Symbol::new("AAPL"),
            Side::Buy,
            OrderType::Limit,
            10,
            None,
            None,
            TimeInForce::Day,
            ts(),
        );
        assert!(!limit.is_well_formed());
    }
}
