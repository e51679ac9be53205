//! Core data types used across the trading system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::EngineError;

/// Trading symbol
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Symbol(pub String);

impl Symbol {
    pub fn new(s: impl Into<String>) -> Self {
        Symbol(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Symbol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// Signed multiplier for cash and position arithmetic: +1 buy, -1 sell
    pub fn multiplier(&self) -> i64 {
        match self {
            Side::Buy => 1,
            Side::Sell => -1,
        }
    }

    /// Slippage sign: buys pay up, sells give up
    pub fn slippage_sign(&self) -> f64 {
        match self {
            Side::Buy => 1.0,
            Side::Sell => -1.0,
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Side::Buy => write!(f, "buy"),
            Side::Sell => write!(f, "sell"),
        }
    }
}

/// One OHLCV sample over a fixed timeframe. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bar {
    pub symbol: Symbol,
    pub timestamp: DateTime<Utc>,
    pub timeframe: String,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Bar {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        symbol: Symbol,
        timestamp: DateTime<Utc>,
        timeframe: impl Into<String>,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, EngineError> {
        let bar = Bar {
            symbol,
            timestamp,
            timeframe: timeframe.into(),
            open,
            high,
            low,
            close,
            volume,
        };
        bar.validate()?;
        Ok(bar)
    }

    /// Check the OHLCV shape: low <= open,close <= high and volume >= 0
    pub fn validate(&self) -> Result<(), EngineError> {
        let in_range = |p: f64| p >= self.low && p <= self.high;
        if !in_range(self.open) || !in_range(self.close) || self.low > self.high {
            return Err(EngineError::MalformedBar {
                symbol: self.symbol.clone(),
                detail: format!(
                    "OHLC out of range: O={} H={} L={} C={}",
                    self.open, self.high, self.low, self.close
                ),
            });
        }
        if self.volume < 0.0 || !self.volume.is_finite() {
            return Err(EngineError::MalformedBar {
                symbol: self.symbol.clone(),
                detail: format!("negative or non-finite volume: {}", self.volume),
            });
        }
        Ok(())
    }

    /// Typical price, used as the vwap fill reference
    pub fn vwap(&self) -> f64 {
        (self.high + self.low + self.close) / 3.0
    }
}

/// Point-in-time cross-sectional view of the market, built once per tick
#[derive(Debug, Clone, Default)]
pub struct MarketSnapshot {
    pub timestamp: Option<DateTime<Utc>>,
    pub prices: HashMap<Symbol, f64>,
    pub bars: HashMap<Symbol, Bar>,
}

impl MarketSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn price(&self, symbol: &Symbol) -> Option<f64> {
        self.prices.get(symbol).copied()
    }

    pub fn bar(&self, symbol: &Symbol) -> Option<&Bar> {
        self.bars.get(symbol)
    }
}

/// Strategy intent for one symbol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Trading signal emitted by a strategy (or by the risk manager as an exit)
#[derive(Debug, Clone, PartialEq)]
pub struct Signal {
    pub action: SignalAction,
    pub symbol: Symbol,
    /// Price the strategy observed when deciding; sizing reference only
    pub price: f64,
    pub timestamp: DateTime<Utc>,
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub confidence: Option<f64>,
}

impl Signal {
    pub fn new(
        action: SignalAction,
        symbol: Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Signal {
            action,
            symbol,
            price,
            timestamp,
            stop_loss: None,
            take_profit: None,
            confidence: None,
        }
    }

    pub fn with_stop_loss(mut self, stop: f64) -> Self {
        self.stop_loss = Some(stop);
        self
    }

    pub fn with_take_profit(mut self, target: f64) -> Self {
        self.take_profit = Some(target);
        self
    }

    pub fn is_hold(&self) -> bool {
        self.action == SignalAction::Hold
    }
}
