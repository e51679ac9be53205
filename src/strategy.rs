//! Strategy contract and built-in strategies
//!
//! Strategies are deterministic functions of the market snapshot and their
//! own accumulated history. They never touch engine state; everything they
//! want to say goes through the returned signals.

use anyhow::Result;
use std::collections::HashMap;
use ta::indicators::SimpleMovingAverage;
use ta::Next;

use crate::config::Config;
use crate::types::{MarketSnapshot, Signal, SignalAction, Symbol};

/// Trading strategy trait
pub trait Strategy: Send {
    /// Strategy name for logging and result labeling
    fn name(&self) -> &'static str;

    /// Produce zero or more signals for the current snapshot.
    ///
    /// HOLD signals are inert and may be omitted entirely.
    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Vec<Signal>;
}

/// Create a strategy from configuration
pub fn create_strategy(config: &Config) -> Result<Box<dyn Strategy>> {
    match config.strategy_name.as_str() {
        "ma_cross" => {
            let params: MaCrossConfig = serde_json::from_value(config.strategy.clone())?;
            params.validate()?;
            Ok(Box::new(MaCrossStrategy::new(params)))
        }
        "buy_hold" => Ok(Box::new(BuyAndHoldStrategy::default())),
        other => anyhow::bail!("Unknown strategy: {}. Available: ma_cross, buy_hold", other),
    }
}

/// Moving-average crossover parameters
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct MaCrossConfig {
    #[serde(default = "default_fast")]
    pub fast_period: usize,
    #[serde(default = "default_slow")]
    pub slow_period: usize,
}

fn default_fast() -> usize {
    10
}

fn default_slow() -> usize {
    30
}

impl Default for MaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: default_fast(),
            slow_period: default_slow(),
        }
    }
}

impl MaCrossConfig {
    /// Moving-average windows must be nonzero or the indicators cannot be
    /// built; checked before any strategy is constructed from config
    pub fn validate(&self) -> Result<()> {
        if self.fast_period == 0 || self.slow_period == 0 {
            anyhow::bail!(
                "ma_cross periods must be nonzero (fast_period={}, slow_period={})",
                self.fast_period,
                self.slow_period
            );
        }
        Ok(())
    }
}

struct MaCrossState {
    fast: SimpleMovingAverage,
    slow: SimpleMovingAverage,
    bars_seen: usize,
    /// Sign of fast - slow on the previous bar
    prev_above: Option<bool>,
}

/// Classic fast/slow moving-average crossover, long-only
pub struct MaCrossStrategy {
    config: MaCrossConfig,
    states: HashMap<Symbol, MaCrossState>,
}

impl MaCrossStrategy {
    pub fn new(config: MaCrossConfig) -> Self {
        Self {
            config,
            states: HashMap::new(),
        }
    }
}

impl Strategy for MaCrossStrategy {
    fn name(&self) -> &'static str {
        "ma_cross"
    }

    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let Some(timestamp) = snapshot.timestamp else {
            return Vec::new();
        };

        // Sorted iteration keeps emission order reproducible
        let mut symbols: Vec<&Symbol> = snapshot.bars.keys().collect();
        symbols.sort();

        let mut signals = Vec::new();
        for symbol in symbols {
            let bar = &snapshot.bars[symbol];
            let state = self.states.entry(symbol.clone()).or_insert_with(|| MaCrossState {
                fast: SimpleMovingAverage::new(self.config.fast_period)
                    .expect("nonzero fast period"),
                slow: SimpleMovingAverage::new(self.config.slow_period)
                    .expect("nonzero slow period"),
                bars_seen: 0,
                prev_above: None,
            });

            let fast = state.fast.next(bar.close);
            let slow = state.slow.next(bar.close);
            state.bars_seen += 1;

            // No opinion until the slow window has real data
            if state.bars_seen < self.config.slow_period {
                continue;
            }

            let above = fast > slow;
            let crossed = state.prev_above.is_some_and(|prev| prev != above);
            state.prev_above = Some(above);

            if !crossed {
                continue;
            }

            let action = if above { SignalAction::Buy } else { SignalAction::Sell };
            signals.push(Signal::new(action, symbol.clone(), bar.close, timestamp));
        }
        signals
    }
}

/// Buys each symbol once on its first bar and holds
#[derive(Default)]
pub struct BuyAndHoldStrategy {
    entered: HashMap<Symbol, bool>,
}

impl Strategy for BuyAndHoldStrategy {
    fn name(&self) -> &'static str {
        "buy_hold"
    }

    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let Some(timestamp) = snapshot.timestamp else {
            return Vec::new();
        };

        let mut symbols: Vec<&Symbol> = snapshot.bars.keys().collect();
        symbols.sort();

        let mut signals = Vec::new();
        for symbol in symbols {
            if self.entered.get(symbol).copied().unwrap_or(false) {
                continue;
            }
            self.entered.insert(symbol.clone(), true);
            let bar = &snapshot.bars[symbol];
            signals.push(Signal::new(
                SignalAction::Buy,
                symbol.clone(),
                bar.close,
                timestamp,
            ));
        }
        signals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Bar;
    use chrono::{Duration, TimeZone, Utc};

    fn snapshot_for(symbol: &Symbol, close: f64, tick: i64) -> MarketSnapshot {
        let ts = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::days(tick);
        let bar = Bar::new(
            symbol.clone(),
            ts,
            "1d",
            close,
            close + 1.0,
            close - 1.0,
            close,
            10_000.0,
        )
        .unwrap();

        let mut snapshot = MarketSnapshot::new();
        snapshot.timestamp = Some(ts);
        snapshot.prices.insert(symbol.clone(), close);
        snapshot.bars.insert(symbol.clone(), bar);
        snapshot
    }

    #[test]
    fn test_ma_cross_emits_buy_on_upward_cross() {
        let symbol = Symbol::new("AAPL");
        let mut strategy = MaCrossStrategy::new(MaCrossConfig {
            fast_period: 2,
            slow_period: 4,
        });

        // Downtrend to seed the slow average above the fast one
        let mut all = Vec::new();
        let closes = [110.0, 108.0, 106.0, 104.0, 102.0, 120.0, 130.0];
        for (i, close) in closes.iter().enumerate() {
            let signals = strategy.generate_signals(&snapshot_for(&symbol, *close, i as i64));
            all.extend(signals);
        }

        assert!(all.iter().any(|s| s.action == SignalAction::Buy));
    }

    #[test]
    fn test_ma_cross_is_deterministic() {
        let symbol = Symbol::new("AAPL");
        let closes = [100.0, 99.0, 101.0, 105.0, 103.0, 97.0, 95.0, 104.0, 110.0];

        let run = || {
            let mut strategy = MaCrossStrategy::new(MaCrossConfig {
                fast_period: 2,
                slow_period: 3,
            });
            let mut actions = Vec::new();
            for (i, close) in closes.iter().enumerate() {
                for signal in strategy.generate_signals(&snapshot_for(&symbol, *close, i as i64)) {
                    actions.push((signal.action, signal.timestamp));
                }
            }
            actions
        };

        assert_eq!(run(), run());
    }

    #[test]
    fn test_create_strategy_rejects_zero_period() {
        let mut config = Config::default();
        config.strategy_name = "ma_cross".to_string();
        config.strategy = serde_json::json!({ "fast_period": 0, "slow_period": 30 });
        assert!(create_strategy(&config).is_err());

        config.strategy = serde_json::json!({ "fast_period": 10, "slow_period": 0 });
        assert!(create_strategy(&config).is_err());

        config.strategy = serde_json::json!({ "fast_period": 10, "slow_period": 30 });
        assert!(create_strategy(&config).is_ok());
    }

    #[test]
    fn test_buy_hold_enters_once() {
        let symbol = Symbol::new("AAPL");
        let mut strategy = BuyAndHoldStrategy::default();

        let first = strategy.generate_signals(&snapshot_for(&symbol, 100.0, 0));
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].action, SignalAction::Buy);

        let second = strategy.generate_signals(&snapshot_for(&symbol, 101.0, 1));
        assert!(second.is_empty());
    }
}
