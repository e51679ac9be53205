//! End-to-end backtest engine tests
//!
//! Covers the full signal -> size -> validate -> match -> ledger pipeline:
//! simple round trips, slippage asymmetry, volume caps with IOC, trailing
//! stops, the portfolio circuit breaker, FIFO lot accounting, and
//! run-to-run determinism.

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::collections::HashMap;

use papertrader::oms::execution::FillAt;
use papertrader::oms::order::TimeInForce;
use papertrader::risk::StopConfig;
use papertrader::strategy::{MaCrossConfig, MaCrossStrategy, Strategy};
use papertrader::types::{Bar, MarketSnapshot, Signal, SignalAction, Symbol};
use papertrader::{BacktestResult, Backtester, Config, PositionSizer};

// =============================================================================
// Test scaffolding
// =============================================================================

fn t(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
}

fn bar(symbol: &str, ts: DateTime<Utc>, o: f64, h: f64, l: f64, c: f64, v: f64) -> Bar {
    Bar::new(Symbol::new(symbol), ts, "1d", o, h, l, c, v).unwrap()
}

/// Base config: no stops, no breaker, fills at close with no slippage
fn base_config(capital: f64) -> Config {
    let mut config = Config::default();
    config.engine.initial_capital = capital;
    config.engine.status_log_interval = 0;
    config.engine.log_orders = false;
    config.matching.fill_at = FillAt::Close;
    config.matching.slippage_bps = 0.0;
    config.matching.max_volume_pct = 0.1;
    config.stops = StopConfig {
        position_stop_pct: None,
        trailing_stop_pct: None,
        use_trailing_stops: false,
        portfolio_stop_pct: 1.0,
        max_drawdown_pct: 1.0,
        enable_circuit_breaker: false,
    };
    config.sizer = PositionSizer::PercentOfEquity { pct: 1.0 };
    config
}

/// Emits scripted (timestamp, symbol, action) entries and nothing else
struct ScriptedStrategy {
    script: Vec<(DateTime<Utc>, Symbol, SignalAction)>,
}

impl Strategy for ScriptedStrategy {
    fn name(&self) -> &'static str {
        "scripted"
    }

    fn generate_signals(&mut self, snapshot: &MarketSnapshot) -> Vec<Signal> {
        let Some(ts) = snapshot.timestamp else {
            return Vec::new();
        };
        self.script
            .iter()
            .filter(|(when, _, _)| *when == ts)
            .map(|(_, symbol, action)| {
                let price = snapshot.price(symbol).unwrap_or(0.0);
                Signal::new(*action, symbol.clone(), price, ts)
            })
            .collect()
    }
}

fn scripted(script: Vec<(DateTime<Utc>, &str, SignalAction)>) -> Box<ScriptedStrategy> {
    Box::new(ScriptedStrategy {
        script: script
            .into_iter()
            .map(|(ts, s, a)| (ts, Symbol::new(s), a))
            .collect(),
    })
}

fn run_backtest(config: Config, strategy: Box<dyn Strategy>, bars: Vec<Bar>) -> BacktestResult {
    let mut data: HashMap<Symbol, Vec<Bar>> = HashMap::new();
    for bar in bars {
        data.entry(bar.symbol.clone()).or_default().push(bar);
    }
    let mut backtester = Backtester::new(config, strategy).unwrap();
    backtester.run(data).unwrap()
}

// =============================================================================
// Scenario S1: simple round trip
// =============================================================================

#[test]
fn test_simple_round_trip() {
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 10_000.0),
        bar("X", t(2), 100.0, 110.0, 100.0, 110.0, 10_000.0),
        bar("X", t(3), 110.0, 112.0, 108.0, 108.0, 10_000.0),
    ];
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(3), "X", SignalAction::Sell),
    ]);

    let result = run_backtest(base_config(10_000.0), strategy, bars);

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.quantity, 100); // floor(10_000 / 100)
    assert!((trade.entry_price - 100.0).abs() < 1e-9);
    assert!((trade.exit_price - 108.0).abs() < 1e-9);
    assert!((trade.realized_pnl - 800.0).abs() < 1e-9);

    assert!((result.final_value - 10_800.0).abs() < 1e-9);
    assert!((result.total_return_pct - 8.0).abs() < 1e-9);

    // Equity curve marks the open position along the way
    let values: Vec<f64> = result.equity_curve.iter().map(|&(_, v)| v).collect();
    assert!((values[0] - 10_000.0).abs() < 1e-9);
    assert!((values[1] - 11_000.0).abs() < 1e-9);
    assert!((values[2] - 10_800.0).abs() < 1e-9);
}

// =============================================================================
// Scenario S2: slippage asymmetry
// =============================================================================

#[test]
fn test_slippage_asymmetry() {
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 10_000.0),
        bar("X", t(2), 100.0, 110.0, 100.0, 110.0, 10_000.0),
        bar("X", t(3), 110.0, 112.0, 108.0, 108.0, 10_000.0),
    ];
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(3), "X", SignalAction::Sell),
    ]);

    let mut config = base_config(10_000.0);
    config.matching.slippage_bps = 50.0;

    let result = run_backtest(config, strategy, bars);

    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    // Buys pay up, sells give up
    assert!((trade.entry_price - 100.50).abs() < 1e-9);
    assert!((trade.exit_price - 107.46).abs() < 1e-9);
    assert!((trade.realized_pnl - 696.0).abs() < 1e-6);
}

// =============================================================================
// Scenario S3: volume cap + IOC
// =============================================================================

#[test]
fn test_volume_cap_with_ioc() {
    let bars = vec![bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 500.0)];
    let strategy = scripted(vec![(t(1), "X", SignalAction::Buy)]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 100 };
    config.matching.default_tif = TimeInForce::Ioc;

    let result = run_backtest(config, strategy, bars);

    // Available = floor(500 * 0.1) = 50; the IOC remainder was canceled.
    // The end-of-stream close flattens the 50 shares into one trade.
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].quantity, 50);
    assert!((result.trades[0].entry_price - 100.0).abs() < 1e-9);
    assert!((result.final_value - 100_000.0).abs() < 1e-9);

    // While held, cash was down by exactly 50 * close
    assert!((result.equity_curve[0].1 - 100_000.0).abs() < 1e-9);
}

// =============================================================================
// Scenario S4: trailing stop
// =============================================================================

#[test]
fn test_trailing_stop_exit() {
    let bars = vec![
        bar("AAPL", t(1), 100.0, 100.5, 99.5, 100.0, 100_000.0),
        bar("AAPL", t(2), 100.0, 105.0, 100.0, 105.0, 100_000.0),
        bar("AAPL", t(3), 105.0, 110.0, 105.0, 110.0, 100_000.0),
        bar("AAPL", t(4), 110.0, 110.0, 103.0, 104.0, 100_000.0),
        bar("AAPL", t(5), 104.0, 104.0, 103.0, 104.0, 100_000.0),
    ];
    let strategy = scripted(vec![(t(1), "AAPL", SignalAction::Buy)]);

    let mut config = base_config(10_000.0);
    config.stops = StopConfig {
        position_stop_pct: Some(0.02),
        trailing_stop_pct: Some(0.05),
        use_trailing_stops: true,
        portfolio_stop_pct: 1.0,
        max_drawdown_pct: 1.0,
        enable_circuit_breaker: false,
    };

    let result = run_backtest(config, strategy, bars);

    // After the 110 print the trailing trigger is 104.50; the 104 close
    // fires it and the whole position exits at the bar's reference price
    assert_eq!(result.trades.len(), 1);
    let trade = &result.trades[0];
    assert_eq!(trade.quantity, 100);
    assert_eq!(trade.exit_time, t(4));
    assert!((trade.exit_price - 104.0).abs() < 1e-9);
    assert!((trade.realized_pnl - 400.0).abs() < 1e-9);
}

// =============================================================================
// Scenario S5: circuit breaker
// =============================================================================

#[test]
fn test_circuit_breaker_suppresses_new_entries() {
    let bars = vec![
        bar("X", t(1), 100.0, 100.5, 99.5, 100.0, 1_000_000.0),
        bar("Y", t(1), 50.0, 50.5, 49.5, 50.0, 1_000_000.0),
        bar("X", t(2), 100.0, 105.0, 100.0, 105.0, 1_000_000.0),
        bar("Y", t(2), 50.0, 50.5, 49.5, 50.0, 1_000_000.0),
        bar("X", t(3), 105.0, 105.0, 94.0, 94.499, 1_000_000.0),
        bar("Y", t(3), 50.0, 50.5, 49.5, 50.0, 1_000_000.0),
        bar("X", t(4), 94.5, 95.0, 94.0, 94.5, 1_000_000.0),
        bar("Y", t(4), 50.0, 50.5, 49.5, 50.0, 1_000_000.0),
    ];
    // Entry in X, then an attempted entry in Y after the drawdown
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(4), "Y", SignalAction::Buy),
    ]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 1000 };
    config.stops.enable_circuit_breaker = true;
    config.stops.max_drawdown_pct = 0.10;
    config.stops.portfolio_stop_pct = 1.0;

    let result = run_backtest(config, strategy, bars);

    // Equity: 100_000 -> 105_000 (HWM) -> 94_499; 94_499 / 105_000 < 0.90
    // trips the breaker, so the t4 BUY in Y never becomes an order
    assert_eq!(result.orders_submitted, 1);
    assert!(result.trades.iter().all(|t| t.symbol == Symbol::new("X")));
}

// =============================================================================
// Scenario S6: FIFO across partial entries
// =============================================================================

#[test]
fn test_fifo_partial_entries_and_exit() {
    // Volume cap of 10% x 1000 = 100 shares per bar forces the 150-share
    // GTC order to fill as 100 on day 1 and 50 on day 2
    let bars = vec![
        bar("X", t(1), 10.0, 10.5, 9.5, 10.0, 1_000.0),
        bar("X", t(2), 12.0, 12.5, 11.5, 12.0, 1_000.0),
        bar("X", t(3), 15.0, 15.5, 14.5, 15.0, 10_000.0),
    ];
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(3), "X", SignalAction::Sell),
    ]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 150 };
    config.matching.default_tif = TimeInForce::Gtc;

    let result = run_backtest(config, strategy, bars);

    // FIFO: the 100 @ 10 lot closes first, then the 50 @ 12 lot
    assert_eq!(result.trades.len(), 2);
    assert_eq!(result.trades[0].quantity, 100);
    assert!((result.trades[0].entry_price - 10.0).abs() < 1e-9);
    assert!((result.trades[0].realized_pnl - 500.0).abs() < 1e-9);
    assert_eq!(result.trades[1].quantity, 50);
    assert!((result.trades[1].entry_price - 12.0).abs() < 1e-9);
    assert!((result.trades[1].realized_pnl - 150.0).abs() < 1e-9);
}

// =============================================================================
// Boundary behaviors
// =============================================================================

#[test]
fn test_fok_one_share_short_leaves_ledger_untouched() {
    // Available = floor(990 * 0.1) = 99 against a 100-share FOK order
    let bars = vec![bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 990.0)];
    let strategy = scripted(vec![(t(1), "X", SignalAction::Buy)]);

    let mut config = base_config(50_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 100 };
    config.matching.default_tif = TimeInForce::Fok;

    let result = run_backtest(config, strategy, bars);

    assert!(result.trades.is_empty());
    assert_eq!(result.orders_rejected, 1);
    assert!((result.final_value - 50_000.0).abs() < 1e-9);
}

#[test]
fn test_day_order_cancels_at_session_boundary() {
    // Partial fill on day 1; the DAY remainder must not touch day 2
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 500.0),
        bar("X", t(2), 100.0, 101.0, 99.0, 100.0, 500.0),
    ];
    let strategy = scripted(vec![(t(1), "X", SignalAction::Buy)]);

    let mut config = base_config(50_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 100 };
    config.matching.default_tif = TimeInForce::Day;

    let result = run_backtest(config, strategy, bars);

    // 50 filled on day 1, remainder expired, position force-closed at end
    assert_eq!(result.trades.len(), 1);
    assert_eq!(result.trades[0].quantity, 50);
}

#[test]
fn test_gtc_remainder_fills_on_later_bars() {
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 500.0),
        bar("X", t(2), 102.0, 103.0, 101.0, 102.0, 500.0),
    ];
    let strategy = scripted(vec![(t(1), "X", SignalAction::Buy)]);

    let mut config = base_config(50_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 100 };
    config.matching.default_tif = TimeInForce::Gtc;

    let result = run_backtest(config, strategy, bars);

    // 50 @ 100 on day 1, 50 @ 102 on day 2, force-closed at 102
    assert_eq!(result.trades.len(), 2);
    assert_eq!(result.trades[0].quantity, 50);
    assert!((result.trades[0].entry_price - 100.0).abs() < 1e-9);
    assert_eq!(result.trades[1].quantity, 50);
    assert!((result.trades[1].entry_price - 102.0).abs() < 1e-9);
}

// =============================================================================
// Determinism
// =============================================================================

/// Deterministic synthetic bar series with trend and pseudo-noise
fn generate_bars(symbol: &str, count: usize, base_price: f64) -> Vec<Bar> {
    let mut bars = Vec::with_capacity(count);
    let mut price = base_price;
    let start = Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();

    for i in 0..count {
        let trend = if i % 50 < 25 { 0.004 } else { -0.003 };
        let noise = ((i * 17 + 31) % 100) as f64 / 100.0 - 0.5;
        price *= 1.0 + trend + noise * 0.01;

        let range = price * 0.02;
        let open = price - range * 0.3;
        let close = price + range * 0.2;
        let high = open.max(close) + range * 0.4;
        let low = open.min(close) - range * 0.3;

        bars.push(bar(
            symbol,
            start + Duration::days(i as i64),
            open,
            high,
            low,
            close,
            1_000_000.0 + i as f64 * 1_000.0,
        ));
    }
    bars
}

#[test]
fn test_identical_runs_are_bit_identical() {
    let run = || {
        let mut config = base_config(100_000.0);
        config.stops = StopConfig::default();
        config.sizer = PositionSizer::PercentOfEquity { pct: 0.25 };
        let strategy = Box::new(MaCrossStrategy::new(MaCrossConfig {
            fast_period: 5,
            slow_period: 20,
        }));
        let mut bars = generate_bars("AAPL", 250, 150.0);
        bars.extend(generate_bars("MSFT", 250, 300.0));
        run_backtest(config, strategy, bars)
    };

    let a = run();
    let b = run();

    assert_eq!(a.trades, b.trades);
    assert_eq!(a.equity_curve, b.equity_curve);
    assert_eq!(a.orders_submitted, b.orders_submitted);
    assert_eq!(a.orders_rejected, b.orders_rejected);
}

// =============================================================================
// Multi-symbol and validation integration
// =============================================================================

#[test]
fn test_multi_symbol_unaligned_timestamps() {
    // Y starts a day later and skips a day; the engine merges by timestamp
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 100_000.0),
        bar("X", t(2), 100.0, 101.0, 99.0, 100.0, 100_000.0),
        bar("Y", t(2), 50.0, 51.0, 49.0, 50.0, 100_000.0),
        bar("X", t(3), 100.0, 101.0, 99.0, 100.0, 100_000.0),
        bar("Y", t(4), 52.0, 53.0, 51.0, 52.0, 100_000.0),
    ];
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(2), "Y", SignalAction::Buy),
    ]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 10 };

    let result = run_backtest(config, strategy, bars);

    // Both entries fill and both are force-closed at end of stream
    assert_eq!(result.trades.len(), 2);
    let symbols: Vec<&str> = result.trades.iter().map(|t| t.symbol.as_str()).collect();
    assert!(symbols.contains(&"X"));
    assert!(symbols.contains(&"Y"));
}

#[test]
fn test_exposure_cap_rejects_second_entry() {
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 1_000_000.0),
        bar("Y", t(1), 100.0, 101.0, 99.0, 100.0, 1_000_000.0),
    ];
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(1), "Y", SignalAction::Buy),
    ]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 100 };
    config.risk.max_total_exposure = 15_000.0;

    let result = run_backtest(config, strategy, bars);

    // First 10_000 entry passes; the second would take exposure to 20_000
    assert_eq!(result.orders_submitted, 2);
    assert_eq!(result.orders_rejected, 1);
    assert_eq!(result.trades.len(), 1);
}

#[test]
fn test_consecutive_duplicate_signals_are_dropped() {
    let bars = vec![
        bar("X", t(1), 100.0, 101.0, 99.0, 100.0, 1_000_000.0),
        bar("X", t(2), 100.0, 101.0, 99.0, 100.0, 1_000_000.0),
        bar("X", t(3), 100.0, 101.0, 99.0, 100.0, 1_000_000.0),
    ];
    // Three BUYs in a row: only the first becomes an order
    let strategy = scripted(vec![
        (t(1), "X", SignalAction::Buy),
        (t(2), "X", SignalAction::Buy),
        (t(3), "X", SignalAction::Buy),
    ]);

    let mut config = base_config(100_000.0);
    config.sizer = PositionSizer::Fixed { quantity: 10 };

    let result = run_backtest(config, strategy, bars);
    assert_eq!(result.orders_submitted, 1);
}
