//! Cross-component OMS tests
//!
//! Exercises the order state machine, matching engine, validator, ledger,
//! and trade tracker together, plus the value-conservation and
//! lot-agreement invariants the engine asserts per fill.

use approx::assert_relative_eq;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::HashMap;

use papertrader::oms::execution::{FillAt, FillStatus, MatchingConfig, MatchingEngine};
use papertrader::oms::order::{Order, OrderState, OrderType, TimeInForce};
use papertrader::oms::validator::{OrderValidator, RiskLimits};
use papertrader::types::{Bar, Side, Symbol};
use papertrader::{Ledger, RejectReason, TradeTracker};

fn ts(day: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap()
}

fn sym() -> Symbol {
    Symbol::new("AAPL")
}

fn bar(day: u32, o: f64, h: f64, l: f64, c: f64, v: f64) -> Bar {
    Bar::new(sym(), ts(day), "1d", o, h, l, c, v).unwrap()
}

fn acked_market(side: Side, qty: i64, tif: TimeInForce) -> Order {
    let mut order = Order::new(sym(), side, OrderType::Market, qty, None, None, tif, ts(1));
    order.acknowledge().unwrap();
    order
}

/// The full pipeline for one order: match, then tracker, then ledger
fn fill_through(
    engine: &MatchingEngine,
    tracker: &mut TradeTracker,
    ledger: &mut Ledger,
    order: &mut Order,
    when: DateTime<Utc>,
) {
    let report = engine.execute(order).unwrap();
    if report.has_fill() {
        tracker
            .apply_fill(&order.symbol, order.side, &report, when, order.id)
            .unwrap();
        ledger.apply_fill(&order.symbol, order.side, &report).unwrap();
        tracker.check_consistency(ledger).unwrap();
    }
}

#[test]
fn test_pipeline_round_trip_restores_cash_plus_pnl() {
    let mut engine = MatchingEngine::new(MatchingConfig::default().with_fill_at(FillAt::Close));
    let mut tracker = TradeTracker::new();
    let mut ledger = Ledger::new(10_000.0);

    engine.set_bar(bar(1, 100.0, 101.0, 99.0, 100.0, 10_000.0));
    let mut buy = acked_market(Side::Buy, 100, TimeInForce::Gtc);
    fill_through(&engine, &mut tracker, &mut ledger, &mut buy, ts(1));

    assert_eq!(buy.state, OrderState::Filled);
    assert_eq!(ledger.position_qty(&sym()), 100);

    engine.set_bar(bar(2, 108.0, 109.0, 107.0, 108.0, 10_000.0));
    let mut sell = acked_market(Side::Sell, 100, TimeInForce::Gtc);
    fill_through(&engine, &mut tracker, &mut ledger, &mut sell, ts(2));

    // Round-trip law: one completed trade, ledger flat and pruned
    assert_eq!(tracker.completed().len(), 1);
    assert_relative_eq!(tracker.completed()[0].realized_pnl, 800.0, epsilon = 1e-9);
    assert_eq!(ledger.position_qty(&sym()), 0);
    assert!(ledger.position(&sym()).is_none());
    assert_relative_eq!(ledger.cash(), 10_800.0, epsilon = 1e-9);
}

#[test]
fn test_fill_at_mark_conserves_total_value() {
    // A fill executed exactly at the current mark moves value between cash
    // and position without creating or destroying any
    let mut engine = MatchingEngine::new(MatchingConfig::default());
    let mut tracker = TradeTracker::new();
    let mut ledger = Ledger::new(50_000.0);

    engine.set_bar(bar(1, 100.0, 101.0, 99.0, 100.0, 100_000.0));
    let before = ledger.total_value();

    let mut buy = acked_market(Side::Buy, 200, TimeInForce::Gtc);
    fill_through(&engine, &mut tracker, &mut ledger, &mut buy, ts(1));

    let mut prices = HashMap::new();
    prices.insert(sym(), 100.0);
    ledger.mark_to_market(&prices);

    assert_relative_eq!(ledger.total_value(), before, epsilon = 1e-9);
}

#[test]
fn test_slippage_is_the_only_value_leak_on_fill() {
    let config = MatchingConfig::default().with_slippage_bps(100.0); // 1%
    let mut engine = MatchingEngine::new(config);
    let mut tracker = TradeTracker::new();
    let mut ledger = Ledger::new(50_000.0);

    engine.set_bar(bar(1, 100.0, 101.0, 99.0, 100.0, 100_000.0));
    let before = ledger.total_value();

    let mut buy = acked_market(Side::Buy, 100, TimeInForce::Gtc);
    let report = engine.execute(&mut buy).unwrap();
    tracker.apply_fill(&sym(), Side::Buy, &report, ts(1), buy.id).unwrap();
    ledger.apply_fill(&sym(), Side::Buy, &report).unwrap();

    let mut prices = HashMap::new();
    prices.insert(sym(), 100.0);
    ledger.mark_to_market(&prices);

    // Paid 101 per share against a 100 mark: exactly the slippage leaks
    let leak = report.slippage * report.filled_qty as f64;
    assert_relative_eq!(before - ledger.total_value(), leak, epsilon = 1e-9);
    assert_relative_eq!(leak, 100.0, epsilon = 1e-9);
}

#[test]
fn test_average_fill_price_is_convex_combination() {
    let mut engine = MatchingEngine::new(MatchingConfig::default());
    let mut order = acked_market(Side::Buy, 150, TimeInForce::Gtc);

    // 100 shares at 100, then 50 at 110 across two bars
    engine.set_bar(bar(1, 100.0, 101.0, 99.0, 100.0, 1_000.0));
    let first = engine.execute(&mut order).unwrap();
    assert_eq!(first.status, FillStatus::PartiallyFilled);
    assert_eq!(first.filled_qty, 100);

    engine.set_bar(bar(2, 110.0, 111.0, 109.0, 110.0, 1_000.0));
    let second = engine.execute(&mut order).unwrap();
    assert_eq!(second.status, FillStatus::Filled);
    assert_eq!(second.filled_qty, 50);

    let min = first.fill_price.min(second.fill_price);
    let max = first.fill_price.max(second.fill_price);
    assert!(order.average_fill_price >= min && order.average_fill_price <= max);
    assert_relative_eq!(
        order.average_fill_price,
        (100.0 * 100.0 + 50.0 * 110.0) / 150.0,
        epsilon = 1e-9
    );
    assert!(order.filled_quantity <= order.quantity);
}

#[test]
fn test_validator_blocks_before_any_state_change() {
    let limits = RiskLimits::default().with_min_cash_buffer(1_000.0);
    let mut validator = OrderValidator::new(limits);
    let ledger = Ledger::new(10_000.0);

    let order = acked_market(Side::Buy, 100, TimeInForce::Gtc);
    // 100 * 100 = 10_000 > 10_000 - 1_000
    let verdict = validator.validate(&order, 100.0, &ledger, ts(1));
    assert_eq!(verdict, Err(RejectReason::InsufficientCapital));

    // Nothing was mutated anywhere
    assert_relative_eq!(ledger.cash(), 10_000.0, epsilon = 1e-9);
    assert!(ledger.position(&sym()).is_none());
}

#[test]
fn test_vwap_reference_price() {
    let config = MatchingConfig::default().with_fill_at(FillAt::Vwap);
    let mut engine = MatchingEngine::new(config);
    engine.set_bar(bar(1, 100.0, 120.0, 90.0, 105.0, 10_000.0));

    let mut order = acked_market(Side::Buy, 10, TimeInForce::Gtc);
    let report = engine.execute(&mut order).unwrap();

    // (120 + 90 + 105) / 3 = 105
    assert_relative_eq!(report.fill_price, 105.0, epsilon = 1e-9);
}

#[test]
fn test_split_fills_equal_single_fill_in_ledger_and_tracker() {
    // Two partial fills of 50 each behave exactly like one fill of 100 at
    // the quantity-weighted price
    let when = ts(1);

    let build = |fills: &[(i64, f64)]| {
        let mut tracker = TradeTracker::new();
        let mut ledger = Ledger::new(100_000.0);
        for (qty, price) in fills {
            let report = papertrader::oms::execution::FillReport {
                status: FillStatus::PartiallyFilled,
                filled_qty: *qty,
                fill_price: *price,
                slippage: 0.0,
                reason: None,
            };
            tracker.apply_fill(&sym(), Side::Buy, &report, when, 1).unwrap();
            ledger.apply_fill(&sym(), Side::Buy, &report).unwrap();
        }
        // Close everything at 120
        let close = papertrader::oms::execution::FillReport {
            status: FillStatus::Filled,
            filled_qty: fills.iter().map(|(q, _)| *q).sum(),
            fill_price: 120.0,
            slippage: 0.0,
            reason: None,
        };
        tracker.apply_fill(&sym(), Side::Sell, &close, when, 2).unwrap();
        ledger.apply_fill(&sym(), Side::Sell, &close).unwrap();
        (tracker.total_realized_pnl(), ledger.cash())
    };

    let (split_pnl, split_cash) = build(&[(50, 100.0), (50, 110.0)]);
    let (single_pnl, single_cash) = build(&[(100, 105.0)]);

    assert_relative_eq!(split_pnl, single_pnl, epsilon = 1e-9);
    assert_relative_eq!(split_cash, single_cash, epsilon = 1e-9);
}

#[test]
fn test_stop_limit_arms_then_respects_limit() {
    let mut engine = MatchingEngine::new(MatchingConfig::default());
    // Stop at 105 armed by the high; limit 106 caps the fill price
    let mut order = Order::new(
        sym(),
        Side::Buy,
        OrderType::StopLimit,
        10,
        Some(106.0),
        Some(105.0),
        TimeInForce::Gtc,
        ts(1),
    );
    order.acknowledge().unwrap();

    // Bar never reaches the stop: untouched
    engine.set_bar(bar(1, 100.0, 104.0, 99.0, 103.0, 10_000.0));
    let report = engine.execute(&mut order).unwrap();
    assert_eq!(report.filled_qty, 0);
    assert!(order.is_working());

    // Bar crosses the stop; close is 107 but the limit caps us at 106
    engine.set_bar(bar(2, 104.0, 108.0, 104.0, 107.0, 10_000.0));
    let report = engine.execute(&mut order).unwrap();
    assert_eq!(report.status, FillStatus::Filled);
    assert_relative_eq!(report.fill_price, 106.0, epsilon = 1e-9);
}

#[test]
fn test_ioc_partial_cancel_keeps_books_consistent() {
    let mut engine = MatchingEngine::new(MatchingConfig::default());
    let mut tracker = TradeTracker::new();
    let mut ledger = Ledger::new(100_000.0);

    engine.set_bar(bar(1, 100.0, 101.0, 99.0, 100.0, 500.0));
    let mut order = acked_market(Side::Buy, 100, TimeInForce::Ioc);

    let report = engine.execute(&mut order).unwrap();
    assert_eq!(report.status, FillStatus::Canceled);
    assert_eq!(report.filled_qty, 50);
    assert_eq!(order.state, OrderState::Canceled);
    assert_eq!(order.filled_quantity, 50);

    tracker.apply_fill(&sym(), Side::Buy, &report, ts(1), order.id).unwrap();
    ledger.apply_fill(&sym(), Side::Buy, &report).unwrap();
    tracker.check_consistency(&ledger).unwrap();

    assert_eq!(ledger.position_qty(&sym()), 50);
    assert_relative_eq!(ledger.cash(), 95_000.0, epsilon = 1e-9);
}
