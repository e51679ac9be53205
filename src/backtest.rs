//! Backtesting engine
//!
//! Composes the matching engine, validator, risk manager, ledger, and trade
//! tracker over a chronologically merged bar stream. Strictly single
//! threaded and clocked by bar timestamps, so two runs over the same data
//! and config produce identical trade lists and equity curves.
//!
//! Per tick ordering: bar contexts update, working orders sweep, mark to
//! market, stops evaluate (before the strategy, so an imminent exit can
//! never be overridden by a same-tick entry), then strategy signals are
//! sized, validated, and matched, exits first.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use itertools::Itertools;
use std::collections::HashMap;
use ta::indicators::AverageTrueRange;
use ta::{DataItem, Next};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::RejectReason;
use crate::oms::audit::{AuditEvent, OrderAuditLog};
use crate::oms::execution::{day_expired, FillReport, FillStatus, MatchingEngine};
use crate::oms::order::{Order, OrderId, OrderType, TimeInForce};
use crate::oms::validator::OrderValidator;
use crate::portfolio::Ledger;
use crate::risk::RiskManager;
use crate::sizing::PositionSizer;
use crate::strategy::Strategy;
use crate::trades::{CompletedTrade, EquityTracker, TradeTracker};
use crate::types::{Bar, MarketSnapshot, Side, Signal, SignalAction, Symbol};

/// Results bundle from a completed backtest
#[derive(Debug)]
pub struct BacktestResult {
    pub initial_capital: f64,
    pub final_value: f64,
    pub total_return_pct: f64,
    pub trades: Vec<CompletedTrade>,
    pub equity_curve: Vec<(DateTime<Utc>, f64)>,
    pub bars_processed: u64,
    pub orders_submitted: u64,
    pub orders_rejected: u64,
}

/// Backtest engine
pub struct Backtester {
    config: Config,
    strategy: Box<dyn Strategy>,
    matching: MatchingEngine,
    validator: OrderValidator,
    risk: RiskManager,
    ledger: Ledger,
    tracker: TradeTracker,
    equity: EquityTracker,
    sizer: PositionSizer,
    /// Working GTC/DAY orders carried across bars, in submission order
    working_orders: Vec<Order>,
    /// Stop-loss levels attached to orders still awaiting their first fill
    pending_stop_levels: HashMap<OrderId, f64>,
    /// Last emitted action per symbol, for consecutive-duplicate filtering
    last_emitted: HashMap<Symbol, SignalAction>,
    atr_state: HashMap<Symbol, AverageTrueRange>,
    latest_atr: HashMap<Symbol, f64>,
    current_prices: HashMap<Symbol, f64>,
    audit: Option<OrderAuditLog>,
    orders_submitted: u64,
    orders_rejected: u64,
}

impl Backtester {
    pub fn new(config: Config, strategy: Box<dyn Strategy>) -> Result<Self> {
        let audit = match &config.engine.audit_log {
            Some(path) => Some(OrderAuditLog::open(path)?),
            None => None,
        };

        Ok(Backtester {
            matching: MatchingEngine::new(config.matching.clone()),
            validator: OrderValidator::new(config.risk.clone()),
            risk: RiskManager::new(config.stops.clone(), config.engine.initial_capital),
            ledger: Ledger::new(config.engine.initial_capital),
            tracker: TradeTracker::new(),
            equity: EquityTracker::new(),
            sizer: config.sizer.clone(),
            working_orders: Vec::new(),
            pending_stop_levels: HashMap::new(),
            last_emitted: HashMap::new(),
            atr_state: HashMap::new(),
            latest_atr: HashMap::new(),
            current_prices: HashMap::new(),
            audit,
            orders_submitted: 0,
            orders_rejected: 0,
            config,
            strategy,
        })
    }

    /// Run the backtest over per-symbol bar series.
    ///
    /// Series are merged by timestamp; bars sharing a timestamp are handled
    /// within one tick, in symbol order. Bars need not be clock-aligned
    /// across symbols.
    pub fn run(&mut self, data: HashMap<Symbol, Vec<Bar>>) -> Result<BacktestResult> {
        let timeline = merge_timeline(data)?;
        if timeline.is_empty() {
            anyhow::bail!("no bars to backtest");
        }

        info!(
            strategy = self.strategy.name(),
            initial_capital = self.config.engine.initial_capital,
            ticks = timeline.len(),
            "starting backtest"
        );

        let mut bars_processed: u64 = 0;
        let mut last_tick: Option<DateTime<Utc>> = None;

        for (timestamp, bars) in &timeline {
            bars_processed += bars.len() as u64;
            self.process_tick(*timestamp, bars)?;
            last_tick = Some(*timestamp);

            let tick_no = self.equity.points().len() as u64;
            if self.config.engine.status_log_interval > 0
                && tick_no % self.config.engine.status_log_interval == 0
            {
                info!(
                    tick = tick_no,
                    equity = self.ledger.total_value(),
                    positions = self.ledger.open_position_count(),
                    "backtest progress"
                );
            }
        }

        let final_ts = last_tick.expect("timeline is non-empty");
        self.close_all_positions(final_ts)?;
        self.equity.record(final_ts, self.ledger.total_value())?;

        let final_value = self.ledger.total_value();
        let initial_capital = self.config.engine.initial_capital;
        let result = BacktestResult {
            initial_capital,
            final_value,
            total_return_pct: (final_value - initial_capital) / initial_capital * 100.0,
            trades: std::mem::take(&mut self.tracker).into_completed(),
            equity_curve: self.equity.points().to_vec(),
            bars_processed,
            orders_submitted: self.orders_submitted,
            orders_rejected: self.orders_rejected,
        };

        info!(
            final_value = result.final_value,
            return_pct = result.total_return_pct,
            trades = result.trades.len(),
            rejected = result.orders_rejected,
            "backtest complete"
        );
        Ok(result)
    }

    fn process_tick(&mut self, timestamp: DateTime<Utc>, bars: &[Bar]) -> Result<()> {
        // 1. Refresh bar contexts, prices, and ATR state
        for bar in bars {
            self.matching.set_bar(bar.clone());
            let reference = self.matching.reference_price(bar);
            self.current_prices.insert(bar.symbol.clone(), reference);
            self.update_atr(bar);
        }

        // 2. Sweep working orders against the new bars
        self.sweep_working_orders(timestamp, bars)?;

        // 3. Mark to market and fold equity into breaker state
        self.ledger.mark_to_market(&self.current_prices);
        self.risk
            .update_equity(self.ledger.total_value(), timestamp);

        // 4. Stops fire before the strategy sees anything
        let exits = self.risk.evaluate(&self.current_prices, &self.ledger, timestamp);
        for exit in exits {
            let order = Order::new(
                exit.symbol.clone(),
                Side::Sell,
                OrderType::Market,
                exit.quantity,
                None,
                None,
                TimeInForce::Ioc,
                timestamp,
            );
            debug!(symbol = %exit.symbol, reason = exit.reason.code(), "submitting stop exit");
            self.submit(order, timestamp, None)?;
        }

        // 5. Strategy signals, suppressed while the breaker is tripped
        if !self.risk.breaker_active() && self.config.trading.enable_trading {
            let snapshot = self.build_snapshot(timestamp, bars);
            let signals = self.strategy.generate_signals(&snapshot);
            for signal in signals {
                if signal.is_hold() {
                    continue;
                }
                // Drop a repeat of the immediately prior emission
                if self.last_emitted.get(&signal.symbol) == Some(&signal.action) {
                    continue;
                }
                self.last_emitted.insert(signal.symbol.clone(), signal.action);
                self.process_signal(&signal, timestamp)?;
            }
        }

        // 6. Record equity after all fills for this tick
        self.ledger.mark_to_market(&self.current_prices);
        self.equity.record(timestamp, self.ledger.total_value())?;
        Ok(())
    }

    /// Size, validate, and submit one strategy signal
    fn process_signal(&mut self, signal: &Signal, timestamp: DateTime<Utc>) -> Result<()> {
        let Some(reference) = self.matching.reference_price_for(&signal.symbol) else {
            return Ok(());
        };

        let (side, quantity) = match signal.action {
            SignalAction::Buy => {
                let atr = self.latest_atr.get(&signal.symbol).copied();
                let qty = self
                    .sizer
                    .qty(signal, self.ledger.total_value(), reference, atr);
                (Side::Buy, qty)
            }
            // Long-only: a sell signal flattens the open position
            SignalAction::Sell => (Side::Sell, self.ledger.position_qty(&signal.symbol)),
            SignalAction::Hold => return Ok(()),
        };

        if quantity <= 0 {
            debug!(symbol = %signal.symbol, action = ?signal.action, "signal sized to zero, skipped");
            return Ok(());
        }

        let order = Order::new(
            signal.symbol.clone(),
            side,
            OrderType::Market,
            quantity,
            None,
            None,
            self.matching.config().default_tif,
            timestamp,
        );
        self.submit(order, timestamp, signal.stop_loss)
    }

    /// Validate -> acknowledge -> match -> apply, recording audit events
    fn submit(
        &mut self,
        mut order: Order,
        timestamp: DateTime<Utc>,
        stop_level: Option<f64>,
    ) -> Result<()> {
        let reference = self
            .matching
            .reference_price_for(&order.symbol)
            .unwrap_or(0.0);

        self.audit_event(timestamp, AuditEvent::Sent, &order, None, None)?;
        self.orders_submitted += 1;

        if let Err(reason) = self
            .validator
            .validate(&order, reference, &self.ledger, timestamp)
        {
            order.reject(reason.code())?;
            self.orders_rejected += 1;
            self.audit_event(timestamp, AuditEvent::Rejected, &order, None, Some(reason.code()))?;
            if self.config.engine.log_orders {
                warn!(symbol = %order.symbol, reason = reason.code(), "order rejected pre-trade");
            }
            return Ok(());
        }

        order.acknowledge()?;
        self.audit_event(timestamp, AuditEvent::Acked, &order, None, None)?;
        if let Some(level) = stop_level {
            self.pending_stop_levels.insert(order.id, level);
        }

        let report = self.matching.execute(&mut order)?;
        self.apply_report(&order, &report, timestamp)?;

        if order.is_working() {
            self.working_orders.push(order);
        } else {
            self.pending_stop_levels.remove(&order.id);
        }
        Ok(())
    }

    /// Attempt fills for carried orders whose symbol printed a new bar
    fn sweep_working_orders(&mut self, timestamp: DateTime<Utc>, bars: &[Bar]) -> Result<()> {
        if self.working_orders.is_empty() {
            return Ok(());
        }

        let fresh: Vec<&Symbol> = bars.iter().map(|b| &b.symbol).collect();
        let mut carried = Vec::with_capacity(self.working_orders.len());

        for mut order in std::mem::take(&mut self.working_orders) {
            if day_expired(&order, timestamp) {
                order.cancel()?;
                self.audit_event(timestamp, AuditEvent::Canceled, &order, None, Some("session_end"))?;
                self.pending_stop_levels.remove(&order.id);
                continue;
            }

            if !fresh.contains(&&order.symbol) {
                carried.push(order);
                continue;
            }

            let report = self.matching.execute(&mut order)?;
            self.apply_report(&order, &report, timestamp)?;

            if order.is_working() {
                carried.push(order);
            } else {
                self.pending_stop_levels.remove(&order.id);
            }
        }

        self.working_orders = carried;
        Ok(())
    }

    /// Fold one fill report through tracker, ledger, and risk state.
    ///
    /// The tracker goes first so its FIFO view is checked against the
    /// ledger only after both sides of the update land.
    fn apply_report(
        &mut self,
        order: &Order,
        report: &FillReport,
        timestamp: DateTime<Utc>,
    ) -> Result<()> {
        match report.status {
            FillStatus::Rejected => {
                self.orders_rejected += 1;
                let code = report.reason.as_ref().map(RejectReason::code);
                self.audit_event(timestamp, AuditEvent::Rejected, order, None, code)?;
                return Ok(());
            }
            FillStatus::Canceled if !report.has_fill() => {
                self.audit_event(timestamp, AuditEvent::Canceled, order, None, None)?;
                return Ok(());
            }
            _ => {}
        }

        if report.has_fill() {
            self.tracker
                .apply_fill(&order.symbol, order.side, report, timestamp, order.id)?;
            self.ledger.apply_fill(&order.symbol, order.side, report)?;
            self.tracker.check_consistency(&self.ledger)?;

            match order.side {
                Side::Buy => {
                    let level = self.pending_stop_levels.get(&order.id).copied();
                    self.risk
                        .track_entry(&order.symbol, report.fill_price, timestamp, level);
                }
                Side::Sell => {
                    if self.ledger.position_qty(&order.symbol) == 0 {
                        self.risk.clear(&order.symbol);
                    }
                }
            }

            if self.config.engine.log_orders {
                info!(
                    symbol = %order.symbol,
                    side = %order.side,
                    qty = report.filled_qty,
                    price = report.fill_price,
                    slippage = report.slippage,
                    status = ?report.status,
                    "fill"
                );
            }

            let event = match report.status {
                FillStatus::Filled => AuditEvent::Filled,
                _ => AuditEvent::Partial,
            };
            self.audit_event(timestamp, event, order, Some(report.fill_price), None)?;
        }
        Ok(())
    }

    /// Synthetic market exit for everything still open at end of stream
    fn close_all_positions(&mut self, timestamp: DateTime<Utc>) -> Result<()> {
        let mut open: Vec<(Symbol, i64)> = self
            .ledger
            .positions()
            .map(|(s, p)| (s.clone(), p.quantity))
            .collect();
        open.sort();

        for (symbol, quantity) in open {
            let Some(reference) = self.current_prices.get(&symbol).copied() else {
                warn!(symbol = %symbol, "no price to close position at end of backtest");
                continue;
            };
            let report = FillReport {
                status: FillStatus::Filled,
                filled_qty: quantity,
                fill_price: reference,
                slippage: 0.0,
                reason: None,
            };
            let order = Order::new(
                symbol.clone(),
                Side::Sell,
                OrderType::Market,
                quantity,
                None,
                None,
                TimeInForce::Ioc,
                timestamp,
            );
            info!(symbol = %symbol, qty = quantity, price = reference, "end-of-backtest close");
            self.apply_report(&order, &report, timestamp)?;
        }

        // Anything still working is canceled with the session
        for mut order in std::mem::take(&mut self.working_orders) {
            order.cancel()?;
            self.audit_event(timestamp, AuditEvent::Canceled, &order, None, Some("end_of_run"))?;
        }
        self.pending_stop_levels.clear();
        Ok(())
    }

    fn build_snapshot(&self, timestamp: DateTime<Utc>, bars: &[Bar]) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        snapshot.timestamp = Some(timestamp);
        snapshot.prices = self.current_prices.clone();
        for bar in bars {
            snapshot.bars.insert(bar.symbol.clone(), bar.clone());
        }
        snapshot
    }

    fn update_atr(&mut self, bar: &Bar) {
        let period = self.config.engine.atr_period;
        let state = self
            .atr_state
            .entry(bar.symbol.clone())
            .or_insert_with(|| AverageTrueRange::new(period).expect("valid ATR period"));

        match DataItem::builder()
            .open(bar.open)
            .high(bar.high)
            .low(bar.low)
            .close(bar.close)
            .volume(bar.volume)
            .build()
        {
            Ok(item) => {
                let atr = state.next(&item);
                self.latest_atr.insert(bar.symbol.clone(), atr);
            }
            Err(err) => debug!(symbol = %bar.symbol, %err, "bar unusable for ATR"),
        }
    }

    fn audit_event(
        &mut self,
        timestamp: DateTime<Utc>,
        event: AuditEvent,
        order: &Order,
        fill_price: Option<f64>,
        reason: Option<&str>,
    ) -> Result<()> {
        if let Some(audit) = &mut self.audit {
            audit
                .record(timestamp, event, order, None, fill_price, reason)
                .context("failed to write audit log")?;
        }
        Ok(())
    }
}

/// Merge per-symbol series into a (timestamp -> bars) timeline.
///
/// Bars within a tick are sorted by symbol; each symbol's series must be in
/// non-decreasing timestamp order.
fn merge_timeline(data: HashMap<Symbol, Vec<Bar>>) -> Result<Vec<(DateTime<Utc>, Vec<Bar>)>> {
    for (symbol, bars) in &data {
        for bar in bars {
            bar.validate()?;
        }
        if bars.windows(2).any(|w| w[0].timestamp > w[1].timestamp) {
            anyhow::bail!("bars for {} are not in timestamp order", symbol);
        }
    }

    let mut all: Vec<Bar> = data.into_values().flatten().collect();
    all.sort_by(|a, b| (a.timestamp, &a.symbol).cmp(&(b.timestamp, &b.symbol)));

    let groups = all.into_iter().chunk_by(|bar| bar.timestamp);
    Ok(groups
        .into_iter()
        .map(|(ts, group)| (ts, group.collect::<Vec<_>>()))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn bar(symbol: &str, day: u32, close: f64) -> Bar {
        Bar::new(
            Symbol::new(symbol),
            Utc.with_ymd_and_hms(2024, 3, day, 0, 0, 0).unwrap(),
            "1d",
            close,
            close + 1.0,
            close - 1.0,
            close,
            10_000.0,
        )
        .unwrap()
    }

    #[test]
    fn test_merge_timeline_groups_by_timestamp() {
        let mut data = HashMap::new();
        data.insert(
            Symbol::new("AAPL"),
            vec![bar("AAPL", 1, 100.0), bar("AAPL", 2, 101.0)],
        );
        data.insert(Symbol::new("MSFT"), vec![bar("MSFT", 2, 200.0)]);

        let timeline = merge_timeline(data).unwrap();
        assert_eq!(timeline.len(), 2);
        assert_eq!(timeline[0].1.len(), 1);
        assert_eq!(timeline[1].1.len(), 2);
        // Within a tick, bars come in symbol order
        assert_eq!(timeline[1].1[0].symbol, Symbol::new("AAPL"));
        assert_eq!(timeline[1].1[1].symbol, Symbol::new("MSFT"));
    }

    #[test]
    fn test_merge_timeline_rejects_disorder() {
        let mut data = HashMap::new();
        data.insert(
            Symbol::new("AAPL"),
            vec![bar("AAPL", 2, 100.0), bar("AAPL", 1, 99.0)],
        );
        assert!(merge_timeline(data).is_err());
    }
}
