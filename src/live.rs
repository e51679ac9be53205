//! Live trading engine
//!
//! Single-writer actor: one task owns the ledger, trade tracker, and risk
//! state, and everything that happens (market ticks, broker fill notices,
//! shutdown) arrives through one ordered mailbox. Market-data and broker
//! I/O live on other tasks and only ever enqueue events.
//!
//! Within the actor the backtest ordering holds: stops are evaluated before
//! strategy signals on every tick, and fills flow through the trade tracker
//! before the ledger.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::broker::{submit_with_retry, Broker, FillNotice, SubmitPolicy};
use crate::config::Config;
use crate::error::EngineError;
use crate::health::{FailureTracker, HealthSnapshot, HealthStatus};
use crate::oms::audit::{AuditEvent, OrderAuditLog};
use crate::oms::order::{Order, OrderId, OrderType, TimeInForce};
use crate::oms::validator::OrderValidator;
use crate::portfolio::Ledger;
use crate::risk::RiskManager;
use crate::sizing::PositionSizer;
use crate::strategy::Strategy;
use crate::trades::{EquityTracker, TradeTracker};
use crate::types::{Bar, MarketSnapshot, Side, Signal, SignalAction, Symbol};

/// Everything the actor reacts to
#[derive(Debug)]
pub enum EngineEvent {
    /// Latest trade price for a symbol
    Tick {
        symbol: Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
    },
    /// Asynchronous fill notice from the broker
    BrokerFill(FillNotice),
    /// Drain and stop
    Shutdown,
}

/// Wall-clock budget for one strategy invocation; a slow strategy costs a
/// warning and its signals for that tick, never the queue
const STRATEGY_BUDGET: StdDuration = StdDuration::from_millis(500);

/// Live engine actor state
pub struct LiveEngine {
    config: Config,
    strategy: Box<dyn Strategy>,
    validator: OrderValidator,
    risk: RiskManager,
    ledger: Ledger,
    tracker: TradeTracker,
    equity: EquityTracker,
    sizer: PositionSizer,
    broker: Arc<dyn Broker>,
    submit_policy: SubmitPolicy,
    current_prices: HashMap<Symbol, f64>,
    /// Orders acked by the broker and awaiting fill notices
    open_orders: HashMap<OrderId, Order>,
    exchange_ids: HashMap<OrderId, String>,
    pending_stop_levels: HashMap<OrderId, f64>,
    /// Last emitted (action, time) per symbol, for cooldown dedup
    last_signal: HashMap<Symbol, (SignalAction, DateTime<Utc>)>,
    failures: FailureTracker,
    status: HealthStatus,
    started_at: DateTime<Utc>,
    audit: Option<OrderAuditLog>,
}

impl LiveEngine {
    pub fn new(config: Config, strategy: Box<dyn Strategy>, broker: Arc<dyn Broker>) -> Result<Self> {
        let audit = match &config.engine.audit_log {
            Some(path) => Some(OrderAuditLog::open(path)?),
            None => None,
        };

        Ok(LiveEngine {
            validator: OrderValidator::new(config.risk.clone()),
            risk: RiskManager::new(config.stops.clone(), config.engine.initial_capital),
            ledger: Ledger::new(config.engine.initial_capital),
            tracker: TradeTracker::new(),
            equity: EquityTracker::new(),
            sizer: config.sizer.clone(),
            broker,
            submit_policy: SubmitPolicy::default(),
            current_prices: HashMap::new(),
            open_orders: HashMap::new(),
            exchange_ids: HashMap::new(),
            pending_stop_levels: HashMap::new(),
            last_signal: HashMap::new(),
            failures: FailureTracker::new(),
            status: HealthStatus::Initializing,
            started_at: Utc::now(),
            audit,
            config,
            strategy,
        })
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn tracker(&self) -> &TradeTracker {
        &self.tracker
    }

    /// Run the actor until the mailbox closes or a shutdown event arrives
    pub async fn run(&mut self, mut events: mpsc::Receiver<EngineEvent>) -> Result<()> {
        self.started_at = Utc::now();
        self.status = HealthStatus::Running;
        self.write_health()?;
        info!(strategy = self.strategy.name(), "live engine running");

        let mut health_interval =
            tokio::time::interval(StdDuration::from_secs(self.config.engine.status_log_interval.max(1)));
        health_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                event = events.recv() => {
                    match event {
                        None | Some(EngineEvent::Shutdown) => break,
                        Some(event) => {
                            if let Err(err) = self.handle_event(event).await {
                                // Invariant failures must stop the run;
                                // everything else degrades and continues
                                if matches!(err, EngineError::InvariantViolation(_)) {
                                    self.status = HealthStatus::Stopped;
                                    self.write_health().ok();
                                    return Err(err).context("fatal engine invariant failure");
                                }
                                error!(%err, "engine event failed");
                                self.note_failure().await?;
                            }
                        }
                    }
                }
                _ = health_interval.tick() => {
                    self.write_health()?;
                    info!(
                        equity = self.ledger.total_value(),
                        positions = self.ledger.open_position_count(),
                        open_orders = self.open_orders.len(),
                        "status"
                    );
                }
            }
        }

        self.shutdown(&mut events).await
    }

    async fn handle_event(&mut self, event: EngineEvent) -> Result<(), EngineError> {
        match event {
            EngineEvent::Tick {
                symbol,
                price,
                timestamp,
            } => self.on_tick(symbol, price, timestamp).await,
            EngineEvent::BrokerFill(notice) => self.on_broker_fill(notice),
            EngineEvent::Shutdown => Ok(()),
        }
    }

    async fn on_tick(
        &mut self,
        symbol: Symbol,
        price: f64,
        timestamp: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        if price <= 0.0 || !price.is_finite() {
            warn!(%symbol, price, "dropping malformed tick");
            return Ok(());
        }
        self.current_prices.insert(symbol.clone(), price);

        self.ledger.mark_to_market(&self.current_prices);
        self.risk.update_equity(self.ledger.total_value(), timestamp);

        // Stops first, always
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
            info!(symbol = %exit.symbol, reason = exit.reason.code(), "submitting stop exit");
            self.route_order(order, timestamp, None).await?;
        }

        if self.risk.breaker_active() || !self.config.trading.enable_trading {
            self.record_equity(timestamp);
            return Ok(());
        }

        let snapshot = self.build_snapshot(&symbol, price, timestamp);
        let started = std::time::Instant::now();
        let signals = self.strategy.generate_signals(&snapshot);
        if started.elapsed() > STRATEGY_BUDGET {
            warn!(
                strategy = self.strategy.name(),
                elapsed_ms = started.elapsed().as_millis() as u64,
                "strategy exceeded its budget; skipping this tick's signals"
            );
            self.record_equity(timestamp);
            return Ok(());
        }

        for signal in signals {
            if signal.is_hold() || self.is_duplicate(&signal) {
                continue;
            }
            self.last_signal
                .insert(signal.symbol.clone(), (signal.action, signal.timestamp));
            self.process_signal(&signal, timestamp).await?;
        }

        self.record_equity(timestamp);
        Ok(())
    }

    /// Identical to the last emitted signal for the symbol, inside cooldown
    fn is_duplicate(&self, signal: &Signal) -> bool {
        let cooldown = chrono::Duration::seconds(self.config.engine.signal_cooldown_secs as i64);
        self.last_signal
            .get(&signal.symbol)
            .is_some_and(|(action, at)| *action == signal.action && signal.timestamp - *at < cooldown)
    }

    async fn process_signal(
        &mut self,
        signal: &Signal,
        timestamp: DateTime<Utc>,
    ) -> Result<(), EngineError> {
        let Some(&price) = self.current_prices.get(&signal.symbol) else {
            return Ok(());
        };

        let (side, quantity) = match signal.action {
            SignalAction::Buy => {
                let qty = self.sizer.qty(signal, self.ledger.total_value(), price, None);
                (Side::Buy, qty)
            }
            SignalAction::Sell => (Side::Sell, self.ledger.position_qty(&signal.symbol)),
            SignalAction::Hold => return Ok(()),
        };

        if quantity <= 0 {
            return Ok(());
        }

        let order = Order::new(
            signal.symbol.clone(),
            side,
            OrderType::Market,
            quantity,
            None,
            None,
            self.config.matching.default_tif,
            timestamp,
        );
        self.route_order(order, timestamp, signal.stop_loss).await
    }

    /// Validate and hand an order to the broker; fills come back async.
    ///
    /// A submission deadline miss rejects the order locally; it is never
    /// credited to the ledger.
    async fn route_order(
        &mut self,
        mut order: Order,
        timestamp: DateTime<Utc>,
        stop_level: Option<f64>,
    ) -> Result<(), EngineError> {
        let reference = self.current_prices.get(&order.symbol).copied().unwrap_or(0.0);
        self.audit_event(timestamp, AuditEvent::Sent, &order, None, None);

        if let Err(reason) = self.validator.validate(&order, reference, &self.ledger, timestamp) {
            order.reject(reason.code())?;
            self.audit_event(timestamp, AuditEvent::Rejected, &order, None, Some(reason.code()));
            warn!(symbol = %order.symbol, reason = reason.code(), "order rejected pre-trade");
            return Ok(());
        }

        if self.config.trading.dry_run {
            // Historical-replay mode: no broker traffic at all
            debug!(symbol = %order.symbol, "dry run, order not routed");
            return Ok(());
        }

        match submit_with_retry(self.broker.as_ref(), &order, &self.submit_policy).await {
            Ok(ack) if ack.accepted => {
                order.acknowledge()?;
                self.audit_event(timestamp, AuditEvent::Acked, &order, Some(ack.exchange_id.as_str()), None);
                if let Some(level) = stop_level {
                    self.pending_stop_levels.insert(order.id, level);
                }
                self.exchange_ids.insert(order.id, ack.exchange_id);
                self.open_orders.insert(order.id, order);
                Ok(())
            }
            Ok(_) => {
                order.reject("broker_rejected")?;
                self.audit_event(timestamp, AuditEvent::Rejected, &order, None, Some("broker_rejected"));
                Ok(())
            }
            Err(err) => {
                warn!(order_id = order.id, %err, "submission failed; order locally rejected");
                order.reject("submit_timeout")?;
                self.audit_event(timestamp, AuditEvent::Rejected, &order, None, Some("submit_timeout"));
                self.note_failure().await.map_err(|e| {
                    EngineError::Broker(format!("failure escalation failed: {}", e))
                })?;
                Ok(())
            }
        }
    }

    /// Fold an asynchronous broker fill back through the same
    /// tracker-then-ledger path the backtest uses
    fn on_broker_fill(&mut self, notice: FillNotice) -> Result<(), EngineError> {
        let Some(order) = self.open_orders.get_mut(&notice.client_order_id) else {
            warn!(order_id = notice.client_order_id, "fill notice for unknown order");
            return Ok(());
        };

        if notice.filled_qty > 0 {
            if let Err(err) = order.apply_fill(notice.filled_qty, notice.fill_price) {
                // State-machine violation live: abort this order, keep running
                error!(order_id = order.id, %err, "aborting order on fill accounting error");
                let order = self.open_orders.remove(&notice.client_order_id).expect("present");
                self.exchange_ids.remove(&order.id);
                self.pending_stop_levels.remove(&order.id);
                return Ok(());
            }

            let report = crate::oms::execution::FillReport {
                status: if order.remaining() == 0 {
                    crate::oms::execution::FillStatus::Filled
                } else {
                    crate::oms::execution::FillStatus::PartiallyFilled
                },
                filled_qty: notice.filled_qty,
                fill_price: notice.fill_price,
                slippage: 0.0,
                reason: None,
            };

            let symbol = order.symbol.clone();
            let side = order.side;
            let order_id = order.id;
            self.tracker
                .apply_fill(&symbol, side, &report, notice.timestamp, order_id)?;
            self.ledger.apply_fill(&symbol, side, &report)?;
            self.tracker.check_consistency(&self.ledger)?;

            match side {
                Side::Buy => {
                    let level = self.pending_stop_levels.get(&order_id).copied();
                    self.risk.track_entry(&symbol, notice.fill_price, notice.timestamp, level);
                }
                Side::Sell => {
                    if self.ledger.position_qty(&symbol) == 0 {
                        self.risk.clear(&symbol);
                    }
                }
            }

            let order = &self.open_orders[&notice.client_order_id];
            let event = if order.remaining() == 0 {
                AuditEvent::Filled
            } else {
                AuditEvent::Partial
            };
            let order = order.clone();
            self.audit_event(notice.timestamp, event, &order, None, None);

            info!(
                symbol = %symbol,
                side = %side,
                qty = notice.filled_qty,
                price = notice.fill_price,
                "broker fill applied"
            );
        }

        let done = notice.terminal
            || self.open_orders[&notice.client_order_id].remaining() == 0;
        if done {
            if let Some(mut order) = self.open_orders.remove(&notice.client_order_id) {
                if order.is_working() {
                    // Broker closed the order short of a full fill
                    order.cancel()?;
                }
                self.exchange_ids.remove(&order.id);
                self.pending_stop_levels.remove(&order.id);
            }
        }
        Ok(())
    }

    /// Escalate repeated failures: at the critical threshold the engine
    /// degrades and liquidates through the normal exit path
    async fn note_failure(&mut self) -> Result<(), EngineError> {
        let count = self.failures.record_failure(Utc::now());
        if !FailureTracker::is_critical(count) || self.status == HealthStatus::Degraded {
            return Ok(());
        }

        warn!(count, "failure threshold reached; degrading and liquidating");
        self.status = HealthStatus::Degraded;
        let now = Utc::now();
        let exits = self.risk.liquidate_all(&self.current_prices, &self.ledger, now);
        for exit in exits {
            let order = Order::new(
                exit.symbol.clone(),
                Side::Sell,
                OrderType::Market,
                exit.quantity,
                None,
                None,
                TimeInForce::Ioc,
                now,
            );
            // Best effort: a venue that keeps failing cannot block shutdown
            if let Err(err) = Box::pin(self.route_order(order, now, None)).await {
                error!(%err, "liquidation order failed");
            }
        }
        Ok(())
    }

    /// Drain the mailbox, cancel working orders, persist the final snapshot
    async fn shutdown(&mut self, events: &mut mpsc::Receiver<EngineEvent>) -> Result<()> {
        info!("live engine shutting down");

        // Apply any fills already queued before letting go of the orders
        while let Ok(event) = events.try_recv() {
            if let EngineEvent::BrokerFill(notice) = event {
                self.on_broker_fill(notice).ok();
            }
        }

        let ids: Vec<(OrderId, String)> = self
            .exchange_ids
            .iter()
            .map(|(id, ex)| (*id, ex.clone()))
            .collect();
        for (order_id, exchange_id) in ids {
            match self.broker.cancel(&exchange_id).await {
                Ok(outcome) => debug!(order_id, ?outcome, "working order canceled"),
                Err(err) => warn!(order_id, %err, "cancel failed during shutdown"),
            }
            if let Some(mut order) = self.open_orders.remove(&order_id) {
                if order.is_working() {
                    order.cancel().ok();
                }
            }
        }
        self.exchange_ids.clear();

        self.status = HealthStatus::Stopped;
        self.write_health()?;
        info!(
            final_value = self.ledger.total_value(),
            realized_pnl = self.tracker.total_realized_pnl(),
            trades = self.tracker.completed().len(),
            "live session ended"
        );
        Ok(())
    }

    /// The latest price becomes a degenerate bar so bar-based strategies
    /// keep working on a tick feed
    fn build_snapshot(&self, symbol: &Symbol, price: f64, timestamp: DateTime<Utc>) -> MarketSnapshot {
        let mut snapshot = MarketSnapshot::new();
        snapshot.timestamp = Some(timestamp);
        snapshot.prices = self.current_prices.clone();
        if let Ok(bar) = Bar::new(
            symbol.clone(),
            timestamp,
            self.config.trading.timeframe.clone(),
            price,
            price,
            price,
            price,
            0.0,
        ) {
            snapshot.bars.insert(symbol.clone(), bar);
        }
        snapshot
    }

    fn record_equity(&mut self, timestamp: DateTime<Utc>) {
        // Live tick clocks can skew across sources; never regress the curve
        let last = self.equity.points().last().map(|&(ts, _)| ts);
        if last.is_none_or(|ts| timestamp >= ts) {
            self.equity.record(timestamp, self.ledger.total_value()).ok();
        }
    }

    fn write_health(&self) -> Result<()> {
        let snapshot = HealthSnapshot::capture(
            self.status,
            self.started_at,
            Utc::now(),
            &self.ledger,
            self.tracker.total_realized_pnl(),
        );
        snapshot.write(&self.config.engine.health_snapshot_path)
    }

    fn audit_event(
        &mut self,
        timestamp: DateTime<Utc>,
        event: AuditEvent,
        order: &Order,
        exchange_id: Option<&str>,
        reason: Option<&str>,
    ) {
        if let Some(audit) = &mut self.audit {
            if let Err(err) = audit.record(timestamp, event, order, exchange_id, None, reason) {
                warn!(%err, "audit write failed");
            }
        }
    }
}
