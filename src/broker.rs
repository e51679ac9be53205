//! Broker interface for live trading
//!
//! The engine only ever talks to this trait: submissions return an ack,
//! fills arrive asynchronously on a notice channel, cancels are best
//! effort. `PaperBroker` implements the contract against the last seen
//! price so the live engine runs end-to-end without a venue.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::error::EngineError;
use crate::oms::order::{Order, OrderId};
use crate::types::Symbol;

/// Submission acknowledgement
#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_id: String,
    pub accepted: bool,
}

/// Cancel result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Canceled,
    NotFound,
}

/// Broker-side view of a position, used for reconciliation
#[derive(Debug, Clone)]
pub struct BrokerPosition {
    pub symbol: Symbol,
    pub quantity: i64,
    pub avg_price: f64,
}

/// Asynchronous fill notification pushed by the broker
#[derive(Debug, Clone)]
pub struct FillNotice {
    pub client_order_id: OrderId,
    pub filled_qty: i64,
    pub fill_price: f64,
    pub timestamp: DateTime<Utc>,
    /// True when the broker considers the order done
    pub terminal: bool,
}

/// Order-routing interface the live engine depends on
#[async_trait]
pub trait Broker: Send + Sync {
    async fn submit(&self, order: &Order) -> Result<OrderAck, EngineError>;

    async fn cancel(&self, exchange_id: &str) -> Result<CancelOutcome, EngineError>;

    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError>;
}

/// Submission retry policy: bounded exponential backoff under one deadline
#[derive(Debug, Clone)]
pub struct SubmitPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub deadline: Duration,
}

impl Default for SubmitPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            deadline: Duration::from_secs(10),
        }
    }
}

/// Submit with retries; the whole attempt sequence shares one deadline.
///
/// A deadline miss means the order must be treated as locally rejected and
/// never credited to the ledger.
pub async fn submit_with_retry(
    broker: &dyn Broker,
    order: &Order,
    policy: &SubmitPolicy,
) -> Result<OrderAck, EngineError> {
    let attempt_all = async {
        let mut delay = policy.base_delay;
        let mut last_err = None;
        for attempt in 0..=policy.max_retries {
            match broker.submit(order).await {
                Ok(ack) => return Ok(ack),
                Err(err) => {
                    warn!(order_id = order.id, attempt, %err, "broker submit failed");
                    last_err = Some(err);
                    if attempt < policy.max_retries {
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
            }
        }
        Err(last_err.unwrap_or_else(|| EngineError::Broker("submit failed".to_string())))
    };

    match tokio::time::timeout(policy.deadline, attempt_all).await {
        Ok(result) => result,
        Err(_) => Err(EngineError::Broker(format!(
            "submit deadline of {:?} elapsed for order {}",
            policy.deadline, order.id
        ))),
    }
}

static EXCHANGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Simulated broker: every accepted order fills in full at the last seen
/// price for its symbol, and the fill notice goes out on the notice channel
pub struct PaperBroker {
    prices: RwLock<HashMap<Symbol, f64>>,
    fills: mpsc::UnboundedSender<FillNotice>,
    open: RwLock<HashMap<String, OrderId>>,
}

impl PaperBroker {
    pub fn new(fills: mpsc::UnboundedSender<FillNotice>) -> Self {
        Self {
            prices: RwLock::new(HashMap::new()),
            fills,
            open: RwLock::new(HashMap::new()),
        }
    }

    /// Feed the broker the latest trade price for a symbol
    pub fn set_price(&self, symbol: &Symbol, price: f64) {
        self.prices
            .write()
            .expect("price lock poisoned")
            .insert(symbol.clone(), price);
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn submit(&self, order: &Order) -> Result<OrderAck, EngineError> {
        let price = self
            .prices
            .read()
            .expect("price lock poisoned")
            .get(&order.symbol)
            .copied();

        let Some(price) = price else {
            return Err(EngineError::Broker(format!(
                "no market price for {}",
                order.symbol
            )));
        };

        let exchange_id = format!("PB-{}", EXCHANGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed));
        self.open
            .write()
            .expect("order lock poisoned")
            .insert(exchange_id.clone(), order.id);

        let notice = FillNotice {
            client_order_id: order.id,
            filled_qty: order.remaining(),
            fill_price: price,
            timestamp: Utc::now(),
            terminal: true,
        };
        debug!(order_id = order.id, price, "paper fill");
        self.fills
            .send(notice)
            .map_err(|_| EngineError::Broker("fill channel closed".to_string()))?;

        Ok(OrderAck {
            exchange_id,
            accepted: true,
        })
    }

    async fn cancel(&self, exchange_id: &str) -> Result<CancelOutcome, EngineError> {
        let removed = self
            .open
            .write()
            .expect("order lock poisoned")
            .remove(exchange_id)
            .is_some();
        Ok(if removed {
            CancelOutcome::Canceled
        } else {
            CancelOutcome::NotFound
        })
    }

    async fn positions(&self) -> Result<Vec<BrokerPosition>, EngineError> {
        // The paper venue holds no inventory of its own
        Ok(Vec::new())
    }
}
