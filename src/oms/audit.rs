//! Append-only order audit log
//!
//! One CSV row per order lifecycle event. Flushed after every record so a
//! crash never loses acknowledged history.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::fs::OpenOptions;
use std::path::Path;

use crate::oms::order::Order;

/// Lifecycle events worth a row in the audit trail
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    Sent,
    Acked,
    Partial,
    Filled,
    Canceled,
    Rejected,
}

impl AuditEvent {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEvent::Sent => "sent",
            AuditEvent::Acked => "acked",
            AuditEvent::Partial => "partial",
            AuditEvent::Filled => "filled",
            AuditEvent::Canceled => "canceled",
            AuditEvent::Rejected => "rejected",
        }
    }
}

/// CSV audit writer
pub struct OrderAuditLog {
    writer: csv::Writer<std::fs::File>,
}

impl OrderAuditLog {
    /// Open (appending) an audit log, writing the header for new files
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let is_new = !path.as_ref().exists()
            || std::fs::metadata(path.as_ref()).map(|m| m.len() == 0).unwrap_or(true);

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())
            .with_context(|| format!("Failed to open audit log: {}", path.as_ref().display()))?;

        let mut writer = csv::Writer::from_writer(file);
        if is_new {
            writer.write_record([
                "ts",
                "event",
                "client_id",
                "exchange_id",
                "symbol",
                "side",
                "qty",
                "filled_qty",
                "price",
                "fill_price",
                "reason",
            ])?;
            writer.flush()?;
        }
        Ok(Self { writer })
    }

    /// Record one lifecycle event for an order
    pub fn record(
        &mut self,
        ts: DateTime<Utc>,
        event: AuditEvent,
        order: &Order,
        exchange_id: Option<&str>,
        fill_price: Option<f64>,
        reason: Option<&str>,
    ) -> Result<()> {
        let price = order
            .limit_price
            .or(order.stop_price)
            .map(|p| format!("{:.4}", p))
            .unwrap_or_default();

        self.writer.write_record([
            ts.to_rfc3339().as_str(),
            event.as_str(),
            order.id.to_string().as_str(),
            exchange_id.unwrap_or(""),
            order.symbol.as_str(),
            order.side.to_string().as_str(),
            order.quantity.to_string().as_str(),
            order.filled_quantity.to_string().as_str(),
            price.as_str(),
            fill_price.map(|p| format!("{:.4}", p)).unwrap_or_default().as_str(),
            reason.unwrap_or(""),
        ])?;
        self.writer.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oms::order::{OrderType, TimeInForce};
    use crate::types::{Side, Symbol};
    use chrono::TimeZone;

    #[test]
    fn test_audit_rows_appended() {
        let dir = std::env::temp_dir().join("papertrader_audit_test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("audit_{}.csv", std::process::id()));
        let _ = std::fs::remove_file(&path);

        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        let order = Order::new(
            Symbol::new("AAPL"),
            Side::Buy,
            OrderType::Limit,
            100,
            Some(99.5),
            None,
            TimeInForce::Gtc,
            ts,
        );

        {
            let mut log = OrderAuditLog::open(&path).unwrap();
            log.record(ts, AuditEvent::Sent, &order, None, None, None).unwrap();
            log.record(ts, AuditEvent::Filled, &order, Some("EX-1"), Some(99.5), None)
                .unwrap();
        }
        {
            // Re-opening appends without rewriting the header
            let mut log = OrderAuditLog::open(&path).unwrap();
            log.record(ts, AuditEvent::Canceled, &order, None, None, Some("session_end"))
                .unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = contents.lines().collect();
        assert_eq!(lines.len(), 4); // header + 3 events
        assert!(lines[0].starts_with("ts,event,client_id"));
        assert!(lines[2].contains("EX-1"));
        assert!(lines[3].contains("session_end"));

        std::fs::remove_file(&path).ok();
    }
}
