//! Order summary records.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use serde::{Deserialize, Serialize};

use crate::event::FailureReason;
use crate::request::SubmitOrder;
use crate::status::OrderStatus;

/// One line of an order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    pub product_id: ProductId,
    pub quantity: u32,
    pub unit_price_minor_units: Money,
}

impl OrderLine {
    /// Total price for the line.
    pub fn total(&self) -> Money {
        self.unit_price_minor_units.multiply(self.quantity)
    }
}

/// Denormalized current state of an order.
///
/// A cache over the event log: `version` equals the `seq` of the latest
/// applied event, and `status` is that event's status. Once terminal the
/// summary is immutable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub items: Vec<OrderLine>,
    pub total_minor_units: Money,
    pub status: OrderStatus,
    pub correlation_id: CorrelationId,
    pub created_at: DateTime<Utc>,
    pub version: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
}

impl OrderSummary {
    /// The initial summary for an accepted submission (version 1, PENDING).
    pub fn pending(cmd: &SubmitOrder) -> Self {
        Self {
            order_id: cmd.order_id,
            customer_id: cmd.customer_id.clone(),
            items: cmd.items.clone(),
            total_minor_units: cmd.total_minor_units,
            status: OrderStatus::Pending,
            correlation_id: cmd.correlation_id.clone(),
            created_at: Utc::now(),
            version: 1,
            failure: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_total() {
        let line = OrderLine {
            product_id: ProductId::new("KEYBD-01"),
            quantity: 3,
            unit_price_minor_units: Money::from_minor_units(8999),
        };
        assert_eq!(line.total().minor_units(), 26997);
    }

    #[test]
    fn pending_summary_starts_at_version_one() {
        let cmd = SubmitOrder {
            order_id: OrderId::new(),
            customer_id: CustomerId::new("c1"),
            correlation_id: CorrelationId::generate(),
            items: vec![OrderLine {
                product_id: ProductId::new("KEYBD-01"),
                quantity: 1,
                unit_price_minor_units: Money::from_minor_units(8999),
            }],
            total_minor_units: Money::from_minor_units(8999),
        };
        let summary = OrderSummary::pending(&cmd);
        assert_eq!(summary.version, 1);
        assert_eq!(summary.status, OrderStatus::Pending);
        assert!(summary.failure.is_none());
    }
}
