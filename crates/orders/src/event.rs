//! Order events.

use chrono::{DateTime, Utc};
use common::{CorrelationId, CustomerId, Money, PaymentId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

use crate::status::OrderStatus;
use crate::summary::OrderLine;

/// Why an order did not confirm. Carried on failure events and denormalized
/// into the summary so `GetOrder` can surface it without replaying history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum FailureReason {
    #[serde(rename = "INSUFFICIENT_STOCK")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    #[serde(rename = "PAYMENT_DECLINED")]
    PaymentDeclined { reason: String },

    #[serde(rename = "PAYMENT_PROVIDER_UNAVAILABLE")]
    PaymentProviderUnavailable { retry_after_seconds: u64 },

    #[serde(rename = "CANCELLED")]
    Cancelled,

    #[serde(rename = "INTERNAL")]
    Internal { message: String },
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::InsufficientStock {
                product_id,
                requested,
                available,
            } => write!(
                f,
                "insufficient stock for {product_id}: requested {requested}, available {available}"
            ),
            FailureReason::PaymentDeclined { reason } => write!(f, "payment declined: {reason}"),
            FailureReason::PaymentProviderUnavailable { retry_after_seconds } => write!(
                f,
                "payment provider unavailable, retry after {retry_after_seconds}s"
            ),
            FailureReason::Cancelled => write!(f, "cancelled"),
            FailureReason::Internal { message } => write!(f, "internal: {message}"),
        }
    }
}

/// Events recorded on the per-order timeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data")]
pub enum OrderEvent {
    /// Order accepted and durably recorded.
    #[serde(rename = "ORDER_CREATED")]
    OrderCreated(OrderCreatedData),

    /// Stock held for every line of the order.
    #[serde(rename = "STOCK_RESERVED")]
    StockReserved(StockReservedData),

    /// Payment captured by the provider.
    #[serde(rename = "PAYMENT_CHARGED")]
    PaymentCharged(PaymentChargedData),

    /// The charge step failed; compensation begins.
    #[serde(rename = "PAYMENT_FAILED")]
    PaymentFailed(FailureData),

    /// A captured payment was reversed during compensation.
    #[serde(rename = "PAYMENT_REFUNDED")]
    PaymentRefunded(PaymentRefundedData),

    /// Held stock returned during compensation.
    #[serde(rename = "STOCK_RELEASED")]
    StockReleased(StockReleasedData),

    /// Order fulfilled (terminal).
    #[serde(rename = "ORDER_CONFIRMED")]
    OrderConfirmed(OrderConfirmedData),

    /// Compensation finished; forward effects undone (terminal).
    #[serde(rename = "ORDER_COMPENSATED")]
    OrderCompensated(FailureData),

    /// Order failed with nothing to undo (terminal).
    #[serde(rename = "ORDER_FAILED")]
    OrderFailed(FailureData),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderCreatedData {
    pub customer_id: CustomerId,
    pub items: Vec<OrderLine>,
    pub total_minor_units: Money,
    pub correlation_id: CorrelationId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReservedData {
    pub reservation_ids: Vec<ReservationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentChargedData {
    pub payment_id: PaymentId,
    pub provider_charge_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockReleasedData {
    pub reservation_ids: Vec<ReservationId>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRefundedData {
    pub payment_id: PaymentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderConfirmedData {
    pub payment_id: PaymentId,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailureData {
    pub reason: FailureReason,
}

impl OrderEvent {
    /// The event type tag as recorded on the timeline.
    pub fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "ORDER_CREATED",
            OrderEvent::StockReserved(_) => "STOCK_RESERVED",
            OrderEvent::PaymentCharged(_) => "PAYMENT_CHARGED",
            OrderEvent::PaymentFailed(_) => "PAYMENT_FAILED",
            OrderEvent::PaymentRefunded(_) => "PAYMENT_REFUNDED",
            OrderEvent::StockReleased(_) => "STOCK_RELEASED",
            OrderEvent::OrderConfirmed(_) => "ORDER_CONFIRMED",
            OrderEvent::OrderCompensated(_) => "ORDER_COMPENSATED",
            OrderEvent::OrderFailed(_) => "ORDER_FAILED",
        }
    }

    /// The summary status this event lands the order in.
    pub fn status(&self) -> OrderStatus {
        match self {
            OrderEvent::OrderCreated(_) => OrderStatus::Pending,
            OrderEvent::StockReserved(_) => OrderStatus::StockReserved,
            OrderEvent::PaymentCharged(_) => OrderStatus::PaymentCharged,
            OrderEvent::PaymentFailed(_) => OrderStatus::Compensating,
            OrderEvent::PaymentRefunded(_) => OrderStatus::Compensating,
            OrderEvent::StockReleased(_) => OrderStatus::Compensating,
            OrderEvent::OrderConfirmed(_) => OrderStatus::Confirmed,
            OrderEvent::OrderCompensated(_) => OrderStatus::Compensated,
            OrderEvent::OrderFailed(_) => OrderStatus::Failed,
        }
    }

    /// The failure carried by this event, if any.
    pub fn failure(&self) -> Option<&FailureReason> {
        match self {
            OrderEvent::PaymentFailed(data)
            | OrderEvent::OrderCompensated(data)
            | OrderEvent::OrderFailed(data) => Some(&data.reason),
            _ => None,
        }
    }
}

/// One entry of an order's timeline, as stored and as returned by queries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderEventRecord {
    /// Strictly increasing, contiguous per order (1..N).
    pub seq: u64,

    /// When the event was appended.
    pub occurred_at: DateTime<Utc>,

    #[serde(flatten)]
    pub event: OrderEvent,
}

impl OrderEventRecord {
    /// Wraps an event for appending at `seq`.
    pub fn new(seq: u64, event: OrderEvent) -> Self {
        Self {
            seq,
            occurred_at: Utc::now(),
            event,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tags_match_serialization() {
        let event = OrderEvent::StockReserved(StockReservedData {
            reservation_ids: vec![ReservationId::new()],
        });
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], event.event_type());
    }

    #[test]
    fn every_event_maps_to_a_status() {
        let confirmed = OrderEvent::OrderConfirmed(OrderConfirmedData {
            payment_id: PaymentId::new(),
        });
        assert_eq!(confirmed.status(), OrderStatus::Confirmed);
        assert!(confirmed.status().is_terminal());

        let failed = OrderEvent::OrderFailed(FailureData {
            reason: FailureReason::Cancelled,
        });
        assert_eq!(failed.status(), OrderStatus::Failed);
    }

    #[test]
    fn failure_reason_roundtrips_with_code_tag() {
        let reason = FailureReason::InsufficientStock {
            product_id: ProductId::new("WEBCAM-4K"),
            requested: 2,
            available: 1,
        };
        let json = serde_json::to_value(&reason).unwrap();
        assert_eq!(json["code"], "INSUFFICIENT_STOCK");

        let back: FailureReason = serde_json::from_value(json).unwrap();
        assert_eq!(back, reason);
    }

    #[test]
    fn record_flattens_event_fields() {
        let record = OrderEventRecord::new(
            3,
            OrderEvent::PaymentFailed(FailureData {
                reason: FailureReason::PaymentDeclined {
                    reason: "card_declined".into(),
                },
            }),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["seq"], 3);
        assert_eq!(json["type"], "PAYMENT_FAILED");
        assert_eq!(json["data"]["reason"]["code"], "PAYMENT_DECLINED");

        let back: OrderEventRecord = serde_json::from_value(json).unwrap();
        assert_eq!(back.seq, 3);
        assert_eq!(back.event.event_type(), "PAYMENT_FAILED");
    }
}
