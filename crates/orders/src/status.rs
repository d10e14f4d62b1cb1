//! Order status machine.

use serde::{Deserialize, Serialize};

/// The status of an order in its lifecycle.
///
/// Status transitions:
/// ```text
/// PENDING ──► STOCK_RESERVED ──► PAYMENT_CHARGED ──► CONFIRMED
///    │               │                  │
///    │               └──────────────────┴──► COMPENSATING ──► COMPENSATED
///    └──► FAILED
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum OrderStatus {
    /// Order accepted; the saga has not completed any step yet.
    #[default]
    #[serde(rename = "PENDING")]
    Pending,

    /// Stock is held for the order, awaiting payment.
    #[serde(rename = "STOCK_RESERVED")]
    StockReserved,

    /// Payment captured, awaiting confirmation.
    #[serde(rename = "PAYMENT_CHARGED")]
    PaymentCharged,

    /// Order fulfilled (terminal).
    #[serde(rename = "CONFIRMED")]
    Confirmed,

    /// A step failed after forward effects; compensation is running.
    #[serde(rename = "COMPENSATING")]
    Compensating,

    /// Compensation finished; all forward effects undone (terminal).
    #[serde(rename = "COMPENSATED")]
    Compensated,

    /// Order failed with no forward effect to undo (terminal).
    #[serde(rename = "FAILED")]
    Failed,
}

impl OrderStatus {
    /// Returns true if the reserve step may run from this status.
    pub fn can_reserve(&self) -> bool {
        matches!(self, OrderStatus::Pending)
    }

    /// Returns true if the charge step may run from this status.
    pub fn can_charge(&self) -> bool {
        matches!(self, OrderStatus::StockReserved)
    }

    /// Returns true if the confirm step may run from this status.
    pub fn can_confirm(&self) -> bool {
        matches!(self, OrderStatus::PaymentCharged)
    }

    /// Returns true if compensation may begin from this status.
    pub fn can_compensate(&self) -> bool {
        matches!(
            self,
            OrderStatus::StockReserved | OrderStatus::PaymentCharged | OrderStatus::Compensating
        )
    }

    /// Returns true if this is a terminal status; terminal summaries are
    /// immutable.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Confirmed | OrderStatus::Compensated | OrderStatus::Failed
        )
    }

    /// Returns the status name as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "PENDING",
            OrderStatus::StockReserved => "STOCK_RESERVED",
            OrderStatus::PaymentCharged => "PAYMENT_CHARGED",
            OrderStatus::Confirmed => "CONFIRMED",
            OrderStatus::Compensating => "COMPENSATING",
            OrderStatus::Compensated => "COMPENSATED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
