//! Typed ingress requests.
//!
//! Validation happens exactly once, at the edge: a raw `SubmitOrderRequest`
//! either normalizes into a fully-typed [`SubmitOrder`] or fails with a
//! [`ValidationError`]. The order total is computed here, server-side; any
//! client-supplied total is ignored.

use common::{CorrelationId, CustomerId, Money, OrderId, ProductId};
use serde::Deserialize;
use thiserror::Error;

use crate::summary::OrderLine;

/// Raw submission payload as received at ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitOrderRequest {
    #[serde(default)]
    pub order_id: Option<String>,
    pub customer_id: String,
    #[serde(default)]
    pub correlation_id: Option<String>,
    #[serde(default)]
    pub items: Vec<SubmitItemRequest>,
}

/// Raw order line as received at ingress.
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitItemRequest {
    pub product_id: String,
    pub quantity: u32,
    pub unit_price_minor_units: i64,
}

/// Validation failures, surfaced at ingress and never inside the saga.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("customer_id must be non-empty")]
    EmptyCustomerId,

    #[error("order must contain at least one item")]
    NoItems,

    #[error("order_id is not a valid identifier: {0}")]
    InvalidOrderId(String),

    #[error("item {index}: product_id must be non-empty")]
    EmptyProductId { index: usize },

    #[error("item {index} ({product_id}): quantity must be >= 1")]
    InvalidQuantity { index: usize, product_id: String },

    #[error("item {index} ({product_id}): unit_price_minor_units must be >= 1")]
    InvalidUnitPrice { index: usize, product_id: String },
}

/// A validated, normalized order submission.
#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub correlation_id: CorrelationId,
    pub items: Vec<OrderLine>,
    pub total_minor_units: Money,
}

impl SubmitOrderRequest {
    /// Validates the raw request into a typed command.
    ///
    /// Generates `order_id` and `correlation_id` when absent and computes
    /// the total as the sum of line totals.
    pub fn validate(self) -> Result<SubmitOrder, ValidationError> {
        if self.customer_id.trim().is_empty() {
            return Err(ValidationError::EmptyCustomerId);
        }
        if self.items.is_empty() {
            return Err(ValidationError::NoItems);
        }

        let order_id = match self.order_id {
            Some(raw) => OrderId::parse(&raw).map_err(|_| ValidationError::InvalidOrderId(raw))?,
            None => OrderId::new(),
        };

        let mut items = Vec::with_capacity(self.items.len());
        for (index, item) in self.items.into_iter().enumerate() {
            if item.product_id.trim().is_empty() {
                return Err(ValidationError::EmptyProductId { index });
            }
            if item.quantity < 1 {
                return Err(ValidationError::InvalidQuantity {
                    index,
                    product_id: item.product_id,
                });
            }
            if item.unit_price_minor_units < 1 {
                return Err(ValidationError::InvalidUnitPrice {
                    index,
                    product_id: item.product_id,
                });
            }
            items.push(OrderLine {
                product_id: ProductId::new(item.product_id),
                quantity: item.quantity,
                unit_price_minor_units: Money::from_minor_units(item.unit_price_minor_units),
            });
        }

        let total_minor_units = items.iter().map(OrderLine::total).sum();

        Ok(SubmitOrder {
            order_id,
            customer_id: CustomerId::new(self.customer_id),
            correlation_id: self
                .correlation_id
                .map(CorrelationId::new)
                .unwrap_or_else(CorrelationId::generate),
            items,
            total_minor_units,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> SubmitOrderRequest {
        SubmitOrderRequest {
            order_id: None,
            customer_id: "c1".to_string(),
            correlation_id: None,
            items: vec![SubmitItemRequest {
                product_id: "KEYBD-01".to_string(),
                quantity: 1,
                unit_price_minor_units: 8999,
            }],
        }
    }

    #[test]
    fn valid_request_normalizes_and_totals() {
        let mut req = request();
        req.items.push(SubmitItemRequest {
            product_id: "WEBCAM-4K".to_string(),
            quantity: 2,
            unit_price_minor_units: 19999,
        });

        let cmd = req.validate().unwrap();
        assert_eq!(cmd.customer_id.as_str(), "c1");
        assert_eq!(cmd.items.len(), 2);
        assert_eq!(cmd.total_minor_units.minor_units(), 8999 + 2 * 19999);
        assert!(!cmd.correlation_id.as_str().is_empty());
    }

    #[test]
    fn caller_supplied_ids_are_preserved() {
        let order_id = OrderId::new();
        let mut req = request();
        req.order_id = Some(order_id.to_string());
        req.correlation_id = Some("corr-7".to_string());

        let cmd = req.validate().unwrap();
        assert_eq!(cmd.order_id, order_id);
        assert_eq!(cmd.correlation_id.as_str(), "corr-7");
    }

    #[test]
    fn empty_customer_rejected() {
        let mut req = request();
        req.customer_id = "   ".to_string();
        assert_eq!(req.validate().unwrap_err(), ValidationError::EmptyCustomerId);
    }

    #[test]
    fn empty_items_rejected() {
        let mut req = request();
        req.items.clear();
        assert_eq!(req.validate().unwrap_err(), ValidationError::NoItems);
    }

    #[test]
    fn zero_quantity_rejected() {
        let mut req = request();
        req.items[0].quantity = 0;
        assert!(matches!(
            req.validate().unwrap_err(),
            ValidationError::InvalidQuantity { .. }
        ));
    }

    #[test]
    fn non_positive_price_rejected() {
        let mut req = request();
        req.items[0].unit_price_minor_units = 0;
        assert!(matches!(
            req.validate().unwrap_err(),
            ValidationError::InvalidUnitPrice { .. }
        ));
    }

    #[test]
    fn malformed_order_id_rejected() {
        let mut req = request();
        req.order_id = Some("not-a-ulid".to_string());
        assert!(matches!(
            req.validate().unwrap_err(),
            ValidationError::InvalidOrderId(_)
        ));
    }

    #[test]
    fn client_supplied_total_is_ignored() {
        // Unknown fields (like a client-computed total) are dropped by serde.
        let json = serde_json::json!({
            "customer_id": "c1",
            "total_minor_units": 1,
            "items": [{"product_id": "KEYBD-01", "quantity": 2, "unit_price_minor_units": 100}]
        });
        let req: SubmitOrderRequest = serde_json::from_value(json).unwrap();
        let cmd = req.validate().unwrap();
        assert_eq!(cmd.total_minor_units.minor_units(), 200);
    }
}
