//! Order log error types.

use common::OrderId;
use record_store::StoreError;
use thiserror::Error;

use crate::status::OrderStatus;

/// Errors surfaced by the order log.
#[derive(Debug, Error)]
pub enum OrderError {
    /// The order has no summary record.
    #[error("order not found: {0}")]
    NotFound(OrderId),

    /// Creation raced with an identical submission that already won.
    #[error("order already exists: {0}")]
    AlreadyExists(OrderId),

    /// Appends to a terminal order are refused; terminal summaries are
    /// immutable.
    #[error("order {order_id} is terminal ({status})")]
    Terminal {
        order_id: OrderId,
        status: OrderStatus,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored summary or event could not be decoded.
    #[error("order record serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl OrderError {
    /// Returns true for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, OrderError::Store(e) if e.is_unavailable())
    }
}

/// Result type for order log operations.
pub type Result<T> = std::result::Result<T, OrderError>;
