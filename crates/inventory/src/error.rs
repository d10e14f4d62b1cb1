//! Inventory error types.

use common::{ProductId, ReservationId};
use record_store::StoreError;
use thiserror::Error;

use crate::ReservationState;

/// Errors surfaced by the inventory engine.
#[derive(Debug, Error)]
pub enum InventoryError {
    /// The guarded decrement would have taken stock below zero.
    #[error("insufficient stock for {product_id}: requested {requested}, available {available}")]
    InsufficientStock {
        product_id: ProductId,
        requested: u32,
        available: i64,
    },

    /// The product has never been seeded.
    #[error("unknown product: {0}")]
    UnknownProduct(ProductId),

    /// The reservation does not exist.
    #[error("reservation not found: {0}")]
    ReservationNotFound(ReservationId),

    /// Release was attempted on a reservation that was already consumed.
    #[error("reservation {0} was already consumed")]
    ReleaseAfterConsume(ReservationId),

    /// The reservation is not in the state the operation requires.
    #[error("reservation {id} is {state}, expected HELD")]
    NotHeld {
        id: ReservationId,
        state: ReservationState,
    },

    /// Underlying store failure.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A stored reservation or inventory record could not be decoded.
    #[error("inventory record serialization: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl InventoryError {
    /// Returns true for transient failures worth retrying.
    pub fn is_retryable(&self) -> bool {
        matches!(self, InventoryError::Store(e) if e.is_unavailable())
    }
}

/// Result type for inventory operations.
pub type Result<T> = std::result::Result<T, InventoryError>;
