//! Reservation records.

use chrono::{DateTime, Utc};
use common::{OrderId, ProductId, ReservationId};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a reservation.
///
/// A `Held` reservation corresponds to a stock decrement that has not been
/// offset yet; `Released` pairs it with an increment, `Consumed` closes it
/// without returning stock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReservationState {
    #[serde(rename = "HELD")]
    Held,
    #[serde(rename = "RELEASED")]
    Released,
    #[serde(rename = "CONSUMED")]
    Consumed,
}

impl std::fmt::Display for ReservationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReservationState::Held => "HELD",
            ReservationState::Released => "RELEASED",
            ReservationState::Consumed => "CONSUMED",
        };
        write!(f, "{s}")
    }
}

/// A hold on stock for one order line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reservation {
    pub reservation_id: ReservationId,
    pub order_id: OrderId,
    pub product_id: ProductId,
    pub quantity: u32,
    pub state: ReservationState,
    pub created_at: DateTime<Utc>,
}

impl Reservation {
    /// Creates a fresh `Held` reservation.
    pub fn hold(order_id: OrderId, product_id: ProductId, quantity: u32) -> Self {
        Self {
            reservation_id: ReservationId::new(),
            order_id,
            product_id,
            quantity,
            state: ReservationState::Held,
            created_at: Utc::now(),
        }
    }
}
