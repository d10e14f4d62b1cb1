//! Inventory reservation engine.
//!
//! Stock correctness rests on one primitive: the record store's guarded
//! atomic decrement (`available - n >= 0`, checked and applied in a single
//! write). Everything else here is bookkeeping around reservation records so
//! that holds can later be consumed (order confirmed) or released
//! (compensation) exactly once.

pub mod engine;
pub mod error;
pub mod reservation;

pub use engine::{InventoryEngine, InventoryItem};
pub use error::InventoryError;
pub use reservation::{Reservation, ReservationState};
