//! Shared identifier and value types for the CloudFlow order system.
//!
//! Every crate in the workspace speaks in terms of these newtypes rather than
//! raw strings, so an order id can never be passed where a reservation id is
//! expected and money is always integer minor units.

pub mod ids;
pub mod money;

pub use ids::{CorrelationId, CustomerId, OrderId, PaymentId, ProductId, ReservationId};
pub use money::Money;
