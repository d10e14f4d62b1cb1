//! Order domain: status machine, event log and typed ingress requests.
//!
//! Per order, the event log is the authoritative history and the summary
//! record is a denormalized cache updated in lockstep with each append (the
//! two-write protocol in [`log::OrderLog`]). Ingress input is validated once
//! into a typed [`SubmitOrder`]; internal components never re-validate.

pub mod error;
pub mod event;
pub mod log;
pub mod request;
pub mod status;
pub mod summary;

pub use error::OrderError;
pub use event::{FailureReason, OrderEvent, OrderEventRecord};
pub use log::{AppendOutcome, OrderLog};
pub use request::{SubmitItemRequest, SubmitOrder, SubmitOrderRequest, ValidationError};
pub use status::OrderStatus;
pub use summary::{OrderLine, OrderSummary};
