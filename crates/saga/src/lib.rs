//! SAGA orchestration for order processing.
//!
//! The orchestrator drives each order through `reserve inventory → charge
//! payment → confirm` as a sequence of local transactions, compensating in
//! reverse order when a step fails non-retryably. Every step runs through
//! the idempotency ledger (re-invocation on retry or crash-recovery is a
//! replay, not a re-execution), and the charge step is guarded by the
//! shared circuit breaker in front of the payment provider.

pub mod error;
pub mod notification;
pub mod orchestrator;
pub mod payment;
pub mod policy;

pub use error::{SagaError, StepError};
pub use notification::{
    InMemoryNotificationQueue, Notification, NotificationError, NotificationKind,
    NotificationQueue,
};
pub use orchestrator::{PAYMENT_PROVIDER, SagaOrchestrator, SubmitOutcome};
pub use payment::{
    ChargeOutcome, ChargeRequest, InMemoryPaymentProvider, PaymentProvider, PaymentRecord,
    PaymentStatus, Payments, ProviderError,
};
pub use policy::{SagaPolicies, StepPolicy};
