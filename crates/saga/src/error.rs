//! Saga error types.

use common::OrderId;
use orders::{FailureReason, OrderError};
use record_store::StoreError;
use resilience::LedgerError;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure of a single saga step attempt.
///
/// Serializable because step failures are recorded by the idempotency ledger
/// and replayed to later invocations. `Unavailable` and `Timeout` are the
/// retryable kinds; everything else settles the step.
#[derive(Debug, Clone, Serialize, Deserialize, Error)]
pub enum StepError {
    /// Transient infrastructure failure (store or dependency).
    #[error("unavailable: {message}")]
    Unavailable { message: String },

    /// The attempt overran its deadline.
    #[error("timed out after {timeout_ms} ms")]
    Timeout { timeout_ms: u64 },

    /// The circuit breaker rejected the call without invoking the provider.
    #[error("circuit open, retry after {retry_after_seconds}s")]
    CircuitOpen { retry_after_seconds: u64 },

    /// A business outcome settled the step (insufficient stock, decline,
    /// cancellation).
    #[error("{reason}")]
    Failed { reason: FailureReason },

    /// Invariant violation; never retried.
    #[error("internal: {message}")]
    Internal { message: String },
}

impl StepError {
    /// Returns true for failures the per-step retry policy may retry.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StepError::Unavailable { .. } | StepError::Timeout { .. })
    }

    /// The failure reason to record on the order when this error settles it.
    pub fn into_failure_reason(self) -> FailureReason {
        match self {
            StepError::Failed { reason } => reason,
            StepError::CircuitOpen {
                retry_after_seconds,
            } => FailureReason::PaymentProviderUnavailable {
                retry_after_seconds,
            },
            StepError::Unavailable { message } | StepError::Internal { message } => {
                FailureReason::Internal { message }
            }
            StepError::Timeout { timeout_ms } => FailureReason::Internal {
                message: format!("step timed out after {timeout_ms} ms"),
            },
        }
    }

    pub(crate) fn unavailable(message: impl std::fmt::Display) -> Self {
        StepError::Unavailable {
            message: message.to_string(),
        }
    }

    pub(crate) fn internal(message: impl std::fmt::Display) -> Self {
        StepError::Internal {
            message: message.to_string(),
        }
    }
}

impl From<LedgerError<StepError>> for StepError {
    fn from(e: LedgerError<StepError>) -> Self {
        match e {
            LedgerError::Operation(inner) => inner,
            // Another worker holds the step; back off and retry.
            LedgerError::InProgress { key } => StepError::Unavailable {
                message: format!("step '{key}' is executing elsewhere"),
            },
            LedgerError::Store(StoreError::Unavailable(message)) => {
                StepError::Unavailable { message }
            }
            LedgerError::Store(e) => StepError::internal(e),
            LedgerError::Corrupt { key, source } => {
                StepError::internal(format!("corrupt ledger record '{key}': {source}"))
            }
        }
    }
}

/// Errors surfaced by the orchestrator itself.
///
/// Step failures are not among them: those settle the order through
/// compensation or a terminal `FAILED` record and `execute` still returns
/// the final summary.
#[derive(Debug, Error)]
pub enum SagaError {
    /// No order exists under this ID.
    #[error("order not found: {0}")]
    OrderNotFound(OrderId),

    /// The order log failed while recording a transition.
    #[error(transparent)]
    Order(#[from] OrderError),

    /// Unrecoverable orchestration failure.
    #[error("saga internal error: {0}")]
    Internal(String),
}
