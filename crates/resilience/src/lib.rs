//! Shared-state resilience patterns for the order system.
//!
//! Both patterns keep their state in the record store rather than in-process,
//! so every worker observes one truth and nothing resets on restart:
//!
//! - [`IdempotencyLedger`] converts at-least-once invocation into
//!   effectively-exactly-once effects via a claim/execute/publish protocol.
//! - [`CircuitBreakerRegistry`] guards external dependencies with a
//!   three-state machine whose transitions are compare-and-set races.

pub mod breaker;
pub mod idempotency;

pub use breaker::{
    AllowDecision, BreakerCallError, BreakerConfig, BreakerError, CircuitBreakerRegistry,
    CircuitState, Outcome,
};
pub use idempotency::{ErrorClass, IdempotencyLedger, LedgerConfig, LedgerError};
