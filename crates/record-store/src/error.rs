//! Record store error types.

use thiserror::Error;

use crate::{RecordKey, Version};

/// Errors surfaced by record store operations.
///
/// Everything except `Unavailable` is a definitive outcome the caller can
/// act on; `Unavailable` means the backend itself failed transiently and the
/// operation may be retried.
#[derive(Debug, Error)]
pub enum StoreError {
    /// `put_if_absent` found a live record under the key.
    #[error("record already exists: {key}")]
    Conflict { key: RecordKey },

    /// `compare_and_set` found a different version than expected.
    #[error("version mismatch for {key}: expected {expected}, found {actual}")]
    VersionMismatch {
        key: RecordKey,
        expected: Version,
        actual: Version,
    },

    /// A guarded `add` would have violated its predicate.
    #[error("guard failed for {key}.{field}: observed {observed}, delta {delta}")]
    GuardFailed {
        key: RecordKey,
        field: String,
        observed: i64,
        delta: i64,
    },

    /// The addressed record does not exist.
    #[error("record not found: {key}")]
    NotFound { key: RecordKey },

    /// `add` targeted a field that is missing or not an integer.
    #[error("field '{field}' of {key} is not an integer")]
    NonNumericField { key: RecordKey, field: String },

    /// The record body could not be encoded or decoded.
    #[error("record serialization: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Transient backend failure; the operation may be retried.
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Returns true for transient infrastructure failures.
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

/// Result type for record store operations.
pub type Result<T> = std::result::Result<T, StoreError>;
