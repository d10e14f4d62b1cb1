//! The record store trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::{RecordKey, Result, StoredRecord, Version};

/// Read consistency level.
///
/// `Strong` guarantees read-your-writes across all clients. Backends that are
/// strongly consistent by construction may serve both levels identically.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Consistency {
    Strong,
    Eventual,
}

/// Predicate evaluated atomically with a numeric [`RecordStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddGuard {
    /// No predicate; the add always applies.
    None,

    /// The add applies only if `field + delta >= 0`.
    ResultNonNegative,
}

/// A strongly-consistent keyed store with atomic conditional writes.
///
/// All cross-worker coordination in the system goes through these five
/// primitives; there are no in-process locks above this trait. Calls are
/// idempotent when combined with caller-supplied versioning; callers never
/// retry `put_if_absent` blindly.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Writes a record only if no live record exists under the key.
    ///
    /// Fails with [`StoreError::Conflict`] otherwise. An expired record is
    /// treated as absent and replaced. Returns the new record's version.
    ///
    /// [`StoreError::Conflict`]: crate::StoreError::Conflict
    async fn put_if_absent(
        &self,
        key: &RecordKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<Version>;

    /// Replaces a record's value only if its version matches `expected`.
    ///
    /// Fails with [`StoreError::VersionMismatch`] otherwise (a missing record
    /// reports the actual version as [`Version::initial`]). On success the
    /// version is incremented and the record's TTL is left unchanged.
    ///
    /// [`StoreError::VersionMismatch`]: crate::StoreError::VersionMismatch
    async fn compare_and_set(
        &self,
        key: &RecordKey,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version>;

    /// Atomically adds `delta` to an integer field of the record body.
    ///
    /// The optional guard is evaluated atomically with the write; a violated
    /// guard fails with [`StoreError::GuardFailed`] carrying the observed
    /// value. Returns the field's new value.
    ///
    /// [`StoreError::GuardFailed`]: crate::StoreError::GuardFailed
    async fn add(&self, key: &RecordKey, field: &str, delta: i64, guard: AddGuard) -> Result<i64>;

    /// Reads a record. Expired records read as `None`.
    async fn get(&self, key: &RecordKey, consistency: Consistency) -> Result<Option<StoredRecord>>;

    /// Removes a record. Removing an absent record is a no-op.
    async fn delete(&self, key: &RecordKey) -> Result<()>;

    /// Lists the live records of a partition whose sort key starts with
    /// `sk_prefix`, ordered by sort key ascending.
    async fn list(&self, table: &str, pk: &str, sk_prefix: &str) -> Result<Vec<StoredRecord>>;
}
