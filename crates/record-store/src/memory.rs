//! In-memory record store.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use crate::{
    AddGuard, Consistency, RecordKey, RecordStore, Result, StoreError, StoredRecord, Version,
};

/// In-memory implementation of [`RecordStore`].
///
/// Strongly consistent by construction (a single map behind an async lock).
/// Used by tests and single-process deployments; it also supports fault
/// injection so callers' retry and fail-open paths can be exercised.
#[derive(Clone, Default)]
pub struct InMemoryRecordStore {
    records: Arc<RwLock<HashMap<RecordKey, StoredRecord>>>,
    unavailable: Arc<AtomicBool>,
    fail_next: Arc<AtomicU32>,
}

impl InMemoryRecordStore {
    /// Creates a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// While set, every operation fails with `Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Makes the next `n` operations fail with `Unavailable`, then recover.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Returns the number of live records.
    pub async fn record_count(&self) -> usize {
        let now = Utc::now();
        self.records
            .read()
            .await
            .values()
            .filter(|r| !r.is_expired(now))
            .count()
    }

    /// Clears all records and fault flags.
    pub async fn clear(&self) {
        self.records.write().await.clear();
        self.unavailable.store(false, Ordering::SeqCst);
        self.fail_next.store(0, Ordering::SeqCst);
    }

    fn check_available(&self) -> Result<()> {
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected || self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("injected fault".to_string()));
        }
        Ok(())
    }

    fn expiry(now: DateTime<Utc>, ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|d| now + chrono::Duration::milliseconds(d.as_millis() as i64))
    }
}

#[async_trait]
impl RecordStore for InMemoryRecordStore {
    async fn put_if_absent(
        &self,
        key: &RecordKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<Version> {
        self.check_available()?;
        let now = Utc::now();
        let mut records = self.records.write().await;

        if let Some(existing) = records.get(key)
            && !existing.is_expired(now)
        {
            return Err(StoreError::Conflict { key: key.clone() });
        }

        records.insert(
            key.clone(),
            StoredRecord {
                value,
                version: Version::first(),
                expires_at: Self::expiry(now, ttl),
            },
        );
        Ok(Version::first())
    }

    async fn compare_and_set(
        &self,
        key: &RecordKey,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        self.check_available()?;
        let now = Utc::now();
        let mut records = self.records.write().await;

        let Some(existing) = records.get_mut(key).filter(|r| !r.is_expired(now)) else {
            return Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected,
                actual: Version::initial(),
            });
        };

        if existing.version != expected {
            return Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected,
                actual: existing.version,
            });
        }

        existing.value = value;
        existing.version = existing.version.next();
        Ok(existing.version)
    }

    async fn add(&self, key: &RecordKey, field: &str, delta: i64, guard: AddGuard) -> Result<i64> {
        self.check_available()?;
        let now = Utc::now();
        let mut records = self.records.write().await;

        let Some(existing) = records.get_mut(key).filter(|r| !r.is_expired(now)) else {
            return Err(StoreError::NotFound { key: key.clone() });
        };

        let Some(current) = existing.value.get(field).and_then(|v| v.as_i64()) else {
            return Err(StoreError::NonNumericField {
                key: key.clone(),
                field: field.to_string(),
            });
        };

        let new = current + delta;
        if guard == AddGuard::ResultNonNegative && new < 0 {
            return Err(StoreError::GuardFailed {
                key: key.clone(),
                field: field.to_string(),
                observed: current,
                delta,
            });
        }

        existing.value[field] = serde_json::json!(new);
        existing.version = existing.version.next();
        Ok(new)
    }

    async fn get(&self, key: &RecordKey, _consistency: Consistency) -> Result<Option<StoredRecord>> {
        self.check_available()?;
        let now = Utc::now();
        let records = self.records.read().await;
        Ok(records.get(key).filter(|r| !r.is_expired(now)).cloned())
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        self.check_available()?;
        self.records.write().await.remove(key);
        Ok(())
    }

    async fn list(&self, table: &str, pk: &str, sk_prefix: &str) -> Result<Vec<StoredRecord>> {
        self.check_available()?;
        let now = Utc::now();
        let records = self.records.read().await;

        let mut matching: Vec<(&RecordKey, &StoredRecord)> = records
            .iter()
            .filter(|(k, r)| {
                k.table == table && k.pk == pk && k.sk.starts_with(sk_prefix) && !r.is_expired(now)
            })
            .collect();
        matching.sort_by(|(a, _), (b, _)| a.sk.cmp(&b.sk));

        Ok(matching.into_iter().map(|(_, r)| r.clone()).collect())
    }
}
