//! Idempotency ledger.
//!
//! Records the outcome of a logical operation under a caller-chosen key so
//! that replays (concurrent or later) observe the stored outcome instead
//! of re-executing the operation.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use record_store::{Consistency, RecordKey, RecordStore, StoreError, Version};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const TABLE: &str = "idempotency";

/// Classification of an operation failure, declared by the caller.
///
/// Retryable failures release the key so a later attempt may re-execute;
/// permanent failures are recorded and replayed to every caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    Permanent,
}

/// Ledger tuning knobs.
#[derive(Debug, Clone)]
pub struct LedgerConfig {
    /// How long a recorded outcome is remembered.
    pub ttl: Duration,

    /// Age past which an `IN_PROGRESS` record is presumed orphaned by a
    /// crashed owner and may be reclaimed.
    pub in_progress_timeout: Duration,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(24 * 60 * 60),
            in_progress_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors surfaced by [`IdempotencyLedger::run`].
#[derive(Debug, Error)]
pub enum LedgerError<E> {
    /// The operation failed, either in this invocation or in the recorded
    /// one being replayed.
    #[error("operation failed")]
    Operation(E),

    /// Another invocation holds the key; back off and retry.
    #[error("operation '{key}' is already in progress")]
    InProgress { key: String },

    /// The record store failed.
    #[error("idempotency store error: {0}")]
    Store(StoreError),

    /// A stored outcome could not be decoded.
    #[error("stored outcome for '{key}' could not be decoded: {source}")]
    Corrupt {
        key: String,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum LedgerState {
    #[serde(rename = "IN_PROGRESS")]
    InProgress,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "FAILED")]
    Failed,
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    state: LedgerState,
    owner: String,
    created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<serde_json::Value>,
}

impl LedgerRecord {
    fn in_progress(owner: &str) -> Self {
        Self {
            state: LedgerState::InProgress,
            owner: owner.to_string(),
            created_at: Utc::now(),
            result: None,
            error: None,
        }
    }
}

/// The idempotency ledger.
///
/// `run(key, classify, op)` guarantees that `op` executes at most once per
/// live key across all concurrent and sequential callers, and that every
/// caller returns the same serialized outcome of the one execution.
#[derive(Clone)]
pub struct IdempotencyLedger<S> {
    store: S,
    config: LedgerConfig,
}

impl<S: RecordStore> IdempotencyLedger<S> {
    /// Creates a ledger with default configuration.
    pub fn new(store: S) -> Self {
        Self::with_config(store, LedgerConfig::default())
    }

    /// Creates a ledger with explicit configuration.
    pub fn with_config(store: S, config: LedgerConfig) -> Self {
        Self { store, config }
    }

    /// Runs `op` under `key`, at most once per live key.
    ///
    /// - First caller claims the key, executes, and publishes the outcome.
    /// - Replays return the stored result (or stored permanent failure).
    /// - A retryable failure releases the key for a later attempt.
    /// - An `IN_PROGRESS` record older than `in_progress_timeout` is presumed
    ///   orphaned and reclaimed by exactly one recoverer.
    #[tracing::instrument(skip(self, classify, op))]
    pub async fn run<T, E, F, Fut, C>(
        &self,
        key: &str,
        classify: C,
        op: F,
    ) -> Result<T, LedgerError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        let record_key = RecordKey::new(TABLE, key);
        let owner = Uuid::new_v4().to_string();
        let mut op = Some(op);

        // `op` is consumed on the first successful claim; every other branch
        // either returns or loops without touching it.
        loop {
            let claim = LedgerRecord::in_progress(&owner);
            let claim_value = serde_json::to_value(&claim)
                .map_err(|e| LedgerError::Store(StoreError::Serialization(e)))?;

            match self
                .store
                .put_if_absent(&record_key, claim_value, Some(self.config.ttl))
                .await
            {
                Ok(version) => {
                    let op = op.take().expect("claim succeeds at most once");
                    return self.execute(&record_key, version, classify, op).await;
                }
                Err(StoreError::Conflict { .. }) => {}
                Err(e) => return Err(LedgerError::Store(e)),
            }

            // Key is held: inspect the existing record.
            let existing = self
                .store
                .get(&record_key, Consistency::Strong)
                .await
                .map_err(LedgerError::Store)?;

            let Some(existing) = existing else {
                // Deleted (or expired) between our claim and read; try again.
                continue;
            };

            let record: LedgerRecord = existing.decode().map_err(|e| LedgerError::Corrupt {
                key: key.to_string(),
                source: e,
            })?;

            match record.state {
                LedgerState::Done => {
                    metrics::counter!("idempotency_replays_total").increment(1);
                    tracing::debug!(key, "idempotency replay, returning stored result");
                    return decode_outcome(key, record.result);
                }
                LedgerState::Failed => {
                    let stored: E = decode_outcome(key, record.error)?;
                    return Err(LedgerError::Operation(stored));
                }
                LedgerState::InProgress => {
                    let age = Utc::now() - record.created_at;
                    if age < chrono::Duration::from_std(self.config.in_progress_timeout)
                        .unwrap_or(chrono::Duration::MAX)
                    {
                        return Err(LedgerError::InProgress {
                            key: key.to_string(),
                        });
                    }

                    // Presumed orphaned: try to take over ownership.
                    let reclaim = LedgerRecord::in_progress(&owner);
                    let reclaim_value = serde_json::to_value(&reclaim)
                        .map_err(|e| LedgerError::Store(StoreError::Serialization(e)))?;
                    match self
                        .store
                        .compare_and_set(&record_key, existing.version, reclaim_value)
                        .await
                    {
                        Ok(version) => {
                            metrics::counter!("idempotency_reclaims_total").increment(1);
                            tracing::warn!(key, prior_owner = %record.owner, "reclaimed orphaned idempotency record");
                            let op = op.take().expect("claim succeeds at most once");
                            return self.execute(&record_key, version, classify, op).await;
                        }
                        // Another recoverer beat us; re-inspect.
                        Err(StoreError::VersionMismatch { .. }) => continue,
                        Err(e) => return Err(LedgerError::Store(e)),
                    }
                }
            }
        }
    }

    async fn execute<T, E, F, Fut, C>(
        &self,
        record_key: &RecordKey,
        claimed_version: Version,
        classify: C,
        op: F,
    ) -> Result<T, LedgerError<E>>
    where
        T: Serialize + DeserializeOwned,
        E: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        C: Fn(&E) -> ErrorClass,
    {
        match op().await {
            Ok(result) => {
                self.publish(
                    record_key,
                    claimed_version,
                    LedgerState::Done,
                    serde_json::to_value(&result)
                        .map_err(|e| LedgerError::Store(StoreError::Serialization(e)))?,
                )
                .await?;
                Ok(result)
            }
            Err(e) if classify(&e) == ErrorClass::Retryable => {
                // Release the key so a later attempt can re-execute. If the
                // delete itself fails the in-progress timeout is the backstop.
                if let Err(del) = self.store.delete(record_key).await {
                    tracing::warn!(key = %record_key, error = %del, "failed to release idempotency key");
                }
                Err(LedgerError::Operation(e))
            }
            Err(e) => {
                self.publish(
                    record_key,
                    claimed_version,
                    LedgerState::Failed,
                    serde_json::to_value(&e)
                        .map_err(|err| LedgerError::Store(StoreError::Serialization(err)))?,
                )
                .await?;
                Err(LedgerError::Operation(e))
            }
        }
    }

    async fn publish<E>(
        &self,
        record_key: &RecordKey,
        claimed_version: Version,
        state: LedgerState,
        outcome: serde_json::Value,
    ) -> Result<(), LedgerError<E>> {
        let mut record = LedgerRecord::in_progress("");
        record.state = state;
        match state {
            LedgerState::Done => record.result = Some(outcome),
            _ => record.error = Some(outcome),
        }

        let value = serde_json::to_value(&record)
            .map_err(|e| LedgerError::Store(StoreError::Serialization(e)))?;

        match self
            .store
            .compare_and_set(record_key, claimed_version, value)
            .await
        {
            Ok(_) => Ok(()),
            // We were reclaimed mid-flight; the reclaimer's outcome wins.
            Err(StoreError::VersionMismatch { .. }) => {
                tracing::warn!(key = %record_key, "lost idempotency ownership while publishing outcome");
                Ok(())
            }
            Err(e) => Err(LedgerError::Store(e)),
        }
    }
}

fn decode_outcome<T: DeserializeOwned, E>(
    key: &str,
    stored: Option<serde_json::Value>,
) -> Result<T, LedgerError<E>> {
    let value = stored.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(value).map_err(|e| LedgerError::Corrupt {
        key: key.to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_store::InMemoryRecordStore;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, Serialize, Deserialize, PartialEq)]
    enum StepError {
        Unavailable,
        Declined(String),
    }

    fn classify(e: &StepError) -> ErrorClass {
        match e {
            StepError::Unavailable => ErrorClass::Retryable,
            StepError::Declined(_) => ErrorClass::Permanent,
        }
    }

    fn ledger(store: &InMemoryRecordStore) -> IdempotencyLedger<InMemoryRecordStore> {
        IdempotencyLedger::new(store.clone())
    }

    #[tokio::test]
    async fn executes_once_and_replays_stored_result() {
        let store = InMemoryRecordStore::new();
        let ledger = ledger(&store);
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..3 {
            let calls = calls.clone();
            let result: String = ledger
                .run("reserve:o-1", classify, move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StepError>("res-42".to_string())
                })
                .await
                .unwrap();
            assert_eq!(result, "res-42");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn concurrent_holder_yields_in_progress_conflict() {
        let store = InMemoryRecordStore::new();
        let lg = ledger(&store);

        // First invocation claims the key and never finishes (simulated by
        // claiming manually through a second ledger whose op hangs is not
        // needed: claim directly).
        let claim = serde_json::to_value(LedgerRecord::in_progress("other")).unwrap();
        store
            .put_if_absent(&RecordKey::new(TABLE, "charge:o-1"), claim, None)
            .await
            .unwrap();

        let err = lg
            .run("charge:o-1", classify, || async {
                Ok::<_, StepError>("unreached".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::InProgress { .. }));
    }

    #[tokio::test]
    async fn retryable_failure_releases_the_key() {
        let store = InMemoryRecordStore::new();
        let lg = ledger(&store);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let err = lg
            .run("reserve:o-2", classify, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(StepError::Unavailable)
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Operation(StepError::Unavailable)));

        // Key released: the next attempt executes again and can succeed.
        let c = calls.clone();
        let result: String = lg
            .run("reserve:o-2", classify, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok("res-2".to_string())
            })
            .await
            .unwrap();
        assert_eq!(result, "res-2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn permanent_failure_is_recorded_and_replayed() {
        let store = InMemoryRecordStore::new();
        let lg = ledger(&store);
        let calls = Arc::new(AtomicU32::new(0));

        let c = calls.clone();
        let err = lg
            .run("charge:o-3", classify, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Err::<String, _>(StepError::Declined("card_declined".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Operation(StepError::Declined(_))));

        // Replay returns the stored failure without executing again.
        let c = calls.clone();
        let err = lg
            .run("charge:o-3", classify, move || async move {
                c.fetch_add(1, Ordering::SeqCst);
                Ok::<String, _>("should not run".into())
            })
            .await
            .unwrap_err();
        match err {
            LedgerError::Operation(StepError::Declined(reason)) => {
                assert_eq!(reason, "card_declined");
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn stale_in_progress_record_is_reclaimed() {
        let store = InMemoryRecordStore::new();
        let lg = IdempotencyLedger::with_config(
            store.clone(),
            LedgerConfig {
                in_progress_timeout: Duration::ZERO,
                ..LedgerConfig::default()
            },
        );

        // An orphaned claim from a crashed owner.
        let mut orphan = LedgerRecord::in_progress("crashed-worker");
        orphan.created_at = Utc::now() - chrono::Duration::seconds(60);
        store
            .put_if_absent(
                &RecordKey::new(TABLE, "confirm:o-4"),
                serde_json::to_value(&orphan).unwrap(),
                None,
            )
            .await
            .unwrap();

        let result: String = lg
            .run("confirm:o-4", classify, || async {
                Ok::<_, StepError>("confirmed".to_string())
            })
            .await
            .unwrap();
        assert_eq!(result, "confirmed");

        // Outcome published over the reclaimed record.
        let rec = store
            .get(&RecordKey::new(TABLE, "confirm:o-4"), Consistency::Strong)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.value["state"], "DONE");
    }

    #[tokio::test]
    async fn expired_record_permits_re_execution() {
        let store = InMemoryRecordStore::new();
        let lg = IdempotencyLedger::with_config(
            store.clone(),
            LedgerConfig {
                ttl: Duration::ZERO,
                ..LedgerConfig::default()
            },
        );
        let calls = Arc::new(AtomicU32::new(0));

        for _ in 0..2 {
            let c = calls.clone();
            let _: String = lg
                .run("reserve:o-5", classify, move || async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    Ok::<_, StepError>("res".to_string())
                })
                .await
                .unwrap();
        }

        // TTL of zero: the first outcome had already expired by the replay.
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn store_outage_propagates() {
        let store = InMemoryRecordStore::new();
        let lg = ledger(&store);
        store.set_unavailable(true);

        let err = lg
            .run("reserve:o-6", classify, || async {
                Ok::<_, StepError>("unreached".to_string())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::Store(e) if e.is_unavailable()));
    }
}
