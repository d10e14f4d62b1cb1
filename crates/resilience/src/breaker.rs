//! Circuit breaker registry.
//!
//! Per-dependency three-state machine (CLOSED → OPEN → HALF_OPEN) whose
//! counters and transitions live in the record store, so all workers observe
//! one truth and the breaker survives restarts. Transitions are
//! compare-and-set races: one winner, losers re-read.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use record_store::{Consistency, RecordKey, RecordStore, StoreError, StoredRecord, Version};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const TABLE: &str = "circuit_breakers";

/// Breaker state for one dependency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CircuitState {
    /// Calls pass through; consecutive failures are counted.
    #[serde(rename = "CLOSED")]
    Closed,

    /// Calls fast-fail until the cooldown elapses.
    #[serde(rename = "OPEN")]
    Open,

    /// One probe call at a time is let through to test recovery.
    #[serde(rename = "HALF_OPEN")]
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "CLOSED",
            CircuitState::Open => "OPEN",
            CircuitState::HalfOpen => "HALF_OPEN",
        };
        write!(f, "{s}")
    }
}

/// Result of an `allow` check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllowDecision {
    /// The call may proceed.
    Permit,

    /// The call is rejected; the dependency may recover after `retry_after`.
    Reject { retry_after: Duration },
}

/// Outcome of a guarded call, reported back via `record`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Failure,
}

/// Breaker tuning knobs (per registry; dependencies share them).
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Consecutive failures in CLOSED before the circuit opens.
    pub fail_threshold: u32,

    /// Consecutive probe successes in HALF_OPEN before the circuit closes.
    pub success_threshold: u32,

    /// How long the circuit stays OPEN before permitting a probe.
    pub cooldown: Duration,

    /// Age past which a stuck probe is forgotten and the slot freed.
    pub probe_in_flight_timeout: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            fail_threshold: 5,
            success_threshold: 2,
            cooldown: Duration::from_secs(60),
            probe_in_flight_timeout: Duration::from_secs(10),
        }
    }
}

/// Errors surfaced by the registry.
///
/// Store outages are NOT among them: the breaker is fail-open and degrades
/// to permitting calls when its own state is unreachable.
#[derive(Debug, Error)]
pub enum BreakerError {
    /// The record store failed in a non-transient way.
    #[error("breaker store error: {0}")]
    Store(StoreError),

    /// A stored breaker record could not be decoded.
    #[error("breaker record for '{name}' could not be decoded: {source}")]
    Corrupt {
        name: String,
        source: serde_json::Error,
    },
}

/// Error from [`CircuitBreakerRegistry::call`].
#[derive(Debug, Error)]
pub enum BreakerCallError<E> {
    /// The circuit rejected the call without invoking the dependency.
    #[error("circuit '{name}' is open, retry after {retry_after:?}")]
    Open { name: String, retry_after: Duration },

    /// The dependency was invoked and failed.
    #[error("dependency call failed: {0}")]
    Inner(E),

    /// The registry itself failed.
    #[error(transparent)]
    Registry(BreakerError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BreakerRecord {
    state: CircuitState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    opened_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    probe_in_flight_at: Option<DateTime<Utc>>,
}

impl BreakerRecord {
    fn closed() -> Self {
        Self {
            state: CircuitState::Closed,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: None,
            probe_in_flight_at: None,
        }
    }

    fn open(now: DateTime<Utc>) -> Self {
        Self {
            state: CircuitState::Open,
            consecutive_failures: 0,
            consecutive_successes: 0,
            opened_at: Some(now),
            probe_in_flight_at: None,
        }
    }
}

/// Circuit breaker registry over a shared record store.
#[derive(Clone)]
pub struct CircuitBreakerRegistry<S> {
    store: S,
    config: BreakerConfig,
}

impl<S: RecordStore> CircuitBreakerRegistry<S> {
    /// Creates a registry with default thresholds.
    pub fn new(store: S) -> Self {
        Self::with_config(store, BreakerConfig::default())
    }

    /// Creates a registry with explicit thresholds.
    pub fn with_config(store: S, config: BreakerConfig) -> Self {
        Self { store, config }
    }

    /// Consults (and possibly transitions) the breaker for `name`.
    ///
    /// In OPEN past the cooldown, the first caller wins a compare-and-set to
    /// HALF_OPEN and becomes the probe; in HALF_OPEN the probe slot admits
    /// one caller at a time. If the store is unavailable the breaker fails
    /// open and permits the call.
    #[tracing::instrument(skip(self))]
    pub async fn allow(&self, name: &str) -> Result<AllowDecision, BreakerError> {
        let key = RecordKey::new(TABLE, name);

        loop {
            let (record, version) = match self.load_or_create(name, &key).await {
                Ok(loaded) => loaded,
                Err(BreakerError::Store(e)) if e.is_unavailable() => {
                    return Ok(self.fail_open(name, &e));
                }
                Err(e) => return Err(e),
            };
            let now = Utc::now();

            match record.state {
                CircuitState::Closed => return Ok(AllowDecision::Permit),

                CircuitState::Open => {
                    let opened_at = record.opened_at.unwrap_or(now);
                    let reopens = opened_at
                        + chrono::Duration::milliseconds(self.config.cooldown.as_millis() as i64);
                    if now < reopens {
                        let retry_after = (reopens - now).to_std().unwrap_or_default();
                        return Ok(AllowDecision::Reject { retry_after });
                    }

                    // Cooldown elapsed: transition to HALF_OPEN and claim the
                    // probe slot in one write. Losers re-read.
                    let mut probe = record.clone();
                    probe.state = CircuitState::HalfOpen;
                    probe.consecutive_successes = 0;
                    probe.consecutive_failures = 0;
                    probe.probe_in_flight_at = Some(now);
                    match self.write(&key, version, &probe, name).await {
                        Ok(()) => {
                            metrics::counter!("circuit_breaker_probes_total").increment(1);
                            tracing::info!(name, "circuit transitioned OPEN -> HALF_OPEN, probing");
                            return Ok(AllowDecision::Permit);
                        }
                        Err(WriteLoss::Raced) => continue,
                        Err(WriteLoss::Unavailable(e)) => return Ok(self.fail_open(name, &e)),
                        Err(WriteLoss::Fatal(e)) => return Err(e),
                    }
                }

                CircuitState::HalfOpen => {
                    if let Some(at) = record.probe_in_flight_at {
                        let stuck_after = at
                            + chrono::Duration::milliseconds(
                                self.config.probe_in_flight_timeout.as_millis() as i64,
                            );
                        if now < stuck_after {
                            let retry_after = (stuck_after - now).to_std().unwrap_or_default();
                            return Ok(AllowDecision::Reject { retry_after });
                        }
                        // Probe is stuck; fall through and steal the slot.
                    }

                    let mut probe = record.clone();
                    probe.probe_in_flight_at = Some(now);
                    match self.write(&key, version, &probe, name).await {
                        Ok(()) => return Ok(AllowDecision::Permit),
                        Err(WriteLoss::Raced) => continue,
                        Err(WriteLoss::Unavailable(e)) => return Ok(self.fail_open(name, &e)),
                        Err(WriteLoss::Fatal(e)) => return Err(e),
                    }
                }
            }
        }
    }

    /// Records the outcome of a call made under a `Permit`.
    #[tracing::instrument(skip(self))]
    pub async fn record(&self, name: &str, outcome: Outcome) -> Result<(), BreakerError> {
        let key = RecordKey::new(TABLE, name);

        loop {
            let (record, version) = match self.load_or_create(name, &key).await {
                Ok(loaded) => loaded,
                Err(BreakerError::Store(e)) if e.is_unavailable() => {
                    tracing::warn!(name, error = %e, "breaker store unavailable, outcome not recorded");
                    return Ok(());
                }
                Err(e) => return Err(e),
            };
            let now = Utc::now();

            let Some(next) = self.transition(&record, outcome, now, name) else {
                return Ok(());
            };

            match self.write(&key, version, &next, name).await {
                Ok(()) => return Ok(()),
                Err(WriteLoss::Raced) => continue,
                Err(WriteLoss::Unavailable(e)) => {
                    tracing::warn!(name, error = %e, "breaker store unavailable, outcome not recorded");
                    return Ok(());
                }
                Err(WriteLoss::Fatal(e)) => return Err(e),
            }
        }
    }

    /// Runs `op` through the breaker: consult, invoke, record.
    ///
    /// `Ok` from `op` records a success, `Err` a failure. Callers model
    /// "the dependency answered, but negatively" (e.g. a payment decline) as
    /// `Ok` so business outcomes don't trip the breaker.
    pub async fn call<T, E, F, Fut>(&self, name: &str, op: F) -> Result<T, BreakerCallError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        match self.allow(name).await.map_err(BreakerCallError::Registry)? {
            AllowDecision::Reject { retry_after } => Err(BreakerCallError::Open {
                name: name.to_string(),
                retry_after,
            }),
            AllowDecision::Permit => match op().await {
                Ok(value) => {
                    self.record(name, Outcome::Success)
                        .await
                        .map_err(BreakerCallError::Registry)?;
                    Ok(value)
                }
                Err(e) => {
                    self.record(name, Outcome::Failure)
                        .await
                        .map_err(BreakerCallError::Registry)?;
                    Err(BreakerCallError::Inner(e))
                }
            },
        }
    }

    /// Returns the current state of a breaker (CLOSED if never used).
    pub async fn state(&self, name: &str) -> Result<CircuitState, BreakerError> {
        let key = RecordKey::new(TABLE, name);
        match self.store.get(&key, Consistency::Strong).await {
            Ok(Some(stored)) => Ok(decode(name, &stored)?.state),
            Ok(None) => Ok(CircuitState::Closed),
            Err(e) if e.is_unavailable() => Ok(CircuitState::Closed),
            Err(e) => Err(BreakerError::Store(e)),
        }
    }

    /// Forces the breaker back to CLOSED (admin / test affordance).
    pub async fn reset(&self, name: &str) -> Result<(), BreakerError> {
        let key = RecordKey::new(TABLE, name);
        self.store.delete(&key).await.map_err(BreakerError::Store)
    }

    /// Computes the successor record, or `None` when nothing changes.
    fn transition(
        &self,
        record: &BreakerRecord,
        outcome: Outcome,
        now: DateTime<Utc>,
        name: &str,
    ) -> Option<BreakerRecord> {
        match (record.state, outcome) {
            (CircuitState::Closed, Outcome::Success) => {
                if record.consecutive_failures == 0 {
                    return None;
                }
                let mut next = record.clone();
                next.consecutive_failures = 0;
                Some(next)
            }
            (CircuitState::Closed, Outcome::Failure) => {
                let failures = record.consecutive_failures + 1;
                if failures >= self.config.fail_threshold {
                    metrics::counter!("circuit_breaker_opened_total").increment(1);
                    tracing::warn!(name, failures, "circuit OPENED");
                    Some(BreakerRecord::open(now))
                } else {
                    let mut next = record.clone();
                    next.consecutive_failures = failures;
                    Some(next)
                }
            }
            (CircuitState::HalfOpen, Outcome::Success) => {
                let successes = record.consecutive_successes + 1;
                if successes >= self.config.success_threshold {
                    metrics::counter!("circuit_breaker_closed_total").increment(1);
                    tracing::info!(name, successes, "circuit CLOSED after successful probes");
                    Some(BreakerRecord::closed())
                } else {
                    let mut next = record.clone();
                    next.consecutive_successes = successes;
                    next.probe_in_flight_at = None;
                    Some(next)
                }
            }
            (CircuitState::HalfOpen, Outcome::Failure) => {
                metrics::counter!("circuit_breaker_opened_total").increment(1);
                tracing::warn!(name, "probe failed, circuit re-OPENED");
                Some(BreakerRecord::open(now))
            }
            // Late results arriving after a transition carry no signal.
            (CircuitState::Open, _) => None,
        }
    }

    async fn load_or_create(
        &self,
        name: &str,
        key: &RecordKey,
    ) -> Result<(BreakerRecord, Version), BreakerError> {
        loop {
            match self.store.get(key, Consistency::Strong).await {
                Ok(Some(stored)) => return Ok((decode(name, &stored)?, stored.version)),
                Ok(None) => {
                    let fresh = BreakerRecord::closed();
                    let value = serde_json::to_value(&fresh)
                        .map_err(|e| BreakerError::Store(StoreError::Serialization(e)))?;
                    match self.store.put_if_absent(key, value, None).await {
                        Ok(version) => return Ok((fresh, version)),
                        Err(StoreError::Conflict { .. }) => continue,
                        Err(e) => return Err(BreakerError::Store(e)),
                    }
                }
                Err(e) => return Err(BreakerError::Store(e)),
            }
        }
    }

    async fn write(
        &self,
        key: &RecordKey,
        expected: Version,
        record: &BreakerRecord,
        name: &str,
    ) -> Result<(), WriteLoss> {
        let value = serde_json::to_value(record).map_err(|e| {
            WriteLoss::Fatal(BreakerError::Store(StoreError::Serialization(e)))
        })?;
        match self.store.compare_and_set(key, expected, value).await {
            Ok(_) => Ok(()),
            Err(StoreError::VersionMismatch { .. }) => {
                tracing::debug!(name, "lost breaker transition race, re-reading");
                Err(WriteLoss::Raced)
            }
            Err(e) if e.is_unavailable() => Err(WriteLoss::Unavailable(e)),
            Err(e) => Err(WriteLoss::Fatal(BreakerError::Store(e))),
        }
    }

    fn fail_open(&self, name: &str, error: &StoreError) -> AllowDecision {
        metrics::counter!("circuit_breaker_fail_open_total").increment(1);
        tracing::warn!(name, %error, "breaker store unavailable, failing open");
        AllowDecision::Permit
    }
}

enum WriteLoss {
    Raced,
    Unavailable(StoreError),
    Fatal(BreakerError),
}

fn decode(name: &str, stored: &StoredRecord) -> Result<BreakerRecord, BreakerError> {
    stored.decode().map_err(|e| BreakerError::Corrupt {
        name: name.to_string(),
        source: e,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use record_store::InMemoryRecordStore;

    const DEP: &str = "payment_provider";

    fn registry(store: &InMemoryRecordStore, config: BreakerConfig) -> CircuitBreakerRegistry<InMemoryRecordStore> {
        CircuitBreakerRegistry::with_config(store.clone(), config)
    }

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            fail_threshold: 3,
            success_threshold: 2,
            cooldown: Duration::ZERO,
            probe_in_flight_timeout: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn closed_permits_and_success_resets_failures() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, BreakerConfig::default());

        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);

        for _ in 0..4 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }
        // A success wipes the streak; four more failures still don't open.
        breaker.record(DEP, Outcome::Success).await.unwrap();
        for _ in 0..4 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
    }

    #[tokio::test]
    async fn opens_after_fail_threshold_and_rejects() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(
            &store,
            BreakerConfig {
                cooldown: Duration::from_secs(60),
                ..fast_config()
            },
        );

        for _ in 0..3 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Open);

        match breaker.allow(DEP).await.unwrap() {
            AllowDecision::Reject { retry_after } => {
                assert!(retry_after <= Duration::from_secs(60));
                assert!(retry_after > Duration::from_secs(50));
            }
            AllowDecision::Permit => panic!("open circuit must reject"),
        }
    }

    #[tokio::test]
    async fn cooldown_elapsed_admits_exactly_one_probe() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        for _ in 0..3 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }

        // Zero cooldown: first caller becomes the probe...
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::HalfOpen);

        // ...and the slot shuts out everyone else while it is in flight.
        assert!(matches!(
            breaker.allow(DEP).await.unwrap(),
            AllowDecision::Reject { .. }
        ));
    }

    #[tokio::test]
    async fn probe_successes_close_the_circuit() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        for _ in 0..3 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }

        for _ in 0..2 {
            assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
            breaker.record(DEP, Outcome::Success).await.unwrap();
        }

        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
    }

    #[tokio::test]
    async fn probe_failure_reopens() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        for _ in 0..3 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
        breaker.record(DEP, Outcome::Failure).await.unwrap();

        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn call_wires_outcomes_through() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        let ok: Result<&str, BreakerCallError<&str>> =
            breaker.call(DEP, || async { Ok::<_, &str>("captured") }).await;
        assert_eq!(ok.unwrap(), "captured");

        for _ in 0..3 {
            let _ = breaker.call(DEP, || async { Err::<(), _>("timeout") }).await;
        }
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Open);
    }

    #[tokio::test]
    async fn fails_open_when_store_is_down() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        store.set_unavailable(true);
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
        breaker.record(DEP, Outcome::Failure).await.unwrap();
    }

    #[tokio::test]
    async fn reset_returns_to_closed() {
        let store = InMemoryRecordStore::new();
        let breaker = registry(&store, fast_config());

        for _ in 0..3 {
            breaker.record(DEP, Outcome::Failure).await.unwrap();
        }
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Open);

        breaker.reset(DEP).await.unwrap();
        assert_eq!(breaker.state(DEP).await.unwrap(), CircuitState::Closed);
        assert_eq!(breaker.allow(DEP).await.unwrap(), AllowDecision::Permit);
    }

    #[tokio::test]
    async fn registries_share_state_through_the_store() {
        let store = InMemoryRecordStore::new();
        let worker_a = registry(&store, fast_config());
        let worker_b = registry(&store, fast_config());

        for _ in 0..3 {
            worker_a.record(DEP, Outcome::Failure).await.unwrap();
        }

        // A different worker over the same store sees the open circuit.
        assert_eq!(worker_b.state(DEP).await.unwrap(), CircuitState::Open);
    }
}
