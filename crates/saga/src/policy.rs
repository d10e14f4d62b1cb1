//! Per-step retry, backoff and timeout policies.

use std::time::Duration;

use rand::Rng;

/// Retry policy for one saga step.
///
/// Delays follow `base_delay * 2^attempt`, capped at `max_delay`, with
/// uniform jitter of ±`jitter` applied so concurrent retries don't stampede.
#[derive(Debug, Clone)]
pub struct StepPolicy {
    /// Retries after the first attempt (0 = single attempt).
    pub max_retries: u32,

    /// Backoff before the first retry.
    pub base_delay: Duration,

    /// Upper bound on any single backoff wait.
    pub max_delay: Duration,

    /// Jitter fraction (0.2 = ±20%).
    pub jitter: f64,

    /// Hard deadline for a single attempt.
    pub attempt_timeout: Duration,
}

impl StepPolicy {
    /// Returns the backoff delay before retry number `attempt` (0-indexed).
    pub fn delay(&self, attempt: u32) -> Duration {
        let exp = 2u64.saturating_pow(attempt.min(32));
        let raw = self
            .base_delay
            .saturating_mul(u32::try_from(exp).unwrap_or(u32::MAX));
        let capped = raw.min(self.max_delay);

        if self.jitter <= 0.0 || capped.is_zero() {
            return capped;
        }
        let base_ms = capped.as_millis() as f64;
        let spread = base_ms * self.jitter;
        let jittered = rand::thread_rng().gen_range(base_ms - spread..=base_ms + spread);
        Duration::from_millis(jittered.max(0.0) as u64)
    }

    /// Returns true if retry number `attempt` (0-indexed) is still allowed.
    pub fn can_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }
}

/// The per-step policies of the order saga.
#[derive(Debug, Clone)]
pub struct SagaPolicies {
    pub reserve: StepPolicy,
    pub charge: StepPolicy,
    pub confirm: StepPolicy,

    /// Compensation release: effectively unbounded retries; the reservation
    /// TTL is the final backstop.
    pub release: StepPolicy,
}

impl Default for SagaPolicies {
    fn default() -> Self {
        Self {
            reserve: StepPolicy {
                max_retries: 3,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                jitter: 0.2,
                attempt_timeout: Duration::from_secs(2),
            },
            charge: StepPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(250),
                max_delay: Duration::from_secs(10),
                jitter: 0.2,
                attempt_timeout: Duration::from_secs(5),
            },
            confirm: StepPolicy {
                max_retries: 5,
                base_delay: Duration::from_millis(50),
                max_delay: Duration::from_secs(10),
                jitter: 0.2,
                attempt_timeout: Duration::from_secs(2),
            },
            release: StepPolicy {
                max_retries: u32::MAX,
                base_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(5),
                jitter: 0.2,
                attempt_timeout: Duration::from_secs(2),
            },
        }
    }
}

impl SagaPolicies {
    /// Policies with no waits, for tests that drive many retries.
    pub fn immediate() -> Self {
        let instant = |max_retries| StepPolicy {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            jitter: 0.0,
            attempt_timeout: Duration::from_secs(2),
        };
        Self {
            reserve: instant(3),
            charge: instant(2),
            confirm: instant(5),
            release: instant(64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(jitter: f64) -> StepPolicy {
        StepPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            jitter,
            attempt_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn delay_doubles_per_attempt_without_jitter() {
        let p = policy(0.0);
        assert_eq!(p.delay(0), Duration::from_millis(100));
        assert_eq!(p.delay(1), Duration::from_millis(200));
        assert_eq!(p.delay(2), Duration::from_millis(400));
    }

    #[test]
    fn delay_is_capped_at_max() {
        let p = policy(0.0);
        assert_eq!(p.delay(10), Duration::from_secs(1));
        assert_eq!(p.delay(31), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let p = policy(0.2);
        for attempt in 0..4 {
            let base = policy(0.0).delay(attempt).as_millis() as f64;
            for _ in 0..50 {
                let d = p.delay(attempt).as_millis() as f64;
                assert!(d >= base * 0.8 - 1.0 && d <= base * 1.2 + 1.0, "delay {d} out of ±20% of {base}");
            }
        }
    }

    #[test]
    fn retry_allowance_is_bounded() {
        let p = policy(0.0);
        assert!(p.can_retry(0));
        assert!(p.can_retry(2));
        assert!(!p.can_retry(3));
    }

    #[test]
    fn defaults_match_the_step_table() {
        let p = SagaPolicies::default();
        assert_eq!(p.reserve.max_retries, 3);
        assert_eq!(p.reserve.base_delay, Duration::from_millis(100));
        assert_eq!(p.reserve.attempt_timeout, Duration::from_secs(2));

        assert_eq!(p.charge.max_retries, 2);
        assert_eq!(p.charge.base_delay, Duration::from_millis(250));
        assert_eq!(p.charge.attempt_timeout, Duration::from_secs(5));

        assert_eq!(p.confirm.max_retries, 5);
        assert_eq!(p.confirm.base_delay, Duration::from_millis(50));
        assert_eq!(p.confirm.attempt_timeout, Duration::from_secs(2));

        assert_eq!(p.release.max_retries, u32::MAX);
        assert_eq!(p.release.max_delay, Duration::from_secs(5));
    }
}
