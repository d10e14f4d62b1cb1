//! Application configuration loaded from environment variables.

use std::time::Duration;

use resilience::{BreakerConfig, LedgerConfig};

/// Server configuration with sensible defaults.
///
/// Reads from environment variables:
/// - `HOST` — bind address (default: `"0.0.0.0"`)
/// - `PORT` — listen port (default: `3000`)
/// - `RUST_LOG` — tracing filter directive (default: `"info"`)
/// - `DATABASE_URL` — PostgreSQL connection string (default: `None`, uses the in-memory store)
/// - `DB_MAX_CONNECTIONS` — max database pool connections (default: `10`)
/// - `IDEMPOTENCY_TTL_SECONDS` — outcome retention (default: `86400`)
/// - `IDEMPOTENCY_IN_PROGRESS_TIMEOUT_MS` — orphaned-claim reclaim age (default: `10000`)
/// - `BREAKER_FAIL_THRESHOLD` — consecutive failures before opening (default: `5`)
/// - `BREAKER_SUCCESS_THRESHOLD` — probe successes before closing (default: `2`)
/// - `BREAKER_COOLDOWN_SECONDS` — open-state cooldown (default: `60`)
#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    pub database_url: Option<String>,
    pub db_max_connections: u32,
    pub idempotency_ttl: Duration,
    pub idempotency_in_progress_timeout: Duration,
    pub breaker_fail_threshold: u32,
    pub breaker_success_threshold: u32,
    pub breaker_cooldown: Duration,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Loads configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self {
            host: std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env_parsed("PORT", 3000),
            log_level: std::env::var("RUST_LOG").unwrap_or_else(|_| "info".to_string()),
            database_url: std::env::var("DATABASE_URL").ok(),
            db_max_connections: env_parsed("DB_MAX_CONNECTIONS", 10),
            idempotency_ttl: Duration::from_secs(env_parsed("IDEMPOTENCY_TTL_SECONDS", 86_400)),
            idempotency_in_progress_timeout: Duration::from_millis(env_parsed(
                "IDEMPOTENCY_IN_PROGRESS_TIMEOUT_MS",
                10_000,
            )),
            breaker_fail_threshold: env_parsed("BREAKER_FAIL_THRESHOLD", 5),
            breaker_success_threshold: env_parsed("BREAKER_SUCCESS_THRESHOLD", 2),
            breaker_cooldown: Duration::from_secs(env_parsed("BREAKER_COOLDOWN_SECONDS", 60)),
        }
    }

    /// Returns the `"host:port"` bind address string.
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Idempotency ledger configuration derived from this config.
    pub fn ledger_config(&self) -> LedgerConfig {
        LedgerConfig {
            ttl: self.idempotency_ttl,
            in_progress_timeout: self.idempotency_in_progress_timeout,
        }
    }

    /// Circuit breaker configuration derived from this config.
    pub fn breaker_config(&self) -> BreakerConfig {
        BreakerConfig {
            fail_threshold: self.breaker_fail_threshold,
            success_threshold: self.breaker_success_threshold,
            cooldown: self.breaker_cooldown,
            ..BreakerConfig::default()
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            log_level: "info".to_string(),
            database_url: None,
            db_max_connections: 10,
            idempotency_ttl: Duration::from_secs(86_400),
            idempotency_in_progress_timeout: Duration::from_secs(10),
            breaker_fail_threshold: 5,
            breaker_success_threshold: 2,
            breaker_cooldown: Duration::from_secs(60),
        }
    }
}
