//! PostgreSQL-backed record store.
//!
//! The RDBMS adapter from the store abstraction: one `records` table, with
//! conditional writes expressed as single SQL statements so every primitive
//! stays atomic without explicit transactions.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

use crate::{
    AddGuard, Consistency, RecordKey, RecordStore, Result, StoreError, StoredRecord, Version,
};

/// PostgreSQL implementation of [`RecordStore`].
#[derive(Clone)]
pub struct PostgresRecordStore {
    pool: PgPool,
}

impl PostgresRecordStore {
    /// Creates a new store over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Gets a reference to the underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Runs the database migrations.
    pub async fn run_migrations(&self) -> std::result::Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await
    }

    fn row_to_record(row: &PgRow) -> Result<StoredRecord> {
        Ok(StoredRecord {
            value: row.try_get("value").map_err(db_unavailable)?,
            version: Version::new(row.try_get("version").map_err(db_unavailable)?),
            expires_at: row.try_get("expires_at").map_err(db_unavailable)?,
        })
    }

    fn expiry(ttl: Option<Duration>) -> Option<DateTime<Utc>> {
        ttl.map(|d| Utc::now() + chrono::Duration::milliseconds(d.as_millis() as i64))
    }
}

// Infrastructure failures surface as Unavailable; callers decide on retry.
fn db_unavailable(e: sqlx::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

#[async_trait]
impl RecordStore for PostgresRecordStore {
    async fn put_if_absent(
        &self,
        key: &RecordKey,
        value: serde_json::Value,
        ttl: Option<Duration>,
    ) -> Result<Version> {
        // The ON CONFLICT branch only fires for expired rows, which makes
        // "expired counts as absent" a single atomic statement.
        let result = sqlx::query(
            r#"
            INSERT INTO records (tbl, pk, sk, value, version, expires_at)
            VALUES ($1, $2, $3, $4, 1, $5)
            ON CONFLICT (tbl, pk, sk) DO UPDATE
                SET value = EXCLUDED.value, version = 1, expires_at = EXCLUDED.expires_at
                WHERE records.expires_at IS NOT NULL AND records.expires_at <= now()
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .bind(&value)
        .bind(Self::expiry(ttl))
        .execute(&self.pool)
        .await
        .map_err(db_unavailable)?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict { key: key.clone() });
        }
        Ok(Version::first())
    }

    async fn compare_and_set(
        &self,
        key: &RecordKey,
        expected: Version,
        value: serde_json::Value,
    ) -> Result<Version> {
        let row = sqlx::query(
            r#"
            UPDATE records SET value = $5, version = version + 1
            WHERE tbl = $1 AND pk = $2 AND sk = $3 AND version = $4
              AND (expires_at IS NULL OR expires_at > now())
            RETURNING version
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .bind(expected.as_i64())
        .bind(&value)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_unavailable)?;

        if let Some(row) = row {
            let version: i64 = row.try_get("version").map_err(db_unavailable)?;
            return Ok(Version::new(version));
        }

        // Lost the race (or the record is gone): report what is actually there.
        let actual = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT version FROM records
            WHERE tbl = $1 AND pk = $2 AND sk = $3
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_unavailable)?;

        Err(StoreError::VersionMismatch {
            key: key.clone(),
            expected,
            actual: actual.map(Version::new).unwrap_or_else(Version::initial),
        })
    }

    async fn add(&self, key: &RecordKey, field: &str, delta: i64, guard: AddGuard) -> Result<i64> {
        let guarded = guard == AddGuard::ResultNonNegative;

        let row = sqlx::query(
            r#"
            UPDATE records
            SET value = jsonb_set(value, ARRAY[$4]::text[], to_jsonb((value->>$4)::bigint + $5)),
                version = version + 1
            WHERE tbl = $1 AND pk = $2 AND sk = $3
              AND (expires_at IS NULL OR expires_at > now())
              AND jsonb_typeof(value->$4) = 'number'
              AND (NOT $6 OR (value->>$4)::bigint + $5 >= 0)
            RETURNING (value->>$4)::bigint AS new_value
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .bind(field)
        .bind(delta)
        .bind(guarded)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_unavailable)?;

        if let Some(row) = row {
            let new_value: i64 = row.try_get("new_value").map_err(db_unavailable)?;
            return Ok(new_value);
        }

        // Nothing updated: distinguish missing record, bad field and a
        // violated guard by inspecting the live row.
        let row = sqlx::query(
            r#"
            SELECT value FROM records
            WHERE tbl = $1 AND pk = $2 AND sk = $3
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_unavailable)?;

        let Some(row) = row else {
            return Err(StoreError::NotFound { key: key.clone() });
        };

        let value: serde_json::Value = row.try_get("value").map_err(db_unavailable)?;
        match value.get(field).and_then(|v| v.as_i64()) {
            None => Err(StoreError::NonNumericField {
                key: key.clone(),
                field: field.to_string(),
            }),
            Some(observed) => Err(StoreError::GuardFailed {
                key: key.clone(),
                field: field.to_string(),
                observed,
                delta,
            }),
        }
    }

    async fn get(&self, key: &RecordKey, _consistency: Consistency) -> Result<Option<StoredRecord>> {
        // A single-primary Postgres serves strong and eventual reads alike.
        let row = sqlx::query(
            r#"
            SELECT value, version, expires_at FROM records
            WHERE tbl = $1 AND pk = $2 AND sk = $3
              AND (expires_at IS NULL OR expires_at > now())
            "#,
        )
        .bind(&key.table)
        .bind(&key.pk)
        .bind(&key.sk)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_unavailable)?;

        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn delete(&self, key: &RecordKey) -> Result<()> {
        sqlx::query("DELETE FROM records WHERE tbl = $1 AND pk = $2 AND sk = $3")
            .bind(&key.table)
            .bind(&key.pk)
            .bind(&key.sk)
            .execute(&self.pool)
            .await
            .map_err(db_unavailable)?;
        Ok(())
    }

    async fn list(&self, table: &str, pk: &str, sk_prefix: &str) -> Result<Vec<StoredRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT value, version, expires_at FROM records
            WHERE tbl = $1 AND pk = $2 AND starts_with(sk, $3)
              AND (expires_at IS NULL OR expires_at > now())
            ORDER BY sk
            "#,
        )
        .bind(table)
        .bind(pk)
        .bind(sk_prefix)
        .fetch_all(&self.pool)
        .await
        .map_err(db_unavailable)?;

        rows.iter().map(Self::row_to_record).collect()
    }
}
