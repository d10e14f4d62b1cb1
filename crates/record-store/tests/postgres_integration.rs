//! PostgreSQL integration tests
//!
//! These tests run serially against a single shared PostgreSQL container and
//! verify that the SQL adapter matches the in-memory store's conditional
//! write semantics. The container is removed when the test process exits.
//!
//! Run with:
//!
//! ```bash
//! cargo test -p record-store --test postgres_integration
//! ```

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use record_store::{
    AddGuard, Consistency, PostgresRecordStore, RecordKey, RecordStore, StoreError, Version,
};
use serial_test::serial;
use sqlx::PgPool;
use testcontainers::{ContainerAsync, ImageExt, core::IntoContainerPort, runners::AsyncRunner};
use testcontainers_modules::postgres::Postgres;
use tokio::sync::OnceCell;

/// Container and connection string - initialized once, lives for entire test run
struct TestContainer {
    #[allow(dead_code)] // Container must stay alive for connection to work
    container: ContainerAsync<Postgres>,
    connection_string: String,
}

/// Global container - OnceCell ensures single async initialization
static TEST_CONTAINER: OnceCell<Arc<TestContainer>> = OnceCell::const_new();

/// Store container ID for cleanup at exit
static CONTAINER_ID: OnceLock<String> = OnceLock::new();

/// Cleanup function that runs when the test process exits
#[ctor::dtor]
fn cleanup_container() {
    if let Some(container_id) = CONTAINER_ID.get() {
        // Use docker CLI to remove the container since we can't use async here
        let _ = std::process::Command::new("docker")
            .args(["rm", "-f", container_id])
            .output();
    }
}

/// Get the shared container (async, initializes on first call)
async fn get_container() -> Arc<TestContainer> {
    TEST_CONTAINER
        .get_or_init(|| async {
            let container = Postgres::default()
                .with_tag("16-alpine")
                .start()
                .await
                .expect("Failed to start PostgreSQL container");

            let container_id = container.id().to_string();
            let _ = CONTAINER_ID.set(container_id);

            let host = container.get_host().await.unwrap();
            let port = container.get_host_port_ipv4(5432.tcp()).await.unwrap();

            let connection_string =
                format!("postgres://postgres:postgres@{}:{}/postgres", host, port);

            let pool = PgPool::connect(&connection_string).await.unwrap();
            sqlx::raw_sql(include_str!("../../../migrations/001_create_records_table.sql"))
                .execute(&pool)
                .await
                .unwrap();
            pool.close().await;

            Arc::new(TestContainer {
                container,
                connection_string,
            })
        })
        .await
        .clone()
}

async fn store() -> PostgresRecordStore {
    let container = get_container().await;
    let pool = PgPool::connect(&container.connection_string).await.unwrap();
    PostgresRecordStore::new(pool)
}

fn unique_key(table: &str) -> RecordKey {
    RecordKey::new(table, uuid::Uuid::new_v4().to_string())
}

#[tokio::test]
#[serial]
async fn put_if_absent_conflicts_on_live_record() {
    let store = store().await;
    let key = unique_key("inventory");

    store
        .put_if_absent(&key, serde_json::json!({"available": 10}), None)
        .await
        .unwrap();

    let err = store
        .put_if_absent(&key, serde_json::json!({"available": 99}), None)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::Conflict { .. }));
}

#[tokio::test]
#[serial]
async fn put_if_absent_reclaims_expired_record() {
    let store = store().await;
    let key = unique_key("idempotency");

    store
        .put_if_absent(&key, serde_json::json!({"n": 1}), Some(Duration::ZERO))
        .await
        .unwrap();

    // Expired row is invisible and reclaimable
    assert!(store.get(&key, Consistency::Strong).await.unwrap().is_none());
    store
        .put_if_absent(&key, serde_json::json!({"n": 2}), None)
        .await
        .unwrap();

    let rec = store.get(&key, Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(rec.value["n"], 2);
    assert_eq!(rec.version, Version::first());
}

#[tokio::test]
#[serial]
async fn compare_and_set_serializes_writers() {
    let store = store().await;
    let key = unique_key("circuit_breakers");

    store
        .put_if_absent(&key, serde_json::json!({"state": "CLOSED"}), None)
        .await
        .unwrap();

    let v2 = store
        .compare_and_set(&key, Version::first(), serde_json::json!({"state": "OPEN"}))
        .await
        .unwrap();
    assert_eq!(v2, Version::new(2));

    let err = store
        .compare_and_set(&key, Version::first(), serde_json::json!({"state": "HALF_OPEN"}))
        .await
        .unwrap_err();
    match err {
        StoreError::VersionMismatch { actual, .. } => assert_eq!(actual, Version::new(2)),
        other => panic!("unexpected error: {other}"),
    }

    let rec = store.get(&key, Consistency::Strong).await.unwrap().unwrap();
    assert_eq!(rec.value["state"], "OPEN");
}

#[tokio::test]
#[serial]
async fn guarded_add_matches_memory_semantics() {
    let store = store().await;
    let key = unique_key("inventory");

    store
        .put_if_absent(&key, serde_json::json!({"available": 2, "sku": "WEBCAM-4K"}), None)
        .await
        .unwrap();

    // Exact depletion passes
    assert_eq!(
        store
            .add(&key, "available", -2, AddGuard::ResultNonNegative)
            .await
            .unwrap(),
        0
    );

    // Overdraw fails with the observed value
    let err = store
        .add(&key, "available", -1, AddGuard::ResultNonNegative)
        .await
        .unwrap_err();
    match err {
        StoreError::GuardFailed { observed, .. } => assert_eq!(observed, 0),
        other => panic!("unexpected error: {other}"),
    }

    // Release path: unguarded increment restores stock
    assert_eq!(store.add(&key, "available", 2, AddGuard::None).await.unwrap(), 2);
}

#[tokio::test]
#[serial]
async fn add_diagnoses_missing_and_non_numeric() {
    let store = store().await;

    let missing = unique_key("inventory");
    let err = store.add(&missing, "available", 1, AddGuard::None).await.unwrap_err();
    assert!(matches!(err, StoreError::NotFound { .. }));

    let bad = unique_key("inventory");
    store
        .put_if_absent(&bad, serde_json::json!({"available": "many"}), None)
        .await
        .unwrap();
    let err = store.add(&bad, "available", 1, AddGuard::None).await.unwrap_err();
    assert!(matches!(err, StoreError::NonNumericField { .. }));
}

#[tokio::test]
#[serial]
async fn list_returns_partition_in_sort_key_order() {
    let store = store().await;
    let pk = uuid::Uuid::new_v4().to_string();

    for sk in ["EVENT#00000002", "META", "EVENT#00000001", "EVENT#00000003"] {
        store
            .put_if_absent(
                &RecordKey::with_sort("orders", &pk, sk),
                serde_json::json!({"sk": sk}),
                None,
            )
            .await
            .unwrap();
    }

    let events = store.list("orders", &pk, "EVENT#").await.unwrap();
    let sks: Vec<&str> = events.iter().map(|r| r.value["sk"].as_str().unwrap()).collect();
    assert_eq!(sks, vec!["EVENT#00000001", "EVENT#00000002", "EVENT#00000003"]);
}

#[tokio::test]
#[serial]
async fn delete_then_get_is_none() {
    let store = store().await;
    let key = unique_key("reservations");

    store.put_if_absent(&key, serde_json::json!({}), None).await.unwrap();
    store.delete(&key).await.unwrap();
    store.delete(&key).await.unwrap();
    assert!(store.get(&key, Consistency::Strong).await.unwrap().is_none());
}
