//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::{Money, ProductId};
use metrics_exporter_prometheus::PrometheusHandle;
use record_store::InMemoryRecordStore;
use saga::{InMemoryNotificationQueue, InMemoryPaymentProvider};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            metrics_exporter_prometheus::PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

struct TestApp {
    app: axum::Router,
    state: Arc<api::routes::orders::AppState<InMemoryRecordStore>>,
    provider: InMemoryPaymentProvider,
    #[allow(dead_code)]
    notifications: InMemoryNotificationQueue,
}

async fn setup() -> TestApp {
    let store = InMemoryRecordStore::new();
    let config = api::config::Config::default();
    let (state, provider, notifications) = api::create_state(store, &config);

    state
        .saga
        .inventory()
        .seed(ProductId::new("KEYBD-01"), 10, Money::from_minor_units(8999))
        .await
        .unwrap();

    let app = api::create_app(state.clone(), get_metrics_handle());
    TestApp {
        app,
        state,
        provider,
        notifications,
    }
}

async fn post_json(app: &axum::Router, uri: &str, body: serde_json::Value) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .method("POST")
                .uri(uri)
                .header("content-type", "application/json")
                .body(Body::from(serde_json::to_string(&body).unwrap()))
                .unwrap(),
        )
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

async fn get_json(app: &axum::Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = app
        .clone()
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();

    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, json)
}

/// Polls GetOrder until the status is terminal (the submit response is 202;
/// outcomes are observed by polling).
async fn poll_until_terminal(app: &axum::Router, order_id: &str) -> serde_json::Value {
    for _ in 0..100 {
        let (status, body) = get_json(app, &format!("/orders/{order_id}")).await;
        assert_eq!(status, StatusCode::OK);
        let s = body["status"].as_str().unwrap();
        if matches!(s, "CONFIRMED" | "COMPENSATED" | "FAILED") {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("order {order_id} never reached a terminal status");
}

fn order_body() -> serde_json::Value {
    serde_json::json!({
        "customer_id": "c1",
        "items": [{"product_id": "KEYBD-01", "quantity": 1, "unit_price_minor_units": 8999}]
    })
}

#[tokio::test]
async fn health_check() {
    let test = setup().await;
    let (status, body) = get_json(&test.app, "/health").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn submit_accepts_and_confirms_asynchronously() {
    let test = setup().await;

    let (status, body) = post_json(&test.app, "/orders", order_body()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["status"], "PENDING");
    let order_id = body["order_id"].as_str().unwrap().to_string();

    let order = poll_until_terminal(&test.app, &order_id).await;
    assert_eq!(order["status"], "CONFIRMED");
    assert_eq!(order["total_minor_units"], 8999);
    assert_eq!(order["customer_id"], "c1");
    assert!(!order["correlation_id"].as_str().unwrap().is_empty());

    let types: Vec<&str> = order["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec![
            "ORDER_CREATED",
            "STOCK_RESERVED",
            "PAYMENT_CHARGED",
            "ORDER_CONFIRMED"
        ]
    );

    // Inventory observed through the engine handle.
    let available = test
        .state
        .saga
        .inventory()
        .available(&ProductId::new("KEYBD-01"))
        .await
        .unwrap();
    assert_eq!(available, 9);
}

#[tokio::test]
async fn declined_payment_surfaces_through_polling() {
    let test = setup().await;
    test.provider.push_decline("card_declined");

    let (status, body) = post_json(&test.app, "/orders", order_body()).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let order_id = body["order_id"].as_str().unwrap().to_string();

    let order = poll_until_terminal(&test.app, &order_id).await;
    assert_eq!(order["status"], "COMPENSATED");
    assert_eq!(order["failure"]["code"], "PAYMENT_DECLINED");
}

#[tokio::test]
async fn insufficient_stock_fails_without_compensation() {
    let test = setup().await;

    let body = serde_json::json!({
        "customer_id": "c1",
        "items": [{"product_id": "KEYBD-01", "quantity": 11, "unit_price_minor_units": 8999}]
    });
    let (status, accepted) = post_json(&test.app, "/orders", body).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let order_id = accepted["order_id"].as_str().unwrap().to_string();

    let order = poll_until_terminal(&test.app, &order_id).await;
    assert_eq!(order["status"], "FAILED");
    assert_eq!(order["failure"]["code"], "INSUFFICIENT_STOCK");
    assert_eq!(order["failure"]["requested"], 11);
    assert_eq!(order["failure"]["available"], 10);
}

#[tokio::test]
async fn validation_failures_are_synchronous() {
    let test = setup().await;

    // No items
    let (status, body) = post_json(
        &test.app,
        "/orders",
        serde_json::json!({"customer_id": "c1", "items": []}),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "VALIDATION");

    // Empty customer
    let (status, _) = post_json(
        &test.app,
        "/orders",
        serde_json::json!({
            "customer_id": "",
            "items": [{"product_id": "KEYBD-01", "quantity": 1, "unit_price_minor_units": 1}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Zero quantity
    let (status, _) = post_json(
        &test.app,
        "/orders",
        serde_json::json!({
            "customer_id": "c1",
            "items": [{"product_id": "KEYBD-01", "quantity": 0, "unit_price_minor_units": 1}]
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn duplicate_submissions_return_the_same_order() {
    let test = setup().await;
    let order_id = common::OrderId::new().to_string();

    let body = serde_json::json!({
        "order_id": order_id,
        "customer_id": "c1",
        "items": [{"product_id": "KEYBD-01", "quantity": 1, "unit_price_minor_units": 8999}]
    });

    let (status_a, a) = post_json(&test.app, "/orders", body.clone()).await;
    let (status_b, b) = post_json(&test.app, "/orders", body).await;
    assert_eq!(status_a, StatusCode::ACCEPTED);
    assert_eq!(status_b, StatusCode::ACCEPTED);
    assert_eq!(a["order_id"], b["order_id"]);

    poll_until_terminal(&test.app, &order_id).await;

    // One order's worth of stock, not two.
    let available = test
        .state
        .saga
        .inventory()
        .available(&ProductId::new("KEYBD-01"))
        .await
        .unwrap();
    assert_eq!(available, 9);
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let test = setup().await;
    let (status, body) = get_json(&test.app, &format!("/orders/{}", common::OrderId::new())).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["code"], "NOT_FOUND");
}

#[tokio::test]
async fn malformed_order_id_is_bad_request() {
    let test = setup().await;
    let (status, _) = get_json(&test.app, "/orders/not-a-ulid").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn metrics_endpoint_renders() {
    let test = setup().await;
    let response = test
        .app
        .clone()
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
