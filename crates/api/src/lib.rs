//! HTTP ingress for the CloudFlow order system.
//!
//! Exposes order submission (202 + async saga execution) and status polling,
//! with structured logging (tracing) and Prometheus metrics.

pub mod config;
pub mod error;
pub mod routes;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use metrics_exporter_prometheus::PrometheusHandle;
use record_store::RecordStore;
use resilience::{CircuitBreakerRegistry, IdempotencyLedger};
use saga::{
    InMemoryNotificationQueue, InMemoryPaymentProvider, Payments, SagaOrchestrator, SagaPolicies,
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use config::Config;
use routes::orders::AppState;

/// Creates the Axum application router with all routes and shared state.
pub fn create_app<S: RecordStore + Clone + Send + Sync + 'static>(
    state: Arc<AppState<S>>,
    metrics_handle: PrometheusHandle,
) -> Router {
    let metrics_router = Router::new()
        .route("/metrics", get(routes::metrics::get))
        .with_state(metrics_handle);

    Router::new()
        .route("/health", get(routes::health::check))
        .route("/orders", post(routes::orders::submit::<S>))
        .route("/orders/{id}", get(routes::orders::get::<S>))
        .with_state(state)
        .merge(metrics_router)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Builds the application state: orchestrator plus the handles tests use to
/// script the payment provider and observe notifications.
pub fn create_state<S: RecordStore + Clone + Send + Sync + 'static>(
    store: S,
    config: &Config,
) -> (
    Arc<AppState<S>>,
    InMemoryPaymentProvider,
    InMemoryNotificationQueue,
) {
    let provider = InMemoryPaymentProvider::new();
    let notifications = InMemoryNotificationQueue::new();

    let saga = SagaOrchestrator::with_components(
        orders::OrderLog::new(store.clone()),
        inventory::InventoryEngine::new(store.clone()),
        IdempotencyLedger::with_config(store.clone(), config.ledger_config()),
        CircuitBreakerRegistry::with_config(store.clone(), config.breaker_config()),
        Payments::new(store),
        provider.clone(),
        notifications.clone(),
        SagaPolicies::default(),
    );

    let state = Arc::new(AppState {
        saga: Arc::new(saga),
    });

    (state, provider, notifications)
}
