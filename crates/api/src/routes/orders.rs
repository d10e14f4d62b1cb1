//! Order submission and status endpoints.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use common::OrderId;
use orders::{FailureReason, SubmitOrderRequest};
use record_store::{Consistency, RecordStore};
use saga::{InMemoryNotificationQueue, InMemoryPaymentProvider, SagaOrchestrator};
use serde::Serialize;

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: RecordStore + Clone> {
    pub saga: Arc<SagaOrchestrator<S, InMemoryPaymentProvider, InMemoryNotificationQueue>>,
}

// -- Response types --

#[derive(Serialize)]
pub struct AcceptedResponse {
    pub order_id: String,
    pub status: &'static str,
}

#[derive(Serialize)]
pub struct OrderResponse {
    pub order_id: String,
    pub status: String,
    pub customer_id: String,
    pub total_minor_units: i64,
    pub correlation_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    pub events: Vec<OrderEventResponse>,
}

#[derive(Serialize)]
pub struct OrderEventResponse {
    pub seq: u64,
    #[serde(rename = "type")]
    pub event_type: &'static str,
    pub occurred_at: DateTime<Utc>,
}

// -- Handlers --

/// POST /orders — validate, durably record PENDING, start the saga, 202.
///
/// The only synchronous failure is validation; outcomes are observed by
/// polling `GET /orders/{id}`.
#[tracing::instrument(skip(state, request))]
pub async fn submit<S: RecordStore + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Json(request): Json<SubmitOrderRequest>,
) -> Result<(StatusCode, Json<AcceptedResponse>), ApiError> {
    let cmd = request.validate()?;
    let order_id = cmd.order_id;

    let outcome = state.saga.submit(&cmd).await?;

    // Exactly one submission per order starts an execution; duplicates just
    // observe the winner's record.
    if outcome.created {
        let saga = state.saga.clone();
        tokio::spawn(async move {
            if let Err(e) = saga.execute(order_id).await {
                tracing::error!(%order_id, error = %e, "saga execution failed");
            }
        });
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(AcceptedResponse {
            order_id: order_id.to_string(),
            status: "PENDING",
        }),
    ))
}

/// GET /orders/{id} — current summary plus the full event timeline.
#[tracing::instrument(skip(state))]
pub async fn get<S: RecordStore + Clone + Send + Sync + 'static>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<OrderResponse>, ApiError> {
    let order_id = OrderId::parse(&id)
        .map_err(|e| ApiError::BadRequest(format!("invalid order id '{id}': {e}")))?;

    let summary = state
        .saga
        .log()
        .current(order_id, Consistency::Eventual)
        .await
        .map_err(saga::SagaError::from)?
        .ok_or_else(|| ApiError::NotFound(format!("order {id} not found")))?;

    let events = state
        .saga
        .log()
        .history(order_id)
        .await
        .map_err(saga::SagaError::from)?
        .into_iter()
        .map(|record| OrderEventResponse {
            seq: record.seq,
            event_type: record.event.event_type(),
            occurred_at: record.occurred_at,
        })
        .collect();

    Ok(Json(OrderResponse {
        order_id: summary.order_id.to_string(),
        status: summary.status.to_string(),
        customer_id: summary.customer_id.to_string(),
        total_minor_units: summary.total_minor_units.minor_units(),
        correlation_id: summary.correlation_id.to_string(),
        failure: summary.failure,
        events,
    }))
}
