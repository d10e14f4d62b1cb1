//! The saga orchestrator.

use std::future::Future;

use common::{CorrelationId, CustomerId, Money, OrderId, PaymentId, ProductId, ReservationId};
use inventory::{InventoryEngine, InventoryError};
use orders::event::{
    FailureData, OrderConfirmedData, PaymentChargedData, PaymentRefundedData, StockReleasedData,
    StockReservedData,
};
use orders::{
    FailureReason, OrderError, OrderEvent, OrderLog, OrderStatus, OrderSummary, SubmitOrder,
};
use record_store::{Consistency, RecordStore};
use resilience::{
    BreakerCallError, CircuitBreakerRegistry, ErrorClass, IdempotencyLedger, LedgerError,
};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::{SagaError, StepError};
use crate::notification::{Notification, NotificationKind, NotificationQueue};
use crate::payment::{ChargeOutcome, ChargeRequest, PaymentProvider, Payments, ProviderError};
use crate::policy::{SagaPolicies, StepPolicy};

/// Dependency name of the payment provider in the breaker registry.
pub const PAYMENT_PROVIDER: &str = "payment_provider";

const CURRENCY: &str = "USD";

/// Everything a step needs from the order, loaded once per execution.
#[derive(Debug, Clone)]
struct StepContext {
    order_id: OrderId,
    customer_id: CustomerId,
    correlation_id: CorrelationId,
    lines: Vec<(ProductId, u32)>,
    total: Money,
}

impl StepContext {
    fn from_summary(summary: &OrderSummary) -> Self {
        Self {
            order_id: summary.order_id,
            customer_id: summary.customer_id.clone(),
            correlation_id: summary.correlation_id.clone(),
            lines: summary
                .items
                .iter()
                .map(|line| (line.product_id.clone(), line.quantity))
                .collect(),
            total: summary.total_minor_units,
        }
    }
}

/// Stored result of the charge step, replayed to later invocations.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChargeStepResult {
    payment_id: PaymentId,
    provider_charge_id: String,
}

/// Result of [`SagaOrchestrator::submit`].
#[derive(Debug, Clone)]
pub struct SubmitOutcome {
    /// The order's summary: freshly created, or the first submission's.
    pub summary: OrderSummary,

    /// True if this call created the order. Exactly one of any number of
    /// concurrent duplicate submissions observes `true`, and only that
    /// caller should start the saga execution.
    pub created: bool,
}

fn classify(e: &StepError) -> ErrorClass {
    if e.is_retryable() {
        ErrorClass::Retryable
    } else {
        ErrorClass::Permanent
    }
}

/// Drives order sagas: forward steps through the idempotency ledger, the
/// charge guarded by the circuit breaker, compensation in reverse order on
/// non-retryable failure.
///
/// The orchestrator holds no in-process coordination state; any worker may
/// execute or resume any order, and every cross-worker decision goes through
/// the record store's atomic primitives.
pub struct SagaOrchestrator<S, P, N>
where
    S: RecordStore + Clone,
    P: PaymentProvider,
    N: NotificationQueue,
{
    log: OrderLog<S>,
    inventory: InventoryEngine<S>,
    ledger: IdempotencyLedger<S>,
    breaker: CircuitBreakerRegistry<S>,
    payments: Payments<S>,
    provider: P,
    notifications: N,
    policies: SagaPolicies,
}

impl<S, P, N> SagaOrchestrator<S, P, N>
where
    S: RecordStore + Clone,
    P: PaymentProvider,
    N: NotificationQueue,
{
    /// Creates an orchestrator with default policies and components over one
    /// shared store.
    pub fn new(store: S, provider: P, notifications: N) -> Self {
        Self {
            log: OrderLog::new(store.clone()),
            inventory: InventoryEngine::new(store.clone()),
            ledger: IdempotencyLedger::new(store.clone()),
            breaker: CircuitBreakerRegistry::new(store.clone()),
            payments: Payments::new(store),
            provider,
            notifications,
            policies: SagaPolicies::default(),
        }
    }

    /// Creates an orchestrator from explicitly configured components.
    #[allow(clippy::too_many_arguments)]
    pub fn with_components(
        log: OrderLog<S>,
        inventory: InventoryEngine<S>,
        ledger: IdempotencyLedger<S>,
        breaker: CircuitBreakerRegistry<S>,
        payments: Payments<S>,
        provider: P,
        notifications: N,
        policies: SagaPolicies,
    ) -> Self {
        Self {
            log,
            inventory,
            ledger,
            breaker,
            payments,
            provider,
            notifications,
            policies,
        }
    }

    /// Replaces the per-step policies.
    pub fn with_policies(mut self, policies: SagaPolicies) -> Self {
        self.policies = policies;
        self
    }

    /// The order log this orchestrator writes.
    pub fn log(&self) -> &OrderLog<S> {
        &self.log
    }

    /// The inventory engine this orchestrator reserves against.
    pub fn inventory(&self) -> &InventoryEngine<S> {
        &self.inventory
    }

    /// The breaker registry guarding the payment provider.
    pub fn breaker(&self) -> &CircuitBreakerRegistry<S> {
        &self.breaker
    }

    /// Payment record bookkeeping.
    pub fn payments(&self) -> &Payments<S> {
        &self.payments
    }

    /// Durably accepts an order: PENDING summary + `ORDER_CREATED` event.
    ///
    /// Duplicate submissions with the same `order_id` collapse to one
    /// record; later callers get the first submission's summary.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, correlation_id = %cmd.correlation_id))]
    pub async fn submit(&self, cmd: &SubmitOrder) -> Result<SubmitOutcome, SagaError> {
        metrics::counter!("saga_executions_total").increment(1);
        match self.log.create(cmd).await {
            Ok(summary) => Ok(SubmitOutcome {
                summary,
                created: true,
            }),
            Err(OrderError::AlreadyExists(id)) => {
                tracing::info!("duplicate submission, returning existing order");
                Ok(SubmitOutcome {
                    summary: self.load(id).await?,
                    created: false,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Submits and executes to a terminal status in one call.
    pub async fn run(&self, cmd: &SubmitOrder) -> Result<OrderSummary, SagaError> {
        self.submit(cmd).await?;
        self.execute(cmd.order_id).await
    }

    /// Drives an order from its current status to a terminal one.
    ///
    /// Safe to call on a fresh order, after a crash (completed steps replay
    /// from the ledger), or on an already-terminal order (no-op).
    pub async fn execute(&self, order_id: OrderId) -> Result<OrderSummary, SagaError> {
        self.execute_with_cancellation(order_id, CancellationToken::new())
            .await
    }

    /// As [`execute`](Self::execute), with cooperative cancellation.
    ///
    /// Cancellation is honored at step boundaries and during backoff waits;
    /// it never aborts mid-write. A cancelled saga with forward effects is
    /// compensated, one without them fails terminally.
    #[tracing::instrument(skip(self, cancel), fields(order_id = %order_id))]
    pub async fn execute_with_cancellation(
        &self,
        order_id: OrderId,
        cancel: CancellationToken,
    ) -> Result<OrderSummary, SagaError> {
        let started = std::time::Instant::now();
        let summary = self.load(order_id).await?;
        let ctx = StepContext::from_summary(&summary);

        let result = self.drive(&ctx, summary, &cancel).await;
        metrics::histogram!("saga_duration_seconds").record(started.elapsed().as_secs_f64());
        result
    }

    async fn drive(
        &self,
        ctx: &StepContext,
        summary: OrderSummary,
        cancel: &CancellationToken,
    ) -> Result<OrderSummary, SagaError> {
        if summary.status.is_terminal() {
            return Ok(summary);
        }
        if summary.status == OrderStatus::Compensating {
            // A previous worker died mid-compensation; finish its job.
            let reason = summary.failure.clone().unwrap_or(FailureReason::Internal {
                message: "compensation resumed without recorded reason".to_string(),
            });
            return self.compensate(ctx, reason).await;
        }

        if cancel.is_cancelled() && summary.status == OrderStatus::Pending {
            return self.fail(ctx, FailureReason::Cancelled).await;
        }

        // Step 1: reserve inventory.
        let reservation_ids = match self
            .run_step(
                "reserve",
                format!("saga:{}:reserve", ctx.order_id),
                &self.policies.reserve,
                cancel,
                || self.reserve_step(ctx),
            )
            .await
        {
            Ok(ids) => ids,
            Err(e) => {
                // Nothing is held: a failed reserve unwinds its own partial
                // holds, so the order settles without compensation.
                let reason = e.into_failure_reason();
                if matches!(reason, FailureReason::InsufficientStock { .. }) {
                    return self.fail(ctx, reason).await;
                }
                return self.compensate(ctx, reason).await;
            }
        };

        if cancel.is_cancelled() {
            return self.compensate(ctx, FailureReason::Cancelled).await;
        }

        // Step 2: charge payment, guarded by the circuit breaker.
        let charge = match self
            .run_step(
                "charge",
                format!("saga:{}:charge", ctx.order_id),
                &self.policies.charge,
                cancel,
                || self.charge_step(ctx),
            )
            .await
        {
            Ok(charge) => charge,
            Err(e) => {
                // Exhausted transient failures mean the provider is down,
                // not that we broke an invariant.
                let reason = match e {
                    StepError::Unavailable { .. } | StepError::Timeout { .. } => {
                        FailureReason::PaymentProviderUnavailable {
                            retry_after_seconds: 0,
                        }
                    }
                    other => other.into_failure_reason(),
                };
                self.append_transition(
                    ctx.order_id,
                    OrderEvent::PaymentFailed(FailureData {
                        reason: reason.clone(),
                    }),
                )
                .await?;
                return self.compensate(ctx, reason).await;
            }
        };

        if cancel.is_cancelled() {
            return self.compensate(ctx, FailureReason::Cancelled).await;
        }

        // Step 3: confirm the order.
        match self
            .run_step(
                "confirm",
                format!("saga:{}:confirm", ctx.order_id),
                &self.policies.confirm,
                cancel,
                || self.confirm_step(ctx, &reservation_ids, &charge),
            )
            .await
        {
            Ok(()) => {
                metrics::counter!("saga_completed").increment(1);
                tracing::info!(
                    order_id = %ctx.order_id,
                    correlation_id = %ctx.correlation_id,
                    "saga completed"
                );
                self.load(ctx.order_id).await
            }
            Err(e) => {
                let reason = e.into_failure_reason();
                self.compensate(ctx, reason).await
            }
        }
    }

    /// Runs one step: invoke through the ledger, retry per policy.
    ///
    /// The ledger makes retries and crash-recovery replays of completed
    /// attempts; the policy bounds how long we chase retryable failures.
    async fn run_step<T, F, Fut>(
        &self,
        step: &'static str,
        key: String,
        policy: &StepPolicy,
        cancel: &CancellationToken,
        op: F,
    ) -> Result<T, StepError>
    where
        T: Serialize + DeserializeOwned,
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, StepError>>,
    {
        let mut attempt: u32 = 0;
        loop {
            let result = self
                .ledger
                .run(&key, classify, || op())
                .await
                .map_err(StepError::from);

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && policy.can_retry(attempt) => {
                    let delay = policy.delay(attempt);
                    attempt += 1;
                    tracing::warn!(step, attempt, error = %e, "step attempt failed, backing off");
                    tokio::select! {
                        () = cancel.cancelled() => {
                            return Err(StepError::Failed {
                                reason: FailureReason::Cancelled,
                            });
                        }
                        () = tokio::time::sleep(delay) => {}
                    }
                }
                Err(e) => {
                    tracing::warn!(step, attempts = attempt + 1, error = %e, "step failed");
                    return Err(e);
                }
            }
        }
    }

    async fn reserve_step(&self, ctx: &StepContext) -> Result<Vec<ReservationId>, StepError> {
        let timeout = self.policies.reserve.attempt_timeout;
        let reservations =
            tokio::time::timeout(timeout, self.inventory.reserve_all(ctx.order_id, &ctx.lines))
                .await
                .map_err(|_| StepError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })?
                .map_err(reserve_error)?;

        let reservation_ids: Vec<ReservationId> =
            reservations.iter().map(|r| r.reservation_id).collect();
        self.append_in_step(
            ctx.order_id,
            OrderEvent::StockReserved(StockReservedData {
                reservation_ids: reservation_ids.clone(),
            }),
        )
        .await?;
        Ok(reservation_ids)
    }

    async fn charge_step(&self, ctx: &StepContext) -> Result<ChargeStepResult, StepError> {
        let timeout = self.policies.charge.attempt_timeout;
        let request = ChargeRequest {
            idempotency_key: format!("charge:{}", ctx.order_id),
            amount_minor_units: ctx.total,
            currency: CURRENCY.to_string(),
            order_id: ctx.order_id,
            customer_id: ctx.customer_id.clone(),
            correlation_id: ctx.correlation_id.to_string(),
        };

        let outcome = self
            .breaker
            .call(PAYMENT_PROVIDER, || {
                let request = request.clone();
                async move {
                    tokio::time::timeout(timeout, self.provider.charge(request))
                        .await
                        .unwrap_or(Err(ProviderError::Timeout))
                }
            })
            .await;

        match outcome {
            Ok(ChargeOutcome::Captured { provider_charge_id }) => {
                let record = self
                    .payments
                    .record_charge(
                        ctx.order_id,
                        ctx.customer_id.clone(),
                        ctx.total,
                        provider_charge_id.clone(),
                    )
                    .await
                    .map_err(StepError::unavailable)?;

                self.append_in_step(
                    ctx.order_id,
                    OrderEvent::PaymentCharged(PaymentChargedData {
                        payment_id: record.payment_id,
                        provider_charge_id: provider_charge_id.clone(),
                    }),
                )
                .await?;

                Ok(ChargeStepResult {
                    payment_id: record.payment_id,
                    provider_charge_id,
                })
            }
            Ok(ChargeOutcome::Declined { reason_code }) => Err(StepError::Failed {
                reason: FailureReason::PaymentDeclined {
                    reason: reason_code,
                },
            }),
            Err(BreakerCallError::Open { retry_after, .. }) => Err(StepError::CircuitOpen {
                retry_after_seconds: retry_after.as_secs(),
            }),
            Err(BreakerCallError::Inner(ProviderError::Timeout)) => Err(StepError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
            Err(BreakerCallError::Inner(e)) => Err(StepError::unavailable(e)),
            Err(BreakerCallError::Registry(e)) => Err(StepError::internal(e)),
        }
    }

    async fn confirm_step(
        &self,
        ctx: &StepContext,
        reservation_ids: &[ReservationId],
        charge: &ChargeStepResult,
    ) -> Result<(), StepError> {
        for &id in reservation_ids {
            self.inventory.consume(id).await.map_err(|e| {
                if e.is_retryable() {
                    StepError::unavailable(e)
                } else {
                    StepError::internal(e)
                }
            })?;
        }

        self.append_in_step(
            ctx.order_id,
            OrderEvent::OrderConfirmed(OrderConfirmedData {
                payment_id: charge.payment_id,
            }),
        )
        .await?;

        self.notifications
            .enqueue(Notification {
                kind: NotificationKind::OrderConfirmed,
                order_id: ctx.order_id,
                correlation_id: ctx.correlation_id.clone(),
                customer_id: ctx.customer_id.clone(),
            })
            .await
            .map_err(StepError::unavailable)?;
        Ok(())
    }

    /// Undoes committed forward effects in reverse step order, then records
    /// the terminal `ORDER_COMPENSATED` transition.
    ///
    /// Outstanding effects are derived from the event log, so compensation
    /// resumed by a replacement worker sees the same truth the dead one did.
    #[tracing::instrument(skip(self, ctx), fields(order_id = %ctx.order_id, correlation_id = %ctx.correlation_id))]
    async fn compensate(
        &self,
        ctx: &StepContext,
        reason: FailureReason,
    ) -> Result<OrderSummary, SagaError> {
        tracing::warn!(%reason, "compensating order");

        let history = self.log.history(ctx.order_id).await?;
        let mut held: Vec<ReservationId> = Vec::new();
        let mut charged: Option<PaymentId> = None;
        let mut refunded = false;
        for record in &history {
            match &record.event {
                OrderEvent::StockReserved(data) => {
                    held.extend(data.reservation_ids.iter().copied());
                }
                OrderEvent::StockReleased(data) => {
                    held.retain(|id| !data.reservation_ids.contains(id));
                }
                OrderEvent::PaymentCharged(data) => charged = Some(data.payment_id),
                OrderEvent::PaymentRefunded(_) => refunded = true,
                _ => {}
            }
        }

        // Payment first (reverse of the forward order), then stock.
        if let Some(payment_id) = charged
            && !refunded
        {
            self.refund_step(ctx, payment_id).await;
        }

        if !held.is_empty()
            && let Err(failure) = self.release_step(ctx, &held).await
        {
            // Release failed non-retryably: an invariant is broken. Record
            // FAILED and escalate instead of pretending compensation worked.
            return self.fail(ctx, failure).await;
        }

        let key = format!("saga:{}:compensated", ctx.order_id);
        let terminal = self
            .run_step(
                "compensated",
                key,
                &self.policies.confirm,
                &CancellationToken::new(),
                || self.compensated_step(ctx, &reason),
            )
            .await;
        if let Err(e) = terminal {
            return Err(SagaError::Internal(format!(
                "failed to record compensation for order {}: {e}",
                ctx.order_id
            )));
        }

        metrics::counter!("saga_compensated").increment(1);
        self.load(ctx.order_id).await
    }

    async fn compensated_step(
        &self,
        ctx: &StepContext,
        reason: &FailureReason,
    ) -> Result<(), StepError> {
        self.append_in_step(
            ctx.order_id,
            OrderEvent::OrderCompensated(FailureData {
                reason: reason.clone(),
            }),
        )
        .await?;

        self.notifications
            .enqueue(Notification {
                kind: NotificationKind::OrderCompensated,
                order_id: ctx.order_id,
                correlation_id: ctx.correlation_id.clone(),
                customer_id: ctx.customer_id.clone(),
            })
            .await
            .map_err(StepError::unavailable)?;
        Ok(())
    }

    /// Refunds a captured payment. Failures are logged and compensation
    /// continues; the payment stays visible as CHARGED for operators.
    async fn refund_step(&self, ctx: &StepContext, payment_id: PaymentId) {
        let key = format!("refund:{payment_id}");
        let result: Result<(), LedgerError<StepError>> = self
            .ledger
            .run(&key, classify, || async {
                let Some(record) = self
                    .payments
                    .get(payment_id)
                    .await
                    .map_err(StepError::unavailable)?
                else {
                    tracing::warn!(%payment_id, "payment record missing, nothing to refund");
                    return Ok(());
                };

                match self
                    .breaker
                    .call(PAYMENT_PROVIDER, || {
                        self.provider.refund(&record.provider_charge_id, &key)
                    })
                    .await
                {
                    Ok(()) => {}
                    Err(BreakerCallError::Open { retry_after, .. }) => {
                        return Err(StepError::CircuitOpen {
                            retry_after_seconds: retry_after.as_secs(),
                        });
                    }
                    Err(BreakerCallError::Inner(e)) => return Err(StepError::unavailable(e)),
                    Err(BreakerCallError::Registry(e)) => return Err(StepError::internal(e)),
                }

                self.payments
                    .mark_refunded(payment_id)
                    .await
                    .map_err(StepError::unavailable)?;
                self.append_in_step(
                    ctx.order_id,
                    OrderEvent::PaymentRefunded(PaymentRefundedData { payment_id }),
                )
                .await?;
                Ok(())
            })
            .await;

        if let Err(e) = result {
            tracing::error!(
                order_id = %ctx.order_id,
                %payment_id,
                error = %e,
                "refund failed during compensation, continuing"
            );
        }
    }

    /// Releases held reservations with effectively unbounded retries.
    ///
    /// Stock held without payment must come back; the reservation TTL is the
    /// final backstop if this worker dies too.
    async fn release_step(
        &self,
        ctx: &StepContext,
        held: &[ReservationId],
    ) -> Result<(), FailureReason> {
        let policy = &self.policies.release;

        for &reservation_id in held {
            let mut attempt: u32 = 0;
            loop {
                match self.inventory.release(reservation_id).await {
                    Ok(()) => break,
                    Err(e) if e.is_retryable() && policy.can_retry(attempt) => {
                        let delay = policy.delay(attempt);
                        tracing::error!(
                            order_id = %ctx.order_id,
                            %reservation_id,
                            attempt,
                            error = %e,
                            "release failed, retrying"
                        );
                        attempt = attempt.saturating_add(1);
                        tokio::time::sleep(delay).await;
                    }
                    Err(e) => {
                        tracing::error!(
                            order_id = %ctx.order_id,
                            %reservation_id,
                            error = %e,
                            "release failed non-retryably"
                        );
                        return Err(FailureReason::Internal {
                            message: format!("release of {reservation_id} failed: {e}"),
                        });
                    }
                }
            }
        }

        if let Err(e) = self
            .append_in_step(
                ctx.order_id,
                OrderEvent::StockReleased(StockReleasedData {
                    reservation_ids: held.to_vec(),
                }),
            )
            .await
        {
            // The stock is back either way; the missing event only costs
            // audit fidelity, not correctness.
            tracing::error!(order_id = %ctx.order_id, error = %e, "failed to record stock release");
        }
        Ok(())
    }

    /// Terminal `FAILED` without compensation.
    async fn fail(&self, ctx: &StepContext, reason: FailureReason) -> Result<OrderSummary, SagaError> {
        metrics::counter!("saga_failed").increment(1);
        tracing::warn!(order_id = %ctx.order_id, %reason, "order failed");
        self.append_transition(
            ctx.order_id,
            OrderEvent::OrderFailed(FailureData { reason }),
        )
        .await?;
        self.load(ctx.order_id).await
    }

    /// Appends a transition outside any step; a terminal order means another
    /// worker already settled it.
    async fn append_transition(&self, order_id: OrderId, event: OrderEvent) -> Result<(), SagaError> {
        match self.log.append(order_id, event).await {
            Ok(_) => Ok(()),
            Err(OrderError::Terminal { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends a transition from inside a ledger-wrapped step, mapping log
    /// failures into step errors. A terminal order or a superseded append is
    /// treated as done: the event landed in a previous incarnation of this
    /// step or another worker owns the order now.
    async fn append_in_step(&self, order_id: OrderId, event: OrderEvent) -> Result<(), StepError> {
        match self.log.append(order_id, event).await {
            Ok(_) => Ok(()),
            Err(OrderError::Terminal { .. }) => Ok(()),
            Err(e) if e.is_retryable() => Err(StepError::unavailable(e)),
            Err(e) => Err(StepError::internal(e)),
        }
    }

    async fn load(&self, order_id: OrderId) -> Result<OrderSummary, SagaError> {
        self.log
            .current(order_id, Consistency::Strong)
            .await?
            .ok_or(SagaError::OrderNotFound(order_id))
    }
}

fn reserve_error(e: InventoryError) -> StepError {
    match e {
        InventoryError::InsufficientStock {
            product_id,
            requested,
            available,
        } => StepError::Failed {
            reason: FailureReason::InsufficientStock {
                product_id,
                requested,
                available,
            },
        },
        InventoryError::UnknownProduct(product_id) => StepError::Failed {
            reason: FailureReason::InsufficientStock {
                product_id,
                requested: 0,
                available: 0,
            },
        },
        e if e.is_retryable() => StepError::unavailable(e),
        e => StepError::internal(e),
    }
}
