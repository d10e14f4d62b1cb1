//! Payment provider port and payment records.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common::{CustomerId, Money, OrderId, PaymentId};
use record_store::{Consistency, RecordKey, RecordStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

const PAYMENTS_TABLE: &str = "payments";

/// A charge request to the external payment provider.
///
/// `idempotency_key` is stable per `(order, step)` so the provider can
/// deduplicate replays on its side.
#[derive(Debug, Clone)]
pub struct ChargeRequest {
    pub idempotency_key: String,
    pub amount_minor_units: Money,
    pub currency: String,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub correlation_id: String,
}

/// Provider answer to a charge: the provider was reachable and decided.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChargeOutcome {
    Captured { provider_charge_id: String },
    Declined { reason_code: String },
}

/// Provider-level failure: no decision was reached.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    #[error("payment provider transient error")]
    Transient,

    #[error("payment provider timed out")]
    Timeout,
}

/// The external payment provider, modeled as an opaque endpoint.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Attempts to capture a charge.
    async fn charge(&self, request: ChargeRequest) -> Result<ChargeOutcome, ProviderError>;

    /// Reverses a previously captured charge.
    async fn refund(
        &self,
        provider_charge_id: &str,
        idempotency_key: &str,
    ) -> Result<(), ProviderError>;
}

/// Status of a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentStatus {
    #[serde(rename = "CHARGED")]
    Charged,
    #[serde(rename = "REFUNDED")]
    Refunded,
}

/// A captured (or refunded) payment as recorded in the payments partition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub customer_id: CustomerId,
    pub amount_minor_units: Money,
    pub provider_charge_id: String,
    pub status: PaymentStatus,
    pub created_at: DateTime<Utc>,
}

/// Payment record bookkeeping over the record store.
#[derive(Clone)]
pub struct Payments<S> {
    store: S,
}

impl<S: RecordStore> Payments<S> {
    /// Creates payment bookkeeping over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    fn key(payment_id: PaymentId) -> RecordKey {
        RecordKey::new(PAYMENTS_TABLE, payment_id.to_string())
    }

    /// Records a captured charge under a fresh payment ID.
    pub async fn record_charge(
        &self,
        order_id: OrderId,
        customer_id: CustomerId,
        amount_minor_units: Money,
        provider_charge_id: String,
    ) -> Result<PaymentRecord, StoreError> {
        let record = PaymentRecord {
            payment_id: PaymentId::new(),
            order_id,
            customer_id,
            amount_minor_units,
            provider_charge_id,
            status: PaymentStatus::Charged,
            created_at: Utc::now(),
        };
        self.store
            .put_if_absent(
                &Self::key(record.payment_id),
                serde_json::to_value(&record)?,
                None,
            )
            .await?;
        Ok(record)
    }

    /// Marks a payment refunded. Idempotent.
    pub async fn mark_refunded(&self, payment_id: PaymentId) -> Result<(), StoreError> {
        let key = Self::key(payment_id);
        loop {
            let Some(stored) = self.store.get(&key, Consistency::Strong).await? else {
                return Ok(());
            };
            let mut record: PaymentRecord = stored.decode()?;
            if record.status == PaymentStatus::Refunded {
                return Ok(());
            }
            record.status = PaymentStatus::Refunded;
            match self
                .store
                .compare_and_set(&key, stored.version, serde_json::to_value(&record)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Loads a payment record.
    pub async fn get(&self, payment_id: PaymentId) -> Result<Option<PaymentRecord>, StoreError> {
        let stored = self.store.get(&Self::key(payment_id), Consistency::Strong).await?;
        stored.map(|s| s.decode().map_err(StoreError::from)).transpose()
    }
}

#[derive(Default)]
struct ProviderState {
    script: VecDeque<Result<ChargeOutcome, ProviderError>>,
    charges: u32,
    refunds: u32,
}

/// In-memory payment provider with scriptable outcomes.
///
/// Each scripted entry is consumed by one `charge` call; with the script
/// empty every charge captures with a generated provider id. Refunds always
/// succeed.
#[derive(Clone, Default)]
pub struct InMemoryPaymentProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl InMemoryPaymentProvider {
    /// Creates a provider that captures everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues an outcome for the next charge call.
    pub fn push_outcome(&self, outcome: Result<ChargeOutcome, ProviderError>) {
        self.state.lock().unwrap().script.push_back(outcome);
    }

    /// Queues `n` transient failures.
    pub fn push_transient_errors(&self, n: u32) {
        for _ in 0..n {
            self.push_outcome(Err(ProviderError::Transient));
        }
    }

    /// Queues a decline with the given reason code.
    pub fn push_decline(&self, reason_code: &str) {
        self.push_outcome(Ok(ChargeOutcome::Declined {
            reason_code: reason_code.to_string(),
        }));
    }

    /// Number of charge calls that reached the provider.
    pub fn charge_count(&self) -> u32 {
        self.state.lock().unwrap().charges
    }

    /// Number of refund calls that reached the provider.
    pub fn refund_count(&self) -> u32 {
        self.state.lock().unwrap().refunds
    }
}

#[async_trait]
impl PaymentProvider for InMemoryPaymentProvider {
    async fn charge(&self, _request: ChargeRequest) -> Result<ChargeOutcome, ProviderError> {
        let mut state = self.state.lock().unwrap();
        state.charges += 1;
        state.script.pop_front().unwrap_or_else(|| {
            Ok(ChargeOutcome::Captured {
                provider_charge_id: format!("ch_{}", Uuid::new_v4().simple()),
            })
        })
    }

    async fn refund(
        &self,
        _provider_charge_id: &str,
        _idempotency_key: &str,
    ) -> Result<(), ProviderError> {
        self.state.lock().unwrap().refunds += 1;
        Ok(())
    }
}
