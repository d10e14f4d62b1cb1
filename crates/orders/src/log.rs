//! The per-order event log.
//!
//! Every state transition is two linked writes with no cross-record
//! transaction:
//!
//! 1. append the event at `seq = summary.version + 1` with `put_if_absent`
//!    on `(order_id, seq)`;
//! 2. `compare_and_set` the summary from `version = seq - 1` to `seq`.
//!
//! A writer that loses step 1 re-reads and retries (after completing a dead
//! writer's step 2 if one is pending). A writer that loses step 2 treats its
//! append as informational and returns the summary that won, so callers can
//! decide whether to keep driving the order.

use common::OrderId;
use record_store::{Consistency, RecordKey, RecordStore, StoreError, StoredRecord};

use crate::error::{OrderError, Result};
use crate::event::{OrderEvent, OrderEventRecord};
use crate::request::SubmitOrder;
use crate::summary::OrderSummary;

const TABLE: &str = "orders";
const META: &str = "META";

fn meta_key(order_id: OrderId) -> RecordKey {
    RecordKey::with_sort(TABLE, order_id.to_string(), META)
}

fn event_key(order_id: OrderId, seq: u64) -> RecordKey {
    RecordKey::with_sort(TABLE, order_id.to_string(), event_sort_key(seq))
}

// Zero-padded so lexicographic sort-key order is numeric seq order.
fn event_sort_key(seq: u64) -> String {
    format!("EVENT#{seq:08}")
}

/// Outcome of an append.
#[derive(Debug)]
pub enum AppendOutcome {
    /// Both writes landed; the summary now reflects the appended event.
    Applied(OrderSummary),

    /// The event was appended but another writer won the summary update.
    /// The contained summary is the state that won.
    Superseded(OrderSummary),
}

impl AppendOutcome {
    /// The summary after the append, whoever won it.
    pub fn summary(&self) -> &OrderSummary {
        match self {
            AppendOutcome::Applied(s) | AppendOutcome::Superseded(s) => s,
        }
    }
}

/// Authoritative per-order history plus its denormalized summary cache.
#[derive(Clone)]
pub struct OrderLog<S> {
    store: S,
}

impl<S: RecordStore> OrderLog<S> {
    /// Creates a log over the given store.
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Durably creates an order: `ORDER_CREATED` at seq 1 plus the PENDING
    /// summary.
    ///
    /// Exactly one of any number of concurrent submissions with the same
    /// `order_id` wins; the rest get `AlreadyExists` and should read the
    /// winner's record. A crash between the two writes is healed here on the
    /// next attempt.
    #[tracing::instrument(skip(self, cmd), fields(order_id = %cmd.order_id, correlation_id = %cmd.correlation_id))]
    pub async fn create(&self, cmd: &SubmitOrder) -> Result<OrderSummary> {
        let order_id = cmd.order_id;
        let created = OrderEvent::OrderCreated(crate::event::OrderCreatedData {
            customer_id: cmd.customer_id.clone(),
            items: cmd.items.clone(),
            total_minor_units: cmd.total_minor_units,
            correlation_id: cmd.correlation_id.clone(),
        });
        let record = OrderEventRecord::new(1, created);

        match self
            .store
            .put_if_absent(&event_key(order_id, 1), serde_json::to_value(&record)?, None)
            .await
        {
            Ok(_) => {}
            Err(StoreError::Conflict { .. }) => {
                // Someone already created this order. If its summary exists
                // we lost a duplicate-submit race; if not, a previous attempt
                // died between the two writes and we finish the job below.
                if self.current(order_id, Consistency::Strong).await?.is_some() {
                    return Err(OrderError::AlreadyExists(order_id));
                }
            }
            Err(e) => return Err(e.into()),
        }

        let summary = OrderSummary::pending(cmd);
        match self
            .store
            .put_if_absent(&meta_key(order_id), serde_json::to_value(&summary)?, None)
            .await
        {
            Ok(_) => {
                tracing::info!(status = %summary.status, "order created");
                Ok(summary)
            }
            Err(StoreError::Conflict { .. }) => Err(OrderError::AlreadyExists(order_id)),
            Err(e) => Err(e.into()),
        }
    }

    /// Appends an event and advances the summary in lockstep.
    #[tracing::instrument(skip(self, event), fields(event_type = event.event_type()))]
    pub async fn append(&self, order_id: OrderId, event: OrderEvent) -> Result<AppendOutcome> {
        loop {
            let (summary, stored_version) = self.load_summary(order_id).await?;

            if summary.status.is_terminal() {
                return Err(OrderError::Terminal {
                    order_id,
                    status: summary.status,
                });
            }

            let seq = summary.version + 1;
            let record = OrderEventRecord::new(seq, event.clone());

            match self
                .store
                .put_if_absent(&event_key(order_id, seq), serde_json::to_value(&record)?, None)
                .await
            {
                Ok(_) => {}
                Err(StoreError::Conflict { .. }) => {
                    // Another writer owns this seq. Its summary update may
                    // still be pending (crashed mid-protocol); complete it so
                    // the log cannot wedge, then retry with a fresh read.
                    self.heal_summary(order_id, seq, &summary, stored_version)
                        .await?;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            let mut next = summary.clone();
            next.version = seq;
            next.status = event.status();
            if let Some(reason) = event.failure() {
                next.failure = Some(reason.clone());
            }

            match self
                .store
                .compare_and_set(&meta_key(order_id), stored_version, serde_json::to_value(&next)?)
                .await
            {
                Ok(_) => {
                    tracing::info!(order_id = %order_id, seq, status = %next.status, "order transition");
                    return Ok(AppendOutcome::Applied(next));
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    // Lost the summary race: our event stands as history, the
                    // winner's summary is authoritative.
                    let (current, _) = self.load_summary(order_id).await?;
                    tracing::warn!(
                        order_id = %order_id,
                        seq,
                        current_status = %current.status,
                        "append superseded by concurrent transition"
                    );
                    return Ok(AppendOutcome::Superseded(current));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Completes a dead writer's pending summary update for `seq`, if any.
    async fn heal_summary(
        &self,
        order_id: OrderId,
        seq: u64,
        summary: &OrderSummary,
        stored_version: record_store::Version,
    ) -> Result<()> {
        let Some(stored) = self
            .store
            .get(&event_key(order_id, seq), Consistency::Strong)
            .await?
        else {
            return Ok(());
        };
        let pending: OrderEventRecord = stored.decode()?;

        let mut healed = summary.clone();
        healed.version = seq;
        healed.status = pending.event.status();
        if let Some(reason) = pending.event.failure() {
            healed.failure = Some(reason.clone());
        }

        match self
            .store
            .compare_and_set(&meta_key(order_id), stored_version, serde_json::to_value(&healed)?)
            .await
        {
            Ok(_) => {
                tracing::warn!(order_id = %order_id, seq, "completed interrupted summary update");
                Ok(())
            }
            // The original writer (or another healer) got there first.
            Err(StoreError::VersionMismatch { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Returns the order's current summary.
    pub async fn current(
        &self,
        order_id: OrderId,
        consistency: Consistency,
    ) -> Result<Option<OrderSummary>> {
        let stored = self.store.get(&meta_key(order_id), consistency).await?;
        Ok(stored.as_ref().map(decode_summary).transpose()?)
    }

    /// Returns the complete event sequence of an order, in `seq` order.
    pub async fn history(&self, order_id: OrderId) -> Result<Vec<OrderEventRecord>> {
        let stored = self
            .store
            .list(TABLE, &order_id.to_string(), "EVENT#")
            .await?;
        stored
            .iter()
            .map(|r| r.decode::<OrderEventRecord>().map_err(OrderError::from))
            .collect()
    }

    async fn load_summary(&self, order_id: OrderId) -> Result<(OrderSummary, record_store::Version)> {
        let stored = self
            .store
            .get(&meta_key(order_id), Consistency::Strong)
            .await?
            .ok_or(OrderError::NotFound(order_id))?;
        Ok((decode_summary(&stored)?, stored.version))
    }
}

fn decode_summary(stored: &StoredRecord) -> std::result::Result<OrderSummary, serde_json::Error> {
    stored.decode()
}
