//! The inventory engine.

use std::time::Duration;

use chrono::Utc;
use common::{Money, OrderId, ProductId, ReservationId};
use record_store::{AddGuard, Consistency, RecordKey, RecordStore, StoreError};
use serde::{Deserialize, Serialize};

use crate::error::{InventoryError, Result};
use crate::reservation::{Reservation, ReservationState};

const INVENTORY_TABLE: &str = "inventory";
const RESERVATIONS_TABLE: &str = "reservations";
const AVAILABLE_FIELD: &str = "available";

/// Stored shape of an inventory item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InventoryItem {
    pub product_id: ProductId,
    pub available: i64,
    pub unit_price_minor_units: Money,
    pub updated_at: chrono::DateTime<Utc>,
}

/// Atomic stock reservation over the record store.
///
/// Reservations carry a TTL as the final backstop for holds that were never
/// released nor consumed (a crashed compensation past all retries).
#[derive(Clone)]
pub struct InventoryEngine<S> {
    store: S,
    reservation_ttl: Duration,
}

impl<S: RecordStore> InventoryEngine<S> {
    /// Default backstop TTL on reservation records.
    pub const DEFAULT_RESERVATION_TTL: Duration = Duration::from_secs(15 * 60);

    /// Creates an engine with the default reservation TTL.
    pub fn new(store: S) -> Self {
        Self::with_reservation_ttl(store, Self::DEFAULT_RESERVATION_TTL)
    }

    /// Creates an engine with an explicit reservation TTL.
    pub fn with_reservation_ttl(store: S, reservation_ttl: Duration) -> Self {
        Self {
            store,
            reservation_ttl,
        }
    }

    fn item_key(product_id: &ProductId) -> RecordKey {
        RecordKey::new(INVENTORY_TABLE, product_id.as_str())
    }

    fn reservation_key(id: ReservationId) -> RecordKey {
        RecordKey::new(RESERVATIONS_TABLE, id.to_string())
    }

    /// Seeds (or resets) a product's stock level and unit price.
    pub async fn seed(
        &self,
        product_id: ProductId,
        available: i64,
        unit_price_minor_units: Money,
    ) -> Result<()> {
        let key = Self::item_key(&product_id);
        let item = InventoryItem {
            product_id,
            available,
            unit_price_minor_units,
            updated_at: Utc::now(),
        };
        let value = serde_json::to_value(&item)?;

        loop {
            match self.store.put_if_absent(&key, value.clone(), None).await {
                Ok(_) => return Ok(()),
                Err(StoreError::Conflict { .. }) => {
                    let Some(existing) = self.store.get(&key, Consistency::Strong).await? else {
                        continue;
                    };
                    match self
                        .store
                        .compare_and_set(&key, existing.version, value.clone())
                        .await
                    {
                        Ok(_) => return Ok(()),
                        Err(StoreError::VersionMismatch { .. }) => continue,
                        Err(e) => return Err(e.into()),
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Returns the currently available quantity of a product.
    pub async fn available(&self, product_id: &ProductId) -> Result<i64> {
        let stored = self
            .store
            .get(&Self::item_key(product_id), Consistency::Strong)
            .await?
            .ok_or_else(|| InventoryError::UnknownProduct(product_id.clone()))?;
        let item: InventoryItem = stored.decode()?;
        Ok(item.available)
    }

    /// Reserves `quantity` units of one product for an order.
    ///
    /// The decrement is a single guarded write: no two concurrent requests
    /// can both pass the `available >= quantity` check.
    #[tracing::instrument(skip(self))]
    pub async fn reserve(
        &self,
        order_id: OrderId,
        product_id: ProductId,
        quantity: u32,
    ) -> Result<Reservation> {
        let delta = i64::from(quantity);
        match self
            .store
            .add(
                &Self::item_key(&product_id),
                AVAILABLE_FIELD,
                -delta,
                AddGuard::ResultNonNegative,
            )
            .await
        {
            Ok(_) => {}
            Err(StoreError::GuardFailed { observed, .. }) => {
                return Err(InventoryError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available: observed,
                });
            }
            Err(StoreError::NotFound { .. }) => {
                return Err(InventoryError::UnknownProduct(product_id));
            }
            Err(e) => return Err(e.into()),
        }

        let reservation = Reservation::hold(order_id, product_id.clone(), quantity);
        let value = serde_json::to_value(&reservation)?;
        if let Err(e) = self
            .store
            .put_if_absent(
                &Self::reservation_key(reservation.reservation_id),
                value,
                Some(self.reservation_ttl),
            )
            .await
        {
            // The decrement already happened; return the stock before
            // surfacing the failure so a retry starts from a clean slate.
            let _ = self
                .store
                .add(&Self::item_key(&product_id), AVAILABLE_FIELD, delta, AddGuard::None)
                .await;
            return Err(e.into());
        }

        tracing::info!(
            order_id = %reservation.order_id,
            reservation_id = %reservation.reservation_id,
            product_id = %reservation.product_id,
            quantity,
            "stock reserved"
        );
        Ok(reservation)
    }

    /// Reserves every line of an order, or nothing.
    ///
    /// If a later line fails, reservations already made here are released
    /// before the error is returned, so `InsufficientStock` always means
    /// "nothing is held for this order".
    pub async fn reserve_all(
        &self,
        order_id: OrderId,
        lines: &[(ProductId, u32)],
    ) -> Result<Vec<Reservation>> {
        let mut held = Vec::with_capacity(lines.len());
        for (product_id, quantity) in lines {
            match self.reserve(order_id, product_id.clone(), *quantity).await {
                Ok(reservation) => held.push(reservation),
                Err(e) => {
                    for reservation in &held {
                        if let Err(undo) = self.release(reservation.reservation_id).await {
                            tracing::error!(
                                reservation_id = %reservation.reservation_id,
                                error = %undo,
                                "failed to unwind partial reservation"
                            );
                        }
                    }
                    return Err(e);
                }
            }
        }
        Ok(held)
    }

    /// Releases a held reservation, returning its quantity to stock.
    ///
    /// Idempotent: releasing an already-released reservation is a no-op, and
    /// a reservation that no longer exists (TTL backstop) has nothing left
    /// to release.
    #[tracing::instrument(skip(self))]
    pub async fn release(&self, reservation_id: ReservationId) -> Result<()> {
        let key = Self::reservation_key(reservation_id);

        loop {
            let Some(stored) = self.store.get(&key, Consistency::Strong).await? else {
                tracing::warn!(%reservation_id, "reservation missing, nothing to release");
                return Ok(());
            };
            let reservation: Reservation = stored.decode()?;

            match reservation.state {
                ReservationState::Released => return Ok(()),
                ReservationState::Consumed => {
                    return Err(InventoryError::ReleaseAfterConsume(reservation_id));
                }
                ReservationState::Held => {}
            }

            let delta = i64::from(reservation.quantity);
            self.store
                .add(
                    &Self::item_key(&reservation.product_id),
                    AVAILABLE_FIELD,
                    delta,
                    AddGuard::None,
                )
                .await?;

            let mut released = reservation.clone();
            released.state = ReservationState::Released;
            match self
                .store
                .compare_and_set(&key, stored.version, serde_json::to_value(&released)?)
                .await
            {
                Ok(_) => {
                    tracing::info!(
                        order_id = %reservation.order_id,
                        %reservation_id,
                        quantity = reservation.quantity,
                        "stock released"
                    );
                    return Ok(());
                }
                Err(StoreError::VersionMismatch { .. }) => {
                    // A concurrent transition won; take back the increment we
                    // just made and re-examine the record.
                    let _ = self
                        .store
                        .add(
                            &Self::item_key(&reservation.product_id),
                            AVAILABLE_FIELD,
                            -delta,
                            AddGuard::ResultNonNegative,
                        )
                        .await;
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Closes a held reservation without returning stock (order confirmed).
    #[tracing::instrument(skip(self))]
    pub async fn consume(&self, reservation_id: ReservationId) -> Result<()> {
        let key = Self::reservation_key(reservation_id);

        loop {
            let Some(stored) = self.store.get(&key, Consistency::Strong).await? else {
                return Err(InventoryError::ReservationNotFound(reservation_id));
            };
            let reservation: Reservation = stored.decode()?;

            match reservation.state {
                ReservationState::Consumed => return Ok(()),
                ReservationState::Released => {
                    return Err(InventoryError::NotHeld {
                        id: reservation_id,
                        state: reservation.state,
                    });
                }
                ReservationState::Held => {}
            }

            let mut consumed = reservation;
            consumed.state = ReservationState::Consumed;
            match self
                .store
                .compare_and_set(&key, stored.version, serde_json::to_value(&consumed)?)
                .await
            {
                Ok(_) => return Ok(()),
                Err(StoreError::VersionMismatch { .. }) => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Loads a reservation record.
    pub async fn reservation(&self, reservation_id: ReservationId) -> Result<Option<Reservation>> {
        let stored = self
            .store
            .get(&Self::reservation_key(reservation_id), Consistency::Strong)
            .await?;
        Ok(stored.map(|s| s.decode()).transpose()?)
    }
}
