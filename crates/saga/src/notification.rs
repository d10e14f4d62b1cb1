//! Notification queue port.
//!
//! Terminal transitions enqueue a message for the external notification
//! sender. Delivery is at-least-once; consumers dedupe on
//! `(order_id, type)`.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use common::{CorrelationId, CustomerId, OrderId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Kind of terminal notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NotificationKind {
    #[serde(rename = "ORDER_CONFIRMED")]
    OrderConfirmed,
    #[serde(rename = "ORDER_COMPENSATED")]
    OrderCompensated,
}

/// Message published to the notification queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    #[serde(rename = "type")]
    pub kind: NotificationKind,
    pub order_id: OrderId,
    pub correlation_id: CorrelationId,
    pub customer_id: CustomerId,
}

/// Queue publish failure (transient).
#[derive(Debug, Error)]
#[error("notification queue unavailable: {0}")]
pub struct NotificationError(pub String);

/// Producer side of the notification queue.
#[async_trait]
pub trait NotificationQueue: Send + Sync {
    /// Enqueues a message. May be called more than once per
    /// `(order_id, type)` under crash-retry.
    async fn enqueue(&self, notification: Notification) -> Result<(), NotificationError>;
}

/// In-memory queue that also applies the consumer-side dedupe contract, so
/// tests observe what the customer would.
#[derive(Clone, Default)]
pub struct InMemoryNotificationQueue {
    delivered: Arc<Mutex<Vec<Notification>>>,
    seen: Arc<Mutex<HashSet<(OrderId, NotificationKind)>>>,
}

impl InMemoryNotificationQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages after consumer-side dedupe, in delivery order.
    pub fn delivered(&self) -> Vec<Notification> {
        self.delivered.lock().unwrap().clone()
    }

    /// Delivered messages for one order.
    pub fn delivered_for(&self, order_id: OrderId) -> Vec<Notification> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.order_id == order_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl NotificationQueue for InMemoryNotificationQueue {
    async fn enqueue(&self, notification: Notification) -> Result<(), NotificationError> {
        let mut seen = self.seen.lock().unwrap();
        if seen.insert((notification.order_id, notification.kind)) {
            self.delivered.lock().unwrap().push(notification);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(order_id: OrderId, kind: NotificationKind) -> Notification {
        Notification {
            kind,
            order_id,
            correlation_id: CorrelationId::generate(),
            customer_id: CustomerId::new("c1"),
        }
    }

    #[tokio::test]
    async fn duplicate_enqueues_deliver_once() {
        let queue = InMemoryNotificationQueue::new();
        let order_id = OrderId::new();

        for _ in 0..3 {
            queue
                .enqueue(notification(order_id, NotificationKind::OrderConfirmed))
                .await
                .unwrap();
        }

        assert_eq!(queue.delivered_for(order_id).len(), 1);
    }

    #[tokio::test]
    async fn different_kinds_are_distinct() {
        let queue = InMemoryNotificationQueue::new();
        let order_id = OrderId::new();

        queue
            .enqueue(notification(order_id, NotificationKind::OrderConfirmed))
            .await
            .unwrap();
        queue
            .enqueue(notification(order_id, NotificationKind::OrderCompensated))
            .await
            .unwrap();

        assert_eq!(queue.delivered_for(order_id).len(), 2);
    }

    #[test]
    fn message_shape_on_the_wire() {
        let n = notification(OrderId::new(), NotificationKind::OrderCompensated);
        let json = serde_json::to_value(&n).unwrap();
        assert_eq!(json["type"], "ORDER_COMPENSATED");
        assert!(json["order_id"].is_string());
        assert!(json["customer_id"].is_string());
        assert!(json["correlation_id"].is_string());
    }
}
