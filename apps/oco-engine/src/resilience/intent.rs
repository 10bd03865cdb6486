//! Order intent tracking.
//!
//! Every order is registered here **before** it is dispatched to the
//! connector. If the process dies between dispatch and acknowledgement,
//! the intent survives in the snapshot-independent audit trail and shows
//! up in `pending_verification`, so reconciliation knows an order may
//! exist on the venue that local position state knows nothing about.

use std::collections::{HashMap, VecDeque};
use std::sync::PoisonError;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::domain::{OrderRequest, OrderStatus, OrderUpdate};

/// Lifecycle of a tracked intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IntentStatus {
    /// Created locally, not yet dispatched.
    Pending,
    /// Acknowledged by the exchange.
    Submitted,
    /// Completely executed.
    Filled,
    /// Canceled before completion.
    Canceled,
    /// Dispatch or acceptance failed.
    Failed,
    /// State could not be determined; needs verification.
    Unknown,
}

impl IntentStatus {
    /// Terminal intents move to the audit ring.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::Filled | Self::Canceled | Self::Failed)
    }
}

/// One tracked order intent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderIntent {
    /// Client order id (registration key).
    pub client_order_id: String,
    /// Exchange order id once acknowledged.
    pub exchange_order_id: Option<String>,
    /// Trading symbol.
    pub symbol: String,
    /// The request as dispatched.
    pub request: OrderRequest,
    /// Intent status.
    pub status: IntentStatus,
    /// Executed quantity.
    pub filled_amount: Decimal,
    /// Volume-weighted fill price, when known.
    pub average_price: Option<Decimal>,
    /// When the intent was registered.
    pub created_at: DateTime<Utc>,
    /// When the exchange acknowledged it.
    pub submitted_at: Option<DateTime<Utc>>,
    /// Last mutation time.
    pub updated_at: DateTime<Utc>,
    /// Failure description, when failed.
    pub error: Option<String>,
}

impl OrderIntent {
    fn apply_status(&mut self, status: OrderStatus) {
        self.status = match status {
            OrderStatus::Open => IntentStatus::Submitted,
            OrderStatus::Filled => IntentStatus::Filled,
            OrderStatus::Canceled | OrderStatus::Expired => IntentStatus::Canceled,
            OrderStatus::Rejected => IntentStatus::Failed,
            OrderStatus::Unknown => IntentStatus::Unknown,
        };
    }
}

/// Tracker metrics snapshot.
#[derive(Debug, Clone, Default)]
pub struct IntentMetrics {
    /// Intents currently in flight.
    pub in_flight: usize,
    /// Intents in the completed audit ring.
    pub completed: usize,
    /// Total intents ever registered.
    pub total_tracked: u64,
    /// Total filled.
    pub total_filled: u64,
    /// Total failed.
    pub total_failed: u64,
    /// Total canceled.
    pub total_canceled: u64,
}

#[derive(Debug, Default)]
struct Inner {
    in_flight: HashMap<String, OrderIntent>,
    completed: VecDeque<OrderIntent>,
    total_tracked: u64,
    total_filled: u64,
    total_failed: u64,
    total_canceled: u64,
}

/// In-flight order intent tracker.
#[derive(Debug)]
pub struct IntentTracker {
    inner: RwLock<Inner>,
    max_completed: usize,
    verification_grace: chrono::Duration,
}

impl Default for IntentTracker {
    fn default() -> Self {
        Self::new(1000, chrono::Duration::seconds(30))
    }
}

impl IntentTracker {
    /// Create a tracker with an audit ring bound and a grace period after
    /// which a still-pending intent needs venue verification.
    #[must_use]
    pub fn new(max_completed: usize, verification_grace: chrono::Duration) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            max_completed,
            verification_grace,
        }
    }

    /// Register an intent. Must be called before the order is dispatched.
    pub fn register(&self, client_order_id: impl Into<String>, request: &OrderRequest) -> OrderIntent {
        let client_order_id = client_order_id.into();
        let now = Utc::now();
        let intent = OrderIntent {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            symbol: request.symbol.clone(),
            request: request.clone(),
            status: IntentStatus::Pending,
            filled_amount: Decimal::ZERO,
            average_price: None,
            created_at: now,
            submitted_at: None,
            updated_at: now,
            error: None,
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        inner.in_flight.insert(client_order_id.clone(), intent.clone());
        inner.total_tracked += 1;

        debug!(
            client_order_id = %client_order_id,
            symbol = %request.symbol,
            side = %request.side,
            "order intent registered"
        );
        intent
    }

    /// Mark an intent as acknowledged by the exchange.
    pub fn mark_submitted(&self, client_order_id: &str, exchange_order_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(intent) = inner.in_flight.get_mut(client_order_id) {
            intent.exchange_order_id = Some(exchange_order_id.to_string());
            intent.status = IntentStatus::Submitted;
            intent.submitted_at = Some(Utc::now());
            intent.updated_at = Utc::now();
        } else {
            warn!(client_order_id, "submitted order was never registered");
        }
    }

    /// Mark an intent as failed to dispatch.
    pub fn mark_failed(&self, client_order_id: &str, error: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(intent) = inner.in_flight.get_mut(client_order_id) {
            intent.status = IntentStatus::Failed;
            intent.error = Some(error.to_string());
            intent.updated_at = Utc::now();
        }
        inner.total_failed += 1;
        Self::retire(&mut inner, client_order_id, self.max_completed);
    }

    /// Apply a push update from the connector's event stream.
    pub fn apply_update(&self, update: &OrderUpdate) {
        let Some(client_id) = update.client_order_id.as_deref() else {
            return;
        };
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let Some(intent) = inner.in_flight.get_mut(client_id) else {
            return;
        };

        let old_status = intent.status;
        intent.exchange_order_id = Some(update.order_id.clone());
        intent.filled_amount = update.filled_amount;
        intent.average_price = update.average_price.or(intent.average_price);
        intent.apply_status(update.status);
        intent.updated_at = Utc::now();
        let new_status = intent.status;

        if new_status != old_status {
            debug!(
                client_order_id = %client_id,
                from = ?old_status,
                to = ?new_status,
                "order intent status changed"
            );
        }

        if new_status.is_done() {
            match new_status {
                IntentStatus::Filled => inner.total_filled += 1,
                IntentStatus::Canceled => inner.total_canceled += 1,
                IntentStatus::Failed => inner.total_failed += 1,
                _ => {}
            }
            Self::retire(&mut inner, client_id, self.max_completed);
        }
    }

    /// Look up an in-flight intent.
    #[must_use]
    pub fn get(&self, client_order_id: &str) -> Option<OrderIntent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .get(client_order_id)
            .cloned()
    }

    /// All in-flight intents.
    #[must_use]
    pub fn in_flight(&self) -> Vec<OrderIntent> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .values()
            .cloned()
            .collect()
    }

    /// Intents whose venue state must be verified: `Unknown`, or stuck in
    /// `Pending` past the grace period.
    #[must_use]
    pub fn pending_verification(&self) -> Vec<OrderIntent> {
        let now = Utc::now();
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .in_flight
            .values()
            .filter(|intent| {
                intent.status == IntentStatus::Unknown
                    || (intent.status == IntentStatus::Pending
                        && now - intent.created_at > self.verification_grace)
            })
            .cloned()
            .collect()
    }

    /// Stop tracking an intent regardless of state.
    pub fn stop_tracking(&self, client_order_id: &str) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        Self::retire(&mut inner, client_order_id, self.max_completed);
    }

    /// Metrics snapshot.
    #[must_use]
    pub fn metrics(&self) -> IntentMetrics {
        let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
        IntentMetrics {
            in_flight: inner.in_flight.len(),
            completed: inner.completed.len(),
            total_tracked: inner.total_tracked,
            total_filled: inner.total_filled,
            total_failed: inner.total_failed,
            total_canceled: inner.total_canceled,
        }
    }

    fn retire(inner: &mut Inner, client_order_id: &str, max_completed: usize) {
        if let Some(intent) = inner.in_flight.remove(client_order_id) {
            inner.completed.push_back(intent);
            while inner.completed.len() > max_completed {
                inner.completed.pop_front();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::OrderSide;
    use rust_decimal_macros::dec;

    fn request() -> OrderRequest {
        OrderRequest::market("BTC/USDT", OrderSide::Buy, dec!(0.5))
    }

    fn update(client_id: &str, status: OrderStatus) -> OrderUpdate {
        OrderUpdate {
            order_id: "EX-1".into(),
            client_order_id: Some(client_id.into()),
            symbol: "BTC/USDT".into(),
            status,
            filled_amount: dec!(0.5),
            average_price: Some(dec!(100)),
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn register_before_dispatch_then_fill() {
        let tracker = IntentTracker::default();
        tracker.register("OCO-ENTRY-1", &request());
        assert_eq!(tracker.get("OCO-ENTRY-1").unwrap().status, IntentStatus::Pending);

        tracker.mark_submitted("OCO-ENTRY-1", "EX-1");
        assert_eq!(tracker.get("OCO-ENTRY-1").unwrap().status, IntentStatus::Submitted);

        tracker.apply_update(&update("OCO-ENTRY-1", OrderStatus::Filled));
        assert!(tracker.get("OCO-ENTRY-1").is_none(), "filled intent retires");

        let metrics = tracker.metrics();
        assert_eq!(metrics.total_filled, 1);
        assert_eq!(metrics.in_flight, 0);
        assert_eq!(metrics.completed, 1);
    }

    #[test]
    fn failed_dispatch_is_audited() {
        let tracker = IntentTracker::default();
        tracker.register("OCO-SL-1", &request());
        tracker.mark_failed("OCO-SL-1", "connection reset");

        assert!(tracker.get("OCO-SL-1").is_none());
        assert_eq!(tracker.metrics().total_failed, 1);
    }

    #[test]
    fn stale_pending_intent_needs_verification() {
        let tracker = IntentTracker::new(10, chrono::Duration::zero());
        tracker.register("OCO-TP-1", &request());

        let stale = tracker.pending_verification();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].client_order_id, "OCO-TP-1");
    }

    #[test]
    fn unknown_status_needs_verification() {
        let tracker = IntentTracker::default();
        tracker.register("OCO-TP-2", &request());
        tracker.apply_update(&update("OCO-TP-2", OrderStatus::Unknown));

        let stale = tracker.pending_verification();
        assert_eq!(stale.len(), 1);
        assert_eq!(stale[0].status, IntentStatus::Unknown);
    }

    #[test]
    fn audit_ring_is_bounded() {
        let tracker = IntentTracker::new(2, chrono::Duration::seconds(30));
        for i in 0..5 {
            let id = format!("OCO-ENTRY-{i}");
            tracker.register(&id, &request());
            tracker.apply_update(&update(&id, OrderStatus::Canceled));
        }
        let metrics = tracker.metrics();
        assert_eq!(metrics.completed, 2);
        assert_eq!(metrics.total_canceled, 5);
    }

    #[test]
    fn updates_without_client_id_are_ignored() {
        let tracker = IntentTracker::default();
        tracker.register("OCO-ENTRY-9", &request());
        let mut upd = update("OCO-ENTRY-9", OrderStatus::Filled);
        upd.client_order_id = None;
        tracker.apply_update(&upd);
        assert!(tracker.get("OCO-ENTRY-9").is_some());
    }
}
