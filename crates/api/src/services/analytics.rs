//! Best-effort purchase tracking.
//!
//! Failures are logged and swallowed: analytics must never fail or roll
//! back an order or a payment.

use std::sync::Arc;

use mercato_core::Order;
use tracing::{debug, warn};

use crate::db::AnalyticsStore;

/// Records purchases and product performance counters.
#[derive(Clone)]
pub struct AnalyticsTracker {
    store: Arc<dyn AnalyticsStore>,
}

impl AnalyticsTracker {
    #[must_use]
    pub fn new(store: Arc<dyn AnalyticsStore>) -> Self {
        Self { store }
    }

    /// Track a completed purchase.
    pub async fn track_purchase(&self, order: &Order) {
        if let Err(e) = self.store.record_purchase(order).await {
            warn!(order_id = %order.id, error = %e, "Failed to record purchase event");
        }
        if let Err(e) = self.store.bump_product_performance(&order.items).await {
            warn!(order_id = %order.id, error = %e, "Failed to update product performance");
        }
        debug!(order_id = %order.id, "Purchase tracked");
    }
}
