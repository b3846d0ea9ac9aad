//! Order lifecycle coordinator.
//!
//! Takes a cart through order placement, gateway authorization and capture,
//! applies webhook and admin status changes, and fires the side effects
//! (cart clear, notifications, analytics) that go with them.
//!
//! ```text
//! place_order ──> placed/pending ──(cod)──> done
//!                     │
//!                 (gateway) create_authorization ──> external id attached
//!                     │
//!                 capture_payment / webhook ──> payment completed
//! ```
//!
//! # Idempotency
//!
//! Capture can race a duplicate client retry or the provider's webhook.
//! There is no lock: every payment change is a conditional update from the
//! event's source status, and only the caller whose update matched runs the
//! side effects. Everyone else sees the completed order and returns it.

use std::collections::HashSet;
use std::sync::Arc;

use mercato_core::{
    CurrencyCode, LineItem, NewOrder, Order, OrderId, OrderStatus, PaymentEvent, PaymentMethod,
    PaymentStatus, ProductId, ShippingAddress, TransitionError,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, instrument, warn};

use super::analytics::AnalyticsTracker;
use super::notify::{Audience, Notifier, ServerEvent};
use crate::db::{RepositoryError, Stores};
use crate::gateway::webhook::{WebhookEvent, WebhookEventKind};
use crate::gateway::{
    AmountBreakdown, ApprovalLink, AuthorizationRequest, GatewayError, PaymentGateway,
    PaymentState, ReturnUrls,
};
use crate::models::SessionUser;

/// Order statuses a customer may still cancel from.
const CUSTOMER_CANCELLABLE: [OrderStatus; 2] = [OrderStatus::Placed, OrderStatus::Packing];

/// Caller-facing lifecycle errors.
///
/// Gateway failures carry user-facing messages only; provider details are
/// logged where the error is translated.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Malformed or missing input.
    #[error("{0}")]
    Validation(String),

    /// The caller may not act on this order.
    #[error("{0}")]
    Auth(String),

    /// No such order (for this caller).
    #[error("order not found")]
    NotFound,

    /// The status change is not allowed.
    #[error("{0}")]
    InvalidTransition(#[from] TransitionError),

    /// Another request changed the order first.
    #[error("{0}")]
    Conflict(String),

    /// Transient gateway failure. Safe to retry.
    #[error("online payment is temporarily unavailable, please try again or pay with cash on delivery")]
    GatewayUnavailable,

    /// Permanent gateway rejection. Retrying will not help.
    #[error("online payment could not be used for this order, please pay with cash on delivery")]
    GatewayRejected,

    /// The gateway answered the capture with a non-completed status.
    #[error("payment was not completed ({0}), please try again or pay with cash on delivery")]
    CaptureNotCompleted(String),

    /// The order could not be read or written.
    #[error("persistence error: {0}")]
    Persistence(#[source] RepositoryError),
}

impl From<RepositoryError> for LifecycleError {
    fn from(e: RepositoryError) -> Self {
        match e {
            RepositoryError::NotFound => Self::NotFound,
            RepositoryError::Validation(e) => Self::Validation(e.to_string()),
            RepositoryError::InvalidTransition(e) => Self::InvalidTransition(e),
            RepositoryError::Conflict(message) => Self::Conflict(message),
            RepositoryError::Database(_) | RepositoryError::DataCorruption(_) => {
                Self::Persistence(e)
            }
        }
    }
}

impl From<GatewayError> for LifecycleError {
    fn from(e: GatewayError) -> Self {
        match e {
            GatewayError::Unavailable(_) | GatewayError::Decode(_) => Self::GatewayUnavailable,
            GatewayError::Rejected { .. } => Self::GatewayRejected,
            GatewayError::Validation(message) => Self::Validation(message),
            GatewayError::NotFound => Self::NotFound,
            GatewayError::AlreadyCaptured => {
                Self::Conflict("payment has already been captured".to_string())
            }
        }
    }
}

// =============================================================================
// Inputs and outputs
// =============================================================================

/// A requested line: product and quantity. Names and prices come from the
/// catalog, never from the client.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderItemInput {
    pub product_id: ProductId,
    pub quantity: u32,
    #[serde(default, alias = "color")]
    pub variant: Option<String>,
}

/// Checkout request.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceOrder {
    pub items: Vec<OrderItemInput>,
    #[serde(alias = "address")]
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
}

/// Result of placing an order.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacedOrder {
    pub order: Order,
    /// Provider approval links (gateway orders only).
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub approval_links: Vec<ApprovalLink>,
}

/// Result of `create_payment`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentSession {
    pub order_id: OrderId,
    pub external_order_id: String,
    pub approval_links: Vec<ApprovalLink>,
}

/// Whether a payment event changed the order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Applied {
    /// This call moved the payment status and ran the side effects.
    Changed(Order),
    /// The order already held the target status; nothing was done.
    Unchanged(Order),
}

impl Applied {
    #[must_use]
    pub const fn order(&self) -> &Order {
        match self {
            Self::Changed(order) | Self::Unchanged(order) => order,
        }
    }

    #[must_use]
    pub fn into_order(self) -> Order {
        match self {
            Self::Changed(order) | Self::Unchanged(order) => order,
        }
    }

    #[must_use]
    pub const fn changed(&self) -> bool {
        matches!(self, Self::Changed(_))
    }
}

/// What a webhook did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookOutcome {
    Applied(Applied),
    /// Event type not handled.
    Ignored,
    /// No order carries the referenced provider id.
    UnknownOrder,
    /// The provider did not confirm the event's claim.
    Unconfirmed,
}

/// Deployment-wide checkout settings.
#[derive(Debug, Clone)]
pub struct CheckoutSettings {
    pub currency: CurrencyCode,
    pub return_urls: ReturnUrls,
}

// =============================================================================
// Coordinator
// =============================================================================

/// Orchestrates the order and payment state machine.
pub struct OrderCoordinator {
    stores: Stores,
    gateway: Arc<dyn PaymentGateway>,
    notifier: Arc<Notifier>,
    analytics: AnalyticsTracker,
    settings: CheckoutSettings,
}

impl OrderCoordinator {
    #[must_use]
    pub fn new(
        stores: Stores,
        gateway: Arc<dyn PaymentGateway>,
        notifier: Arc<Notifier>,
        settings: CheckoutSettings,
    ) -> Self {
        let analytics = AnalyticsTracker::new(stores.analytics.clone());
        Self {
            stores,
            gateway,
            notifier,
            analytics,
            settings,
        }
    }

    /// Place an order.
    ///
    /// Prices are taken from the catalog and the order is persisted before
    /// the gateway is contacted, so a crash in between leaves a recoverable
    /// pending order. Cash-on-delivery orders are complete after this call.
    ///
    /// # Errors
    ///
    /// `Validation` for bad input, `Persistence` if the order cannot be
    /// stored, and the gateway errors for gateway orders (in which case the
    /// stored order stays pending without an external id).
    #[instrument(skip(self, user, request), fields(user_id = %user.id, method = %request.payment_method))]
    pub async fn place_order(
        &self,
        user: &SessionUser,
        request: PlaceOrder,
    ) -> Result<PlacedOrder, LifecycleError> {
        let items = self.price_items(&request.items).await?;
        let new_order = NewOrder::priced(
            user.id,
            items,
            request.shipping_address,
            request.payment_method,
            self.settings.currency,
        );
        let order = self.stores.orders.create(new_order).await?;
        info!(order_id = %order.id, total = %order.total, "Order placed");

        match order.payment_method {
            PaymentMethod::Cod => {
                self.clear_cart(&order).await;
                self.notifier
                    .notify_admins(&ServerEvent::NewOrder(order.clone()));
                self.analytics.track_purchase(&order).await;
                Ok(PlacedOrder {
                    order,
                    approval_links: Vec::new(),
                })
            }
            PaymentMethod::Gateway => self.authorize(order).await,
        }
    }

    /// Place a gateway order and return what the client needs to send the
    /// customer to the provider.
    ///
    /// # Errors
    ///
    /// Same as [`OrderCoordinator::place_order`].
    pub async fn create_payment(
        &self,
        user: &SessionUser,
        items: Vec<OrderItemInput>,
        shipping_address: ShippingAddress,
    ) -> Result<PaymentSession, LifecycleError> {
        let placed = self
            .place_order(
                user,
                PlaceOrder {
                    items,
                    shipping_address,
                    payment_method: PaymentMethod::Gateway,
                },
            )
            .await?;

        let external_order_id = placed.order.external_order_id.clone().ok_or_else(|| {
            LifecycleError::Conflict("order has no gateway authorization".to_string())
        })?;
        Ok(PaymentSession {
            order_id: placed.order.id,
            external_order_id,
            approval_links: placed.approval_links,
        })
    }

    /// Capture a customer's approved payment.
    ///
    /// Safe to call more than once: an already completed order is returned
    /// as is, without calling the gateway or repeating side effects.
    ///
    /// # Errors
    ///
    /// `NotFound` if the external id does not belong to this user,
    /// `Conflict` if the order was cancelled or soft-deleted,
    /// `CaptureNotCompleted` if the provider did not complete the capture
    /// (the order is left untouched), and the gateway errors.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn capture_payment(
        &self,
        user: &SessionUser,
        external_order_id: &str,
    ) -> Result<Order, LifecycleError> {
        let order = self
            .stores
            .orders
            .find_by_external_payment_id(external_order_id)
            .await?
            .filter(|order| order.user_id == user.id)
            .ok_or(LifecycleError::NotFound)?;

        if order.payment_status == PaymentStatus::Completed {
            info!(order_id = %order.id, "Payment already captured");
            return Ok(order);
        }
        if !order.is_active || order.order_status == OrderStatus::Cancelled {
            warn!(order_id = %order.id, "Capture refused for cancelled or removed order");
            return Err(LifecycleError::Conflict(
                "order is no longer active, its payment cannot be captured".to_string(),
            ));
        }
        if order.payment_status != PaymentStatus::Pending {
            return Err(TransitionError::IllegalPayment {
                from: order.payment_status,
                to: PaymentStatus::Completed,
            }
            .into());
        }

        let capture_id = match self.gateway.capture_authorization(external_order_id).await {
            Ok(result) => match result.completed_capture_id() {
                Some(capture_id) => capture_id.to_string(),
                None => {
                    warn!(
                        order_id = %order.id,
                        provider_status = %result.provider_status,
                        "Capture not completed"
                    );
                    return Err(LifecycleError::CaptureNotCompleted(
                        result.provider_status.to_lowercase(),
                    ));
                }
            },
            // A concurrent request or an earlier attempt already captured;
            // ask the provider for the capture id.
            Err(GatewayError::AlreadyCaptured) => {
                match self.query_gateway(&order, external_order_id).await? {
                    PaymentState::Captured { capture_id } => capture_id,
                    other => {
                        return Err(LifecycleError::CaptureNotCompleted(other.to_string()));
                    }
                }
            }
            Err(e) => return Err(gateway_failure(&order, e)),
        };

        let applied = self
            .apply_payment_event(order, PaymentEvent::CaptureCompleted, Some(&capture_id))
            .await?;
        Ok(applied.into_order())
    }

    /// Apply a verified provider webhook.
    ///
    /// Capture-completed claims are confirmed with the provider before they
    /// are trusted. Events for already applied states are no-ops.
    ///
    /// # Errors
    ///
    /// Persistence and gateway errors. Illegal transitions (for example a
    /// denial for an already completed payment) are logged and reported as
    /// `Unconfirmed`.
    #[instrument(skip(self, event), fields(event_id = %event.id))]
    pub async fn apply_webhook(
        &self,
        event: WebhookEvent,
    ) -> Result<WebhookOutcome, LifecycleError> {
        let (order, payment_event, capture_id) = match event.kind {
            WebhookEventKind::Ignored { event_type } => {
                info!(%event_type, "Ignoring webhook event");
                return Ok(WebhookOutcome::Ignored);
            }
            WebhookEventKind::CaptureCompleted {
                external_order_id, ..
            } => {
                let Some(order) = self
                    .stores
                    .orders
                    .find_by_external_payment_id(&external_order_id)
                    .await?
                else {
                    warn!(%external_order_id, "Webhook for unknown order");
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                if order.payment_status == PaymentStatus::Completed {
                    return Ok(WebhookOutcome::Applied(Applied::Unchanged(order)));
                }
                match self.query_gateway(&order, &external_order_id).await? {
                    PaymentState::Captured { capture_id } => {
                        (order, PaymentEvent::CaptureCompleted, Some(capture_id))
                    }
                    state => {
                        warn!(order_id = %order.id, ?state, "Capture webhook not confirmed by gateway");
                        return Ok(WebhookOutcome::Unconfirmed);
                    }
                }
            }
            WebhookEventKind::CaptureDenied {
                external_order_id, ..
            } => {
                let Some(order) = self
                    .stores
                    .orders
                    .find_by_external_payment_id(&external_order_id)
                    .await?
                else {
                    warn!(%external_order_id, "Webhook for unknown order");
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                (order, PaymentEvent::CaptureDenied, None)
            }
            WebhookEventKind::CaptureRefunded { capture_id } => {
                let Some(order) = self
                    .stores
                    .orders
                    .find_by_external_capture_id(&capture_id)
                    .await?
                else {
                    warn!(%capture_id, "Refund webhook for unknown capture");
                    return Ok(WebhookOutcome::UnknownOrder);
                };
                (order, PaymentEvent::Refunded, None)
            }
        };

        match self
            .apply_payment_event(order, payment_event, capture_id.as_deref())
            .await
        {
            Ok(applied) => Ok(WebhookOutcome::Applied(applied)),
            Err(LifecycleError::InvalidTransition(e)) => {
                warn!(error = %e, "Webhook event does not apply to current payment status");
                Ok(WebhookOutcome::Unconfirmed)
            }
            Err(e) => Err(e),
        }
    }

    /// Bring one gateway order in line with the provider's view of it.
    ///
    /// # Errors
    ///
    /// `NotFound` for an unknown external id, `InvalidTransition` if the
    /// provider state cannot be reached from the stored one, and gateway or
    /// persistence errors.
    #[instrument(skip(self))]
    pub async fn reconcile(&self, external_order_id: &str) -> Result<Applied, LifecycleError> {
        let order = self
            .stores
            .orders
            .find_by_external_payment_id(external_order_id)
            .await?
            .ok_or(LifecycleError::NotFound)?;

        let state = self.query_gateway(&order, external_order_id).await?;
        let Some(event) = state.event() else {
            return Ok(Applied::Unchanged(order));
        };
        let capture_id = match event {
            PaymentEvent::CaptureCompleted => state.capture_id().map(String::from),
            PaymentEvent::CaptureDenied | PaymentEvent::Refunded => None,
        };
        self.apply_payment_event(order, event, capture_id.as_deref())
            .await
    }

    /// Reconcile up to `limit` pending gateway orders, oldest first.
    ///
    /// # Errors
    ///
    /// Returns an error only if the pending orders cannot be listed;
    /// per-order failures are returned alongside each order id.
    pub async fn reconcile_pending(
        &self,
        limit: u32,
    ) -> Result<Vec<(OrderId, Result<Applied, LifecycleError>)>, LifecycleError> {
        let pending = self.stores.orders.list_pending_gateway(limit).await?;
        let mut results = Vec::with_capacity(pending.len());
        for order in pending {
            let Some(external_order_id) = order.external_order_id.as_deref() else {
                continue;
            };
            results.push((order.id, self.reconcile(external_order_id).await));
        }
        Ok(results)
    }

    /// Admin order status change.
    ///
    /// # Errors
    ///
    /// `InvalidTransition` with the specific reason, `NotFound`, `Conflict`.
    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: OrderId,
        status: OrderStatus,
    ) -> Result<Order, LifecycleError> {
        let order = self.stores.orders.update_status(order_id, status).await?;
        info!(order_id = %order.id, %status, "Order status updated");

        let event = if status.is_shipping_milestone() {
            ServerEvent::ShippingUpdate(order.clone())
        } else {
            ServerEvent::OrderUpdated(order.clone())
        };
        self.notifier.publish(&event, Audience::everyone_for(&order));
        Ok(order)
    }

    /// Admin payment status change (cash received, refund recorded).
    ///
    /// # Errors
    ///
    /// `InvalidTransition` with the specific reason, `NotFound`, `Conflict`.
    #[instrument(skip(self))]
    pub async fn update_payment_status(
        &self,
        order_id: OrderId,
        status: PaymentStatus,
    ) -> Result<Order, LifecycleError> {
        let order = self
            .stores
            .orders
            .update_payment_status(order_id, status)
            .await?;
        info!(order_id = %order.id, %status, "Payment status updated");

        self.notifier.publish(
            &ServerEvent::PaymentUpdate(order.clone()),
            Audience::everyone_for(&order),
        );
        Ok(order)
    }

    /// Cancel an order. Customers may cancel their own orders until they
    /// ship; admins may cancel any order that is not finished.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Auth` for a customer cancelling a shipped order,
    /// `InvalidTransition` for finished orders.
    #[instrument(skip(self, user), fields(user_id = %user.id))]
    pub async fn cancel_order(
        &self,
        user: &SessionUser,
        order_id: OrderId,
    ) -> Result<Order, LifecycleError> {
        let order = self.order_for(user, order_id).await?;
        if !user.is_admin() && !CUSTOMER_CANCELLABLE.contains(&order.order_status) {
            return Err(LifecycleError::Auth(format!(
                "orders can only be cancelled before they ship (currently {})",
                order.order_status
            )));
        }
        self.update_order_status(order.id, OrderStatus::Cancelled)
            .await
    }

    /// Soft-delete an order (admin). The row is kept for audit.
    ///
    /// # Errors
    ///
    /// `NotFound`, `Persistence`.
    #[instrument(skip(self))]
    pub async fn soft_delete(&self, order_id: OrderId) -> Result<Order, LifecycleError> {
        let order = self.stores.orders.soft_delete(order_id).await?;
        info!(order_id = %order.id, "Order soft-deleted");
        Ok(order)
    }

    /// An order as visible to this user: their own active orders, or any
    /// order for admins.
    ///
    /// # Errors
    ///
    /// `NotFound` if the order does not exist or is not visible.
    pub async fn order_for(
        &self,
        user: &SessionUser,
        order_id: OrderId,
    ) -> Result<Order, LifecycleError> {
        self.stores
            .orders
            .find_by_id(order_id)
            .await?
            .filter(|order| user.is_admin() || (order.user_id == user.id && order.is_active))
            .ok_or(LifecycleError::NotFound)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Snapshot names and prices from the catalog.
    async fn price_items(
        &self,
        requested: &[OrderItemInput],
    ) -> Result<Vec<LineItem>, LifecycleError> {
        if requested.is_empty() {
            return Err(LifecycleError::Validation(
                "order must contain at least one item".to_string(),
            ));
        }

        let ids: Vec<ProductId> = requested
            .iter()
            .map(|item| item.product_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let products = self.stores.catalog.products_by_ids(&ids).await?;

        requested
            .iter()
            .map(|item| {
                let product = products
                    .iter()
                    .find(|p| p.id == item.product_id && p.is_active)
                    .ok_or_else(|| {
                        LifecycleError::Validation(format!(
                            "product {} is not available",
                            item.product_id
                        ))
                    })?;
                Ok(LineItem {
                    product_id: product.id,
                    name: product.name.clone(),
                    unit_price: product.price,
                    quantity: item.quantity,
                    variant: item.variant.clone().filter(|v| !v.trim().is_empty()),
                })
            })
            .collect()
    }

    /// Create the provider order for a stored gateway order.
    async fn authorize(&self, order: Order) -> Result<PlacedOrder, LifecycleError> {
        let request = AuthorizationRequest {
            reference: order.id,
            amount: AmountBreakdown::new(order.totals(), order.currency),
            shipping_address: order.shipping_address.clone(),
            return_urls: self.settings.return_urls.clone(),
        };

        let authorization = match self.gateway.create_authorization(&request).await {
            Ok(authorization) => authorization,
            Err(e) => return Err(gateway_failure(&order, e)),
        };

        let order = self
            .stores
            .orders
            .attach_external_order_id(order.id, &authorization.external_order_id)
            .await?;
        info!(
            order_id = %order.id,
            external_order_id = %authorization.external_order_id,
            "Gateway authorization created"
        );

        Ok(PlacedOrder {
            order,
            approval_links: authorization.approval_links,
        })
    }

    async fn query_gateway(
        &self,
        order: &Order,
        external_order_id: &str,
    ) -> Result<PaymentState, LifecycleError> {
        self.gateway
            .query_authorization(external_order_id)
            .await
            .map_err(|e| gateway_failure(order, e))
    }

    /// Apply a payment event with a conditional update. Side effects run
    /// only if this call's update matched.
    async fn apply_payment_event(
        &self,
        order: Order,
        event: PaymentEvent,
        capture_id: Option<&str>,
    ) -> Result<Applied, LifecycleError> {
        let target = event.target();
        if order.payment_status == target {
            return Ok(Applied::Unchanged(order));
        }
        if order.payment_status != event.source() {
            return Err(TransitionError::IllegalPayment {
                from: order.payment_status,
                to: target,
            }
            .into());
        }

        let updated = self
            .stores
            .orders
            .compare_and_set_payment_status(order.id, event.source(), target, capture_id)
            .await?;

        let Some(updated) = updated else {
            // Lost the race: someone else moved the payment first.
            let current = self
                .stores
                .orders
                .find_by_id(order.id)
                .await?
                .ok_or(LifecycleError::NotFound)?;
            if current.payment_status == target {
                info!(order_id = %current.id, %target, "Payment event already applied");
                return Ok(Applied::Unchanged(current));
            }
            return Err(TransitionError::IllegalPayment {
                from: current.payment_status,
                to: target,
            }
            .into());
        };

        info!(order_id = %updated.id, %target, "Payment status changed");
        match event {
            PaymentEvent::CaptureCompleted => {
                self.clear_cart(&updated).await;
                self.notifier.publish(
                    &ServerEvent::PaymentUpdate(updated.clone()),
                    Audience::owner_and_room(&updated),
                );
                self.notifier
                    .notify_admins(&ServerEvent::NewOrder(updated.clone()));
                self.analytics.track_purchase(&updated).await;
            }
            PaymentEvent::CaptureDenied | PaymentEvent::Refunded => {
                self.notifier.publish(
                    &ServerEvent::PaymentUpdate(updated.clone()),
                    Audience::everyone_for(&updated),
                );
            }
        }
        Ok(Applied::Changed(updated))
    }

    async fn clear_cart(&self, order: &Order) {
        if let Err(e) = self.stores.carts.clear_cart(order.user_id).await {
            warn!(order_id = %order.id, user_id = %order.user_id, error = %e, "Failed to clear cart");
        }
    }
}

/// Log a gateway failure with its provider details and translate it.
fn gateway_failure(order: &Order, e: GatewayError) -> LifecycleError {
    match &e {
        GatewayError::Rejected { issue, message } => {
            warn!(order_id = %order.id, %issue, %message, "Gateway rejected request");
        }
        other => warn!(order_id = %order.id, error = %other, "Gateway request failed"),
    }
    e.into()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use mercato_core::{Cart, Email, Money, Role};
    use rust_decimal_macros::dec;

    use super::*;
    use crate::db::{CartStore, MemoryStore, OrderStore};
    use crate::gateway::{Authorization, CaptureResult, CaptureStatus};
    use crate::models::Product;

    /// Gateway with scripted answers and call counters.
    #[derive(Default)]
    struct ScriptedGateway {
        create: Mutex<Option<GatewayError>>,
        capture_error: Mutex<Option<GatewayError>>,
        capture_status: Mutex<Option<&'static str>>,
        state: Mutex<Option<PaymentState>>,
        creates: AtomicUsize,
        captures: AtomicUsize,
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        async fn create_authorization(
            &self,
            request: &AuthorizationRequest,
        ) -> Result<Authorization, GatewayError> {
            request.amount.validate()?;
            self.creates.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.create.lock().unwrap().take() {
                return Err(e);
            }
            Ok(Authorization {
                external_order_id: format!("EXT-{}", request.reference),
                approval_links: vec![ApprovalLink {
                    rel: "payer-action".to_string(),
                    href: "https://gateway.test/approve".to_string(),
                    method: None,
                }],
            })
        }

        async fn capture_authorization(
            &self,
            external_order_id: &str,
        ) -> Result<CaptureResult, GatewayError> {
            self.captures.fetch_add(1, Ordering::SeqCst);
            if let Some(e) = self.capture_error.lock().unwrap().take() {
                return Err(e);
            }
            let status = (*self.capture_status.lock().unwrap()).unwrap_or("COMPLETED");
            Ok(CaptureResult {
                capture_id: Some(format!("CAP-{external_order_id}")),
                status: if status == "COMPLETED" {
                    CaptureStatus::Completed
                } else {
                    CaptureStatus::NotCompleted
                },
                provider_status: status.to_string(),
            })
        }

        async fn query_authorization(
            &self,
            _external_order_id: &str,
        ) -> Result<PaymentState, GatewayError> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .clone()
                .unwrap_or(PaymentState::AwaitingCapture))
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        gateway: Arc<ScriptedGateway>,
        notifier: Arc<Notifier>,
        coordinator: OrderCoordinator,
        user: SessionUser,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        store
            .insert_product(Product {
                id: ProductId::new(1),
                name: "Item A".to_string(),
                price: Money::new(dec!(5.00)).unwrap(),
                is_active: true,
            })
            .await;
        store
            .insert_product(Product {
                id: ProductId::new(2),
                name: "Item B".to_string(),
                price: Money::new(dec!(3.00)).unwrap(),
                is_active: true,
            })
            .await;
        let user = store
            .insert_user(&Email::parse("ada@example.test").unwrap(), Role::Customer)
            .await;
        let mut cart = Cart::new();
        cart.add(ProductId::new(1), None, 2);
        store.set_cart(user.id, &cart).await.unwrap();

        let gateway = Arc::new(ScriptedGateway::default());
        let notifier = Arc::new(Notifier::new());
        let coordinator = OrderCoordinator::new(
            Stores::from_backend(store.clone()),
            gateway.clone(),
            notifier.clone(),
            CheckoutSettings {
                currency: CurrencyCode::USD,
                return_urls: ReturnUrls {
                    return_url: "https://shop.test/ok".to_string(),
                    cancel_url: "https://shop.test/cancel".to_string(),
                },
            },
        );
        Harness {
            store,
            gateway,
            notifier,
            coordinator,
            user,
        }
    }

    fn checkout(method: PaymentMethod) -> PlaceOrder {
        PlaceOrder {
            items: vec![
                OrderItemInput {
                    product_id: ProductId::new(1),
                    quantity: 2,
                    variant: None,
                },
                OrderItemInput {
                    product_id: ProductId::new(2),
                    quantity: 1,
                    variant: Some("blue".to_string()),
                },
            ],
            shipping_address: ShippingAddress {
                full_name: "Ada Lovelace".to_string(),
                line1: "12 Analytical Way".to_string(),
                line2: None,
                city: "London".to_string(),
                state: String::new(),
                postal_code: "N1 9GU".to_string(),
                country: "GB".to_string(),
                phone: String::new(),
            },
            payment_method: method,
        }
    }

    #[tokio::test]
    async fn test_place_cod_order_prices_from_catalog() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Cod))
            .await
            .unwrap();

        assert_eq!(placed.order.subtotal, Money::new(dec!(13.00)).unwrap());
        assert_eq!(placed.order.total, Money::new(dec!(23.00)).unwrap());
        assert_eq!(placed.order.recomputed_subtotal(), placed.order.subtotal);
        assert_eq!(placed.order.items[1].name, "Item B");
        assert!(placed.approval_links.is_empty());
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 1);
        assert_eq!(h.gateway.creates.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.purchases().await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_product_is_validation_error() {
        let h = harness().await;
        let mut request = checkout(PaymentMethod::Cod);
        request.items[0].product_id = ProductId::new(99);
        let err = h.coordinator.place_order(&h.user, request).await.unwrap_err();
        assert!(matches!(err, LifecycleError::Validation(_)));
    }

    #[tokio::test]
    async fn test_gateway_rejection_leaves_order_pending_without_external_id() {
        let h = harness().await;
        *h.gateway.create.lock().unwrap() = Some(GatewayError::Rejected {
            issue: "CURRENCY_NOT_SUPPORTED".to_string(),
            message: "Currency is not supported".to_string(),
        });

        let err = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::GatewayRejected));
        assert!(err.to_string().contains("cash on delivery"));

        let stored = h
            .store
            .find_by_id(OrderId::new(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(stored.external_order_id, None);
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 0);
    }

    #[tokio::test]
    async fn test_double_capture_applies_side_effects_once() {
        let h = harness().await;
        let (_, mut events) = h.notifier.register(&h.user);
        let session = h
            .coordinator
            .create_payment(
                &h.user,
                checkout(PaymentMethod::Gateway).items,
                checkout(PaymentMethod::Gateway).shipping_address,
            )
            .await
            .unwrap();

        let first = h
            .coordinator
            .capture_payment(&h.user, &session.external_order_id)
            .await
            .unwrap();
        let second = h
            .coordinator
            .capture_payment(&h.user, &session.external_order_id)
            .await
            .unwrap();

        assert_eq!(first.payment_status, PaymentStatus::Completed);
        assert_eq!(second.payment_status, PaymentStatus::Completed);
        assert_eq!(
            second.external_capture_id.as_deref(),
            Some("CAP-EXT-1")
        );
        assert_eq!(h.gateway.captures.load(Ordering::SeqCst), 1);
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 1);
        assert!(h.store.get_cart(h.user.id).await.unwrap().is_empty());
        assert!(matches!(events.try_recv(), Ok(ServerEvent::PaymentUpdate(_))));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_capture_not_completed_leaves_order_untouched() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        *h.gateway.capture_status.lock().unwrap() = Some("PENDING");

        let external_order_id = placed.order.external_order_id.unwrap();
        let err = h
            .coordinator
            .capture_payment(&h.user, &external_order_id)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::CaptureNotCompleted(_)));

        let stored = h.store.find_by_id(placed.order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 0);
    }

    #[tokio::test]
    async fn test_already_captured_without_capture_reports_provider_state() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        *h.gateway.capture_error.lock().unwrap() = Some(GatewayError::AlreadyCaptured);
        *h.gateway.state.lock().unwrap() = Some(PaymentState::Voided);

        let err = h
            .coordinator
            .capture_payment(&h.user, &placed.order.external_order_id.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(&err, LifecycleError::CaptureNotCompleted(state) if state == "voided"));
        assert!(err.to_string().contains("(voided)"), "{err}");
    }

    #[tokio::test]
    async fn test_cancelled_order_is_never_captured() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        h.coordinator
            .cancel_order(&h.user, placed.order.id)
            .await
            .unwrap();

        let err = h
            .coordinator
            .capture_payment(&h.user, &placed.order.external_order_id.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(h.gateway.captures.load(Ordering::SeqCst), 0);
        let stored = h.store.find_by_id(placed.order.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_status, PaymentStatus::Pending);
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 0);
    }

    #[tokio::test]
    async fn test_soft_deleted_order_is_never_captured() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        h.coordinator.soft_delete(placed.order.id).await.unwrap();

        let err = h
            .coordinator
            .capture_payment(&h.user, &placed.order.external_order_id.unwrap())
            .await
            .unwrap_err();

        assert!(matches!(err, LifecycleError::Conflict(_)));
        assert_eq!(h.gateway.captures.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_capture_by_other_user_is_not_found() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        let other = h
            .store
            .insert_user(&Email::parse("eve@example.test").unwrap(), Role::Customer)
            .await;

        let err = h
            .coordinator
            .capture_payment(&other, &placed.order.external_order_id.unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::NotFound));
    }

    #[tokio::test]
    async fn test_webhook_after_capture_is_noop() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        let external_order_id = placed.order.external_order_id.unwrap();
        h.coordinator
            .capture_payment(&h.user, &external_order_id)
            .await
            .unwrap();
        let (_, mut events) = h.notifier.register(&h.user);

        let outcome = h
            .coordinator
            .apply_webhook(WebhookEvent {
                id: "WH-1".to_string(),
                kind: WebhookEventKind::CaptureCompleted {
                    external_order_id,
                    capture_id: "CAP-EXT-1".to_string(),
                },
            })
            .await
            .unwrap();

        assert!(matches!(outcome, WebhookOutcome::Applied(Applied::Unchanged(_))));
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 1);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_webhook_before_capture_completes_once_confirmed() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        let external_order_id = placed.order.external_order_id.unwrap();

        let event = WebhookEvent {
            id: "WH-2".to_string(),
            kind: WebhookEventKind::CaptureCompleted {
                external_order_id: external_order_id.clone(),
                capture_id: "CAP-9".to_string(),
            },
        };

        // Provider does not (yet) confirm the capture
        let outcome = h.coordinator.apply_webhook(event.clone()).await.unwrap();
        assert_eq!(outcome, WebhookOutcome::Unconfirmed);

        *h.gateway.state.lock().unwrap() = Some(PaymentState::Captured {
            capture_id: "CAP-9".to_string(),
        });
        let outcome = h.coordinator.apply_webhook(event).await.unwrap();
        assert!(matches!(outcome, WebhookOutcome::Applied(Applied::Changed(_))));

        // The client's capture that follows is a no-op
        let order = h
            .coordinator
            .capture_payment(&h.user, &external_order_id)
            .await
            .unwrap();
        assert_eq!(order.external_capture_id.as_deref(), Some("CAP-9"));
        assert_eq!(h.gateway.captures.load(Ordering::SeqCst), 0);
        assert_eq!(h.store.cart_clear_count(h.user.id).await, 1);
    }

    #[tokio::test]
    async fn test_refund_webhook_after_capture() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        let external_order_id = placed.order.external_order_id.unwrap();
        h.coordinator
            .capture_payment(&h.user, &external_order_id)
            .await
            .unwrap();

        let outcome = h
            .coordinator
            .apply_webhook(WebhookEvent {
                id: "WH-3".to_string(),
                kind: WebhookEventKind::CaptureRefunded {
                    capture_id: format!("CAP-{external_order_id}"),
                },
            })
            .await
            .unwrap();
        let WebhookOutcome::Applied(applied) = outcome else {
            panic!("expected refund to apply");
        };
        assert_eq!(applied.order().payment_status, PaymentStatus::Refunded);
    }

    #[tokio::test]
    async fn test_gateway_pending_order_cannot_be_delivered() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();

        let err = h
            .coordinator
            .update_order_status(placed.order.id, OrderStatus::Delivered)
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "cannot mark delivered while payment pending");
    }

    #[tokio::test]
    async fn test_customer_cannot_cancel_shipped_order() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Cod))
            .await
            .unwrap();
        h.coordinator
            .update_order_status(placed.order.id, OrderStatus::Shipped)
            .await
            .unwrap();

        let err = h
            .coordinator
            .cancel_order(&h.user, placed.order.id)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Auth(_)));
    }

    #[tokio::test]
    async fn test_reconcile_applies_provider_capture() {
        let h = harness().await;
        let placed = h
            .coordinator
            .place_order(&h.user, checkout(PaymentMethod::Gateway))
            .await
            .unwrap();
        *h.gateway.state.lock().unwrap() = Some(PaymentState::Captured {
            capture_id: "CAP-R".to_string(),
        });

        let results = h.coordinator.reconcile_pending(10).await.unwrap();
        assert_eq!(results.len(), 1);
        let (order_id, result) = &results[0];
        assert_eq!(*order_id, placed.order.id);
        assert!(result.as_ref().unwrap().changed());
        assert!(h.coordinator.reconcile_pending(10).await.unwrap().is_empty());
    }
}
