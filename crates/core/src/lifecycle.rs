//! Order and payment status transition table.
//!
//! Every status change in the system, whether it comes from an admin, a
//! capture request or a gateway webhook, is checked here. Stores apply the
//! result with a conditional update so that concurrent writers cannot skip
//! the check.
//!
//! ```text
//! payment:  pending ──> completed ──> refunded
//!              └──────> failed
//!
//! order:    placed ─> packing ─> shipped ─> out_for_delivery ─> delivered
//!              └─────────┴──────────┴───────────┴──> cancelled
//! ```
//!
//! Order status only moves forward (skipping steps is allowed, going back is
//! not). A gateway-paid order cannot be marked delivered until its payment is
//! completed. Cash-on-delivery orders are exempt: their payment completes at
//! the door.

use crate::order::Order;
use crate::types::{OrderStatus, PaymentMethod, PaymentStatus};

/// An attempted status change that the transition table forbids.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransitionError {
    /// The order is `delivered` or `cancelled`.
    #[error("order is already {from}; its status can no longer change")]
    Terminal {
        /// Current status.
        from: OrderStatus,
    },
    /// Backward move (or a move to the same status).
    #[error("cannot move order from {from} back to {to}")]
    NotForward {
        /// Current status.
        from: OrderStatus,
        /// Requested status.
        to: OrderStatus,
    },
    /// Gateway order without a completed payment.
    #[error("cannot mark delivered while payment {payment_status}")]
    DeliveredWithoutPayment {
        /// Current payment status.
        payment_status: PaymentStatus,
    },
    /// Payment status edge not in the table.
    #[error("cannot change payment status from {from} to {to}")]
    IllegalPayment {
        /// Current payment status.
        from: PaymentStatus,
        /// Requested payment status.
        to: PaymentStatus,
    },
}

impl OrderStatus {
    /// Whether the table has an edge `self -> to`, ignoring payment guards.
    #[must_use]
    pub fn can_transition_to(self, to: Self) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.rank(), to.rank()) {
            (_, None) => true,
            (Some(from), Some(target)) => target > from,
            (None, Some(_)) => false,
        }
    }
}

impl PaymentStatus {
    /// Whether the table has an edge `self -> to`.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        matches!(
            (self, to),
            (Self::Pending, Self::Completed | Self::Failed) | (Self::Completed, Self::Refunded)
        )
    }
}

/// Check an order status change against the table and the payment guard.
///
/// # Errors
///
/// Returns the specific reason the change is not allowed.
pub fn check_order_transition(order: &Order, to: OrderStatus) -> Result<(), TransitionError> {
    let from = order.order_status;
    if from.is_terminal() {
        return Err(TransitionError::Terminal { from });
    }
    if !from.can_transition_to(to) {
        return Err(TransitionError::NotForward { from, to });
    }
    if to == OrderStatus::Delivered
        && order.payment_method == PaymentMethod::Gateway
        && order.payment_status != PaymentStatus::Completed
    {
        return Err(TransitionError::DeliveredWithoutPayment {
            payment_status: order.payment_status,
        });
    }
    Ok(())
}

/// Check a payment status change against the table.
///
/// # Errors
///
/// Returns [`TransitionError::IllegalPayment`] for any edge not in the table.
pub const fn check_payment_transition(
    order: &Order,
    to: PaymentStatus,
) -> Result<(), TransitionError> {
    let from = order.payment_status;
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(TransitionError::IllegalPayment { from, to })
    }
}

/// Payment outcomes reported by the gateway, directly or via webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEvent {
    /// Funds captured.
    CaptureCompleted,
    /// Capture declined by the provider.
    CaptureDenied,
    /// Captured funds returned to the customer.
    Refunded,
}

impl PaymentEvent {
    /// The only status this event may move a payment out of.
    #[must_use]
    pub const fn source(self) -> PaymentStatus {
        match self {
            Self::CaptureCompleted | Self::CaptureDenied => PaymentStatus::Pending,
            Self::Refunded => PaymentStatus::Completed,
        }
    }

    /// The status this event moves a payment into.
    #[must_use]
    pub const fn target(self) -> PaymentStatus {
        match self {
            Self::CaptureCompleted => PaymentStatus::Completed,
            Self::CaptureDenied => PaymentStatus::Failed,
            Self::Refunded => PaymentStatus::Refunded,
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::order::tests::address;
    use crate::types::{CurrencyCode, Money, OrderId, UserId};

    fn order(method: PaymentMethod, payment: PaymentStatus, status: OrderStatus) -> Order {
        Order {
            id: OrderId::new(1),
            user_id: UserId::new(1),
            items: vec![],
            shipping_address: address(),
            payment_method: method,
            payment_status: payment,
            order_status: status,
            subtotal: Money::ZERO,
            shipping_fee: Money::ZERO,
            total: Money::ZERO,
            currency: CurrencyCode::USD,
            external_order_id: None,
            external_capture_id: None,
            is_active: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_forward_moves_allowed() {
        let o = order(PaymentMethod::Cod, PaymentStatus::Pending, OrderStatus::Placed);
        assert_eq!(check_order_transition(&o, OrderStatus::Packing), Ok(()));
        assert_eq!(check_order_transition(&o, OrderStatus::Shipped), Ok(()));
    }

    #[test]
    fn test_delivered_to_packing_rejected() {
        let o = order(
            PaymentMethod::Gateway,
            PaymentStatus::Completed,
            OrderStatus::Delivered,
        );
        assert_eq!(
            check_order_transition(&o, OrderStatus::Packing),
            Err(TransitionError::Terminal {
                from: OrderStatus::Delivered
            })
        );
    }

    #[test]
    fn test_backward_and_same_state_rejected() {
        let o = order(PaymentMethod::Cod, PaymentStatus::Pending, OrderStatus::Shipped);
        assert!(matches!(
            check_order_transition(&o, OrderStatus::Packing),
            Err(TransitionError::NotForward { .. })
        ));
        assert!(matches!(
            check_order_transition(&o, OrderStatus::Shipped),
            Err(TransitionError::NotForward { .. })
        ));
    }

    #[test]
    fn test_cancel_from_any_non_terminal_state() {
        for status in [
            OrderStatus::Placed,
            OrderStatus::Packing,
            OrderStatus::Shipped,
            OrderStatus::OutForDelivery,
        ] {
            let o = order(PaymentMethod::Gateway, PaymentStatus::Pending, status);
            assert_eq!(check_order_transition(&o, OrderStatus::Cancelled), Ok(()));
        }
        let cancelled = order(PaymentMethod::Cod, PaymentStatus::Pending, OrderStatus::Cancelled);
        assert!(check_order_transition(&cancelled, OrderStatus::Cancelled).is_err());
    }

    #[test]
    fn test_gateway_pending_cannot_be_delivered() {
        let o = order(
            PaymentMethod::Gateway,
            PaymentStatus::Pending,
            OrderStatus::OutForDelivery,
        );
        let err = check_order_transition(&o, OrderStatus::Delivered).unwrap_err();
        assert_eq!(
            err,
            TransitionError::DeliveredWithoutPayment {
                payment_status: PaymentStatus::Pending
            }
        );
        assert_eq!(err.to_string(), "cannot mark delivered while payment pending");
    }

    #[test]
    fn test_cod_pending_can_be_delivered() {
        let o = order(
            PaymentMethod::Cod,
            PaymentStatus::Pending,
            OrderStatus::OutForDelivery,
        );
        assert_eq!(check_order_transition(&o, OrderStatus::Delivered), Ok(()));
    }

    #[test]
    fn test_payment_table() {
        use PaymentStatus::{Completed, Failed, Pending, Refunded};
        let allowed = [(Pending, Completed), (Pending, Failed), (Completed, Refunded)];
        for from in PaymentStatus::ALL {
            for to in PaymentStatus::ALL {
                assert_eq!(
                    from.can_transition_to(*to),
                    allowed.contains(&(*from, *to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_payment_events_follow_table() {
        for event in [
            PaymentEvent::CaptureCompleted,
            PaymentEvent::CaptureDenied,
            PaymentEvent::Refunded,
        ] {
            assert!(event.source().can_transition_to(event.target()));
        }
    }
}
