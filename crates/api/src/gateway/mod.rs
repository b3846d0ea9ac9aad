//! Payment gateway adapter.
//!
//! The coordinator only ever talks to the provider through
//! [`PaymentGateway`]. Switching provider, or between sandbox and live, is a
//! change to this module alone.
//!
//! # Operations
//!
//! - `create_authorization` - create a payable provider order
//! - `capture_authorization` - move the authorized funds
//! - `query_authorization` - read-only status check for reconciliation
//!
//! Every operation returns a typed [`GatewayError`]; nothing is swallowed.

pub mod paypal;
pub mod webhook;

use async_trait::async_trait;
use mercato_core::{CurrencyCode, Money, OrderId, OrderTotals, PaymentEvent, ShippingAddress};
use serde::Serialize;
use thiserror::Error;

pub use paypal::PayPalGateway;

/// Errors that can occur when talking to the payment gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Network failure, timeout or provider 5xx. Safe to retry.
    #[error("payment gateway unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the request for a business reason (unsupported
    /// currency or region, declined instrument). Retrying will not help.
    #[error("payment rejected by gateway: {issue}")]
    Rejected {
        /// Provider issue code, e.g. `CURRENCY_NOT_SUPPORTED`.
        issue: String,
        /// Provider description, for logs only.
        message: String,
    },

    /// The request was invalid before it was sent.
    #[error("invalid payment request: {0}")]
    Validation(String),

    /// The authorization was already captured.
    #[error("authorization already captured")]
    AlreadyCaptured,

    /// The provider does not know the authorization.
    #[error("authorization not found")]
    NotFound,

    /// The provider answered with something we could not read.
    #[error("unexpected gateway response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for GatewayError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            Self::Decode(e.to_string())
        } else {
            Self::Unavailable(e.to_string())
        }
    }
}

/// Amounts sent to the provider, all in the deployment's base currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AmountBreakdown {
    pub subtotal: Money,
    pub shipping: Money,
    pub total: Money,
    pub currency: CurrencyCode,
}

impl AmountBreakdown {
    /// Breakdown for an order's totals.
    #[must_use]
    pub const fn new(totals: OrderTotals, currency: CurrencyCode) -> Self {
        Self {
            subtotal: totals.subtotal,
            shipping: totals.shipping,
            total: totals.total,
            currency,
        }
    }

    /// Check the amount before any network call is made.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Validation` if the total is below the smallest
    /// chargeable amount or does not equal subtotal plus shipping.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if !self.total.is_chargeable() {
            return Err(GatewayError::Validation(format!(
                "amount {} {} is below the minimum charge of {}",
                self.total,
                self.currency,
                Money::MINIMUM_CHARGE
            )));
        }
        if self.subtotal + self.shipping != self.total {
            return Err(GatewayError::Validation(
                "amount breakdown does not add up to the total".to_string(),
            ));
        }
        Ok(())
    }
}

/// Where the provider sends the customer after approval or cancellation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReturnUrls {
    pub return_url: String,
    pub cancel_url: String,
}

/// Everything needed to create a provider order.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    /// Local order id, used as the provider reference and idempotency key.
    pub reference: OrderId,
    pub amount: AmountBreakdown,
    pub shipping_address: ShippingAddress,
    pub return_urls: ReturnUrls,
}

/// A HATEOAS link returned by the provider (e.g. the approval page).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ApprovalLink {
    pub rel: String,
    pub href: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

/// A created provider order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Authorization {
    pub external_order_id: String,
    pub approval_links: Vec<ApprovalLink>,
}

/// Outcome of a capture call. Anything but `Completed` is a failed capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureStatus {
    Completed,
    NotCompleted,
}

/// Result of a capture call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureResult {
    pub capture_id: Option<String>,
    pub status: CaptureStatus,
    /// Raw provider status, for logs and error messages.
    pub provider_status: String,
}

impl CaptureResult {
    /// The capture id, if and only if the capture completed.
    #[must_use]
    pub fn completed_capture_id(&self) -> Option<&str> {
        match self.status {
            CaptureStatus::Completed => self.capture_id.as_deref(),
            CaptureStatus::NotCompleted => None,
        }
    }
}

/// Payment state of a provider order, as reported by `query_authorization`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentState {
    /// Created or approved, not yet captured.
    AwaitingCapture,
    /// Funds captured.
    Captured { capture_id: String },
    /// Capture declined or failed.
    Denied,
    /// Captured funds returned.
    Refunded { capture_id: String },
    /// Provider order voided or expired.
    Voided,
}

impl PaymentState {
    /// The lifecycle event this state implies, if any.
    #[must_use]
    pub const fn event(&self) -> Option<PaymentEvent> {
        match self {
            Self::Captured { .. } => Some(PaymentEvent::CaptureCompleted),
            Self::Denied => Some(PaymentEvent::CaptureDenied),
            Self::Refunded { .. } => Some(PaymentEvent::Refunded),
            Self::AwaitingCapture | Self::Voided => None,
        }
    }

    /// Capture id known for this state.
    #[must_use]
    pub fn capture_id(&self) -> Option<&str> {
        match self {
            Self::Captured { capture_id } | Self::Refunded { capture_id } => Some(capture_id),
            Self::AwaitingCapture | Self::Denied | Self::Voided => None,
        }
    }

    /// The `snake_case` name used in logs and client messages.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingCapture => "awaiting_capture",
            Self::Captured { .. } => "captured",
            Self::Denied => "denied",
            Self::Refunded { .. } => "refunded",
            Self::Voided => "voided",
        }
    }
}

impl std::fmt::Display for PaymentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Create a payable order for the given amount.
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<Authorization, GatewayError>;

    /// Capture a previously approved order.
    async fn capture_authorization(
        &self,
        external_order_id: &str,
    ) -> Result<CaptureResult, GatewayError>;

    /// Read the current state of a provider order.
    async fn query_authorization(
        &self,
        external_order_id: &str,
    ) -> Result<PaymentState, GatewayError>;
}
