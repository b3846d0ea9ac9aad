//! `PayPal` Orders v2 REST adapter.
//!
//! # Authentication
//!
//! OAuth client credentials. The access token is cached in memory and
//! refreshed a minute before it expires.
//!
//! # Idempotency
//!
//! Every mutating call carries a `PayPal-Request-Id` derived from what it
//! acts on (`order-{id}`, `capture-{external id}`), so a retried request can
//! never create a second provider order or move funds twice.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, warn};

use super::{
    ApprovalLink, Authorization, AuthorizationRequest, CaptureResult, CaptureStatus, GatewayError,
    PaymentGateway, PaymentState,
};
use crate::config::GatewayConfig;

/// Refresh the token this long before the provider says it expires.
const TOKEN_REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Header carrying the idempotency key.
const REQUEST_ID_HEADER: &str = "PayPal-Request-Id";

/// `PayPal` REST client implementing [`PaymentGateway`].
#[derive(Clone)]
pub struct PayPalGateway {
    inner: Arc<PayPalGatewayInner>,
}

struct PayPalGatewayInner {
    client: reqwest::Client,
    api_base: String,
    client_id: String,
    client_secret: SecretString,
    /// In-memory token cache
    token: RwLock<Option<CachedToken>>,
}

#[derive(Clone)]
struct CachedToken {
    access_token: SecretString,
    refresh_at: Instant,
}

// =============================================================================
// Wire types
// =============================================================================

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    /// Token lifetime in seconds.
    expires_in: u64,
}

#[derive(Serialize)]
struct CreateOrderBody<'a> {
    intent: &'static str,
    purchase_units: [PurchaseUnit<'a>; 1],
    payment_source: PaymentSource<'a>,
}

#[derive(Serialize)]
struct PurchaseUnit<'a> {
    reference_id: String,
    custom_id: String,
    amount: AmountWithBreakdown,
    shipping: Shipping<'a>,
}

#[derive(Serialize)]
struct AmountWithBreakdown {
    currency_code: &'static str,
    value: String,
    breakdown: Breakdown,
}

#[derive(Serialize)]
struct Breakdown {
    item_total: Amount,
    shipping: Amount,
}

#[derive(Serialize)]
struct Amount {
    currency_code: &'static str,
    value: String,
}

#[derive(Serialize)]
struct Shipping<'a> {
    name: ShippingName<'a>,
    address: ShippingAddressBody<'a>,
}

#[derive(Serialize)]
struct ShippingName<'a> {
    full_name: &'a str,
}

#[derive(Serialize)]
struct ShippingAddressBody<'a> {
    address_line_1: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    address_line_2: Option<&'a str>,
    admin_area_2: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    admin_area_1: Option<&'a str>,
    postal_code: &'a str,
    country_code: &'a str,
}

#[derive(Serialize)]
struct PaymentSource<'a> {
    paypal: PayPalSource<'a>,
}

#[derive(Serialize)]
struct PayPalSource<'a> {
    experience_context: ExperienceContext<'a>,
}

#[derive(Serialize)]
struct ExperienceContext<'a> {
    return_url: &'a str,
    cancel_url: &'a str,
    shipping_preference: &'static str,
    user_action: &'static str,
}

#[derive(Deserialize)]
struct OrderResponse {
    id: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    links: Vec<LinkResponse>,
    #[serde(default)]
    purchase_units: Vec<PurchaseUnitResponse>,
}

#[derive(Deserialize)]
struct LinkResponse {
    href: String,
    rel: String,
    #[serde(default)]
    method: Option<String>,
}

#[derive(Deserialize)]
struct PurchaseUnitResponse {
    #[serde(default)]
    payments: Option<PaymentsResponse>,
}

#[derive(Deserialize)]
struct PaymentsResponse {
    #[serde(default)]
    captures: Vec<CaptureResponse>,
}

#[derive(Deserialize)]
struct CaptureResponse {
    id: String,
    status: String,
}

#[derive(Deserialize, Default)]
struct ErrorResponse {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    details: Vec<ErrorDetail>,
}

#[derive(Deserialize)]
struct ErrorDetail {
    issue: String,
    #[serde(default)]
    description: String,
}

impl OrderResponse {
    fn first_capture(&self) -> Option<&CaptureResponse> {
        self.purchase_units
            .iter()
            .filter_map(|unit| unit.payments.as_ref())
            .find_map(|payments| payments.captures.first())
    }

    fn into_links(self) -> Vec<ApprovalLink> {
        self.links
            .into_iter()
            .map(|l| ApprovalLink {
                rel: l.rel,
                href: l.href,
                method: l.method,
            })
            .collect()
    }
}

// =============================================================================
// Client
// =============================================================================

impl PayPalGateway {
    /// Create a client from gateway configuration.
    ///
    /// # Errors
    ///
    /// Returns `GatewayError::Unavailable` if the HTTP client cannot be built.
    pub fn new(config: &GatewayConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        Ok(Self {
            inner: Arc::new(PayPalGatewayInner {
                client,
                api_base: config.api_base.as_str().trim_end_matches('/').to_string(),
                client_id: config.client_id.clone(),
                client_secret: config.client_secret.clone(),
                token: RwLock::new(None),
            }),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.inner.api_base)
    }

    /// Get a valid access token, fetching a new one if needed.
    async fn access_token(&self) -> Result<SecretString, GatewayError> {
        if let Some(token) = self.inner.token.read().await.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.access_token.clone());
        }

        let mut cache = self.inner.token.write().await;
        // Another task may have refreshed while we waited for the lock
        if let Some(token) = cache.as_ref()
            && Instant::now() < token.refresh_at
        {
            return Ok(token.access_token.clone());
        }

        let token = self.fetch_token().await?;
        let access_token = token.access_token.clone();
        *cache = Some(token);
        Ok(access_token)
    }

    #[instrument(skip(self))]
    async fn fetch_token(&self) -> Result<CachedToken, GatewayError> {
        let response = self
            .inner
            .client
            .post(self.url("/v1/oauth2/token"))
            .basic_auth(
                &self.inner.client_id,
                Some(self.inner.client_secret.expose_secret()),
            )
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            warn!(%status, "Gateway token request failed");
            return Err(GatewayError::Unavailable(format!(
                "token request failed with HTTP {status}"
            )));
        }

        let token: TokenResponse = response.json().await?;
        debug!(expires_in = token.expires_in, "Gateway access token obtained");

        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(TOKEN_REFRESH_MARGIN);
        Ok(CachedToken {
            access_token: SecretString::from(token.access_token),
            refresh_at: Instant::now() + lifetime,
        })
    }

    /// Drop the cached token so the next call fetches a fresh one.
    async fn invalidate_token(&self) {
        *self.inner.token.write().await = None;
    }

    /// Read a successful order response or map the failure.
    async fn read_order(&self, response: reqwest::Response) -> Result<OrderResponse, GatewayError> {
        let status = response.status();
        if status.is_success() {
            return response
                .json::<OrderResponse>()
                .await
                .map_err(|e| GatewayError::Decode(e.to_string()));
        }

        let body: ErrorResponse = response.json().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            self.invalidate_token().await;
        }
        Err(map_error(status, body))
    }
}

/// Map a provider error response to the gateway taxonomy.
fn map_error(status: reqwest::StatusCode, body: ErrorResponse) -> GatewayError {
    let issue = body
        .details
        .first()
        .map_or_else(|| body.name.clone(), |d| d.issue.clone());
    let message = body
        .details
        .first()
        .map(|d| d.description.clone())
        .filter(|d| !d.is_empty())
        .unwrap_or(body.message);

    if status.is_server_error()
        || status == reqwest::StatusCode::TOO_MANY_REQUESTS
        || status == reqwest::StatusCode::UNAUTHORIZED
    {
        return GatewayError::Unavailable(format!("HTTP {status}: {issue}"));
    }
    if issue == "ORDER_ALREADY_CAPTURED" {
        return GatewayError::AlreadyCaptured;
    }
    if status == reqwest::StatusCode::NOT_FOUND {
        return GatewayError::NotFound;
    }
    GatewayError::Rejected { issue, message }
}

/// Interpret a provider order as a payment state.
fn payment_state(order: &OrderResponse) -> PaymentState {
    match order.status.as_str() {
        "VOIDED" => PaymentState::Voided,
        "COMPLETED" => match order.first_capture() {
            Some(capture) => match capture.status.as_str() {
                "COMPLETED" => PaymentState::Captured {
                    capture_id: capture.id.clone(),
                },
                "DECLINED" | "FAILED" => PaymentState::Denied,
                "REFUNDED" | "PARTIALLY_REFUNDED" => PaymentState::Refunded {
                    capture_id: capture.id.clone(),
                },
                _ => PaymentState::AwaitingCapture,
            },
            None => PaymentState::AwaitingCapture,
        },
        _ => PaymentState::AwaitingCapture,
    }
}

#[async_trait]
impl PaymentGateway for PayPalGateway {
    #[instrument(skip(self, request), fields(order_id = %request.reference, total = %request.amount.total))]
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<Authorization, GatewayError> {
        request.amount.validate()?;

        let currency = request.amount.currency.as_str();
        let address = &request.shipping_address;
        let body = CreateOrderBody {
            intent: "CAPTURE",
            purchase_units: [PurchaseUnit {
                reference_id: request.reference.to_string(),
                custom_id: request.reference.to_string(),
                amount: AmountWithBreakdown {
                    currency_code: currency,
                    value: request.amount.total.to_fixed_string(),
                    breakdown: Breakdown {
                        item_total: Amount {
                            currency_code: currency,
                            value: request.amount.subtotal.to_fixed_string(),
                        },
                        shipping: Amount {
                            currency_code: currency,
                            value: request.amount.shipping.to_fixed_string(),
                        },
                    },
                },
                shipping: Shipping {
                    name: ShippingName {
                        full_name: &address.full_name,
                    },
                    address: ShippingAddressBody {
                        address_line_1: &address.line1,
                        address_line_2: address.line2.as_deref(),
                        admin_area_2: &address.city,
                        admin_area_1: Some(address.state.as_str()).filter(|s| !s.is_empty()),
                        postal_code: &address.postal_code,
                        country_code: &address.country,
                    },
                },
            }],
            payment_source: PaymentSource {
                paypal: PayPalSource {
                    experience_context: ExperienceContext {
                        return_url: &request.return_urls.return_url,
                        cancel_url: &request.return_urls.cancel_url,
                        shipping_preference: "SET_PROVIDED_ADDRESS",
                        user_action: "PAY_NOW",
                    },
                },
            },
        };

        let token = self.access_token().await?;
        let response = self
            .inner
            .client
            .post(self.url("/v2/checkout/orders"))
            .bearer_auth(token.expose_secret())
            .header(REQUEST_ID_HEADER, format!("order-{}", request.reference))
            .json(&body)
            .send()
            .await?;

        let order = self.read_order(response).await?;
        debug!(external_order_id = %order.id, status = %order.status, "Gateway order created");

        Ok(Authorization {
            external_order_id: order.id.clone(),
            approval_links: order.into_links(),
        })
    }

    #[instrument(skip(self))]
    async fn capture_authorization(
        &self,
        external_order_id: &str,
    ) -> Result<CaptureResult, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .inner
            .client
            .post(self.url(&format!("/v2/checkout/orders/{external_order_id}/capture")))
            .bearer_auth(token.expose_secret())
            .header(REQUEST_ID_HEADER, format!("capture-{external_order_id}"))
            .json(&serde_json::json!({}))
            .send()
            .await?;

        let order = self.read_order(response).await?;
        let capture = order.first_capture();
        let completed = order.status == "COMPLETED"
            && capture.is_some_and(|c| c.status == "COMPLETED");

        let provider_status = capture.map_or_else(|| order.status.clone(), |c| c.status.clone());
        debug!(%provider_status, completed, "Gateway capture finished");

        Ok(CaptureResult {
            capture_id: capture.map(|c| c.id.clone()),
            status: if completed {
                CaptureStatus::Completed
            } else {
                CaptureStatus::NotCompleted
            },
            provider_status,
        })
    }

    #[instrument(skip(self))]
    async fn query_authorization(
        &self,
        external_order_id: &str,
    ) -> Result<PaymentState, GatewayError> {
        let token = self.access_token().await?;
        let response = self
            .inner
            .client
            .get(self.url(&format!("/v2/checkout/orders/{external_order_id}")))
            .bearer_auth(token.expose_secret())
            .send()
            .await?;

        let order = self.read_order(response).await?;
        Ok(payment_state(&order))
    }
}
