//! Integration tests for Mercato.
//!
//! Tests drive the real axum router with `tower::ServiceExt::oneshot`, backed
//! by the in-memory store and a scripted payment gateway. No database, no
//! network.
//!
//! # Running Tests
//!
//! ```bash
//! cargo test -p mercato-integration-tests
//! ```
//!
//! # Test Categories
//!
//! - `orders` - placement, pricing, admin listing and status transitions
//! - `payments` - authorization, idempotent capture and webhooks
//! - `auth` - credentials, roles and the legacy admin secret

#![allow(clippy::expect_used, clippy::missing_panics_doc)]

use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::{
    body::Body,
    http::{Method, Request, StatusCode, header},
};
use chrono::Utc;
use mercato_api::config::{ApiConfig, GatewayConfig, GatewayMode, LogFormat};
use mercato_api::db::{MemoryStore, SessionStore, Stores};
use mercato_api::gateway::webhook::{SIGNATURE_HEADER, TIMESTAMP_HEADER, sign};
use mercato_api::gateway::{
    ApprovalLink, Authorization, AuthorizationRequest, CaptureResult, CaptureStatus, GatewayError,
    PaymentGateway, PaymentState,
};
use mercato_api::middleware::auth::{ADMIN_TOKEN_HEADER, hash_token};
use mercato_api::models::{Product, SessionUser};
use mercato_api::state::AppState;
use mercato_core::{CurrencyCode, Email, Money, ProductId, Role};
use secrecy::SecretString;
use serde_json::Value;
use tower::ServiceExt;
use url::Url;

/// Bearer token of the seeded customer.
pub const CUSTOMER_TOKEN: &str = "customer-session-token";
/// Bearer token of a second seeded customer.
pub const OTHER_CUSTOMER_TOKEN: &str = "other-customer-session-token";
/// Bearer token of the seeded admin.
pub const ADMIN_TOKEN: &str = "admin-session-token";
/// Bearer token whose session has expired.
pub const EXPIRED_TOKEN: &str = "expired-session-token";
/// Legacy static admin secret.
pub const LEGACY_ADMIN_SECRET: &str = "legacy-admin-secret-Qm8vTz2LxR4pWn6s";
/// Webhook signing secret.
pub const WEBHOOK_SECRET: &str = "whsec_integration_Vb7Kp2Xr9Lm4Qz6T";

// =============================================================================
// Scripted gateway
// =============================================================================

/// Payment gateway with scripted answers and call counters.
///
/// Authorizations get the external id `EXT-{order id}`; captures get the
/// capture id `CAP-{external id}`.
#[derive(Default)]
pub struct FakeGateway {
    create_error: Mutex<Option<GatewayError>>,
    capture_status: Mutex<Option<&'static str>>,
    state: Mutex<Option<PaymentState>>,
    creates: AtomicUsize,
    captures: AtomicUsize,
    queries: AtomicUsize,
}

impl FakeGateway {
    /// Fail the next `create_authorization` with `error`.
    pub fn fail_next_create(&self, error: GatewayError) {
        *self.create_error.lock().expect("lock") = Some(error);
    }

    /// Provider status returned by captures (default `COMPLETED`).
    pub fn set_capture_status(&self, status: &'static str) {
        *self.capture_status.lock().expect("lock") = Some(status);
    }

    /// State returned by `query_authorization` (default awaiting capture).
    pub fn set_state(&self, state: PaymentState) {
        *self.state.lock().expect("lock") = Some(state);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn captures(&self) -> usize {
        self.captures.load(Ordering::SeqCst)
    }

    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_authorization(
        &self,
        request: &AuthorizationRequest,
    ) -> Result<Authorization, GatewayError> {
        request.amount.validate()?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = self.create_error.lock().expect("lock").take() {
            return Err(error);
        }
        Ok(Authorization {
            external_order_id: format!("EXT-{}", request.reference),
            approval_links: vec![ApprovalLink {
                rel: "payer-action".to_string(),
                href: format!(
                    "https://gateway.test/checkoutnow?token=EXT-{}",
                    request.reference
                ),
                method: Some("GET".to_string()),
            }],
        })
    }

    async fn capture_authorization(
        &self,
        external_order_id: &str,
    ) -> Result<CaptureResult, GatewayError> {
        self.captures.fetch_add(1, Ordering::SeqCst);
        let status = (*self.capture_status.lock().expect("lock")).unwrap_or("COMPLETED");
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
        self.queries.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .lock()
            .expect("lock")
            .clone()
            .unwrap_or(PaymentState::AwaitingCapture))
    }
}

// =============================================================================
// Test context
// =============================================================================

/// A seeded application behind the real router.
pub struct TestContext {
    pub store: Arc<MemoryStore>,
    pub gateway: Arc<FakeGateway>,
    pub state: AppState,
    pub customer: SessionUser,
    pub other_customer: SessionUser,
    pub admin: SessionUser,
}

/// Configuration for tests: in-memory store, webhook secret and legacy
/// admin secret set.
#[must_use]
pub fn test_config() -> ApiConfig {
    ApiConfig {
        database_url: SecretString::from("memory://"),
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        allowed_origins: vec!["http://localhost:3000".to_string()],
        storefront_url: Url::parse("http://localhost:3000").expect("url"),
        base_currency: CurrencyCode::USD,
        legacy_admin_token: Some(SecretString::from(LEGACY_ADMIN_SECRET)),
        gateway: GatewayConfig {
            client_id: "test-client".to_string(),
            client_secret: SecretString::from("unused"),
            mode: GatewayMode::Sandbox,
            api_base: Url::parse("http://127.0.0.1:9").expect("url"),
            timeout: Duration::from_secs(1),
            webhook_secret: Some(SecretString::from(WEBHOOK_SECRET)),
        },
        log_format: LogFormat::Text,
        sentry_dsn: None,
        sentry_environment: None,
    }
}

impl TestContext {
    /// Seed a catalog (`1`: 5.00, `2`: 3.00, `3`: inactive), two customers,
    /// an admin and an expired session.
    pub async fn new() -> Self {
        let store = Arc::new(MemoryStore::new());
        for (id, name, cents, is_active) in [
            (1, "Item A", 500, true),
            (2, "Item B", 300, true),
            (3, "Retired", 100, false),
        ] {
            store
                .insert_product(Product {
                    id: ProductId::new(id),
                    name: name.to_string(),
                    price: Money::from_cents(cents),
                    is_active,
                })
                .await;
        }

        let in_a_day = Utc::now() + chrono::Duration::days(1);
        let session = |email: &str, role: Role, token: &str, expires_at| {
            let store = store.clone();
            let email = Email::parse(email).expect("email");
            let hash = hash_token(token);
            async move {
                store
                    .create_session(&email, role, &hash, expires_at)
                    .await
                    .expect("session")
            }
        };
        let customer = session("ada@example.test", Role::Customer, CUSTOMER_TOKEN, in_a_day).await;
        let other_customer =
            session("eve@example.test", Role::Customer, OTHER_CUSTOMER_TOKEN, in_a_day).await;
        let admin = session("ops@example.test", Role::Admin, ADMIN_TOKEN, in_a_day).await;
        session(
            "ada@example.test",
            Role::Customer,
            EXPIRED_TOKEN,
            Utc::now() - chrono::Duration::minutes(5),
        )
        .await;

        let gateway = Arc::new(FakeGateway::default());
        let state = AppState::new(
            test_config(),
            Stores::from_backend(store.clone()),
            gateway.clone(),
        );

        Self {
            store,
            gateway,
            state,
            customer,
            other_customer,
            admin,
        }
    }

    /// Send a request through a fresh router and decode the JSON body.
    /// Non-JSON bodies come back as `Value::String`, empty ones as `Null`.
    pub async fn send(&self, request: Request<Body>) -> (StatusCode, Value) {
        let response = mercato_api::app(self.state.clone())
            .oneshot(request)
            .await
            .expect("router is infallible");
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        if bytes.is_empty() {
            return (status, Value::Null);
        }
        let body = serde_json::from_slice(&bytes)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()));
        (status, body)
    }

    /// Request with an optional bearer token and optional JSON body.
    pub async fn call(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        self.send(with_json(builder, body)).await
    }

    /// Request authenticated with the legacy admin secret.
    pub async fn call_legacy(
        &self,
        method: Method,
        uri: &str,
        secret: &str,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header(ADMIN_TOKEN_HEADER, secret);
        self.send(with_json(builder, body)).await
    }

    /// Deliver a webhook body signed with `secret` and the current time.
    pub async fn webhook(&self, body: &Value, secret: &str) -> (StatusCode, Value) {
        self.webhook_at(body, secret, &Utc::now().timestamp().to_string())
            .await
    }

    /// Deliver a webhook body signed with `secret` at `timestamp`.
    pub async fn webhook_at(
        &self,
        body: &Value,
        secret: &str,
        timestamp: &str,
    ) -> (StatusCode, Value) {
        let body = body.to_string();
        let signature =
            sign(&SecretString::from(secret), timestamp, &body).expect("signature");
        let request = Request::builder()
            .method(Method::POST)
            .uri("/orders/payment/webhook")
            .header(header::CONTENT_TYPE, "application/json")
            .header(TIMESTAMP_HEADER, timestamp)
            .header(SIGNATURE_HEADER, signature)
            .body(Body::from(body))
            .expect("request");
        self.send(request).await
    }
}

fn with_json(builder: axum::http::request::Builder, body: Option<Value>) -> Request<Body> {
    match body {
        Some(body) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string())),
        None => builder.body(Body::empty()),
    }
    .expect("request")
}

/// The A x2 + B x1 checkout used across tests.
#[must_use]
pub fn checkout_items() -> Value {
    serde_json::json!([
        { "productId": 1, "quantity": 2 },
        { "productId": 2, "quantity": 1, "variant": "blue" }
    ])
}

/// A complete shipping address.
#[must_use]
pub fn shipping_address() -> Value {
    serde_json::json!({
        "fullName": "Ada Lovelace",
        "line1": "12 Analytical Way",
        "city": "London",
        "postalCode": "N1 9GU",
        "country": "GB"
    })
}

/// A provider `PAYMENT.CAPTURE.*` webhook body.
#[must_use]
pub fn capture_event(event_type: &str, external_order_id: &str, capture_id: &str) -> Value {
    serde_json::json!({
        "id": format!("WH-{capture_id}"),
        "event_type": event_type,
        "resource": {
            "id": capture_id,
            "status": "COMPLETED",
            "supplementary_data": { "related_ids": { "order_id": external_order_id } }
        }
    })
}
