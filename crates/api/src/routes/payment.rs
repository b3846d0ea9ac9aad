//! Gateway payment routes: create, capture and the provider webhook.

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
};
use mercato_core::{Order, ShippingAddress};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{info, instrument};

use crate::error::{AppError, Result};
use crate::extract::Json;
use crate::gateway::webhook::{self, SIGNATURE_HEADER, TIMESTAMP_HEADER, WebhookError};
use crate::middleware::RequireUser;
use crate::services::lifecycle::{OrderItemInput, PaymentSession, WebhookOutcome};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePayment {
    pub items: Vec<OrderItemInput>,
    #[serde(alias = "address")]
    pub shipping_address: ShippingAddress,
}

/// `POST /orders/payment/create`
#[instrument(skip(state, user, body))]
pub async fn create(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(body): Json<CreatePayment>,
) -> Result<Json<PaymentSession>> {
    let session = state
        .coordinator()
        .create_payment(&user, body.items, body.shipping_address)
        .await?;
    Ok(Json(session))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapturePayment {
    pub external_order_id: String,
}

/// `POST /orders/payment/capture`
#[instrument(skip(state, user))]
pub async fn capture(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(body): Json<CapturePayment>,
) -> Result<Json<Order>> {
    if body.external_order_id.trim().is_empty() {
        return Err(AppError::BadRequest(
            "externalOrderId is required".to_string(),
        ));
    }
    let order = state
        .coordinator()
        .capture_payment(&user, body.external_order_id.trim())
        .await?;
    Ok(Json(order))
}

/// `POST /orders/payment/webhook`
///
/// No session auth: the body must carry a valid signature. Unknown orders
/// and unhandled event types are acknowledged with 200 so the provider does
/// not keep redelivering them.
#[instrument(skip_all)]
pub async fn webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>)> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .ok_or_else(|| WebhookError::InvalidSignature(format!("missing {name} header")))
    };
    let timestamp = header(TIMESTAMP_HEADER)?;
    let signature = header(SIGNATURE_HEADER)?;
    let body = std::str::from_utf8(&body)
        .map_err(|_| WebhookError::InvalidPayload("body is not UTF-8".to_string()))?;

    webhook::verify_signature(
        state.config().gateway.webhook_secret.as_ref(),
        timestamp,
        body,
        signature,
        chrono::Utc::now().timestamp(),
    )?;
    let event = webhook::parse_event(body)?;
    let event_id = event.id.clone();

    let outcome = state.coordinator().apply_webhook(event).await?;
    let result = match &outcome {
        WebhookOutcome::Applied(applied) if applied.changed() => "applied",
        WebhookOutcome::Applied(_) => "already_applied",
        WebhookOutcome::Ignored => "ignored",
        WebhookOutcome::UnknownOrder => "unknown_order",
        WebhookOutcome::Unconfirmed => "unconfirmed",
    };
    info!(%event_id, result, "Webhook processed");

    Ok((StatusCode::OK, Json(json!({ "received": true, "result": result }))))
}
