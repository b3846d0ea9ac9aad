//! Provider webhook verification and parsing.
//!
//! Webhooks are trusted only after an HMAC-SHA256 signature check:
//!
//! - `X-Gateway-Request-Timestamp` - Unix seconds when the event was sent
//! - `X-Gateway-Signature` - `v1=<hex hmac>` over `v1:{timestamp}:{body}`
//!
//! Requests older than five minutes are rejected to prevent replay.

use hmac::{Hmac, Mac};
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, instrument};

/// Header carrying the signing timestamp.
pub const TIMESTAMP_HEADER: &str = "x-gateway-request-timestamp";

/// Header carrying the signature.
pub const SIGNATURE_HEADER: &str = "x-gateway-signature";

/// Maximum age of a signed request, in seconds.
const MAX_SIGNATURE_AGE_SECS: u64 = 300;

/// Errors that can occur while handling a webhook.
#[derive(Debug, Error)]
pub enum WebhookError {
    /// No webhook secret is configured, so nothing can be verified.
    #[error("webhook verification is not configured")]
    NotConfigured,

    /// Signature missing, stale or wrong.
    #[error("invalid webhook signature: {0}")]
    InvalidSignature(String),

    /// Body is not a provider event.
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
}

/// Verify a webhook signature against the shared secret.
///
/// # Arguments
///
/// * `secret` - Shared webhook secret (`None` rejects every request)
/// * `timestamp` - The `X-Gateway-Request-Timestamp` header value
/// * `body` - The raw request body
/// * `signature` - The `X-Gateway-Signature` header value
/// * `now` - Current Unix time in seconds
///
/// # Errors
///
/// Returns `WebhookError::NotConfigured` without a secret and
/// `WebhookError::InvalidSignature` if verification fails.
#[instrument(skip(secret, body, signature))]
pub fn verify_signature(
    secret: Option<&SecretString>,
    timestamp: &str,
    body: &str,
    signature: &str,
    now: i64,
) -> Result<(), WebhookError> {
    let secret = secret.ok_or(WebhookError::NotConfigured)?;

    let ts: i64 = timestamp
        .parse()
        .map_err(|_| WebhookError::InvalidSignature("Invalid timestamp".to_string()))?;

    if now.abs_diff(ts) > MAX_SIGNATURE_AGE_SECS {
        return Err(WebhookError::InvalidSignature(
            "Request timestamp too old".to_string(),
        ));
    }

    let provided = signature
        .strip_prefix("v1=")
        .and_then(|hex_sig| hex::decode(hex_sig).ok())
        .ok_or_else(|| WebhookError::InvalidSignature("Malformed signature".to_string()))?;

    signature_mac(secret, timestamp, body)?
        .verify_slice(&provided)
        .map_err(|_| WebhookError::InvalidSignature("Signature mismatch".to_string()))?;

    debug!("Webhook signature verified");
    Ok(())
}

/// Compute the `v1=` signature for a body.
///
/// # Errors
///
/// Returns `WebhookError::InvalidSignature` if the key cannot be used.
pub fn sign(secret: &SecretString, timestamp: &str, body: &str) -> Result<String, WebhookError> {
    let mac = signature_mac(secret, timestamp, body)?;
    Ok(format!("v1={}", hex::encode(mac.finalize().into_bytes())))
}

/// HMAC over `v1:{timestamp}:{body}`, ready to finalize or verify.
fn signature_mac(
    secret: &SecretString,
    timestamp: &str,
    body: &str,
) -> Result<Hmac<Sha256>, WebhookError> {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret.expose_secret().as_bytes())
        .map_err(|e| WebhookError::InvalidSignature(e.to_string()))?;
    mac.update(format!("v1:{timestamp}:{body}").as_bytes());
    Ok(mac)
}

// =============================================================================
// Events
// =============================================================================

/// A verified provider event, reduced to what the coordinator needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookEvent {
    /// Provider event id, for logs.
    pub id: String,
    pub kind: WebhookEventKind,
}

/// The payment events the coordinator reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WebhookEventKind {
    /// `PAYMENT.CAPTURE.COMPLETED`
    CaptureCompleted {
        external_order_id: String,
        capture_id: String,
    },
    /// `PAYMENT.CAPTURE.DENIED`
    CaptureDenied {
        external_order_id: String,
        capture_id: String,
    },
    /// `PAYMENT.CAPTURE.REFUNDED`. The resource is the refund, so only the
    /// capture id is known.
    CaptureRefunded { capture_id: String },
    /// Any other event type.
    Ignored { event_type: String },
}

#[derive(Deserialize)]
struct RawEvent {
    id: String,
    event_type: String,
    #[serde(default)]
    resource: serde_json::Value,
}

#[derive(Deserialize)]
struct CaptureResource {
    id: String,
    supplementary_data: SupplementaryData,
}

#[derive(Deserialize)]
struct SupplementaryData {
    related_ids: RelatedIds,
}

#[derive(Deserialize)]
struct RelatedIds {
    order_id: String,
}

#[derive(Deserialize)]
struct RefundResource {
    #[serde(default)]
    links: Vec<ResourceLink>,
}

#[derive(Deserialize)]
struct ResourceLink {
    href: String,
    rel: String,
}

/// Parse a verified webhook body.
///
/// # Errors
///
/// Returns `WebhookError::InvalidPayload` if the body is not JSON, or a
/// handled event type lacks the ids it needs.
pub fn parse_event(body: &str) -> Result<WebhookEvent, WebhookError> {
    let raw: RawEvent =
        serde_json::from_str(body).map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

    let kind = match raw.event_type.as_str() {
        "PAYMENT.CAPTURE.COMPLETED" | "PAYMENT.CAPTURE.DENIED" => {
            let capture: CaptureResource = serde_json::from_value(raw.resource)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            let external_order_id = capture.supplementary_data.related_ids.order_id;
            if raw.event_type == "PAYMENT.CAPTURE.COMPLETED" {
                WebhookEventKind::CaptureCompleted {
                    external_order_id,
                    capture_id: capture.id,
                }
            } else {
                WebhookEventKind::CaptureDenied {
                    external_order_id,
                    capture_id: capture.id,
                }
            }
        }
        "PAYMENT.CAPTURE.REFUNDED" => {
            let refund: RefundResource = serde_json::from_value(raw.resource)
                .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;
            let capture_id = refund
                .links
                .iter()
                .find(|link| link.rel == "up")
                .and_then(|link| link.href.trim_end_matches('/').rsplit('/').next())
                .filter(|id| !id.is_empty())
                .ok_or_else(|| {
                    WebhookError::InvalidPayload("refund has no capture link".to_string())
                })?;
            WebhookEventKind::CaptureRefunded {
                capture_id: capture_id.to_string(),
            }
        }
        _ => WebhookEventKind::Ignored {
            event_type: raw.event_type,
        },
    };

    Ok(WebhookEvent { id: raw.id, kind })
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    const NOW: i64 = 1_760_000_000;

    fn secret() -> SecretString {
        SecretString::from("whsec_test_signing_secret")
    }

    #[test]
    fn test_valid_signature() {
        let body = r#"{"id":"WH-1"}"#;
        let ts = NOW.to_string();
        let signature = sign(&secret(), &ts, body).unwrap();
        assert!(signature.starts_with("v1="));
        assert!(verify_signature(Some(&secret()), &ts, body, &signature, NOW).is_ok());
    }

    #[test]
    fn test_missing_secret_rejects_everything() {
        let ts = NOW.to_string();
        let signature = sign(&secret(), &ts, "{}").unwrap();
        assert!(matches!(
            verify_signature(None, &ts, "{}", &signature, NOW),
            Err(WebhookError::NotConfigured)
        ));
    }

    #[test]
    fn test_tampered_body_rejected() {
        let ts = NOW.to_string();
        let signature = sign(&secret(), &ts, r#"{"amount":"1.00"}"#).unwrap();
        let result = verify_signature(Some(&secret()), &ts, r#"{"amount":"9.00"}"#, &signature, NOW);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_old_timestamp_rejected() {
        let ts = (NOW - 301).to_string();
        let signature = sign(&secret(), &ts, "{}").unwrap();
        let err = verify_signature(Some(&secret()), &ts, "{}", &signature, NOW).unwrap_err();
        assert!(err.to_string().contains("too old"));
    }

    #[test]
    fn test_timestamp_at_window_edge_accepted() {
        for ts in [NOW - 300, NOW + 300] {
            let ts = ts.to_string();
            let signature = sign(&secret(), &ts, "{}").unwrap();
            assert!(verify_signature(Some(&secret()), &ts, "{}", &signature, NOW).is_ok());
        }
    }

    #[test]
    fn test_timestamp_past_window_edge_rejected() {
        let ts = (NOW + 301).to_string();
        let signature = sign(&secret(), &ts, "{}").unwrap();
        let result = verify_signature(Some(&secret()), &ts, "{}", &signature, NOW);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_extreme_timestamps_rejected() {
        for ts in [i64::MIN, i64::MAX] {
            let ts = ts.to_string();
            let signature = sign(&secret(), &ts, "{}").unwrap();
            let err = verify_signature(Some(&secret()), &ts, "{}", &signature, NOW).unwrap_err();
            assert!(err.to_string().contains("too old"), "{ts}: {err}");
        }
    }

    #[test]
    fn test_malformed_signature_rejected() {
        let ts = NOW.to_string();
        let signature = sign(&secret(), &ts, "{}").unwrap();
        let mut truncated = signature.clone();
        truncated.truncate(signature.len() - 2);
        for bad in [
            signature.trim_start_matches("v1="),
            "v1=not-hex",
            "v1=",
            truncated.as_str(),
        ] {
            let result = verify_signature(Some(&secret()), &ts, "{}", bad, NOW);
            assert!(
                matches!(result, Err(WebhookError::InvalidSignature(_))),
                "{bad}"
            );
        }
    }

    #[test]
    fn test_invalid_timestamp_rejected() {
        let result = verify_signature(Some(&secret()), "yesterday", "{}", "v1=00", NOW);
        assert!(matches!(result, Err(WebhookError::InvalidSignature(_))));
    }

    #[test]
    fn test_parse_capture_completed() {
        let body = json!({
            "id": "WH-58D329510W468432D",
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "42311647XV020574X",
                "status": "COMPLETED",
                "supplementary_data": { "related_ids": { "order_id": "5O190127TN364715T" } }
            }
        })
        .to_string();

        let event = parse_event(&body).unwrap();
        assert_eq!(event.id, "WH-58D329510W468432D");
        assert_eq!(
            event.kind,
            WebhookEventKind::CaptureCompleted {
                external_order_id: "5O190127TN364715T".to_string(),
                capture_id: "42311647XV020574X".to_string(),
            }
        );
    }

    #[test]
    fn test_parse_refund_uses_up_link() {
        let body = json!({
            "id": "WH-2",
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "1Y107995YT783435V",
                "links": [
                    { "href": "https://api.sandbox.test/v2/payments/refunds/1Y107995YT783435V", "rel": "self" },
                    { "href": "https://api.sandbox.test/v2/payments/captures/0JF852973C016714D", "rel": "up" }
                ]
            }
        })
        .to_string();

        assert_eq!(
            parse_event(&body).unwrap().kind,
            WebhookEventKind::CaptureRefunded {
                capture_id: "0JF852973C016714D".to_string()
            }
        );
    }

    #[test]
    fn test_parse_unhandled_event_is_ignored() {
        let body = json!({
            "id": "WH-3",
            "event_type": "CHECKOUT.ORDER.APPROVED",
            "resource": { "id": "X" }
        })
        .to_string();
        assert_eq!(
            parse_event(&body).unwrap().kind,
            WebhookEventKind::Ignored {
                event_type: "CHECKOUT.ORDER.APPROVED".to_string()
            }
        );
    }

    #[test]
    fn test_parse_capture_without_order_id_fails() {
        let body = json!({
            "id": "WH-4",
            "event_type": "PAYMENT.CAPTURE.DENIED",
            "resource": { "id": "X" }
        })
        .to_string();
        assert!(matches!(
            parse_event(&body),
            Err(WebhookError::InvalidPayload(_))
        ));
    }
}
