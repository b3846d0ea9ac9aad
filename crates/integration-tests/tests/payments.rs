//! Gateway payments through the HTTP router: authorization, capture and
//! signed webhooks.

use axum::http::{Method, StatusCode};
use mercato_api::gateway::{GatewayError, PaymentState};
use mercato_core::{Cart, ProductId};
use mercato_integration_tests::{
    CUSTOMER_TOKEN, OTHER_CUSTOMER_TOKEN, TestContext, WEBHOOK_SECRET, capture_event,
    checkout_items, shipping_address,
};
use chrono::Utc;
use serde_json::{Value, json};

/// Create a gateway order and return the payment session body.
async fn create_payment(ctx: &TestContext) -> Value {
    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders/payment/create",
            Some(CUSTOMER_TOKEN),
            Some(json!({ "items": checkout_items(), "shippingAddress": shipping_address() })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body
}

async fn capture(ctx: &TestContext, token: &str, external_order_id: &Value) -> (StatusCode, Value) {
    ctx.call(
        Method::POST,
        "/orders/payment/capture",
        Some(token),
        Some(json!({ "externalOrderId": external_order_id })),
    )
    .await
}

async fn fill_cart(ctx: &TestContext) {
    let mut cart = Cart::new();
    cart.add(ProductId::new(2), Some("blue"), 1);
    let (status, _) = ctx
        .call(
            Method::PUT,
            "/cart",
            Some(CUSTOMER_TOKEN),
            Some(serde_json::to_value(&cart).expect("cart json")),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn test_create_payment_returns_approval_links() {
    let ctx = TestContext::new().await;

    let session = create_payment(&ctx).await;

    let expected = format!("EXT-{}", session["orderId"]);
    assert_eq!(session["externalOrderId"], expected.as_str());
    assert_eq!(session["approvalLinks"][0]["rel"], "payer-action");
    assert_eq!(ctx.gateway.creates(), 1);
}

#[tokio::test]
async fn test_gateway_rejection_suggests_cash_on_delivery() {
    let ctx = TestContext::new().await;
    ctx.gateway.fail_next_create(GatewayError::Rejected {
        issue: "CURRENCY_NOT_SUPPORTED".to_string(),
        message: "Currency is not supported".to_string(),
    });

    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders/payment/create",
            Some(CUSTOMER_TOKEN),
            Some(json!({ "items": checkout_items(), "shippingAddress": shipping_address() })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"].as_str().expect("error message");
    assert!(message.contains("cash on delivery"), "{message}");
    assert!(!message.contains("CURRENCY_NOT_SUPPORTED"));

    let (_, mine) = ctx.call(Method::GET, "/orders/mine", Some(CUSTOMER_TOKEN), None).await;
    let orders = mine.as_array().expect("orders");
    assert_eq!(orders.len(), 1);
    assert_eq!(orders[0]["paymentStatus"], "pending");
    assert!(orders[0]["externalOrderId"].is_null());
}

#[tokio::test]
async fn test_gateway_outage_is_bad_gateway() {
    let ctx = TestContext::new().await;
    ctx.gateway
        .fail_next_create(GatewayError::Unavailable("connect timeout".to_string()));

    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders/payment/create",
            Some(CUSTOMER_TOKEN),
            Some(json!({ "items": checkout_items(), "shippingAddress": shipping_address() })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert!(!body["error"].as_str().unwrap_or_default().contains("timeout"));
}

#[tokio::test]
async fn test_capture_completes_payment_once() {
    let ctx = TestContext::new().await;
    fill_cart(&ctx).await;
    let session = create_payment(&ctx).await;
    let product_before = ctx.store.product_performance(ProductId::new(1)).await;

    let (status, first) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;
    assert_eq!(status, StatusCode::OK, "{first}");
    assert_eq!(first["paymentStatus"], "completed");
    let expected_capture = format!("CAP-{}", session["externalOrderId"].as_str().expect("id"));
    assert_eq!(first["externalCaptureId"], expected_capture.as_str());

    let (status, second) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["paymentStatus"], "completed");

    assert_eq!(ctx.gateway.captures(), 1);
    assert_eq!(ctx.store.cart_clear_count(ctx.customer.id).await, 1);
    assert_eq!(ctx.store.purchases().await.len(), 1);
    let product_after = ctx.store.product_performance(ProductId::new(1)).await;
    assert_eq!(product_after.units_sold, product_before.units_sold + 2);
}

#[tokio::test]
async fn test_failed_capture_leaves_order_pending() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    ctx.gateway.set_capture_status("DECLINED");

    let (status, body) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().is_some_and(|m| m.contains("declined")));
    let (_, order) = ctx
        .call(
            Method::GET,
            &format!("/orders/{}", session["orderId"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(order["paymentStatus"], "pending");
}

#[tokio::test]
async fn test_capture_after_cancel_is_conflict_without_gateway_call() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let (status, _) = ctx
        .call(
            Method::POST,
            &format!("/orders/{}/cancel", session["orderId"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;

    assert_eq!(status, StatusCode::CONFLICT, "{body}");
    assert!(body["error"].is_string());
    assert_eq!(ctx.gateway.captures(), 0);
    assert!(ctx.store.purchases().await.is_empty());
}

#[tokio::test]
async fn test_capture_without_external_id_is_bad_request_with_json_error() {
    let ctx = TestContext::new().await;

    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders/payment/capture",
            Some(CUSTOMER_TOKEN),
            Some(json!({})),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{body}");
    assert_eq!(ctx.gateway.captures(), 0);
}

#[tokio::test]
async fn test_capture_of_another_users_order_is_not_found() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;

    let (status, _) = capture(&ctx, OTHER_CUSTOMER_TOKEN, &session["externalOrderId"]).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(ctx.gateway.captures(), 0);
}

#[tokio::test]
async fn test_webhook_after_capture_is_a_no_op() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();
    let (status, _) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;
    assert_eq!(status, StatusCode::OK);

    let event = capture_event(
        "PAYMENT.CAPTURE.COMPLETED",
        &external_order_id,
        &format!("CAP-{external_order_id}"),
    );
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], "already_applied");
    assert_eq!(ctx.store.purchases().await.len(), 1);
    assert_eq!(ctx.gateway.queries(), 0);
}

#[tokio::test]
async fn test_confirmed_webhook_completes_payment() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();
    ctx.gateway.set_state(PaymentState::Captured {
        capture_id: "CAP-WEBHOOK".to_string(),
    });

    let event = capture_event("PAYMENT.CAPTURE.COMPLETED", &external_order_id, "CAP-WEBHOOK");
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], "applied");
    let (_, order) = ctx
        .call(
            Method::GET,
            &format!("/orders/{}", session["orderId"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(order["paymentStatus"], "completed");
    assert_eq!(order["externalCaptureId"], "CAP-WEBHOOK");
}

#[tokio::test]
async fn test_unconfirmed_webhook_changes_nothing() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();

    let event = capture_event("PAYMENT.CAPTURE.COMPLETED", &external_order_id, "CAP-FORGED");
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "unconfirmed");
    assert!(ctx.store.purchases().await.is_empty());
}

#[tokio::test]
async fn test_webhook_with_bad_signature_is_rejected() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();

    let event = capture_event("PAYMENT.CAPTURE.COMPLETED", &external_order_id, "CAP-1");
    let (status, _) = ctx.webhook(&event, "not-the-webhook-secret").await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(ctx.gateway.queries(), 0);
}

#[tokio::test]
async fn test_webhook_signed_outside_age_window_is_rejected() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();
    let event = capture_event("PAYMENT.CAPTURE.COMPLETED", &external_order_id, "CAP-1");

    let stale = (Utc::now().timestamp() - 600).to_string();
    for timestamp in [stale.as_str(), "-9223372036854775808", "9223372036854775807"] {
        let (status, body) = ctx.webhook_at(&event, WEBHOOK_SECRET, timestamp).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED, "{timestamp}: {body}");
    }
    assert_eq!(ctx.gateway.queries(), 0);
}

#[tokio::test]
async fn test_unknown_and_unhandled_webhooks_are_acknowledged() {
    let ctx = TestContext::new().await;

    let event = capture_event("PAYMENT.CAPTURE.COMPLETED", "EXT-NOPE", "CAP-NOPE");
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "unknown_order");

    let event = json!({ "id": "WH-2", "event_type": "CHECKOUT.ORDER.APPROVED", "resource": {} });
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"], "ignored");
}

#[tokio::test]
async fn test_refund_webhook_marks_order_refunded() {
    let ctx = TestContext::new().await;
    let session = create_payment(&ctx).await;
    let external_order_id = session["externalOrderId"].as_str().expect("id").to_string();
    let (status, _) = capture(&ctx, CUSTOMER_TOKEN, &session["externalOrderId"]).await;
    assert_eq!(status, StatusCode::OK);
    let capture_id = format!("CAP-{external_order_id}");

    let event = json!({
        "id": "WH-REFUND",
        "event_type": "PAYMENT.CAPTURE.REFUNDED",
        "resource": {
            "id": "REFUND-1",
            "status": "COMPLETED",
            "links": [{
                "href": format!("https://api.gateway.test/v2/payments/captures/{capture_id}"),
                "rel": "up"
            }]
        }
    });
    let (status, body) = ctx.webhook(&event, WEBHOOK_SECRET).await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["result"], "applied");
    let (_, order) = ctx
        .call(
            Method::GET,
            &format!("/orders/{}", session["orderId"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(order["paymentStatus"], "refunded");
}
