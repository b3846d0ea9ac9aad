//! Order placement, listing and status transitions through the HTTP router.

use axum::body::Body;
use axum::http::{Method, Request, StatusCode, header};
use mercato_core::{Cart, ProductId};
use mercato_integration_tests::{
    ADMIN_TOKEN, CUSTOMER_TOKEN, OTHER_CUSTOMER_TOKEN, TestContext, checkout_items,
    shipping_address,
};
use serde_json::{Value, json};

async fn place_cod(ctx: &TestContext, token: &str) -> Value {
    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders",
            Some(token),
            Some(json!({
                "items": checkout_items(),
                "shippingAddress": shipping_address(),
                "paymentMethod": "cod"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    body["order"].clone()
}

async fn set_status(ctx: &TestContext, order_id: &Value, status: &str) -> (StatusCode, Value) {
    ctx.call(
        Method::PUT,
        "/orders/status",
        Some(ADMIN_TOKEN),
        Some(json!({ "orderId": order_id, "status": status })),
    )
    .await
}

#[tokio::test]
async fn test_cod_order_is_priced_from_catalog() {
    let ctx = TestContext::new().await;

    let order = place_cod(&ctx, CUSTOMER_TOKEN).await;

    assert_eq!(order["subtotal"], "13.00");
    assert_eq!(order["shippingFee"], "10.00");
    assert_eq!(order["total"], "23.00");
    assert_eq!(order["paymentMethod"], "cod");
    assert_eq!(order["paymentStatus"], "pending");
    assert_eq!(order["orderStatus"], "placed");
    assert_eq!(order["items"][0]["name"], "Item A");
    assert_eq!(order["items"][1]["variant"], "blue");
    assert!(order["externalOrderId"].is_null());
    assert_eq!(ctx.gateway.creates(), 0);
}

#[tokio::test]
async fn test_client_prices_are_ignored() {
    let ctx = TestContext::new().await;

    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders",
            Some(CUSTOMER_TOKEN),
            Some(json!({
                "items": [{ "productId": 1, "quantity": 1, "price": "0.01" }],
                "shippingAddress": shipping_address(),
                "paymentMethod": "cod"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["order"]["subtotal"], "5.00");
}

#[tokio::test]
async fn test_inactive_product_is_rejected() {
    let ctx = TestContext::new().await;

    let (status, _) = ctx
        .call(
            Method::POST,
            "/orders",
            Some(CUSTOMER_TOKEN),
            Some(json!({
                "items": [{ "productId": 3, "quantity": 1 }],
                "shippingAddress": shipping_address(),
                "paymentMethod": "cod"
            })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_cod_order_clears_cart() {
    let ctx = TestContext::new().await;
    let mut cart = Cart::new();
    cart.add(ProductId::new(1), None, 2);
    let (status, _) = ctx
        .call(
            Method::PUT,
            "/cart",
            Some(CUSTOMER_TOKEN),
            Some(serde_json::to_value(&cart).expect("cart json")),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    place_cod(&ctx, CUSTOMER_TOKEN).await;

    let (status, body) = ctx.call(Method::GET, "/cart", Some(CUSTOMER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({}));
    assert_eq!(ctx.store.cart_clear_count(ctx.customer.id).await, 1);
}

#[tokio::test]
async fn test_customer_sees_only_own_orders() {
    let ctx = TestContext::new().await;
    let order = place_cod(&ctx, CUSTOMER_TOKEN).await;
    let uri = format!("/orders/{}", order["id"]);

    let (status, _) = ctx.call(Method::GET, &uri, Some(OTHER_CUSTOMER_TOKEN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = ctx.call(Method::GET, &uri, Some(CUSTOMER_TOKEN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], order["id"]);

    let (_, mine) = ctx
        .call(Method::GET, "/orders/mine", Some(OTHER_CUSTOMER_TOKEN), None)
        .await;
    assert_eq!(mine, json!([]));
}

#[tokio::test]
async fn test_status_moves_forward_and_terminal_is_final() {
    let ctx = TestContext::new().await;
    let order = place_cod(&ctx, CUSTOMER_TOKEN).await;

    for next in ["packing", "shipped", "out_for_delivery", "delivered"] {
        let (status, body) = set_status(&ctx, &order["id"], next).await;
        assert_eq!(status, StatusCode::OK, "{next}: {body}");
        assert_eq!(body["orderStatus"], next);
    }

    let (status, body) = set_status(&ctx, &order["id"], "packing").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(
        body["error"]
            .as_str()
            .is_some_and(|m| m.contains("delivered")),
        "{body}"
    );
}

#[tokio::test]
async fn test_backward_move_is_rejected() {
    let ctx = TestContext::new().await;
    let order = place_cod(&ctx, CUSTOMER_TOKEN).await;

    let (status, _) = set_status(&ctx, &order["id"], "shipped").await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = set_status(&ctx, &order["id"], "packing").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_gateway_order_cannot_be_delivered_while_pending() {
    let ctx = TestContext::new().await;
    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders/payment/create",
            Some(CUSTOMER_TOKEN),
            Some(json!({ "items": checkout_items(), "address": shipping_address() })),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");

    let (status, body) = set_status(&ctx, &body["orderId"], "delivered").await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "cannot mark delivered while payment pending");
}

#[tokio::test]
async fn test_customer_cancel_only_before_shipping() {
    let ctx = TestContext::new().await;
    let first = place_cod(&ctx, CUSTOMER_TOKEN).await;
    let second = place_cod(&ctx, CUSTOMER_TOKEN).await;

    let (status, body) = ctx
        .call(
            Method::POST,
            &format!("/orders/{}/cancel", first["id"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["orderStatus"], "cancelled");

    set_status(&ctx, &second["id"], "shipped").await;
    let (status, _) = ctx
        .call(
            Method::POST,
            &format!("/orders/{}/cancel", second["id"]),
            Some(CUSTOMER_TOKEN),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_admin_list_filters_and_stats() {
    let ctx = TestContext::new().await;
    place_cod(&ctx, CUSTOMER_TOKEN).await;
    let shipped = place_cod(&ctx, CUSTOMER_TOKEN).await;
    place_cod(&ctx, OTHER_CUSTOMER_TOKEN).await;
    set_status(&ctx, &shipped["id"], "shipped").await;

    let (status, body) = ctx
        .call(Method::GET, "/orders?limit=2", Some(ADMIN_TOKEN), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["total"], 3);
    assert_eq!(body["totalPages"], 2);
    assert_eq!(body["items"].as_array().map(Vec::len), Some(2));
    assert_eq!(body["stats"]["orderCount"], 3);
    assert_eq!(body["stats"]["pendingPayments"], 3);

    let (_, body) = ctx
        .call(Method::GET, "/orders?status=shipped", Some(ADMIN_TOKEN), None)
        .await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["id"], shipped["id"]);
    assert_eq!(body["items"][0]["userEmail"], "ada@example.test");

    let (_, body) = ctx
        .call(Method::GET, "/orders?email=eve", Some(ADMIN_TOKEN), None)
        .await;
    assert_eq!(body["total"], 1);
    assert_eq!(body["items"][0]["userEmail"], "eve@example.test");
}

#[tokio::test]
async fn test_admin_list_rejects_inverted_date_range() {
    let ctx = TestContext::new().await;

    let (status, _) = ctx
        .call(
            Method::GET,
            "/orders?startDate=2025-03-02&endDate=2025-03-01",
            Some(ADMIN_TOKEN),
            None,
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_soft_deleted_order_leaves_default_listing() {
    let ctx = TestContext::new().await;
    let order = place_cod(&ctx, CUSTOMER_TOKEN).await;

    let (status, body) = ctx
        .call(
            Method::DELETE,
            &format!("/orders/{}", order["id"]),
            Some(ADMIN_TOKEN),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isActive"], false);

    let (_, body) = ctx.call(Method::GET, "/orders", Some(ADMIN_TOKEN), None).await;
    assert_eq!(body["total"], 0);
    let (_, body) = ctx
        .call(
            Method::GET,
            "/orders?includeInactive=true",
            Some(ADMIN_TOKEN),
            None,
        )
        .await;
    assert_eq!(body["total"], 1);
}

#[tokio::test]
async fn test_order_without_address_is_bad_request_with_json_error() {
    let ctx = TestContext::new().await;

    let (status, body) = ctx
        .call(
            Method::POST,
            "/orders",
            Some(CUSTOMER_TOKEN),
            Some(json!({ "items": checkout_items(), "paymentMethod": "cod" })),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    let message = body["error"].as_str().expect("JSON error body");
    assert!(message.contains("shippingAddress"), "{message}");
    assert!(ctx.store.purchases().await.is_empty());
}

#[tokio::test]
async fn test_unparseable_order_body_is_bad_request_with_json_error() {
    let ctx = TestContext::new().await;
    let request = Request::builder()
        .method(Method::POST)
        .uri("/orders")
        .header(header::AUTHORIZATION, format!("Bearer {CUSTOMER_TOKEN}"))
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(r#"{"items": ["#))
        .expect("request");

    let (status, body) = ctx.send(request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{body}");
}

#[tokio::test]
async fn test_non_numeric_order_id_is_bad_request_with_json_error() {
    let ctx = TestContext::new().await;

    let (status, body) = ctx
        .call(Method::GET, "/orders/latest", Some(CUSTOMER_TOKEN), None)
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].is_string(), "{body}");
}
