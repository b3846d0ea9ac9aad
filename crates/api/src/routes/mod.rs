//! HTTP route handlers.
//!
//! # Route Structure
//!
//! ```text
//! # Orders
//! POST   /orders                   - Place an order (cod or gateway)
//! GET    /orders                   - Admin list with filters and stats
//! GET    /orders/mine              - Caller's own orders
//! GET    /orders/{id}              - One order (owner or admin)
//! DELETE /orders/{id}              - Soft delete (admin)
//! POST   /orders/{id}/cancel       - Cancel (owner before shipping, or admin)
//! PUT    /orders/status            - Change order status (admin)
//! PUT    /orders/payment-status    - Change payment status (admin)
//!
//! # Payment
//! POST   /orders/payment/create    - Place a gateway order and authorize
//! POST   /orders/payment/capture   - Capture an approved payment
//! POST   /orders/payment/webhook   - Provider webhook (signed, no session)
//!
//! # Cart
//! GET    /cart                     - Current cart
//! PUT    /cart                     - Replace cart
//!
//! # Live updates
//! GET    /ws                       - WebSocket event stream
//! ```

pub mod cart;
pub mod orders;
pub mod payment;
pub mod ws;

use axum::{
    Router,
    routing::{get, post, put},
};

use crate::state::AppState;

/// Create the order routes router.
pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/", post(orders::place).get(orders::list))
        .route("/mine", get(orders::mine))
        .route("/status", put(orders::update_status))
        .route("/payment-status", put(orders::update_payment_status))
        .route("/{id}", get(orders::show).delete(orders::soft_delete))
        .route("/{id}/cancel", post(orders::cancel))
        .route("/payment/create", post(payment::create))
        .route("/payment/capture", post(payment::capture))
        .route("/payment/webhook", post(payment::webhook))
}

/// Create the cart routes router.
pub fn cart_routes() -> Router<AppState> {
    Router::new().route("/", get(cart::show).put(cart::replace))
}

/// Create all API routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .nest("/orders", order_routes())
        .nest("/cart", cart_routes())
        .route("/ws", get(ws::connect))
}
