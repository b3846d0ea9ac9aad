//! Records the API reads from and writes to the stores, beyond the core
//! order types.

use chrono::{DateTime, Utc};
use mercato_core::{Email, Money, OrderId, ProductId, Role, UserId};
use serde::Serialize;

/// A catalog product, as needed to price an order server-side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Product {
    pub id: ProductId,
    pub name: String,
    pub price: Money,
    /// Inactive products cannot be ordered.
    pub is_active: bool,
}

/// The user behind an API session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionUser {
    pub id: UserId,
    pub email: Email,
    pub role: Role,
}

impl SessionUser {
    /// Whether this user belongs to the admin group.
    #[must_use]
    pub fn is_admin(&self) -> bool {
        self.role == Role::Admin
    }
}

/// A stored session looked up by token hash.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub user: SessionUser,
    pub expires_at: DateTime<Utc>,
}

/// A tracked purchase (analytics event).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurchaseEvent {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub revenue: Money,
    pub units: u64,
    pub occurred_at: DateTime<Utc>,
}

/// Running sales counters for a product.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ProductPerformance {
    pub units_sold: u64,
    pub revenue: Money,
    pub orders: u64,
}
