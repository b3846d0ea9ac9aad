//! Persistence for orders, carts, catalog lookups, sessions and analytics.
//!
//! # Backends
//!
//! - [`PgStore`] - `PostgreSQL` via sqlx (production)
//! - [`MemoryStore`] - process-local maps behind a `tokio` lock (development,
//!   demos and tests; selected with `MERCATO_DATABASE_URL=memory://`)
//!
//! Both implement every store trait. Handlers and services only ever see the
//! traits, bundled in [`Stores`].
//!
//! ## Tables
//!
//! - `users` - Accounts with role and cart (JSONB)
//! - `api_sessions` - Bearer token hashes
//! - `products` - Catalog names and prices
//! - `orders` - Orders with item/address snapshots (JSONB)
//! - `analytics_events` - Tracked purchases
//! - `product_performance` - Per-product sales counters
//!
//! # Migrations
//!
//! Migrations are stored in `crates/api/migrations/` and run via:
//! ```bash
//! cargo run -p mercato-cli -- migrate
//! ```
//!
//! # Status updates
//!
//! Status columns are only ever changed with conditional updates
//! (`... WHERE payment_status = 'pending'`). The `compare_and_set_*` methods
//! return `None` when the row no longer holds the expected value, which is
//! how concurrent capture and webhook reconciliation are told apart.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::lifecycle::{check_order_transition, check_payment_transition};
use mercato_core::{
    Cart, Email, LineItem, Money, NewOrder, Order, OrderId, OrderStatus, OrderValidationError,
    PaymentMethod, PaymentStatus, ProductId, Role, TransitionError, UserId,
};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use sqlx::postgres::PgPoolOptions;
use thiserror::Error;

use crate::models::{Product, SessionRecord, SessionUser};

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Largest page an order listing will return.
pub const MAX_PAGE_SIZE: u32 = 100;

/// Errors that can occur during repository operations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// Database error from sqlx.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Data in the database is corrupted or invalid.
    #[error("data corruption: {0}")]
    DataCorruption(String),

    /// Requested entity was not found.
    #[error("not found")]
    NotFound,

    /// Constraint violation or lost conditional update.
    #[error("constraint violation: {0}")]
    Conflict(String),

    /// The order is missing required data.
    #[error("invalid order: {0}")]
    Validation(#[from] OrderValidationError),

    /// The status change is not in the transition table.
    #[error("invalid transition: {0}")]
    InvalidTransition(#[from] TransitionError),
}

// =============================================================================
// Listing
// =============================================================================

/// Filter for admin order listings.
///
/// Every field narrows the result. `email` is a case-insensitive fragment of
/// the owning user's email and is applied after the rows are fetched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OrderFilter {
    pub order_status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub user_id: Option<UserId>,
    /// Inclusive lower bound on `created_at`.
    pub created_from: Option<DateTime<Utc>>,
    /// Exclusive upper bound on `created_at`.
    pub created_to: Option<DateTime<Utc>>,
    pub is_active: Option<bool>,
    pub email: Option<String>,
}

impl OrderFilter {
    /// Whether an order passes every column filter (not the email fragment).
    #[must_use]
    pub fn matches(&self, order: &Order) -> bool {
        self.order_status.is_none_or(|s| order.order_status == s)
            && self.payment_status.is_none_or(|s| order.payment_status == s)
            && self.payment_method.is_none_or(|m| order.payment_method == m)
            && self.user_id.is_none_or(|u| order.user_id == u)
            && self.created_from.is_none_or(|from| order.created_at >= from)
            && self.created_to.is_none_or(|to| order.created_at < to)
            && self.is_active.is_none_or(|active| order.is_active == active)
    }

    /// The email fragment, if one was given and is not blank.
    #[must_use]
    pub fn email_fragment(&self) -> Option<&str> {
        self.email
            .as_deref()
            .map(str::trim)
            .filter(|fragment| !fragment.is_empty())
    }
}

/// Sort order for admin order listings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderSort {
    #[default]
    NewestFirst,
    OldestFirst,
    TotalDesc,
    TotalAsc,
}

impl OrderSort {
    /// SQL `ORDER BY` clause. Ties break on id so pages are stable.
    #[must_use]
    pub const fn sql(self) -> &'static str {
        match self {
            Self::NewestFirst => "o.created_at DESC, o.id DESC",
            Self::OldestFirst => "o.created_at ASC, o.id ASC",
            Self::TotalDesc => "o.total DESC, o.id DESC",
            Self::TotalAsc => "o.total ASC, o.id ASC",
        }
    }

    fn compare(self, a: &Order, b: &Order) -> std::cmp::Ordering {
        match self {
            Self::NewestFirst => (b.created_at, b.id).cmp(&(a.created_at, a.id)),
            Self::OldestFirst => (a.created_at, a.id).cmp(&(b.created_at, b.id)),
            Self::TotalDesc => (b.total, b.id).cmp(&(a.total, a.id)),
            Self::TotalAsc => (a.total, a.id).cmp(&(b.total, b.id)),
        }
    }

    /// Sort listing rows in place.
    pub fn sort(self, rows: &mut [OrderListItem]) {
        rows.sort_by(|a, b| self.compare(&a.order, &b.order));
    }
}

/// An order plus the owner's email, as shown in admin listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListItem {
    #[serde(flatten)]
    pub order: Order,
    pub user_email: Email,
}

/// One page of results plus the total number of matches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u32,
    pub page_size: u32,
}

impl<T> Page<T> {
    /// Number of pages needed for `total` results.
    #[must_use]
    pub const fn total_pages(&self) -> u64 {
        if self.page_size == 0 {
            return 0;
        }
        self.total.div_ceil(self.page_size as u64)
    }

    /// Slice an already filtered and sorted result set.
    #[must_use]
    pub fn from_all(all: Vec<T>, page: u32, page_size: u32) -> Self {
        let (page, page_size) = normalize_page(page, page_size);
        let total = all.len() as u64;
        let skip = (page as usize - 1).saturating_mul(page_size as usize);
        let items = all.into_iter().skip(skip).take(page_size as usize).collect();
        Self {
            items,
            total,
            page,
            page_size,
        }
    }
}

/// Clamp a page request to `page >= 1` and `1 <= page_size <= MAX_PAGE_SIZE`.
#[must_use]
pub fn normalize_page(page: u32, page_size: u32) -> (u32, u32) {
    (page.max(1), page_size.clamp(1, MAX_PAGE_SIZE))
}

/// Keep rows whose owner email contains the filter's fragment.
#[must_use]
pub fn apply_email_filter(rows: Vec<OrderListItem>, filter: &OrderFilter) -> Vec<OrderListItem> {
    match filter.email_fragment() {
        Some(fragment) => rows
            .into_iter()
            .filter(|row| row.user_email.contains_fragment(fragment))
            .collect(),
        None => rows,
    }
}

/// Aggregate figures shown above the admin order list.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderStats {
    pub order_count: u64,
    /// Sum of totals with a completed payment.
    pub revenue: Money,
    pub pending_payments: u64,
    pub status_counts: HashMap<OrderStatus, u64>,
}

impl OrderStats {
    /// Fold a single order into the figures.
    pub fn record(&mut self, order: &Order) {
        self.order_count += 1;
        match order.payment_status {
            PaymentStatus::Completed => self.revenue = self.revenue + order.total,
            PaymentStatus::Pending => self.pending_payments += 1,
            PaymentStatus::Failed | PaymentStatus::Refunded => {}
        }
        *self.status_counts.entry(order.order_status).or_insert(0) += 1;
    }
}

// =============================================================================
// Store traits
// =============================================================================

/// Durable storage for orders.
///
/// Stores never trigger notifications or other side effects.
#[async_trait]
pub trait OrderStore: Send + Sync {
    /// Validate and persist a new order with a server-assigned id.
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError>;

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, RepositoryError>;

    async fn find_by_external_payment_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<Order>, RepositoryError>;

    async fn find_by_external_capture_id(
        &self,
        capture_id: &str,
    ) -> Result<Option<Order>, RepositoryError>;

    /// Link an order to its gateway authorization. Only succeeds once.
    async fn attach_external_order_id(
        &self,
        id: OrderId,
        external_order_id: &str,
    ) -> Result<Order, RepositoryError>;

    /// Set `order_status = to` only if the row still holds `from` and
    /// `payment`. Returns `None` if it does not.
    async fn compare_and_set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        payment: PaymentStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, RepositoryError>;

    /// Set `payment_status = to` (and the capture id, if given) only if the
    /// row still holds `from`. Returns `None` if it does not.
    async fn compare_and_set_payment_status(
        &self,
        id: OrderId,
        from: PaymentStatus,
        to: PaymentStatus,
        capture_id: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError>;

    /// Admin listing, with the email fragment applied after fetching.
    async fn list(
        &self,
        filter: &OrderFilter,
        page: u32,
        page_size: u32,
        sort: OrderSort,
    ) -> Result<Page<OrderListItem>, RepositoryError>;

    /// Aggregate figures for every order matching the column filters.
    async fn stats(&self, filter: &OrderFilter) -> Result<OrderStats, RepositoryError>;

    /// A user's active orders, newest first.
    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError>;

    /// Active gateway orders with an authorization that is still pending,
    /// oldest first.
    async fn list_pending_gateway(&self, limit: u32) -> Result<Vec<Order>, RepositoryError>;

    /// Mark an order inactive. Orders are never physically deleted.
    async fn soft_delete(&self, id: OrderId) -> Result<Order, RepositoryError>;

    /// Cheap connectivity check for readiness probes.
    async fn ping(&self) -> Result<(), RepositoryError>;

    /// Validated order status change.
    ///
    /// # Errors
    ///
    /// Returns `NotFound` for missing or soft-deleted orders,
    /// `InvalidTransition` with the specific reason for illegal changes and
    /// `Conflict` if another writer changed the order in between.
    async fn update_status(&self, id: OrderId, to: OrderStatus) -> Result<Order, RepositoryError> {
        let order = self
            .find_by_id(id)
            .await?
            .filter(|order| order.is_active)
            .ok_or(RepositoryError::NotFound)?;
        check_order_transition(&order, to)?;
        self.compare_and_set_order_status(id, order.order_status, order.payment_status, to)
            .await?
            .ok_or_else(|| RepositoryError::Conflict(format!("order {id} changed concurrently")))
    }

    /// Validated payment status change.
    ///
    /// # Errors
    ///
    /// Same as [`OrderStore::update_status`].
    async fn update_payment_status(
        &self,
        id: OrderId,
        to: PaymentStatus,
    ) -> Result<Order, RepositoryError> {
        let order = self.find_by_id(id).await?.ok_or(RepositoryError::NotFound)?;
        check_payment_transition(&order, to)?;
        self.compare_and_set_payment_status(id, order.payment_status, to, None)
            .await?
            .ok_or_else(|| RepositoryError::Conflict(format!("order {id} changed concurrently")))
    }
}

/// Per-user carts. A cart is only ever replaced or cleared as a whole.
#[async_trait]
pub trait CartStore: Send + Sync {
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, RepositoryError>;

    async fn set_cart(&self, user_id: UserId, cart: &Cart) -> Result<(), RepositoryError>;

    async fn clear_cart(&self, user_id: UserId) -> Result<(), RepositoryError>;
}

/// Read-only catalog lookups used to price orders.
#[async_trait]
pub trait CatalogStore: Send + Sync {
    /// Products with the given ids. Unknown ids are simply absent.
    async fn products_by_ids(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError>;
}

/// API bearer sessions, stored by token hash.
#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn resolve_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, RepositoryError>;

    /// Upsert the user by email (setting its role) and store a session.
    async fn create_session(
        &self,
        email: &Email,
        role: Role,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionUser, RepositoryError>;
}

/// Purchase tracking and product performance counters.
#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn record_purchase(&self, order: &Order) -> Result<(), RepositoryError>;

    async fn bump_product_performance(&self, items: &[LineItem]) -> Result<(), RepositoryError>;
}

/// Every store the API needs, as trait objects over one backend.
#[derive(Clone)]
pub struct Stores {
    pub orders: Arc<dyn OrderStore>,
    pub carts: Arc<dyn CartStore>,
    pub catalog: Arc<dyn CatalogStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
}

impl Stores {
    /// Use one backend for every store.
    pub fn from_backend<S>(backend: Arc<S>) -> Self
    where
        S: OrderStore + CartStore + CatalogStore + SessionStore + AnalyticsStore + 'static,
    {
        Self {
            orders: backend.clone(),
            carts: backend.clone(),
            catalog: backend.clone(),
            sessions: backend.clone(),
            analytics: backend,
        }
    }
}

/// Create a `PostgreSQL` connection pool with sensible defaults.
///
/// # Arguments
///
/// * `database_url` - `PostgreSQL` connection string (wrapped in `SecretString`)
///
/// # Errors
///
/// Returns `sqlx::Error` if the connection cannot be established.
pub async fn create_pool(database_url: &secrecy::SecretString) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url.expose_secret())
        .await
}
