//! `PostgreSQL` implementation of the store traits.
//!
//! Queries are checked at runtime (`sqlx::query_as`) so the crate builds
//! without a live database. Status changes are single conditional `UPDATE`
//! statements; nothing here reads a row and then writes it back.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::{
    Cart, CurrencyCode, Email, LineItem, Money, NewOrder, Order, OrderId, OrderStatus,
    PaymentMethod, PaymentStatus, ProductId, Role, ShippingAddress, UserId,
};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use tracing::instrument;

use super::{
    AnalyticsStore, CartStore, CatalogStore, OrderFilter, OrderListItem, OrderSort, OrderStats,
    OrderStore, Page, RepositoryError, SessionStore, apply_email_filter, normalize_page,
};
use crate::models::{Product, SessionRecord, SessionUser};

/// Columns selected for every order query (table alias `o`).
const ORDER_COLUMNS: &str = "o.id, o.user_id, o.items, o.shipping_address, o.payment_method, \
     o.payment_status, o.order_status, o.subtotal, o.shipping_fee, o.total, o.currency, \
     o.external_order_id, o.external_capture_id, o.is_active, o.created_at, o.updated_at";

/// Store backed by a `PostgreSQL` connection pool.
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    /// Create a store over an existing pool.
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying pool.
    #[must_use]
    pub const fn pool(&self) -> &PgPool {
        &self.pool
    }
}

// =============================================================================
// Row mapping
// =============================================================================

#[derive(sqlx::FromRow)]
struct OrderRow {
    id: i64,
    user_id: i64,
    items: Json<Vec<LineItem>>,
    shipping_address: Json<ShippingAddress>,
    payment_method: PaymentMethod,
    payment_status: PaymentStatus,
    order_status: OrderStatus,
    subtotal: Money,
    shipping_fee: Money,
    total: Money,
    currency: String,
    external_order_id: Option<String>,
    external_capture_id: Option<String>,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<OrderRow> for Order {
    type Error = RepositoryError;

    fn try_from(row: OrderRow) -> Result<Self, Self::Error> {
        let currency: CurrencyCode = row.currency.parse().map_err(|e| {
            RepositoryError::DataCorruption(format!("order {}: {e}", row.id))
        })?;
        Ok(Self {
            id: OrderId::new(row.id),
            user_id: UserId::new(row.user_id),
            items: row.items.0,
            shipping_address: row.shipping_address.0,
            payment_method: row.payment_method,
            payment_status: row.payment_status,
            order_status: row.order_status,
            subtotal: row.subtotal,
            shipping_fee: row.shipping_fee,
            total: row.total,
            currency,
            external_order_id: row.external_order_id,
            external_capture_id: row.external_capture_id,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct OrderListRow {
    #[sqlx(flatten)]
    order: OrderRow,
    user_email: String,
}

impl TryFrom<OrderListRow> for OrderListItem {
    type Error = RepositoryError;

    fn try_from(row: OrderListRow) -> Result<Self, Self::Error> {
        Ok(Self {
            user_email: parse_email(&row.user_email)?,
            order: row.order.try_into()?,
        })
    }
}

#[derive(sqlx::FromRow)]
struct StatsRow {
    order_status: OrderStatus,
    payment_status: PaymentStatus,
    orders: i64,
    revenue: Decimal,
}

#[derive(sqlx::FromRow)]
struct ProductRow {
    id: i64,
    name: String,
    price: Money,
    is_active: bool,
}

#[derive(sqlx::FromRow)]
struct SessionRow {
    id: i64,
    email: String,
    role: Role,
    expires_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
struct UserRow {
    id: i64,
    email: String,
    role: Role,
}

fn parse_email(raw: &str) -> Result<Email, RepositoryError> {
    Email::parse(raw)
        .map_err(|e| RepositoryError::DataCorruption(format!("invalid email in database: {e}")))
}

fn to_i64(value: u64, what: &str) -> Result<i64, RepositoryError> {
    i64::try_from(value).map_err(|_| RepositoryError::DataCorruption(format!("{what} overflow")))
}

fn to_u64(value: i64) -> u64 {
    u64::try_from(value).unwrap_or(0)
}

/// Map unique and foreign-key violations to `Conflict`.
fn map_constraint(e: sqlx::Error, what: &str) -> RepositoryError {
    if let sqlx::Error::Database(ref db_err) = e
        && (db_err.is_unique_violation() || db_err.is_foreign_key_violation())
    {
        return RepositoryError::Conflict(what.to_owned());
    }
    RepositoryError::Database(e)
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: &OrderFilter) {
    qb.push(" WHERE TRUE");
    if let Some(status) = filter.order_status {
        qb.push(" AND o.order_status = ").push_bind(status);
    }
    if let Some(status) = filter.payment_status {
        qb.push(" AND o.payment_status = ").push_bind(status);
    }
    if let Some(method) = filter.payment_method {
        qb.push(" AND o.payment_method = ").push_bind(method);
    }
    if let Some(user_id) = filter.user_id {
        qb.push(" AND o.user_id = ").push_bind(user_id.as_i64());
    }
    if let Some(from) = filter.created_from {
        qb.push(" AND o.created_at >= ").push_bind(from);
    }
    if let Some(to) = filter.created_to {
        qb.push(" AND o.created_at < ").push_bind(to);
    }
    if let Some(active) = filter.is_active {
        qb.push(" AND o.is_active = ").push_bind(active);
    }
}

// =============================================================================
// Orders
// =============================================================================

#[async_trait]
impl OrderStore for PgStore {
    #[instrument(skip(self, order), fields(user_id = %order.user_id))]
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError> {
        order.validate()?;
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r"
            INSERT INTO orders AS o (user_id, items, shipping_address, payment_method,
                                     subtotal, shipping_fee, total, currency)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(order.user_id.as_i64())
        .bind(Json(&order.items))
        .bind(Json(&order.shipping_address))
        .bind(order.payment_method)
        .bind(order.totals.subtotal)
        .bind(order.totals.shipping)
        .bind(order.totals.total)
        .bind(order.currency.as_str())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_constraint(e, "order owner does not exist"))?;

        row.try_into()
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o WHERE o.id = $1"
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn find_by_external_payment_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o WHERE o.external_order_id = $1"
        ))
        .bind(external_order_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    async fn find_by_external_capture_id(
        &self,
        capture_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            "SELECT {ORDER_COLUMNS} FROM orders o WHERE o.external_capture_id = $1"
        ))
        .bind(capture_id)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn attach_external_order_id(
        &self,
        id: OrderId,
        external_order_id: &str,
    ) -> Result<Order, RepositoryError> {
        let row = sqlx::query_as::<_, OrderRow>(&format!(
            r"
            UPDATE orders o
            SET external_order_id = $2, updated_at = NOW()
            WHERE o.id = $1 AND o.external_order_id IS NULL
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(id.as_i64())
        .bind(external_order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_constraint(e, "external order id already linked"))?;

        match row {
            Some(row) => row.try_into(),
            None if self.find_by_id(id).await?.is_some() => Err(RepositoryError::Conflict(
                format!("order {id} already has a gateway authorization"),
            )),
            None => Err(RepositoryError::NotFound),
        }
    }

    #[instrument(skip(self))]
    async fn compare_and_set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        payment: PaymentStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r"
            UPDATE orders o
            SET order_status = $4, updated_at = NOW()
            WHERE o.id = $1 AND o.order_status = $2 AND o.payment_status = $3
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(id.as_i64())
        .bind(from)
        .bind(payment)
        .bind(to)
        .fetch_optional(&self.pool)
        .await?
        .map(Order::try_from)
        .transpose()
    }

    #[instrument(skip(self))]
    async fn compare_and_set_payment_status(
        &self,
        id: OrderId,
        from: PaymentStatus,
        to: PaymentStatus,
        capture_id: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r"
            UPDATE orders o
            SET payment_status = $3,
                external_capture_id = COALESCE($4, o.external_capture_id),
                updated_at = NOW()
            WHERE o.id = $1 AND o.payment_status = $2
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(id.as_i64())
        .bind(from)
        .bind(to)
        .bind(capture_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_constraint(e, "capture id already linked"))?
        .map(Order::try_from)
        .transpose()
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: u32,
        page_size: u32,
        sort: OrderSort,
    ) -> Result<Page<OrderListItem>, RepositoryError> {
        let (page, page_size) = normalize_page(page, page_size);

        let mut qb = QueryBuilder::<Postgres>::new(format!(
            "SELECT {ORDER_COLUMNS}, u.email AS user_email \
             FROM orders o JOIN users u ON u.id = o.user_id"
        ));
        push_filter(&mut qb, filter);
        qb.push(" ORDER BY ").push(sort.sql());

        // The email fragment is matched in Rust, so the page can only be cut
        // after every candidate row is fetched.
        if filter.email_fragment().is_some() {
            let rows = qb
                .build_query_as::<OrderListRow>()
                .fetch_all(&self.pool)
                .await?
                .into_iter()
                .map(OrderListItem::try_from)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(Page::from_all(
                apply_email_filter(rows, filter),
                page,
                page_size,
            ));
        }

        let offset = i64::from(page - 1) * i64::from(page_size);
        qb.push(" LIMIT ")
            .push_bind(i64::from(page_size))
            .push(" OFFSET ")
            .push_bind(offset);
        let items = qb
            .build_query_as::<OrderListRow>()
            .fetch_all(&self.pool)
            .await?
            .into_iter()
            .map(OrderListItem::try_from)
            .collect::<Result<Vec<_>, _>>()?;

        let mut count = QueryBuilder::<Postgres>::new("SELECT COUNT(*) FROM orders o");
        push_filter(&mut count, filter);
        let total: i64 = count.build_query_scalar().fetch_one(&self.pool).await?;

        Ok(Page {
            items,
            total: to_u64(total),
            page,
            page_size,
        })
    }

    async fn stats(&self, filter: &OrderFilter) -> Result<OrderStats, RepositoryError> {
        let mut qb = QueryBuilder::<Postgres>::new(
            "SELECT o.order_status, o.payment_status, COUNT(*) AS orders, \
             COALESCE(SUM(o.total), 0) AS revenue FROM orders o",
        );
        push_filter(&mut qb, filter);
        qb.push(" GROUP BY o.order_status, o.payment_status");

        let rows = qb
            .build_query_as::<StatsRow>()
            .fetch_all(&self.pool)
            .await?;

        let mut stats = OrderStats::default();
        for row in rows {
            let orders = to_u64(row.orders);
            stats.order_count += orders;
            *stats.status_counts.entry(row.order_status).or_insert(0) += orders;
            match row.payment_status {
                PaymentStatus::Completed => {
                    let revenue = Money::new(row.revenue).map_err(|e| {
                        RepositoryError::DataCorruption(format!("invalid revenue sum: {e}"))
                    })?;
                    stats.revenue = stats.revenue + revenue;
                }
                PaymentStatus::Pending => stats.pending_payments += orders,
                PaymentStatus::Failed | PaymentStatus::Refunded => {}
            }
        }
        Ok(stats)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r"
            SELECT {ORDER_COLUMNS} FROM orders o
            WHERE o.user_id = $1 AND o.is_active
            ORDER BY o.created_at DESC, o.id DESC
            "
        ))
        .bind(user_id.as_i64())
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Order::try_from)
        .collect()
    }

    async fn list_pending_gateway(&self, limit: u32) -> Result<Vec<Order>, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r"
            SELECT {ORDER_COLUMNS} FROM orders o
            WHERE o.is_active
              AND o.payment_method = 'gateway'
              AND o.payment_status = 'pending'
              AND o.external_order_id IS NOT NULL
            ORDER BY o.created_at ASC, o.id ASC
            LIMIT $1
            "
        ))
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?
        .into_iter()
        .map(Order::try_from)
        .collect()
    }

    #[instrument(skip(self))]
    async fn soft_delete(&self, id: OrderId) -> Result<Order, RepositoryError> {
        sqlx::query_as::<_, OrderRow>(&format!(
            r"
            UPDATE orders o SET is_active = FALSE, updated_at = NOW()
            WHERE o.id = $1
            RETURNING {ORDER_COLUMNS}
            "
        ))
        .bind(id.as_i64())
        .fetch_optional(&self.pool)
        .await?
        .ok_or(RepositoryError::NotFound)?
        .try_into()
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

// =============================================================================
// Carts, catalog, sessions, analytics
// =============================================================================

#[async_trait]
impl CartStore for PgStore {
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        let cart: Option<Json<Cart>> = sqlx::query_scalar("SELECT cart FROM users WHERE id = $1")
            .bind(user_id.as_i64())
            .fetch_optional(&self.pool)
            .await?;
        cart.map(|c| c.0).ok_or(RepositoryError::NotFound)
    }

    async fn set_cart(&self, user_id: UserId, cart: &Cart) -> Result<(), RepositoryError> {
        let result = sqlx::query("UPDATE users SET cart = $2, updated_at = NOW() WHERE id = $1")
            .bind(user_id.as_i64())
            .bind(Json(cart.clone().normalized()))
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }

    async fn clear_cart(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let result = sqlx::query(
            "UPDATE users SET cart = '{}'::jsonb, updated_at = NOW() WHERE id = $1",
        )
        .bind(user_id.as_i64())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(RepositoryError::NotFound);
        }
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for PgStore {
    async fn products_by_ids(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        let ids: Vec<i64> = ids.iter().map(ProductId::as_i64).collect();
        let rows = sqlx::query_as::<_, ProductRow>(
            "SELECT id, name, price, is_active FROM products WHERE id = ANY($1)",
        )
        .bind(&ids)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| Product {
                id: ProductId::new(r.id),
                name: r.name,
                price: r.price,
                is_active: r.is_active,
            })
            .collect())
    }
}

#[async_trait]
impl SessionStore for PgStore {
    async fn resolve_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, RepositoryError> {
        let row = sqlx::query_as::<_, SessionRow>(
            r"
            SELECT u.id, u.email, u.role, s.expires_at
            FROM api_sessions s JOIN users u ON u.id = s.user_id
            WHERE s.token_hash = $1
            ",
        )
        .bind(token_hash)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|r| {
            Ok(SessionRecord {
                user: SessionUser {
                    id: UserId::new(r.id),
                    email: parse_email(&r.email)?,
                    role: r.role,
                },
                expires_at: r.expires_at,
            })
        })
        .transpose()
    }

    #[instrument(skip(self, token_hash))]
    async fn create_session(
        &self,
        email: &Email,
        role: Role,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionUser, RepositoryError> {
        let mut tx = self.pool.begin().await?;

        let user = sqlx::query_as::<_, UserRow>(
            r"
            INSERT INTO users (email, role) VALUES ($1, $2)
            ON CONFLICT (email) DO UPDATE SET role = EXCLUDED.role, updated_at = NOW()
            RETURNING id, email, role
            ",
        )
        .bind(email.as_str())
        .bind(role)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query("INSERT INTO api_sessions (token_hash, user_id, expires_at) VALUES ($1, $2, $3)")
            .bind(token_hash)
            .bind(user.id)
            .bind(expires_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_constraint(e, "session token already exists"))?;

        tx.commit().await?;

        Ok(SessionUser {
            id: UserId::new(user.id),
            email: parse_email(&user.email)?,
            role: user.role,
        })
    }
}

#[async_trait]
impl AnalyticsStore for PgStore {
    async fn record_purchase(&self, order: &Order) -> Result<(), RepositoryError> {
        let units: u64 = order.items.iter().map(|i| u64::from(i.quantity)).sum();
        sqlx::query(
            r"
            INSERT INTO analytics_events (event_type, order_id, user_id, revenue, units)
            VALUES ('purchase', $1, $2, $3, $4)
            ",
        )
        .bind(order.id.as_i64())
        .bind(order.user_id.as_i64())
        .bind(order.total)
        .bind(to_i64(units, "units")?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn bump_product_performance(&self, items: &[LineItem]) -> Result<(), RepositoryError> {
        let mut tx = self.pool.begin().await?;
        for item in items {
            sqlx::query(
                r"
                INSERT INTO product_performance (product_id, units_sold, revenue, orders)
                VALUES ($1, $2, $3, 1)
                ON CONFLICT (product_id) DO UPDATE
                SET units_sold = product_performance.units_sold + EXCLUDED.units_sold,
                    revenue = product_performance.revenue + EXCLUDED.revenue,
                    orders = product_performance.orders + 1,
                    updated_at = NOW()
                ",
            )
            .bind(item.product_id.as_i64())
            .bind(i64::from(item.quantity))
            .bind(item.line_total())
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }
}
