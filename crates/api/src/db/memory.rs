//! In-process store backed by maps behind a `tokio` read-write lock.
//!
//! Every trait method takes the lock once, so each conditional update is
//! atomic with respect to every other store operation, matching the
//! row-level guarantees of the `PostgreSQL` store.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use mercato_core::{
    Cart, Email, LineItem, Money, NewOrder, Order, OrderId, OrderStatus, PaymentMethod,
    PaymentStatus, ProductId, Role, UserId,
};
use tokio::sync::RwLock;

use super::{
    AnalyticsStore, CartStore, CatalogStore, OrderFilter, OrderListItem, OrderSort, OrderStats,
    OrderStore, Page, RepositoryError, SessionStore, apply_email_filter,
};
use crate::models::{Product, ProductPerformance, PurchaseEvent, SessionRecord, SessionUser};

/// In-memory implementation of every store trait.
#[derive(Default)]
pub struct MemoryStore {
    data: RwLock<MemoryData>,
}

#[derive(Default)]
struct MemoryData {
    last_order_id: i64,
    last_user_id: i64,
    orders: BTreeMap<OrderId, Order>,
    users: HashMap<UserId, UserRecord>,
    sessions: HashMap<String, (UserId, DateTime<Utc>)>,
    products: HashMap<ProductId, Product>,
    purchases: Vec<PurchaseEvent>,
    performance: HashMap<ProductId, ProductPerformance>,
}

struct UserRecord {
    user: SessionUser,
    cart: Cart,
    cart_clears: u64,
}

impl MemoryData {
    fn upsert_user(&mut self, email: &Email, role: Role) -> SessionUser {
        if let Some(record) = self.users.values_mut().find(|r| &r.user.email == email) {
            record.user.role = role;
            return record.user.clone();
        }
        self.last_user_id += 1;
        let user = SessionUser {
            id: UserId::new(self.last_user_id),
            email: email.clone(),
            role,
        };
        self.users.insert(
            user.id,
            UserRecord {
                user: user.clone(),
                cart: Cart::new(),
                cart_clears: 0,
            },
        );
        user
    }

    fn user_mut(&mut self, user_id: UserId) -> Result<&mut UserRecord, RepositoryError> {
        self.users.get_mut(&user_id).ok_or(RepositoryError::NotFound)
    }

    fn list_item(&self, order: &Order) -> Result<OrderListItem, RepositoryError> {
        let record = self.users.get(&order.user_id).ok_or_else(|| {
            RepositoryError::DataCorruption(format!("order {} has no owner", order.id))
        })?;
        Ok(OrderListItem {
            order: order.clone(),
            user_email: record.user.email.clone(),
        })
    }
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a catalog product.
    pub async fn insert_product(&self, product: Product) {
        self.data.write().await.products.insert(product.id, product);
    }

    /// Add a user (or update the role of an existing one).
    pub async fn insert_user(&self, email: &Email, role: Role) -> SessionUser {
        self.data.write().await.upsert_user(email, role)
    }

    /// Tracked purchases, in the order they were recorded.
    pub async fn purchases(&self) -> Vec<PurchaseEvent> {
        self.data.read().await.purchases.clone()
    }

    /// Sales counters for a product.
    pub async fn product_performance(&self, id: ProductId) -> ProductPerformance {
        self.data
            .read()
            .await
            .performance
            .get(&id)
            .copied()
            .unwrap_or_default()
    }

    /// How many times a user's cart has been cleared.
    pub async fn cart_clear_count(&self, user_id: UserId) -> u64 {
        self.data
            .read()
            .await
            .users
            .get(&user_id)
            .map_or(0, |record| record.cart_clears)
    }

    /// Backdate an order, for listings that filter by date.
    pub async fn set_created_at(&self, id: OrderId, created_at: DateTime<Utc>) {
        if let Some(order) = self.data.write().await.orders.get_mut(&id) {
            order.created_at = created_at;
        }
    }
}

#[async_trait]
impl OrderStore for MemoryStore {
    async fn create(&self, order: NewOrder) -> Result<Order, RepositoryError> {
        order.validate()?;
        let mut data = self.data.write().await;
        if !data.users.contains_key(&order.user_id) {
            return Err(RepositoryError::Conflict(format!(
                "user {} does not exist",
                order.user_id
            )));
        }
        data.last_order_id += 1;
        let now = Utc::now();
        let stored = Order {
            id: OrderId::new(data.last_order_id),
            user_id: order.user_id,
            items: order.items,
            shipping_address: order.shipping_address,
            payment_method: order.payment_method,
            payment_status: PaymentStatus::Pending,
            order_status: OrderStatus::Placed,
            subtotal: order.totals.subtotal,
            shipping_fee: order.totals.shipping,
            total: order.totals.total,
            currency: order.currency,
            external_order_id: None,
            external_capture_id: None,
            is_active: true,
            created_at: now,
            updated_at: now,
        };
        data.orders.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn find_by_id(&self, id: OrderId) -> Result<Option<Order>, RepositoryError> {
        Ok(self.data.read().await.orders.get(&id).cloned())
    }

    async fn find_by_external_payment_id(
        &self,
        external_order_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        Ok(self
            .data
            .read()
            .await
            .orders
            .values()
            .find(|o| o.external_order_id.as_deref() == Some(external_order_id))
            .cloned())
    }

    async fn find_by_external_capture_id(
        &self,
        capture_id: &str,
    ) -> Result<Option<Order>, RepositoryError> {
        Ok(self
            .data
            .read()
            .await
            .orders
            .values()
            .find(|o| o.external_capture_id.as_deref() == Some(capture_id))
            .cloned())
    }

    async fn attach_external_order_id(
        &self,
        id: OrderId,
        external_order_id: &str,
    ) -> Result<Order, RepositoryError> {
        let mut data = self.data.write().await;
        if data
            .orders
            .values()
            .any(|o| o.external_order_id.as_deref() == Some(external_order_id))
        {
            return Err(RepositoryError::Conflict(
                "external order id already linked".to_owned(),
            ));
        }
        let order = data.orders.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if order.external_order_id.is_some() {
            return Err(RepositoryError::Conflict(format!(
                "order {id} already has a gateway authorization"
            )));
        }
        order.external_order_id = Some(external_order_id.to_owned());
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn compare_and_set_order_status(
        &self,
        id: OrderId,
        from: OrderStatus,
        payment: PaymentStatus,
        to: OrderStatus,
    ) -> Result<Option<Order>, RepositoryError> {
        let mut data = self.data.write().await;
        let order = data.orders.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if order.order_status != from || order.payment_status != payment {
            return Ok(None);
        }
        order.order_status = to;
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn compare_and_set_payment_status(
        &self,
        id: OrderId,
        from: PaymentStatus,
        to: PaymentStatus,
        capture_id: Option<&str>,
    ) -> Result<Option<Order>, RepositoryError> {
        let mut data = self.data.write().await;
        if let Some(capture_id) = capture_id
            && data
                .orders
                .values()
                .any(|o| o.id != id && o.external_capture_id.as_deref() == Some(capture_id))
        {
            return Err(RepositoryError::Conflict(
                "capture id already linked".to_owned(),
            ));
        }
        let order = data.orders.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        if order.payment_status != from {
            return Ok(None);
        }
        order.payment_status = to;
        if let Some(capture_id) = capture_id {
            order.external_capture_id = Some(capture_id.to_owned());
        }
        order.updated_at = Utc::now();
        Ok(Some(order.clone()))
    }

    async fn list(
        &self,
        filter: &OrderFilter,
        page: u32,
        page_size: u32,
        sort: OrderSort,
    ) -> Result<Page<OrderListItem>, RepositoryError> {
        let data = self.data.read().await;
        let mut rows = data
            .orders
            .values()
            .filter(|o| filter.matches(o))
            .map(|o| data.list_item(o))
            .collect::<Result<Vec<_>, _>>()?;
        sort.sort(&mut rows);
        Ok(Page::from_all(
            apply_email_filter(rows, filter),
            page,
            page_size,
        ))
    }

    async fn stats(&self, filter: &OrderFilter) -> Result<OrderStats, RepositoryError> {
        let data = self.data.read().await;
        let mut stats = OrderStats::default();
        for order in data.orders.values().filter(|o| filter.matches(o)) {
            stats.record(order);
        }
        Ok(stats)
    }

    async fn list_for_user(&self, user_id: UserId) -> Result<Vec<Order>, RepositoryError> {
        let data = self.data.read().await;
        Ok(data
            .orders
            .values()
            .rev()
            .filter(|o| o.user_id == user_id && o.is_active)
            .cloned()
            .collect())
    }

    async fn list_pending_gateway(&self, limit: u32) -> Result<Vec<Order>, RepositoryError> {
        let data = self.data.read().await;
        Ok(data
            .orders
            .values()
            .filter(|o| {
                o.is_active
                    && o.payment_method == PaymentMethod::Gateway
                    && o.payment_status == PaymentStatus::Pending
                    && o.external_order_id.is_some()
            })
            .take(limit as usize)
            .cloned()
            .collect())
    }

    async fn soft_delete(&self, id: OrderId) -> Result<Order, RepositoryError> {
        let mut data = self.data.write().await;
        let order = data.orders.get_mut(&id).ok_or(RepositoryError::NotFound)?;
        order.is_active = false;
        order.updated_at = Utc::now();
        Ok(order.clone())
    }

    async fn ping(&self) -> Result<(), RepositoryError> {
        Ok(())
    }
}

#[async_trait]
impl CartStore for MemoryStore {
    async fn get_cart(&self, user_id: UserId) -> Result<Cart, RepositoryError> {
        let data = self.data.read().await;
        data.users
            .get(&user_id)
            .map(|record| record.cart.clone())
            .ok_or(RepositoryError::NotFound)
    }

    async fn set_cart(&self, user_id: UserId, cart: &Cart) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        data.user_mut(user_id)?.cart = cart.clone().normalized();
        Ok(())
    }

    async fn clear_cart(&self, user_id: UserId) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        let record = data.user_mut(user_id)?;
        record.cart = Cart::new();
        record.cart_clears += 1;
        Ok(())
    }
}

#[async_trait]
impl CatalogStore for MemoryStore {
    async fn products_by_ids(&self, ids: &[ProductId]) -> Result<Vec<Product>, RepositoryError> {
        let data = self.data.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| data.products.get(id).cloned())
            .collect())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn resolve_session(
        &self,
        token_hash: &str,
    ) -> Result<Option<SessionRecord>, RepositoryError> {
        let data = self.data.read().await;
        let Some((user_id, expires_at)) = data.sessions.get(token_hash) else {
            return Ok(None);
        };
        let record = data.users.get(user_id).ok_or_else(|| {
            RepositoryError::DataCorruption(format!("session for missing user {user_id}"))
        })?;
        Ok(Some(SessionRecord {
            user: record.user.clone(),
            expires_at: *expires_at,
        }))
    }

    async fn create_session(
        &self,
        email: &Email,
        role: Role,
        token_hash: &str,
        expires_at: DateTime<Utc>,
    ) -> Result<SessionUser, RepositoryError> {
        let mut data = self.data.write().await;
        let user = data.upsert_user(email, role);
        data.sessions
            .insert(token_hash.to_owned(), (user.id, expires_at));
        Ok(user)
    }
}

#[async_trait]
impl AnalyticsStore for MemoryStore {
    async fn record_purchase(&self, order: &Order) -> Result<(), RepositoryError> {
        let units = order.items.iter().map(|i| u64::from(i.quantity)).sum();
        self.data.write().await.purchases.push(PurchaseEvent {
            order_id: order.id,
            user_id: order.user_id,
            revenue: order.total,
            units,
            occurred_at: Utc::now(),
        });
        Ok(())
    }

    async fn bump_product_performance(&self, items: &[LineItem]) -> Result<(), RepositoryError> {
        let mut data = self.data.write().await;
        for item in items {
            let counters = data.performance.entry(item.product_id).or_default();
            counters.units_sold += u64::from(item.quantity);
            counters.revenue = counters.revenue + item.line_total();
            counters.orders += 1;
        }
        Ok(())
    }
}
