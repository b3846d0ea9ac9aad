//! Order placement, lookup and admin status routes.

use axum::extract::State;
use chrono::{Days, NaiveDate, NaiveTime, TimeZone, Utc};
use mercato_core::{Order, OrderId, OrderStatus, PaymentMethod, PaymentStatus, UserId};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::db::{MAX_PAGE_SIZE, OrderFilter, OrderListItem, OrderSort, OrderStats, Page};
use crate::error::{AppError, Result};
use crate::extract::{Json, Path, Query};
use crate::middleware::{Authenticated, Principal, RequireAdmin, RequireUser};
use crate::services::lifecycle::{PlaceOrder, PlacedOrder};
use crate::state::AppState;

const DEFAULT_PAGE_SIZE: u32 = 20;

/// `POST /orders`
#[instrument(skip(state, user, request))]
pub async fn place(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(request): Json<PlaceOrder>,
) -> Result<Json<PlacedOrder>> {
    let placed = state.coordinator().place_order(&user, request).await?;
    Ok(Json(placed))
}

/// Query parameters for the admin order list.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListOrdersQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub payment_method: Option<PaymentMethod>,
    pub user_id: Option<UserId>,
    /// First day included (`YYYY-MM-DD`, UTC).
    pub start_date: Option<NaiveDate>,
    /// Last day included (`YYYY-MM-DD`, UTC).
    pub end_date: Option<NaiveDate>,
    /// Fragment of the owner's email.
    pub email: Option<String>,
    pub sort: Option<OrderSort>,
    /// Also list soft-deleted orders.
    #[serde(default)]
    pub include_inactive: bool,
}

impl ListOrdersQuery {
    /// Build the store filter. Dates are whole UTC days; the end date is
    /// turned into an exclusive bound at the start of the following day.
    ///
    /// # Errors
    ///
    /// Returns `BadRequest` if the range is inverted or out of range.
    pub fn filter(&self) -> Result<OrderFilter> {
        if let (Some(start), Some(end)) = (self.start_date, self.end_date)
            && end < start
        {
            return Err(AppError::BadRequest(
                "endDate must not be before startDate".to_string(),
            ));
        }

        let midnight = |date: NaiveDate| Utc.from_utc_datetime(&date.and_time(NaiveTime::MIN));
        let created_to = self
            .end_date
            .map(|end| {
                end.checked_add_days(Days::new(1))
                    .map(midnight)
                    .ok_or_else(|| AppError::BadRequest("endDate is out of range".to_string()))
            })
            .transpose()?;

        Ok(OrderFilter {
            order_status: self.status,
            payment_status: self.payment_status,
            payment_method: self.payment_method,
            user_id: self.user_id,
            created_from: self.start_date.map(midnight),
            created_to,
            is_active: (!self.include_inactive).then_some(true),
            email: self.email.clone(),
        })
    }
}

/// Admin order list response.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderListResponse {
    #[serde(flatten)]
    pub page: Page<OrderListItem>,
    pub total_pages: u64,
    pub stats: OrderStats,
}

/// `GET /orders` (admin)
#[instrument(skip(state, _admin))]
pub async fn list(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Query(query): Query<ListOrdersQuery>,
) -> Result<Json<OrderListResponse>> {
    let filter = query.filter()?;
    let page_size = query.limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
    let orders = state.stores().orders.as_ref();

    let page = orders
        .list(
            &filter,
            query.page.unwrap_or(1),
            page_size,
            query.sort.unwrap_or_default(),
        )
        .await?;
    let stats = orders.stats(&filter).await?;

    Ok(Json(OrderListResponse {
        total_pages: page.total_pages(),
        page,
        stats,
    }))
}

/// `GET /orders/mine`
pub async fn mine(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
) -> Result<Json<Vec<Order>>> {
    let orders = state.stores().orders.list_for_user(user.id).await?;
    Ok(Json(orders))
}

/// `GET /orders/{id}`
pub async fn show(
    State(state): State<AppState>,
    Authenticated(principal): Authenticated,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    let order = match principal {
        Principal::User(user) => state.coordinator().order_for(&user, order_id).await?,
        Principal::LegacyAdmin => state
            .stores()
            .orders
            .find_by_id(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound("Order".to_string()))?,
    };
    Ok(Json(order))
}

/// `DELETE /orders/{id}` (admin)
#[instrument(skip(state, _admin))]
pub async fn soft_delete(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    Ok(Json(state.coordinator().soft_delete(order_id).await?))
}

/// `POST /orders/{id}/cancel`
#[instrument(skip(state, user))]
pub async fn cancel(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Path(order_id): Path<OrderId>,
) -> Result<Json<Order>> {
    Ok(Json(state.coordinator().cancel_order(&user, order_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateOrderStatus {
    pub order_id: OrderId,
    pub status: OrderStatus,
}

/// `PUT /orders/status` (admin)
#[instrument(skip(state, _admin))]
pub async fn update_status(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(body): Json<UpdateOrderStatus>,
) -> Result<Json<Order>> {
    let order = state
        .coordinator()
        .update_order_status(body.order_id, body.status)
        .await?;
    Ok(Json(order))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePaymentStatus {
    pub order_id: OrderId,
    pub payment_status: PaymentStatus,
}

/// `PUT /orders/payment-status` (admin)
#[instrument(skip(state, _admin))]
pub async fn update_payment_status(
    State(state): State<AppState>,
    RequireAdmin(_admin): RequireAdmin,
    Json(body): Json<UpdatePaymentStatus>,
) -> Result<Json<Order>> {
    let order = state
        .coordinator()
        .update_payment_status(body.order_id, body.payment_status)
        .await?;
    Ok(Json(order))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_date_range_is_whole_days_with_exclusive_end() {
        let query = ListOrdersQuery {
            start_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 31),
            ..Default::default()
        };
        let filter = query.filter().unwrap();
        assert_eq!(
            filter.created_from.unwrap().to_rfc3339(),
            "2025-03-01T00:00:00+00:00"
        );
        assert_eq!(
            filter.created_to.unwrap().to_rfc3339(),
            "2025-04-01T00:00:00+00:00"
        );
        assert_eq!(filter.is_active, Some(true));
    }

    #[test]
    fn test_inverted_range_is_rejected() {
        let query = ListOrdersQuery {
            start_date: NaiveDate::from_ymd_opt(2025, 3, 2),
            end_date: NaiveDate::from_ymd_opt(2025, 3, 1),
            ..Default::default()
        };
        assert!(matches!(query.filter(), Err(AppError::BadRequest(_))));
    }

    #[test]
    fn test_include_inactive_drops_active_filter() {
        let query = ListOrdersQuery {
            include_inactive: true,
            ..Default::default()
        };
        assert_eq!(query.filter().unwrap().is_active, None);
    }
}
