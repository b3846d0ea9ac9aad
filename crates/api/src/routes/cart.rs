//! Cart routes. The cart is read and replaced as a whole.

use axum::extract::State;
use mercato_core::Cart;
use tracing::instrument;

use crate::error::Result;
use crate::extract::Json;
use crate::middleware::RequireUser;
use crate::state::AppState;

/// `GET /cart`
pub async fn show(State(state): State<AppState>, RequireUser(user): RequireUser) -> Result<Json<Cart>> {
    Ok(Json(state.stores().carts.get_cart(user.id).await?))
}

/// `PUT /cart`
///
/// Zero quantities are dropped before the cart is stored.
#[instrument(skip(state, user, cart), fields(user_id = %user.id))]
pub async fn replace(
    State(state): State<AppState>,
    RequireUser(user): RequireUser,
    Json(cart): Json<Cart>,
) -> Result<Json<Cart>> {
    let cart = cart.normalized();
    state.stores().carts.set_cart(user.id, &cart).await?;
    Ok(Json(cart))
}
