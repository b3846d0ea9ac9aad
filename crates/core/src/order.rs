//! Orders, line items, shipping addresses and pricing.
//!
//! Line items and the shipping address are snapshots taken when the order is
//! placed. Later catalog price changes never touch historical orders, and the
//! stored subtotal can always be recomputed from the stored items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{
    CurrencyCode, Money, OrderId, OrderStatus, PaymentMethod, PaymentStatus, ProductId, UserId,
};

/// Flat shipping fee charged on every order.
pub const SHIPPING_FEE: Money = Money::from_cents(1000);

/// Maximum quantity of a single line item.
pub const MAX_LINE_QUANTITY: u32 = 1000;

/// Errors raised when an order is missing required data or is internally inconsistent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OrderValidationError {
    /// The order has no line items.
    #[error("order must contain at least one item")]
    NoItems,
    /// A line item has an invalid quantity.
    #[error("quantity for product {product_id} must be between 1 and {MAX_LINE_QUANTITY}")]
    InvalidQuantity {
        /// Offending product.
        product_id: ProductId,
    },
    /// A shipping address field is blank.
    #[error("shipping address field `{0}` is required")]
    MissingAddressField(&'static str),
    /// `total != subtotal + shipping`, or the subtotal does not match the items.
    #[error("order totals are inconsistent")]
    InconsistentTotals,
}

/// A purchased product, denormalized at order time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LineItem {
    /// Catalog product reference.
    pub product_id: ProductId,
    /// Product name at the time of purchase.
    pub name: String,
    /// Unit price at the time of purchase.
    pub unit_price: Money,
    /// Number of units.
    pub quantity: u32,
    /// Variant (color) chosen by the customer, if the product has variants.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variant: Option<String>,
}

impl LineItem {
    /// `unit_price * quantity`.
    #[must_use]
    pub fn line_total(&self) -> Money {
        self.unit_price.times(self.quantity)
    }
}

/// Shipping address snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShippingAddress {
    pub full_name: String,
    pub line1: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line2: Option<String>,
    pub city: String,
    #[serde(default)]
    pub state: String,
    pub postal_code: String,
    /// ISO 3166-1 alpha-2 country code.
    pub country: String,
    #[serde(default)]
    pub phone: String,
}

impl ShippingAddress {
    /// Check that every required field is present.
    ///
    /// # Errors
    ///
    /// Returns the first blank required field.
    pub fn validate(&self) -> Result<(), OrderValidationError> {
        let required = [
            ("fullName", &self.full_name),
            ("line1", &self.line1),
            ("city", &self.city),
            ("postalCode", &self.postal_code),
            ("country", &self.country),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(OrderValidationError::MissingAddressField(field));
            }
        }
        Ok(())
    }
}

/// Subtotal, shipping and total for a set of line items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderTotals {
    pub subtotal: Money,
    pub shipping: Money,
    pub total: Money,
}

impl OrderTotals {
    /// Whether `total == subtotal + shipping`.
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.total == self.subtotal + self.shipping
    }
}

/// Price a list of line items with the flat [`SHIPPING_FEE`].
#[must_use]
pub fn price_items(items: &[LineItem]) -> OrderTotals {
    let subtotal: Money = items.iter().map(LineItem::line_total).sum();
    OrderTotals {
        subtotal,
        shipping: SHIPPING_FEE,
        total: subtotal + SHIPPING_FEE,
    }
}

/// An order about to be persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOrder {
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub totals: OrderTotals,
    pub currency: CurrencyCode,
}

impl NewOrder {
    /// Build a new order, computing totals from the items.
    #[must_use]
    pub fn priced(
        user_id: UserId,
        items: Vec<LineItem>,
        shipping_address: ShippingAddress,
        payment_method: PaymentMethod,
        currency: CurrencyCode,
    ) -> Self {
        let totals = price_items(&items);
        Self {
            user_id,
            items,
            shipping_address,
            payment_method,
            totals,
            currency,
        }
    }

    /// Validate required fields and total consistency.
    ///
    /// # Errors
    ///
    /// Returns an [`OrderValidationError`] describing the first problem found.
    pub fn validate(&self) -> Result<(), OrderValidationError> {
        if self.items.is_empty() {
            return Err(OrderValidationError::NoItems);
        }
        if let Some(item) = self
            .items
            .iter()
            .find(|item| item.quantity == 0 || item.quantity > MAX_LINE_QUANTITY)
        {
            return Err(OrderValidationError::InvalidQuantity {
                product_id: item.product_id,
            });
        }
        self.shipping_address.validate()?;
        if !self.totals.is_consistent() || price_items(&self.items) != self.totals {
            return Err(OrderValidationError::InconsistentTotals);
        }
        Ok(())
    }
}

/// A persisted order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Order {
    pub id: OrderId,
    pub user_id: UserId,
    pub items: Vec<LineItem>,
    pub shipping_address: ShippingAddress,
    pub payment_method: PaymentMethod,
    pub payment_status: PaymentStatus,
    pub order_status: OrderStatus,
    pub subtotal: Money,
    pub shipping_fee: Money,
    pub total: Money,
    pub currency: CurrencyCode,
    /// Gateway order id, set once the authorization is created.
    pub external_order_id: Option<String>,
    /// Gateway capture id, set when the payment is captured.
    pub external_capture_id: Option<String>,
    /// `false` once soft-deleted. Orders are never physically removed.
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    /// Totals as stored.
    #[must_use]
    pub const fn totals(&self) -> OrderTotals {
        OrderTotals {
            subtotal: self.subtotal,
            shipping: self.shipping_fee,
            total: self.total,
        }
    }

    /// Recompute the subtotal from the stored line items.
    #[must_use]
    pub fn recomputed_subtotal(&self) -> Money {
        self.items.iter().map(LineItem::line_total).sum()
    }

    /// A gateway order whose payment has not been captured yet.
    #[must_use]
    pub fn is_awaiting_gateway_payment(&self) -> bool {
        self.payment_method == PaymentMethod::Gateway
            && self.payment_status == PaymentStatus::Pending
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    pub(crate) fn item(product: i64, price: rust_decimal::Decimal, quantity: u32) -> LineItem {
        LineItem {
            product_id: ProductId::new(product),
            name: format!("Product {product}"),
            unit_price: Money::new(price).unwrap(),
            quantity,
            variant: None,
        }
    }

    pub(crate) fn address() -> ShippingAddress {
        ShippingAddress {
            full_name: "Ada Lovelace".to_string(),
            line1: "12 Analytical Way".to_string(),
            line2: None,
            city: "London".to_string(),
            state: String::new(),
            postal_code: "N1 9GU".to_string(),
            country: "GB".to_string(),
            phone: String::new(),
        }
    }

    #[test]
    fn test_price_items_scenario() {
        let items = vec![item(1, dec!(5.00), 2), item(2, dec!(3.00), 1)];
        let totals = price_items(&items);
        assert_eq!(totals.subtotal, Money::new(dec!(13.00)).unwrap());
        assert_eq!(totals.shipping, Money::new(dec!(10.00)).unwrap());
        assert_eq!(totals.total, Money::new(dec!(23.00)).unwrap());
        assert!(totals.is_consistent());
    }

    #[test]
    fn test_validate_rejects_empty_items() {
        let order = NewOrder::priced(
            UserId::new(1),
            vec![],
            address(),
            PaymentMethod::Cod,
            CurrencyCode::USD,
        );
        assert_eq!(order.validate(), Err(OrderValidationError::NoItems));
    }

    #[test]
    fn test_validate_rejects_zero_quantity() {
        let order = NewOrder::priced(
            UserId::new(1),
            vec![item(4, dec!(1.00), 0)],
            address(),
            PaymentMethod::Cod,
            CurrencyCode::USD,
        );
        assert_eq!(
            order.validate(),
            Err(OrderValidationError::InvalidQuantity {
                product_id: ProductId::new(4)
            })
        );
    }

    #[test]
    fn test_validate_rejects_blank_address() {
        let mut addr = address();
        addr.city = "  ".to_string();
        let order = NewOrder::priced(
            UserId::new(1),
            vec![item(1, dec!(1.00), 1)],
            addr,
            PaymentMethod::Gateway,
            CurrencyCode::USD,
        );
        assert_eq!(
            order.validate(),
            Err(OrderValidationError::MissingAddressField("city"))
        );
    }

    #[test]
    fn test_validate_rejects_tampered_totals() {
        let mut order = NewOrder::priced(
            UserId::new(1),
            vec![item(1, dec!(1.00), 1)],
            address(),
            PaymentMethod::Gateway,
            CurrencyCode::USD,
        );
        order.totals.total = Money::from_cents(1);
        assert_eq!(
            order.validate(),
            Err(OrderValidationError::InconsistentTotals)
        );
    }

    #[test]
    fn test_order_json_uses_camel_case() {
        let json = serde_json::to_value(item(3, dec!(2.50), 4)).unwrap();
        assert_eq!(json["productId"], 3);
        assert_eq!(json["unitPrice"], "2.50");
        assert!(json.get("variant").is_none());
    }
}
