//! Per-user shopping cart.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::types::ProductId;

/// Variant key used for products without a color/variant choice.
pub const DEFAULT_VARIANT: &str = "default";

/// A user's cart: product id -> variant -> quantity.
///
/// Serialized as a nested JSON object, e.g.
/// `{"12": {"red": 2, "blue": 1}, "7": {"default": 1}}`.
/// The cart is replaced or cleared as a whole; there is no partial clear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cart(HashMap<ProductId, HashMap<String, u32>>);

impl Cart {
    /// An empty cart.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `quantity` units of a product variant. Zero quantities are ignored.
    pub fn add(&mut self, product_id: ProductId, variant: Option<&str>, quantity: u32) {
        if quantity == 0 {
            return;
        }
        let key = variant.unwrap_or(DEFAULT_VARIANT).to_owned();
        let slot = self.0.entry(product_id).or_default().entry(key).or_insert(0);
        *slot = slot.saturating_add(quantity);
    }

    /// Quantity of a product variant in the cart.
    #[must_use]
    pub fn quantity(&self, product_id: ProductId, variant: Option<&str>) -> u32 {
        self.0
            .get(&product_id)
            .and_then(|variants| variants.get(variant.unwrap_or(DEFAULT_VARIANT)))
            .copied()
            .unwrap_or(0)
    }

    /// Whether the cart holds no units.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.total_units() == 0
    }

    /// Sum of all quantities.
    #[must_use]
    pub fn total_units(&self) -> u64 {
        self.0
            .values()
            .flat_map(HashMap::values)
            .map(|q| u64::from(*q))
            .sum()
    }

    /// Drop zero-quantity entries and products with no variants left.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        for variants in self.0.values_mut() {
            variants.retain(|_, q| *q > 0);
        }
        self.0.retain(|_, variants| !variants.is_empty());
        self
    }
}
