//! Status enums for orders, payments and users.
//!
//! Wire names (JSON and Postgres enum labels) are `snake_case`. The legal
//! transitions between these values live in [`crate::lifecycle`].

use serde::{Deserialize, Serialize};

/// Implements `as_str`, `Display`, `FromStr` and `ALL` for a fieldless enum.
macro_rules! wire_names {
    ($ty:ident { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Every variant, in declaration order.
            pub const ALL: &'static [Self] = &[$(Self::$variant),+];

            /// The `snake_case` wire name.
            #[must_use]
            pub const fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $name),+
                }
            }
        }

        impl ::core::fmt::Display for $ty {
            fn fmt(&self, f: &mut ::core::fmt::Formatter<'_>) -> ::core::fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl ::core::str::FromStr for $ty {
            type Err = String;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s.trim() {
                    $($name => Ok(Self::$variant),)+
                    other => Err(format!(concat!("invalid ", stringify!($ty), ": {}"), other)),
                }
            }
        }
    };
}

/// Payment state of an order.
///
/// `pending -> completed | failed`, `completed -> refunded`. Nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "payment_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    #[default]
    Pending,
    Completed,
    Failed,
    Refunded,
}

wire_names!(PaymentStatus {
    Pending => "pending",
    Completed => "completed",
    Failed => "failed",
    Refunded => "refunded",
});

/// Fulfillment state of an order.
///
/// Moves forward only, possibly skipping steps; `cancelled` is reachable
/// from any state before `delivered`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "order_status", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    #[default]
    Placed,
    Packing,
    Shipped,
    OutForDelivery,
    Delivered,
    Cancelled,
}

wire_names!(OrderStatus {
    Placed => "placed",
    Packing => "packing",
    Shipped => "shipped",
    OutForDelivery => "out_for_delivery",
    Delivered => "delivered",
    Cancelled => "cancelled",
});

impl OrderStatus {
    /// Position in the forward fulfillment sequence. `None` for `cancelled`.
    #[must_use]
    pub const fn rank(&self) -> Option<u8> {
        match self {
            Self::Placed => Some(0),
            Self::Packing => Some(1),
            Self::Shipped => Some(2),
            Self::OutForDelivery => Some(3),
            Self::Delivered => Some(4),
            Self::Cancelled => None,
        }
    }

    /// Terminal states accept no further transitions.
    #[must_use]
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Delivered | Self::Cancelled)
    }

    /// Whether the customer sees this as a shipping milestone.
    #[must_use]
    pub const fn is_shipping_milestone(&self) -> bool {
        matches!(
            self,
            Self::Shipped | Self::OutForDelivery | Self::Delivered
        )
    }
}

/// How the customer pays for an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "payment_method", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    /// Cash on delivery: no online payment step.
    Cod,
    /// Third-party payment gateway (authorize, then capture).
    Gateway,
}

wire_names!(PaymentMethod {
    Cod => "cod",
    Gateway => "gateway",
});

/// Account role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[cfg_attr(feature = "postgres", derive(sqlx::Type))]
#[cfg_attr(
    feature = "postgres",
    sqlx(type_name = "user_role", rename_all = "snake_case")
)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// Storefront shopper.
    #[default]
    Customer,
    /// Admin console operator.
    Admin,
}

wire_names!(Role {
    Customer => "customer",
    Admin => "admin",
});
