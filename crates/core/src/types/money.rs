//! Monetary amounts using decimal arithmetic.
//!
//! Mercato runs on a single base currency per deployment, so [`Money`] carries
//! only an amount. The [`CurrencyCode`] is fixed in configuration and attached
//! to orders and gateway requests separately.

use core::fmt;
use core::iter::Sum;
use core::ops::Add;

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Errors that can occur when constructing a [`Money`] value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MoneyError {
    /// Negative amounts are never valid prices or totals.
    #[error("amount cannot be negative")]
    Negative,
    /// More precision than the smallest currency unit.
    #[error("amount has more than {max} decimal places")]
    TooPrecise {
        /// Maximum allowed scale.
        max: u32,
    },
}

/// A non-negative amount in the base currency's standard unit (dollars, not cents).
///
/// Amounts always carry exactly two decimal places so that
/// `price * quantity` and sums are exact and reproducible from stored line items.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(Decimal);

impl Money {
    /// Number of decimal places in the smallest currency unit.
    pub const SCALE: u32 = 2;

    /// Zero.
    pub const ZERO: Self = Self(Decimal::from_parts(0, 0, 0, false, Self::SCALE));

    /// The smallest amount the payment gateway will accept (one cent).
    pub const MINIMUM_CHARGE: Self = Self(Decimal::from_parts(1, 0, 0, false, Self::SCALE));

    /// Create a money value from a decimal amount.
    ///
    /// # Errors
    ///
    /// Returns an error if the amount is negative or has sub-cent precision.
    pub fn new(amount: Decimal) -> Result<Self, MoneyError> {
        if amount.is_sign_negative() && !amount.is_zero() {
            return Err(MoneyError::Negative);
        }
        let normalized = amount.normalize();
        if normalized.scale() > Self::SCALE {
            return Err(MoneyError::TooPrecise { max: Self::SCALE });
        }
        let mut fixed = normalized;
        fixed.rescale(Self::SCALE);
        Ok(Self(fixed))
    }

    /// Create a money value from an integer number of cents.
    #[must_use]
    pub const fn from_cents(cents: u32) -> Self {
        Self(Decimal::from_parts(cents, 0, 0, false, Self::SCALE))
    }

    /// The underlying decimal amount.
    #[must_use]
    pub const fn amount(&self) -> Decimal {
        self.0
    }

    /// Multiply by a quantity.
    #[must_use]
    pub fn times(self, quantity: u32) -> Self {
        Self(self.0 * Decimal::from(quantity))
    }

    /// Whether this amount is at least the gateway's minimum charge.
    #[must_use]
    pub fn is_chargeable(&self) -> bool {
        *self >= Self::MINIMUM_CHARGE
    }

    /// Format as a fixed two-decimal string (e.g. `"23.00"`), as payment providers expect.
    #[must_use]
    pub fn to_fixed_string(&self) -> String {
        format!("{:.2}", self.0)
    }
}

impl Add for Money {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        Self(self.0 + rhs.0)
    }
}

impl Sum for Money {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

impl fmt::Display for Money {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:.2}", self.0)
    }
}

impl TryFrom<Decimal> for Money {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

#[cfg(feature = "postgres")]
impl ::sqlx::Type<::sqlx::Postgres> for Money {
    fn type_info() -> ::sqlx::postgres::PgTypeInfo {
        <Decimal as ::sqlx::Type<::sqlx::Postgres>>::type_info()
    }

    fn compatible(ty: &::sqlx::postgres::PgTypeInfo) -> bool {
        <Decimal as ::sqlx::Type<::sqlx::Postgres>>::compatible(ty)
    }
}

#[cfg(feature = "postgres")]
impl<'r> ::sqlx::Decode<'r, ::sqlx::Postgres> for Money {
    fn decode(
        value: ::sqlx::postgres::PgValueRef<'r>,
    ) -> Result<Self, ::sqlx::error::BoxDynError> {
        let amount = <Decimal as ::sqlx::Decode<::sqlx::Postgres>>::decode(value)?;
        Ok(Self::new(amount)?)
    }
}

#[cfg(feature = "postgres")]
impl ::sqlx::Encode<'_, ::sqlx::Postgres> for Money {
    fn encode_by_ref(
        &self,
        buf: &mut ::sqlx::postgres::PgArgumentBuffer,
    ) -> Result<::sqlx::encode::IsNull, ::sqlx::error::BoxDynError> {
        <Decimal as ::sqlx::Encode<::sqlx::Postgres>>::encode_by_ref(&self.0, buf)
    }
}

/// ISO 4217 currency codes a deployment may choose as its base currency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum CurrencyCode {
    #[default]
    USD,
    EUR,
    GBP,
    CAD,
    AUD,
}

impl CurrencyCode {
    /// The three-letter ISO code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::USD => "USD",
            Self::EUR => "EUR",
            Self::GBP => "GBP",
            Self::CAD => "CAD",
            Self::AUD => "AUD",
        }
    }
}

impl fmt::Display for CurrencyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for CurrencyCode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "USD" => Ok(Self::USD),
            "EUR" => Ok(Self::EUR),
            "GBP" => Ok(Self::GBP),
            "CAD" => Ok(Self::CAD),
            "AUD" => Ok(Self::AUD),
            _ => Err(format!("unsupported currency: {s}")),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rust_decimal_macros::dec;

    use super::*;

    #[test]
    fn test_new_rescales_to_cents() {
        let m = Money::new(dec!(5)).unwrap();
        assert_eq!(m.to_fixed_string(), "5.00");
        assert_eq!(m.amount().scale(), 2);
    }

    #[test]
    fn test_new_rejects_negative_and_sub_cent() {
        assert_eq!(Money::new(dec!(-1.00)), Err(MoneyError::Negative));
        assert_eq!(
            Money::new(dec!(0.001)),
            Err(MoneyError::TooPrecise { max: 2 })
        );
        // Trailing zeros beyond two places are fine
        assert!(Money::new(dec!(1.2300)).is_ok());
    }

    #[test]
    fn test_times_and_sum_are_exact() {
        let a = Money::new(dec!(5.00)).unwrap().times(2);
        let b = Money::new(dec!(3.00)).unwrap().times(1);
        let total: Money = [a, b].into_iter().sum();
        assert_eq!(total, Money::from_cents(1300));
    }

    #[test]
    fn test_minimum_charge() {
        assert!(!Money::ZERO.is_chargeable());
        assert!(Money::from_cents(1).is_chargeable());
        assert_eq!(Money::MINIMUM_CHARGE.to_string(), "0.01");
    }

    #[test]
    fn test_currency_round_trip() {
        assert_eq!("usd".parse::<CurrencyCode>().unwrap(), CurrencyCode::USD);
        assert_eq!(CurrencyCode::GBP.to_string(), "GBP");
        assert!("XYZ".parse::<CurrencyCode>().is_err());
    }
}
