//! Exact two-decimal monetary amounts.

use core::fmt;
use core::str::FromStr;

use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

use crate::value_object::ValueObject;

/// Number of fractional digits every amount carries.
pub const SCALE: u32 = 2;

/// Why a raw decimal could not become a [`MoneyAmount`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MoneyError {
    #[error("amount is required")]
    MissingValue,

    /// More than two significant fractional digits. Never rounded.
    #[error("amount {value} must have at most 2 decimal places")]
    InvalidScale { value: String },

    #[error("amount {value} must be positive")]
    NonPositive { value: String },

    #[error("amount {value} must be non-negative")]
    Negative { value: String },

    #[error("amount {value:?} is not a decimal number")]
    Unparseable { value: String },

    #[error("amount arithmetic overflowed")]
    Overflow,
}

/// A signed decimal amount whose scale is always exactly 2.
///
/// Construction never rounds: `12.345` is rejected, while `1.500` is accepted
/// as `1.50` because the dropped digit is zero. Serialized as a decimal string
/// (`"12.34"`) so the value survives any JSON boundary unchanged.
///
/// ```rust
/// use tally_core::MoneyAmount;
///
/// let amount = MoneyAmount::parse("10.5").unwrap();
/// assert_eq!(amount.to_string(), "10.50");
/// assert!(MoneyAmount::parse("0.001").is_err());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MoneyAmount(Decimal);

impl ValueObject for MoneyAmount {}

impl MoneyAmount {
    /// `0.00`
    pub fn zero() -> Self {
        Self(Decimal::new(0, SCALE))
    }

    /// Build an amount from integer minor units (cents).
    pub fn from_minor(minor: i64) -> Self {
        Self(Decimal::new(minor, SCALE))
    }

    /// Rescale `raw` to exactly two decimals without rounding.
    pub fn from_decimal(raw: Decimal) -> Result<Self, MoneyError> {
        if raw.scale() > SCALE && raw.round_dp(SCALE) != raw {
            return Err(MoneyError::InvalidScale {
                value: raw.to_string(),
            });
        }

        let mut value = raw;
        value.rescale(SCALE);
        if value.scale() != SCALE {
            return Err(MoneyError::Overflow);
        }
        if value.is_zero() {
            value.set_sign_positive(true);
        }
        Ok(Self(value))
    }

    /// Normalize an optional raw input.
    ///
    /// - absent → [`MoneyError::MissingValue`]
    /// - more than 2 significant decimals → [`MoneyError::InvalidScale`]
    /// - `allow_zero == false` and value ≤ 0 → [`MoneyError::NonPositive`]
    /// - `allow_zero == true` and value < 0 → [`MoneyError::Negative`]
    pub fn normalize(raw: Option<Decimal>, allow_zero: bool) -> Result<Self, MoneyError> {
        let raw = raw.ok_or(MoneyError::MissingValue)?;
        let amount = Self::from_decimal(raw)?;

        if allow_zero {
            if amount.is_negative() {
                return Err(MoneyError::Negative {
                    value: amount.to_string(),
                });
            }
        } else if !amount.is_positive() {
            return Err(MoneyError::NonPositive {
                value: amount.to_string(),
            });
        }

        Ok(amount)
    }

    /// Parse decimal text (`"12.30"`, `"-4"`) with the same scale rule as
    /// [`MoneyAmount::from_decimal`].
    pub fn parse(text: &str) -> Result<Self, MoneyError> {
        let trimmed = text.trim();
        let raw = Decimal::from_str(trimmed).map_err(|_| MoneyError::Unparseable {
            value: text.to_string(),
        })?;
        Self::from_decimal(raw)
    }

    pub fn as_decimal(&self) -> Decimal {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }

    pub fn is_positive(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_positive()
    }

    pub fn is_negative(&self) -> bool {
        !self.0.is_zero() && self.0.is_sign_negative()
    }

    pub fn checked_add(self, rhs: MoneyAmount) -> Result<MoneyAmount, MoneyError> {
        self.0
            .checked_add(rhs.0)
            .ok_or(MoneyError::Overflow)
            .and_then(Self::from_decimal)
    }

    pub fn checked_sub(self, rhs: MoneyAmount) -> Result<MoneyAmount, MoneyError> {
        self.0
            .checked_sub(rhs.0)
            .ok_or(MoneyError::Overflow)
            .and_then(Self::from_decimal)
    }
}

impl Default for MoneyAmount {
    fn default() -> Self {
        Self::zero()
    }
}

impl fmt::Display for MoneyAmount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for MoneyAmount {
    type Err = MoneyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<Decimal> for MoneyAmount {
    type Error = MoneyError;

    fn try_from(value: Decimal) -> Result<Self, Self::Error> {
        Self::from_decimal(value)
    }
}

impl From<MoneyAmount> for Decimal {
    fn from(value: MoneyAmount) -> Self {
        value.0
    }
}

impl Serialize for MoneyAmount {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for MoneyAmount {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let text = String::deserialize(deserializer)?;
        MoneyAmount::parse(&text).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn dec(text: &str) -> Decimal {
        Decimal::from_str(text).unwrap()
    }

    #[test]
    fn normalize_pads_scale_to_two() {
        let amount = MoneyAmount::normalize(Some(dec("5")), false).unwrap();
        assert_eq!(amount.to_string(), "5.00");
        assert_eq!(amount.as_decimal().scale(), SCALE);
    }

    #[test]
    fn normalize_accepts_insignificant_trailing_zeros() {
        let amount = MoneyAmount::normalize(Some(dec("1.500")), false).unwrap();
        assert_eq!(amount.to_string(), "1.50");
    }

    #[test]
    fn normalize_rejects_more_than_two_decimals() {
        let err = MoneyAmount::normalize(Some(dec("12.345")), true).unwrap_err();
        assert_eq!(
            err,
            MoneyError::InvalidScale {
                value: "12.345".to_string()
            }
        );
    }

    #[test]
    fn normalize_requires_a_value() {
        assert_eq!(
            MoneyAmount::normalize(None, true),
            Err(MoneyError::MissingValue)
        );
    }

    #[test]
    fn zero_is_allowed_only_when_requested() {
        assert_eq!(
            MoneyAmount::normalize(Some(dec("0")), true).unwrap(),
            MoneyAmount::zero()
        );
        assert!(matches!(
            MoneyAmount::normalize(Some(dec("0.00")), false),
            Err(MoneyError::NonPositive { .. })
        ));
    }

    #[test]
    fn negative_fails_with_the_matching_kind() {
        assert!(matches!(
            MoneyAmount::normalize(Some(dec("-1.00")), true),
            Err(MoneyError::Negative { .. })
        ));
        assert!(matches!(
            MoneyAmount::normalize(Some(dec("-1.00")), false),
            Err(MoneyError::NonPositive { .. })
        ));
    }

    #[test]
    fn negative_zero_prints_unsigned() {
        let amount = MoneyAmount::parse("-0").unwrap();
        assert_eq!(amount.to_string(), "0.00");
        assert!(!amount.is_negative());
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(
            MoneyAmount::parse("ten"),
            Err(MoneyError::Unparseable { .. })
        ));
    }

    proptest! {
        #[test]
        fn addition_is_exact(a in 0i64..1_000_000_000, b in 0i64..1_000_000_000) {
            let sum = MoneyAmount::from_minor(a)
                .checked_add(MoneyAmount::from_minor(b))
                .unwrap();
            prop_assert_eq!(sum, MoneyAmount::from_minor(a + b));
            prop_assert_eq!(sum.as_decimal().scale(), SCALE);
        }

        #[test]
        fn three_decimal_inputs_are_rejected_unless_trailing_zero(minor in 1i64..10_000_000, last in 1i64..10) {
            let raw = Decimal::new(minor * 10 + last, 3);
            prop_assert!(
                matches!(MoneyAmount::from_decimal(raw), Err(MoneyError::InvalidScale { .. })),
                "expected InvalidScale error"
            );
        }
    }
}
