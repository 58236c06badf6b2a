//! Monetary amounts.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// A monetary amount in minor units (2 fractional digits).
///
/// `Money(123_456)` renders as `1234.56`. Single currency; arithmetic is
/// checked so ledger aggregation can never silently wrap.
#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Money(i64);

impl Money {
    pub const ZERO: Money = Money(0);

    /// Construct from minor units (e.g. `Money::from_minor(123_456)` = 1234.56).
    pub const fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    /// Construct from whole major units.
    pub const fn from_major(major: i64) -> Self {
        Self(major * 100)
    }

    pub const fn minor(&self) -> i64 {
        self.0
    }

    pub const fn is_zero(&self) -> bool {
        self.0 == 0
    }

    pub const fn is_positive(&self) -> bool {
        self.0 > 0
    }

    pub fn checked_add(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_add(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::validation("money overflow in addition"))
    }

    pub fn checked_sub(self, other: Money) -> DomainResult<Money> {
        self.0
            .checked_sub(other.0)
            .map(Money)
            .ok_or_else(|| DomainError::validation("money overflow in subtraction"))
    }

    /// `self - other`, floored at zero. Used for net-cash computations where
    /// a negative result means "nothing owed", never a reverse payment.
    pub fn saturating_sub_floor(self, other: Money) -> Money {
        Money(self.0.saturating_sub(other.0).max(0))
    }

    pub fn min(self, other: Money) -> Money {
        Money(self.0.min(other.0))
    }

    /// Sum an iterator of amounts with overflow checking.
    pub fn sum<I: IntoIterator<Item = Money>>(amounts: I) -> DomainResult<Money> {
        amounts
            .into_iter()
            .try_fold(Money::ZERO, |acc, m| acc.checked_add(m))
    }
}

impl ValueObject for Money {}

impl core::fmt::Display for Money {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let sign = if self.0 < 0 { "-" } else { "" };
        let abs = self.0.unsigned_abs();
        write!(f, "{}{}.{:02}", sign, abs / 100, abs % 100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn displays_with_two_fractional_digits() {
        assert_eq!(Money::from_minor(123_456).to_string(), "1234.56");
        assert_eq!(Money::from_minor(5).to_string(), "0.05");
        assert_eq!(Money::from_minor(-250).to_string(), "-2.50");
        assert_eq!(Money::ZERO.to_string(), "0.00");
    }

    #[test]
    fn checked_add_detects_overflow() {
        let max = Money::from_minor(i64::MAX);
        assert!(max.checked_add(Money::from_minor(1)).is_err());
        assert_eq!(
            Money::from_minor(70).checked_add(Money::from_minor(30)).unwrap(),
            Money::from_major(1)
        );
    }

    #[test]
    fn saturating_sub_floors_at_zero() {
        let a = Money::from_major(20);
        let b = Money::from_major(50);
        assert_eq!(a.saturating_sub_floor(b), Money::ZERO);
        assert_eq!(b.saturating_sub_floor(a), Money::from_major(30));
    }

    #[test]
    fn sum_accumulates() {
        let total = Money::sum(vec![
            Money::from_major(1),
            Money::from_major(2),
            Money::from_minor(50),
        ])
        .unwrap();
        assert_eq!(total, Money::from_minor(350));
    }
}
