use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use tanibuku_core::{
    ActivityId, DomainError, DomainResult, Entity, FarmId, Money, RecordId, WorkerId,
};

/// Wage accrual identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AccrualId(pub RecordId);

/// Kasbon advance identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct KasbonId(pub RecordId);

/// Cash payment identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PaymentId(pub RecordId);

/// Settlement identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SettlementId(pub RecordId);

macro_rules! impl_record_id {
    ($t:ty) => {
        impl $t {
            pub fn new(id: RecordId) -> Self {
                Self(id)
            }

            pub fn generate() -> Self {
                Self(RecordId::new())
            }
        }

        impl core::fmt::Display for $t {
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                core::fmt::Display::fmt(&self.0, f)
            }
        }
    };
}

impl_record_id!(AccrualId);
impl_record_id!(KasbonId);
impl_record_id!(PaymentId);
impl_record_id!(SettlementId);

/// A wage earned by a worker for one completed assignment.
///
/// Created when the assignment is marked done; never deleted. The only legal
/// mutation is flipping `paid`, and only the settlement engine does that.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WageAccrual {
    pub id: AccrualId,
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub earned_on: NaiveDate,
    pub paid: bool,
}

impl WageAccrual {
    pub fn new(
        worker_id: WorkerId,
        activity_id: ActivityId,
        amount: Money,
        earned_on: NaiveDate,
    ) -> DomainResult<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation("wage amount must be positive"));
        }
        Ok(Self {
            id: AccrualId::generate(),
            worker_id,
            activity_id,
            amount,
            earned_on,
            paid: false,
        })
    }
}

impl Entity for WageAccrual {
    type Id = AccrualId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Repayment status of a kasbon advance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KasbonStatus {
    Open,
    Paid,
}

/// A cash advance ("kasbon") given to a worker against future wages.
///
/// Invariants: `0 <= amount_repaid <= amount` always, and
/// `status == Paid` iff `amount_repaid == amount`. Repayment is monotonic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KasbonAdvance {
    pub id: KasbonId,
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub amount_repaid: Money,
    pub issued_on: NaiveDate,
    pub status: KasbonStatus,
}

impl KasbonAdvance {
    pub fn new(
        worker_id: WorkerId,
        activity_id: ActivityId,
        amount: Money,
        issued_on: NaiveDate,
    ) -> DomainResult<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation("kasbon amount must be positive"));
        }
        Ok(Self {
            id: KasbonId::generate(),
            worker_id,
            activity_id,
            amount,
            amount_repaid: Money::ZERO,
            issued_on,
            status: KasbonStatus::Open,
        })
    }

    /// The unrepaid remainder of this advance.
    pub fn outstanding(&self) -> Money {
        self.amount.saturating_sub_floor(self.amount_repaid)
    }

    pub fn is_open(&self) -> bool {
        self.status == KasbonStatus::Open
    }

    /// Apply a repayment, preserving the record invariants.
    ///
    /// Only the settlement engine calls this. Flips to `Paid` exactly when
    /// the full amount has been repaid.
    pub fn apply_repayment(&mut self, pay: Money) -> DomainResult<()> {
        if !pay.is_positive() {
            return Err(DomainError::validation("repayment must be positive"));
        }
        if pay > self.outstanding() {
            return Err(DomainError::validation(
                "repayment exceeds outstanding kasbon balance",
            ));
        }
        self.amount_repaid = self.amount_repaid.checked_add(pay)?;
        if self.amount_repaid == self.amount {
            self.status = KasbonStatus::Paid;
        }
        Ok(())
    }
}

impl Entity for KasbonAdvance {
    type Id = KasbonId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Kind of a direct cash payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentKind {
    DirectWage,
}

/// Cash handed over outside of a settlement pass.
///
/// Informational: it does not reduce `pending_wage` in the aggregator and is
/// kept separate from kasbon repayment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CashPayment {
    pub id: PaymentId,
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub paid_on: NaiveDate,
    pub kind: PaymentKind,
}

impl CashPayment {
    pub fn new(
        worker_id: WorkerId,
        activity_id: ActivityId,
        amount: Money,
        paid_on: NaiveDate,
    ) -> DomainResult<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation("payment amount must be positive"));
        }
        Ok(Self {
            id: PaymentId::generate(),
            worker_id,
            activity_id,
            amount,
            paid_on,
            kind: PaymentKind::DirectWage,
        })
    }
}

impl Entity for CashPayment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Append-only audit record of one settlement pass.
///
/// `total_earnings` and `total_kasbon` are the snapshot amounts available at
/// settlement time, not the post-settlement remainders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub worker_id: WorkerId,
    pub farm_id: FarmId,
    pub total_earnings: Money,
    pub total_kasbon: Money,
    pub cash_paid: Money,
    pub settled_on: NaiveDate,
    pub notes: Option<String>,
}

impl Entity for Settlement {
    type Id = SettlementId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).unwrap()
    }

    #[test]
    fn accrual_rejects_non_positive_amount() {
        let err = WageAccrual::new(
            WorkerId::new(),
            ActivityId::new(),
            Money::ZERO,
            date(),
        )
        .unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
    }

    #[test]
    fn kasbon_starts_open_with_zero_repaid() {
        let k = KasbonAdvance::new(
            WorkerId::new(),
            ActivityId::new(),
            Money::from_major(300),
            date(),
        )
        .unwrap();
        assert_eq!(k.status, KasbonStatus::Open);
        assert_eq!(k.amount_repaid, Money::ZERO);
        assert_eq!(k.outstanding(), Money::from_major(300));
    }

    #[test]
    fn partial_repayment_keeps_kasbon_open() {
        let mut k = KasbonAdvance::new(
            WorkerId::new(),
            ActivityId::new(),
            Money::from_major(500),
            date(),
        )
        .unwrap();

        k.apply_repayment(Money::from_major(200)).unwrap();
        assert_eq!(k.status, KasbonStatus::Open);
        assert_eq!(k.outstanding(), Money::from_major(300));

        k.apply_repayment(Money::from_major(300)).unwrap();
        assert_eq!(k.status, KasbonStatus::Paid);
        assert_eq!(k.outstanding(), Money::ZERO);
    }

    #[test]
    fn repayment_cannot_exceed_outstanding() {
        let mut k = KasbonAdvance::new(
            WorkerId::new(),
            ActivityId::new(),
            Money::from_major(100),
            date(),
        )
        .unwrap();
        k.apply_repayment(Money::from_major(60)).unwrap();

        let err = k.apply_repayment(Money::from_major(50)).unwrap_err();
        assert!(matches!(err, DomainError::Validation(_)));
        // Record untouched by the failed call.
        assert_eq!(k.amount_repaid, Money::from_major(60));
        assert_eq!(k.status, KasbonStatus::Open);
    }
}
