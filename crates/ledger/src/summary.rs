//! Debt/wage aggregation.
//!
//! Balances are always computed fresh from the underlying records; there is
//! deliberately no stored running balance that could drift.

use serde::{Deserialize, Serialize};

use tanibuku_core::{DomainResult, Money};

use crate::records::{KasbonAdvance, WageAccrual};

/// A worker's derived balance within some scope (farm or activity).
#[derive(Debug, Default, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerBalance {
    /// Σ unpaid wage accruals.
    pub pending_wage: Money,
    /// Σ outstanding kasbon (amount − amount_repaid over open advances).
    pub open_kasbon: Money,
}

impl WorkerBalance {
    pub fn has_open_debt(&self) -> bool {
        self.open_kasbon.is_positive()
    }
}

/// Summarize a worker's accruals and advances.
///
/// Callers pass the records already filtered to the worker and scope; this
/// function is pure and side-effect free. A worker with no records yields
/// the zero balance, not an error.
pub fn summarize(
    accruals: &[WageAccrual],
    advances: &[KasbonAdvance],
) -> DomainResult<WorkerBalance> {
    let pending_wage = Money::sum(accruals.iter().filter(|a| !a.paid).map(|a| a.amount))?;
    let open_kasbon = Money::sum(
        advances
            .iter()
            .filter(|k| k.is_open())
            .map(|k| k.outstanding()),
    )?;

    Ok(WorkerBalance {
        pending_wage,
        open_kasbon,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::KasbonStatus;
    use chrono::NaiveDate;
    use tanibuku_core::{ActivityId, WorkerId};

    fn date() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 2, 1).unwrap()
    }

    fn accrual(worker: WorkerId, amount: i64, paid: bool) -> WageAccrual {
        let mut a =
            WageAccrual::new(worker, ActivityId::new(), Money::from_major(amount), date())
                .unwrap();
        a.paid = paid;
        a
    }

    fn kasbon(worker: WorkerId, amount: i64, repaid: i64) -> KasbonAdvance {
        let mut k =
            KasbonAdvance::new(worker, ActivityId::new(), Money::from_major(amount), date())
                .unwrap();
        if repaid > 0 {
            k.apply_repayment(Money::from_major(repaid)).unwrap();
        }
        k
    }

    #[test]
    fn empty_history_yields_zero_balance() {
        let balance = summarize(&[], &[]).unwrap();
        assert_eq!(balance, WorkerBalance::default());
        assert!(!balance.has_open_debt());
    }

    #[test]
    fn pending_wage_counts_only_unpaid_accruals() {
        let w = WorkerId::new();
        let balance = summarize(
            &[accrual(w, 100, false), accrual(w, 40, true), accrual(w, 60, false)],
            &[],
        )
        .unwrap();
        assert_eq!(balance.pending_wage, Money::from_major(160));
    }

    #[test]
    fn open_kasbon_is_outstanding_over_open_advances() {
        let w = WorkerId::new();
        let fully_paid = kasbon(w, 80, 80);
        assert_eq!(fully_paid.status, KasbonStatus::Paid);

        let balance = summarize(&[], &[kasbon(w, 100, 30), fully_paid]).unwrap();
        assert_eq!(balance.open_kasbon, Money::from_major(70));
        assert!(balance.has_open_debt());
    }

    #[test]
    fn summarize_is_repeatable_without_mutation() {
        let w = WorkerId::new();
        let accruals = [accrual(w, 25, false)];
        let advances = [kasbon(w, 10, 0)];
        let first = summarize(&accruals, &advances).unwrap();
        let second = summarize(&accruals, &advances).unwrap();
        assert_eq!(first, second);
    }
}
