//! Settlement planning.
//!
//! The planner is the pure half of the settlement engine: given a snapshot of
//! a worker's ledger it decides which records are consumed and how earnings
//! are split between kasbon repayment and cash. Applying the plan (flipping
//! `paid`, incrementing `amount_repaid`, inserting the `Settlement` row)
//! happens in the store layer, inside one transaction.

use serde::{Deserialize, Serialize};

use tanibuku_core::{DomainResult, Money};

use crate::records::{AccrualId, KasbonAdvance, KasbonId, WageAccrual};

/// One repayment applied to an open kasbon advance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KasbonRepayment {
    pub kasbon_id: KasbonId,
    pub pay: Money,
}

/// The decided outcome of one settlement pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementPlan {
    /// Σ unpaid wage accruals at settlement time (pre-settlement snapshot).
    pub total_earnings: Money,
    /// Σ outstanding kasbon at settlement time (pre-settlement snapshot).
    pub total_kasbon: Money,
    /// Net cash to hand over: `max(0, total_earnings − total_kasbon)`.
    pub cash_paid: Money,
    /// Every unpaid accrual read; all are consumed by settling.
    pub consumed_accruals: Vec<AccrualId>,
    /// Oldest-debt-first repayments, stopping once earnings are exhausted.
    pub repayments: Vec<KasbonRepayment>,
}

/// Decide a settlement over the worker's ledger snapshot.
///
/// Wages are always fully consumed by the act of settling, even when they do
/// not cover the debt; in that case earnings are applied as a running
/// deduction across open advances in ascending issue-date order and some
/// advances stay open with a reduced balance (carry-over debt). A snapshot
/// with zero earnings still yields a plan — the caller records it as an
/// audit checkpoint.
pub fn plan_settlement(
    accruals: &[WageAccrual],
    advances: &[KasbonAdvance],
) -> DomainResult<SettlementPlan> {
    let unpaid: Vec<&WageAccrual> = accruals.iter().filter(|a| !a.paid).collect();
    let mut open: Vec<&KasbonAdvance> = advances.iter().filter(|k| k.is_open()).collect();
    // Oldest debt first; record id breaks ties deterministically.
    open.sort_by_key(|k| (k.issued_on, k.id.0));

    let total_earnings = Money::sum(unpaid.iter().map(|a| a.amount))?;
    let total_kasbon = Money::sum(open.iter().map(|k| k.outstanding()))?;
    let cash_paid = total_earnings.saturating_sub_floor(total_kasbon);

    let mut remaining = total_earnings.min(total_kasbon);
    let mut repayments = Vec::new();
    for k in &open {
        if !remaining.is_positive() {
            break;
        }
        let pay = remaining.min(k.outstanding());
        repayments.push(KasbonRepayment {
            kasbon_id: k.id,
            pay,
        });
        remaining = remaining.checked_sub(pay)?;
    }

    Ok(SettlementPlan {
        total_earnings,
        total_kasbon,
        cash_paid,
        consumed_accruals: unpaid.iter().map(|a| a.id).collect(),
        repayments,
    })
}

impl SettlementPlan {
    /// Σ repayments applied by this plan.
    pub fn total_repaid(&self) -> DomainResult<Money> {
        Money::sum(self.repayments.iter().map(|r| r.pay))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::records::KasbonStatus;
    use chrono::NaiveDate;
    use proptest::prelude::*;
    use tanibuku_core::{ActivityId, WorkerId};

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 4, day).unwrap()
    }

    fn accrual(worker: WorkerId, minor: i64) -> WageAccrual {
        WageAccrual::new(worker, ActivityId::new(), Money::from_minor(minor), date(1)).unwrap()
    }

    fn kasbon(worker: WorkerId, minor: i64, day: u32) -> KasbonAdvance {
        KasbonAdvance::new(worker, ActivityId::new(), Money::from_minor(minor), date(day))
            .unwrap()
    }

    #[test]
    fn earnings_cover_debt_pays_net_cash() {
        let w = WorkerId::new();
        let a = accrual(w, 100_000);
        let k = kasbon(w, 30_000, 2);

        let plan = plan_settlement(std::slice::from_ref(&a), std::slice::from_ref(&k)).unwrap();

        assert_eq!(plan.total_earnings, Money::from_minor(100_000));
        assert_eq!(plan.total_kasbon, Money::from_minor(30_000));
        assert_eq!(plan.cash_paid, Money::from_minor(70_000));
        assert_eq!(plan.consumed_accruals, vec![a.id]);
        assert_eq!(
            plan.repayments,
            vec![KasbonRepayment {
                kasbon_id: k.id,
                pay: Money::from_minor(30_000)
            }]
        );
    }

    #[test]
    fn debt_exceeding_earnings_carries_over() {
        let w = WorkerId::new();
        let a = accrual(w, 20_000);
        let k = kasbon(w, 50_000, 2);

        let plan = plan_settlement(std::slice::from_ref(&a), std::slice::from_ref(&k)).unwrap();

        assert_eq!(plan.cash_paid, Money::ZERO);
        assert_eq!(plan.consumed_accruals, vec![a.id]);
        assert_eq!(
            plan.repayments,
            vec![KasbonRepayment {
                kasbon_id: k.id,
                pay: Money::from_minor(20_000)
            }]
        );
        // The advance stays open: 20,000 of 50,000 repaid.
        let mut k2 = k;
        k2.apply_repayment(plan.repayments[0].pay).unwrap();
        assert_eq!(k2.status, KasbonStatus::Open);
        assert_eq!(k2.outstanding(), Money::from_minor(30_000));
    }

    #[test]
    fn deduction_hits_oldest_debt_first() {
        let w = WorkerId::new();
        let a = accrual(w, 60_000);
        let newer = kasbon(w, 50_000, 20);
        let older = kasbon(w, 40_000, 3);

        let plan = plan_settlement(&[a], &[newer.clone(), older.clone()]).unwrap();

        assert_eq!(plan.repayments.len(), 2);
        assert_eq!(plan.repayments[0].kasbon_id, older.id);
        assert_eq!(plan.repayments[0].pay, Money::from_minor(40_000));
        assert_eq!(plan.repayments[1].kasbon_id, newer.id);
        assert_eq!(plan.repayments[1].pay, Money::from_minor(20_000));
        assert_eq!(plan.cash_paid, Money::ZERO);
    }

    #[test]
    fn zero_earnings_yields_audit_checkpoint_plan() {
        let w = WorkerId::new();
        let k = kasbon(w, 15_000, 2);

        let plan = plan_settlement(&[], std::slice::from_ref(&k)).unwrap();

        assert_eq!(plan.total_earnings, Money::ZERO);
        assert_eq!(plan.total_kasbon, Money::from_minor(15_000));
        assert_eq!(plan.cash_paid, Money::ZERO);
        assert!(plan.consumed_accruals.is_empty());
        assert!(plan.repayments.is_empty());
    }

    #[test]
    fn already_paid_records_are_ignored() {
        let w = WorkerId::new();
        let mut paid = accrual(w, 10_000);
        paid.paid = true;
        let mut closed = kasbon(w, 5_000, 2);
        closed.apply_repayment(Money::from_minor(5_000)).unwrap();

        let plan = plan_settlement(&[paid], &[closed]).unwrap();
        assert_eq!(plan.total_earnings, Money::ZERO);
        assert_eq!(plan.total_kasbon, Money::ZERO);
        assert!(plan.consumed_accruals.is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Conservation: earnings = cash paid + Σ repayments, exactly.
        #[test]
        fn settlement_conserves_value(
            wages in prop::collection::vec(1i64..5_000_000, 0..8),
            debts in prop::collection::vec((1i64..5_000_000, 1u32..28), 0..8),
        ) {
            let w = WorkerId::new();
            let accruals: Vec<WageAccrual> =
                wages.iter().map(|&m| accrual(w, m)).collect();
            let advances: Vec<KasbonAdvance> =
                debts.iter().map(|&(m, d)| kasbon(w, m, d)).collect();

            let plan = plan_settlement(&accruals, &advances).unwrap();
            let repaid = plan.total_repaid().unwrap();

            prop_assert_eq!(
                plan.total_earnings,
                plan.cash_paid.checked_add(repaid).unwrap()
            );
        }

        /// Applying the plan never violates the kasbon invariants, and a later
        /// advance is only touched once every earlier one is fully repaid.
        #[test]
        fn plan_respects_kasbon_invariants(
            wages in prop::collection::vec(1i64..5_000_000, 0..8),
            debts in prop::collection::vec((1i64..5_000_000, 1u32..28), 1..8),
        ) {
            let w = WorkerId::new();
            let accruals: Vec<WageAccrual> =
                wages.iter().map(|&m| accrual(w, m)).collect();
            let mut advances: Vec<KasbonAdvance> =
                debts.iter().map(|&(m, d)| kasbon(w, m, d)).collect();

            let plan = plan_settlement(&accruals, &advances).unwrap();

            for r in &plan.repayments {
                let k = advances.iter_mut().find(|k| k.id == r.kasbon_id).unwrap();
                k.apply_repayment(r.pay).unwrap();
                prop_assert!(k.amount_repaid <= k.amount);
                prop_assert_eq!(
                    k.status == KasbonStatus::Paid,
                    k.amount_repaid == k.amount
                );
            }

            // Oldest-first: once one advance is left open, every later advance
            // must be untouched.
            advances.sort_by_key(|k| (k.issued_on, k.id.0));
            let mut exhausted = false;
            for k in &advances {
                if exhausted {
                    prop_assert_eq!(k.amount_repaid, Money::ZERO);
                }
                if k.is_open() {
                    exhausted = true;
                }
            }
        }
    }
}
