//! End-to-end scenarios against the in-memory store: full seasons from
//! period open through settlements, step lock and period close.

use std::sync::Arc;

use chrono::NaiveDate;

use tanibuku_core::{DomainError, FarmId, MasterStepId, Money, PeriodId, WorkerId};
use tanibuku_ledger::KasbonStatus;
use tanibuku_steps::{StepAction, StepStatus};

use crate::ops::{
    FarmOps, LedgerScope, NewCashPayment, NewKasbonAdvance, NewWageAccrual, SettleRequest,
};
use crate::store::memory::InMemoryFarmStore;

fn date(day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(2026, 7, day).unwrap()
}

struct Season {
    store: InMemoryFarmStore,
    farm: FarmId,
    period: PeriodId,
    steps: Vec<tanibuku_steps::FarmingStep>,
}

fn season(step_count: usize) -> Season {
    let store = InMemoryFarmStore::new();
    let farm = store.register_farm("Riverside paddy").unwrap();
    let masters: Vec<MasterStepId> = (0..step_count).map(|_| MasterStepId::new()).collect();
    let period = store
        .open_period(farm, "Wet season 2026", Money::from_major(5_000), date(1), &masters)
        .unwrap();
    let steps = store.steps_for_period(period).unwrap();
    Season {
        store,
        farm,
        period,
        steps,
    }
}

fn wage(season: &Season, worker: WorkerId, step_idx: usize, minor: i64) {
    let activity = season.store.activity_for_step(season.steps[step_idx].id).unwrap();
    season
        .store
        .record_wage_accrual(NewWageAccrual {
            worker_id: worker,
            activity_id: activity.id,
            amount: Money::from_minor(minor),
            earned_on: date(5),
        })
        .unwrap();
}

fn kasbon(season: &Season, worker: WorkerId, step_idx: usize, minor: i64, day: u32) {
    let activity = season.store.activity_for_step(season.steps[step_idx].id).unwrap();
    season
        .store
        .record_kasbon_advance(NewKasbonAdvance {
            worker_id: worker,
            activity_id: activity.id,
            amount: Money::from_minor(minor),
            issued_on: date(day),
        })
        .unwrap();
}

fn settle(season: &Season, worker: WorkerId) -> tanibuku_ledger::Settlement {
    season
        .store
        .settle(SettleRequest {
            worker_id: worker,
            farm_id: season.farm,
            settled_on: date(20),
            notes: None,
        })
        .unwrap()
}

#[test]
fn earnings_exceed_debt_pays_net_cash_and_clears_everything() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Budi").unwrap();
    wage(&s, worker, 0, 100_000);
    kasbon(&s, worker, 0, 30_000, 3);

    let settlement = settle(&s, worker);
    assert_eq!(settlement.total_earnings, Money::from_minor(100_000));
    assert_eq!(settlement.total_kasbon, Money::from_minor(30_000));
    assert_eq!(settlement.cash_paid, Money::from_minor(70_000));

    let balance = s.store.summarize(worker, LedgerScope::Farm(s.farm)).unwrap();
    assert_eq!(balance.pending_wage, Money::ZERO);
    assert_eq!(balance.open_kasbon, Money::ZERO);
    assert!(!balance.has_open_debt());
}

#[test]
fn earnings_below_debt_pays_nothing_and_carries_the_remainder() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Sari").unwrap();
    wage(&s, worker, 0, 20_000);
    kasbon(&s, worker, 0, 50_000, 3);

    let settlement = settle(&s, worker);
    assert_eq!(settlement.cash_paid, Money::ZERO);

    let balance = s.store.summarize(worker, LedgerScope::Farm(s.farm)).unwrap();
    // The wage was consumed; 30,000 of debt carries over.
    assert_eq!(balance.pending_wage, Money::ZERO);
    assert_eq!(balance.open_kasbon, Money::from_minor(30_000));
    assert!(balance.has_open_debt());
}

#[test]
fn repayment_hits_oldest_advances_first() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Wati").unwrap();
    wage(&s, worker, 0, 25_000);
    kasbon(&s, worker, 0, 20_000, 2); // oldest
    kasbon(&s, worker, 0, 20_000, 8);

    settle(&s, worker);

    let balance = s.store.summarize(worker, LedgerScope::Farm(s.farm)).unwrap();
    assert_eq!(balance.open_kasbon, Money::from_minor(15_000));

    // Oldest fully paid, newer one partially.
    let activity = s.store.activity_for_step(s.steps[0].id).unwrap();
    let activity_balance = s
        .store
        .summarize(worker, LedgerScope::Activity(activity.id))
        .unwrap();
    assert_eq!(activity_balance.open_kasbon, Money::from_minor(15_000));
}

#[test]
fn zero_earnings_settlement_still_records_a_checkpoint() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Joko").unwrap();
    kasbon(&s, worker, 0, 40_000, 3);

    let settlement = settle(&s, worker);
    assert_eq!(settlement.total_earnings, Money::ZERO);
    assert_eq!(settlement.total_kasbon, Money::from_minor(40_000));
    assert_eq!(settlement.cash_paid, Money::ZERO);

    // Debt untouched, one audit row written.
    let balance = s.store.summarize(worker, LedgerScope::Farm(s.farm)).unwrap();
    assert_eq!(balance.open_kasbon, Money::from_minor(40_000));
    assert_eq!(s.store.settlements_for(worker).unwrap().len(), 1);
}

#[test]
fn cash_payment_is_informational_and_leaves_pending_wage_alone() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Dewi").unwrap();
    wage(&s, worker, 0, 60_000);
    let activity = s.store.activity_for_step(s.steps[0].id).unwrap();
    s.store
        .record_cash_payment(NewCashPayment {
            worker_id: worker,
            activity_id: activity.id,
            amount: Money::from_minor(60_000),
            paid_on: date(6),
        })
        .unwrap();

    let balance = s.store.summarize(worker, LedgerScope::Farm(s.farm)).unwrap();
    assert_eq!(balance.pending_wage, Money::from_minor(60_000));
}

#[test]
fn lock_is_blocked_while_a_worker_still_owes() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Agus").unwrap();
    let step = s.steps[0].id;
    kasbon(&s, worker, 0, 15_000, 3);

    s.store.transition_step(step, StepAction::Start, None).unwrap();
    s.store.transition_step(step, StepAction::Complete, None).unwrap();

    let err = s
        .store
        .transition_step(step, StepAction::Lock, None)
        .unwrap_err();
    match err {
        DomainError::DebtOutstanding { workers } => assert_eq!(workers, vec![worker]),
        other => panic!("expected DebtOutstanding, got {other:?}"),
    }
    assert_eq!(s.store.step(step).unwrap().status, StepStatus::Finished);

    // Debt cleared by covering wages; lock now goes through.
    wage(&s, worker, 0, 15_000);
    settle(&s, worker);
    let locked = s.store.transition_step(step, StepAction::Lock, None).unwrap();
    assert_eq!(locked.status, StepStatus::Locked);
}

#[test]
fn period_close_blocked_by_pending_steps() {
    let s = season(2);
    let first = s.steps[0].id;
    let second = s.steps[1].id;

    // First step finished, second still in progress.
    s.store.transition_step(first, StepAction::Start, None).unwrap();
    s.store.transition_step(first, StepAction::Complete, None).unwrap();
    s.store.transition_step(second, StepAction::Start, None).unwrap();

    let err = s.store.close_period(s.period).unwrap_err();
    match err {
        DomainError::PendingSteps { steps } => assert_eq!(steps, vec![second]),
        other => panic!("expected PendingSteps, got {other:?}"),
    }
    let period = s.store.period(s.period).unwrap();
    assert!(period.is_active());
    assert_eq!(period.closing_balance, None);
}

#[test]
fn period_close_rolls_up_and_clears_the_active_pointer() {
    let s = season(1);
    let step = s.steps[0].id;
    let activity = s.store.activity_for_step(step).unwrap();

    s.store.transition_step(step, StepAction::Start, None).unwrap();
    s.store
        .record_income(s.period, Money::from_major(700), date(10), Some("Harvest".into()))
        .unwrap();
    s.store
        .record_expense(s.period, Some(activity.id), Money::from_major(450), date(11), None)
        .unwrap();
    s.store.transition_step(step, StepAction::Complete, None).unwrap();

    let period = s.store.close_period(s.period).unwrap();
    // 5,000 + 700 - 450
    assert_eq!(period.closing_balance, Some(Money::from_major(5_250)));
    assert_eq!(s.store.active_period(s.farm).unwrap(), None);

    // A new season can be opened once the pointer is clear.
    let next = s
        .store
        .open_period(s.farm, "Dry season 2026", Money::from_major(5_250), date(25), &[])
        .unwrap();
    assert_eq!(s.store.active_period(s.farm).unwrap(), Some(next));

    // But the closed period takes no more records.
    let err = s
        .store
        .record_income(s.period, Money::from_major(10), date(26), None)
        .unwrap_err();
    assert!(matches!(err, DomainError::Conflict(_)));
}

#[test]
fn concurrent_settles_split_the_wage_exactly_once() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Rina").unwrap();
    wage(&s, worker, 0, 10_000);

    let store = Arc::new(s.store);
    let farm = s.farm;
    let mut results = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let store = Arc::clone(&store);
                scope.spawn(move || {
                    store.settle(SettleRequest {
                        worker_id: worker,
                        farm_id: farm,
                        settled_on: date(20),
                        notes: None,
                    })
                })
            })
            .collect();
        for handle in handles {
            results.push(handle.join().unwrap().unwrap());
        }
    });

    // Exactly one pass consumed the wage; the other was a zero checkpoint.
    let total_cash = Money::sum(results.iter().map(|r| r.cash_paid)).unwrap();
    assert_eq!(total_cash, Money::from_minor(10_000));
    let winners = results
        .iter()
        .filter(|r| r.total_earnings == Money::from_minor(10_000))
        .count();
    assert_eq!(winners, 1);
    assert_eq!(store.settlements_for(worker).unwrap().len(), 2);

    let balance = store.summarize(worker, LedgerScope::Farm(farm)).unwrap();
    assert_eq!(balance.pending_wage, Money::ZERO);
}

#[test]
fn settlement_history_reflects_each_pass() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Tono").unwrap();

    wage(&s, worker, 0, 30_000);
    settle(&s, worker);
    wage(&s, worker, 0, 45_000);
    kasbon(&s, worker, 0, 5_000, 21);
    let second = s
        .store
        .settle(SettleRequest {
            worker_id: worker,
            farm_id: s.farm,
            settled_on: date(22),
            notes: Some("End of harvest".into()),
        })
        .unwrap();
    assert_eq!(second.cash_paid, Money::from_minor(40_000));

    let history = s.store.settlements_for(worker).unwrap();
    assert_eq!(history.len(), 2);
    // Newest first.
    assert_eq!(history[0].settled_on, date(22));
    assert_eq!(history[0].notes.as_deref(), Some("End of harvest"));
}

#[test]
fn step_timeline_records_each_transition() {
    let s = season(1);
    let step = s.steps[0].id;

    s.store.transition_step(step, StepAction::Start, None).unwrap();
    s.store.transition_step(step, StepAction::Complete, None).unwrap();
    s.store.transition_step(step, StepAction::Lock, None).unwrap();

    let logs = s.store.step_logs(step).unwrap();
    let actions: Vec<&str> = logs.iter().map(|l| l.action.as_str()).collect();
    assert_eq!(actions, vec!["locked", "finished", "started"]);
}

#[test]
fn advances_settle_partially_across_passes_until_paid() {
    let s = season(1);
    let worker = s.store.register_worker(s.farm, "Lina").unwrap();
    let activity = s.store.activity_for_step(s.steps[0].id).unwrap();
    let advance_id = s
        .store
        .record_kasbon_advance(NewKasbonAdvance {
            worker_id: worker,
            activity_id: activity.id,
            amount: Money::from_minor(50_000),
            issued_on: date(2),
        })
        .unwrap();

    wage(&s, worker, 0, 20_000);
    settle(&s, worker);
    let advance = s.store.kasbon(advance_id).unwrap();
    assert_eq!(advance.status, KasbonStatus::Open);
    assert_eq!(advance.amount_repaid, Money::from_minor(20_000));

    wage(&s, worker, 0, 30_000);
    let settlement = settle(&s, worker);
    assert_eq!(settlement.cash_paid, Money::ZERO);

    // Status flips only once fully repaid.
    let advance = s.store.kasbon(advance_id).unwrap();
    assert_eq!(advance.status, KasbonStatus::Paid);
    assert_eq!(advance.outstanding(), Money::ZERO);
    assert_eq!(s.store.settlements_for(worker).unwrap().len(), 2);
}
