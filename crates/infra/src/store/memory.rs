//! In-memory farm-operations store.
//!
//! Intended for tests/dev. All tables live behind one `RwLock`; taking the
//! write guard is the transaction, so every mutating operation is atomic and
//! settlements for one worker are trivially linearized. Operations are
//! short-lived row reads/writes, so there is no timed lock acquisition here;
//! only a poisoned lock surfaces as `Busy`.

use std::collections::{HashMap, HashSet};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{NaiveDate, Utc};
use tracing::{info, warn};

use tanibuku_core::{
    ActivityId, DomainError, DomainResult, FarmId, MasterStepId, Money, PeriodId, StepId,
    UserId, WorkerId,
};
use tanibuku_ledger::{
    plan_settlement, summarize, AccrualId, CashPayment, KasbonAdvance, KasbonId, PaymentId,
    Settlement, SettlementId, WageAccrual, WorkerBalance,
};
use tanibuku_periods::{Expense, ExpenseId, Income, IncomeId, Period};
use tanibuku_steps::{FarmActivity, FarmingStep, StepAction, StepActivityLog, StepTransition};

use crate::ops::{
    FarmOps, LedgerScope, NewCashPayment, NewKasbonAdvance, NewWageAccrual, SettleRequest,
};

#[derive(Debug, Clone)]
struct FarmRecord {
    name: String,
    active_period: Option<PeriodId>,
}

#[derive(Debug, Clone)]
struct WorkerRecord {
    name: String,
    farms: HashSet<FarmId>,
}

#[derive(Debug, Default)]
struct State {
    farms: HashMap<FarmId, FarmRecord>,
    workers: HashMap<WorkerId, WorkerRecord>,
    periods: HashMap<PeriodId, Period>,
    steps: HashMap<StepId, FarmingStep>,
    activities: HashMap<ActivityId, FarmActivity>,
    accruals: HashMap<AccrualId, WageAccrual>,
    advances: HashMap<KasbonId, KasbonAdvance>,
    payments: HashMap<PaymentId, CashPayment>,
    settlements: Vec<Settlement>,
    incomes: Vec<Income>,
    expenses: Vec<Expense>,
    logs: Vec<StepActivityLog>,
}

/// In-memory store implementing the [`FarmOps`] contract.
#[derive(Debug, Default)]
pub struct InMemoryFarmStore {
    inner: RwLock<State>,
}

impl InMemoryFarmStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> DomainResult<RwLockReadGuard<'_, State>> {
        self.inner
            .read()
            .map_err(|_| DomainError::busy("store lock poisoned"))
    }

    fn write(&self) -> DomainResult<RwLockWriteGuard<'_, State>> {
        self.inner
            .write()
            .map_err(|_| DomainError::busy("store lock poisoned"))
    }

    // ---- setup & read API (used by the CRUD layer and tests) ----

    pub fn register_farm(&self, name: impl Into<String>) -> DomainResult<FarmId> {
        let mut state = self.write()?;
        let id = FarmId::new();
        state.farms.insert(
            id,
            FarmRecord {
                name: name.into(),
                active_period: None,
            },
        );
        Ok(id)
    }

    /// Create a worker and attach them to a farm.
    pub fn register_worker(
        &self,
        farm_id: FarmId,
        name: impl Into<String>,
    ) -> DomainResult<WorkerId> {
        let mut state = self.write()?;
        if !state.farms.contains_key(&farm_id) {
            return Err(DomainError::not_found("farm"));
        }
        let id = WorkerId::new();
        state.workers.insert(
            id,
            WorkerRecord {
                name: name.into(),
                farms: HashSet::from([farm_id]),
            },
        );
        Ok(id)
    }

    /// Attach an existing (global) worker to another farm.
    pub fn attach_worker(&self, farm_id: FarmId, worker_id: WorkerId) -> DomainResult<()> {
        let mut state = self.write()?;
        if !state.farms.contains_key(&farm_id) {
            return Err(DomainError::not_found("farm"));
        }
        let worker = state
            .workers
            .get_mut(&worker_id)
            .ok_or_else(|| DomainError::not_found("worker"))?;
        worker.farms.insert(farm_id);
        Ok(())
    }

    /// Open a growing period: seeds one draft step per master step (each
    /// with its activity record) and sets the farm's active-period pointer.
    pub fn open_period(
        &self,
        farm_id: FarmId,
        name: impl Into<String>,
        opening_balance: Money,
        started_on: NaiveDate,
        master_steps: &[MasterStepId],
    ) -> DomainResult<PeriodId> {
        let mut state = self.write()?;
        let farm = state
            .farms
            .get(&farm_id)
            .ok_or_else(|| DomainError::not_found("farm"))?;
        if farm.active_period.is_some() {
            return Err(DomainError::conflict("farm already has an active period"));
        }

        let period = Period::open(farm_id, name, opening_balance, started_on);
        let period_id = period.id;

        for master in master_steps {
            let step = FarmingStep::draft(farm_id, period_id, *master);
            let activity = FarmActivity::for_step(&step);
            state.activities.insert(activity.id, activity);
            state.steps.insert(step.id, step);
        }

        state.periods.insert(period_id, period);
        if let Some(farm) = state.farms.get_mut(&farm_id) {
            farm.active_period = Some(period_id);
        }
        info!(%farm_id, %period_id, steps = master_steps.len(), "period opened");
        Ok(period_id)
    }

    pub fn record_income(
        &self,
        period_id: PeriodId,
        total_amount: Money,
        received_on: NaiveDate,
        description: Option<String>,
    ) -> DomainResult<IncomeId> {
        let mut state = self.write()?;
        let period = state
            .periods
            .get(&period_id)
            .ok_or_else(|| DomainError::not_found("period"))?;
        period.ensure_active()?;

        let income = Income::new(period_id, total_amount, received_on, description)?;
        let id = income.id;
        state.incomes.push(income);
        Ok(id)
    }

    pub fn record_expense(
        &self,
        period_id: PeriodId,
        activity_id: Option<ActivityId>,
        amount: Money,
        spent_on: NaiveDate,
        description: Option<String>,
    ) -> DomainResult<ExpenseId> {
        let mut state = self.write()?;
        let period = state
            .periods
            .get(&period_id)
            .ok_or_else(|| DomainError::not_found("period"))?;
        period.ensure_active()?;
        let period_farm = period.farm_id;

        let mut log = None;
        if let Some(activity_id) = activity_id {
            let activity = lookup_activity(&state, activity_id)?;
            if activity.farm_id != period_farm {
                return Err(DomainError::validation(
                    "activity does not belong to the period's farm",
                ));
            }
            let step = lookup_step(&state, activity.step_id)?;
            step.ensure_mutable()?;
            log = Some(StepActivityLog::event(
                step.id,
                "expense",
                "Cost added to step.",
                None,
                Utc::now(),
            ));
        }

        let expense = Expense::new(period_id, activity_id, amount, spent_on, description)?;
        let id = expense.id;
        state.expenses.push(expense);
        if let Some(log) = log {
            state.logs.push(log);
        }
        Ok(id)
    }

    pub fn period(&self, period_id: PeriodId) -> DomainResult<Period> {
        let state = self.read()?;
        state
            .periods
            .get(&period_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("period"))
    }

    pub fn step(&self, step_id: StepId) -> DomainResult<FarmingStep> {
        let state = self.read()?;
        state
            .steps
            .get(&step_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("step"))
    }

    pub fn steps_for_period(&self, period_id: PeriodId) -> DomainResult<Vec<FarmingStep>> {
        let state = self.read()?;
        let mut steps: Vec<FarmingStep> = state
            .steps
            .values()
            .filter(|s| s.period_id == period_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.id);
        Ok(steps)
    }

    pub fn activity_for_step(&self, step_id: StepId) -> DomainResult<FarmActivity> {
        let state = self.read()?;
        state
            .activities
            .values()
            .find(|a| a.step_id == step_id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("activity"))
    }

    pub fn active_period(&self, farm_id: FarmId) -> DomainResult<Option<PeriodId>> {
        let state = self.read()?;
        state
            .farms
            .get(&farm_id)
            .map(|f| f.active_period)
            .ok_or_else(|| DomainError::not_found("farm"))
    }

    pub fn worker_name(&self, worker_id: WorkerId) -> DomainResult<String> {
        let state = self.read()?;
        state
            .workers
            .get(&worker_id)
            .map(|w| w.name.clone())
            .ok_or_else(|| DomainError::not_found("worker"))
    }

    pub fn farm_name(&self, farm_id: FarmId) -> DomainResult<String> {
        let state = self.read()?;
        state
            .farms
            .get(&farm_id)
            .map(|f| f.name.clone())
            .ok_or_else(|| DomainError::not_found("farm"))
    }

    /// Activity-log timeline for a step, newest first.
    pub fn step_logs(&self, step_id: StepId) -> DomainResult<Vec<StepActivityLog>> {
        let state = self.read()?;
        let mut logs: Vec<StepActivityLog> = state
            .logs
            .iter()
            .filter(|l| l.step_id == step_id)
            .cloned()
            .collect();
        logs.sort_by(|a, b| b.at.cmp(&a.at));
        Ok(logs)
    }

    /// Settlement history for a worker, newest first.
    pub fn settlements_for(&self, worker_id: WorkerId) -> DomainResult<Vec<Settlement>> {
        let state = self.read()?;
        let mut rows: Vec<Settlement> = state
            .settlements
            .iter()
            .filter(|s| s.worker_id == worker_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.settled_on.cmp(&a.settled_on));
        Ok(rows)
    }

    pub fn kasbon(&self, id: KasbonId) -> DomainResult<KasbonAdvance> {
        let state = self.read()?;
        state
            .advances
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("kasbon advance"))
    }

    pub fn accrual(&self, id: AccrualId) -> DomainResult<WageAccrual> {
        let state = self.read()?;
        state
            .accruals
            .get(&id)
            .cloned()
            .ok_or_else(|| DomainError::not_found("wage accrual"))
    }
}

// ---- shared lookups over the locked state ----

fn lookup_activity(state: &State, id: ActivityId) -> DomainResult<&FarmActivity> {
    state
        .activities
        .get(&id)
        .ok_or_else(|| DomainError::not_found("activity"))
}

fn lookup_step(state: &State, id: StepId) -> DomainResult<&FarmingStep> {
    state
        .steps
        .get(&id)
        .ok_or_else(|| DomainError::not_found("step"))
}

/// Validate a ledger mutation target: worker registered to the activity's
/// farm and the owning step not locked.
fn check_ledger_target(
    state: &State,
    worker_id: WorkerId,
    activity_id: ActivityId,
) -> DomainResult<()> {
    let worker = state
        .workers
        .get(&worker_id)
        .ok_or_else(|| DomainError::not_found("worker"))?;
    let activity = lookup_activity(state, activity_id)?;
    if !worker.farms.contains(&activity.farm_id) {
        return Err(DomainError::validation(
            "worker is not registered to this farm",
        ));
    }
    let step = lookup_step(state, activity.step_id)?;
    step.ensure_mutable()
}

/// Resolve the activity ids a scope covers.
fn scoped_activities(state: &State, scope: LedgerScope) -> DomainResult<HashSet<ActivityId>> {
    match scope {
        LedgerScope::Farm(farm_id) => {
            if !state.farms.contains_key(&farm_id) {
                return Err(DomainError::not_found("farm"));
            }
            Ok(state
                .activities
                .values()
                .filter(|a| a.farm_id == farm_id)
                .map(|a| a.id)
                .collect())
        }
        LedgerScope::Activity(activity_id) => {
            lookup_activity(state, activity_id)?;
            Ok(HashSet::from([activity_id]))
        }
    }
}

fn scoped_records(
    state: &State,
    worker_id: WorkerId,
    activities: &HashSet<ActivityId>,
) -> (Vec<WageAccrual>, Vec<KasbonAdvance>) {
    let accruals = state
        .accruals
        .values()
        .filter(|a| a.worker_id == worker_id && activities.contains(&a.activity_id))
        .cloned()
        .collect();
    let advances = state
        .advances
        .values()
        .filter(|k| k.worker_id == worker_id && activities.contains(&k.activity_id))
        .cloned()
        .collect();
    (accruals, advances)
}

/// Workers with `open_kasbon > 0` on this step's activity.
fn step_debtors(state: &State, step_id: StepId) -> DomainResult<Vec<WorkerId>> {
    let activity = match state.activities.values().find(|a| a.step_id == step_id) {
        Some(a) => a,
        // A step without an activity has no ledger entries, hence no debtors.
        None => return Ok(Vec::new()),
    };
    let scope = HashSet::from([activity.id]);

    let mut linked: HashSet<WorkerId> = HashSet::new();
    linked.extend(
        state
            .accruals
            .values()
            .filter(|a| a.activity_id == activity.id)
            .map(|a| a.worker_id),
    );
    linked.extend(
        state
            .advances
            .values()
            .filter(|k| k.activity_id == activity.id)
            .map(|k| k.worker_id),
    );

    let mut debtors = Vec::new();
    for worker_id in linked {
        let (accruals, advances) = scoped_records(state, worker_id, &scope);
        let balance = summarize(&accruals, &advances)?;
        if balance.has_open_debt() {
            debtors.push(worker_id);
        }
    }
    debtors.sort();
    Ok(debtors)
}

impl FarmOps for InMemoryFarmStore {
    fn record_wage_accrual(&self, input: NewWageAccrual) -> DomainResult<AccrualId> {
        let mut state = self.write()?;
        check_ledger_target(&state, input.worker_id, input.activity_id)?;

        let accrual = WageAccrual::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.earned_on,
        )?;
        let id = accrual.id;
        state.accruals.insert(id, accrual);
        info!(worker = %input.worker_id, amount = %input.amount, "wage accrual recorded");
        Ok(id)
    }

    fn record_kasbon_advance(&self, input: NewKasbonAdvance) -> DomainResult<KasbonId> {
        let mut state = self.write()?;
        check_ledger_target(&state, input.worker_id, input.activity_id)?;

        let advance = KasbonAdvance::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.issued_on,
        )?;
        let id = advance.id;
        state.advances.insert(id, advance);
        info!(worker = %input.worker_id, amount = %input.amount, "kasbon advance recorded");
        Ok(id)
    }

    fn record_cash_payment(&self, input: NewCashPayment) -> DomainResult<PaymentId> {
        let mut state = self.write()?;
        check_ledger_target(&state, input.worker_id, input.activity_id)?;

        let payment = CashPayment::new(
            input.worker_id,
            input.activity_id,
            input.amount,
            input.paid_on,
        )?;
        let id = payment.id;
        state.payments.insert(id, payment);
        Ok(id)
    }

    fn settle(&self, request: SettleRequest) -> DomainResult<Settlement> {
        // The write guard is the transaction: reading the snapshot and
        // applying the plan happen without any interleaved settle.
        let mut state = self.write()?;

        let worker = state
            .workers
            .get(&request.worker_id)
            .ok_or_else(|| DomainError::not_found("worker"))?;
        if !worker.farms.contains(&request.farm_id) {
            return Err(DomainError::not_found("worker"));
        }
        let activities = scoped_activities(&state, LedgerScope::Farm(request.farm_id))?;
        let (accruals, advances) = scoped_records(&state, request.worker_id, &activities);

        let plan = plan_settlement(&accruals, &advances)?;
        if plan.total_earnings.is_zero() {
            warn!(worker = %request.worker_id, "settlement pass with zero earnings (audit checkpoint)");
        }

        for id in &plan.consumed_accruals {
            if let Some(accrual) = state.accruals.get_mut(id) {
                accrual.paid = true;
            }
        }
        for repayment in &plan.repayments {
            let advance = state
                .advances
                .get_mut(&repayment.kasbon_id)
                .ok_or_else(|| DomainError::not_found("kasbon advance"))?;
            advance.apply_repayment(repayment.pay)?;
        }

        let settlement = Settlement {
            id: SettlementId::generate(),
            worker_id: request.worker_id,
            farm_id: request.farm_id,
            total_earnings: plan.total_earnings,
            total_kasbon: plan.total_kasbon,
            cash_paid: plan.cash_paid,
            settled_on: request.settled_on,
            notes: request.notes,
        };
        state.settlements.push(settlement.clone());
        info!(
            worker = %request.worker_id,
            earnings = %settlement.total_earnings,
            kasbon = %settlement.total_kasbon,
            cash = %settlement.cash_paid,
            "settlement recorded"
        );
        Ok(settlement)
    }

    fn summarize(&self, worker_id: WorkerId, scope: LedgerScope) -> DomainResult<WorkerBalance> {
        let state = self.read()?;
        if !state.workers.contains_key(&worker_id) {
            return Err(DomainError::not_found("worker"));
        }
        let activities = scoped_activities(&state, scope)?;
        let (accruals, advances) = scoped_records(&state, worker_id, &activities);
        summarize(&accruals, &advances)
    }

    fn transition_step(
        &self,
        step_id: StepId,
        action: StepAction,
        actor: Option<UserId>,
    ) -> DomainResult<FarmingStep> {
        let mut state = self.write()?;
        let step = lookup_step(&state, step_id)?.clone();

        let debtors = match action {
            StepAction::Lock => step_debtors(&state, step_id)?,
            _ => Vec::new(),
        };

        let transition: StepTransition = step.transition(action, Utc::now(), &debtors)?;
        let stored = state
            .steps
            .get_mut(&step_id)
            .ok_or_else(|| DomainError::not_found("step"))?;
        stored.apply(&transition);
        let updated = stored.clone();
        state
            .logs
            .push(StepActivityLog::for_transition(&transition, actor));
        info!(step = %step_id, action = %action, status = %updated.status, "step transitioned");
        Ok(updated)
    }

    fn close_period(&self, period_id: PeriodId) -> DomainResult<Period> {
        let mut state = self.write()?;
        let period = state
            .periods
            .get(&period_id)
            .ok_or_else(|| DomainError::not_found("period"))?
            .clone();

        let step_statuses: Vec<(StepId, tanibuku_steps::StepStatus)> = state
            .steps
            .values()
            .filter(|s| s.period_id == period_id)
            .map(|s| (s.id, s.status))
            .collect();
        let total_income = Money::sum(
            state
                .incomes
                .iter()
                .filter(|i| i.period_id == period_id)
                .map(|i| i.total_amount),
        )?;
        let total_expense = Money::sum(
            state
                .expenses
                .iter()
                .filter(|e| e.period_id == period_id)
                .map(|e| e.amount),
        )?;

        let close = period.close(
            &step_statuses,
            total_income,
            total_expense,
            Utc::now().date_naive(),
        )?;

        let stored = state
            .periods
            .get_mut(&period_id)
            .ok_or_else(|| DomainError::not_found("period"))?;
        stored.apply_close(&close);
        let updated = stored.clone();
        if let Some(farm) = state.farms.get_mut(&updated.farm_id) {
            if farm.active_period == Some(period_id) {
                farm.active_period = None;
            }
        }
        info!(period = %period_id, closing = %close.closing_balance, "period closed");
        Ok(updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 5, day).unwrap()
    }

    fn seeded() -> (InMemoryFarmStore, FarmId, PeriodId, Vec<FarmingStep>) {
        let store = InMemoryFarmStore::new();
        let farm = store.register_farm("North paddy").unwrap();
        let masters = [MasterStepId::new(), MasterStepId::new()];
        let period = store
            .open_period(farm, "Season 1", Money::from_major(1_000), date(1), &masters)
            .unwrap();
        let steps = store.steps_for_period(period).unwrap();
        (store, farm, period, steps)
    }

    #[test]
    fn open_period_seeds_draft_steps_with_activities() {
        let (store, farm, period, steps) = seeded();
        assert_eq!(steps.len(), 2);
        for step in &steps {
            assert_eq!(step.status, tanibuku_steps::StepStatus::Draft);
            let activity = store.activity_for_step(step.id).unwrap();
            assert_eq!(activity.farm_id, farm);
        }
        assert_eq!(store.active_period(farm).unwrap(), Some(period));
    }

    #[test]
    fn second_active_period_is_a_conflict() {
        let (store, farm, _period, _steps) = seeded();
        let err = store
            .open_period(farm, "Season 2", Money::ZERO, date(2), &[])
            .unwrap_err();
        assert!(matches!(err, DomainError::Conflict(_)));
    }

    #[test]
    fn ledger_mutations_on_locked_step_are_rejected() {
        let (store, farm, _period, steps) = seeded();
        let step = &steps[0];
        let worker = store.register_worker(farm, "Sari").unwrap();
        let activity = store.activity_for_step(step.id).unwrap();

        for action in [StepAction::Start, StepAction::Complete, StepAction::Lock] {
            store.transition_step(step.id, action, None).unwrap();
        }

        let err = store
            .record_wage_accrual(NewWageAccrual {
                worker_id: worker,
                activity_id: activity.id,
                amount: Money::from_major(10),
                earned_on: date(3),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::LockedStep(id) if id == step.id));

        let err = store
            .record_kasbon_advance(NewKasbonAdvance {
                worker_id: worker,
                activity_id: activity.id,
                amount: Money::from_major(5),
                issued_on: date(3),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::LockedStep(_)));

        let err = store
            .record_cash_payment(NewCashPayment {
                worker_id: worker,
                activity_id: activity.id,
                amount: Money::from_major(5),
                paid_on: date(3),
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::LockedStep(_)));
    }

    #[test]
    fn unknown_ids_surface_not_found() {
        let (store, farm, _period, _steps) = seeded();
        let worker = store.register_worker(farm, "Sari").unwrap();

        let err = store
            .summarize(WorkerId::new(), LedgerScope::Farm(farm))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));

        let err = store
            .summarize(worker, LedgerScope::Activity(ActivityId::new()))
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));

        let err = store
            .settle(SettleRequest {
                worker_id: worker,
                farm_id: FarmId::new(),
                settled_on: date(4),
                notes: None,
            })
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));

        let err = store
            .transition_step(StepId::new(), StepAction::Start, None)
            .unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));

        let err = store.close_period(PeriodId::new()).unwrap_err();
        assert!(matches!(err, DomainError::NotFound(_)));
    }

    #[test]
    fn transition_appends_one_log_row_and_rejection_appends_none() {
        let (store, _farm, _period, steps) = seeded();
        let step = &steps[0];
        let actor = UserId::new();

        store
            .transition_step(step.id, StepAction::Start, Some(actor))
            .unwrap();
        let logs = store.step_logs(step.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "started");
        assert_eq!(logs[0].actor_id, Some(actor));

        // Illegal move: no mutation, no log.
        let err = store
            .transition_step(step.id, StepAction::Lock, Some(actor))
            .unwrap_err();
        assert!(matches!(err, DomainError::InvalidTransition { .. }));
        assert_eq!(store.step_logs(step.id).unwrap().len(), 1);
    }

    #[test]
    fn expense_on_activity_logs_a_cost_event() {
        let (store, _farm, period, steps) = seeded();
        let step = &steps[0];
        let activity = store.activity_for_step(step.id).unwrap();

        store
            .record_expense(
                period,
                Some(activity.id),
                Money::from_major(75),
                date(5),
                Some("Fertilizer".into()),
            )
            .unwrap();

        let logs = store.step_logs(step.id).unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].action, "expense");
    }
}
