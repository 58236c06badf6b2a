//! The farm-operations contract.
//!
//! This is the library-level interface consumed by the (out-of-scope)
//! CRUD/UI layer: every mutating operation validates business rules through
//! the domain crates and runs atomically inside the store. All errors are
//! typed `DomainError`s; nothing is silently swallowed.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use tanibuku_core::{
    ActivityId, DomainResult, FarmId, Money, PeriodId, StepId, UserId, WorkerId,
};
use tanibuku_ledger::{AccrualId, KasbonId, PaymentId, Settlement, WorkerBalance};
use tanibuku_periods::Period;
use tanibuku_steps::{FarmingStep, StepAction};

/// Scope of a ledger query: a whole farm or one step's activity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LedgerScope {
    Farm(FarmId),
    Activity(ActivityId),
}

/// Record a wage earned for one completed assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewWageAccrual {
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub earned_on: NaiveDate,
}

/// Record a kasbon advance handed to a worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewKasbonAdvance {
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub issued_on: NaiveDate,
}

/// Record cash handed over outside of a settlement pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCashPayment {
    pub worker_id: WorkerId,
    pub activity_id: ActivityId,
    pub amount: Money,
    pub paid_on: NaiveDate,
}

/// Request one settlement pass for a worker within a farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettleRequest {
    pub worker_id: WorkerId,
    pub farm_id: FarmId,
    pub settled_on: NaiveDate,
    pub notes: Option<String>,
}

/// Farm-operations store contract.
///
/// Implementations must make each mutating operation atomic and serialize
/// settlements per worker (§ concurrency notes in DESIGN.md). The in-memory
/// store implements this synchronously; the Postgres store offers the same
/// operations as inherent async methods.
pub trait FarmOps: Send + Sync {
    /// Record a wage accrual. Rejected if the owning step is locked.
    fn record_wage_accrual(&self, input: NewWageAccrual) -> DomainResult<AccrualId>;

    /// Record a kasbon advance. Rejected if the owning step is locked.
    fn record_kasbon_advance(&self, input: NewKasbonAdvance) -> DomainResult<KasbonId>;

    /// Record a direct cash payment. Rejected if the owning step is locked.
    /// Informational only: does not affect `pending_wage`.
    fn record_cash_payment(&self, input: NewCashPayment) -> DomainResult<PaymentId>;

    /// Run one settlement pass: consume all unpaid accruals and open
    /// advances for the worker within the farm, clear debt oldest-first,
    /// and append one `Settlement` audit record. A pass with zero earnings
    /// still proceeds and records a zero-effect settlement.
    fn settle(&self, request: SettleRequest) -> DomainResult<Settlement>;

    /// Derive a worker's `{pending_wage, open_kasbon}` within a scope.
    /// Computed fresh on every call; a worker with no records gets zeros.
    fn summarize(&self, worker_id: WorkerId, scope: LedgerScope) -> DomainResult<WorkerBalance>;

    /// Drive the step lifecycle. `lock` is guarded: any linked worker with
    /// `open_kasbon > 0` blocks it with `DebtOutstanding`. Each successful
    /// transition appends one activity-log row atomically.
    fn transition_step(
        &self,
        step_id: StepId,
        action: StepAction,
        actor: Option<UserId>,
    ) -> DomainResult<FarmingStep>;

    /// Close a period: every step must be terminal, then the closing balance
    /// is frozen and the farm's active-period pointer cleared. One-way.
    fn close_period(&self, period_id: PeriodId) -> DomainResult<Period>;
}

impl<S> FarmOps for Arc<S>
where
    S: FarmOps + ?Sized,
{
    fn record_wage_accrual(&self, input: NewWageAccrual) -> DomainResult<AccrualId> {
        (**self).record_wage_accrual(input)
    }

    fn record_kasbon_advance(&self, input: NewKasbonAdvance) -> DomainResult<KasbonId> {
        (**self).record_kasbon_advance(input)
    }

    fn record_cash_payment(&self, input: NewCashPayment) -> DomainResult<PaymentId> {
        (**self).record_cash_payment(input)
    }

    fn settle(&self, request: SettleRequest) -> DomainResult<Settlement> {
        (**self).settle(request)
    }

    fn summarize(&self, worker_id: WorkerId, scope: LedgerScope) -> DomainResult<WorkerBalance> {
        (**self).summarize(worker_id, scope)
    }

    fn transition_step(
        &self,
        step_id: StepId,
        action: StepAction,
        actor: Option<UserId>,
    ) -> DomainResult<FarmingStep> {
        (**self).transition_step(step_id, action, actor)
    }

    fn close_period(&self, period_id: PeriodId) -> DomainResult<Period> {
        (**self).close_period(period_id)
    }
}
