use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use tanibuku_core::{
    ActivityId, DomainError, DomainResult, Entity, FarmId, Money, PeriodId, RecordId, StepId,
};
use tanibuku_steps::StepStatus;

/// Income record identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IncomeId(pub RecordId);

/// Expense record identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExpenseId(pub RecordId);

macro_rules! impl_record_id {
    ($t:ty) => {
        impl $t {
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

impl_record_id!(IncomeId);
impl_record_id!(ExpenseId);

/// Money received within a period (e.g. a harvest sale).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Income {
    pub id: IncomeId,
    pub period_id: PeriodId,
    pub total_amount: Money,
    pub received_on: NaiveDate,
    pub description: Option<String>,
}

impl Income {
    pub fn new(
        period_id: PeriodId,
        total_amount: Money,
        received_on: NaiveDate,
        description: Option<String>,
    ) -> DomainResult<Self> {
        if !total_amount.is_positive() {
            return Err(DomainError::validation("income amount must be positive"));
        }
        Ok(Self {
            id: IncomeId::generate(),
            period_id,
            total_amount,
            received_on,
            description,
        })
    }
}

impl Entity for Income {
    type Id = IncomeId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Money spent within a period, optionally tied to a step's activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expense {
    pub id: ExpenseId,
    pub period_id: PeriodId,
    pub activity_id: Option<ActivityId>,
    pub amount: Money,
    pub spent_on: NaiveDate,
    pub description: Option<String>,
}

impl Expense {
    pub fn new(
        period_id: PeriodId,
        activity_id: Option<ActivityId>,
        amount: Money,
        spent_on: NaiveDate,
        description: Option<String>,
    ) -> DomainResult<Self> {
        if !amount.is_positive() {
            return Err(DomainError::validation("expense amount must be positive"));
        }
        Ok(Self {
            id: ExpenseId::generate(),
            period_id,
            activity_id,
            amount,
            spent_on,
            description,
        })
    }
}

impl Entity for Expense {
    type Id = ExpenseId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// Period status: active until closed, never reopened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeriodStatus {
    Active,
    Closed,
}

/// One growing season/cycle for a farm.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    pub id: PeriodId,
    pub farm_id: FarmId,
    pub name: String,
    pub opening_balance: Money,
    /// Computed once at close time and frozen thereafter.
    pub closing_balance: Option<Money>,
    pub status: PeriodStatus,
    pub started_on: NaiveDate,
    pub ended_on: Option<NaiveDate>,
}

/// A decided, not-yet-applied period close.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeriodClose {
    pub period_id: PeriodId,
    pub closing_balance: Money,
    pub ended_on: NaiveDate,
}

impl Period {
    pub fn open(
        farm_id: FarmId,
        name: impl Into<String>,
        opening_balance: Money,
        started_on: NaiveDate,
    ) -> Self {
        Self {
            id: PeriodId::new(),
            farm_id,
            name: name.into(),
            opening_balance,
            closing_balance: None,
            status: PeriodStatus::Active,
            started_on,
            ended_on: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == PeriodStatus::Active
    }

    /// Reject financial recording on a closed period.
    pub fn ensure_active(&self) -> DomainResult<()> {
        if !self.is_active() {
            return Err(DomainError::conflict(format!(
                "period {} is closed",
                self.id
            )));
        }
        Ok(())
    }

    /// Decide a period close.
    ///
    /// Every step of the period must be terminal (`finished` or `locked`);
    /// otherwise the blocking step ids are returned in `PendingSteps`. The
    /// closing balance rolls up the period's full lifetime:
    /// `opening + Σ income − Σ expense`.
    pub fn close(
        &self,
        steps: &[(StepId, StepStatus)],
        total_income: Money,
        total_expense: Money,
        ended_on: NaiveDate,
    ) -> DomainResult<PeriodClose> {
        self.ensure_active()?;

        let pending: Vec<StepId> = steps
            .iter()
            .filter(|(_, status)| !status.is_terminal())
            .map(|(id, _)| *id)
            .collect();
        if !pending.is_empty() {
            return Err(DomainError::PendingSteps { steps: pending });
        }

        let closing_balance = self
            .opening_balance
            .checked_add(total_income)?
            .checked_sub(total_expense)?;

        Ok(PeriodClose {
            period_id: self.id,
            closing_balance,
            ended_on,
        })
    }

    /// Freeze the closing balance. One-way; no reopen exists.
    pub fn apply_close(&mut self, close: &PeriodClose) {
        self.status = PeriodStatus::Closed;
        self.closing_balance = Some(close.closing_balance);
        self.ended_on = Some(close.ended_on);
    }
}

impl Entity for Period {
    type Id = PeriodId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
