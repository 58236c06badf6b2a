use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tanibuku_core::{
    ActivityId, DomainError, DomainResult, Entity, FarmId, MasterStepId, PeriodId, StepId,
    WorkerId,
};

/// Farming-step status lifecycle. Status only moves forward; `locked` is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Draft,
    InProgress,
    Finished,
    Locked,
}

impl StepStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepStatus::Draft => "draft",
            StepStatus::InProgress => "in_progress",
            StepStatus::Finished => "finished",
            StepStatus::Locked => "locked",
        }
    }

    /// Terminal for period-close purposes: no further field work expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, StepStatus::Finished | StepStatus::Locked)
    }
}

impl core::fmt::Display for StepStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Requested lifecycle move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StepAction {
    Start,
    Complete,
    Lock,
}

impl StepAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            StepAction::Start => "start",
            StepAction::Complete => "complete",
            StepAction::Lock => "lock",
        }
    }

    /// Log action name recorded for a successful transition.
    pub fn log_action(&self) -> &'static str {
        match self {
            StepAction::Start => "started",
            StepAction::Complete => "finished",
            StepAction::Lock => "locked",
        }
    }
}

impl core::fmt::Display for StepAction {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One stage of a crop-growing workflow, tracked per growing period.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmingStep {
    pub id: StepId,
    pub farm_id: FarmId,
    pub period_id: PeriodId,
    pub master_step_id: MasterStepId,
    pub status: StepStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// A decided, not-yet-applied lifecycle move. Applying it and appending the
/// matching log row must happen in one transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTransition {
    pub step_id: StepId,
    pub action: StepAction,
    pub new_status: StepStatus,
    pub at: DateTime<Utc>,
}

impl FarmingStep {
    /// A freshly seeded step for a new period.
    pub fn draft(farm_id: FarmId, period_id: PeriodId, master_step_id: MasterStepId) -> Self {
        Self {
            id: StepId::new(),
            farm_id,
            period_id,
            master_step_id,
            status: StepStatus::Draft,
            started_at: None,
            finished_at: None,
        }
    }

    pub fn is_locked(&self) -> bool {
        self.status == StepStatus::Locked
    }

    /// Reject financial mutation on a locked step.
    pub fn ensure_mutable(&self) -> DomainResult<()> {
        if self.is_locked() {
            return Err(DomainError::LockedStep(self.id));
        }
        Ok(())
    }

    /// Decide a lifecycle move. No mutation; apply the returned transition
    /// with [`FarmingStep::apply`].
    ///
    /// `debtors` is only consulted for `lock`: workers linked to this step's
    /// activity that still have `open_kasbon > 0` (the caller computes this
    /// via the aggregator). A non-empty list blocks the lock.
    pub fn transition(
        &self,
        action: StepAction,
        at: DateTime<Utc>,
        debtors: &[WorkerId],
    ) -> DomainResult<StepTransition> {
        let new_status = match (action, self.status) {
            (StepAction::Start, StepStatus::Draft) => StepStatus::InProgress,
            (StepAction::Complete, StepStatus::InProgress) => StepStatus::Finished,
            (StepAction::Lock, StepStatus::Finished) => {
                if !debtors.is_empty() {
                    let mut workers = debtors.to_vec();
                    workers.sort();
                    workers.dedup();
                    return Err(DomainError::DebtOutstanding { workers });
                }
                StepStatus::Locked
            }
            (action, from) => {
                return Err(DomainError::invalid_transition(from.as_str(), action.as_str()));
            }
        };

        Ok(StepTransition {
            step_id: self.id,
            action,
            new_status,
            at,
        })
    }

    /// Evolve state from a decided transition.
    pub fn apply(&mut self, transition: &StepTransition) {
        self.status = transition.new_status;
        match transition.action {
            StepAction::Start => self.started_at = Some(transition.at),
            StepAction::Complete => self.finished_at = Some(transition.at),
            StepAction::Lock => {}
        }
    }
}

impl Entity for FarmingStep {
    type Id = StepId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}

/// The execution record owned by a step.
///
/// Ledger entries (accruals, advances, payments, expenses) attach to the
/// activity. It carries no status of its own: status is always derived from
/// the owning step, so there is a single source of truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FarmActivity {
    pub id: ActivityId,
    pub farm_id: FarmId,
    pub step_id: StepId,
}

impl FarmActivity {
    pub fn for_step(step: &FarmingStep) -> Self {
        Self {
            id: ActivityId::new(),
            farm_id: step.farm_id,
            step_id: step.id,
        }
    }
}

impl Entity for FarmActivity {
    type Id = ActivityId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
