use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use tanibuku_core::{Entity, RecordId, StepId, UserId};

use crate::step::StepTransition;

/// Activity-log entry identifier.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogId(pub RecordId);

impl LogId {
    pub fn generate() -> Self {
        Self(RecordId::new())
    }
}

impl core::fmt::Display for LogId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        core::fmt::Display::fmt(&self.0, f)
    }
}

/// Append-only audit entry on a step: one row per lifecycle transition or
/// significant event (cost added, kasbon recorded, …).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepActivityLog {
    pub id: LogId,
    pub step_id: StepId,
    pub action: String,
    pub description: String,
    pub actor_id: Option<UserId>,
    pub at: DateTime<Utc>,
}

impl StepActivityLog {
    /// Log row for a successful lifecycle transition.
    pub fn for_transition(transition: &StepTransition, actor_id: Option<UserId>) -> Self {
        let description = match transition.action.log_action() {
            "started" => "Step started.",
            "finished" => "Step finished in the field.",
            "locked" => "Step locked permanently.",
            other => other,
        };
        Self {
            id: LogId::generate(),
            step_id: transition.step_id,
            action: transition.action.log_action().to_string(),
            description: description.to_string(),
            actor_id,
            at: transition.at,
        }
    }

    /// Log row for a non-transition event (e.g. an expense or kasbon added).
    pub fn event(
        step_id: StepId,
        action: impl Into<String>,
        description: impl Into<String>,
        actor_id: Option<UserId>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LogId::generate(),
            step_id,
            action: action.into(),
            description: description.into(),
            actor_id,
            at,
        }
    }
}

impl Entity for StepActivityLog {
    type Id = LogId;

    fn id(&self) -> &Self::Id {
        &self.id
    }
}
