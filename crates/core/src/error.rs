//! Domain error model.

use thiserror::Error;

use crate::id::{StepId, WorkerId};

/// Result type used across the domain layer.
pub type DomainResult<T> = Result<T, DomainError>;

/// Domain-level error.
///
/// Keep this focused on deterministic business failures. None of these are
/// retryable except `Busy`, which the store layer produces on lock contention.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A value failed validation (e.g. non-positive amount, malformed id).
    #[error("validation failed: {0}")]
    Validation(String),

    /// A requested worker/step/period/activity does not exist.
    #[error("{0} not found")]
    NotFound(String),

    /// An illegal lifecycle move was attempted (e.g. `lock` from `draft`).
    #[error("cannot {action} a step in state '{from}'")]
    InvalidTransition { from: String, action: String },

    /// A step lock was blocked by workers still owing kasbon.
    #[error("step lock blocked: {} worker(s) have outstanding kasbon", workers.len())]
    DebtOutstanding { workers: Vec<WorkerId> },

    /// A period close was blocked by non-terminal steps.
    #[error("period close blocked: {} step(s) still pending", steps.len())]
    PendingSteps { steps: Vec<StepId> },

    /// A financial mutation was attempted on a locked step.
    #[error("step {0} is locked; no further financial mutation allowed")]
    LockedStep(StepId),

    /// A conflict occurred (e.g. period already closed, duplicate record).
    #[error("conflict: {0}")]
    Conflict(String),

    /// Lock contention at the store layer; callers may retry.
    #[error("busy: {0}")]
    Busy(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound(what.into())
    }

    pub fn invalid_transition(from: impl Into<String>, action: impl Into<String>) -> Self {
        Self::InvalidTransition {
            from: from.into(),
            action: action.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn busy(msg: impl Into<String>) -> Self {
        Self::Busy(msg.into())
    }
}
