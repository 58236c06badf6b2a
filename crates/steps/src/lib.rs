//! Farming-step lifecycle.
//!
//! The four-state machine (draft → in_progress → finished → locked) that
//! gates financial activity, plus the append-only activity log rendered as a
//! timeline by the UI. Pure domain logic; applying transitions and persisting
//! log rows is the store's job.

pub mod log;
pub mod step;

pub use log::{LogId, StepActivityLog};
pub use step::{FarmActivity, FarmingStep, StepAction, StepStatus, StepTransition};
