//! Failure taxonomy for the observe/suggest/execute loop.
//!
//! Component failures are converted into typed results before they reach
//! the orchestrator; only [`AbortReason`] ever ends a run.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PilotError {
    /// The target description matched nothing after the full cascade.
    #[error("no element found for target '{0}'")]
    Resolution(String),

    /// The browser call for a click, type or navigate raised.
    #[error("{action} failed: {reason}")]
    Execution { action: &'static str, reason: String },

    /// The suggestion service call or its reply could not be used.
    #[error("suggestion unavailable: {0}")]
    Suggestion(String),

    #[error(transparent)]
    Driver(#[from] anyhow::Error),
}

impl PilotError {
    pub fn execution(action: &'static str, reason: impl ToString) -> Self {
        PilotError::Execution {
            action,
            reason: reason.to_string(),
        }
    }
}

/// Why a run stopped before the task was declared finished.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AbortReason {
    #[error("step-limit-exceeded")]
    StepLimitExceeded,

    #[error("action-failed")]
    ActionFailed { step: usize, message: String },
}

impl AbortReason {
    /// Longer human-readable explanation for reports.
    pub fn describe(&self) -> String {
        match self {
            AbortReason::StepLimitExceeded => "maximum step count reached".to_string(),
            AbortReason::ActionFailed { step, message } => {
                format!("step {} failed: {}", step, message)
            }
        }
    }
}
