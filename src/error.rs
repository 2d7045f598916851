//! Error taxonomy of the testing runtime.
//!
//! Scheduler misuse is fatal to the whole run; everything an iteration can
//! observe (bugs, deadlocks, timeouts) is recovered by the driver and
//! recorded in the run report.

use crate::operation::OperationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fatal errors: the scheduler, a strategy or the instrumentation violated
/// a contract. These abort the run instead of the current iteration.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum SchedulerError {
    #[error("strategy misuse: {details}")]
    StrategyMisuse { details: String },

    #[error("unknown operation id {0}")]
    UnknownOperation(OperationId),

    #[error("operation {child} was sighted before its parent {parent} recorded any node")]
    MissingParentNode {
        child: OperationId,
        parent: OperationId,
    },

    #[error("invalid status transition for operation {operation}: {details}")]
    InvalidTransition {
        operation: OperationId,
        details: String,
    },
}

/// How a single iteration ended. All variants except `Passed` are recorded
/// with the schedule trace that led to them.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub enum IterationOutcome {
    /// The workload ran to completion with every operation completed.
    Passed,
    /// User code panicked; the payload message is preserved.
    BugFound { message: String },
    /// No operation is enabled but at least one is blocked.
    Deadlock { blocked: Vec<OperationId> },
    /// The iteration exceeded its deadline.
    Timeout,
    /// The scheduling-step budget was exhausted.
    MaxStepsReached,
}

impl IterationOutcome {
    /// True for outcomes reported as bugs.
    pub fn is_bug(&self) -> bool {
        matches!(
            self,
            IterationOutcome::BugFound { .. } | IterationOutcome::Deadlock { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bug_classification() {
        assert!(IterationOutcome::BugFound {
            message: "assertion failed".to_string()
        }
        .is_bug());
        assert!(IterationOutcome::Deadlock { blocked: vec![1, 2] }.is_bug());
        assert!(!IterationOutcome::Passed.is_bug());
        assert!(!IterationOutcome::Timeout.is_bug());
        assert!(!IterationOutcome::MaxStepsReached.is_bug());
    }

    #[test]
    fn test_scheduler_error_messages() {
        let err = SchedulerError::StrategyMisuse {
            details: "picked operation 3 outside the reduced set".to_string(),
        };
        assert!(err.to_string().contains("operation 3"));

        let err = SchedulerError::MissingParentNode { child: 2, parent: 7 };
        assert!(err.to_string().contains("parent 7"));
    }
}
