//! Workflow error types.

use crate::expression::ExpressionError;
use crate::outcome::StepError;
use crate::step::StepId;
use thiserror::Error;

/// Which continuation an operation asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContinuationKind {
    /// Supply awaited input after a clean halt.
    Resume,
    /// Re-invoke a step that reported a retriable failure.
    Retry,
}

impl std::fmt::Display for ContinuationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContinuationKind::Resume => write!(f, "resumed"),
            ContinuationKind::Retry => write!(f, "retried"),
        }
    }
}

/// Errors that can occur while registering or running a workflow.
///
/// Registration errors (`DuplicateStepId`, `DuplicateSchemaId`,
/// `UnknownStepId`, `MarkerOutsideLoop`, `Configuration`) are raised at setup
/// time. Everything else is fatal for the single call that produced it and
/// leaves no resumable state behind.
///
/// Input requests and retriable step failures are *not* errors: they come back
/// as a halted `ExecutionResult`.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum WorkflowError {
    /// A step with the same id is already registered.
    #[error("Duplicate step id \"{0}\"")]
    DuplicateStepId(StepId),

    /// A schema with the same id is already registered.
    #[error("Workflow schema with id \"{0}\" already registered")]
    DuplicateSchemaId(String),

    /// A schema references a step that is not registered.
    #[error("Workflow schema \"{schema_id}\" refers to an unknown step id \"{step_id}\"")]
    UnknownStepId {
        /// The schema being registered.
        schema_id: String,
        /// The resolved (prefixed) step id.
        step_id: StepId,
    },

    /// A `break` or `continue` marker has no enclosing loop.
    #[error("Workflow schema \"{schema_id}\" uses `{marker}` outside of a loop")]
    MarkerOutsideLoop {
        /// The schema being registered.
        schema_id: String,
        /// `break` or `continue`.
        marker: &'static str,
    },

    /// The workflow configuration is invalid.
    #[error("Invalid workflow configuration: {0}")]
    Configuration(String),

    /// `start` or `resume` named a schema that was never registered.
    #[error("Workflow schema id \"{0}\" does not exist")]
    UnknownSchemaId(String),

    /// A referenced step was not found at execution time.
    #[error("Step \"{0}\" not found")]
    StepNotFound(StepId),

    /// A step failed with an unclassified error.
    #[error("Step \"{step_id}\" failed: {source}")]
    StepFailed {
        /// The failing step.
        step_id: StepId,
        /// The error raised by the step.
        source: StepError,
    },

    /// A gate, `while`, `break` or `continue` condition could not be evaluated.
    #[error("Failed to evaluate condition `{expression}`: {source}")]
    Condition {
        /// Source text of the condition.
        expression: String,
        /// The evaluator error.
        source: ExpressionError,
    },

    /// `resume`/`retry` was called on a result that does not allow it.
    #[error("Execution of \"{schema_id}\" cannot be {requested}: {reason}")]
    NotResumable {
        /// The schema of the result.
        schema_id: String,
        /// The continuation that was asked for.
        requested: ContinuationKind,
        /// Why it was refused.
        reason: &'static str,
    },

    /// A position stack does not address a step in the schema.
    #[error("Position {indexes:?} does not address a step in workflow schema \"{schema_id}\"")]
    InvalidState {
        /// The schema being resumed.
        schema_id: String,
        /// The offending position stack.
        indexes: Vec<usize>,
    },

    /// A loop exceeded the configured iteration limit.
    #[error("Loop in workflow schema \"{schema_id}\" exceeded {limit} iterations")]
    LoopLimitExceeded {
        /// The running schema.
        schema_id: String,
        /// The configured limit.
        limit: u64,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let error = WorkflowError::UnknownStepId {
            schema_id: "billing".to_string(),
            step_id: StepId::new("billing/charge"),
        };
        assert_eq!(
            error.to_string(),
            "Workflow schema \"billing\" refers to an unknown step id \"billing/charge\""
        );

        let error = WorkflowError::DuplicateStepId(StepId::new("add"));
        assert_eq!(error.to_string(), "Duplicate step id \"add\"");
    }

    #[test]
    fn test_not_resumable_display() {
        let error = WorkflowError::NotResumable {
            schema_id: "loop".to_string(),
            requested: ContinuationKind::Retry,
            reason: "execution already finished",
        };
        assert_eq!(
            error.to_string(),
            "Execution of \"loop\" cannot be retried: execution already finished"
        );
    }
}
