//! Execution results and persistable flow state.

use crate::trace::Listener;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use stepwise_core::{Context, ContinuationKind, RetriableError, StepId};

/// The plain-data checkpoint of an execution: the context plus the position
/// stack.
///
/// A halted execution can be persisted as a `FlowState` and continued later
/// with [`Workflow::resume_state`](crate::Workflow::resume_state).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FlowState {
    /// The caller-owned context.
    pub context: Context,
    /// One index per nesting depth, innermost last.
    pub indexes: Vec<usize>,
}

impl FlowState {
    /// Creates a fresh state over `context`.
    pub fn new(context: Context) -> Self {
        Self {
            context,
            indexes: Vec::new(),
        }
    }
}

/// The outcome of one `start`, `resume` or `retry` call.
///
/// The context is owned by the result between calls and may be edited through
/// [`context_mut`](Self::context_mut) before continuing, e.g. to correct a
/// value before a retry.
#[derive(Clone)]
pub struct ExecutionResult {
    pub(crate) schema_id: String,
    pub(crate) state: FlowState,
    pub(crate) finished: bool,
    pub(crate) step_id: Option<StepId>,
    pub(crate) input_required: Option<Value>,
    pub(crate) error: Option<RetriableError>,
    pub(crate) expires: Option<u64>,
    pub(crate) errors: Option<Value>,
    pub(crate) listener: Option<Arc<dyn Listener>>,
}

impl fmt::Debug for ExecutionResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionResult")
            .field("schema_id", &self.schema_id)
            .field("state", &self.state)
            .field("finished", &self.finished)
            .field("step_id", &self.step_id)
            .field("input_required", &self.input_required)
            .field("error", &self.error)
            .field("expires", &self.expires)
            .field("errors", &self.errors)
            .field("listener", &self.listener.is_some())
            .finish()
    }
}

impl ExecutionResult {
    /// Returns the schema this execution runs.
    pub fn schema_id(&self) -> &str {
        &self.schema_id
    }

    /// Returns `true` once the outermost schema has run to completion.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Returns the context.
    pub fn context(&self) -> &Context {
        &self.state.context
    }

    /// Returns the context for editing between calls.
    pub fn context_mut(&mut self) -> &mut Context {
        &mut self.state.context
    }

    /// Returns the position stack. Empty once finished.
    pub fn indexes(&self) -> &[usize] {
        &self.state.indexes
    }

    /// Returns the checkpoint.
    pub fn state(&self) -> &FlowState {
        &self.state
    }

    /// Consumes the result and returns the checkpoint.
    pub fn into_state(self) -> FlowState {
        self.state
    }

    /// Returns the id of the last step touched.
    pub fn step_id(&self) -> Option<&StepId> {
        self.step_id.as_ref()
    }

    /// Returns the descriptor of the awaited input.
    pub fn input_required(&self) -> Option<&Value> {
        self.input_required.as_ref()
    }

    /// Returns the retriable failure that halted the execution.
    pub fn error(&self) -> Option<&RetriableError> {
        self.error.as_ref()
    }

    /// Returns the expiry hint of the halt.
    pub fn expires(&self) -> Option<u64> {
        self.expires
    }

    /// Returns the auxiliary error list of the halt.
    pub fn errors(&self) -> Option<&Value> {
        self.errors.as_ref()
    }

    /// Returns which continuation this result accepts, if any.
    ///
    /// `Retry` when the halt carries an error, `Resume` for a clean input
    /// request, `None` once finished.
    pub fn continuation(&self) -> Option<ContinuationKind> {
        match (self.finished, &self.error) {
            (true, _) => None,
            (false, Some(_)) => Some(ContinuationKind::Retry),
            (false, None) => Some(ContinuationKind::Resume),
        }
    }

    /// Returns `true` if [`Workflow::resume`](crate::Workflow::resume) is
    /// allowed.
    pub fn can_resume(&self) -> bool {
        self.continuation() == Some(ContinuationKind::Resume)
    }

    /// Returns `true` if [`Workflow::retry`](crate::Workflow::retry) is
    /// allowed.
    pub fn can_retry(&self) -> bool {
        self.continuation() == Some(ContinuationKind::Retry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn halted(error: Option<RetriableError>) -> ExecutionResult {
        ExecutionResult {
            schema_id: "flow".to_string(),
            state: FlowState {
                context: Context::new(),
                indexes: vec![2, 0],
            },
            finished: false,
            step_id: Some(StepId::new("add")),
            input_required: Some(json!("number")),
            error,
            expires: None,
            errors: None,
            listener: None,
        }
    }

    #[test]
    fn test_continuation_follows_error() {
        let result = halted(None);
        assert_eq!(result.continuation(), Some(ContinuationKind::Resume));
        assert!(result.can_resume());
        assert!(!result.can_retry());

        let result = halted(Some(RetriableError::new("boom")));
        assert_eq!(result.continuation(), Some(ContinuationKind::Retry));
        assert!(result.can_retry());
    }

    #[test]
    fn test_finished_has_no_continuation() {
        let mut result = halted(None);
        result.finished = true;
        assert_eq!(result.continuation(), None);
    }

    #[test]
    fn test_flow_state_serde() {
        let mut context = Context::new();
        context.insert("result", 6.5);
        let state = FlowState {
            context,
            indexes: vec![3, 0],
        };

        let json = serde_json::to_value(&state).expect("serializes");
        assert_eq!(json, json!({ "context": { "result": 6.5 }, "indexes": [3, 0] }));

        let back: FlowState = serde_json::from_value(json).expect("deserializes");
        assert_eq!(back, state);
    }
}
