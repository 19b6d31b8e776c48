//! Engine configuration.

use serde::{Deserialize, Serialize};
use stepwise_core::WorkflowError;

/// Settings shared by every execution of a [`Workflow`](crate::Workflow).
///
/// ```
/// use stepwise::WorkflowConfig;
///
/// let config: WorkflowConfig = serde_json::from_str(r#"{ "max_loop_iterations": 1000 }"#)
///     .expect("valid config");
/// assert_eq!(config.max_loop_iterations, Some(1000));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Upper bound on iterations per loop entry. `None` means unbounded.
    pub max_loop_iterations: Option<u64>,
}

impl WorkflowConfig {
    /// Sets the per-loop iteration limit.
    pub fn with_max_loop_iterations(mut self, limit: u64) -> Self {
        self.max_loop_iterations = Some(limit);
        self
    }

    /// Checks the configuration for values the engine cannot honor.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.max_loop_iterations == Some(0) {
            return Err(WorkflowError::Configuration(
                "max_loop_iterations must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
