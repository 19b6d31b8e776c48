//! A resumable workflow interpreter.
//!
//! Steps are registered once, composed into schemas (sequences, conditional
//! blocks and `while` loops with `break`/`continue`), and executed against a
//! caller-owned [`Context`]. A step may halt the execution to request input
//! or to report a retriable failure; the returned [`ExecutionResult`] carries
//! the exact position so the execution can be resumed or retried later, even
//! from a persisted [`FlowState`].
//!
//! # Example
//!
//! ```rust
//! use stepwise::prelude::*;
//! use serde_json::{json, Value};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), WorkflowError> {
//!     let add = Step::from_fn("add", |ctx: &mut Context, input: Option<Value>| {
//!         let n = input.and_then(|v| v.as_f64()).unwrap_or(0.0);
//!         let result = ctx.get::<f64>("result").unwrap_or(0.0);
//!         ctx.insert("result", result + n);
//!         Ok(StepOutcome::proceed())
//!     })
//!     .requires_input("number");
//!
//!     let workflow = Workflow::builder()
//!         .add_step(add)
//!         .register(
//!             "count",
//!             schema![
//!                 StepRef::new("add").with_input(1),
//!                 "add",
//!             ],
//!         )
//!         .build()?;
//!
//!     let result = workflow.start("count", Context::new(), None).await?;
//!     assert!(result.can_resume());
//!     assert_eq!(result.input_required(), Some(&json!("number")));
//!
//!     let result = workflow.resume(result, json!(41)).await?;
//!     assert!(result.is_finished());
//!     assert_eq!(result.context().get::<f64>("result"), Some(42.0));
//!     Ok(())
//! }
//! ```

mod config;
mod engine;
mod expression;
mod result;
mod trace;
mod workflow;

// Re-export core types
pub use stepwise_core::*;

pub use config::WorkflowConfig;
pub use expression::{ExpressionCache, JexlEngine};
pub use result::{ExecutionResult, FlowState};
pub use trace::{
    listener_fn, Emitter, EventDetail, FnListener, Listener, ListenerError, ListenerId,
    LogListener, TraceEvent, TraceEventKind,
};
pub use workflow::{Workflow, WorkflowBuilder};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::{
        listener_fn, schema, Block, Condition, Context, ContinuationKind, ExecutionResult,
        FlowState, InputRequest, Listener, RetriableError, Schema, SchemaItem, Step, StepError,
        StepHandler, StepId, StepOutcome, StepRef, TraceEvent, TraceEventKind, Workflow,
        WorkflowBuilder, WorkflowConfig, WorkflowError,
    };
}
