//! Core traits and types for the stepwise workflow interpreter.
//!
//! This crate provides the vocabulary shared by step authors and the engine,
//! without any runtime dependencies.
//!
//! # Core Types
//!
//! - [`Step`] / [`StepHandler`] - A named unit of work and its body
//! - [`StepOutcome`] - Proceed, request input, or fail retriably
//! - [`Context`] - Caller-owned JSON state shared between steps
//! - [`Schema`] - The tree of steps, conditional blocks and loops
//! - [`ExpressionEngine`] - The pluggable evaluator for conditions and
//!   expression handlers
//! - [`WorkflowError`] - Registration and execution errors

mod context;
mod error;
mod expression;
mod outcome;
mod schema;
mod step;

pub use context::Context;
pub use error::{ContinuationKind, WorkflowError};
pub use expression::{truthy, Expression, ExpressionEngine, ExpressionError};
pub use outcome::{InputRequest, RetriableError, StepError, StepOutcome};
pub use schema::{Block, Condition, Schema, SchemaItem, StepRef};
pub use step::{Step, StepHandler, StepId, NAMESPACE_SEPARATOR};
