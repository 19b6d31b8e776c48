//! Step outcomes and step-level errors.

use crate::expression::ExpressionError;
use serde_json::Value;
use std::error::Error as StdError;
use std::sync::Arc;
use thiserror::Error;

/// A request for external input, produced when a step cannot continue.
#[derive(Debug, Clone, PartialEq)]
pub struct InputRequest {
    /// Describes the awaited input. Opaque to the engine.
    pub descriptor: Value,
    /// Optional expiry hint (milliseconds since the Unix epoch).
    pub expires: Option<u64>,
    /// Optional auxiliary error list, e.g. validation messages for a previous
    /// attempt.
    pub errors: Option<Value>,
}

impl InputRequest {
    /// Creates a request with the given descriptor.
    pub fn new(descriptor: impl Into<Value>) -> Self {
        Self {
            descriptor: descriptor.into(),
            expires: None,
            errors: None,
        }
    }

    /// Sets the expiry hint.
    pub fn with_expires(mut self, expires: u64) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Attaches an auxiliary error list.
    pub fn with_errors(mut self, errors: impl Into<Value>) -> Self {
        self.errors = Some(errors.into());
        self
    }
}

/// A recoverable failure. The execution halts and can be retried.
///
/// The original cause is kept as-is so callers can inspect it before deciding
/// whether to retry.
#[derive(Debug, Clone, Error)]
#[error("{cause}")]
pub struct RetriableError {
    #[source]
    cause: Arc<dyn StdError + Send + Sync>,
    errors: Option<Value>,
    input_required: Option<Value>,
    expires: Option<u64>,
}

impl RetriableError {
    /// Wraps an underlying error.
    pub fn new(cause: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self {
            cause: Arc::from(cause.into()),
            errors: None,
            input_required: None,
            expires: None,
        }
    }

    /// Attaches an auxiliary error list.
    pub fn with_errors(mut self, errors: impl Into<Value>) -> Self {
        self.errors = Some(errors.into());
        self
    }

    /// Declares the input the retry needs.
    pub fn with_input_required(mut self, descriptor: impl Into<Value>) -> Self {
        self.input_required = Some(descriptor.into());
        self
    }

    /// Sets the expiry hint (milliseconds since the Unix epoch).
    pub fn with_expires(mut self, expires: u64) -> Self {
        self.expires = Some(expires);
        self
    }

    /// Returns the original error.
    pub fn cause(&self) -> &Arc<dyn StdError + Send + Sync> {
        &self.cause
    }

    /// Returns the auxiliary error list.
    pub fn errors(&self) -> Option<&Value> {
        self.errors.as_ref()
    }

    /// Returns the descriptor of the input the retry needs.
    pub fn input_required(&self) -> Option<&Value> {
        self.input_required.as_ref()
    }

    /// Returns the expiry hint.
    pub fn expires(&self) -> Option<u64> {
        self.expires
    }
}

/// Output from a step invocation.
#[derive(Debug, Clone)]
pub enum StepOutcome {
    /// Success. Execution continues with the next item.
    Proceed,
    /// Halt cleanly until the caller supplies input.
    InputRequired(InputRequest),
    /// Halt with a retriable failure.
    Failed(RetriableError),
}

impl StepOutcome {
    /// Creates a `Proceed` outcome.
    pub fn proceed() -> Self {
        Self::Proceed
    }

    /// Creates an `InputRequired` outcome with the given descriptor.
    pub fn input_required(descriptor: impl Into<Value>) -> Self {
        Self::InputRequired(InputRequest::new(descriptor))
    }

    /// Creates a `Failed` outcome.
    pub fn retry(error: RetriableError) -> Self {
        Self::Failed(error)
    }
}

/// Errors a step may raise.
///
/// Raising [`StepError::Retriable`] has exactly the same effect as returning
/// [`StepOutcome::Failed`]. Every other variant aborts the call.
#[derive(Debug, Error)]
pub enum StepError {
    /// A recoverable failure.
    #[error(transparent)]
    Retriable(#[from] RetriableError),

    /// An expression handler could not be evaluated.
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Any other failure.
    #[error("{0}")]
    Fatal(Box<dyn StdError + Send + Sync>),
}

impl StepError {
    /// Wraps an arbitrary error as fatal.
    pub fn fatal(error: impl Into<Box<dyn StdError + Send + Sync>>) -> Self {
        Self::Fatal(error.into())
    }
}
