//! Step handler trait and related types.

use crate::context::Context;
use crate::expression::ExpressionEngine;
use crate::outcome::{InputRequest, RetriableError, StepError, StepOutcome};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// Reserved separator between a namespace prefix and a step id.
pub const NAMESPACE_SEPARATOR: char = '/';

/// Type-safe step identifier.
///
/// # Examples
///
/// ```
/// use stepwise_core::StepId;
///
/// let id = StepId::new("charge");
/// assert_eq!(id.as_str(), "charge");
///
/// // Unprefixed ids are namespaced, absolute ids are left alone.
/// assert_eq!(StepId::resolve("charge", Some("billing")).as_str(), "billing/charge");
/// assert_eq!(StepId::resolve("shared/audit", Some("billing")).as_str(), "shared/audit");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StepId(String);

impl StepId {
    /// Creates a new StepId.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Resolves a schema reference against an optional namespace prefix.
    pub fn resolve(raw: &str, prefix: Option<&str>) -> Self {
        match prefix {
            Some(prefix) if !raw.contains(NAMESPACE_SEPARATOR) => {
                Self(format!("{prefix}{NAMESPACE_SEPARATOR}{raw}"))
            }
            _ => Self::new(raw),
        }
    }

    /// Returns the step id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for StepId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for StepId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for StepId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl std::borrow::Borrow<str> for StepId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// The body of a step.
///
/// Synchronous closures of the shape
/// `Fn(&mut Context, Option<Value>) -> Result<StepOutcome, StepError>`
/// implement this trait automatically.
///
/// # Examples
///
/// ```
/// use stepwise_core::{Context, StepError, StepHandler, StepOutcome};
/// use async_trait::async_trait;
/// use serde_json::Value;
///
/// #[derive(Debug)]
/// struct MarkProcessed;
///
/// #[async_trait]
/// impl StepHandler for MarkProcessed {
///     async fn handle(
///         &self,
///         ctx: &mut Context,
///         _input: Option<Value>,
///     ) -> Result<StepOutcome, StepError> {
///         ctx.insert("processed", true);
///         Ok(StepOutcome::proceed())
///     }
/// }
/// ```
#[async_trait]
pub trait StepHandler: Send + Sync {
    /// Runs the step against the context with the merged input, if any.
    ///
    /// # Returns
    ///
    /// - `Ok(StepOutcome::Proceed)` - continue with the next item
    /// - `Ok(StepOutcome::InputRequired(_))` - halt until input is supplied
    /// - `Ok(StepOutcome::Failed(_))` or `Err(StepError::Retriable(_))` - halt, retriable
    /// - any other `Err` - abort the call
    async fn handle(
        &self,
        ctx: &mut Context,
        input: Option<Value>,
    ) -> Result<StepOutcome, StepError>;
}

#[async_trait]
impl<F> StepHandler for F
where
    F: Fn(&mut Context, Option<Value>) -> Result<StepOutcome, StepError> + Send + Sync,
{
    async fn handle(
        &self,
        ctx: &mut Context,
        input: Option<Value>,
    ) -> Result<StepOutcome, StepError> {
        self(ctx, input)
    }
}

#[derive(Clone)]
enum Handler {
    Native(Arc<dyn StepHandler>),
    Expression(String),
}

/// A registered unit of work: an id, an optional required-input marker and a
/// handler.
///
/// Steps are immutable once created and shared read-only by every execution.
#[derive(Clone)]
pub struct Step {
    id: StepId,
    input: Option<Value>,
    globals: Map<String, Value>,
    handler: Handler,
}

impl fmt::Debug for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let handler = match &self.handler {
            Handler::Native(_) => "<native>",
            Handler::Expression(source) => source.as_str(),
        };
        f.debug_struct("Step")
            .field("id", &self.id)
            .field("input", &self.input)
            .field("handler", &handler)
            .finish()
    }
}

impl Step {
    /// Creates a step with a native handler.
    pub fn new(id: impl Into<StepId>, handler: impl StepHandler + 'static) -> Self {
        Self {
            id: id.into(),
            input: None,
            globals: Map::new(),
            handler: Handler::Native(Arc::new(handler)),
        }
    }

    /// Creates a step from a synchronous closure.
    pub fn from_fn<F>(id: impl Into<StepId>, f: F) -> Self
    where
        F: Fn(&mut Context, Option<Value>) -> Result<StepOutcome, StepError>
            + Send
            + Sync
            + 'static,
    {
        Self::new(id, f)
    }

    /// Creates a step whose handler is expression text.
    ///
    /// The expression sees `ctx`, `input` and any [`globals`](Self::with_globals).
    /// Its value decides the outcome:
    ///
    /// - a string halts with a retriable failure carrying that message
    /// - an object with `inputRequired` requests input (`expires` optional)
    /// - an object with `error` halts with a retriable failure (`errors`,
    ///   `inputRequired` and `expires` optional)
    /// - anything else proceeds
    pub fn expression(id: impl Into<StepId>, source: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            input: None,
            globals: Map::new(),
            handler: Handler::Expression(source.into()),
        }
    }

    /// Declares that the step requires input, described by `descriptor`.
    ///
    /// When the step is reached without input it requests `descriptor`
    /// instead of running its handler.
    pub fn requires_input(mut self, descriptor: impl Into<Value>) -> Self {
        self.input = Some(descriptor.into());
        self
    }

    /// Adds extra bindings visible to an expression handler.
    pub fn with_globals(mut self, globals: Map<String, Value>) -> Self {
        self.globals = globals;
        self
    }

    /// Returns the step id.
    pub fn id(&self) -> &StepId {
        &self.id
    }

    /// Returns the required-input descriptor, if any.
    pub fn input_marker(&self) -> Option<&Value> {
        self.input.as_ref()
    }

    /// Returns the handler source text for expression steps.
    pub fn source(&self) -> Option<&str> {
        match &self.handler {
            Handler::Expression(source) => Some(source),
            Handler::Native(_) => None,
        }
    }

    /// Invokes the step.
    pub async fn handle(
        &self,
        ctx: &mut Context,
        input: Option<Value>,
        engine: &dyn ExpressionEngine,
    ) -> Result<StepOutcome, StepError> {
        if let (Some(descriptor), None) = (&self.input, &input) {
            return Ok(StepOutcome::input_required(descriptor.clone()));
        }
        match &self.handler {
            Handler::Native(handler) => handler.handle(ctx, input).await,
            Handler::Expression(source) => {
                let expression = engine.compile(source)?;
                let value = expression.call(&self.bindings(ctx, input)).await?;
                Ok(interpret(value))
            }
        }
    }

    fn bindings(&self, ctx: &Context, input: Option<Value>) -> Value {
        let mut bindings = self.globals.clone();
        bindings.insert("ctx".to_string(), ctx.to_value());
        bindings.insert("input".to_string(), input.unwrap_or(Value::Null));
        Value::Object(bindings)
    }
}

fn interpret(value: Value) -> StepOutcome {
    match value {
        Value::String(message) => StepOutcome::Failed(RetriableError::new(message)),
        Value::Object(mut map) => {
            let expires = map.get("expires").and_then(Value::as_u64);
            if let Some(error) = map.remove("error") {
                let message = match error {
                    Value::String(message) => message,
                    other => other.to_string(),
                };
                let mut err = RetriableError::new(message);
                if let Some(errors) = map.remove("errors") {
                    err = err.with_errors(errors);
                }
                if let Some(descriptor) = map.remove("inputRequired") {
                    err = err.with_input_required(descriptor);
                }
                if let Some(expires) = expires {
                    err = err.with_expires(expires);
                }
                StepOutcome::Failed(err)
            } else if let Some(descriptor) = map.remove("inputRequired") {
                let mut request = InputRequest::new(descriptor);
                request.expires = expires;
                request.errors = map.remove("errors");
                StepOutcome::InputRequired(request)
            } else {
                StepOutcome::Proceed
            }
        }
        _ => StepOutcome::Proceed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expression::{Expression, ExpressionError};
    use serde_json::json;

    /// Returns a fixed value. Fails when `ctx` is not bound.
    #[derive(Debug)]
    struct Fixed(Value);

    #[async_trait]
    impl Expression for Fixed {
        fn source(&self) -> &str {
            "fixed"
        }

        async fn call(&self, bindings: &Value) -> Result<Value, ExpressionError> {
            if bindings.get("ctx").is_none() {
                return Err(ExpressionError::InvalidBindings("missing ctx".to_string()));
            }
            Ok(self.0.clone())
        }
    }

    struct FixedEngine(Value);

    impl ExpressionEngine for FixedEngine {
        fn compile(&self, _source: &str) -> Result<Arc<dyn Expression>, ExpressionError> {
            Ok(Arc::new(Fixed(self.0.clone())))
        }
    }

    fn add_step() -> Step {
        Step::from_fn("add", |ctx: &mut Context, input: Option<Value>| {
            let n = input.and_then(|v| v.as_f64()).unwrap_or(0.0);
            let current = ctx.get::<f64>("result").unwrap_or(0.0);
            ctx.insert("result", current + n);
            Ok(StepOutcome::proceed())
        })
        .requires_input("number")
    }

    #[test]
    fn test_step_id_resolution() {
        assert_eq!(StepId::resolve("s", Some("p")), StepId::new("p/s"));
        assert_eq!(StepId::resolve("q/s", Some("p")), StepId::new("q/s"));
        assert_eq!(StepId::resolve("s", None), StepId::new("s"));
    }

    #[test]
    fn test_missing_input_short_circuits() {
        let step = add_step();
        let engine = FixedEngine(Value::Null);
        let mut ctx = Context::new();
        ctx.insert("result", 1.0);

        let outcome = tokio_test::block_on(step.handle(&mut ctx, None, &engine));
        match outcome {
            Ok(StepOutcome::InputRequired(req)) => assert_eq!(req.descriptor, json!("number")),
            other => panic!("unexpected outcome: {other:?}"),
        }
        // The body did not run.
        assert_eq!(ctx.get::<f64>("result"), Some(1.0));
    }

    #[test]
    fn test_native_handler_runs_with_input() {
        let step = add_step();
        let engine = FixedEngine(Value::Null);
        let mut ctx = Context::new();
        ctx.insert("result", 1.0);

        let outcome = tokio_test::block_on(step.handle(&mut ctx, Some(json!(5)), &engine));
        assert!(matches!(outcome, Ok(StepOutcome::Proceed)));
        assert_eq!(ctx.get::<f64>("result"), Some(6.0));
    }

    #[test]
    fn test_expression_string_is_retriable_failure() {
        let step = Step::expression("check", "ctx.result < 0 ? 'negative' : null");
        let engine = FixedEngine(json!("negative"));
        let mut ctx = Context::new();

        let outcome = tokio_test::block_on(step.handle(&mut ctx, None, &engine));
        match outcome {
            Ok(StepOutcome::Failed(err)) => assert_eq!(err.to_string(), "negative"),
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[test]
    fn test_expression_object_outcomes() {
        let mut ctx = Context::new();
        let step = Step::expression("ask", "...");

        let engine = FixedEngine(json!({ "inputRequired": "email", "expires": 42 }));
        match tokio_test::block_on(step.handle(&mut ctx, None, &engine)) {
            Ok(StepOutcome::InputRequired(req)) => {
                assert_eq!(req.descriptor, json!("email"));
                assert_eq!(req.expires, Some(42));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let engine = FixedEngine(json!({ "error": "bad email", "errors": ["format"] }));
        match tokio_test::block_on(step.handle(&mut ctx, None, &engine)) {
            Ok(StepOutcome::Failed(err)) => {
                assert_eq!(err.to_string(), "bad email");
                assert_eq!(err.errors(), Some(&json!(["format"])));
            }
            other => panic!("unexpected outcome: {other:?}"),
        }

        let engine = FixedEngine(json!(true));
        assert!(matches!(
            tokio_test::block_on(step.handle(&mut ctx, None, &engine)),
            Ok(StepOutcome::Proceed)
        ));
    }

    #[test]
    fn test_debug_hides_native_handler() {
        let step = add_step();
        let debug = format!("{step:?}");
        assert!(debug.contains("<native>"));
        assert!(debug.contains("\"add\""));
    }
}
