//! Step and schema registry, and the public execution API.

use crate::config::WorkflowConfig;
use crate::engine::Entry;
use crate::expression::{ExpressionCache, JexlEngine};
use crate::result::{ExecutionResult, FlowState};
use crate::trace::{Emitter, Listener, ListenerId};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use stepwise_core::{
    Block, Context, ContinuationKind, ExpressionEngine, Schema, SchemaItem, Step, StepId,
    StepRef, WorkflowError, NAMESPACE_SEPARATOR,
};
use tracing::{debug, info};

/// A registry of steps and schemas, and the interpreter that runs them.
///
/// Registration takes `&mut self`; execution takes `&self`, so a fully
/// registered workflow can be shared (e.g. behind an `Arc`) by any number of
/// concurrent executions.
pub struct Workflow {
    pub(crate) steps: HashMap<StepId, Arc<Step>>,
    pub(crate) schemas: HashMap<String, Arc<Schema>>,
    pub(crate) expressions: Arc<dyn ExpressionEngine>,
    pub(crate) emitter: Emitter,
    pub(crate) config: WorkflowConfig,
}

impl fmt::Debug for Workflow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workflow")
            .field("steps", &self.steps.keys().collect::<Vec<_>>())
            .field("schemas", &self.schemas.keys().collect::<Vec<_>>())
            .field("listeners", &self.emitter.len())
            .field("config", &self.config)
            .finish()
    }
}

impl Default for Workflow {
    fn default() -> Self {
        Self::new()
    }
}

impl Workflow {
    /// Creates an empty workflow using the JEXL expression engine.
    pub fn new() -> Self {
        Self {
            steps: HashMap::new(),
            schemas: HashMap::new(),
            expressions: Arc::new(ExpressionCache::new(JexlEngine::new())),
            emitter: Emitter::new(),
            config: WorkflowConfig::default(),
        }
    }

    /// Creates a new workflow builder.
    pub fn builder() -> WorkflowBuilder {
        WorkflowBuilder::new()
    }

    /// Creates a workflow with the given steps.
    pub fn from_steps(steps: impl IntoIterator<Item = Step>) -> Result<Self, WorkflowError> {
        let mut workflow = Self::new();
        for step in steps {
            workflow.add_step(step)?;
        }
        Ok(workflow)
    }

    /// Replaces the configuration.
    pub fn with_config(mut self, config: WorkflowConfig) -> Result<Self, WorkflowError> {
        config.validate()?;
        self.config = config;
        Ok(self)
    }

    /// Replaces the expression engine. Compiled expressions are memoized.
    pub fn with_expression_engine(mut self, engine: impl ExpressionEngine + 'static) -> Self {
        self.expressions = Arc::new(ExpressionCache::new(engine));
        self
    }

    /// Returns the configuration.
    pub fn config(&self) -> &WorkflowConfig {
        &self.config
    }

    /// Registers a step.
    pub fn add_step(&mut self, step: Step) -> Result<(), WorkflowError> {
        if self.steps.contains_key(step.id()) {
            return Err(WorkflowError::DuplicateStepId(step.id().clone()));
        }
        debug!("Registered step '{}'", step.id());
        self.steps.insert(step.id().clone(), Arc::new(step));
        Ok(())
    }

    /// Registers a schema under `schema_id`.
    ///
    /// References without a namespace are resolved against `prefix`. Every
    /// resolved id must name a registered step, and `break`/`continue`
    /// markers must sit inside a loop.
    pub fn register(
        &mut self,
        schema_id: impl Into<String>,
        schema: impl Into<Schema>,
        prefix: Option<&str>,
    ) -> Result<(), WorkflowError> {
        let schema_id = schema_id.into();
        if self.schemas.contains_key(&schema_id) {
            return Err(WorkflowError::DuplicateSchemaId(schema_id));
        }
        if let Some(prefix) = prefix {
            if prefix.is_empty() || prefix.ends_with(NAMESPACE_SEPARATOR) {
                return Err(WorkflowError::Configuration(format!(
                    "invalid namespace prefix \"{prefix}\""
                )));
            }
        }

        let schema = self.normalize(&schema_id, &schema.into(), prefix, false)?;
        info!(
            "Registered workflow schema '{}' ({} top-level items)",
            schema_id,
            schema.len()
        );
        self.schemas.insert(schema_id, Arc::new(schema));
        Ok(())
    }

    fn normalize(
        &self,
        schema_id: &str,
        schema: &Schema,
        prefix: Option<&str>,
        in_loop: bool,
    ) -> Result<Schema, WorkflowError> {
        schema
            .iter()
            .map(|item| match item {
                SchemaItem::Step(step) => {
                    let id = StepId::resolve(step.id.as_str(), prefix);
                    if !self.steps.contains_key(&id) {
                        return Err(WorkflowError::UnknownStepId {
                            schema_id: schema_id.to_string(),
                            step_id: id,
                        });
                    }
                    Ok(SchemaItem::Step(StepRef {
                        id,
                        ..step.clone()
                    }))
                }
                SchemaItem::Block(block) => Ok(SchemaItem::Block(Block {
                    condition: block.condition.clone(),
                    while_cond: block.while_cond.clone(),
                    steps: self.normalize(
                        schema_id,
                        &block.steps,
                        prefix,
                        in_loop || block.is_loop(),
                    )?,
                })),
                SchemaItem::Break(_) if !in_loop => Err(WorkflowError::MarkerOutsideLoop {
                    schema_id: schema_id.to_string(),
                    marker: "break",
                }),
                SchemaItem::Continue(_) if !in_loop => Err(WorkflowError::MarkerOutsideLoop {
                    schema_id: schema_id.to_string(),
                    marker: "continue",
                }),
                marker => Ok(marker.clone()),
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Schema::new)
    }

    /// Returns `true` if a step with the given id is registered.
    pub fn has_step(&self, id: &str) -> bool {
        self.steps.contains_key(id)
    }

    /// Returns `true` if a schema with the given id is registered.
    pub fn has_schema(&self, schema_id: &str) -> bool {
        self.schemas.contains_key(schema_id)
    }

    /// Returns the registered schema, with step ids resolved.
    pub fn schema(&self, schema_id: &str) -> Option<&Schema> {
        self.schemas.get(schema_id).map(|schema| schema.as_ref())
    }

    /// Returns the number of registered steps.
    pub fn step_count(&self) -> usize {
        self.steps.len()
    }

    /// Attaches a listener that sees every execution of this workflow.
    pub fn attach_listener(&self, listener: impl Listener + 'static) -> ListenerId {
        self.emitter.attach(listener)
    }

    /// Detaches a listener. Returns `false` if it was not attached.
    pub fn detach_listener(&self, id: ListenerId) -> bool {
        self.emitter.detach(id)
    }

    /// Starts a new execution of `schema_id` over `context`.
    ///
    /// `input` is offered to the first step invoked.
    pub async fn start(
        &self,
        schema_id: &str,
        context: Context,
        input: Option<Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.execute(
            schema_id.to_string(),
            FlowState::new(context),
            input,
            None,
            Entry::Start,
        )
        .await
    }

    /// Starts a new execution with a listener that sees only this execution
    /// and its continuations.
    pub async fn start_with_listener(
        &self,
        schema_id: &str,
        context: Context,
        input: Option<Value>,
        listener: Arc<dyn Listener>,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.execute(
            schema_id.to_string(),
            FlowState::new(context),
            input,
            Some(listener),
            Entry::Start,
        )
        .await
    }

    /// Continues an execution halted by an input request, handing `input` to
    /// the halted step.
    pub async fn resume(
        &self,
        result: ExecutionResult,
        input: Value,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.continue_with(result, ContinuationKind::Resume, Some(input))
            .await
    }

    /// Re-invokes the step that halted with a retriable failure.
    pub async fn retry(
        &self,
        result: ExecutionResult,
        input: Option<Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.continue_with(result, ContinuationKind::Retry, input)
            .await
    }

    /// Continues from a persisted checkpoint.
    ///
    /// The position must address a step of the registered schema.
    pub async fn resume_state(
        &self,
        schema_id: &str,
        state: FlowState,
        input: Option<Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        self.execute(schema_id.to_string(), state, input, None, Entry::Resume)
            .await
    }

    async fn continue_with(
        &self,
        result: ExecutionResult,
        requested: ContinuationKind,
        input: Option<Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        match result.continuation() {
            Some(kind) if kind == requested => {}
            found => {
                let reason = match found {
                    None => "execution already finished",
                    Some(ContinuationKind::Retry) => "execution halted with an error, use retry",
                    Some(ContinuationKind::Resume) => "execution is awaiting input, use resume",
                };
                return Err(WorkflowError::NotResumable {
                    schema_id: result.schema_id,
                    requested,
                    reason,
                });
            }
        }
        self.execute(
            result.schema_id,
            result.state,
            input,
            result.listener,
            Entry::Resume,
        )
        .await
    }
}

impl ExecutionResult {
    /// Shorthand for [`Workflow::resume`].
    pub async fn resume(
        self,
        workflow: &Workflow,
        input: Value,
    ) -> Result<ExecutionResult, WorkflowError> {
        workflow.resume(self, input).await
    }

    /// Shorthand for [`Workflow::retry`].
    pub async fn retry(
        self,
        workflow: &Workflow,
        input: Option<Value>,
    ) -> Result<ExecutionResult, WorkflowError> {
        workflow.retry(self, input).await
    }
}

/// Builder for constructing [`Workflow`] instances.
///
/// The first registration error is kept and reported by [`build`](Self::build).
#[derive(Default)]
pub struct WorkflowBuilder {
    workflow: Workflow,
    error: Option<WorkflowError>,
}

impl WorkflowBuilder {
    /// Creates a new empty workflow builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the configuration.
    pub fn config(mut self, config: WorkflowConfig) -> Self {
        self.workflow.config = config;
        self
    }

    /// Sets the expression engine.
    pub fn expression_engine(mut self, engine: impl ExpressionEngine + 'static) -> Self {
        self.workflow = self.workflow.with_expression_engine(engine);
        self
    }

    /// Adds a step.
    pub fn add_step(mut self, step: Step) -> Self {
        if self.error.is_none() {
            self.error = self.workflow.add_step(step).err();
        }
        self
    }

    /// Adds several steps.
    pub fn add_steps(self, steps: impl IntoIterator<Item = Step>) -> Self {
        steps.into_iter().fold(self, Self::add_step)
    }

    /// Registers a schema. Steps it references must already be added.
    pub fn register(self, schema_id: impl Into<String>, schema: impl Into<Schema>) -> Self {
        self.register_inner(schema_id.into(), schema.into(), None)
    }

    /// Registers a schema whose unqualified references resolve under `prefix`.
    pub fn register_with_prefix(
        self,
        schema_id: impl Into<String>,
        schema: impl Into<Schema>,
        prefix: &str,
    ) -> Self {
        self.register_inner(schema_id.into(), schema.into(), Some(prefix))
    }

    fn register_inner(mut self, schema_id: String, schema: Schema, prefix: Option<&str>) -> Self {
        if self.error.is_none() {
            self.error = self.workflow.register(schema_id, schema, prefix).err();
        }
        self
    }

    /// Attaches a listener.
    pub fn listener(self, listener: impl Listener + 'static) -> Self {
        self.workflow.attach_listener(listener);
        self
    }

    /// Builds the workflow.
    ///
    /// # Errors
    ///
    /// Returns the first registration error, or a configuration error.
    pub fn build(self) -> Result<Workflow, WorkflowError> {
        if let Some(error) = self.error {
            return Err(error);
        }
        self.workflow.config.validate()?;
        Ok(self.workflow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use stepwise_core::{schema, StepOutcome};

    fn noop(id: &str) -> Step {
        Step::from_fn(id, |_: &mut Context, _: Option<Value>| Ok(StepOutcome::proceed()))
    }

    #[test]
    fn test_duplicate_step_id() {
        let mut workflow = Workflow::new();
        workflow.add_step(noop("a")).expect("first add");
        let result = workflow.add_step(noop("a"));
        assert!(matches!(result, Err(WorkflowError::DuplicateStepId(id)) if id.as_str() == "a"));
    }

    #[test]
    fn test_duplicate_schema_id() {
        let mut workflow = Workflow::from_steps([noop("a")]).expect("valid steps");
        workflow.register("flow", schema!["a"], None).expect("first register");
        let result = workflow.register("flow", schema!["a"], None);
        assert!(matches!(result, Err(WorkflowError::DuplicateSchemaId(id)) if id == "flow"));
    }

    #[test]
    fn test_unknown_step_in_nested_block() {
        let mut workflow = Workflow::from_steps([noop("a")]).expect("valid steps");
        let result = workflow.register(
            "flow",
            schema!["a", Block::new(schema!["a", Block::looping("x", schema!["missing"])])],
            None,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::UnknownStepId { step_id, .. }) if step_id.as_str() == "missing"
        ));
        assert!(!workflow.has_schema("flow"));
    }

    #[test]
    fn test_prefix_resolution() {
        let mut workflow =
            Workflow::from_steps([noop("billing/charge"), noop("shared/audit")]).expect("valid steps");
        workflow
            .register("billing", schema!["charge", "shared/audit"], Some("billing"))
            .expect("valid schema");

        let schema = workflow.schema("billing").expect("registered");
        let ids: Vec<_> = schema
            .iter()
            .filter_map(|item| match item {
                SchemaItem::Step(step) => Some(step.id.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(ids, ["billing/charge", "shared/audit"]);

        let result = workflow.register("unprefixed", schema!["charge"], None);
        assert!(matches!(result, Err(WorkflowError::UnknownStepId { .. })));
    }

    #[test]
    fn test_invalid_prefix() {
        let mut workflow = Workflow::from_steps([noop("a")]).expect("valid steps");
        let result = workflow.register("flow", schema!["a"], Some(""));
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_markers_must_sit_in_a_loop() {
        let mut workflow = Workflow::from_steps([noop("a")]).expect("valid steps");

        let result = workflow.register(
            "top",
            schema!["a", SchemaItem::break_when("true")],
            None,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::MarkerOutsideLoop { marker: "break", .. })
        ));

        let result = workflow.register(
            "block",
            schema![Block::new(schema!["a", SchemaItem::continue_when("true")])],
            None,
        );
        assert!(matches!(
            result,
            Err(WorkflowError::MarkerOutsideLoop { marker: "continue", .. })
        ));

        // A conditional block inside a loop is fine.
        workflow
            .register(
                "nested",
                schema![Block::looping(
                    "true",
                    schema![Block::new(schema!["a", SchemaItem::break_when("true")]).when("x")]
                )],
                None,
            )
            .expect("valid schema");
    }

    #[test]
    fn test_builder_reports_first_error() {
        let result = Workflow::builder()
            .add_step(noop("a"))
            .register("flow", schema!["missing"])
            .add_step(noop("a"))
            .build();
        assert!(matches!(result, Err(WorkflowError::UnknownStepId { .. })));
    }

    #[test]
    fn test_builder_validates_config() {
        let result = Workflow::builder()
            .config(WorkflowConfig::default().with_max_loop_iterations(0))
            .build();
        assert!(matches!(result, Err(WorkflowError::Configuration(_))));
    }

    #[test]
    fn test_builder() {
        let workflow = Workflow::builder()
            .add_steps([noop("a"), noop("b")])
            .register("flow", schema!["a", "b"])
            .build()
            .expect("valid workflow");

        assert_eq!(workflow.step_count(), 2);
        assert!(workflow.has_step("a"));
        assert!(workflow.has_schema("flow"));
    }

    #[tokio::test]
    async fn test_start_unknown_schema() {
        let workflow = Workflow::new();
        let result = workflow.start("nope", Context::new(), None).await;
        assert!(matches!(result, Err(WorkflowError::UnknownSchemaId(id)) if id == "nope"));
    }
}
