//! Recursive interpreter over the position stack.
//!
//! Every nesting depth owns one entry of the position stack. A depth pushes
//! its entry when first entered, keeps it current while walking its items and
//! pops it when all items are done. An interrupted call leaves the stack
//! untouched, so the next call walks straight back to the halted step: every
//! depth that finds deeper entries below its own is resuming and skips the
//! gate of the item it is resuming into.

use crate::result::{ExecutionResult, FlowState};
use crate::trace::{EventDetail, Listener, TraceEvent, TraceEventKind};
use crate::workflow::Workflow;
use serde_json::Value;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{
    truthy, Condition, Context, ExpressionError, InputRequest, RetriableError, Schema,
    SchemaItem, StepError, StepId, StepOutcome, StepRef, WorkflowError,
};
use tokio::time::Instant;
use tracing::{debug, info, warn};

type Advance<'a> = Pin<Box<dyn Future<Output = Result<Signal, WorkflowError>> + Send + 'a>>;

/// How a depth stopped walking its items.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    /// All items done.
    Done,
    /// A step halted. The stack addresses it.
    Interrupted,
    /// A `break` marker fired.
    Break,
    /// A `continue` marker fired.
    Continue,
}

/// Whether a call enters a schema fresh or continues a halted execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Entry {
    Start,
    Resume,
}

impl Entry {
    fn event_kinds(self) -> (TraceEventKind, TraceEventKind, TraceEventKind) {
        match self {
            Entry::Start => (
                TraceEventKind::WorkflowStart,
                TraceEventKind::WorkflowInterrupt,
                TraceEventKind::WorkflowEnd,
            ),
            Entry::Resume => (
                TraceEventKind::ResumeStart,
                TraceEventKind::ResumeInterrupt,
                TraceEventKind::ResumeEnd,
            ),
        }
    }
}

impl fmt::Display for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Entry::Start => write!(f, "Starting"),
            Entry::Resume => write!(f, "Resuming"),
        }
    }
}

/// What a halted step left behind for the caller.
#[derive(Default)]
struct Halt {
    input_required: Option<Value>,
    error: Option<RetriableError>,
    expires: Option<u64>,
    errors: Option<Value>,
}

impl From<InputRequest> for Halt {
    fn from(request: InputRequest) -> Self {
        Self {
            input_required: Some(request.descriptor),
            error: None,
            expires: request.expires,
            errors: request.errors,
        }
    }
}

impl From<RetriableError> for Halt {
    fn from(error: RetriableError) -> Self {
        Self {
            input_required: error.input_required().cloned(),
            expires: error.expires(),
            errors: error.errors().cloned(),
            error: Some(error),
        }
    }
}

/// Mutable state of one call.
struct Run {
    schema_id: String,
    ctx: Context,
    indexes: Vec<usize>,
    input: Option<Value>,
    step_id: Option<StepId>,
    halt: Option<Halt>,
    listener: Option<Arc<dyn Listener>>,
}

impl Run {
    fn into_result(self, finished: bool) -> ExecutionResult {
        let halt = self.halt.filter(|_| !finished).unwrap_or_default();
        let mut indexes = self.indexes;
        if finished {
            indexes.clear();
        }
        ExecutionResult {
            schema_id: self.schema_id,
            state: FlowState {
                context: self.ctx,
                indexes,
            },
            finished,
            step_id: self.step_id,
            input_required: halt.input_required,
            error: halt.error,
            expires: halt.expires,
            errors: halt.errors,
            listener: self.listener,
        }
    }
}

impl Workflow {
    pub(crate) async fn execute(
        &self,
        schema_id: String,
        state: FlowState,
        input: Option<Value>,
        listener: Option<Arc<dyn Listener>>,
        entry: Entry,
    ) -> Result<ExecutionResult, WorkflowError> {
        let schema = self
            .schemas
            .get(&schema_id)
            .cloned()
            .ok_or_else(|| WorkflowError::UnknownSchemaId(schema_id.clone()))?;

        if entry == Entry::Resume && schema.locate(&state.indexes).is_none() {
            return Err(WorkflowError::InvalidState {
                schema_id,
                indexes: state.indexes,
            });
        }

        let mut run = Run {
            schema_id,
            ctx: state.context,
            indexes: state.indexes,
            input,
            step_id: None,
            halt: None,
            listener,
        };
        let (start_kind, interrupt_kind, end_kind) = entry.event_kinds();

        info!("{} workflow '{}' at {:?}", entry, run.schema_id, run.indexes);
        self.emit(&run, start_kind, EventDetail::Schema(&run.schema_id), None);
        let started = Instant::now();

        let signal = self.advance(&mut run, schema.items(), 0).await?;

        let finished = signal != Signal::Interrupted;
        let kind = if finished { end_kind } else { interrupt_kind };
        self.emit(
            &run,
            kind,
            EventDetail::Schema(&run.schema_id),
            Some(started.elapsed()),
        );

        if finished {
            info!("Workflow '{}' finished", run.schema_id);
        } else {
            info!(
                "Workflow '{}' interrupted at step '{}' ({:?})",
                run.schema_id,
                run.step_id.as_ref().map(StepId::as_str).unwrap_or_default(),
                run.indexes
            );
        }
        Ok(run.into_result(finished))
    }

    /// Walks `items` at depth `level`, starting from the stack entry for that
    /// depth.
    fn advance<'a>(
        &'a self,
        run: &'a mut Run,
        items: &'a [SchemaItem],
        level: usize,
    ) -> Advance<'a> {
        Box::pin(async move {
            if run.indexes.len() <= level {
                run.indexes.push(0);
            }
            let start = run.indexes[level];
            let mut resuming = run.indexes.len() > level + 1;

            for (index, item) in items.iter().enumerate().skip(start) {
                run.indexes[level] = index;
                let skip_gate = std::mem::take(&mut resuming);

                match item {
                    SchemaItem::Break(condition) => {
                        if self.check(run, condition, TraceEventKind::EvalBreakFn).await? {
                            run.indexes.truncate(level);
                            return Ok(Signal::Break);
                        }
                    }
                    SchemaItem::Continue(condition) => {
                        if self
                            .check(run, condition, TraceEventKind::EvalContinueFn)
                            .await?
                        {
                            run.indexes.truncate(level);
                            return Ok(Signal::Continue);
                        }
                    }
                    SchemaItem::Step(step_ref) => {
                        if !skip_gate && !self.gate(run, step_ref.condition.as_ref()).await? {
                            continue;
                        }
                        if !self.invoke(run, step_ref).await? {
                            return Ok(Signal::Interrupted);
                        }
                    }
                    SchemaItem::Block(block) => {
                        if !skip_gate && !self.gate(run, block.condition.as_ref()).await? {
                            continue;
                        }
                        let signal = match &block.while_cond {
                            Some(while_cond) => {
                                self.repeat(run, &block.steps, while_cond, level, skip_gate)
                                    .await?
                            }
                            None => self.descend(run, block.steps.items(), level + 1).await?,
                        };
                        match signal {
                            Signal::Interrupted => return Ok(Signal::Interrupted),
                            Signal::Break | Signal::Continue => {
                                // Forwarded to the enclosing loop.
                                run.indexes.truncate(level);
                                return Ok(signal);
                            }
                            Signal::Done => run.input = None,
                        }
                    }
                }
            }

            run.indexes.truncate(level);
            Ok(Signal::Done)
        })
    }

    async fn descend(
        &self,
        run: &mut Run,
        items: &[SchemaItem],
        level: usize,
    ) -> Result<Signal, WorkflowError> {
        self.emit(run, TraceEventKind::SubflowStart, EventDetail::None, None);
        let started = Instant::now();

        let signal = self.advance(run, items, level).await?;

        let kind = if signal == Signal::Interrupted {
            TraceEventKind::SubflowInterrupt
        } else {
            TraceEventKind::SubflowEnd
        };
        self.emit(run, kind, EventDetail::None, Some(started.elapsed()));
        Ok(signal)
    }

    /// Runs a loop body until its `while` condition fails or it breaks.
    ///
    /// When resuming into the loop the `while` check for the resumed
    /// iteration already passed and is skipped.
    async fn repeat(
        &self,
        run: &mut Run,
        body: &Schema,
        while_cond: &Condition,
        level: usize,
        resumed: bool,
    ) -> Result<Signal, WorkflowError> {
        let mut check = !resumed;
        let mut iterations: u64 = 0;

        loop {
            if check && !self.check(run, while_cond, TraceEventKind::EvalWhileCond).await? {
                return Ok(Signal::Done);
            }
            check = true;

            iterations += 1;
            if let Some(limit) = self.config.max_loop_iterations {
                if iterations > limit {
                    return Err(WorkflowError::LoopLimitExceeded {
                        schema_id: run.schema_id.clone(),
                        limit,
                    });
                }
            }

            match self.descend(run, body.items(), level + 1).await? {
                Signal::Interrupted => return Ok(Signal::Interrupted),
                Signal::Break => return Ok(Signal::Done),
                Signal::Done | Signal::Continue => run.input = None,
            }
        }
    }

    /// Invokes a step. Returns `false` if it halted the execution.
    async fn invoke(&self, run: &mut Run, step_ref: &StepRef) -> Result<bool, WorkflowError> {
        run.step_id = Some(step_ref.id.clone());
        let step = self
            .steps
            .get(&step_ref.id)
            .cloned()
            .ok_or_else(|| WorkflowError::StepNotFound(step_ref.id.clone()))?;
        let input = merge_input(step_ref.input.as_ref(), run.input.take());

        debug!("Invoking step '{}' at {:?}", step_ref.id, run.indexes);
        let started = Instant::now();
        let outcome = step
            .handle(&mut run.ctx, input, self.expressions.as_ref())
            .await;
        self.emit(
            run,
            TraceEventKind::Step,
            EventDetail::Step(&step_ref.id),
            Some(started.elapsed()),
        );

        let halt = match outcome {
            Ok(StepOutcome::Proceed) => return Ok(true),
            Ok(StepOutcome::InputRequired(request)) => {
                debug!("Step '{}' requires input", step_ref.id);
                Halt::from(request)
            }
            Ok(StepOutcome::Failed(error)) | Err(StepError::Retriable(error)) => {
                warn!("Step '{}' failed, retry possible: {}", step_ref.id, error);
                Halt::from(error)
            }
            Err(source) => {
                return Err(WorkflowError::StepFailed {
                    step_id: step_ref.id.clone(),
                    source,
                })
            }
        };
        run.halt = Some(halt);
        Ok(false)
    }

    async fn gate(&self, run: &Run, condition: Option<&Condition>) -> Result<bool, WorkflowError> {
        match condition {
            Some(condition) => {
                self.check(run, condition, TraceEventKind::EvalConditionFn)
                    .await
            }
            None => Ok(true),
        }
    }

    async fn check(
        &self,
        run: &Run,
        condition: &Condition,
        kind: TraceEventKind,
    ) -> Result<bool, WorkflowError> {
        let started = Instant::now();
        let result = match condition {
            Condition::Native(predicate) => predicate(&run.ctx),
            Condition::Expression(source) => {
                let failed = |e: ExpressionError| WorkflowError::Condition {
                    expression: source.clone(),
                    source: e,
                };
                let expression = self.expressions.compile(source).map_err(failed)?;
                let value = expression.call(&run.ctx.to_value()).await.map_err(failed)?;
                truthy(&value)
            }
        };

        debug!("Condition `{}` evaluated to {}", condition.describe(), result);
        self.emit(
            run,
            kind,
            EventDetail::Condition {
                source: condition.describe(),
                result,
            },
            Some(started.elapsed()),
        );
        Ok(result)
    }

    fn emit(
        &self,
        run: &Run,
        kind: TraceEventKind,
        detail: EventDetail<'_>,
        elapsed: Option<Duration>,
    ) {
        let event = TraceEvent {
            kind,
            detail,
            schema_id: &run.schema_id,
            context: &run.ctx,
            indexes: &run.indexes,
            step_id: run.step_id.as_ref(),
            elapsed,
        };
        self.emitter.emit(&event, run.listener.as_deref());
    }
}

/// Combines a schema item's literal input with call-supplied input.
///
/// Two objects are merged with supplied fields taking precedence. Otherwise
/// supplied input wins outright.
fn merge_input(literal: Option<&Value>, supplied: Option<Value>) -> Option<Value> {
    match (literal, supplied) {
        (None, None) => None,
        (Some(literal), None) => Some(literal.clone()),
        (Some(Value::Object(literal)), Some(Value::Object(supplied))) => {
            let mut merged = literal.clone();
            merged.extend(supplied);
            Some(Value::Object(merged))
        }
        (_, Some(supplied)) => Some(supplied),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_merge_input() {
        assert_eq!(merge_input(None, None), None);
        assert_eq!(merge_input(Some(&json!(5)), None), Some(json!(5)));
        assert_eq!(merge_input(None, Some(json!(2))), Some(json!(2)));
        assert_eq!(merge_input(Some(&json!(5)), Some(json!(2))), Some(json!(2)));
        assert_eq!(
            merge_input(Some(&json!({ "a": 1, "b": 1 })), Some(json!({ "b": 2 }))),
            Some(json!({ "a": 1, "b": 2 }))
        );
        assert_eq!(
            merge_input(Some(&json!({ "a": 1 })), Some(json!([1]))),
            Some(json!([1]))
        );
    }

    #[test]
    fn test_finished_result_drops_halt_and_position() {
        let run = Run {
            schema_id: "flow".to_string(),
            ctx: Context::new(),
            indexes: vec![1],
            input: None,
            step_id: Some(StepId::new("add")),
            halt: Some(Halt::from(InputRequest::new("number"))),
            listener: None,
        };
        let result = run.into_result(true);
        assert!(result.is_finished());
        assert!(result.indexes().is_empty());
        assert!(result.input_required().is_none());
        assert_eq!(result.step_id().map(StepId::as_str), Some("add"));
    }

    #[test]
    fn test_retriable_halt_carries_metadata() {
        let halt = Halt::from(
            RetriableError::new("declined")
                .with_input_required("card")
                .with_expires(99)
                .with_errors(json!(["insufficient funds"])),
        );
        assert!(halt.error.is_some());
        assert_eq!(halt.input_required, Some(json!("card")));
        assert_eq!(halt.expires, Some(99));
        assert_eq!(halt.errors, Some(json!(["insufficient funds"])));
    }
}
