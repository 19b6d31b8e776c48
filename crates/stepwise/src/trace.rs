//! Structured trace events and listener fan-out.

use dashmap::DashMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use stepwise_core::{Context, StepId};
use tracing::{debug, error, warn};

/// Lifecycle transitions reported to listeners.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceEventKind {
    /// `start` entered a schema.
    WorkflowStart,
    /// `resume`/`retry` re-entered a schema.
    ResumeStart,
    /// A nested block is being entered.
    SubflowStart,
    /// A step was invoked.
    Step,
    /// A gate condition was evaluated.
    EvalConditionFn,
    /// A loop `while` condition was evaluated.
    EvalWhileCond,
    /// A `break` marker was evaluated.
    EvalBreakFn,
    /// A `continue` marker was evaluated.
    EvalContinueFn,
    /// A `start` call halted.
    WorkflowInterrupt,
    /// A `resume`/`retry` call halted.
    ResumeInterrupt,
    /// A nested block halted.
    SubflowInterrupt,
    /// A `start` call finished the workflow.
    WorkflowEnd,
    /// A `resume`/`retry` call finished the workflow.
    ResumeEnd,
    /// A nested block completed.
    SubflowEnd,
}

impl TraceEventKind {
    /// Returns the wire name of the event.
    pub fn as_str(&self) -> &'static str {
        match self {
            TraceEventKind::WorkflowStart => "workflow-start",
            TraceEventKind::ResumeStart => "resume-start",
            TraceEventKind::SubflowStart => "subflow-start",
            TraceEventKind::Step => "step",
            TraceEventKind::EvalConditionFn => "eval-condition-fn",
            TraceEventKind::EvalWhileCond => "eval-while-cond",
            TraceEventKind::EvalBreakFn => "eval-break-fn",
            TraceEventKind::EvalContinueFn => "eval-continue-fn",
            TraceEventKind::WorkflowInterrupt => "workflow-interrupt",
            TraceEventKind::ResumeInterrupt => "resume-interrupt",
            TraceEventKind::SubflowInterrupt => "subflow-interrupt",
            TraceEventKind::WorkflowEnd => "workflow-end",
            TraceEventKind::ResumeEnd => "resume-end",
            TraceEventKind::SubflowEnd => "subflow-end",
        }
    }
}

impl fmt::Display for TraceEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event-specific payload.
#[derive(Debug, Clone, Copy)]
pub enum EventDetail<'a> {
    /// No payload.
    None,
    /// The schema being started or resumed.
    Schema(&'a str),
    /// The invoked step.
    Step(&'a StepId),
    /// A condition and what it evaluated to.
    Condition {
        /// Source text, or `<native>`.
        source: &'a str,
        /// The evaluated result.
        result: bool,
    },
}

/// A snapshot of the execution at one lifecycle transition.
#[derive(Debug, Clone, Copy)]
pub struct TraceEvent<'a> {
    /// What happened.
    pub kind: TraceEventKind,
    /// Event-specific payload.
    pub detail: EventDetail<'a>,
    /// The running schema.
    pub schema_id: &'a str,
    /// The context as it is right now.
    pub context: &'a Context,
    /// The position stack as it is right now.
    pub indexes: &'a [usize],
    /// The last step touched.
    pub step_id: Option<&'a StepId>,
    /// Duration of the timed operation, for steps, conditions and ends.
    pub elapsed: Option<Duration>,
}

impl TraceEvent<'_> {
    /// Returns the elapsed time in milliseconds, if the event is timed.
    pub fn elapsed_ms(&self) -> Option<f64> {
        self.elapsed.map(|d| d.as_secs_f64() * 1000.0)
    }
}

/// Error type listeners may return. It is logged and otherwise ignored.
pub type ListenerError = Box<dyn std::error::Error + Send + Sync>;

/// Receives trace events.
///
/// A listener that fails or panics never affects the execution.
pub trait Listener: Send + Sync {
    /// Called for every emitted event.
    fn on_event(&self, event: &TraceEvent<'_>) -> Result<(), ListenerError>;
}

/// A [`Listener`] backed by a closure. Created with [`listener_fn`].
pub struct FnListener<F>(F);

impl<F> Listener for FnListener<F>
where
    F: Fn(&TraceEvent<'_>) -> Result<(), ListenerError> + Send + Sync,
{
    fn on_event(&self, event: &TraceEvent<'_>) -> Result<(), ListenerError> {
        (self.0)(event)
    }
}

/// Wraps a closure as a [`Listener`].
///
/// ```
/// use stepwise::listener_fn;
///
/// let listener = listener_fn(|event| {
///     println!("{} {:?}", event.kind, event.indexes);
///     Ok(())
/// });
/// # let _ = listener;
/// ```
pub fn listener_fn<F>(f: F) -> FnListener<F>
where
    F: Fn(&TraceEvent<'_>) -> Result<(), ListenerError> + Send + Sync,
{
    FnListener(f)
}

/// Forwards every event to `tracing` at debug level.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogListener;

impl Listener for LogListener {
    fn on_event(&self, event: &TraceEvent<'_>) -> Result<(), ListenerError> {
        debug!(
            event = event.kind.as_str(),
            schema = event.schema_id,
            step = event.step_id.map(StepId::as_str),
            indexes = ?event.indexes,
            detail = ?event.detail,
            elapsed_ms = event.elapsed_ms(),
            "workflow trace"
        );
        Ok(())
    }
}

/// Handle returned by [`Emitter::attach`], used to detach the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Fans trace events out to attached listeners.
#[derive(Default)]
pub struct Emitter {
    listeners: DashMap<ListenerId, Arc<dyn Listener>>,
    next_id: AtomicU64,
}

impl fmt::Debug for Emitter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Emitter")
            .field("listeners", &self.listeners.len())
            .finish()
    }
}

impl Emitter {
    /// Creates an emitter with no listeners.
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a listener.
    pub fn attach(&self, listener: impl Listener + 'static) -> ListenerId {
        self.attach_shared(Arc::new(listener))
    }

    /// Attaches a shared listener.
    pub fn attach_shared(&self, listener: Arc<dyn Listener>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.insert(id, listener);
        id
    }

    /// Detaches a listener. Returns `false` if it was not attached.
    pub fn detach(&self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Returns the number of attached listeners.
    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    /// Returns `true` if no listener is attached.
    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }

    /// Delivers `event` to every attached listener, then to `local`.
    pub fn emit(&self, event: &TraceEvent<'_>, local: Option<&dyn Listener>) {
        if local.is_none() && self.listeners.is_empty() {
            return;
        }
        // Snapshot so listeners may attach or detach while being notified.
        let attached: Vec<Arc<dyn Listener>> = self
            .listeners
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for listener in attached.iter().map(|l| l.as_ref()).chain(local) {
            notify(listener, event);
        }
    }
}

fn notify(listener: &dyn Listener, event: &TraceEvent<'_>) {
    match panic::catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!("Listener failed on '{}': {}", event.kind, e),
        Err(_) => error!("Listener panicked on '{}'", event.kind),
    }
}
