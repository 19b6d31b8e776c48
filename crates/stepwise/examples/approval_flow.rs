//! Expense approval with suspension, persistence and resumption.
//!
//! Demonstrates:
//! - Conditional blocks gated by JEXL expressions
//! - A step that halts until a manager's decision is supplied
//! - Persisting the halted state as JSON and resuming from it later
//! - Retrying after correcting the context

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use stepwise::prelude::*;
use stepwise::LogListener;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Decision {
    approved: bool,
    approver: String,
}

#[derive(Debug)]
struct ValidateExpense;

#[async_trait]
impl StepHandler for ValidateExpense {
    async fn handle(
        &self,
        ctx: &mut Context,
        _input: Option<Value>,
    ) -> Result<StepOutcome, StepError> {
        let amount = ctx.get::<f64>("amount").unwrap_or(0.0);
        if amount <= 0.0 {
            return Ok(StepOutcome::retry(
                RetriableError::new("expense amount must be positive")
                    .with_errors(json!([format!("amount: {amount}")])),
            ));
        }
        println!("Validated expense of {amount:.2}");
        Ok(StepOutcome::proceed())
    }
}

#[derive(Debug)]
struct ManagerApproval;

#[async_trait]
impl StepHandler for ManagerApproval {
    async fn handle(
        &self,
        ctx: &mut Context,
        input: Option<Value>,
    ) -> Result<StepOutcome, StepError> {
        let decision: Decision = input
            .map(serde_json::from_value)
            .transpose()
            .map_err(StepError::fatal)?
            .ok_or_else(|| StepError::fatal("missing decision"))?;
        println!(
            "Manager {} {} the expense",
            decision.approver,
            if decision.approved { "approved" } else { "rejected" }
        );
        ctx.insert("approved", decision.approved);
        ctx.insert_serialized("decision", &decision)
            .map_err(StepError::fatal)?;
        Ok(StepOutcome::proceed())
    }
}

fn record(id: &str, message: &'static str) -> Step {
    Step::from_fn(id, move |ctx: &mut Context, _: Option<Value>| {
        println!("{message}");
        ctx.insert("status", message);
        Ok(StepOutcome::proceed())
    })
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let workflow = Workflow::builder()
        .add_step(Step::new("validate", ValidateExpense))
        .add_step(Step::new("manager_approval", ManagerApproval).requires_input("decision"))
        .add_step(record("reimburse", "Expense reimbursed"))
        .add_step(record("notify_rejected", "Submitter notified of rejection"))
        .register(
            "expense",
            schema![
                "validate",
                Block::new(schema!["manager_approval"]).when("amount > 1000"),
                Block::new(schema!["notify_rejected"]).when("approved == false"),
                StepRef::new("reimburse").when("approved != false"),
            ],
        )
        .listener(LogListener)
        .build()?;

    // A negative amount halts with a retriable error.
    let mut ctx = Context::new();
    ctx.insert("amount", -20.0);
    ctx.insert("approved", Value::Null);
    let mut result = workflow.start("expense", ctx, None).await?;
    if let Some(error) = result.error() {
        println!("Halted: {error} ({:?})", result.errors());
    }

    // Fix the amount and retry. Large expenses wait for a manager.
    result.context_mut().insert("amount", 2500.0);
    let result = workflow.retry(result, None).await?;
    println!(
        "Waiting for {:?} at {:?}",
        result.input_required(),
        result.indexes()
    );

    // Persist the checkpoint, as if the process stopped here.
    let saved = serde_json::to_string(result.state())?;
    println!("Saved state: {saved}");

    let state: FlowState = serde_json::from_str(&saved)?;
    let decision = serde_json::to_value(Decision {
        approved: true,
        approver: "dana".to_string(),
    })?;
    let result = workflow
        .resume_state("expense", state, Some(decision))
        .await?;

    println!(
        "\nWorkflow finished: {} (status: {:?})",
        result.is_finished(),
        result.context().get::<String>("status")
    );
    Ok(())
}
