//! Workflow schema model.
//!
//! A schema is an ordered tree of items: step references, conditional blocks,
//! loop blocks and loop-control markers. Schemas are built in code with the
//! constructors below or deserialized from the JSON shorthand:
//!
//! ```json
//! [
//!   "add",
//!   { "id": "mul", "input": 2 },
//!   { "condition": "result > 10", "steps": ["div"] },
//!   { "while": "result < 10", "steps": [{ "id": "add", "input": 1 }, { "break": "result > 5" }] }
//! ]
//! ```

use crate::context::Context;
use crate::step::StepId;
use serde::Deserialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;

/// A boolean condition over the context.
#[derive(Clone)]
pub enum Condition {
    /// Expression text, evaluated with the context's top-level keys as
    /// variables.
    ///
    /// The result is coerced with [`truthy`](crate::truthy), but only once
    /// evaluation succeeds: referencing a key the context does not hold is an
    /// evaluation error, not a falsy value, and aborts the execution. Seed
    /// the keys a gate reads before starting.
    Expression(String),
    /// A native predicate.
    Native(Arc<dyn Fn(&Context) -> bool + Send + Sync>),
}

impl Condition {
    /// Creates an expression condition.
    pub fn expr(source: impl Into<String>) -> Self {
        Self::Expression(source.into())
    }

    /// Creates a native condition.
    pub fn native<F>(f: F) -> Self
    where
        F: Fn(&Context) -> bool + Send + Sync + 'static,
    {
        Self::Native(Arc::new(f))
    }

    /// Returns the source text, or `<native>` for native predicates.
    pub fn describe(&self) -> &str {
        match self {
            Condition::Expression(source) => source,
            Condition::Native(_) => "<native>",
        }
    }
}

impl fmt::Debug for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Condition::Expression(source) => f.debug_tuple("Expression").field(source).finish(),
            Condition::Native(_) => f.write_str("Native(..)"),
        }
    }
}

impl From<&str> for Condition {
    fn from(source: &str) -> Self {
        Self::expr(source)
    }
}

impl From<String> for Condition {
    fn from(source: String) -> Self {
        Self::Expression(source)
    }
}

/// A reference to a registered step.
#[derive(Debug, Clone)]
pub struct StepRef {
    /// The referenced step. Rewritten to its absolute id at registration.
    pub id: StepId,
    /// Literal input merged with call-supplied input.
    pub input: Option<Value>,
    /// Optional gate, evaluated every time the step is reached.
    pub condition: Option<Condition>,
}

impl StepRef {
    /// Creates a reference without input or gate.
    pub fn new(id: impl Into<StepId>) -> Self {
        Self {
            id: id.into(),
            input: None,
            condition: None,
        }
    }

    /// Sets the literal input.
    pub fn with_input(mut self, input: impl Into<Value>) -> Self {
        self.input = Some(input.into());
        self
    }

    /// Sets the gate.
    pub fn when(mut self, condition: impl Into<Condition>) -> Self {
        self.condition = Some(condition.into());
        self
    }
}

/// A nested list of items: a conditional block, or a loop when `while_cond`
/// is set.
#[derive(Debug, Clone)]
pub struct Block {
    /// Gate checked once when the block is first entered.
    pub condition: Option<Condition>,
    /// Loop condition, checked before every iteration.
    pub while_cond: Option<Condition>,
    /// The block's children.
    pub steps: Schema,
}

impl Block {
    /// Creates a plain block that always runs its children once.
    pub fn new(steps: impl Into<Schema>) -> Self {
        Self {
            condition: None,
            while_cond: None,
            steps: steps.into(),
        }
    }

    /// Creates a loop block.
    pub fn looping(while_cond: impl Into<Condition>, steps: impl Into<Schema>) -> Self {
        Self {
            condition: None,
            while_cond: Some(while_cond.into()),
            steps: steps.into(),
        }
    }

    /// Sets the gate.
    pub fn when(mut self, condition: impl Into<Condition>) -> Self {
        self.condition = Some(condition.into());
        self
    }

    /// Returns `true` if this block is a loop.
    pub fn is_loop(&self) -> bool {
        self.while_cond.is_some()
    }
}

/// One entry of a schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawItem")]
pub enum SchemaItem {
    /// Invoke a step.
    Step(StepRef),
    /// Descend into a conditional or loop block.
    Block(Block),
    /// End the innermost loop when the condition holds.
    Break(Condition),
    /// End the current iteration of the innermost loop when the condition
    /// holds.
    Continue(Condition),
}

impl SchemaItem {
    /// Shorthand for a bare step reference.
    pub fn step(id: impl Into<StepId>) -> Self {
        Self::Step(StepRef::new(id))
    }

    /// Shorthand for a `break` marker.
    pub fn break_when(condition: impl Into<Condition>) -> Self {
        Self::Break(condition.into())
    }

    /// Shorthand for a `continue` marker.
    pub fn continue_when(condition: impl Into<Condition>) -> Self {
        Self::Continue(condition.into())
    }
}

impl From<&str> for SchemaItem {
    fn from(id: &str) -> Self {
        Self::step(id)
    }
}

impl From<StepRef> for SchemaItem {
    fn from(step: StepRef) -> Self {
        Self::Step(step)
    }
}

impl From<Block> for SchemaItem {
    fn from(block: Block) -> Self {
        Self::Block(block)
    }
}

/// An ordered list of schema items.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct Schema(Vec<SchemaItem>);

impl Schema {
    /// Creates a schema from items.
    pub fn new(items: Vec<SchemaItem>) -> Self {
        Self(items)
    }

    /// Returns the items.
    pub fn items(&self) -> &[SchemaItem] {
        &self.0
    }

    /// Returns the number of top-level items.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns `true` if the schema has no items.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns an iterator over the top-level items.
    pub fn iter(&self) -> std::slice::Iter<'_, SchemaItem> {
        self.0.iter()
    }

    /// Follows a position stack and returns the step it points at.
    ///
    /// Every index but the last must select a block; the last must select a
    /// step reference. Returns `None` for any other shape.
    pub fn locate(&self, indexes: &[usize]) -> Option<&StepRef> {
        let (last, path) = indexes.split_last()?;
        let mut items = self.items();
        for &index in path {
            match items.get(index)? {
                SchemaItem::Block(block) => items = block.steps.items(),
                _ => return None,
            }
        }
        match items.get(*last)? {
            SchemaItem::Step(step) => Some(step),
            _ => None,
        }
    }
}

impl From<Vec<SchemaItem>> for Schema {
    fn from(items: Vec<SchemaItem>) -> Self {
        Self(items)
    }
}

impl<'a> IntoIterator for &'a Schema {
    type Item = &'a SchemaItem;
    type IntoIter = std::slice::Iter<'a, SchemaItem>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

/// Builds a [`Schema`] from a list of items convertible into [`SchemaItem`].
///
/// ```
/// use stepwise_core::{schema, Block, StepRef};
///
/// let flow = schema![
///     "add",
///     StepRef::new("mul").with_input(2),
///     Block::looping("result < 10", schema![StepRef::new("add").with_input(1)]),
/// ];
/// assert_eq!(flow.len(), 3);
/// ```
#[macro_export]
macro_rules! schema {
    ($($item:expr),* $(,)?) => {
        $crate::Schema::new(vec![$($crate::SchemaItem::from($item)),*])
    };
}

/// Wire shapes accepted for a schema item.
#[derive(Deserialize)]
#[serde(untagged)]
enum RawItem {
    Id(String),
    Step {
        id: String,
        #[serde(default)]
        input: Option<Value>,
        #[serde(default)]
        condition: Option<String>,
    },
    Block {
        steps: Schema,
        #[serde(default)]
        condition: Option<String>,
        #[serde(default, rename = "while")]
        while_cond: Option<String>,
    },
    Break {
        #[serde(rename = "break")]
        cond: String,
    },
    Continue {
        #[serde(rename = "continue")]
        cond: String,
    },
}

impl TryFrom<RawItem> for SchemaItem {
    type Error = String;

    fn try_from(raw: RawItem) -> Result<Self, Self::Error> {
        Ok(match raw {
            RawItem::Id(id) if id.is_empty() => return Err("empty step id".to_string()),
            RawItem::Id(id) => SchemaItem::step(id),
            RawItem::Step {
                id,
                input,
                condition,
            } => {
                if id.is_empty() {
                    return Err("empty step id".to_string());
                }
                SchemaItem::Step(StepRef {
                    id: StepId::new(id),
                    input,
                    condition: condition.map(Condition::Expression),
                })
            }
            RawItem::Block {
                steps,
                condition,
                while_cond,
            } => SchemaItem::Block(Block {
                condition: condition.map(Condition::Expression),
                while_cond: while_cond.map(Condition::Expression),
                steps,
            }),
            RawItem::Break { cond } => SchemaItem::Break(Condition::Expression(cond)),
            RawItem::Continue { cond } => SchemaItem::Continue(Condition::Expression(cond)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_deserialize_shorthand_forms() {
        let schema: Schema = serde_json::from_value(json!([
            "add",
            { "id": "mul", "input": 2 },
            { "condition": "result > 10", "steps": ["div"] },
            { "while": "result < 10", "steps": [
                { "id": "add", "input": 1, "condition": "result != 3" },
                { "break": "result > 5" },
                { "continue": "result > 4" }
            ] }
        ]))
        .expect("valid schema");

        assert_eq!(schema.len(), 4);
        match &schema.items()[1] {
            SchemaItem::Step(step) => {
                assert_eq!(step.id.as_str(), "mul");
                assert_eq!(step.input, Some(json!(2)));
            }
            other => panic!("expected step, got {other:?}"),
        }
        match &schema.items()[2] {
            SchemaItem::Block(block) => {
                assert!(!block.is_loop());
                assert_eq!(block.condition.as_ref().map(Condition::describe), Some("result > 10"));
            }
            other => panic!("expected block, got {other:?}"),
        }
        match &schema.items()[3] {
            SchemaItem::Block(block) => {
                assert!(block.is_loop());
                assert!(matches!(block.steps.items()[1], SchemaItem::Break(_)));
                assert!(matches!(block.steps.items()[2], SchemaItem::Continue(_)));
            }
            other => panic!("expected loop, got {other:?}"),
        }
    }

    #[test]
    fn test_deserialize_rejects_unknown_shapes() {
        assert!(serde_json::from_value::<Schema>(json!([{ "foo": 1 }])).is_err());
        assert!(serde_json::from_value::<Schema>(json!([""])).is_err());
        assert!(serde_json::from_value::<Schema>(json!([42])).is_err());
    }

    #[test]
    fn test_locate() {
        let schema = schema![
            "a",
            Block::new(schema!["b", Block::looping("x < 1", schema!["c"])]),
        ];

        assert_eq!(schema.locate(&[0]).map(|s| s.id.as_str()), Some("a"));
        assert_eq!(schema.locate(&[1, 0]).map(|s| s.id.as_str()), Some("b"));
        assert_eq!(schema.locate(&[1, 1, 0]).map(|s| s.id.as_str()), Some("c"));

        assert!(schema.locate(&[]).is_none());
        assert!(schema.locate(&[1]).is_none());
        assert!(schema.locate(&[0, 0]).is_none());
        assert!(schema.locate(&[2]).is_none());
    }

    #[test]
    fn test_condition_describe() {
        assert_eq!(Condition::expr("result < 0").describe(), "result < 0");
        assert_eq!(Condition::native(|_| true).describe(), "<native>");
    }
}
