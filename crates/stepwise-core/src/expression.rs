//! Expression evaluation capability.
//!
//! The interpreter never evaluates text itself. Conditions and expression
//! step handlers are compiled through an [`ExpressionEngine`] and called with
//! a JSON binding object. Engines must be pure functions of the source text so
//! compiled expressions can be memoized and shared between executions.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;
use std::sync::Arc;
use thiserror::Error;

/// Errors that can occur during expression compilation or evaluation.
#[derive(Debug, Clone, Error)]
pub enum ExpressionError {
    /// The source text could not be compiled.
    #[error("Expression compilation failed: {0}")]
    CompileFailed(String),

    /// Evaluation against the bindings failed.
    #[error("Expression evaluation failed: {0}")]
    EvalFailed(String),

    /// The bindings were not a JSON object.
    #[error("Invalid bindings: {0}")]
    InvalidBindings(String),
}

/// A compiled expression, callable any number of times.
#[async_trait]
pub trait Expression: Send + Sync + Debug {
    /// Returns the source text this expression was compiled from.
    fn source(&self) -> &str;

    /// Evaluates the expression against `bindings`.
    ///
    /// Evaluation must not have side effects beyond reading the bindings.
    async fn call(&self, bindings: &Value) -> Result<Value, ExpressionError>;
}

/// Compiles source text into callable [`Expression`]s.
pub trait ExpressionEngine: Send + Sync {
    /// Compiles `source`.
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExpressionError>;
}

/// Coerces a JSON value to boolean using JavaScript-like truthiness.
///
/// Only values are coerced. Engines may still reject expressions that read
/// unbound variables before any value exists to coerce.
///
/// ```
/// use serde_json::json;
/// use stepwise_core::truthy;
///
/// assert!(truthy(&json!(1)));
/// assert!(!truthy(&json!("")));
/// assert!(!truthy(&json!(null)));
/// assert!(truthy(&json!([])));
/// ```
pub fn truthy(value: &Value) -> bool {
    match value {
        Value::Bool(b) => *b,
        Value::Null => false,
        Value::Number(n) => n.as_f64().map(|f| f != 0.0 && !f.is_nan()).unwrap_or(false),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truthy_numbers() {
        assert!(truthy(&json!(42.0)));
        assert!(truthy(&json!(-1)));
        assert!(!truthy(&json!(0)));
        assert!(!truthy(&json!(0.0)));
    }

    #[test]
    fn test_truthy_collections() {
        assert!(truthy(&json!({})));
        assert!(truthy(&json!({ "a": 1 })));
        assert!(truthy(&json!("non-empty")));
        assert!(!truthy(&json!(false)));
    }

    #[test]
    fn test_error_display() {
        let err = ExpressionError::EvalFailed("unexpected token".to_string());
        assert_eq!(err.to_string(), "Expression evaluation failed: unexpected token");
    }
}
