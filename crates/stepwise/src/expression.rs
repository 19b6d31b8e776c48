//! JEXL expression engine and compiled-expression cache.
//!
//! Bindings are always passed as the evaluation context, never interpolated
//! into expression text.

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use stepwise_core::{Expression, ExpressionEngine, ExpressionError};

/// [`ExpressionEngine`] backed by `jexl-eval`.
///
/// Source text is parsed on [`compile`](ExpressionEngine::compile), so syntax
/// errors surface as [`ExpressionError::CompileFailed`]. One evaluator, with
/// the `length`, `lower`, `upper` and `trim` transforms registered, is shared
/// by every expression the engine compiles.
///
/// ```
/// use serde_json::json;
/// use stepwise::{Expression, ExpressionEngine, JexlEngine};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// let engine = JexlEngine::new();
/// let expression = engine.compile("result > 10").expect("compiles");
/// let value = expression
///     .call(&json!({ "result": 12 }))
///     .await
///     .expect("evaluates");
/// assert_eq!(value, json!(true));
///
/// assert!(engine.compile("result >").is_err());
/// # }
/// ```
#[derive(Clone)]
pub struct JexlEngine {
    evaluator: Arc<jexl_eval::Evaluator<'static>>,
}

impl JexlEngine {
    /// Creates an engine with the standard transforms registered.
    pub fn new() -> Self {
        Self {
            evaluator: Arc::new(evaluator()),
        }
    }
}

impl Default for JexlEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for JexlEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JexlEngine").finish_non_exhaustive()
    }
}

impl ExpressionEngine for JexlEngine {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExpressionError> {
        if source.trim().is_empty() {
            return Err(ExpressionError::CompileFailed(
                "expression text is empty".to_string(),
            ));
        }
        jexl_parser::Parser::parse(source)
            .map_err(|e| ExpressionError::CompileFailed(format!("{e:?}")))?;
        Ok(Arc::new(JexlExpression {
            source: Arc::from(source),
            evaluator: Arc::clone(&self.evaluator),
        }))
    }
}

struct JexlExpression {
    source: Arc<str>,
    evaluator: Arc<jexl_eval::Evaluator<'static>>,
}

impl fmt::Debug for JexlExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JexlExpression")
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Expression for JexlExpression {
    fn source(&self) -> &str {
        &self.source
    }

    async fn call(&self, bindings: &Value) -> Result<Value, ExpressionError> {
        if !bindings.is_object() {
            return Err(ExpressionError::InvalidBindings(
                "bindings must be a JSON object".to_string(),
            ));
        }
        self.evaluator
            .eval_in_context(&self.source, bindings)
            .map_err(|e| ExpressionError::EvalFailed(e.to_string()))
    }
}

fn evaluator() -> jexl_eval::Evaluator<'static> {
    jexl_eval::Evaluator::new()
        .with_transform("lower", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_lowercase()))
        })
        .with_transform("upper", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.to_uppercase()))
        })
        .with_transform("trim", |args: &[Value]| {
            let s = args.first().and_then(|v| v.as_str()).unwrap_or("");
            Ok(json!(s.trim()))
        })
        .with_transform("length", |args: &[Value]| {
            let len = match args.first() {
                Some(Value::String(s)) => s.chars().count(),
                Some(Value::Array(a)) => a.len(),
                Some(Value::Object(o)) => o.len(),
                _ => 0,
            };
            Ok(json!(len as f64))
        })
}

/// Memoizes compiled expressions by source text.
///
/// Compilation is idempotent, so concurrent misses for the same text may both
/// compile; the first inserted entry wins and is shared from then on.
pub struct ExpressionCache<E> {
    engine: E,
    compiled: DashMap<String, Arc<dyn Expression>>,
}

impl<E> ExpressionCache<E> {
    /// Wraps `engine`.
    pub fn new(engine: E) -> Self {
        Self {
            engine,
            compiled: DashMap::new(),
        }
    }

    /// Returns the number of cached expressions.
    pub fn len(&self) -> usize {
        self.compiled.len()
    }

    /// Returns `true` if nothing has been compiled yet.
    pub fn is_empty(&self) -> bool {
        self.compiled.is_empty()
    }

    /// Drops every cached expression.
    pub fn clear(&self) {
        self.compiled.clear();
    }
}

impl<E> fmt::Debug for ExpressionCache<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExpressionCache")
            .field("compiled", &self.compiled.len())
            .finish()
    }
}

impl<E: ExpressionEngine> ExpressionEngine for ExpressionCache<E> {
    fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExpressionError> {
        if let Some(hit) = self.compiled.get(source) {
            return Ok(Arc::clone(hit.value()));
        }
        let compiled = self.engine.compile(source)?;
        let entry = self
            .compiled
            .entry(source.to_string())
            .or_insert(compiled);
        Ok(Arc::clone(entry.value()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_comparison_against_bindings() {
        let expression = JexlEngine::new().compile("result > 10 && result <= 50").expect("compiles");
        assert_eq!(expression.source(), "result > 10 && result <= 50");

        let value = expression.call(&json!({ "result": 46 })).await.expect("evaluates");
        assert_eq!(value, json!(true));

        let value = expression.call(&json!({ "result": 51 })).await.expect("evaluates");
        assert_eq!(value, json!(false));
    }

    #[tokio::test]
    async fn test_transforms() {
        let bindings = json!({ "name": "  Ada ", "tags": ["a", "b"] });

        let expression = JexlEngine::new().compile("name|trim|upper").expect("compiles");
        assert_eq!(expression.call(&bindings).await.expect("evaluates"), json!("ADA"));

        let expression = JexlEngine::new().compile("tags|length").expect("compiles");
        assert_eq!(expression.call(&bindings).await.expect("evaluates"), json!(2.0));
    }

    #[tokio::test]
    async fn test_non_object_bindings_are_rejected() {
        let expression = JexlEngine::new().compile("1 + 1").expect("compiles");
        let result = expression.call(&json!([1, 2])).await;
        assert!(matches!(result, Err(ExpressionError::InvalidBindings(_))));
    }

    #[test]
    fn test_syntax_error_fails_to_compile() {
        let engine = JexlEngine::new();
        assert!(matches!(
            engine.compile("result >>> (("),
            Err(ExpressionError::CompileFailed(_))
        ));
        assert!(matches!(
            engine.compile("result >"),
            Err(ExpressionError::CompileFailed(_))
        ));
    }

    #[tokio::test]
    async fn test_unbound_identifier_fails_on_call() {
        let expression = JexlEngine::new().compile("missing > 1").expect("compiles");
        let result = expression.call(&json!({ "result": 1 })).await;
        assert!(matches!(result, Err(ExpressionError::EvalFailed(_))));
    }

    #[tokio::test]
    async fn test_expressions_share_one_evaluator() {
        let engine = JexlEngine::new();
        let first = engine.compile("name|upper").expect("compiles");
        let second = engine.compile("name|lower").expect("compiles");
        let bindings = json!({ "name": "Ada" });

        assert_eq!(first.call(&bindings).await.expect("evaluates"), json!("ADA"));
        assert_eq!(second.call(&bindings).await.expect("evaluates"), json!("ada"));
        assert_eq!(Arc::strong_count(&engine.evaluator), 3);
    }

    #[test]
    fn test_empty_source_fails_to_compile() {
        assert!(matches!(
            JexlEngine::new().compile("   "),
            Err(ExpressionError::CompileFailed(_))
        ));
    }

    struct CountingEngine(AtomicUsize);

    impl ExpressionEngine for CountingEngine {
        fn compile(&self, source: &str) -> Result<Arc<dyn Expression>, ExpressionError> {
            self.0.fetch_add(1, Ordering::SeqCst);
            JexlEngine::new().compile(source)
        }
    }

    #[test]
    fn test_cache_compiles_each_source_once() {
        let cache = ExpressionCache::new(CountingEngine(AtomicUsize::new(0)));

        let first = cache.compile("result < 10").expect("compiles");
        let second = cache.compile("result < 10").expect("compiles");
        cache.compile("result > 10").expect("compiles");

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.engine.0.load(Ordering::SeqCst), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn test_cache_does_not_store_failures() {
        let cache = ExpressionCache::new(JexlEngine::new());
        assert!(cache.compile("").is_err());
        assert!(cache.is_empty());
    }
}
