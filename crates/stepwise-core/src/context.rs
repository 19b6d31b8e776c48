//! Workflow execution context backed by a JSON object.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Caller-owned state threaded through every step invocation.
///
/// The context is a plain JSON object so that a halted execution can be
/// persisted and handed back later. Gate conditions see its top-level keys as
/// variables, e.g. `result < 10`.
///
/// # Examples
///
/// ```
/// use stepwise_core::Context;
///
/// let mut ctx = Context::new();
///
/// ctx.insert("user_id", 123u64);
/// ctx.insert("name", "Alice");
/// ctx.insert("active", true);
///
/// assert_eq!(ctx.get::<u64>("user_id"), Some(123));
/// assert_eq!(ctx.get::<String>("name"), Some("Alice".to_string()));
/// assert_eq!(ctx.get::<bool>("active"), Some(true));
///
/// // Wrong type returns None
/// assert_eq!(ctx.get::<String>("user_id"), None);
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Context {
    data: Map<String, Value>,
}

impl Context {
    /// Creates a new empty context.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a context from a JSON value, which must be an object.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        serde_json::from_value(value)
    }

    /// Inserts a value with the given key.
    ///
    /// If the key already exists, the previous value is replaced.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.data.insert(key.into(), value.into());
    }

    /// Serializes `value` and stores it under `key`.
    pub fn insert_serialized<T: Serialize>(
        &mut self,
        key: impl Into<String>,
        value: &T,
    ) -> Result<(), serde_json::Error> {
        let value = serde_json::to_value(value)?;
        self.data.insert(key.into(), value);
        Ok(())
    }

    /// Returns a copy of the value for the given key, deserialized as `T`.
    ///
    /// Returns `None` if the key doesn't exist or the type doesn't match.
    pub fn get<T: DeserializeOwned>(&self, key: &str) -> Option<T> {
        self.data
            .get(key)
            .and_then(|v| T::deserialize(v).ok())
    }

    /// Returns a reference to the raw value for the given key.
    pub fn get_value(&self, key: &str) -> Option<&Value> {
        self.data.get(key)
    }

    /// Returns a mutable reference to the raw value for the given key.
    pub fn get_value_mut(&mut self, key: &str) -> Option<&mut Value> {
        self.data.get_mut(key)
    }

    /// Removes a value by key and returns it.
    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.data.remove(key)
    }

    /// Returns `true` if the context contains a value for the given key.
    pub fn contains_key(&self, key: &str) -> bool {
        self.data.contains_key(key)
    }

    /// Returns an iterator over all keys in the context.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.data.keys()
    }

    /// Returns the number of entries in the context.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns `true` if the context contains no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Removes all entries from the context.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Returns the context as a JSON object, used as expression bindings.
    pub fn to_value(&self) -> Value {
        Value::Object(self.data.clone())
    }
}

impl From<Map<String, Value>> for Context {
    fn from(data: Map<String, Value>) -> Self {
        Self { data }
    }
}

impl From<Context> for Value {
    fn from(ctx: Context) -> Self {
        Value::Object(ctx.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_typed_storage() {
        let mut ctx = Context::new();

        ctx.insert("int", 42i32);
        ctx.insert("string", "hello");
        ctx.insert("bool", true);

        assert_eq!(ctx.get::<i32>("int"), Some(42));
        assert_eq!(ctx.get::<String>("string"), Some("hello".to_string()));
        assert_eq!(ctx.get::<bool>("bool"), Some(true));

        // Wrong type returns None
        assert_eq!(ctx.get::<String>("int"), None);
    }

    #[test]
    fn test_get_value_mut() {
        let mut ctx = Context::new();
        ctx.insert("count", 0);

        if let Some(count) = ctx.get_value_mut("count") {
            *count = json!(1);
        }

        assert_eq!(ctx.get::<i32>("count"), Some(1));
    }

    #[test]
    fn test_remove() {
        let mut ctx = Context::new();
        ctx.insert("key", "value");

        let removed = ctx.remove("key");
        assert_eq!(removed, Some(json!("value")));
        assert!(!ctx.contains_key("key"));
    }

    #[test]
    fn test_from_value_requires_object() {
        let ctx = Context::from_value(json!({ "result": 1 })).expect("object context");
        assert_eq!(ctx.get::<f64>("result"), Some(1.0));

        assert!(Context::from_value(json!([1, 2, 3])).is_err());
    }

    #[test]
    fn test_insert_serialized() {
        #[derive(Serialize, Deserialize, Debug, PartialEq)]
        struct Order {
            id: u32,
            total: f64,
        }

        let mut ctx = Context::new();
        ctx.insert_serialized("order", &Order { id: 7, total: 12.5 })
            .expect("serializable");

        assert_eq!(ctx.get::<Order>("order"), Some(Order { id: 7, total: 12.5 }));
        assert_eq!(ctx.to_value(), json!({ "order": { "id": 7, "total": 12.5 } }));
    }

    #[test]
    fn test_serde_transparent() {
        let mut ctx = Context::new();
        ctx.insert("result", 2.0);

        let encoded = serde_json::to_string(&ctx).expect("serializable");
        assert_eq!(encoded, r#"{"result":2.0}"#);

        let decoded: Context = serde_json::from_str(&encoded).expect("deserializable");
        assert_eq!(decoded, ctx);
    }
}
