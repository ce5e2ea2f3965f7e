//! Per-machine mutable key/value store (C4).
//!
//! Thread confinement: the live map is owned by the machine's event-loop
//! task and only touched during step execution. Everything outside the
//! loop sees snapshot clones via the machine's watch channel.

use serde_json::{Map, Value};

/// The machine-scoped context map. Written by actions (and by the engine
/// for the reserved `_event`/`_result`/`_error` keys), read by actions and
/// guards.
#[derive(Clone, Debug, Default)]
pub struct Context {
    values: Map<String, Value>,
}

impl Context {
    pub fn new(initial: Map<String, Value>) -> Self {
        Self { values: initial }
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: Value) {
        self.values.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.values.remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.values.contains_key(key)
    }

    /// Clone of the whole map, for snapshots and service jobs.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.values.clone()
    }

    pub fn view(&self) -> ContextView<'_> {
        ContextView { inner: self }
    }
}

/// Read-only handle handed to guards. Guards must be pure; this type is
/// the whole of what they can see.
#[derive(Clone, Copy)]
pub struct ContextView<'a> {
    inner: &'a Context,
}

impl<'a> ContextView<'a> {
    pub fn get(&self, key: &str) -> Option<&'a Value> {
        self.inner.values.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.inner.values.contains_key(key)
    }

    /// Convenience: the value as i64, if present and numeric.
    pub fn get_i64(&self, key: &str) -> Option<i64> {
        self.inner.values.get(key).and_then(Value::as_i64)
    }

    pub fn get_str(&self, key: &str) -> Option<&'a str> {
        self.inner.values.get(key).and_then(Value::as_str)
    }

    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.inner.values.get(key).and_then(Value::as_bool)
    }
}
