//! Scratchpad and key/value storage owned by the caller and referenced by a
//! context.

use cadence_protocol::Iteration;
use indexmap::IndexMap;
use parking_lot::RwLock;
use serde_json::Value;

/// Backing store for a context's working memory.
///
/// Implementations only store. Observability around a scratchpad swap is
/// owned by [`ExecutionContext::set_scratchpad`](crate::ExecutionContext::set_scratchpad).
pub trait DataStore: Send + Sync {
    fn scratchpad(&self) -> Vec<Iteration>;
    /// Replace the scratchpad wholesale, returning the previous items.
    fn replace_scratchpad(&self, items: Vec<Iteration>) -> Vec<Iteration>;
    fn value(&self, key: &str) -> Option<Value>;
    fn set_value(&self, key: &str, value: Value);
}

#[derive(Debug, Default)]
pub struct InMemoryData {
    scratchpad: RwLock<Vec<Iteration>>,
    values: RwLock<IndexMap<String, Value>>,
}

impl InMemoryData {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_scratchpad(items: Vec<Iteration>) -> Self {
        Self {
            scratchpad: RwLock::new(items),
            values: RwLock::default(),
        }
    }
}

impl DataStore for InMemoryData {
    fn scratchpad(&self) -> Vec<Iteration> {
        self.scratchpad.read().clone()
    }

    fn replace_scratchpad(&self, items: Vec<Iteration>) -> Vec<Iteration> {
        std::mem::replace(&mut *self.scratchpad.write(), items)
    }

    fn value(&self, key: &str) -> Option<Value> {
        self.values.read().get(key).cloned()
    }

    fn set_value(&self, key: &str, value: Value) {
        self.values.write().insert(key.to_owned(), value);
    }
}
