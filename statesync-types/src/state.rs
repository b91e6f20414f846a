//! The shared state tree: module name → module state.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Mapping from module name to that module's state.
///
/// Only mutated by applying mutations or by loading a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StateTree {
    modules: BTreeMap<String, Value>,
}

impl StateTree {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_module(&mut self, name: impl Into<String>, state: Value) -> Option<Value> {
        self.modules.insert(name.into(), state)
    }

    pub fn module(&self, name: &str) -> Option<&Value> {
        self.modules.get(name)
    }

    pub fn module_mut(&mut self, name: &str) -> Option<&mut Value> {
        self.modules.get_mut(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.modules.contains_key(name)
    }

    pub fn modules(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.modules.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Serialize the whole tree for a snapshot.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn serializes_as_plain_object() {
        let mut tree = StateTree::new();
        tree.insert_module("counter", json!({"value": 3}));
        tree.insert_module("todos", json!([]));

        let json = tree.to_json().unwrap();
        assert_eq!(json, r#"{"counter":{"value":3},"todos":[]}"#);
        assert_eq!(StateTree::from_json(&json).unwrap(), tree);
    }

    #[test]
    fn rejects_non_object_snapshot() {
        assert!(StateTree::from_json("[1, 2, 3]").is_err());
        assert!(StateTree::from_json("{not json").is_err());
    }
}
