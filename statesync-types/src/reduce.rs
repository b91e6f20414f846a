//! Reducer registry: mutation type → pure module-state mutation.
//!
//! Reducers are the single source of truth for mutation → state changes.
//! Every process (Worker, Renderer, webview) registers the same set, so the
//! same mutation stream produces the same tree everywhere.
//!
//! Reducers only mutate the module state they are registered against. They do
//! NOT:
//! - Touch other modules
//! - Perform I/O
//! - Forward or record the mutation

use std::collections::HashMap;
use std::fmt;

use serde_json::Value;
use thiserror::Error;

use crate::StateTree;

/// Boxed reducer over one module's state.
pub type Reducer = Box<dyn Fn(&mut Value, &Value) -> Result<(), String> + Send>;

/// Why a mutation could not be applied.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReduceError {
    #[error("no reducer registered for mutation type `{0}`")]
    UnknownType(String),
    #[error("module `{module}` targeted by `{kind}` is not in the state tree")]
    MissingModule { kind: String, module: String },
    #[error("reducer for `{kind}` rejected its payload: {reason}")]
    Rejected { kind: String, reason: String },
}

struct Registration {
    module: String,
    reducer: Reducer,
}

/// Reducers keyed by mutation type.
#[derive(Default)]
pub struct ReducerRegistry {
    reducers: HashMap<String, Registration>,
}

impl ReducerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `reducer` for mutation type `kind`, operating on `module`.
    /// Re-registering a type replaces the previous reducer.
    pub fn register<F>(&mut self, module: impl Into<String>, kind: impl Into<String>, reducer: F)
    where
        F: Fn(&mut Value, &Value) -> Result<(), String> + Send + 'static,
    {
        let kind = kind.into();
        let module = module.into();
        if self
            .reducers
            .insert(kind.clone(), Registration { module, reducer: Box::new(reducer) })
            .is_some()
        {
            log::debug!("reducer for `{}` replaced", kind);
        }
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.reducers.contains_key(kind)
    }

    pub fn module_for(&self, kind: &str) -> Option<&str> {
        self.reducers.get(kind).map(|r| r.module.as_str())
    }

    /// Apply the reducer for `kind` to `tree`.
    ///
    /// The reducer runs against a copy of the module state; the tree is only
    /// written back when it succeeds, so a refused mutation leaves no trace.
    pub fn reduce(&self, tree: &mut StateTree, kind: &str, payload: &Value) -> Result<(), ReduceError> {
        let registration = self
            .reducers
            .get(kind)
            .ok_or_else(|| ReduceError::UnknownType(kind.to_string()))?;

        let current = tree
            .module(&registration.module)
            .ok_or_else(|| ReduceError::MissingModule {
                kind: kind.to_string(),
                module: registration.module.clone(),
            })?;

        let mut next = current.clone();
        (registration.reducer)(&mut next, payload).map_err(|reason| ReduceError::Rejected {
            kind: kind.to_string(),
            reason,
        })?;

        if let Some(slot) = tree.module_mut(&registration.module) {
            *slot = next;
        }
        Ok(())
    }
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut kinds: Vec<&str> = self.reducers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        f.debug_struct("ReducerRegistry").field("kinds", &kinds).finish()
    }
}
