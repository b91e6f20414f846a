//! # statesync-types
//!
//! Shared data model for statesync.
//! This crate contains the process identities, the mutation envelope, the
//! state tree, and the per-process replica used by statesync-net and the CLI.

pub mod mutation;
pub mod reduce;
pub mod replica;
pub mod state;

pub use mutation::{Mutation, MutationCounter, MutationId, BULK_LOAD_STATE};
pub use reduce::{ReduceError, ReducerRegistry};
pub use replica::{StateReplica, SubscriptionId};
pub use state::StateTree;

/// Unique identifier for one OS-level process taking part in sync.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[serde(transparent)]
pub struct ProcessId(u64);

impl ProcessId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for ProcessId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "p{}", self.0)
    }
}

/// Role a process plays in the sync topology.
///
/// Exactly one `Worker` exists per running application instance; it owns
/// the canonical tree. Renderers hold replicas, and a `WebviewHost` is an
/// embedded sub-frame that only ever talks to the Renderer hosting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub enum ProcessRole {
    Worker,
    Renderer,
    WebviewHost,
}

impl ProcessRole {
    pub fn is_worker(self) -> bool {
        matches!(self, ProcessRole::Worker)
    }

    /// Whether a process of this role can apply mutations before any snapshot.
    pub fn starts_ready(self) -> bool {
        self.is_worker()
    }
}

impl std::fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ProcessRole::Worker => "worker",
            ProcessRole::Renderer => "renderer",
            ProcessRole::WebviewHost => "webview",
        };
        f.write_str(name)
    }
}
