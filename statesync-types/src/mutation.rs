//! The mutation envelope exchanged between processes.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ProcessId;

/// Mutation type used when a whole snapshot replaces the local tree.
pub const BULK_LOAD_STATE: &str = "BULK_LOAD_STATE";

/// Sender-local mutation sequence number.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct MutationId(u64);

impl MutationId {
    /// Carried by a freshly committed mutation until its sender stamps it.
    pub const UNSTAMPED: MutationId = MutationId(0);

    pub fn new(id: u64) -> Self {
        Self(id)
    }
    pub fn get(self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for MutationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Hands out strictly increasing mutation ids, starting at 1.
#[derive(Debug)]
pub struct MutationCounter {
    next: u64,
}

impl MutationCounter {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> MutationId {
        let id = MutationId(self.next);
        self.next += 1;
        id
    }

    /// The id the next call to `next_id` will return.
    pub fn peek(&self) -> MutationId {
        MutationId(self.next)
    }
}

impl Default for MutationCounter {
    fn default() -> Self {
        Self::new()
    }
}

/// A named, payload-carrying state change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mutation {
    pub id: MutationId,
    /// Identifier of the reducer that applies this mutation.
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    /// Already applied upstream; never forward again.
    #[serde(default)]
    pub origin_flag: bool,
    /// Process whose local commit produced this mutation.
    pub author: ProcessId,
    /// Id the author stamped it with. Survives the Worker's restamp, so the
    /// author can match the canonical copy to its pending commit.
    #[serde(default)]
    pub local_id: MutationId,
}

impl Mutation {
    /// A mutation committed locally by `author`, not yet stamped with an id.
    pub fn local(author: ProcessId, kind: impl Into<String>, payload: Value) -> Self {
        Self {
            id: MutationId::UNSTAMPED,
            kind: kind.into(),
            payload,
            origin_flag: false,
            author,
            local_id: MutationId::UNSTAMPED,
        }
    }

    /// Set the id. The first stamp is also recorded as `local_id`.
    pub fn stamped(mut self, id: MutationId) -> Self {
        if self.local_id == MutationId::UNSTAMPED {
            self.local_id = id;
        }
        self.id = id;
        self
    }

    pub fn as_origin(mut self) -> Self {
        self.origin_flag = true;
        self
    }

    pub fn is_bulk_load(&self) -> bool {
        self.kind == BULK_LOAD_STATE
    }
}
