//! Wire protocol types for statesync.
//!
//! Every transport carries the same JSON `Envelope`: the sending process
//! plus a message tagged by its logical channel name.

use serde::{Deserialize, Serialize};

use statesync_types::{Mutation, MutationId, ProcessId};

use crate::error::SyncResult;

/// Logical IPC channel a message travels on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Channel {
    Register,
    Unregister,
    RequestSnapshot,
    Snapshot,
    MutationBatch,
    Shutdown,
}

impl Channel {
    pub fn name(self) -> &'static str {
        match self {
            Channel::Register => "register",
            Channel::Unregister => "unregister",
            Channel::RequestSnapshot => "requestSnapshot",
            Channel::Snapshot => "snapshot",
            Channel::MutationBatch => "mutationBatch",
            Channel::Shutdown => "shutdown",
        }
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRequest {
    pub process_id: ProcessId,
    pub forward_to_webview: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotResponse {
    /// Serialized `StateTree`. Relays pass it on without parsing.
    pub state: String,
    pub forward_to_webview: bool,
    /// Newest local id of the requester already folded into `state`.
    #[serde(default)]
    pub acknowledged: MutationId,
}

/// A message on one of the logical channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "channel",
    content = "payload",
    rename_all = "camelCase",
    rename_all_fields = "camelCase"
)]
pub enum BusMessage {
    /// A Renderer joining; the Worker answers with a snapshot.
    Register { process_id: ProcessId },
    /// A Renderer leaving.
    Unregister { process_id: ProcessId },
    RequestSnapshot(SnapshotRequest),
    Snapshot(SnapshotResponse),
    /// Ordered mutations from one sender's flush.
    MutationBatch(Vec<Mutation>),
    /// The Worker is going away.
    Shutdown,
}

impl BusMessage {
    pub fn channel(&self) -> Channel {
        match self {
            BusMessage::Register { .. } => Channel::Register,
            BusMessage::Unregister { .. } => Channel::Unregister,
            BusMessage::RequestSnapshot(_) => Channel::RequestSnapshot,
            BusMessage::Snapshot(_) => Channel::Snapshot,
            BusMessage::MutationBatch(_) => Channel::MutationBatch,
            BusMessage::Shutdown => Channel::Shutdown,
        }
    }
}

/// A message together with the process that sent it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub from: ProcessId,
    pub message: BusMessage,
}

impl Envelope {
    pub fn new(from: ProcessId, message: BusMessage) -> Self {
        Self { from, message }
    }

    pub fn channel(&self) -> Channel {
        self.message.channel()
    }

    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}
