//! Error taxonomy for the sync layer.
//!
//! None of these reach the end user. Transport and decode failures are
//! logged and dropped inside the coordinator; the worst outcome is a
//! temporarily stale replica that the next snapshot overwrites.

use statesync_types::{ProcessId, ReduceError};
use thiserror::Error;

pub type SyncResult<T = ()> = Result<T, SyncError>;

#[derive(Debug, Error)]
pub enum SyncError {
    /// Destination is gone. Log and drop, no retry.
    #[error("process {0} is not reachable")]
    TransportUnavailable(ProcessId),

    /// A mutation batch arrived before the first snapshot.
    #[error("mutation batch from {from} arrived before the first snapshot")]
    OutOfOrderApply { from: ProcessId },

    #[error("malformed payload: {0}")]
    MalformedPayload(#[from] serde_json::Error),

    /// Benign; the snapshot is served again.
    #[error("process {0} asked for a snapshot it was already served")]
    DuplicateSnapshotRequest(ProcessId),

    /// Local commit refused while still awaiting the first snapshot.
    #[error("replica has not received its first snapshot yet")]
    NotSynced,

    #[error(transparent)]
    Reduce(#[from] ReduceError),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Whether this error only means "this view is temporarily stale".
    pub fn is_soft(&self) -> bool {
        matches!(
            self,
            SyncError::TransportUnavailable(_)
                | SyncError::OutOfOrderApply { .. }
                | SyncError::DuplicateSnapshotRequest(_)
                | SyncError::NotSynced
        )
    }
}
