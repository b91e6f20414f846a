//! Multi-process state synchronization for statesync.
//!
//! One Worker process holds the canonical state tree; Renderer processes and
//! embedded webviews hold replicas kept in step by batched mutation streams
//! and bootstrapped with full snapshots.

pub mod batcher;
pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod framing;
pub mod local;
pub mod process_loop;
pub mod protocol;
mod snapshot;
pub mod tcp;

pub use batcher::MutationBatcher;
pub use bus::{Inbox, MutationBus, ProcessRegistry};
pub use config::SyncConfig;
pub use coordinator::{SyncCoordinator, SyncState, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use local::{LocalBus, LocalNetwork};
pub use process_loop::ProcessLoop;
pub use protocol::{BusMessage, Channel, Envelope, SnapshotRequest, SnapshotResponse};
pub use tcp::{TcpHub, TcpLink};
