//! Bulk snapshot flow: registration, snapshot requests and relays.
//!
//! A joining Renderer registers with the Worker and receives a full
//! snapshot; an embedded webview asks its hosting Renderer, which forwards
//! the request and relays the answer untouched. The Worker always drains
//! its outbound queues before serializing, so no queued mutation can land
//! on top of a snapshot that already contains it. Each snapshot also names
//! the newest commit of its subject it contains, so the subject replays
//! only the pending commits after that one.

use std::time::Instant;

use log::{debug, info, warn};

use statesync_types::{MutationId, ProcessId, ProcessRole, StateTree};

use crate::bus::MutationBus;
use crate::coordinator::{SyncCoordinator, SyncState};
use crate::error::SyncError;
use crate::protocol::{BusMessage, SnapshotRequest, SnapshotResponse};

impl<B: MutationBus> SyncCoordinator<B> {
    pub(crate) fn on_register(&mut self, process_id: ProcessId) {
        if !self.role.is_worker() {
            warn!("{} is not the worker, ignoring register from {}", self.id, process_id);
            return;
        }
        if self.peers.insert(process_id) {
            info!("Renderer {} registered ({} peers)", process_id, self.peers.len());
        } else {
            debug!("{}", SyncError::DuplicateSnapshotRequest(process_id));
        }
        self.serve_snapshot(process_id, false, process_id);
    }

    /// Covers webviews too: they never register but still leave an entry
    /// in `last_seen` once they commit.
    pub(crate) fn on_unregister(&mut self, process_id: ProcessId) {
        if self.role.is_worker() {
            self.forget_peer(process_id);
            debug!("{} unregistered", process_id);
        }
    }

    pub(crate) fn on_request_snapshot(&mut self, from: ProcessId, request: SnapshotRequest) {
        if !self.role.is_worker() {
            self.relay_request(from, request);
            return;
        }

        let known = self.peers.contains(&request.process_id) || self.bus.contains(request.process_id);
        if !request.forward_to_webview && known {
            if self.peers.contains(&request.process_id) {
                debug!("{}", SyncError::DuplicateSnapshotRequest(request.process_id));
            }
            self.serve_snapshot(request.process_id, false, request.process_id);
            return;
        }

        // Relayed request (or unknown requester): answer whoever relayed it,
        // falling back to the main process.
        let target = if self.bus.contains(from) && from != self.id {
            Some(from)
        } else {
            self.bus.main_process().filter(|main| *main != self.id)
        };
        match target {
            Some(target) => self.serve_snapshot(target, true, request.process_id),
            None => warn!(
                "No route back to {} for its snapshot request",
                request.process_id
            ),
        }
    }

    /// A Renderer forwarding its webview's request to the Worker.
    fn relay_request(&mut self, from: ProcessId, request: SnapshotRequest) {
        if self.role != ProcessRole::Renderer || self.webview != Some(from) {
            warn!("{} dropping snapshot request from {}", self.id, from);
            return;
        }
        debug!("{} relaying snapshot request for webview {}", self.id, from);
        self.send_or_log(
            self.worker,
            BusMessage::RequestSnapshot(SnapshotRequest {
                process_id: request.process_id,
                forward_to_webview: true,
            }),
        );
    }

    /// Flush pending batches, then send the full tree to `to`. `subject` is
    /// the process the snapshot is for; it differs from `to` when relayed.
    pub(crate) fn serve_snapshot(&mut self, to: ProcessId, forward_to_webview: bool, subject: ProcessId) {
        self.flush();

        let state = match self.replica.to_json() {
            Ok(state) => state,
            Err(e) => {
                warn!("Could not serialize snapshot for {}: {}", to, e);
                return;
            }
        };
        let bytes = state.len();
        let response = SnapshotResponse {
            state,
            forward_to_webview,
            acknowledged: self.last_seen.get(&subject).copied().unwrap_or(MutationId::UNSTAMPED),
        };
        if self.send_or_log(to, BusMessage::Snapshot(response)) {
            info!("Served {} byte snapshot to {} (relay={})", bytes, to, forward_to_webview);
        } else {
            self.forget_peer(to);
        }
    }

    pub(crate) fn on_snapshot(&mut self, from: ProcessId, response: SnapshotResponse) {
        if response.forward_to_webview {
            match self.webview {
                Some(webview) => {
                    debug!("{} relaying snapshot from {} to webview {}", self.id, from, webview);
                    self.send_or_log(
                        webview,
                        BusMessage::Snapshot(SnapshotResponse {
                            forward_to_webview: false,
                            ..response
                        }),
                    );
                }
                None => warn!("{} has no webview to relay a snapshot to", self.id),
            }
            return;
        }

        if self.role.is_worker() {
            warn!("Worker ignoring snapshot from {}", from);
            return;
        }

        let tree = match StateTree::from_json(&response.state) {
            Ok(tree) => tree,
            Err(e) => {
                warn!("{} dropping snapshot from {}: {}", self.id, from, SyncError::from(e));
                return;
            }
        };
        self.replica.load_acknowledged(tree, response.acknowledged);
        self.snapshot_deadline = None;
        self.timed_out = false;
        if self.state != SyncState::Ready {
            info!("{} {} synced ({} modules)", self.role, self.id, self.replica.state().len());
        }
        self.state = SyncState::Ready;
    }

    /// Ask for a fresh snapshot, e.g. after a remote mutation failed to apply.
    pub fn request_snapshot(&mut self, now: Instant) {
        let (to, forward_to_webview) = match (self.role, self.host) {
            (ProcessRole::Worker, _) => return,
            (ProcessRole::WebviewHost, Some(host)) => (host, true),
            _ => (self.worker, false),
        };
        self.send_or_log(
            to,
            BusMessage::RequestSnapshot(SnapshotRequest {
                process_id: self.id,
                forward_to_webview,
            }),
        );
        if self.state == SyncState::AwaitingSnapshot {
            self.snapshot_deadline = Some(now + self.snapshot_timeout);
        }
    }

    /// Initial bootstrap message, re-sent on every snapshot timeout.
    pub(crate) fn announce(&mut self, now: Instant) {
        match self.role {
            ProcessRole::Worker => {}
            ProcessRole::Renderer => {
                self.send_or_log(self.worker, BusMessage::Register { process_id: self.id });
                self.snapshot_deadline = Some(now + self.snapshot_timeout);
            }
            ProcessRole::WebviewHost => self.request_snapshot(now),
        }
    }

    pub(crate) fn check_snapshot_timeout(&mut self, now: Instant) {
        if self.state != SyncState::AwaitingSnapshot {
            return;
        }
        let Some(deadline) = self.snapshot_deadline else {
            return;
        };
        if now < deadline {
            return;
        }
        if !self.timed_out {
            warn!("{} not yet synced: no snapshot after {:?}, retrying", self.id, self.snapshot_timeout);
        }
        self.timed_out = true;
        self.announce(now);
    }
}
