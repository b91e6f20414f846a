//! Per-process sync coordinator.
//!
//! Owns the local replica, the outbound batcher, the mutation id counter and
//! the readiness state machine. Topology is a hub: Renderers and webviews
//! forward their local commits to the Worker, and the Worker re-broadcasts
//! every mutation it accepts to every peer, author included. The Worker's
//! apply order is the canonical order; other replicas rebase their pending
//! commits onto it.

use std::collections::{BTreeSet, HashMap};
use std::time::{Duration, Instant};

use log::{debug, info, warn};
use serde_json::Value;

use statesync_types::{
    Mutation, MutationCounter, MutationId, ProcessId, ProcessRole, StateReplica, SubscriptionId,
};

use crate::batcher::MutationBatcher;
use crate::bus::MutationBus;
use crate::config::SyncConfig;
use crate::error::{SyncError, SyncResult};
use crate::protocol::{BusMessage, Envelope};

/// Readiness of the local replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// No snapshot yet; inbound mutation batches are dropped.
    AwaitingSnapshot,
    Ready,
}

/// What the UI should show about this process's view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Synced,
    /// Snapshot requested, still within the timeout.
    Syncing,
    /// Snapshot request timed out; retrying.
    NotYetSynced,
}

pub struct SyncCoordinator<B: MutationBus> {
    pub(crate) id: ProcessId,
    pub(crate) role: ProcessRole,
    pub(crate) worker: ProcessId,
    /// Renderer hosting this webview.
    pub(crate) host: Option<ProcessId>,
    /// Webview embedded in this Renderer.
    pub(crate) webview: Option<ProcessId>,
    pub(crate) state: SyncState,
    pub(crate) replica: StateReplica,
    pub(crate) bus: B,
    pub(crate) batcher: MutationBatcher,
    pub(crate) ids: MutationCounter,
    /// Registered Renderers (Worker only).
    pub(crate) peers: BTreeSet<ProcessId>,
    /// Newest author-local id arbitrated per author (Worker only).
    pub(crate) last_seen: HashMap<ProcessId, MutationId>,
    pub(crate) snapshot_timeout: Duration,
    pub(crate) snapshot_deadline: Option<Instant>,
    pub(crate) timed_out: bool,
}

impl<B: MutationBus> SyncCoordinator<B> {
    fn with_role(
        role: ProcessRole,
        worker: ProcessId,
        replica: StateReplica,
        bus: B,
        config: &SyncConfig,
    ) -> Self {
        let state = if role.starts_ready() {
            SyncState::Ready
        } else {
            SyncState::AwaitingSnapshot
        };
        Self {
            id: replica.owner(),
            role,
            worker,
            host: None,
            webview: None,
            state,
            replica,
            bus,
            batcher: MutationBatcher::new(config.flush_delay),
            ids: MutationCounter::new(),
            peers: BTreeSet::new(),
            last_seen: HashMap::new(),
            snapshot_timeout: config.snapshot_timeout,
            snapshot_deadline: None,
            timed_out: false,
        }
    }

    /// The Worker: its replica is canonical, so it starts `Ready`.
    pub fn worker(replica: StateReplica, bus: B, config: &SyncConfig) -> Self {
        let id = replica.owner();
        Self::with_role(ProcessRole::Worker, id, replica, bus, config)
    }

    pub fn renderer(replica: StateReplica, worker: ProcessId, bus: B, config: &SyncConfig) -> Self {
        Self::with_role(ProcessRole::Renderer, worker, replica, bus, config)
    }

    /// An embedded webview. Snapshots reach it through `host`.
    pub fn webview(
        replica: StateReplica,
        host: ProcessId,
        worker: ProcessId,
        bus: B,
        config: &SyncConfig,
    ) -> Self {
        let mut coordinator = Self::with_role(ProcessRole::WebviewHost, worker, replica, bus, config);
        coordinator.host = Some(host);
        coordinator
    }

    /// Make this Renderer relay snapshots and batches to an embedded webview.
    pub fn hosting(mut self, webview: ProcessId) -> Self {
        self.webview = Some(webview);
        self
    }

    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn role(&self) -> ProcessRole {
        self.role
    }

    pub fn sync_state(&self) -> SyncState {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == SyncState::Ready
    }

    pub fn status(&self) -> SyncStatus {
        match self.state {
            SyncState::Ready => SyncStatus::Synced,
            SyncState::AwaitingSnapshot if self.timed_out => SyncStatus::NotYetSynced,
            SyncState::AwaitingSnapshot => SyncStatus::Syncing,
        }
    }

    pub fn replica(&self) -> &StateReplica {
        &self.replica
    }

    /// Observe every mutation applied to the local replica.
    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Mutation) + Send + 'static,
    {
        self.replica.subscribe(callback)
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.replica.unsubscribe(id)
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    pub fn batcher(&self) -> &MutationBatcher {
        &self.batcher
    }

    /// Renderers registered with this Worker.
    pub fn peers(&self) -> impl Iterator<Item = ProcessId> + '_ {
        self.peers.iter().copied()
    }

    /// Announce this process. Renderers register with the Worker, webviews
    /// ask their host for a relayed snapshot; the Worker has nothing to do.
    pub fn start(&mut self, now: Instant) {
        match self.role {
            ProcessRole::Worker => info!("{} worker ready", self.id),
            ProcessRole::Renderer | ProcessRole::WebviewHost => self.announce(now),
        }
    }

    /// Commit a local mutation.
    ///
    /// Applied optimistically, then queued for the Worker; the Worker's
    /// echo settles its final position. Refused with `NotSynced` until the
    /// first snapshot has been applied. Returns the id the mutation was sent
    /// under.
    pub fn commit(&mut self, kind: &str, payload: Value) -> SyncResult<MutationId> {
        let now = Instant::now();
        if self.role.is_worker() {
            let mutation = self.replica.commit(kind, payload)?;
            return Ok(self.broadcast_accepted(mutation, now));
        }
        if self.state == SyncState::AwaitingSnapshot {
            return Err(SyncError::NotSynced);
        }
        let id = self.ids.next_id();
        let mutation = self.replica.commit_pending(kind, payload, id)?;
        self.batcher.enqueue(self.worker, &mutation, now);
        Ok(id)
    }

    /// Worker side: stamp an accepted mutation with a fresh Worker id and
    /// queue it for every registered peer. The author gets it too, as the
    /// acknowledgement that fixes its place in the canonical order.
    fn broadcast_accepted(&mut self, mutation: Mutation, now: Instant) -> MutationId {
        let mutation = mutation.stamped(self.ids.next_id()).as_origin();
        for peer in &self.peers {
            self.batcher.enqueue(*peer, &mutation, now);
        }
        mutation.id
    }

    /// Dispatch one inbound delivery by channel.
    pub fn handle_delivery(&mut self, envelope: Envelope) {
        let from = envelope.from;
        debug!("{} <- {} on {}", self.id, from, envelope.channel());
        match envelope.message {
            BusMessage::Register { process_id } => self.on_register(process_id),
            BusMessage::Unregister { process_id } => self.on_unregister(process_id),
            BusMessage::RequestSnapshot(request) => self.on_request_snapshot(from, request),
            BusMessage::Snapshot(response) => self.on_snapshot(from, response),
            BusMessage::MutationBatch(batch) => self.on_mutation_batch(from, batch),
            BusMessage::Shutdown => self.on_shutdown(from),
        }
    }

    fn on_mutation_batch(&mut self, from: ProcessId, batch: Vec<Mutation>) {
        if self.role.is_worker() {
            self.arbitrate(from, batch);
            return;
        }
        if self.state == SyncState::AwaitingSnapshot {
            debug!("{}: dropping {} entries: {}", self.id, batch.len(), SyncError::OutOfOrderApply { from });
            return;
        }

        let refused = self.replica.apply_canonical(&batch);
        for e in &refused {
            warn!("{} could not apply a mutation from {}: {}", self.id, from, e);
        }
        let stale = !refused.is_empty();

        if let Some(webview) = self.webview {
            self.send_or_log(webview, BusMessage::MutationBatch(batch));
        }
        if stale {
            self.request_snapshot(Instant::now());
        }
    }

    /// Worker side: apply relayed mutations in arrival order. A refused
    /// mutation is not rolled back piecemeal; its author gets a fresh
    /// snapshot that overwrites the optimistic view.
    fn arbitrate(&mut self, from: ProcessId, batch: Vec<Mutation>) {
        let now = Instant::now();
        let mut refused_authors = BTreeSet::new();

        for mutation in batch {
            let mutation = mutation.as_origin();
            let seen = self.last_seen.entry(mutation.author).or_default();
            *seen = (*seen).max(mutation.local_id);
            if let Err(e) = self.replica.apply(&mutation) {
                warn!(
                    "Worker refused {} {} from {}: {}",
                    mutation.kind, mutation.id, mutation.author, e
                );
                refused_authors.insert(mutation.author);
                continue;
            }
            self.broadcast_accepted(mutation, now);
        }

        for author in refused_authors {
            let target = if self.bus.contains(author) { author } else { from };
            self.serve_snapshot(target, target != author, author);
        }
    }

    fn on_shutdown(&mut self, from: ProcessId) {
        let upstream = from == self.worker || Some(from) == self.host;
        if !upstream || self.role.is_worker() {
            warn!("{} ignoring shutdown from {}", self.id, from);
            return;
        }
        info!("{}: worker {} shut down, view is now stale", self.id, from);
        self.state = SyncState::AwaitingSnapshot;
        self.snapshot_deadline = None;
        self.timed_out = true;
        if let Some(webview) = self.webview {
            self.send_or_log(webview, BusMessage::Shutdown);
        }
    }

    /// Run deferred work that is due: the batch flush and the snapshot timeout.
    pub fn tick(&mut self, now: Instant) {
        if self.batcher.is_due(now) {
            self.flush();
        }
        self.check_snapshot_timeout(now);
    }

    /// Earliest instant `tick` has work to do.
    pub fn next_deadline(&self) -> Option<Instant> {
        let snapshot = match self.state {
            SyncState::AwaitingSnapshot => self.snapshot_deadline,
            SyncState::Ready => None,
        };
        match (self.batcher.flush_at(), snapshot) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Send every queued batch now. Unreachable Renderers are dropped from
    /// the Worker's membership.
    pub fn flush(&mut self) {
        let unreachable = self.batcher.flush(self.id, &mut self.bus);
        for peer in unreachable {
            self.forget_peer(peer);
        }
    }

    /// Leave the topology. The Worker tells everyone it is going away;
    /// other processes unregister from the Worker.
    pub fn shutdown(&mut self) {
        self.flush();
        if self.role.is_worker() {
            let reached = self.bus.broadcast(&Envelope::new(self.id, BusMessage::Shutdown));
            info!("Worker {} shut down, notified {} processes", self.id, reached);
            self.peers.clear();
            self.last_seen.clear();
        } else {
            self.send_or_log(self.worker, BusMessage::Unregister { process_id: self.id });
        }
    }

    pub(crate) fn forget_peer(&mut self, peer: ProcessId) {
        self.last_seen.remove(&peer);
        if self.peers.remove(&peer) {
            let dropped = self.batcher.discard(peer);
            info!("{} dropped peer {} ({} queued mutations discarded)", self.id, peer, dropped);
        }
    }

    /// Best-effort send: failures are logged and dropped.
    pub(crate) fn send_or_log(&mut self, to: ProcessId, message: BusMessage) -> bool {
        let channel = message.channel();
        match self.bus.send(to, &Envelope::new(self.id, message)) {
            Ok(()) => true,
            Err(e) => {
                warn!("{} could not send {} to {}: {}", self.id, channel, to, e);
                false
            }
        }
    }
}
