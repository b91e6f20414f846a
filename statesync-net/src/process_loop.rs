//! Single-threaded event loop for one process.
//!
//! Each turn drains every delivery waiting in the inbox, then runs the
//! coordinator's deferred work. Mutations committed during a turn are
//! therefore flushed together, after the turn, never in the middle of it.

use std::time::{Duration, Instant};

use log::warn;

use crate::bus::{Inbox, MutationBus};
use crate::coordinator::SyncCoordinator;

/// Longest a blocking wait sleeps when nothing is scheduled.
const IDLE_WAIT: Duration = Duration::from_millis(50);

pub struct ProcessLoop<B: MutationBus> {
    coordinator: SyncCoordinator<B>,
    inbox: Inbox,
}

impl<B: MutationBus> ProcessLoop<B> {
    pub fn new(coordinator: SyncCoordinator<B>, inbox: Inbox) -> Self {
        Self { coordinator, inbox }
    }

    pub fn coordinator(&self) -> &SyncCoordinator<B> {
        &self.coordinator
    }

    pub fn coordinator_mut(&mut self) -> &mut SyncCoordinator<B> {
        &mut self.coordinator
    }

    pub fn into_coordinator(self) -> SyncCoordinator<B> {
        self.coordinator
    }

    /// Announce the process (register / request a snapshot).
    pub fn start(&mut self) {
        self.coordinator.start(Instant::now());
    }

    /// Run one turn at `now`. Returns the number of deliveries handled.
    pub fn turn(&mut self, now: Instant) -> usize {
        self.coordinator.bus_mut().poll_transport();

        let mut handled = 0;
        while let Some(delivery) = self.inbox.try_next() {
            match delivery {
                Ok(envelope) => self.coordinator.handle_delivery(envelope),
                Err(e) => warn!("{} dropping inbound frame: {}", self.coordinator.id(), e),
            }
            handled += 1;
        }

        self.coordinator.tick(now);
        handled
    }

    /// Block until a delivery arrives or deferred work is due, then run a turn.
    pub fn run_once(&mut self) -> usize {
        let now = Instant::now();
        let wait = self
            .coordinator
            .next_deadline()
            .map(|at| at.saturating_duration_since(now))
            .unwrap_or(IDLE_WAIT)
            .min(IDLE_WAIT);
        if !wait.is_zero() {
            self.inbox.wait(wait);
        }
        self.turn(Instant::now())
    }

    /// Keep turning until `done` returns true or every sender is gone.
    pub fn run_until<F>(&mut self, mut done: F)
    where
        F: FnMut(&mut SyncCoordinator<B>) -> bool,
    {
        while !done(&mut self.coordinator) {
            self.run_once();
            if self.inbox.is_disconnected() {
                warn!("{} inbox disconnected, stopping", self.coordinator.id());
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncConfig;
    use crate::local::LocalNetwork;
    use crate::protocol::{BusMessage, Envelope};
    use serde_json::json;
    use statesync_types::{ProcessId, StateReplica};

    fn replica(id: u64) -> StateReplica {
        let mut replica = StateReplica::new(ProcessId::new(id));
        replica.insert_module("counter", json!({"value": 0}));
        replica
    }

    #[test]
    fn turn_handles_every_waiting_delivery() {
        let net = LocalNetwork::new();
        let (bus, inbox) = net.connect(ProcessId::new(1));
        let (mut other, _other_inbox) = net.connect(ProcessId::new(2));

        let worker = SyncCoordinator::worker(replica(1), bus, &SyncConfig::default());
        let mut process = ProcessLoop::new(worker, inbox);

        for _ in 0..3 {
            other
                .send(
                    ProcessId::new(1),
                    &Envelope::new(ProcessId::new(2), BusMessage::Register { process_id: ProcessId::new(2) }),
                )
                .unwrap();
        }
        assert_eq!(process.turn(Instant::now()), 3);
        assert_eq!(process.coordinator().peers().count(), 1);
        assert_eq!(process.turn(Instant::now()), 0);
    }

    #[test]
    fn commits_between_turns_flush_as_one_batch() {
        let net = LocalNetwork::new();
        let (bus, inbox) = net.connect(ProcessId::new(1));
        let (mut renderer_bus, mut renderer_inbox) = net.connect(ProcessId::new(2));

        let mut worker_replica = replica(1);
        worker_replica.register("counter", "counter/increment", |state, _| {
            state["value"] = json!(state["value"].as_i64().unwrap_or(0) + 1);
            Ok(())
        });
        let worker = SyncCoordinator::worker(worker_replica, bus, &SyncConfig::default());
        let mut process = ProcessLoop::new(worker, inbox);

        renderer_bus
            .send(
                ProcessId::new(1),
                &Envelope::new(ProcessId::new(2), BusMessage::Register { process_id: ProcessId::new(2) }),
            )
            .unwrap();
        process.turn(Instant::now());
        assert!(matches!(
            renderer_inbox.try_next().unwrap().unwrap().message,
            BusMessage::Snapshot(_)
        ));

        for _ in 0..5 {
            process.coordinator_mut().commit("counter/increment", json!({})).unwrap();
        }
        assert!(renderer_inbox.try_next().is_none());

        process.turn(Instant::now());
        match renderer_inbox.try_next().unwrap().unwrap().message {
            BusMessage::MutationBatch(batch) => assert_eq!(batch.len(), 5),
            other => panic!("Expected MutationBatch, got {:?}", other),
        }
        assert!(renderer_inbox.try_next().is_none());
    }
}
