//! Outbound mutation batching.
//!
//! Mutations enqueued during one synchronous turn are held per destination
//! and sent as a single `mutationBatch` per destination when the deferred
//! flush fires. The first enqueue since the last flush schedules it; later
//! enqueues ride along.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use log::{debug, warn};

use statesync_types::{Mutation, ProcessId};

use crate::bus::MutationBus;
use crate::protocol::{BusMessage, Envelope};

#[derive(Debug)]
pub struct MutationBatcher {
    queues: BTreeMap<ProcessId, Vec<Mutation>>,
    flush_at: Option<Instant>,
    delay: Duration,
}

impl MutationBatcher {
    pub fn new(delay: Duration) -> Self {
        Self {
            queues: BTreeMap::new(),
            flush_at: None,
            delay,
        }
    }

    /// Queue a copy of `mutation` for `destination`.
    ///
    /// The copy is taken now, so later edits to the caller's value never
    /// reach an entry already queued. Returns true if this enqueue scheduled
    /// the next flush.
    pub fn enqueue(&mut self, destination: ProcessId, mutation: &Mutation, now: Instant) -> bool {
        self.queues
            .entry(destination)
            .or_default()
            .push(mutation.clone());

        if self.flush_at.is_some() {
            return false;
        }
        self.flush_at = Some(now + self.delay);
        true
    }

    pub fn is_scheduled(&self) -> bool {
        self.flush_at.is_some()
    }

    /// When the pending flush is due, if one is scheduled.
    pub fn flush_at(&self) -> Option<Instant> {
        self.flush_at
    }

    pub fn is_due(&self, now: Instant) -> bool {
        self.flush_at.is_some_and(|at| now >= at)
    }

    /// Entries waiting for `destination`.
    pub fn queued(&self, destination: ProcessId) -> &[Mutation] {
        self.queues.get(&destination).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Total entries waiting across all destinations.
    pub fn pending(&self) -> usize {
        self.queues.values().map(Vec::len).sum()
    }

    /// Drop everything queued for `destination`.
    pub fn discard(&mut self, destination: ProcessId) -> usize {
        self.queues.remove(&destination).map_or(0, |q| q.len())
    }

    /// Send each non-empty queue as one ordered batch and clear them.
    ///
    /// Returns the destinations that could not be reached. Their entries
    /// are dropped, not retried.
    pub fn flush<B: MutationBus>(&mut self, from: ProcessId, bus: &mut B) -> Vec<ProcessId> {
        self.flush_at = None;
        let mut unreachable = Vec::new();

        for (destination, batch) in std::mem::take(&mut self.queues) {
            if batch.is_empty() {
                continue;
            }
            let count = batch.len();
            let envelope = Envelope::new(from, BusMessage::MutationBatch(batch));
            match bus.send(destination, &envelope) {
                Ok(()) => debug!("{} flushed {} mutations to {}", from, count, destination),
                Err(e) => {
                    warn!("Dropping {} mutations for {}: {}", count, destination, e);
                    unreachable.push(destination);
                }
            }
        }

        unreachable
    }
}
