//! Transport seam: the `MutationBus` trait and the per-process `Inbox`.
//!
//! A bus only moves envelopes. Delivery is in order per (sender,
//! destination) pair with no ordering across senders, and best-effort: a
//! send to a dead destination fails fast with `TransportUnavailable`
//! instead of blocking.
//!
//! Inbound traffic lands in the process's `Inbox` as raw frames. The
//! process loop pulls them out and hands them to the coordinator, which
//! dispatches on `Channel`.

use std::collections::VecDeque;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TryRecvError};

use statesync_types::ProcessId;

use crate::error::SyncResult;
use crate::protocol::Envelope;

/// Lookup of live processes, provided by whatever owns process lifecycle.
pub trait ProcessRegistry {
    /// Whether `id` is currently reachable.
    fn contains(&self, id: ProcessId) -> bool;

    /// The process relayed snapshots fall back to when the requester is unknown.
    fn main_process(&self) -> Option<ProcessId>;
}

pub trait MutationBus: ProcessRegistry {
    /// Deliver to one destination.
    fn send(&mut self, to: ProcessId, envelope: &Envelope) -> SyncResult;

    /// Deliver to every reachable process except the sender.
    /// Returns how many destinations accepted the envelope.
    fn broadcast(&mut self, envelope: &Envelope) -> usize;

    /// Transport housekeeping (accepting connections), run once per loop turn.
    fn poll_transport(&mut self) {}
}

/// Receiving half of a process's endpoint.
pub struct Inbox {
    rx: Receiver<Vec<u8>>,
    stash: VecDeque<Vec<u8>>,
    disconnected: bool,
}

impl Inbox {
    /// Create an inbox and the sender that feeds it.
    pub fn channel() -> (Sender<Vec<u8>>, Inbox) {
        let (tx, rx) = crossbeam_channel::unbounded();
        (
            tx,
            Inbox {
                rx,
                stash: VecDeque::new(),
                disconnected: false,
            },
        )
    }

    /// Take the next delivery without blocking.
    ///
    /// `Some(Err(MalformedPayload))` means a frame arrived but did not
    /// decode; the caller drops it and keeps going.
    pub fn try_next(&mut self) -> Option<SyncResult<Envelope>> {
        let frame = match self.stash.pop_front() {
            Some(frame) => frame,
            None => match self.rx.try_recv() {
                Ok(frame) => frame,
                Err(TryRecvError::Empty) => return None,
                Err(TryRecvError::Disconnected) => {
                    self.disconnected = true;
                    return None;
                }
            },
        };
        Some(Envelope::decode(&frame))
    }

    /// Block for up to `timeout` until a delivery is ready.
    pub fn wait(&mut self, timeout: Duration) -> bool {
        if !self.stash.is_empty() {
            return true;
        }
        match self.rx.recv_timeout(timeout) {
            Ok(frame) => {
                self.stash.push_back(frame);
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
            Err(RecvTimeoutError::Disconnected) => {
                self.disconnected = true;
                false
            }
        }
    }

    /// Every sender feeding this inbox is gone.
    pub fn is_disconnected(&self) -> bool {
        self.disconnected
    }
}
