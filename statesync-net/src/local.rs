//! In-process transport.
//!
//! `LocalNetwork` is a shared switchboard of endpoints; each process gets a
//! `LocalBus` handle plus its `Inbox`. Envelopes are serialized on send, so
//! receivers see a value copy exactly like they would over a real link.
//! Used by the tests and by the CLI demo.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crossbeam_channel::Sender;
use log::{info, warn};

use statesync_types::ProcessId;

use crate::bus::{Inbox, MutationBus, ProcessRegistry};
use crate::error::{SyncError, SyncResult};
use crate::protocol::Envelope;

#[derive(Default)]
struct Switchboard {
    endpoints: BTreeMap<ProcessId, Sender<Vec<u8>>>,
    main: Option<ProcessId>,
}

/// Shared set of in-process endpoints.
#[derive(Clone, Default)]
pub struct LocalNetwork {
    inner: Arc<Mutex<Switchboard>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a process. Re-connecting an id replaces its old inbox.
    pub fn connect(&self, id: ProcessId) -> (LocalBus, Inbox) {
        let (tx, inbox) = Inbox::channel();
        let mut board = self.lock();
        if board.endpoints.insert(id, tx).is_some() {
            warn!("Endpoint {} reconnected, old inbox dropped", id);
        }
        if board.main.is_none() {
            board.main = Some(id);
        }
        info!("Endpoint {} attached ({} total)", id, board.endpoints.len());
        (
            LocalBus {
                id,
                network: self.clone(),
            },
            inbox,
        )
    }

    /// Detach a process; later sends to it fail with `TransportUnavailable`.
    pub fn disconnect(&self, id: ProcessId) {
        let mut board = self.lock();
        board.endpoints.remove(&id);
        if board.main == Some(id) {
            board.main = board.endpoints.keys().next().copied();
        }
    }

    /// Override which process stands in as the main process.
    pub fn set_main_process(&self, id: ProcessId) {
        self.lock().main = Some(id);
    }

    pub fn endpoint_count(&self) -> usize {
        self.lock().endpoints.len()
    }

    fn lock(&self) -> MutexGuard<'_, Switchboard> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// One process's sending handle onto a `LocalNetwork`.
#[derive(Clone)]
pub struct LocalBus {
    id: ProcessId,
    network: LocalNetwork,
}

impl LocalBus {
    pub fn id(&self) -> ProcessId {
        self.id
    }

    pub fn network(&self) -> &LocalNetwork {
        &self.network
    }

    fn deliver(&self, to: ProcessId, frame: Vec<u8>) -> SyncResult {
        let mut board = self.network.lock();
        let Some(tx) = board.endpoints.get(&to) else {
            return Err(SyncError::TransportUnavailable(to));
        };
        if tx.send(frame).is_err() {
            // Inbox dropped: the process is gone.
            board.endpoints.remove(&to);
            return Err(SyncError::TransportUnavailable(to));
        }
        Ok(())
    }
}

impl ProcessRegistry for LocalBus {
    fn contains(&self, id: ProcessId) -> bool {
        self.network.lock().endpoints.contains_key(&id)
    }

    fn main_process(&self) -> Option<ProcessId> {
        self.network.lock().main
    }
}

impl MutationBus for LocalBus {
    fn send(&mut self, to: ProcessId, envelope: &Envelope) -> SyncResult {
        let frame = envelope.encode()?;
        self.deliver(to, frame)
    }

    fn broadcast(&mut self, envelope: &Envelope) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode broadcast from {}: {}", self.id, e);
                return 0;
            }
        };
        let targets: Vec<ProcessId> = self
            .network
            .lock()
            .endpoints
            .keys()
            .copied()
            .filter(|id| *id != self.id)
            .collect();

        let mut delivered = 0;
        for to in targets {
            match self.deliver(to, frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => warn!("Broadcast from {} skipped: {}", self.id, e),
            }
        }
        delivered
    }
}
