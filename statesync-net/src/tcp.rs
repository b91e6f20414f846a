//! TCP transport for running processes as separate OS processes.
//!
//! The Worker binds a `TcpHub`; each Renderer connects with a `TcpLink`.
//! Background reader threads only forward raw frames into the process's
//! inbox; all protocol handling stays on the process loop.

use std::collections::HashMap;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;

use crossbeam_channel::Sender;
use log::{error, info, warn};
use serde::Deserialize;

use statesync_types::ProcessId;

use crate::bus::{Inbox, MutationBus, ProcessRegistry};
use crate::error::{SyncError, SyncResult};
use crate::framing::{read_frame, write_frame};
use crate::protocol::{BusMessage, Envelope};

/// Just enough of an envelope to learn who is on the other end.
#[derive(Deserialize)]
struct EnvelopeHeader {
    from: ProcessId,
}

#[derive(Default)]
struct Connections {
    writers: HashMap<ProcessId, BufWriter<TcpStream>>,
    /// First process to connect; stands in as the main process.
    main: Option<ProcessId>,
}

type SharedConnections = Arc<Mutex<Connections>>;

fn lock(connections: &SharedConnections) -> MutexGuard<'_, Connections> {
    connections.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Worker side: accepts Renderer connections.
pub struct TcpHub {
    id: ProcessId,
    listener: TcpListener,
    connections: SharedConnections,
    inbox_tx: Sender<Vec<u8>>,
    max_frame_bytes: usize,
}

impl TcpHub {
    /// Bind the hub. `id` is the Worker's process id.
    pub fn bind(id: ProcessId, addr: &str, max_frame_bytes: usize) -> SyncResult<(Self, Inbox)> {
        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        let (inbox_tx, inbox) = Inbox::channel();

        info!("TcpHub {} listening on {}", id, listener.local_addr()?);

        Ok((
            Self {
                id,
                listener,
                connections: SharedConnections::default(),
                inbox_tx,
                max_frame_bytes,
            },
            inbox,
        ))
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.connections).writers.len()
    }

    /// Accept any pending connections. A connection is bound to a process
    /// id by the first frame it sends.
    pub fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, addr)) => {
                    info!("Connection from {}", addr);
                    if let Err(e) = self.spawn_reader(stream) {
                        error!("Failed to set up connection from {}: {}", addr, e);
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    fn spawn_reader(&self, stream: TcpStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        let writer = stream.try_clone()?;
        let connections = Arc::clone(&self.connections);
        let inbox_tx = self.inbox_tx.clone();
        let hub = self.id;
        let max_frame_bytes = self.max_frame_bytes;
        thread::spawn(move || {
            hub_reader_thread(hub, stream, writer, connections, inbox_tx, max_frame_bytes);
        });
        Ok(())
    }
}

impl ProcessRegistry for TcpHub {
    fn contains(&self, id: ProcessId) -> bool {
        lock(&self.connections).writers.contains_key(&id)
    }

    fn main_process(&self) -> Option<ProcessId> {
        lock(&self.connections).main
    }
}

impl MutationBus for TcpHub {
    fn send(&mut self, to: ProcessId, envelope: &Envelope) -> SyncResult {
        let frame = envelope.encode()?;
        let mut connections = lock(&self.connections);
        let Some(writer) = connections.writers.get_mut(&to) else {
            return Err(SyncError::TransportUnavailable(to));
        };
        if let Err(e) = write_frame(writer, &frame) {
            warn!("Write to {} failed: {}", to, e);
            connections.writers.remove(&to);
            return Err(SyncError::TransportUnavailable(to));
        }
        Ok(())
    }

    fn broadcast(&mut self, envelope: &Envelope) -> usize {
        let frame = match envelope.encode() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to encode broadcast: {}", e);
                return 0;
            }
        };

        let mut connections = lock(&self.connections);
        let mut disconnected = Vec::new();
        let mut delivered = 0;
        for (id, writer) in connections.writers.iter_mut() {
            if *id == self.id {
                continue;
            }
            match write_frame(writer, &frame) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Failed to send to {}: {}", id, e);
                    disconnected.push(*id);
                }
            }
        }
        for id in disconnected {
            connections.writers.remove(&id);
        }
        delivered
    }

    fn poll_transport(&mut self) {
        self.accept_connections();
    }
}

/// Reads frames from one Renderer and forwards them to the hub's inbox.
fn hub_reader_thread(
    hub: ProcessId,
    stream: TcpStream,
    writer: TcpStream,
    connections: SharedConnections,
    inbox_tx: Sender<Vec<u8>>,
    max_frame_bytes: usize,
) {
    let mut reader = BufReader::new(stream);
    let mut writer = Some(BufWriter::new(writer));
    let mut peer: Option<ProcessId> = None;

    loop {
        match read_frame(&mut reader, max_frame_bytes) {
            Ok(frame) => {
                // Bind before forwarding so a reply to this very frame finds
                // its writer.
                if let Some(w) = writer.take() {
                    match serde_json::from_slice::<EnvelopeHeader>(&frame) {
                        Ok(header) => {
                            let mut c = lock(&connections);
                            c.writers.insert(header.from, w);
                            c.main.get_or_insert(header.from);
                            peer = Some(header.from);
                            info!("Connection bound to {}", header.from);
                        }
                        Err(_) => writer = Some(w),
                    }
                }
                if inbox_tx.send(frame).is_err() {
                    // Hub dropped
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    warn!("Read error from {:?}: {}", peer, e);
                }
                break;
            }
        }
    }

    if let Some(id) = peer {
        {
            let mut c = lock(&connections);
            c.writers.remove(&id);
            if c.main == Some(id) {
                c.main = c.writers.keys().next().copied();
            }
        }
        // Implicit unregister on disconnect
        let goodbye = Envelope::new(id, BusMessage::Unregister { process_id: id });
        if let Ok(frame) = goodbye.encode() {
            let _ = inbox_tx.send(frame);
        }
    }
    info!("Reader for {:?} on hub {} exiting", peer, hub);
}

/// Renderer side: a single connection to the Worker's hub.
pub struct TcpLink {
    id: ProcessId,
    worker: ProcessId,
    writer: Option<BufWriter<TcpStream>>,
}

impl TcpLink {
    pub fn connect(
        id: ProcessId,
        worker: ProcessId,
        addr: &str,
        max_frame_bytes: usize,
    ) -> SyncResult<(Self, Inbox)> {
        info!("Connecting {} to worker {} at {}", id, worker, addr);

        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let read_stream = stream.try_clone()?;
        let (inbox_tx, inbox) = Inbox::channel();

        thread::spawn(move || {
            link_reader_thread(id, read_stream, inbox_tx, max_frame_bytes);
        });

        Ok((
            Self {
                id,
                worker,
                writer: Some(BufWriter::new(stream)),
            },
            inbox,
        ))
    }

    pub fn is_connected(&self) -> bool {
        self.writer.is_some()
    }
}

impl ProcessRegistry for TcpLink {
    fn contains(&self, id: ProcessId) -> bool {
        id == self.worker && self.writer.is_some()
    }

    fn main_process(&self) -> Option<ProcessId> {
        Some(self.worker)
    }
}

impl MutationBus for TcpLink {
    fn send(&mut self, to: ProcessId, envelope: &Envelope) -> SyncResult {
        if to != self.worker {
            return Err(SyncError::TransportUnavailable(to));
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(SyncError::TransportUnavailable(to));
        };
        let frame = envelope.encode()?;
        if let Err(e) = write_frame(writer, &frame) {
            warn!("{} lost its link to {}: {}", self.id, to, e);
            self.writer = None;
            return Err(SyncError::TransportUnavailable(to));
        }
        Ok(())
    }

    fn broadcast(&mut self, envelope: &Envelope) -> usize {
        let worker = self.worker;
        usize::from(self.send(worker, envelope).is_ok())
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        // The reader thread holds a clone of the socket; shut it down so the
        // hub sees the disconnect.
        if let Some(writer) = self.writer.as_mut() {
            let _ = writer.flush();
            let _ = writer.get_ref().shutdown(Shutdown::Both);
        }
    }
}

fn link_reader_thread(
    id: ProcessId,
    stream: TcpStream,
    inbox_tx: Sender<Vec<u8>>,
    max_frame_bytes: usize,
) {
    let mut reader = BufReader::new(stream);
    loop {
        match read_frame(&mut reader, max_frame_bytes) {
            Ok(frame) => {
                if inbox_tx.send(frame).is_err() {
                    break;
                }
            }
            Err(e) => {
                if e.kind() != io::ErrorKind::UnexpectedEof {
                    error!("{} read error: {}", id, e);
                }
                break;
            }
        }
    }
    info!("{} link reader exiting", id);
}
