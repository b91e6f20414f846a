#![allow(dead_code)]
//! Test harness utilities for statesync-net integration tests.

use std::time::{Duration, Instant};

use serde_json::{json, Value};

use statesync_net::{
    Inbox, LocalBus, LocalNetwork, MutationBus, ProcessLoop, SyncConfig, SyncCoordinator,
};
use statesync_types::{ProcessId, StateReplica};

pub const WORKER: u64 = 1;

/// Replica with the `counter` and `todos` modules and their reducers.
pub fn demo_replica(id: u64) -> StateReplica {
    let mut replica = StateReplica::new(ProcessId::new(id));
    replica.insert_module("counter", json!({"value": 0}));
    replica.insert_module("todos", json!([]));

    replica.register("counter", "counter/increment", |state, payload| {
        let by = payload.get("by").and_then(Value::as_i64).unwrap_or(1);
        let value = state["value"].as_i64().unwrap_or(0);
        state["value"] = json!(value + by);
        Ok(())
    });
    replica.register("todos", "todos/add", |state, payload| {
        let text = payload["text"].as_str().ok_or("todo needs text")?;
        state
            .as_array_mut()
            .ok_or("todos is not a list")?
            .push(json!(text));
        Ok(())
    });
    replica
}

pub fn config() -> SyncConfig {
    SyncConfig {
        snapshot_timeout: Duration::from_millis(200),
        ..SyncConfig::default()
    }
}

pub fn worker(net: &LocalNetwork) -> ProcessLoop<LocalBus> {
    let (bus, inbox) = net.connect(ProcessId::new(WORKER));
    let coordinator = SyncCoordinator::worker(demo_replica(WORKER), bus, &config());
    ProcessLoop::new(coordinator, inbox)
}

pub fn renderer(net: &LocalNetwork, id: u64) -> ProcessLoop<LocalBus> {
    renderer_with(net, demo_replica(id))
}

/// Renderer over a caller-built replica, e.g. one with extra reducers.
pub fn renderer_with(net: &LocalNetwork, replica: StateReplica) -> ProcessLoop<LocalBus> {
    let (bus, inbox) = net.connect(replica.owner());
    let coordinator = SyncCoordinator::renderer(replica, ProcessId::new(WORKER), bus, &config());
    ProcessLoop::new(coordinator, inbox)
}

pub fn hosting_renderer(net: &LocalNetwork, id: u64, webview: u64) -> ProcessLoop<LocalBus> {
    let (bus, inbox) = net.connect(ProcessId::new(id));
    let coordinator =
        SyncCoordinator::renderer(demo_replica(id), ProcessId::new(WORKER), bus, &config())
            .hosting(ProcessId::new(webview));
    ProcessLoop::new(coordinator, inbox)
}

pub fn webview(net: &LocalNetwork, id: u64, host: u64) -> ProcessLoop<LocalBus> {
    let (bus, inbox) = net.connect(ProcessId::new(id));
    let coordinator = SyncCoordinator::webview(
        demo_replica(id),
        ProcessId::new(host),
        ProcessId::new(WORKER),
        bus,
        &config(),
    );
    ProcessLoop::new(coordinator, inbox)
}

/// Run turns on every process until two rounds in a row handle nothing and
/// leave no flush scheduled. One quiet round is not enough: the ticks in it
/// may have flushed batches nobody has read yet.
pub fn settle<B: MutationBus>(processes: &mut [&mut ProcessLoop<B>]) {
    let mut quiet_rounds = 0;
    for _ in 0..200 {
        let mut handled = 0;
        for process in processes.iter_mut() {
            handled += process.turn(Instant::now());
        }
        let pending = processes
            .iter()
            .any(|p| p.coordinator().batcher().is_scheduled());
        if handled == 0 && !pending {
            quiet_rounds += 1;
            if quiet_rounds == 2 {
                return;
            }
        } else {
            quiet_rounds = 0;
        }
    }
    panic!("processes did not settle");
}

/// Drive `processes` until `done` holds, or panic after `timeout`.
pub fn drive_until<B: MutationBus, F>(
    processes: &mut [&mut ProcessLoop<B>],
    timeout: Duration,
    mut done: F,
) where
    F: FnMut(&[&mut ProcessLoop<B>]) -> bool,
{
    let start = Instant::now();
    while start.elapsed() < timeout {
        for process in processes.iter_mut() {
            process.turn(Instant::now());
        }
        if done(processes) {
            return;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    panic!("Timed out after {:?}", timeout);
}

pub fn counter<B: MutationBus>(process: &ProcessLoop<B>) -> i64 {
    process.coordinator().replica().state().module("counter").unwrap()["value"]
        .as_i64()
        .unwrap()
}

/// A bare endpoint that records what it is sent.
pub struct RawEndpoint {
    pub bus: LocalBus,
    pub inbox: Inbox,
}

impl RawEndpoint {
    pub fn connect(net: &LocalNetwork, id: u64) -> Self {
        let (bus, inbox) = net.connect(ProcessId::new(id));
        Self { bus, inbox }
    }

    pub fn drain(&mut self) -> Vec<statesync_net::Envelope> {
        std::iter::from_fn(|| self.inbox.try_next())
            .map(|d| d.expect("raw endpoint received a malformed frame"))
            .collect()
    }
}

pub fn todos<B: MutationBus>(process: &ProcessLoop<B>) -> Value {
    process.coordinator().replica().state().module("todos").cloned().unwrap()
}
