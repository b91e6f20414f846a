//! Per-process state replica.
//!
//! Owns the local `StateTree`, applies mutations through the reducer
//! registry, and notifies subscribers of every applied mutation, local or
//! remote. No I/O happens here; forwarding is the coordinator's job.
//!
//! A replica that is not canonical keeps its unacknowledged local commits
//! as a pending queue on top of the last confirmed tree. When the canonical
//! stream arrives the pending commits are replayed after it, so every
//! replica ends up in the canonical order.

use std::collections::VecDeque;

use log::debug;
use serde_json::Value;

use crate::{Mutation, MutationId, ProcessId, ReduceError, ReducerRegistry, StateTree, BULK_LOAD_STATE};

/// Change-notification callback.
pub type Subscriber = Box<dyn FnMut(&Mutation) + Send>;

/// Handle returned by `subscribe`, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(usize);

pub struct StateReplica {
    owner: ProcessId,
    tree: StateTree,
    /// Canonical tree under the pending commits. `Some` exactly while
    /// `pending` is non-empty.
    confirmed: Option<StateTree>,
    pending: VecDeque<Mutation>,
    reducers: ReducerRegistry,
    subscribers: Vec<(SubscriptionId, Subscriber)>,
    next_subscription: usize,
    bulk_loaded: bool,
}

impl StateReplica {
    pub fn new(owner: ProcessId) -> Self {
        Self::with_tree(owner, StateTree::new())
    }

    pub fn with_tree(owner: ProcessId, tree: StateTree) -> Self {
        Self {
            owner,
            tree,
            confirmed: None,
            pending: VecDeque::new(),
            reducers: ReducerRegistry::new(),
            subscribers: Vec::new(),
            next_subscription: 0,
            bulk_loaded: false,
        }
    }

    /// The process this replica lives in.
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    pub fn state(&self) -> &StateTree {
        &self.tree
    }

    pub fn reducers(&self) -> &ReducerRegistry {
        &self.reducers
    }

    pub fn insert_module(&mut self, name: impl Into<String>, state: Value) {
        self.tree.insert_module(name, state);
    }

    pub fn register<F>(&mut self, module: impl Into<String>, kind: impl Into<String>, reducer: F)
    where
        F: Fn(&mut Value, &Value) -> Result<(), String> + Send + 'static,
    {
        self.reducers.register(module, kind, reducer);
    }

    pub fn subscribe<F>(&mut self, callback: F) -> SubscriptionId
    where
        F: FnMut(&Mutation) + Send + 'static,
    {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.push((id, Box::new(callback)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        let before = self.subscribers.len();
        self.subscribers.retain(|(sid, _)| *sid != id);
        self.subscribers.len() != before
    }

    /// Apply a locally originated mutation.
    ///
    /// Returns the applied mutation, authored by this replica's owner and not
    /// yet stamped with an id.
    pub fn commit(&mut self, kind: &str, payload: Value) -> Result<Mutation, ReduceError> {
        let mutation = Mutation::local(self.owner, kind, payload);
        self.apply(&mutation)?;
        Ok(mutation)
    }

    /// Commit a local mutation under `id` and keep it pending until the
    /// canonical stream acknowledges it.
    pub fn commit_pending(
        &mut self,
        kind: &str,
        payload: Value,
        id: MutationId,
    ) -> Result<Mutation, ReduceError> {
        let mutation = Mutation::local(self.owner, kind, payload).stamped(id);
        let base = self.confirmed.is_none().then(|| self.tree.clone());
        self.apply(&mutation)?;
        if base.is_some() {
            self.confirmed = base;
        }
        self.pending.push_back(mutation.clone());
        Ok(mutation)
    }

    /// Local commits not yet seen in the canonical stream, oldest first.
    pub fn pending(&self) -> impl Iterator<Item = &Mutation> {
        self.pending.iter()
    }

    /// Apply a batch from the canonical stream.
    ///
    /// Entries authored here acknowledge the matching pending commit (and
    /// any older one, which the canonical side refused). Pending commits are
    /// then replayed on top; one that no longer applies is dropped. Returns
    /// the errors for entries that could not be applied.
    pub fn apply_canonical(&mut self, batch: &[Mutation]) -> Vec<ReduceError> {
        let mut refused = Vec::new();
        let Some(mut base) = self.confirmed.take() else {
            for mutation in batch {
                if let Err(e) = self.apply(mutation) {
                    refused.push(e);
                }
            }
            return refused;
        };

        let mut remote = Vec::new();
        for mutation in batch {
            let own = mutation.author == self.owner;
            if own {
                self.acknowledge(mutation.local_id);
            }
            match self.reducers.reduce(&mut base, &mutation.kind, &mutation.payload) {
                Ok(()) if !own => remote.push(mutation),
                Ok(()) => {}
                Err(e) => refused.push(e),
            }
        }
        self.rebase(base);
        for mutation in remote {
            self.notify(mutation);
        }
        refused
    }

    /// Apply an already-built mutation (typically one received from a peer).
    pub fn apply(&mut self, mutation: &Mutation) -> Result<(), ReduceError> {
        self.reducers
            .reduce(&mut self.tree, &mutation.kind, &mutation.payload)?;
        self.notify(mutation);
        Ok(())
    }

    /// Replace the confirmed tree with a snapshot; pending commits are
    /// replayed on top. Applying the same snapshot twice leaves the same
    /// state as applying it once.
    pub fn load(&mut self, tree: StateTree) {
        self.load_acknowledged(tree, MutationId::UNSTAMPED);
    }

    /// Like `load`, for a snapshot that already contains every local commit
    /// up to `up_to`.
    pub fn load_acknowledged(&mut self, tree: StateTree, up_to: MutationId) {
        self.acknowledge(up_to);
        self.rebase(tree);
        self.bulk_loaded = true;
        let marker = Mutation {
            id: MutationId::UNSTAMPED,
            kind: BULK_LOAD_STATE.to_string(),
            payload: Value::Null,
            origin_flag: true,
            author: self.owner,
            local_id: MutationId::UNSTAMPED,
        };
        self.notify(&marker);
    }

    /// Whether at least one snapshot has been loaded.
    pub fn is_bulk_loaded(&self) -> bool {
        self.bulk_loaded
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        self.tree.to_json()
    }

    fn acknowledge(&mut self, up_to: MutationId) {
        while self.pending.front().is_some_and(|m| m.local_id <= up_to) {
            self.pending.pop_front();
        }
    }

    /// Make `base` the confirmed tree and replay pending commits over it.
    fn rebase(&mut self, base: StateTree) {
        if self.pending.is_empty() {
            self.tree = base;
            self.confirmed = None;
            return;
        }
        let mut tree = base.clone();
        let owner = self.owner;
        let reducers = &self.reducers;
        self.pending.retain(|m| match reducers.reduce(&mut tree, &m.kind, &m.payload) {
            Ok(()) => true,
            Err(e) => {
                debug!("{} dropping pending {} {}: {}", owner, m.kind, m.id, e);
                false
            }
        });
        self.tree = tree;
        self.confirmed = if self.pending.is_empty() { None } else { Some(base) };
    }

    fn notify(&mut self, mutation: &Mutation) {
        for (_, subscriber) in &mut self.subscribers {
            subscriber(mutation);
        }
    }
}

impl std::fmt::Debug for StateReplica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateReplica")
            .field("owner", &self.owner)
            .field("tree", &self.tree)
            .field("reducers", &self.reducers)
            .field("pending", &self.pending.len())
            .field("subscribers", &self.subscribers.len())
            .field("bulk_loaded", &self.bulk_loaded)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::{Arc, Mutex};

    fn counter_replica(owner: u64) -> StateReplica {
        let mut replica = StateReplica::new(ProcessId::new(owner));
        replica.insert_module("counter", json!({"value": 0}));
        replica.register("counter", "counter/increment", |state, payload| {
            let by = payload["by"].as_i64().unwrap_or(1);
            let value = state["value"].as_i64().unwrap_or(0);
            state["value"] = json!(value + by);
            Ok(())
        });
        replica
    }

    fn list_replica(owner: u64) -> StateReplica {
        let mut replica = StateReplica::new(ProcessId::new(owner));
        replica.insert_module("todos", json!([]));
        replica.register("todos", "todos/add", |state, payload| {
            state
                .as_array_mut()
                .ok_or("not a list")?
                .push(payload["text"].clone());
            Ok(())
        });
        replica.register("todos", "todos/pop", |state, _| {
            state
                .as_array_mut()
                .ok_or("not a list")?
                .pop()
                .map(|_| ())
                .ok_or_else(|| "empty".to_string())
        });
        replica
    }

    fn canonical(author: u64, local_id: u64, id: u64, kind: &str, text: &str) -> Mutation {
        Mutation::local(ProcessId::new(author), kind, json!({"text": text}))
            .stamped(MutationId::new(local_id))
            .stamped(MutationId::new(id))
            .as_origin()
    }

    fn recorder(replica: &mut StateReplica) -> Arc<Mutex<Vec<Mutation>>> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        replica.subscribe(move |m| sink.lock().unwrap().push(m.clone()));
        seen
    }

    #[test]
    fn commit_applies_and_notifies() {
        let mut replica = counter_replica(1);
        let seen = recorder(&mut replica);

        let m = replica.commit("counter/increment", json!({"by": 3})).unwrap();
        assert_eq!(m.author, ProcessId::new(1));
        assert_eq!(m.id, MutationId::UNSTAMPED);
        assert!(!m.origin_flag);
        assert_eq!(replica.state().module("counter"), Some(&json!({"value": 3})));
        assert_eq!(seen.lock().unwrap().as_slice(), &[m]);
    }

    #[test]
    fn remote_apply_notifies_with_origin_flag() {
        let mut replica = counter_replica(1);
        let seen = recorder(&mut replica);

        let remote = Mutation::local(ProcessId::new(2), "counter/increment", json!({"by": 1}))
            .stamped(MutationId::new(4))
            .as_origin();
        replica.apply(&remote).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].origin_flag);
        assert_eq!(seen[0].author, ProcessId::new(2));
    }

    #[test]
    fn unknown_type_is_not_notified() {
        let mut replica = counter_replica(1);
        let seen = recorder(&mut replica);

        assert!(replica.commit("todos/add", json!({"text": "x"})).is_err());
        assert!(seen.lock().unwrap().is_empty());
    }

    #[test]
    fn load_is_idempotent() {
        let mut snapshot = StateTree::new();
        snapshot.insert_module("counter", json!({"value": 42}));

        let mut once = counter_replica(1);
        once.load(snapshot.clone());

        let mut twice = counter_replica(1);
        twice.commit("counter/increment", json!({"by": 5})).unwrap();
        twice.load(snapshot.clone());
        twice.load(snapshot);

        assert!(twice.is_bulk_loaded());
        assert_eq!(once.state(), twice.state());
    }

    #[test]
    fn load_notifies_bulk_marker() {
        let mut replica = counter_replica(1);
        let seen = recorder(&mut replica);
        replica.load(StateTree::new());

        let seen = seen.lock().unwrap();
        assert!(seen[0].is_bulk_load());
        assert!(seen[0].origin_flag);
    }

    #[test]
    fn unsubscribe_stops_notifications() {
        let mut replica = counter_replica(1);
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        let id = replica.subscribe(move |_| *sink.lock().unwrap() += 1);

        replica.commit("counter/increment", json!({})).unwrap();
        assert!(replica.unsubscribe(id));
        replica.commit("counter/increment", json!({})).unwrap();

        assert_eq!(*seen.lock().unwrap(), 1);
        assert!(!replica.unsubscribe(id));
    }

    #[test]
    fn pending_commit_is_rebased_onto_canonical_order() {
        let mut replica = list_replica(2);
        replica.commit_pending("todos/add", json!({"text": "mine"}), MutationId::new(1)).unwrap();
        assert_eq!(replica.state().module("todos"), Some(&json!(["mine"])));

        // The canonical side accepted another process's commit first.
        replica.apply_canonical(&[
            canonical(3, 1, 1, "todos/add", "theirs"),
            canonical(2, 1, 2, "todos/add", "mine"),
        ]);

        assert_eq!(replica.state().module("todos"), Some(&json!(["theirs", "mine"])));
        assert_eq!(replica.pending().count(), 0);
    }

    #[test]
    fn unacknowledged_commits_are_replayed_after_remote_entries() {
        let mut replica = list_replica(2);
        replica.commit_pending("todos/add", json!({"text": "a"}), MutationId::new(1)).unwrap();
        replica.commit_pending("todos/add", json!({"text": "b"}), MutationId::new(2)).unwrap();

        replica.apply_canonical(&[
            canonical(2, 1, 5, "todos/add", "a"),
            canonical(1, 7, 6, "todos/add", "w"),
        ]);

        assert_eq!(replica.state().module("todos"), Some(&json!(["a", "w", "b"])));
        let pending: Vec<_> = replica.pending().map(|m| m.local_id.get()).collect();
        assert_eq!(pending, vec![2]);
    }

    #[test]
    fn snapshot_keeps_commits_it_does_not_contain() {
        let mut replica = list_replica(2);
        replica.commit_pending("todos/add", json!({"text": "a"}), MutationId::new(1)).unwrap();
        replica.commit_pending("todos/add", json!({"text": "b"}), MutationId::new(2)).unwrap();

        let mut snapshot = StateTree::new();
        snapshot.insert_module("todos", json!(["x", "a"]));
        replica.load_acknowledged(snapshot.clone(), MutationId::new(1));
        assert_eq!(replica.state().module("todos"), Some(&json!(["x", "a", "b"])));

        replica.load_acknowledged(snapshot, MutationId::new(1));
        assert_eq!(replica.state().module("todos"), Some(&json!(["x", "a", "b"])));
    }

    #[test]
    fn pending_commit_that_no_longer_applies_is_dropped() {
        let mut replica = list_replica(2);
        replica.insert_module("todos", json!(["only"]));
        replica.commit_pending("todos/pop", Value::Null, MutationId::new(1)).unwrap();

        // Someone else popped it first.
        replica.apply_canonical(&[canonical(3, 1, 1, "todos/pop", "")]);

        assert_eq!(replica.state().module("todos"), Some(&json!([])));
        assert_eq!(replica.pending().count(), 0);
    }

    #[test]
    fn canonical_batch_notifies_remote_entries_only() {
        let mut replica = list_replica(2);
        replica.commit_pending("todos/add", json!({"text": "mine"}), MutationId::new(1)).unwrap();
        let seen = recorder(&mut replica);

        replica.apply_canonical(&[
            canonical(2, 1, 1, "todos/add", "mine"),
            canonical(3, 1, 2, "todos/add", "theirs"),
        ]);

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].author, ProcessId::new(3));
    }
}
