//! The informer — owns reflector tasks and exposes snapshots and
//! notification streams to consumers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{RwLock, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::info;

use flotilla_api::{ObjectKind, StateBackend, WatchEvent};

use crate::cache::Snapshot;
use crate::reflector::{SharedCaches, Subscribers, run_reflector};

/// Process-scoped watch cache with explicit lifecycle: constructed at
/// start-up bound to a backend, torn down on shutdown or leader loss,
/// never assumed valid across a restart.
pub struct Informer<B: StateBackend> {
    backend: B,
    caches: SharedCaches,
    subscribers: Subscribers,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<B: StateBackend> Informer<B> {
    pub fn new(backend: B) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            backend,
            caches: Arc::new(RwLock::new(HashMap::new())),
            subscribers: Arc::new(RwLock::new(HashMap::new())),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Establish one logical watch stream per kind.
    pub fn start(&self, kinds: &[ObjectKind]) {
        let mut tasks = self.tasks.lock().unwrap();
        for &kind in kinds {
            let backend = self.backend.clone();
            let caches = self.caches.clone();
            let subscribers = self.subscribers.clone();
            let shutdown = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                run_reflector(backend, kind, caches, subscribers, shutdown).await;
            }));
        }
        info!(kinds = kinds.len(), "informer started");
    }

    /// Point-in-time snapshot of a kind, ordered by identity. Empty
    /// until the kind's first successful list.
    pub async fn snapshot(&self, kind: ObjectKind) -> Snapshot {
        let caches = self.caches.read().await;
        caches
            .get(&kind)
            .map(|c| c.snapshot())
            .unwrap_or_default()
    }

    /// Register a bounded notification stream for a kind. Events are
    /// delivered after they are applied to the cache; a consumer that
    /// stops draining is disconnected and must re-subscribe.
    pub async fn subscribe(
        &self,
        kind: ObjectKind,
        capacity: usize,
    ) -> mpsc::Receiver<WatchEvent> {
        let (tx, rx) = mpsc::channel(capacity);
        let mut subscribers = self.subscribers.write().await;
        subscribers.entry(kind).or_default().push(tx);
        rx
    }

    /// Wait until every given kind has completed its initial list.
    pub async fn wait_until_synced(&self, kinds: &[ObjectKind]) {
        loop {
            {
                let caches = self.caches.read().await;
                if kinds.iter().all(|k| caches.contains_key(k)) {
                    return;
                }
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Signal every reflector to stop. Blocked reads wake and exit.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("informer shutting down");
    }
}

impl<B: StateBackend> Drop for Informer<B> {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks.lock().unwrap().drain(..) {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_api::{
        BindingState, EventKind, Node, NodeConditions, Object, ResourceVec,
        WorkloadUnit, WriteOutcome,
    };
    use flotilla_store::ClusterStore;

    fn node_object(id: &str) -> Object {
        Object::Node(Node {
            id: id.to_string(),
            labels: Default::default(),
            taints: Vec::new(),
            allocatable: ResourceVec::new(2000, 4096),
            conditions: NodeConditions::healthy(0),
            images: Vec::new(),
            resource_version: 0,
        })
    }

    fn unit_object(id: &str) -> Object {
        Object::WorkloadUnit(WorkloadUnit {
            id: id.to_string(),
            labels: Default::default(),
            priority_class: "default".to_string(),
            priority: 0,
            requests: ResourceVec::new(100, 128),
            limits: None,
            node_selector: Default::default(),
            node_affinity: None,
            unit_affinity: None,
            unit_anti_affinity: None,
            tolerations: Vec::new(),
            spread_constraints: Vec::new(),
            images: Vec::new(),
            binding: BindingState::Unbound,
            created_at: 1000,
            resource_version: 0,
        })
    }

    fn commit(store: &ClusterStore, object: Object, expected: u64) -> u64 {
        match store.write_conditional(object, expected).unwrap() {
            WriteOutcome::Committed(v) => v,
            other => panic!("unexpected outcome: {other:?}"),
        }
    }

    #[tokio::test]
    async fn informer_mirrors_existing_and_live_objects() {
        let store = ClusterStore::open_in_memory().unwrap();
        commit(&store, node_object("n1"), 0);

        let informer = Informer::new(store.clone());
        informer.start(&[ObjectKind::Node]);
        informer.wait_until_synced(&[ObjectKind::Node]).await;

        let snap = informer.snapshot(ObjectKind::Node).await;
        assert_eq!(snap.nodes().len(), 1);

        let mut rx = informer.subscribe(ObjectKind::Node, 16).await;
        commit(&store, node_object("n2"), 0);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::Added);
        assert_eq!(event.object.as_ref().unwrap().id(), "n2");

        let snap = informer.snapshot(ObjectKind::Node).await;
        assert_eq!(snap.nodes().len(), 2);
        informer.shutdown();
    }

    #[tokio::test]
    async fn snapshot_version_is_monotonic() {
        let store = ClusterStore::open_in_memory().unwrap();
        let informer = Informer::new(store.clone());
        informer.start(&[ObjectKind::WorkloadUnit]);
        informer.wait_until_synced(&[ObjectKind::WorkloadUnit]).await;

        let mut last = informer.snapshot(ObjectKind::WorkloadUnit).await.version;
        let mut rx = informer.subscribe(ObjectKind::WorkloadUnit, 16).await;
        for i in 0..5 {
            commit(&store, unit_object(&format!("u{i}")), 0);
            let _ = rx.recv().await.unwrap();
            let version = informer.snapshot(ObjectKind::WorkloadUnit).await.version;
            assert!(version >= last);
            last = version;
        }
        informer.shutdown();
    }

    #[tokio::test]
    async fn reconnect_resumes_without_duplicates() {
        let store = ClusterStore::open_in_memory().unwrap();
        let informer = Informer::new(store.clone());
        informer.start(&[ObjectKind::Node]);
        informer.wait_until_synced(&[ObjectKind::Node]).await;

        commit(&store, node_object("n1"), 0);

        // Sever every live watch stream mid-flight.
        store.drop_all_watches();
        commit(&store, node_object("n2"), 0);

        // The reflector reconnects from its last acknowledged version
        // and catches up on the missed event.
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snap = informer.snapshot(ObjectKind::Node).await;
            if snap.nodes().len() == 2 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "reconnect timed out");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        informer.shutdown();
    }

    #[tokio::test]
    async fn compacted_history_triggers_relist() {
        let store = ClusterStore::open_in_memory().unwrap();
        store.set_history_limit(2);

        let informer = Informer::new(store.clone());
        informer.start(&[ObjectKind::Node]);
        informer.wait_until_synced(&[ObjectKind::Node]).await;

        // Sever the stream, then push enough writes to compact the
        // informer's resume version out of the log.
        store.drop_all_watches();
        for i in 0..8 {
            commit(&store, node_object(&format!("n{i}")), 0);
        }

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let snap = informer.snapshot(ObjectKind::Node).await;
            if snap.nodes().len() == 8 {
                break;
            }
            assert!(tokio::time::Instant::now() < deadline, "relist timed out");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        informer.shutdown();
    }

    #[tokio::test]
    async fn shutdown_stops_reflectors() {
        let store = ClusterStore::open_in_memory().unwrap();
        let informer = Informer::new(store.clone());
        informer.start(&[ObjectKind::Node]);
        informer.wait_until_synced(&[ObjectKind::Node]).await;

        informer.shutdown();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Writes after shutdown are no longer mirrored.
        commit(&store, node_object("late"), 0);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let snap = informer.snapshot(ObjectKind::Node).await;
        assert!(snap.nodes().is_empty());
    }
}
