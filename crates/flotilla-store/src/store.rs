//! ClusterStore — redb-backed versioned object store.
//!
//! Provides conditional writes, per-kind listing, and a resumable
//! watch feed over a single global event log. The store is `Clone` +
//! `Send` + `Sync` (backed by `Arc`) and can be shared across async
//! tasks; the underlying redb operations are synchronous and fast
//! enough to call inline from async contexts in tests and dev runs.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use redb::{Database, ReadableDatabase, ReadableTable};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use flotilla_api::{
    AdmissionDecision, BackendResult, Object, ObjectKind, ProposedWrite,
    StateBackend, WatchEvent, WriteOutcome,
};

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Admission gate hook invoked on every proposed write before commit.
pub type AdmissionHook =
    Arc<dyn Fn(&ProposedWrite) -> AdmissionDecision + Send + Sync>;

/// Thread-safe versioned object store.
#[derive(Clone)]
pub struct ClusterStore {
    inner: Arc<StoreInner>,
}

struct StoreInner {
    db: Database,
    /// Serializes commits against watch registration so no event can
    /// fall between a subscriber's replay and its live stream.
    write_lock: Mutex<()>,
    subscribers: Mutex<HashMap<ObjectKind, Vec<mpsc::Sender<WatchEvent>>>>,
    admission: Mutex<Option<AdmissionHook>>,
    /// Maximum events retained in the log.
    history_limit: AtomicU64,
}

const DEFAULT_HISTORY_LIMIT: u64 = 1024;

impl ClusterStore {
    /// Open (or create) a persistent store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!(?path, "cluster store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db)?;
        debug!("in-memory cluster store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> StoreResult<Self> {
        let store = Self {
            inner: Arc::new(StoreInner {
                db,
                write_lock: Mutex::new(()),
                subscribers: Mutex::new(HashMap::new()),
                admission: Mutex::new(None),
                history_limit: AtomicU64::new(DEFAULT_HISTORY_LIMIT),
            }),
        };
        store.ensure_tables()?;
        Ok(store)
    }

    /// Install an admission hook gating every subsequent write.
    pub fn set_admission(&self, hook: AdmissionHook) {
        *self.inner.admission.lock().unwrap() = Some(hook);
    }

    /// Bound the event log to `limit` entries (older entries compact).
    pub fn set_history_limit(&self, limit: u64) {
        self.inner.history_limit.store(limit.max(1), Ordering::Relaxed);
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        {
            txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            txn.open_table(EVENTS).map_err(map_err!(Table))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            if meta.get(META_VERSION).map_err(map_err!(Read))?.is_none() {
                meta.insert(META_VERSION, 0).map_err(map_err!(Write))?;
                meta.insert(META_COMPACTED, 0).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// The store-global resourceVersion of the latest commit.
    pub fn current_version(&self) -> StoreResult<u64> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;
        Ok(meta
            .get(META_VERSION)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0))
    }

    /// Fetch one object.
    pub fn get(&self, kind: ObjectKind, id: &str) -> StoreResult<Option<Object>> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let key = object_key(kind, id);
        match table.get(key.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let object: Object = serde_json::from_slice(guard.value())
                    .map_err(map_err!(Deserialize))?;
                Ok(Some(object))
            }
            None => Ok(None),
        }
    }

    /// List all objects of a kind plus the version the listing is
    /// consistent at.
    pub fn list_kind(&self, kind: ObjectKind) -> StoreResult<(Vec<Object>, u64)> {
        let txn = self.inner.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
        let meta = txn.open_table(META).map_err(map_err!(Table))?;

        let start = format!("{}/", kind.as_str());
        let end = kind_range_end(kind);
        let mut objects = Vec::new();
        for entry in table
            .range::<&str>(start.as_str()..end.as_str())
            .map_err(map_err!(Read))?
        {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let object: Object =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            objects.push(object);
        }
        let version = meta
            .get(META_VERSION)
            .map_err(map_err!(Read))?
            .map(|g| g.value())
            .unwrap_or(0);
        Ok((objects, version))
    }

    /// Conditionally write an object (0 = must not exist).
    pub fn write_conditional(
        &self,
        mut object: Object,
        expected_version: u64,
    ) -> StoreResult<WriteOutcome> {
        if let Some(decision) = self.admit(&ProposedWrite::Put {
            object: object.clone(),
        }) {
            return Ok(decision);
        }

        let _guard = self.inner.write_lock.lock().unwrap();
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let key = object_key(object.kind(), object.id());
        let event;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            let current = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let existing: Object = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    existing.resource_version()
                }
                None => 0,
            };
            if current != expected_version {
                debug!(key = %key, current, expected_version, "conditional write conflict");
                return Ok(WriteOutcome::Conflict);
            }

            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let version = next_version(&mut meta)?;
            object.set_resource_version(version);
            let value = serde_json::to_vec(&object).map_err(map_err!(Serialize))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;

            event = if expected_version == 0 {
                WatchEvent::added(object)
            } else {
                WatchEvent::modified(object)
            };
            let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            self.append_event(&mut events, &mut meta, &event)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let version = event.resource_version;
        self.fan_out(&event);
        debug!(key = %key, version, "object committed");
        Ok(WriteOutcome::Committed(version))
    }

    /// Conditionally delete an object, recording the eviction grace
    /// period for the downstream agent.
    pub fn remove_conditional(
        &self,
        kind: ObjectKind,
        id: &str,
        grace: Duration,
        expected_version: u64,
    ) -> StoreResult<WriteOutcome> {
        if let Some(decision) = self.admit(&ProposedWrite::Delete {
            kind,
            id: id.to_string(),
        }) {
            return Ok(decision);
        }

        let _guard = self.inner.write_lock.lock().unwrap();
        let txn = self.inner.db.begin_write().map_err(map_err!(Transaction))?;
        let key = object_key(kind, id);
        let event;
        {
            let mut table = txn.open_table(OBJECTS).map_err(map_err!(Table))?;
            let existing = match table.get(key.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    let object: Object = serde_json::from_slice(guard.value())
                        .map_err(map_err!(Deserialize))?;
                    object
                }
                // Already gone: another writer won the race.
                None => return Ok(WriteOutcome::Conflict),
            };
            if existing.resource_version() != expected_version {
                return Ok(WriteOutcome::Conflict);
            }

            table.remove(key.as_str()).map_err(map_err!(Write))?;
            let mut meta = txn.open_table(META).map_err(map_err!(Table))?;
            let version = next_version(&mut meta)?;

            let mut final_object = existing;
            final_object.set_resource_version(version);
            event = WatchEvent::deleted(final_object, version);
            let mut events = txn.open_table(EVENTS).map_err(map_err!(Table))?;
            self.append_event(&mut events, &mut meta, &event)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        self.fan_out(&event);
        debug!(key = %key, grace_ms = grace.as_millis() as u64, "eviction committed");
        Ok(WriteOutcome::Committed(event.resource_version))
    }

    /// Open a watch stream resuming after `from_version`.
    pub fn watch_from(
        &self,
        kind: ObjectKind,
        from_version: u64,
    ) -> BackendResult<mpsc::Receiver<WatchEvent>> {
        // Hold the write lock across replay + registration: no commit
        // can land between the replayed tail and the live stream.
        let _guard = self.inner.write_lock.lock().unwrap();

        let txn = self
            .inner
            .db
            .begin_read()
            .map_err(map_err!(Transaction))
            .map_err(flotilla_api::BackendError::from)?;
        let meta = txn
            .open_table(META)
            .map_err(map_err!(Table))
            .map_err(flotilla_api::BackendError::from)?;
        let floor = meta
            .get(META_COMPACTED)
            .map_err(map_err!(Read))
            .map_err(flotilla_api::BackendError::from)?
            .map(|g| g.value())
            .unwrap_or(0);
        if from_version < floor {
            return Err(flotilla_api::BackendError::CompactedHistory { oldest: floor });
        }
        let current = meta
            .get(META_VERSION)
            .map_err(map_err!(Read))
            .map_err(flotilla_api::BackendError::from)?
            .map(|g| g.value())
            .unwrap_or(0);

        let events_table = txn
            .open_table(EVENTS)
            .map_err(map_err!(Table))
            .map_err(flotilla_api::BackendError::from)?;
        let mut replay = Vec::new();
        for entry in events_table
            .range(from_version + 1..)
            .map_err(map_err!(Read))
            .map_err(flotilla_api::BackendError::from)?
        {
            let (_, value) = entry
                .map_err(map_err!(Read))
                .map_err(flotilla_api::BackendError::from)?;
            let event: WatchEvent = serde_json::from_slice(value.value())
                .map_err(map_err!(Deserialize))
                .map_err(flotilla_api::BackendError::from)?;
            let matches = event
                .object
                .as_ref()
                .is_none_or(|o| o.kind() == kind);
            if matches {
                replay.push(event);
            }
        }

        let (tx, rx) = mpsc::channel(replay.len() + 64);
        for event in replay {
            // Capacity sized above; cannot fail.
            let _ = tx.try_send(event);
        }
        // Initial bookmark hands the subscriber its resume version.
        let _ = tx.try_send(WatchEvent::bookmark(current));

        self.inner
            .subscribers
            .lock()
            .unwrap()
            .entry(kind)
            .or_default()
            .push(tx);
        Ok(rx)
    }

    // ── Internal helpers ────────────────────────────────────────────

    /// Run the admission hook; Some = short-circuit outcome.
    fn admit(&self, write: &ProposedWrite) -> Option<WriteOutcome> {
        let hook = self.inner.admission.lock().unwrap().clone();
        match hook {
            Some(hook) => match hook(write) {
                AdmissionDecision::Allow => None,
                AdmissionDecision::Deny { reason, retryable } => {
                    debug!(%reason, retryable, "write rejected by admission gate");
                    Some(WriteOutcome::Rejected { reason, retryable })
                }
            },
            None => None,
        }
    }

    /// Append an event and prune the log to the history limit.
    fn append_event(
        &self,
        events: &mut redb::Table<u64, &[u8]>,
        meta: &mut redb::Table<&str, u64>,
        event: &WatchEvent,
    ) -> StoreResult<()> {
        let value = serde_json::to_vec(event).map_err(map_err!(Serialize))?;
        events
            .insert(event.resource_version, value.as_slice())
            .map_err(map_err!(Write))?;

        let limit = self.inner.history_limit.load(Ordering::Relaxed);
        if event.resource_version > limit {
            let prune_below = event.resource_version - limit;
            let stale: Vec<u64> = events
                .range(..=prune_below)
                .map_err(map_err!(Read))?
                .filter_map(|entry| entry.ok().map(|(k, _)| k.value()))
                .collect();
            if !stale.is_empty() {
                for key in &stale {
                    events.remove(*key).map_err(map_err!(Write))?;
                }
                let floor = meta
                    .get(META_COMPACTED)
                    .map_err(map_err!(Read))?
                    .map(|g| g.value())
                    .unwrap_or(0);
                if prune_below > floor {
                    meta.insert(META_COMPACTED, prune_below)
                        .map_err(map_err!(Write))?;
                }
            }
        }
        Ok(())
    }

    /// Deliver an event to live subscribers of its kind. A subscriber
    /// that is closed or has a full buffer is dropped; it must re-watch,
    /// exactly as after a network disconnect.
    fn fan_out(&self, event: &WatchEvent) {
        let Some(object) = &event.object else { return };
        let kind = object.kind();
        let mut subscribers = self.inner.subscribers.lock().unwrap();
        if let Some(list) = subscribers.get_mut(&kind) {
            list.retain(|tx| match tx.try_send(event.clone()) {
                Ok(()) => true,
                Err(e) => {
                    warn!(kind = kind.as_str(), error = %e, "dropping watch subscriber");
                    false
                }
            });
        }
    }

    /// Disconnect every live watch stream (for testing reconnects).
    pub fn drop_all_watches(&self) {
        self.inner.subscribers.lock().unwrap().clear();
    }
}

/// Bump and return the global version counter.
fn next_version(meta: &mut redb::Table<&str, u64>) -> StoreResult<u64> {
    let current = meta
        .get(META_VERSION)
        .map_err(map_err!(Read))?
        .map(|g| g.value())
        .unwrap_or(0);
    let next = current + 1;
    meta.insert(META_VERSION, next).map_err(map_err!(Write))?;
    Ok(next)
}

impl StateBackend for ClusterStore {
    async fn list(&self, kind: ObjectKind) -> BackendResult<(Vec<Object>, u64)> {
        Ok(self.list_kind(kind)?)
    }

    async fn watch(
        &self,
        kind: ObjectKind,
        from_version: u64,
    ) -> BackendResult<mpsc::Receiver<WatchEvent>> {
        self.watch_from(kind, from_version)
    }

    async fn conditional_write(
        &self,
        object: Object,
        expected_version: u64,
    ) -> BackendResult<WriteOutcome> {
        Ok(self.write_conditional(object, expected_version)?)
    }

    async fn delete_with_grace(
        &self,
        kind: ObjectKind,
        id: &str,
        grace: Duration,
        expected_version: u64,
    ) -> BackendResult<WriteOutcome> {
        Ok(self.remove_conditional(kind, id, grace, expected_version)?)
    }
}
