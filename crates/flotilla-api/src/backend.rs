//! Trait interfaces to external collaborators.
//!
//! The durable state store, the admission pipeline, and leader
//! election live outside this core. The core consumes them through
//! the traits here; `flotilla-store` provides the in-process harness
//! implementation used in development and tests.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use crate::error::BackendResult;
use crate::event::{Object, ObjectKind, WatchEvent};

/// Outcome of a conditional write or graceful delete.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Commit succeeded; the object now carries this resourceVersion.
    Committed(u64),
    /// Another writer mutated the object since `expected_version`.
    Conflict,
    /// The admission gate refused the write.
    Rejected { reason: String, retryable: bool },
}

/// A write the core proposes to the store, as seen by the admission
/// gate before commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ProposedWrite {
    Put { object: Object },
    Delete { kind: ObjectKind, id: String },
}

/// The external state store, consumed as a watch+read/write API.
///
/// Implementations guarantee ordered, versioned, resumable event
/// delivery per kind. Wire format is the store's concern.
pub trait StateBackend: Clone + Send + Sync + 'static {
    /// List all objects of a kind plus the version the listing is
    /// consistent at (the watch resume point).
    fn list(
        &self,
        kind: ObjectKind,
    ) -> impl Future<Output = BackendResult<(Vec<Object>, u64)>> + Send;

    /// Stream events for a kind starting after `from_version`.
    ///
    /// Fails with `CompactedHistory` when `from_version` predates the
    /// retained history; callers must relist.
    fn watch(
        &self,
        kind: ObjectKind,
        from_version: u64,
    ) -> impl Future<Output = BackendResult<mpsc::Receiver<WatchEvent>>> + Send;

    /// Conditionally write an object: committed only if its current
    /// version equals `expected_version` (0 = must not exist).
    fn conditional_write(
        &self,
        object: Object,
        expected_version: u64,
    ) -> impl Future<Output = BackendResult<WriteOutcome>> + Send;

    /// Request graceful deletion (eviction) of an object, conditioned
    /// on `expected_version`. The grace period is surfaced to the
    /// downstream agent; the store emits `Deleted` when it commits.
    fn delete_with_grace(
        &self,
        kind: ObjectKind,
        id: &str,
        grace: Duration,
        expected_version: u64,
    ) -> impl Future<Output = BackendResult<WriteOutcome>> + Send;
}

/// Verdict of the admission gate on a proposed write.
///
/// The gate runs inside the store's write path; the core only ever
/// sees the verdict reflected back as a [`WriteOutcome::Rejected`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AdmissionDecision {
    Allow,
    Deny { reason: String, retryable: bool },
}

/// Leader-election primitive, consumed as a held/lost signal.
///
/// `subscribe` yields `true` while this instance holds the lease.
/// Loss must propagate promptly so in-flight work can abort.
pub trait LeaderLease: Send + Sync + 'static {
    fn subscribe(&self) -> watch::Receiver<bool>;
}

/// A lease with a fixed, externally toggled state. Stands in for a
/// real election backend in tests and single-instance deployments.
pub struct StaticLease {
    tx: watch::Sender<bool>,
}

impl StaticLease {
    pub fn new(held: bool) -> Self {
        let (tx, _) = watch::channel(held);
        Self { tx }
    }

    /// Flip lease ownership; subscribers observe the change.
    pub fn set_held(&self, held: bool) {
        let _ = self.tx.send(held);
    }
}

impl LeaderLease for StaticLease {
    fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }
}
