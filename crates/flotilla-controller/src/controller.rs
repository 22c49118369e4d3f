//! Generic reconciliation loop with per-key serialization.
//!
//! A `Controller` consumes object keys from a channel and runs the
//! reconciler for each. At most one reconciliation is in flight per
//! key; keys arriving during a run are marked dirty and rerun once it
//! finishes. Concurrency across distinct keys is bounded by a
//! semaphore. The loop only processes keys while the leader lease is
//! held; on loss every in-flight run is aborted.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{Semaphore, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use flotilla_api::LeaderLease;

/// What a reconciliation run decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The observed state matches the desired state.
    Done,
    /// Revisit this key after a delay.
    RequeueAfter(Duration),
}

/// A single-key reconciliation step. Implementations must be
/// idempotent: the same key may be delivered again at any time.
pub trait Reconciler: Send + Sync + 'static {
    type Error: std::fmt::Display + Send;

    fn reconcile(
        &self,
        key: &str,
    ) -> impl Future<Output = Result<ReconcileOutcome, Self::Error>> + Send;
}

struct KeySlot {
    /// Re-delivered while running; rerun once the current run ends.
    dirty: bool,
    handle: JoinHandle<()>,
}

struct Inner<R: Reconciler> {
    reconciler: R,
    slots: Mutex<HashMap<String, KeySlot>>,
    limiter: Semaphore,
    error_backoff: Duration,
}

/// Drives a [`Reconciler`] from a key stream.
pub struct Controller<R: Reconciler> {
    inner: Arc<Inner<R>>,
}

impl<R: Reconciler> Controller<R> {
    pub fn new(reconciler: R, max_concurrent: usize, error_backoff: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                reconciler,
                slots: Mutex::new(HashMap::new()),
                limiter: Semaphore::new(max_concurrent.max(1)),
                error_backoff,
            }),
        }
    }

    /// Keys currently owned by a worker.
    pub fn in_flight(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    /// Run until the key stream closes or shutdown is signalled.
    /// Keys arriving while the lease is not held are dropped; the
    /// producer re-feeds from watched state after re-election.
    pub async fn run<L: LeaderLease>(
        &self,
        mut keys: mpsc::Receiver<String>,
        lease: &L,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut lease_rx = lease.subscribe();
        let (requeue_tx, mut requeue_rx) = mpsc::channel::<String>(64);

        loop {
            tokio::select! {
                maybe = keys.recv() => match maybe {
                    Some(key) => self.dispatch(key, &lease_rx, &requeue_tx, &shutdown),
                    None => break,
                },
                Some(key) = requeue_rx.recv() => {
                    self.dispatch(key, &lease_rx, &requeue_tx, &shutdown);
                }
                changed = lease_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    if !*lease_rx.borrow() {
                        info!("leadership lost, aborting in-flight reconciliations");
                        self.abort_all();
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        self.abort_all();
    }

    fn dispatch(
        &self,
        key: String,
        lease_rx: &watch::Receiver<bool>,
        requeue_tx: &mpsc::Sender<String>,
        shutdown: &watch::Receiver<bool>,
    ) {
        if !*lease_rx.borrow() {
            debug!(%key, "not leader, key dropped");
            return;
        }

        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(slot) = slots.get_mut(&key) {
            slot.dirty = true;
            return;
        }

        let handle = tokio::spawn(worker(
            self.inner.clone(),
            key.clone(),
            requeue_tx.clone(),
            shutdown.clone(),
        ));
        slots.insert(key, KeySlot {
            dirty: false,
            handle,
        });
    }

    fn abort_all(&self) {
        let mut slots = self.inner.slots.lock().unwrap();
        for (key, slot) in slots.drain() {
            debug!(%key, "aborting reconciliation");
            slot.handle.abort();
        }
    }
}

async fn worker<R: Reconciler>(
    inner: Arc<Inner<R>>,
    key: String,
    requeue_tx: mpsc::Sender<String>,
    shutdown: watch::Receiver<bool>,
) {
    loop {
        let Ok(_permit) = inner.limiter.acquire().await else {
            return;
        };

        let delay = match inner.reconciler.reconcile(&key).await {
            Ok(ReconcileOutcome::Done) => None,
            Ok(ReconcileOutcome::RequeueAfter(delay)) => Some(delay),
            Err(e) => {
                warn!(%key, error = %e, "reconcile failed, backing off");
                Some(inner.error_backoff)
            }
        };

        // Rerun immediately if the key was re-delivered mid-run.
        let rerun = {
            let mut slots = inner.slots.lock().unwrap();
            match slots.get_mut(&key) {
                Some(slot) if slot.dirty => {
                    slot.dirty = false;
                    true
                }
                Some(_) => {
                    slots.remove(&key);
                    false
                }
                // Aborted concurrently; nothing to clean up.
                None => return,
            }
        };
        if rerun {
            continue;
        }

        if let Some(delay) = delay {
            redeliver_after(key, delay, requeue_tx, shutdown);
        }
        return;
    }
}

/// Hand the key back to the dispatcher after a delay, detached so the
/// concurrency slot frees immediately.
fn redeliver_after(
    key: String,
    delay: Duration,
    requeue_tx: mpsc::Sender<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                let _ = requeue_tx.send(key).await;
            }
            _ = shutdown.changed() => {}
        }
    });
}

/// Run leader-gated work: `make` produces the work future each time
/// leadership is (re)acquired, and losing the lease cancels it.
pub async fn run_while_leader<L, F, Fut>(
    lease: &L,
    mut shutdown: watch::Receiver<bool>,
    mut make: F,
) where
    L: LeaderLease,
    F: FnMut() -> Fut,
    Fut: Future<Output = ()>,
{
    let mut lease_rx = lease.subscribe();
    loop {
        while !*lease_rx.borrow() {
            tokio::select! {
                changed = lease_rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        return;
                    }
                }
            }
        }

        info!("leadership acquired, starting work");
        tokio::select! {
            _ = make() => return,
            changed = lease_rx.changed() => {
                if changed.is_err() {
                    return;
                }
                if !*lease_rx.borrow() {
                    warn!("leadership lost, work cancelled");
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
    }
}
