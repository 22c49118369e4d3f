//! Placement queue — priority ordering with requeue backoff.
//!
//! Pending units are keyed by (priority desc, enqueue time asc, id
//! asc). A popped unit is owned by exactly one scheduling cycle;
//! re-entry happens only through `requeue` (with exponential backoff)
//! or a fresh watch event. Heap entries carry a per-push sequence
//! number and only the entry matching the id's live sequence is ever
//! delivered, so duplicate pushes and `forget` leave stale entries
//! that pop skips lazily.

use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use flotilla_api::WorkloadUnit;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Entry {
    priority: i64,
    created_at: u64,
    id: String,
    /// Sequence assigned at insert; stale when it no longer matches
    /// the id's live sequence.
    seq: u64,
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Max-heap: highest priority, then oldest, then smallest id.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.created_at.cmp(&self.created_at))
            .then_with(|| other.id.cmp(&self.id))
    }
}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DelayedEntry {
    ready_at: Instant,
    entry: Entry,
}

impl Ord for DelayedEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.ready_at
            .cmp(&other.ready_at)
            .then_with(|| self.entry.id.cmp(&other.entry.id))
    }
}

impl PartialOrd for DelayedEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

struct QueueState {
    ready: BinaryHeap<Entry>,
    delayed: BinaryHeap<Reverse<DelayedEntry>>,
    /// Live sequence per queued id; entries with any other sequence
    /// are stale and skipped on pop.
    live: HashMap<String, u64>,
    next_seq: u64,
    /// Requeue attempts per unit, reset on forget.
    attempts: HashMap<String, u32>,
}

impl QueueState {
    fn assign_seq(&mut self, id: &str) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.live.insert(id.to_string(), seq);
        seq
    }
}

/// Priority queue of pending workload units.
pub struct PlacementQueue {
    state: Mutex<QueueState>,
    notify: Notify,
    shutdown: watch::Receiver<bool>,
    backoff_base: Duration,
    backoff_cap: Duration,
}

impl PlacementQueue {
    pub fn new(
        shutdown: watch::Receiver<bool>,
        backoff_base: Duration,
        backoff_cap: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(QueueState {
                ready: BinaryHeap::new(),
                delayed: BinaryHeap::new(),
                live: HashMap::new(),
                next_seq: 0,
                attempts: HashMap::new(),
            }),
            notify: Notify::new(),
            shutdown,
            backoff_base,
            backoff_cap,
        }
    }

    /// Enqueue a unit for scheduling. Re-pushing an already queued
    /// unit is a no-op: the existing entry (including one sitting in
    /// backoff) keeps its place.
    pub fn push(&self, unit: &WorkloadUnit) {
        {
            let mut state = self.state.lock().unwrap();
            if state.live.contains_key(&unit.id) {
                return;
            }
            let seq = state.assign_seq(&unit.id);
            state.ready.push(Entry {
                priority: unit.priority,
                created_at: unit.created_at,
                id: unit.id.clone(),
                seq,
            });
            debug!(unit = %unit.id, depth = state.live.len(), "queued");
        }
        self.notify.notify_waiters();
    }

    /// Requeue after a failed cycle, delayed by exponential backoff.
    /// Returns the attempt number that was recorded.
    pub fn requeue(&self, unit: &WorkloadUnit, reason: &str) -> u32 {
        let (attempt, delay) = {
            let mut state = self.state.lock().unwrap();
            let attempt = {
                let slot = state.attempts.entry(unit.id.clone()).or_insert(0);
                *slot += 1;
                *slot
            };
            let delay = backoff_delay(self.backoff_base, self.backoff_cap, attempt);
            let seq = state.assign_seq(&unit.id);
            state.delayed.push(Reverse(DelayedEntry {
                ready_at: Instant::now() + delay,
                entry: Entry {
                    priority: unit.priority,
                    created_at: unit.created_at,
                    id: unit.id.clone(),
                    seq,
                },
            }));
            (attempt, delay)
        };
        warn!(
            unit = %unit.id,
            reason,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "requeued with backoff"
        );
        self.notify.notify_waiters();
        attempt
    }

    /// Drop a unit from the queue (observed Bound or Deleted). Its
    /// attempt counter resets.
    pub fn forget(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        state.live.remove(id);
        state.attempts.remove(id);
    }

    /// Requeue attempts recorded for a unit.
    pub fn attempts(&self, id: &str) -> u32 {
        self.state
            .lock()
            .unwrap()
            .attempts
            .get(id)
            .copied()
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.state.lock().unwrap().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait for the next schedulable unit id. Returns `None` once
    /// shutdown is signalled.
    pub async fn pop(&self) -> Option<String> {
        let mut shutdown = self.shutdown.clone();
        loop {
            if *shutdown.borrow() {
                return None;
            }

            let next_ready_at = {
                let mut state = self.state.lock().unwrap();
                let now = Instant::now();

                // Promote delayed entries whose backoff elapsed.
                while let Some(Reverse(delayed)) = state.delayed.peek() {
                    if delayed.ready_at > now {
                        break;
                    }
                    let Reverse(delayed) = state.delayed.pop().unwrap();
                    state.ready.push(delayed.entry);
                }

                // Pop the best live entry, skipping stale ones.
                loop {
                    match state.ready.pop() {
                        Some(entry)
                            if state.live.get(&entry.id) == Some(&entry.seq) =>
                        {
                            state.live.remove(&entry.id);
                            return Some(entry.id);
                        }
                        Some(_) => continue,
                        None => break,
                    }
                }

                state.delayed.peek().map(|Reverse(d)| d.ready_at)
            };

            tokio::select! {
                _ = self.notify.notified() => {}
                _ = sleep_until_or_never(next_ready_at) => {}
                changed = shutdown.changed() => {
                    // A dropped sender counts as shutdown.
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

async fn sleep_until_or_never(deadline: Option<Instant>) {
    match deadline {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

fn backoff_delay(base: Duration, cap: Duration, attempt: u32) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    (base * factor).min(cap)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_api::{BindingState, ResourceVec};

    fn make_unit(id: &str, priority: i64, created_at: u64) -> WorkloadUnit {
        WorkloadUnit {
            id: id.to_string(),
            labels: Default::default(),
            priority_class: "default".to_string(),
            priority,
            requests: ResourceVec::new(100, 100),
            limits: None,
            node_selector: Default::default(),
            node_affinity: None,
            unit_affinity: None,
            unit_anti_affinity: None,
            tolerations: Vec::new(),
            spread_constraints: Vec::new(),
            images: Vec::new(),
            binding: BindingState::Unbound,
            created_at,
            resource_version: 1,
        }
    }

    fn make_queue() -> (PlacementQueue, watch::Sender<bool>) {
        let (tx, rx) = watch::channel(false);
        let queue = PlacementQueue::new(
            rx,
            Duration::from_millis(10),
            Duration::from_millis(100),
        );
        (queue, tx)
    }

    #[tokio::test]
    async fn pops_highest_priority_first() {
        let (queue, _tx) = make_queue();
        queue.push(&make_unit("low", 1, 100));
        queue.push(&make_unit("high", 10, 100));
        queue.push(&make_unit("mid", 5, 100));

        assert_eq!(queue.pop().await.as_deref(), Some("high"));
        assert_eq!(queue.pop().await.as_deref(), Some("mid"));
        assert_eq!(queue.pop().await.as_deref(), Some("low"));
    }

    #[tokio::test]
    async fn equal_priority_pops_oldest_then_smallest_id() {
        let (queue, _tx) = make_queue();
        queue.push(&make_unit("b", 5, 200));
        queue.push(&make_unit("a", 5, 200));
        queue.push(&make_unit("older", 5, 100));

        assert_eq!(queue.pop().await.as_deref(), Some("older"));
        assert_eq!(queue.pop().await.as_deref(), Some("a"));
        assert_eq!(queue.pop().await.as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn forgotten_units_are_not_popped() {
        let (queue, _tx) = make_queue();
        queue.push(&make_unit("keep", 1, 100));
        queue.push(&make_unit("drop", 10, 100));
        queue.forget("drop");

        assert_eq!(queue.pop().await.as_deref(), Some("keep"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn requeue_delays_delivery() {
        let (queue, _tx) = make_queue();
        let unit = make_unit("u1", 5, 100);
        queue.requeue(&unit, "infeasible");

        let start = Instant::now();
        assert_eq!(queue.pop().await.as_deref(), Some("u1"));
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn backoff_grows_and_caps() {
        let base = Duration::from_millis(10);
        let cap = Duration::from_millis(100);
        assert_eq!(backoff_delay(base, cap, 1), Duration::from_millis(10));
        assert_eq!(backoff_delay(base, cap, 2), Duration::from_millis(20));
        assert_eq!(backoff_delay(base, cap, 3), Duration::from_millis(40));
        assert_eq!(backoff_delay(base, cap, 10), cap);
    }

    #[tokio::test]
    async fn attempts_track_requeues_and_reset_on_forget() {
        let (queue, _tx) = make_queue();
        let unit = make_unit("u1", 5, 100);
        assert_eq!(queue.requeue(&unit, "infeasible"), 1);
        assert_eq!(queue.requeue(&unit, "infeasible"), 2);
        assert_eq!(queue.attempts("u1"), 2);

        queue.forget("u1");
        assert_eq!(queue.attempts("u1"), 0);
    }

    #[tokio::test]
    async fn duplicate_pushes_do_not_bypass_requeue_backoff() {
        let (_tx, rx) = watch::channel(false);
        let queue =
            PlacementQueue::new(rx, Duration::from_secs(30), Duration::from_secs(60));
        let unit = make_unit("u1", 5, 100);

        // Added then Modified both push the same pending unit.
        queue.push(&unit);
        queue.push(&unit);
        assert_eq!(queue.pop().await.as_deref(), Some("u1"));

        // The leftover heap entry must not resurface the unit while
        // it sits in backoff.
        queue.requeue(&unit, "infeasible");
        let raced =
            tokio::time::timeout(Duration::from_millis(100), queue.pop()).await;
        assert!(raced.is_err(), "unit delivered before its backoff elapsed");
    }

    #[tokio::test]
    async fn repush_after_forget_delivers_exactly_once() {
        let (queue, _tx) = make_queue();
        let unit = make_unit("u1", 5, 100);
        queue.push(&unit);
        queue.forget("u1");
        queue.push(&unit);

        assert_eq!(queue.pop().await.as_deref(), Some("u1"));
        let raced =
            tokio::time::timeout(Duration::from_millis(50), queue.pop()).await;
        assert!(raced.is_err(), "stale entry delivered a second time");
    }

    #[tokio::test]
    async fn shutdown_unblocks_pop() {
        let (tx, rx) = watch::channel(false);
        let queue = std::sync::Arc::new(PlacementQueue::new(
            rx,
            Duration::from_millis(10),
            Duration::from_millis(100),
        ));

        let popper = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        tx.send(true).unwrap();

        assert_eq!(popper.await.unwrap(), None);
    }

    #[tokio::test]
    async fn delayed_entry_does_not_block_ready_entries() {
        let (tx, rx) = watch::channel(false);
        let queue = PlacementQueue::new(
            rx,
            Duration::from_secs(30),
            Duration::from_secs(60),
        );
        drop(tx);

        queue.requeue(&make_unit("delayed-high", 10, 100), "infeasible");
        queue.push(&make_unit("ready-low", 1, 100));

        // The low-priority ready unit must come out even though a
        // higher-priority unit sits in backoff.
        let popped =
            tokio::time::timeout(Duration::from_millis(200), queue.pop()).await.unwrap();
        assert_eq!(popped.as_deref(), Some("ready-low"));
    }
}
