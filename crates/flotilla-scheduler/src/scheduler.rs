//! Scheduling loop — pops pending units and drives them to a bind.
//!
//! One cycle owns one unit: snapshot the cluster, filter, score,
//! bind. Infeasible units are recorded Unschedulable, preempted for
//! when their priority class permits, and requeued with backoff.
//! Watch events feed the queue; units observed Bound or Deleted are
//! forgotten and their overlay allocation released.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use flotilla_api::{
    BindingState, EventKind, Object, ObjectKind, PreemptionPolicy, StateBackend, WatchEvent,
    WorkloadUnit,
};
use flotilla_informer::Informer;
use flotilla_placement::{ClusterView, feasible_nodes, plan_preemption, rank_nodes};

use crate::binder::{AllocationOverlay, BindOutcome, Binder};
use crate::config::SchedulerConfig;
use crate::error::SchedulerResult;
use crate::queue::PlacementQueue;

/// What one scheduling cycle did with its unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Bound to this node.
    Bound { node: String },
    /// Unit vanished or is no longer pending; nothing done.
    Skipped,
    /// Lost the conditional write; a fresh watch event re-drives.
    Conflict,
    /// No feasible node and no preemption; requeued.
    Unschedulable,
    /// Victims evicted to free capacity; unit requeued until the
    /// freed capacity is observed.
    Preempted { node: String, victims: Vec<String> },
    /// Requeued after a retryable rejection.
    Requeued,
    /// Terminal failure recorded on the unit.
    Failed { reason: String },
}

/// The scheduling loop over one informer and one state backend.
pub struct Scheduler<B: StateBackend> {
    informer: Arc<Informer<B>>,
    queue: Arc<PlacementQueue>,
    overlay: Arc<AllocationOverlay>,
    binder: Binder<B>,
    config: SchedulerConfig,
    /// Non-retryable admission denials per unit. Counted separately
    /// from requeue attempts: infeasibility requeues must not eat
    /// into the rejection budget.
    rejections: Mutex<HashMap<String, u32>>,
    shutdown_tx: watch::Sender<bool>,
}

/// Kinds the scheduler mirrors through its informer.
pub const WATCHED_KINDS: [ObjectKind; 4] = [
    ObjectKind::Node,
    ObjectKind::WorkloadUnit,
    ObjectKind::PriorityClass,
    ObjectKind::DisruptionBudget,
];

impl<B: StateBackend> Scheduler<B> {
    pub fn new(backend: B, informer: Arc<Informer<B>>, config: SchedulerConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let queue = Arc::new(PlacementQueue::new(
            shutdown_rx,
            Duration::from_millis(config.backoff_base_ms),
            Duration::from_millis(config.backoff_cap_ms),
        ));
        let binder = Binder::new(backend, config.bind_deadline(), config.overlay_confirm());
        Self {
            informer,
            queue,
            overlay: Arc::new(AllocationOverlay::new()),
            binder,
            config,
            rejections: Mutex::new(HashMap::new()),
            shutdown_tx,
        }
    }

    pub fn queue(&self) -> &PlacementQueue {
        &self.queue
    }

    pub fn overlay(&self) -> &AllocationOverlay {
        &self.overlay
    }

    /// Stop the loop; in-flight cycles finish, nothing new starts.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("scheduler shutting down");
    }

    /// Run until shutdown. Consumes unit watch events to feed the
    /// queue and pops one unit per cycle.
    pub async fn run(&self) {
        let mut events = self.informer.subscribe(ObjectKind::WorkloadUnit, 256).await;
        let mut expire_tick =
            tokio::time::interval(self.config.overlay_confirm().max(Duration::from_millis(100)));
        let mut shutdown = self.shutdown_tx.subscribe();

        // Seed from the current snapshot so units created before this
        // instance started still get scheduled.
        for unit in self.informer.snapshot(ObjectKind::WorkloadUnit).await.units() {
            if matches!(unit.binding, BindingState::Unbound) {
                self.queue.push(unit);
            }
        }

        loop {
            tokio::select! {
                maybe = events.recv() => match maybe {
                    Some(event) => self.observe(&event),
                    None => {
                        // Subscriber dropped by the informer (slow
                        // consumer); re-register and resync.
                        events = self.informer.subscribe(ObjectKind::WorkloadUnit, 256).await;
                        for unit in self.informer.snapshot(ObjectKind::WorkloadUnit).await.units() {
                            if matches!(unit.binding, BindingState::Unbound) {
                                self.queue.push(unit);
                            }
                        }
                    }
                },
                popped = self.queue.pop() => match popped {
                    Some(unit_id) => self.run_cycle(&unit_id).await,
                    None => break,
                },
                _ = expire_tick.tick() => {
                    self.overlay.expire();
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    async fn run_cycle(&self, unit_id: &str) {
        match self.schedule_one(unit_id).await {
            Ok(outcome) => debug!(unit = %unit_id, ?outcome, "cycle finished"),
            Err(e) if e.is_transient() => {
                let snapshot = self.informer.snapshot(ObjectKind::WorkloadUnit).await;
                if let Some(Object::WorkloadUnit(unit)) = snapshot.get(unit_id) {
                    self.queue.requeue(unit, "transient error");
                } else {
                    warn!(unit = %unit_id, error = %e, "transient error, unit gone");
                }
            }
            Err(e) => error!(unit = %unit_id, error = %e, "cycle failed"),
        }
    }

    /// One full scheduling cycle for one unit.
    pub async fn schedule_one(&self, unit_id: &str) -> SchedulerResult<CycleOutcome> {
        let units = self.informer.snapshot(ObjectKind::WorkloadUnit).await;
        let unit = match units.get(unit_id) {
            Some(Object::WorkloadUnit(u)) if matches!(u.binding, BindingState::Unbound) => {
                u.clone()
            }
            _ => {
                debug!(unit = %unit_id, "no longer pending, skipped");
                return Ok(CycleOutcome::Skipped);
            }
        };

        let nodes = self.informer.snapshot(ObjectKind::Node).await;
        let classes = self.informer.snapshot(ObjectKind::PriorityClass).await;
        let budgets = self.informer.snapshot(ObjectKind::DisruptionBudget).await;

        let deltas = self.overlay.node_deltas();
        let view = ClusterView::new(nodes.nodes(), units.units(), &deltas);

        let filtered = feasible_nodes(&unit, &view);
        if !filtered.feasible.is_empty() {
            let ranked = rank_nodes(&unit, &filtered.feasible, &view, &self.config.weights);
            let best = &ranked[0];
            return self.commit(&unit, &best.node_id).await;
        }

        let reasons = filtered.failure_summary();
        warn!(
            unit = %unit.id,
            nodes = view.nodes.len(),
            ?reasons,
            "unschedulable"
        );

        let policy = classes
            .priority_classes()
            .into_iter()
            .find(|c| c.name == unit.priority_class)
            .map(|c| c.preemption)
            .unwrap_or(PreemptionPolicy::PreemptLower);

        if let Some(mut plan) = plan_preemption(&unit, &view, &budgets.budgets(), policy) {
            plan.grace_seconds = self.config.eviction_grace_secs;
            let victims: Vec<&WorkloadUnit> = view
                .units
                .iter()
                .copied()
                .filter(|u| plan.victims.contains(&u.id))
                .collect();
            let evicted = self.binder.evict(&plan, &victims).await?;
            info!(
                unit = %unit.id,
                node = %plan.node_id,
                evicted,
                "preempted lower-priority units"
            );
            self.queue.requeue(&unit, "awaiting preempted capacity");
            return Ok(CycleOutcome::Preempted {
                node: plan.node_id,
                victims: plan.victims,
            });
        }

        self.queue.requeue(&unit, "no feasible node");
        Ok(CycleOutcome::Unschedulable)
    }

    async fn commit(&self, unit: &WorkloadUnit, node_id: &str) -> SchedulerResult<CycleOutcome> {
        match self.binder.bind(unit, node_id, &self.overlay).await? {
            BindOutcome::Bound(_) => {
                self.queue.forget(&unit.id);
                self.rejections.lock().unwrap().remove(&unit.id);
                Ok(CycleOutcome::Bound {
                    node: node_id.to_string(),
                })
            }
            BindOutcome::Conflict => Ok(CycleOutcome::Conflict),
            BindOutcome::Rejected { reason, retryable } => {
                if !retryable {
                    let denials = {
                        let mut rejections = self.rejections.lock().unwrap();
                        let slot = rejections.entry(unit.id.clone()).or_insert(0);
                        *slot += 1;
                        *slot
                    };
                    if denials >= self.config.retry_budget {
                        self.queue.forget(&unit.id);
                        self.rejections.lock().unwrap().remove(&unit.id);
                        self.binder.fail(unit, &reason).await?;
                        warn!(
                            unit = %unit.id,
                            %reason,
                            denials,
                            "failed after rejection budget"
                        );
                        return Ok(CycleOutcome::Failed { reason });
                    }
                }
                self.queue.requeue(unit, &reason);
                Ok(CycleOutcome::Requeued)
            }
        }
    }

    /// Feed one watch event into the queue and overlay.
    fn observe(&self, event: &WatchEvent) {
        match event.kind {
            EventKind::Added | EventKind::Modified => {
                if let Some(Object::WorkloadUnit(unit)) = &event.object {
                    match &unit.binding {
                        BindingState::Unbound => self.queue.push(unit),
                        BindingState::Bound { .. } => {
                            // Authoritative allocation observed; the
                            // overlay delta is no longer needed.
                            self.queue.forget(&unit.id);
                            self.overlay.release(&unit.id);
                        }
                        BindingState::Failed { .. } => self.queue.forget(&unit.id),
                    }
                }
            }
            EventKind::Deleted => {
                if let Some(object) = &event.object {
                    self.queue.forget(object.id());
                    self.overlay.release(object.id());
                }
            }
            EventKind::Bookmark => {}
        }
    }
}
