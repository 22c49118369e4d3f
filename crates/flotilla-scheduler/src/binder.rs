//! Binder — commits placement decisions through conditional writes
//! and tracks them in an optimistic allocation overlay.
//!
//! A successful bind immediately charges the unit's requests against
//! the target node in the overlay, so the very next cycle sees the
//! capacity as taken even though the watch feed has not caught up.
//! The delta is dropped once the authoritative Bound event arrives
//! (the snapshot then carries the allocation) or rolled back when no
//! event shows up within the confirmation window.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info, warn};

use flotilla_api::{
    BindingState, Object, ObjectKind, ResourceVec, StateBackend, WorkloadUnit, WriteOutcome,
};
use flotilla_placement::EvictionPlan;

use crate::error::{SchedulerError, SchedulerResult};

struct PendingDelta {
    unit_id: String,
    node_id: String,
    delta: ResourceVec,
    expires_at: Instant,
}

/// Unconfirmed allocation deltas, keyed by unit.
///
/// Feeds the filter pipeline's allocated figure between a committed
/// bind and the matching watch event.
#[derive(Default)]
pub struct AllocationOverlay {
    pending: Mutex<Vec<PendingDelta>>,
}

impl AllocationOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    /// Charge a unit's requests against a node until confirmed.
    pub fn charge(&self, unit_id: &str, node_id: &str, delta: ResourceVec, ttl: Duration) {
        let mut pending = self.pending.lock().unwrap();
        pending.retain(|p| p.unit_id != unit_id);
        pending.push(PendingDelta {
            unit_id: unit_id.to_string(),
            node_id: node_id.to_string(),
            delta,
            expires_at: Instant::now() + ttl,
        });
    }

    /// Drop a unit's delta: the authoritative event arrived (the
    /// snapshot now carries the allocation) or the unit went away.
    pub fn release(&self, unit_id: &str) {
        self.pending.lock().unwrap().retain(|p| p.unit_id != unit_id);
    }

    /// Roll back deltas whose confirmation window elapsed. Returns
    /// the ids of the units rolled back.
    pub fn expire(&self) -> Vec<String> {
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        let mut expired = Vec::new();
        pending.retain(|p| {
            if p.expires_at <= now {
                expired.push(p.unit_id.clone());
                false
            } else {
                true
            }
        });
        for unit in &expired {
            warn!(unit = %unit, "overlay delta expired unconfirmed, rolled back");
        }
        expired
    }

    /// Live per-node deltas, in the shape the cluster view consumes.
    pub fn node_deltas(&self) -> HashMap<String, ResourceVec> {
        let now = Instant::now();
        let mut deltas: HashMap<String, ResourceVec> = HashMap::new();
        for p in self.pending.lock().unwrap().iter() {
            if p.expires_at > now {
                let entry = deltas.entry(p.node_id.clone()).or_default();
                *entry = entry.add(&p.delta);
            }
        }
        deltas
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}

/// Outcome of a bind attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BindOutcome {
    /// Bind committed at this resourceVersion.
    Bound(u64),
    /// The unit moved since the cycle's snapshot; drop the cycle.
    Conflict,
    /// Admission refused the bind.
    Rejected { reason: String, retryable: bool },
}

/// Executes placement decisions against the state backend.
pub struct Binder<B: StateBackend> {
    backend: B,
    deadline: Duration,
    confirm_ttl: Duration,
}

impl<B: StateBackend> Binder<B> {
    pub fn new(backend: B, deadline: Duration, confirm_ttl: Duration) -> Self {
        Self {
            backend,
            deadline,
            confirm_ttl,
        }
    }

    /// Conditionally write the binding, keyed on the version the
    /// cycle observed. On commit the overlay is charged immediately.
    pub async fn bind(
        &self,
        unit: &WorkloadUnit,
        node_id: &str,
        overlay: &AllocationOverlay,
    ) -> SchedulerResult<BindOutcome> {
        let mut bound = unit.clone();
        bound.binding = BindingState::Bound {
            node: node_id.to_string(),
        };

        let write = self
            .backend
            .conditional_write(Object::WorkloadUnit(bound), unit.resource_version);
        let outcome = tokio::time::timeout(self.deadline, write)
            .await
            .map_err(|_| SchedulerError::BindTimeout(unit.id.clone()))??;

        match outcome {
            WriteOutcome::Committed(version) => {
                overlay.charge(&unit.id, node_id, unit.requests.clone(), self.confirm_ttl);
                info!(unit = %unit.id, node = %node_id, version, "bound");
                Ok(BindOutcome::Bound(version))
            }
            WriteOutcome::Conflict => {
                debug!(unit = %unit.id, "bind conflict");
                Ok(BindOutcome::Conflict)
            }
            WriteOutcome::Rejected { reason, retryable } => {
                warn!(unit = %unit.id, %reason, retryable, "bind rejected");
                Ok(BindOutcome::Rejected { reason, retryable })
            }
        }
    }

    /// Mark a unit Failed with a terminal reason.
    pub async fn fail(
        &self,
        unit: &WorkloadUnit,
        reason: &str,
    ) -> SchedulerResult<WriteOutcome> {
        let mut failed = unit.clone();
        failed.binding = BindingState::Failed {
            reason: reason.to_string(),
        };
        Ok(self
            .backend
            .conditional_write(Object::WorkloadUnit(failed), unit.resource_version)
            .await?)
    }

    /// Issue graceful deletions for every victim in an eviction plan.
    /// Conflicted victims are skipped; a fresh snapshot re-plans.
    pub async fn evict(
        &self,
        plan: &EvictionPlan,
        victims: &[&WorkloadUnit],
    ) -> SchedulerResult<usize> {
        let grace = Duration::from_secs(plan.grace_seconds);
        let mut evicted = 0;
        for victim in victims {
            let outcome = self
                .backend
                .delete_with_grace(
                    ObjectKind::WorkloadUnit,
                    &victim.id,
                    grace,
                    victim.resource_version,
                )
                .await?;
            match outcome {
                WriteOutcome::Committed(_) => {
                    info!(victim = %victim.id, node = %plan.node_id, "evicted");
                    evicted += 1;
                }
                WriteOutcome::Conflict => {
                    debug!(victim = %victim.id, "eviction conflict, skipped");
                }
                WriteOutcome::Rejected { reason, .. } => {
                    warn!(victim = %victim.id, %reason, "eviction rejected");
                }
            }
        }
        Ok(evicted)
    }
}
