//! Core cluster objects: nodes, workload units, priority classes,
//! and disruption budgets.
//!
//! All objects carry a `resource_version` assigned by the state
//! backend on every committed mutation; the placement core uses it
//! for optimistic concurrency and never invents versions itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::resources::ResourceVec;
use crate::selector::LabelSelector;

/// Unique identifier for a node.
pub type NodeId = String;

/// Unique identifier for a workload unit.
pub type UnitId = String;

/// Well-known topology label keys.
pub const TOPOLOGY_ZONE: &str = "topology.flotilla.io/zone";
pub const TOPOLOGY_REGION: &str = "topology.flotilla.io/region";
pub const TOPOLOGY_HOSTNAME: &str = "topology.flotilla.io/hostname";

/// Well-known toleration keys for node pressure conditions.
pub const PRESSURE_MEMORY: &str = "node.flotilla.io/memory-pressure";
pub const PRESSURE_DISK: &str = "node.flotilla.io/disk-pressure";
pub const PRESSURE_PID: &str = "node.flotilla.io/pid-pressure";

// ── Node ──────────────────────────────────────────────────────────

/// A compute host with finite capacity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub taints: Vec<Taint>,
    /// Resources available for placement (capacity minus system reserve).
    pub allocatable: ResourceVec,
    pub conditions: NodeConditions,
    /// Image names already present on the node.
    #[serde(default)]
    pub images: Vec<String>,
    pub resource_version: u64,
}

impl Node {
    /// The node's topology domain for a given topology key, if labeled.
    pub fn topology_domain(&self, key: &str) -> Option<&str> {
        self.labels.get(key).map(String::as_str)
    }
}

/// A node-side exclusion marker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Taint {
    pub key: String,
    #[serde(default)]
    pub value: String,
    pub effect: TaintEffect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaintEffect {
    NoSchedule,
    PreferNoSchedule,
    NoExecute,
}

/// A unit-side override permitting scheduling despite a taint.
///
/// `None` fields are wildcards: a toleration with no key tolerates
/// every taint with a matching effect (or any effect if that is also
/// `None`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub effect: Option<TaintEffect>,
}

impl Toleration {
    /// Toleration of a specific key with any value and any effect.
    pub fn for_key(key: impl Into<String>) -> Self {
        Self {
            key: Some(key.into()),
            value: None,
            effect: None,
        }
    }

    pub fn tolerates(&self, taint: &Taint) -> bool {
        if let Some(key) = &self.key {
            if key != &taint.key {
                return false;
            }
        }
        if let Some(value) = &self.value {
            if value != &taint.value {
                return false;
            }
        }
        if let Some(effect) = self.effect {
            if effect != taint.effect {
                return false;
            }
        }
        true
    }
}

/// Boolean node conditions with their last transition time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConditions {
    pub ready: Condition,
    pub memory_pressure: Condition,
    pub disk_pressure: Condition,
    pub pid_pressure: Condition,
}

impl NodeConditions {
    /// Ready, no pressure.
    pub fn healthy(at: u64) -> Self {
        Self {
            ready: Condition::active(at),
            memory_pressure: Condition::inactive(at),
            disk_pressure: Condition::inactive(at),
            pid_pressure: Condition::inactive(at),
        }
    }

    /// Active pressure conditions paired with the toleration key that
    /// would excuse each.
    pub fn active_pressures(&self) -> Vec<&'static str> {
        let mut out = Vec::new();
        if self.memory_pressure.active {
            out.push(PRESSURE_MEMORY);
        }
        if self.disk_pressure.active {
            out.push(PRESSURE_DISK);
        }
        if self.pid_pressure.active {
            out.push(PRESSURE_PID);
        }
        out
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    pub active: bool,
    /// Unix timestamp (seconds) of the last state change.
    pub last_transition: u64,
}

impl Condition {
    pub fn active(at: u64) -> Self {
        Self {
            active: true,
            last_transition: at,
        }
    }

    pub fn inactive(at: u64) -> Self {
        Self {
            active: false,
            last_transition: at,
        }
    }
}

// ── Workload unit ─────────────────────────────────────────────────

/// The schedulable entity: resource requests plus placement constraints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadUnit {
    pub id: UnitId,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    /// Name of the priority class; resolved value cached below.
    pub priority_class: String,
    pub priority: i64,
    pub requests: ResourceVec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<ResourceVec>,
    /// Exact-match node label constraints.
    #[serde(default)]
    pub node_selector: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_affinity: Option<UnitAffinity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit_anti_affinity: Option<UnitAffinity>,
    #[serde(default)]
    pub tolerations: Vec<Toleration>,
    #[serde(default)]
    pub spread_constraints: Vec<TopologySpreadConstraint>,
    /// Container images this unit runs (for image-locality scoring).
    #[serde(default)]
    pub images: Vec<String>,
    pub binding: BindingState,
    /// Unix timestamp (seconds) when the unit was created.
    pub created_at: u64,
    pub resource_version: u64,
}

impl WorkloadUnit {
    pub fn is_bound(&self) -> bool {
        matches!(self.binding, BindingState::Bound { .. })
    }

    pub fn bound_node(&self) -> Option<&str> {
        match &self.binding {
            BindingState::Bound { node } => Some(node),
            _ => None,
        }
    }

    /// Total order over scheduling precedence: higher priority first,
    /// then earlier creation, then lexical id. Deterministic for
    /// identical inputs.
    pub fn precedes(&self, other: &Self) -> bool {
        (self.priority, std::cmp::Reverse(self.created_at), std::cmp::Reverse(&self.id))
            > (other.priority, std::cmp::Reverse(other.created_at), std::cmp::Reverse(&other.id))
    }
}

/// Binding state of a workload unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum BindingState {
    Unbound,
    Bound { node: NodeId },
    Failed { reason: String },
}

/// Node affinity: required terms are ORed hard constraints; preferred
/// terms contribute weighted score.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<LabelSelector>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<WeightedSelector>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedSelector {
    pub selector: LabelSelector,
    /// Weight in 1..=100.
    pub weight: u32,
}

/// Unit (anti-)affinity: co-location constraints against other units
/// within a topology domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAffinity {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub required: Vec<UnitAffinityTerm>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub preferred: Vec<WeightedUnitAffinityTerm>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitAffinityTerm {
    /// Selects the peer units the constraint refers to.
    pub selector: LabelSelector,
    /// Topology label key defining the co-location domain.
    pub topology_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedUnitAffinityTerm {
    pub term: UnitAffinityTerm,
    pub weight: u32,
}

/// Spread constraint: penalize topology domains whose matching-unit
/// count exceeds the minimum by more than `max_skew`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopologySpreadConstraint {
    pub topology_key: String,
    pub max_skew: u32,
    pub selector: LabelSelector,
}

// ── Priority class ────────────────────────────────────────────────

/// Named priority level with a preemption policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriorityClass {
    pub name: String,
    pub value: i64,
    pub preemption: PreemptionPolicy,
    pub resource_version: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreemptionPolicy {
    /// May evict strictly-lower-priority units.
    PreemptLower,
    /// Never triggers preemption.
    Never,
}

// ── Disruption budget ─────────────────────────────────────────────

/// Limits concurrent voluntary disruptions for a group of units.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisruptionBudget {
    pub id: String,
    /// Units this budget covers.
    pub selector: LabelSelector,
    /// Maximum covered units that may be voluntarily disrupted at once.
    pub max_unavailable: u32,
    /// Covered units already disrupted (evicted, not yet replaced).
    pub currently_unavailable: u32,
    pub resource_version: u64,
}

impl DisruptionBudget {
    /// Disruptions still allowed under this budget.
    pub fn remaining(&self) -> u32 {
        self.max_unavailable.saturating_sub(self.currently_unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit(id: &str, priority: i64, created_at: u64) -> WorkloadUnit {
        WorkloadUnit {
            id: id.to_string(),
            labels: BTreeMap::new(),
            priority_class: "default".to_string(),
            priority,
            requests: ResourceVec::new(100, 100),
            limits: None,
            node_selector: BTreeMap::new(),
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

    #[test]
    fn precedence_orders_by_priority_then_age_then_id() {
        let high = unit("b", 10, 200);
        let low = unit("a", 1, 100);
        assert!(high.precedes(&low));

        let older = unit("z", 5, 100);
        let newer = unit("a", 5, 200);
        assert!(older.precedes(&newer));

        let first = unit("a", 5, 100);
        let second = unit("b", 5, 100);
        assert!(first.precedes(&second));
    }

    #[test]
    fn toleration_wildcard_and_exact() {
        let taint = Taint {
            key: "dedicated".to_string(),
            value: "batch".to_string(),
            effect: TaintEffect::NoSchedule,
        };

        assert!(Toleration::default().tolerates(&taint));
        assert!(Toleration::for_key("dedicated").tolerates(&taint));
        assert!(!Toleration::for_key("other").tolerates(&taint));

        let exact = Toleration {
            key: Some("dedicated".to_string()),
            value: Some("web".to_string()),
            effect: None,
        };
        assert!(!exact.tolerates(&taint));

        let wrong_effect = Toleration {
            key: Some("dedicated".to_string()),
            value: None,
            effect: Some(TaintEffect::NoExecute),
        };
        assert!(!wrong_effect.tolerates(&taint));
    }

    #[test]
    fn active_pressures_reported_with_toleration_keys() {
        let mut conditions = NodeConditions::healthy(1000);
        conditions.disk_pressure = Condition::active(1001);
        assert_eq!(conditions.active_pressures(), vec![PRESSURE_DISK]);
    }

    #[test]
    fn budget_remaining_saturates() {
        let budget = DisruptionBudget {
            id: "b1".to_string(),
            selector: LabelSelector::default(),
            max_unavailable: 1,
            currently_unavailable: 2,
            resource_version: 1,
        };
        assert_eq!(budget.remaining(), 0);
    }
}
