//! Filter pipeline — ordered boolean predicates over (unit, node).
//!
//! A node is feasible iff every predicate passes. Predicates run in
//! increasing cost order and each node short-circuits on its first
//! violation, so the expensive unit-affinity counting only runs for
//! nodes that already pass everything cheaper. Evaluation is
//! deterministic: identical snapshots yield identical feasible sets.

use std::collections::{BTreeMap, HashSet};

use serde::Serialize;
use tracing::debug;

use flotilla_api::{
    LabelSelector, Node, NodeId, TaintEffect, UnitAffinityTerm, WorkloadUnit,
};

use crate::view::ClusterView;

/// Predicate identifiers, recorded when a node is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Predicate {
    NodeNotReady,
    NodeUnderPressure,
    UntoleratedTaint,
    InsufficientCapacity,
    NodeSelectorMismatch,
    NodeAffinityMismatch,
    UnitAffinityUnsatisfied,
    UnitAntiAffinityViolated,
}

impl Predicate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Predicate::NodeNotReady => "node_not_ready",
            Predicate::NodeUnderPressure => "node_under_pressure",
            Predicate::UntoleratedTaint => "untolerated_taint",
            Predicate::InsufficientCapacity => "insufficient_capacity",
            Predicate::NodeSelectorMismatch => "node_selector_mismatch",
            Predicate::NodeAffinityMismatch => "node_affinity_mismatch",
            Predicate::UnitAffinityUnsatisfied => "unit_affinity_unsatisfied",
            Predicate::UnitAntiAffinityViolated => "unit_anti_affinity_violated",
        }
    }
}

/// Outcome of running the pipeline over every node in the view.
#[derive(Debug)]
pub struct FilterResult<'a> {
    /// Nodes passing every predicate, in identity order.
    pub feasible: Vec<&'a Node>,
    /// First failing predicate per rejected node.
    pub failures: BTreeMap<NodeId, Predicate>,
}

impl FilterResult<'_> {
    /// Distinct failing predicates, for Unschedulable status reporting.
    pub fn failure_summary(&self) -> Vec<Predicate> {
        let mut seen = Vec::new();
        for predicate in self.failures.values() {
            if !seen.contains(predicate) {
                seen.push(*predicate);
            }
        }
        seen
    }
}

/// Evaluate the pipeline for one unit across all nodes in the view.
pub fn feasible_nodes<'a>(unit: &WorkloadUnit, view: &ClusterView<'a>) -> FilterResult<'a> {
    let mut feasible = Vec::new();
    let mut failures = BTreeMap::new();

    for node in &view.nodes {
        match check_node(unit, node, view, &HashSet::new()) {
            None => feasible.push(*node),
            Some(predicate) => {
                failures.insert(node.id.clone(), predicate);
            }
        }
    }

    debug!(
        unit = %unit.id,
        feasible = feasible.len(),
        rejected = failures.len(),
        "filter pipeline evaluated"
    );
    FilterResult { feasible, failures }
}

/// Run every predicate for one (unit, node) pair, ignoring units in
/// `excluded` (used by preemption to test victim removal). Returns the
/// first failing predicate, or None if the node is feasible.
pub(crate) fn check_node(
    unit: &WorkloadUnit,
    node: &Node,
    view: &ClusterView<'_>,
    excluded: &HashSet<&str>,
) -> Option<Predicate> {
    if !node.conditions.ready.active {
        return Some(Predicate::NodeNotReady);
    }
    for pressure_key in node.conditions.active_pressures() {
        let tolerated = unit
            .tolerations
            .iter()
            .any(|t| t.key.as_deref() == Some(pressure_key) || t.key.is_none());
        if !tolerated {
            return Some(Predicate::NodeUnderPressure);
        }
    }

    for taint in &node.taints {
        if taint.effect == TaintEffect::PreferNoSchedule {
            // Soft: handled by scoring.
            continue;
        }
        if !unit.tolerations.iter().any(|t| t.tolerates(taint)) {
            return Some(Predicate::UntoleratedTaint);
        }
    }

    let free = free_excluding(node, view, excluded);
    if !unit.requests.fits_within(&free) {
        return Some(Predicate::InsufficientCapacity);
    }

    for (key, value) in &unit.node_selector {
        if node.labels.get(key) != Some(value) {
            return Some(Predicate::NodeSelectorMismatch);
        }
    }

    if let Some(affinity) = &unit.node_affinity {
        if !affinity.required.is_empty()
            && !affinity.required.iter().any(|sel| sel.matches(&node.labels))
        {
            return Some(Predicate::NodeAffinityMismatch);
        }
    }

    if let Some(affinity) = &unit.unit_affinity {
        for term in &affinity.required {
            if !affinity_term_satisfied(unit, node, term, view, excluded) {
                return Some(Predicate::UnitAffinityUnsatisfied);
            }
        }
    }
    if let Some(anti) = &unit.unit_anti_affinity {
        for term in &anti.required {
            if anti_affinity_term_violated(unit, node, term, view, excluded) {
                return Some(Predicate::UnitAntiAffinityViolated);
            }
        }
    }

    None
}

/// Free capacity on a node, ignoring the requests of excluded units.
fn free_excluding(
    node: &Node,
    view: &ClusterView<'_>,
    excluded: &HashSet<&str>,
) -> flotilla_api::ResourceVec {
    let mut free = view.free_on(node);
    for unit in view.bound_units_on(&node.id) {
        if excluded.contains(unit.id.as_str()) {
            free = free.add(&unit.requests);
        }
    }
    free
}

/// Count peers matching a selector that are bound within the given
/// topology domain, excluding the pending unit itself and any
/// hypothetically removed units. Short-circuits at `limit`.
fn count_peers_in_domain(
    selector: &LabelSelector,
    topology_key: &str,
    domain: &str,
    pending_id: &str,
    view: &ClusterView<'_>,
    excluded: &HashSet<&str>,
    limit: usize,
) -> usize {
    let mut count = 0;
    for peer in &view.units {
        if peer.id == pending_id || excluded.contains(peer.id.as_str()) {
            continue;
        }
        if !selector.matches(&peer.labels) {
            continue;
        }
        if view.domain_of(peer, topology_key) == Some(domain) {
            count += 1;
            if count >= limit {
                break;
            }
        }
    }
    count
}

/// A required affinity term holds if at least one matching peer is
/// bound in this node's topology domain. A node without the topology
/// label can never satisfy the term.
fn affinity_term_satisfied(
    unit: &WorkloadUnit,
    node: &Node,
    term: &UnitAffinityTerm,
    view: &ClusterView<'_>,
    excluded: &HashSet<&str>,
) -> bool {
    let Some(domain) = node.topology_domain(&term.topology_key) else {
        return false;
    };
    count_peers_in_domain(
        &term.selector,
        &term.topology_key,
        domain,
        &unit.id,
        view,
        excluded,
        1,
    ) > 0
}

/// A required anti-affinity term is violated if any matching peer is
/// bound in this node's topology domain. Nodes without the topology
/// label cannot violate the term.
fn anti_affinity_term_violated(
    unit: &WorkloadUnit,
    node: &Node,
    term: &UnitAffinityTerm,
    view: &ClusterView<'_>,
    excluded: &HashSet<&str>,
) -> bool {
    let Some(domain) = node.topology_domain(&term.topology_key) else {
        return false;
    };
    count_peers_in_domain(
        &term.selector,
        &term.topology_key,
        domain,
        &unit.id,
        view,
        excluded,
        1,
    ) > 0
}
