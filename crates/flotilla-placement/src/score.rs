//! Score pipeline — weighted ranking of feasible nodes.
//!
//! Each plugin maps a (unit, node, view) triple into [0, 100]; the
//! final score is the weighted sum. Ranking is descending by score
//! with ties broken by node identity ascending, which makes placement
//! reproducible under identical inputs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use flotilla_api::{Node, TaintEffect, WorkloadUnit};

use crate::view::ClusterView;

/// Weights for the scoring plugins.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScoreWeights {
    /// Prefer nodes with more headroom after placement.
    pub headroom: f64,
    /// Prefer balanced utilization across resource dimensions.
    pub balance: f64,
    /// Prefer nodes already holding the unit's images.
    pub image_locality: f64,
    /// Honor preferred affinity/anti-affinity and soft taints.
    pub affinity: f64,
    /// Penalize topology domains above the allowed skew.
    pub spread: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            headroom: 0.3,
            balance: 0.2,
            image_locality: 0.1,
            affinity: 0.25,
            spread: 0.15,
        }
    }
}

/// Scored result for one node.
#[derive(Debug, Clone)]
pub struct NodeScore {
    pub node_id: String,
    /// Weighted composite, 0.0..=100.0.
    pub score: f64,
    pub breakdown: ScoreBreakdown,
}

/// Individual plugin scores, for debugging and observability.
#[derive(Debug, Clone)]
pub struct ScoreBreakdown {
    pub headroom: f64,
    pub balance: f64,
    pub image_locality: f64,
    pub affinity: f64,
    pub spread: f64,
}

/// Score one feasible node for the given unit.
pub fn score_node(
    unit: &WorkloadUnit,
    node: &Node,
    view: &ClusterView<'_>,
    weights: &ScoreWeights,
) -> NodeScore {
    let after = view.allocated(&node.id).add(&unit.requests);
    let ratios = node.allocatable.utilization_of(&after);

    // Headroom: mean free fraction after placement.
    let headroom = if ratios.is_empty() {
        50.0
    } else {
        let mean_used: f64 = ratios.iter().sum::<f64>() / ratios.len() as f64;
        ((1.0 - mean_used).max(0.0)) * 100.0
    };

    // Balance: penalize skew between the most and least utilized
    // dimension after placement.
    let balance = if ratios.len() < 2 {
        50.0
    } else {
        let max = ratios.iter().cloned().fold(f64::MIN, f64::max);
        let min = ratios.iter().cloned().fold(f64::MAX, f64::min);
        ((1.0 - (max - min)).max(0.0)) * 100.0
    };

    let image_locality = image_locality_score(unit, node);
    let affinity = affinity_score(unit, node, view);
    let spread = spread_score(unit, node, view);

    let score = weights.headroom * headroom
        + weights.balance * balance
        + weights.image_locality * image_locality
        + weights.affinity * affinity
        + weights.spread * spread;

    NodeScore {
        node_id: node.id.clone(),
        score,
        breakdown: ScoreBreakdown {
            headroom,
            balance,
            image_locality,
            affinity,
            spread,
        },
    }
}

/// Score and rank all feasible nodes, best first.
pub fn rank_nodes(
    unit: &WorkloadUnit,
    feasible: &[&Node],
    view: &ClusterView<'_>,
    weights: &ScoreWeights,
) -> Vec<NodeScore> {
    let mut scores: Vec<NodeScore> = feasible
        .iter()
        .map(|node| score_node(unit, node, view, weights))
        .collect();

    scores.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.node_id.cmp(&b.node_id))
    });

    if let Some(best) = scores.first() {
        debug!(unit = %unit.id, node = %best.node_id, score = best.score, "ranked nodes");
    }
    scores
}

/// Fraction of the unit's images already present on the node.
fn image_locality_score(unit: &WorkloadUnit, node: &Node) -> f64 {
    if unit.images.is_empty() {
        return 50.0;
    }
    let present = unit
        .images
        .iter()
        .filter(|image| node.images.contains(image))
        .count();
    (present as f64 / unit.images.len() as f64) * 100.0
}

/// Weighted fraction of satisfied soft preferences: preferred node
/// affinity, preferred unit affinity (peers in domain), preferred
/// anti-affinity (no peers in domain). Untolerated PreferNoSchedule
/// taints subtract a flat penalty.
fn affinity_score(unit: &WorkloadUnit, node: &Node, view: &ClusterView<'_>) -> f64 {
    let mut total_weight = 0u64;
    let mut satisfied_weight = 0u64;

    if let Some(affinity) = &unit.node_affinity {
        for preferred in &affinity.preferred {
            total_weight += u64::from(preferred.weight);
            if preferred.selector.matches(&node.labels) {
                satisfied_weight += u64::from(preferred.weight);
            }
        }
    }
    if let Some(affinity) = &unit.unit_affinity {
        for preferred in &affinity.preferred {
            total_weight += u64::from(preferred.weight);
            if peers_in_node_domain(unit, node, &preferred.term, view) {
                satisfied_weight += u64::from(preferred.weight);
            }
        }
    }
    if let Some(anti) = &unit.unit_anti_affinity {
        for preferred in &anti.preferred {
            total_weight += u64::from(preferred.weight);
            if !peers_in_node_domain(unit, node, &preferred.term, view) {
                satisfied_weight += u64::from(preferred.weight);
            }
        }
    }

    let mut score = if total_weight == 0 {
        50.0
    } else {
        (satisfied_weight as f64 / total_weight as f64) * 100.0
    };

    let soft_taints = node
        .taints
        .iter()
        .filter(|t| t.effect == TaintEffect::PreferNoSchedule)
        .filter(|t| !unit.tolerations.iter().any(|tol| tol.tolerates(t)))
        .count();
    score -= 20.0 * soft_taints as f64;
    score.clamp(0.0, 100.0)
}

fn peers_in_node_domain(
    unit: &WorkloadUnit,
    node: &Node,
    term: &flotilla_api::UnitAffinityTerm,
    view: &ClusterView<'_>,
) -> bool {
    let Some(domain) = node.topology_domain(&term.topology_key) else {
        return false;
    };
    view.units.iter().any(|peer| {
        peer.id != unit.id
            && term.selector.matches(&peer.labels)
            && view.domain_of(peer, &term.topology_key) == Some(domain)
    })
}

/// 100 if placing here keeps every spread constraint within its
/// allowed skew, 0 per constraint it would breach (averaged).
fn spread_score(unit: &WorkloadUnit, node: &Node, view: &ClusterView<'_>) -> f64 {
    if unit.spread_constraints.is_empty() {
        return 50.0;
    }

    let mut total = 0.0;
    for constraint in &unit.spread_constraints {
        let Some(domain) = node.topology_domain(&constraint.topology_key) else {
            // Unlabeled node: the constraint cannot be evaluated here.
            continue;
        };

        // Count matching units per domain across the cluster.
        let mut counts: std::collections::BTreeMap<&str, u32> =
            std::collections::BTreeMap::new();
        for candidate in &view.nodes {
            if let Some(d) = candidate.topology_domain(&constraint.topology_key) {
                counts.entry(d).or_insert(0);
            }
        }
        for peer in &view.units {
            if peer.id == unit.id || !constraint.selector.matches(&peer.labels) {
                continue;
            }
            if let Some(d) = view.domain_of(peer, &constraint.topology_key) {
                *counts.entry(d).or_insert(0) += 1;
            }
        }

        let min_count = counts.values().copied().min().unwrap_or(0);
        let here_after = counts.get(domain).copied().unwrap_or(0) + 1;
        let skew_after = here_after.saturating_sub(min_count);
        total += if skew_after > constraint.max_skew { 0.0 } else { 100.0 };
    }
    total / unit.spread_constraints.len() as f64
}
