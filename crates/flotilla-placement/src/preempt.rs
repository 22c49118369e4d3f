//! Preemption engine — minimal victim-set search under disruption
//! budgets.
//!
//! Runs only when the filter pipeline found no feasible node and the
//! pending unit's priority class permits preemption. Per node it
//! greedily removes the lowest-priority victims until the node would
//! admit the unit, then runs a reprieve pass that re-adds candidates
//! highest-priority-first while feasibility holds. The engine only
//! plans; the scheduler issues the evictions and requeues the unit.

use std::collections::{HashMap, HashSet};

use tracing::debug;

use flotilla_api::{DisruptionBudget, Node, PreemptionPolicy, WorkloadUnit};

use crate::filter::check_node;
use crate::view::ClusterView;

/// Grace period granted to evicted victims.
pub const DEFAULT_GRACE_SECONDS: u64 = 30;

/// A planned set of evictions that would make one node feasible.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionPlan {
    pub node_id: String,
    /// Victim unit ids, lowest priority first.
    pub victims: Vec<String>,
    pub grace_seconds: u64,
}

/// Search all nodes for the cheapest victim set that would admit the
/// unit. Returns `None` when the policy forbids preemption or no
/// victim set works anywhere.
pub fn plan_preemption(
    unit: &WorkloadUnit,
    view: &ClusterView<'_>,
    budgets: &[&DisruptionBudget],
    policy: PreemptionPolicy,
) -> Option<EvictionPlan> {
    if policy == PreemptionPolicy::Never {
        return None;
    }

    let mut best: Option<(usize, i64, EvictionPlan)> = None;
    for &node in &view.nodes {
        let Some(victims) = victims_for_node(unit, node, view, budgets) else {
            continue;
        };
        let summed_priority: i64 = victims.iter().map(|v| v.priority).sum();
        let key = (victims.len(), summed_priority, node.id.clone());

        let replace = match &best {
            None => true,
            Some((count, sum, plan)) => {
                key < (*count, *sum, plan.node_id.clone())
            }
        };
        if replace {
            best = Some((
                victims.len(),
                summed_priority,
                EvictionPlan {
                    node_id: node.id.clone(),
                    victims: victims.iter().map(|v| v.id.clone()).collect(),
                    grace_seconds: DEFAULT_GRACE_SECONDS,
                },
            ));
        }
    }

    let plan = best.map(|(_, _, plan)| plan);
    if let Some(plan) = &plan {
        debug!(
            unit = %unit.id,
            node = %plan.node_id,
            victims = plan.victims.len(),
            "planned preemption"
        );
    }
    plan
}

/// The minimal victim set making one node feasible, or `None`.
fn victims_for_node<'a>(
    unit: &WorkloadUnit,
    node: &'a Node,
    view: &ClusterView<'a>,
    budgets: &[&DisruptionBudget],
) -> Option<Vec<&'a WorkloadUnit>> {
    // Candidates: strictly lower priority, lowest first.
    let mut candidates: Vec<&WorkloadUnit> = view
        .bound_units_on(&node.id)
        .filter(|peer| peer.priority < unit.priority)
        .collect();
    candidates.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then_with(|| a.id.cmp(&b.id))
    });

    let mut excluded: HashSet<&str> = HashSet::new();
    let mut selected: Vec<&WorkloadUnit> = Vec::new();
    let mut budget_used: HashMap<&str, u32> = HashMap::new();

    // Greedy pass: remove until feasible.
    let mut feasible = check_node(unit, node, view, &excluded).is_none();
    for candidate in &candidates {
        if feasible {
            break;
        }
        if !budgets_allow(candidate, budgets, &budget_used) {
            continue;
        }
        excluded.insert(candidate.id.as_str());
        selected.push(candidate);
        for budget in covering_budgets(candidate, budgets) {
            *budget_used.entry(budget.id.as_str()).or_insert(0) += 1;
        }
        feasible = check_node(unit, node, view, &excluded).is_none();
    }
    if !feasible {
        return None;
    }

    // Reprieve pass: re-add highest-priority victims while the node
    // stays feasible.
    let mut reprieve_order = selected.clone();
    reprieve_order.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| a.id.cmp(&b.id))
    });
    for candidate in reprieve_order {
        excluded.remove(candidate.id.as_str());
        if check_node(unit, node, view, &excluded).is_none() {
            selected.retain(|v| v.id != candidate.id);
        } else {
            excluded.insert(candidate.id.as_str());
        }
    }

    Some(selected)
}

/// Whether evicting this candidate would stay within every covering
/// budget, counting victims already selected for this plan.
fn budgets_allow(
    candidate: &WorkloadUnit,
    budgets: &[&DisruptionBudget],
    budget_used: &HashMap<&str, u32>,
) -> bool {
    covering_budgets(candidate, budgets).all(|budget| {
        let used = budget_used.get(budget.id.as_str()).copied().unwrap_or(0);
        budget.remaining() > used
    })
}

fn covering_budgets<'a>(
    candidate: &'a WorkloadUnit,
    budgets: &'a [&'a DisruptionBudget],
) -> impl Iterator<Item = &'a DisruptionBudget> + 'a {
    budgets
        .iter()
        .copied()
        .filter(|budget| budget.selector.matches(&candidate.labels))
}
