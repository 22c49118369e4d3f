//! Immutable cluster view used by every placement decision.

use std::collections::HashMap;

use flotilla_api::{Node, ResourceVec, WorkloadUnit};

/// A point-in-time view of nodes, units, and per-node allocation.
///
/// Allocation is the sum of bound units' requests plus any pending
/// deltas the scheduler's optimistic overlay injects (binds committed
/// locally but not yet observed through the watch feed).
pub struct ClusterView<'a> {
    pub nodes: Vec<&'a Node>,
    pub units: Vec<&'a WorkloadUnit>,
    nodes_by_id: HashMap<&'a str, &'a Node>,
    allocated: HashMap<&'a str, ResourceVec>,
}

impl<'a> ClusterView<'a> {
    /// Build a view from snapshot references plus overlay deltas.
    pub fn new(
        nodes: Vec<&'a Node>,
        units: Vec<&'a WorkloadUnit>,
        overlay: &HashMap<String, ResourceVec>,
    ) -> Self {
        let nodes_by_id: HashMap<&str, &Node> =
            nodes.iter().map(|n| (n.id.as_str(), *n)).collect();

        let mut allocated: HashMap<&str, ResourceVec> = HashMap::new();
        for unit in &units {
            if let Some(node_id) = unit.bound_node() {
                if let Some((key, _)) = nodes_by_id.get_key_value(node_id) {
                    let entry = allocated.entry(key).or_default();
                    *entry = entry.add(&unit.requests);
                }
            }
        }
        for (node_id, delta) in overlay {
            if let Some((key, _)) = nodes_by_id.get_key_value(node_id.as_str()) {
                let entry = allocated.entry(key).or_default();
                *entry = entry.add(delta);
            }
        }

        Self {
            nodes,
            units,
            nodes_by_id,
            allocated,
        }
    }

    pub fn node(&self, id: &str) -> Option<&'a Node> {
        self.nodes_by_id.get(id).copied()
    }

    /// Resources currently accounted against a node.
    pub fn allocated(&self, node_id: &str) -> ResourceVec {
        self.allocated.get(node_id).cloned().unwrap_or_default()
    }

    /// Allocatable minus allocated, the capacity the filter checks
    /// requests against.
    pub fn free_on(&self, node: &Node) -> ResourceVec {
        node.allocatable.saturating_sub(&self.allocated(&node.id))
    }

    /// Bound units currently placed on a node.
    pub fn bound_units_on<'b>(
        &'b self,
        node_id: &'b str,
    ) -> impl Iterator<Item = &'a WorkloadUnit> + 'b {
        self.units
            .iter()
            .copied()
            .filter(move |u| u.bound_node() == Some(node_id))
    }

    /// The topology domain a bound unit occupies for a topology key.
    pub fn domain_of(&self, unit: &WorkloadUnit, topology_key: &str) -> Option<&'a str> {
        let node = self.node(unit.bound_node()?)?;
        node.topology_domain(topology_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flotilla_api::{BindingState, NodeConditions};

    fn make_node(id: &str, cpu: u64, mem: u64) -> Node {
        Node {
            id: id.to_string(),
            labels: Default::default(),
            taints: Vec::new(),
            allocatable: ResourceVec::new(cpu, mem),
            conditions: NodeConditions::healthy(0),
            images: Vec::new(),
            resource_version: 1,
        }
    }

    fn bound_unit(id: &str, node: &str, cpu: u64, mem: u64) -> WorkloadUnit {
        WorkloadUnit {
            id: id.to_string(),
            labels: Default::default(),
            priority_class: "default".to_string(),
            priority: 0,
            requests: ResourceVec::new(cpu, mem),
            limits: None,
            node_selector: Default::default(),
            node_affinity: None,
            unit_affinity: None,
            unit_anti_affinity: None,
            tolerations: Vec::new(),
            spread_constraints: Vec::new(),
            images: Vec::new(),
            binding: BindingState::Bound {
                node: node.to_string(),
            },
            created_at: 0,
            resource_version: 1,
        }
    }

    #[test]
    fn allocation_sums_bound_units_and_overlay() {
        let node = make_node("n1", 2000, 4096);
        let u1 = bound_unit("u1", "n1", 500, 1024);
        let u2 = bound_unit("u2", "n1", 250, 512);

        let mut overlay = HashMap::new();
        overlay.insert("n1".to_string(), ResourceVec::new(100, 0));

        let view = ClusterView::new(vec![&node], vec![&u1, &u2], &overlay);
        let allocated = view.allocated("n1");
        assert_eq!(allocated.cpu_millis, 850);
        assert_eq!(allocated.memory_bytes, 1536);

        let free = view.free_on(&node);
        assert_eq!(free.cpu_millis, 1150);
        assert_eq!(free.memory_bytes, 2560);
    }

    #[test]
    fn unbound_units_do_not_count() {
        let node = make_node("n1", 1000, 1000);
        let mut unit = bound_unit("u1", "n1", 500, 500);
        unit.binding = BindingState::Unbound;

        let view = ClusterView::new(vec![&node], vec![&unit], &HashMap::new());
        assert!(view.allocated("n1").is_zero());
        assert_eq!(view.bound_units_on("n1").count(), 0);
    }
}
