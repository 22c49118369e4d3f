//! Watch events — the incremental change feed consumed by informers.

use serde::{Deserialize, Serialize};

use crate::object::{DisruptionBudget, Node, PriorityClass, WorkloadUnit};

/// Object kinds the placement core watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectKind {
    Node,
    WorkloadUnit,
    PriorityClass,
    DisruptionBudget,
}

impl ObjectKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectKind::Node => "node",
            ObjectKind::WorkloadUnit => "workload_unit",
            ObjectKind::PriorityClass => "priority_class",
            ObjectKind::DisruptionBudget => "disruption_budget",
        }
    }
}

/// A versioned object snapshot carried by events and snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Object {
    Node(Node),
    WorkloadUnit(WorkloadUnit),
    PriorityClass(PriorityClass),
    DisruptionBudget(DisruptionBudget),
}

impl Object {
    pub fn kind(&self) -> ObjectKind {
        match self {
            Object::Node(_) => ObjectKind::Node,
            Object::WorkloadUnit(_) => ObjectKind::WorkloadUnit,
            Object::PriorityClass(_) => ObjectKind::PriorityClass,
            Object::DisruptionBudget(_) => ObjectKind::DisruptionBudget,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Object::Node(n) => &n.id,
            Object::WorkloadUnit(u) => &u.id,
            Object::PriorityClass(p) => &p.name,
            Object::DisruptionBudget(b) => &b.id,
        }
    }

    pub fn resource_version(&self) -> u64 {
        match self {
            Object::Node(n) => n.resource_version,
            Object::WorkloadUnit(u) => u.resource_version,
            Object::PriorityClass(p) => p.resource_version,
            Object::DisruptionBudget(b) => b.resource_version,
        }
    }

    /// Stamp the backend-assigned version onto the object.
    pub fn set_resource_version(&mut self, version: u64) {
        match self {
            Object::Node(n) => n.resource_version = version,
            Object::WorkloadUnit(u) => u.resource_version = version,
            Object::PriorityClass(p) => p.resource_version = version,
            Object::DisruptionBudget(b) => b.resource_version = version,
        }
    }

    pub fn as_node(&self) -> Option<&Node> {
        match self {
            Object::Node(n) => Some(n),
            _ => None,
        }
    }

    pub fn as_unit(&self) -> Option<&WorkloadUnit> {
        match self {
            Object::WorkloadUnit(u) => Some(u),
            _ => None,
        }
    }
}

/// Change-feed event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Added,
    Modified,
    Deleted,
    /// Version-progress marker carrying no object change.
    Bookmark,
}

/// One event on a kind's change feed.
///
/// Events for a given object arrive in resourceVersion order. After a
/// reconnect-and-relist, `Added` may be re-delivered for already-known
/// objects; consumers must reconcile idempotently.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub kind: EventKind,
    /// Absent only for bookmarks.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub object: Option<Object>,
    pub resource_version: u64,
}

impl WatchEvent {
    pub fn added(object: Object) -> Self {
        let resource_version = object.resource_version();
        Self {
            kind: EventKind::Added,
            object: Some(object),
            resource_version,
        }
    }

    pub fn modified(object: Object) -> Self {
        let resource_version = object.resource_version();
        Self {
            kind: EventKind::Modified,
            object: Some(object),
            resource_version,
        }
    }

    pub fn deleted(object: Object, resource_version: u64) -> Self {
        Self {
            kind: EventKind::Deleted,
            object: Some(object),
            resource_version,
        }
    }

    pub fn bookmark(resource_version: u64) -> Self {
        Self {
            kind: EventKind::Bookmark,
            object: None,
            resource_version,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{NodeConditions, PreemptionPolicy};
    use crate::resources::ResourceVec;

    #[test]
    fn object_accessors_dispatch_by_kind() {
        let node = Object::Node(Node {
            id: "node-1".to_string(),
            labels: Default::default(),
            taints: Vec::new(),
            allocatable: ResourceVec::new(1000, 1024),
            conditions: NodeConditions::healthy(0),
            images: Vec::new(),
            resource_version: 7,
        });
        assert_eq!(node.kind(), ObjectKind::Node);
        assert_eq!(node.id(), "node-1");
        assert_eq!(node.resource_version(), 7);
        assert!(node.as_node().is_some());
        assert!(node.as_unit().is_none());
    }

    #[test]
    fn set_resource_version_stamps_inner_object() {
        let mut pc = Object::PriorityClass(PriorityClass {
            name: "critical".to_string(),
            value: 1000,
            preemption: PreemptionPolicy::PreemptLower,
            resource_version: 0,
        });
        pc.set_resource_version(42);
        assert_eq!(pc.resource_version(), 42);
    }

    #[test]
    fn bookmark_carries_no_object() {
        let event = WatchEvent::bookmark(9);
        assert_eq!(event.kind, EventKind::Bookmark);
        assert!(event.object.is_none());
        assert_eq!(event.resource_version, 9);
    }
}
