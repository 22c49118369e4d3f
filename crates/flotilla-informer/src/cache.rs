//! Per-kind cache state and point-in-time snapshots.

use std::collections::BTreeMap;

use flotilla_api::{
    DisruptionBudget, EventKind, Node, Object, PriorityClass, WatchEvent,
    WorkloadUnit,
};

/// The mirror of one object kind: objects by id plus the highest
/// resourceVersion acknowledged so far.
#[derive(Debug, Default, Clone)]
pub struct KindCache {
    pub objects: BTreeMap<String, Object>,
    pub version: u64,
}

impl KindCache {
    /// Replace the whole cache from a fresh list (relist path).
    ///
    /// Ignored if the list is older than what the cache already holds;
    /// snapshots must never go backward.
    pub fn replace_all(&mut self, objects: Vec<Object>, version: u64) -> bool {
        if version < self.version {
            return false;
        }
        self.objects = objects
            .into_iter()
            .map(|o| (o.id().to_string(), o))
            .collect();
        self.version = version;
        true
    }

    /// Apply one live event. Returns false for stale or bookmark-only
    /// events that change no object.
    pub fn apply(&mut self, event: &WatchEvent) -> bool {
        if event.resource_version <= self.version {
            // Re-delivered after reconnect; already reconciled.
            return false;
        }
        self.version = event.resource_version;
        match (&event.kind, &event.object) {
            (EventKind::Added | EventKind::Modified, Some(object)) => {
                self.objects
                    .insert(object.id().to_string(), object.clone());
                true
            }
            (EventKind::Deleted, Some(object)) => {
                self.objects.remove(object.id()).is_some()
            }
            _ => false,
        }
    }

    /// An immutable point-in-time copy.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            objects: self.objects.clone(),
            version: self.version,
        }
    }
}

/// Point-in-time, ordered-by-identity view of one kind.
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub objects: BTreeMap<String, Object>,
    pub version: u64,
}

impl Snapshot {
    pub fn get(&self, id: &str) -> Option<&Object> {
        self.objects.get(id)
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn nodes(&self) -> Vec<&Node> {
        self.objects.values().filter_map(Object::as_node).collect()
    }

    pub fn units(&self) -> Vec<&WorkloadUnit> {
        self.objects.values().filter_map(Object::as_unit).collect()
    }

    pub fn priority_classes(&self) -> Vec<&PriorityClass> {
        self.objects
            .values()
            .filter_map(|o| match o {
                Object::PriorityClass(pc) => Some(pc),
                _ => None,
            })
            .collect()
    }

    pub fn budgets(&self) -> Vec<&DisruptionBudget> {
        self.objects
            .values()
            .filter_map(|o| match o {
                Object::DisruptionBudget(b) => Some(b),
                _ => None,
            })
            .collect()
    }
}
