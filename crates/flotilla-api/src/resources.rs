//! Multi-dimensional resource quantities.
//!
//! Every capacity, request, and allocation in the system is a
//! [`ResourceVec`]: CPU millicores, memory bytes, ephemeral storage
//! bytes, plus named extended resources (GPUs, hugepages, ...).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// A vector of resource quantities, one entry per dimension.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceVec {
    /// CPU in millicores (1000 = one core).
    pub cpu_millis: u64,
    /// Memory in bytes.
    pub memory_bytes: u64,
    /// Ephemeral storage in bytes.
    pub ephemeral_bytes: u64,
    /// Extended resources by name (e.g. "gpu").
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extended: BTreeMap<String, u64>,
}

impl ResourceVec {
    /// A zero vector.
    pub fn zero() -> Self {
        Self::default()
    }

    /// CPU and memory only, the common case in tests and small specs.
    pub fn new(cpu_millis: u64, memory_bytes: u64) -> Self {
        Self {
            cpu_millis,
            memory_bytes,
            ..Self::default()
        }
    }

    /// True if every dimension is zero.
    pub fn is_zero(&self) -> bool {
        self.cpu_millis == 0
            && self.memory_bytes == 0
            && self.ephemeral_bytes == 0
            && self.extended.values().all(|v| *v == 0)
    }

    /// Component-wise sum, saturating at `u64::MAX`: sums come from
    /// externally supplied specs and must never panic.
    pub fn add(&self, other: &Self) -> Self {
        let mut extended = self.extended.clone();
        for (name, qty) in &other.extended {
            let entry = extended.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_add(*qty);
        }
        Self {
            cpu_millis: self.cpu_millis.saturating_add(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_add(other.memory_bytes),
            ephemeral_bytes: self.ephemeral_bytes.saturating_add(other.ephemeral_bytes),
            extended,
        }
    }

    /// Component-wise subtraction, saturating at zero.
    pub fn saturating_sub(&self, other: &Self) -> Self {
        let mut extended = self.extended.clone();
        for (name, qty) in &other.extended {
            let entry = extended.entry(name.clone()).or_insert(0);
            *entry = entry.saturating_sub(*qty);
        }
        Self {
            cpu_millis: self.cpu_millis.saturating_sub(other.cpu_millis),
            memory_bytes: self.memory_bytes.saturating_sub(other.memory_bytes),
            ephemeral_bytes: self.ephemeral_bytes.saturating_sub(other.ephemeral_bytes),
            extended,
        }
    }

    /// True if `self` fits within `available` in every dimension.
    ///
    /// Extended resources absent from `available` count as zero, so a
    /// request for them fails the fit.
    pub fn fits_within(&self, available: &Self) -> bool {
        if self.cpu_millis > available.cpu_millis
            || self.memory_bytes > available.memory_bytes
            || self.ephemeral_bytes > available.ephemeral_bytes
        {
            return false;
        }
        self.extended
            .iter()
            .all(|(name, qty)| *qty <= available.extended.get(name).copied().unwrap_or(0))
    }

    /// Utilization ratio per dimension of `used` against `self` as
    /// capacity. Dimensions with zero capacity are skipped.
    pub fn utilization_of(&self, used: &Self) -> Vec<f64> {
        let mut ratios = Vec::new();
        if self.cpu_millis > 0 {
            ratios.push(used.cpu_millis as f64 / self.cpu_millis as f64);
        }
        if self.memory_bytes > 0 {
            ratios.push(used.memory_bytes as f64 / self.memory_bytes as f64);
        }
        if self.ephemeral_bytes > 0 {
            ratios.push(used.ephemeral_bytes as f64 / self.ephemeral_bytes as f64);
        }
        for (name, cap) in &self.extended {
            if *cap > 0 {
                let u = used.extended.get(name).copied().unwrap_or(0);
                ratios.push(u as f64 / *cap as f64);
            }
        }
        ratios
    }
}
