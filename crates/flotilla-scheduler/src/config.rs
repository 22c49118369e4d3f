//! Scheduler configuration, loadable from a TOML file.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use flotilla_placement::ScoreWeights;

use crate::error::SchedulerResult;

/// Tunables for the scheduling loop, queue, and binder.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Base requeue backoff in milliseconds.
    pub backoff_base_ms: u64,
    /// Requeue backoff ceiling in milliseconds.
    pub backoff_cap_ms: u64,
    /// Deadline for a single bind write in milliseconds.
    pub bind_deadline_ms: u64,
    /// How long an unconfirmed overlay delta survives before rollback.
    pub overlay_confirm_ms: u64,
    /// Non-retryable rejections tolerated before a unit goes Failed.
    pub retry_budget: u32,
    /// Grace period granted to preemption victims, in seconds.
    pub eviction_grace_secs: u64,
    /// Scoring plugin weights.
    pub weights: ScoreWeights,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            backoff_base_ms: 1_000,
            backoff_cap_ms: 60_000,
            bind_deadline_ms: 5_000,
            overlay_confirm_ms: 10_000,
            retry_budget: 3,
            eviction_grace_secs: 30,
            weights: ScoreWeights::default(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_file(path: &Path) -> SchedulerResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> SchedulerResult<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn bind_deadline(&self) -> Duration {
        Duration::from_millis(self.bind_deadline_ms)
    }

    pub fn overlay_confirm(&self) -> Duration {
        Duration::from_millis(self.overlay_confirm_ms)
    }

    pub fn eviction_grace(&self) -> Duration {
        Duration::from_secs(self.eviction_grace_secs)
    }
}
