//! flotilla-placement — filter pipeline, scoring, and preemption.
//!
//! Pure decision logic over immutable snapshots. Given a pending
//! workload unit and a view of the cluster, this crate decides:
//!
//! 1. Which nodes are feasible (filter predicates)
//! 2. How feasible nodes rank (weighted score plugins)
//! 3. Which victims to evict when nothing is feasible (preemption)
//!
//! Nothing here performs I/O or mutates state; the scheduler crate
//! executes the decisions through the state backend.
//!
//! # Components
//!
//! - **`view`** — immutable cluster view with allocation accounting
//! - **`filter`** — ordered boolean predicates over (unit, node)
//! - **`score`** — weighted scoring with deterministic tie-break
//! - **`preempt`** — minimal victim-set search under disruption budgets

pub mod filter;
pub mod preempt;
pub mod score;
pub mod view;

pub use filter::{FilterResult, Predicate, feasible_nodes};
pub use preempt::{EvictionPlan, plan_preemption};
pub use score::{NodeScore, ScoreBreakdown, ScoreWeights, rank_nodes, score_node};
pub use view::ClusterView;
