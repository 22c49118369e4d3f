//! flotilla-scheduler — placement queue, binder, and scheduling loop.
//!
//! Consumes snapshots and watch events from `flotilla-informer`,
//! decides placement with `flotilla-placement`, and commits bindings
//! through the `StateBackend` trait with optimistic concurrency.
//!
//! # Architecture
//!
//! ```text
//! Scheduler
//!   ├── PlacementQueue (priority + requeue backoff)
//!   ├── Informer snapshots (nodes, units, classes, budgets)
//!   ├── filter → score → pick (flotilla-placement)
//!   └── Binder
//!       ├── conditional write (bind / fail / evict)
//!       └── AllocationOverlay (unconfirmed deltas)
//! ```

pub mod binder;
pub mod config;
pub mod error;
pub mod queue;
pub mod scheduler;

pub use binder::{AllocationOverlay, BindOutcome, Binder};
pub use config::SchedulerConfig;
pub use error::{SchedulerError, SchedulerResult};
pub use queue::PlacementQueue;
pub use scheduler::{CycleOutcome, Scheduler, WATCHED_KINDS};
