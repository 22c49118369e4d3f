//! flotilla-api — domain types for the Flotilla placement core.
//!
//! Defines the objects the placement engine reasons about (nodes,
//! workload units, priority classes, disruption budgets), the watch
//! event model, and the trait interfaces to external collaborators
//! (state backend, admission gate, leader lease).
//!
//! # Architecture
//!
//! The placement core never mutates cluster state directly. Every
//! mutation is a proposed write sent through [`StateBackend`], which
//! is the sole writer of committed state. The core observes results
//! through the backend's versioned watch feed.

pub mod backend;
pub mod error;
pub mod event;
pub mod object;
pub mod resources;
pub mod selector;

pub use backend::{
    AdmissionDecision, LeaderLease, ProposedWrite, StateBackend, StaticLease,
    WriteOutcome,
};
pub use error::{BackendError, BackendResult};
pub use event::{EventKind, Object, ObjectKind, WatchEvent};
pub use object::*;
pub use resources::ResourceVec;
pub use selector::{LabelSelector, MatchExpression, MatchOperator};
