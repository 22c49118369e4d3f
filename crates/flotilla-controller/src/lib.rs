//! flotilla-controller — generic reconciliation loops.
//!
//! The pattern behind every control loop in the system: watch events
//! produce keys, keys flow into a [`Controller`], and a [`Reconciler`]
//! drives the observed state toward the desired state one key at a
//! time. Per-key serialization, bounded concurrency, error backoff,
//! and leader-election gating come from the framework; reconcilers
//! stay pure.

pub mod controller;

pub use controller::{Controller, ReconcileOutcome, Reconciler, run_while_leader};
