//! flotilla-store — versioned object store harness backed by redb.
//!
//! Implements the `StateBackend` trait from `flotilla-api` for
//! development and tests. The real cluster runs against an external
//! durable store; this crate gives the placement core the same
//! contract in-process:
//!
//! - every committed write bumps a store-global resourceVersion
//! - writes are conditional on the object's last-observed version
//! - an event log allows watches to resume from any retained version
//! - history is bounded; resuming below the retention floor fails
//!   with `CompactedHistory` and forces a relist
//! - an admission hook may reject any proposed write before commit
//!
//! All values are JSON-serialized into redb's `&[u8]` value columns.

pub mod error;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use store::{AdmissionHook, ClusterStore};
