//! flotilla-informer — watch cache for the placement core.
//!
//! Maintains an in-memory, eventually-consistent mirror of cluster
//! state by consuming the state backend's incremental change feed.
//! One reflector task runs per watched kind:
//!
//! - initial list primes the cache and records the resume version
//! - live events are applied in resourceVersion order
//! - stream failure reconnects with exponential backoff from the last
//!   acknowledged version
//! - compacted history forces a full relist; every object is then
//!   re-announced as `Added` (consumers reconcile idempotently)
//!
//! Snapshots are ordered-by-identity clones and never go backward in
//! resourceVersion. Cancellation propagates from a shutdown signal
//! into every blocked read.

pub mod cache;
pub mod informer;
pub mod reflector;

pub use cache::{KindCache, Snapshot};
pub use informer::Informer;
