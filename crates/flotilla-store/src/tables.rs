//! redb table definitions for the cluster store.
//!
//! Objects use composite `{kind}/{id}` keys so a single table serves
//! every kind and prefix scans implement per-kind listing. Events are
//! keyed by the resourceVersion they committed at.

use redb::TableDefinition;

/// Objects keyed by `{kind}/{id}`, JSON-serialized.
pub const OBJECTS: TableDefinition<&str, &[u8]> = TableDefinition::new("objects");

/// Watch events keyed by resourceVersion, JSON-serialized.
pub const EVENTS: TableDefinition<u64, &[u8]> = TableDefinition::new("events");

/// Store metadata: current version, compaction floor.
pub const META: TableDefinition<&str, u64> = TableDefinition::new("meta");

/// Meta key holding the store-global resourceVersion counter.
pub const META_VERSION: &str = "version";

/// Meta key holding the compaction floor: every event at or below
/// this version has been pruned from the log.
pub const META_COMPACTED: &str = "compacted_below";

/// Build the composite object key for a kind and id.
pub fn object_key(kind: flotilla_api::ObjectKind, id: &str) -> String {
    format!("{}/{}", kind.as_str(), id)
}

/// Exclusive upper bound for a kind's key range.
pub fn kind_range_end(kind: flotilla_api::ObjectKind) -> String {
    // '0' is the character after '/' in ASCII.
    format!("{}0", kind.as_str())
}
