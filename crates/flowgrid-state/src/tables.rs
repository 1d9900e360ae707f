//! redb table definitions for the embedded orchestrator store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).

use redb::TableDefinition;

/// Step resources keyed by `{namespace}/{name}`.
pub const STEPS: TableDefinition<&str, &[u8]> = TableDefinition::new("steps");

/// Worker pods keyed by `{namespace}/{pod_name}`.
pub const PODS: TableDefinition<&str, &[u8]> = TableDefinition::new("pods");

/// Exec requests keyed by a zero-padded sequence number.
pub const EXECS: TableDefinition<&str, &[u8]> = TableDefinition::new("execs");

/// Store-wide counters (resource versions, exec sequence).
pub const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");
