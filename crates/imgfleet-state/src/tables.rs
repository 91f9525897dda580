//! redb table definitions for the imgfleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// Job records keyed by `{job_id}`.
pub const JOBS: TableDefinition<&str, &[u8]> = TableDefinition::new("jobs");

/// Worker heartbeat records keyed by `{worker_id}`.
pub const WORKERS: TableDefinition<&str, &[u8]> = TableDefinition::new("workers");

/// Controller snapshots keyed by name (currently only `pool`).
pub const POOL: TableDefinition<&str, &[u8]> = TableDefinition::new("pool");

/// Key of the single pool snapshot row.
pub const POOL_KEY: &str = "pool";
