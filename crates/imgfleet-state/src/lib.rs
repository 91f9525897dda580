//! imgfleet-state: embedded state store and job tracker.
//!
//! Backed by [redb](https://docs.rs/redb). Holds the durable job records,
//! worker heartbeat records and the scaling controller's pool snapshot.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! `JobTracker` performs every job transition inside a single redb write
//! transaction. redb serializes write transactions, so each read-check-write
//! is a compare-and-set: two workers racing on a redelivered message cannot
//! both claim the same attempt.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod store;
pub mod tables;
pub mod tracker;
pub mod types;

pub use error::{StateError, StateResult, TrackerError, TrackerResult};
pub use store::StateStore;
pub use tracker::{Claim, ClaimOutcome, FailOutcome, JobTracker, TrackerPolicy};
pub use types::*;
