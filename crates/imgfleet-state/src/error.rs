//! Error types for the state store and job tracker.

use imgfleet_core::{JobId, WorkerId};
use thiserror::Error;

use crate::types::JobState;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),
}

pub type TrackerResult<T> = Result<T, TrackerError>;

/// Job tracker contract violations.
///
/// Everything except `State` is recoverable by re-reading the job.
#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("job already exists: {0}")]
    DuplicateJob(JobId),

    #[error("job not found: {0}")]
    NotFound(JobId),

    #[error("job {job_id} is already claimed by {holder:?}")]
    AlreadyClaimed {
        job_id: JobId,
        holder: Option<WorkerId>,
    },

    #[error("job {job_id} is in state {state:?}")]
    WrongState { job_id: JobId, state: JobState },

    #[error("attempt token for job {0} has been superseded")]
    StaleAttempt(JobId),

    #[error("state store error: {0}")]
    State(#[from] StateError),
}
