//! Persisted records: jobs, worker heartbeats, and the pool snapshot.

use serde::{Deserialize, Serialize};

use imgfleet_core::{ArtifactRef, AttemptToken, JobId, Operation, WorkerId};

// ── Job ───────────────────────────────────────────────────────────

/// One requested image transformation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Job {
    pub job_id: JobId,
    pub input_ref: ArtifactRef,
    /// Set only once the job is `Done`.
    pub output_ref: Option<ArtifactRef>,
    pub operation: Operation,
    pub state: JobState,
    /// Incremented by every successful claim. Never decreases.
    pub attempt_count: u32,
    pub last_claimed_by: Option<WorkerId>,
    /// Token of the current (or most recent) attempt.
    pub attempt_token: Option<AttemptToken>,
    /// Unix millis of the most recent claim.
    pub claimed_at: Option<u64>,
    /// Unix millis of the last progress report from the claimant.
    pub last_progress_at: Option<u64>,
    /// Reason given by the most recent `fail`.
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Submitted,
    Dispatched,
    Processing,
    Done,
    Failed,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Failed)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobState::Submitted => "submitted",
            JobState::Dispatched => "dispatched",
            JobState::Processing => "processing",
            JobState::Done => "done",
            JobState::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "submitted" => Some(JobState::Submitted),
            "dispatched" => Some(JobState::Dispatched),
            "processing" => Some(JobState::Processing),
            "done" => Some(JobState::Done),
            "failed" => Some(JobState::Failed),
            _ => None,
        }
    }
}

/// Number of jobs in each state.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct JobCounts {
    pub submitted: u64,
    pub dispatched: u64,
    pub processing: u64,
    pub done: u64,
    pub failed: u64,
}

impl JobCounts {
    pub fn add(&mut self, state: JobState) {
        match state {
            JobState::Submitted => self.submitted += 1,
            JobState::Dispatched => self.dispatched += 1,
            JobState::Processing => self.processing += 1,
            JobState::Done => self.done += 1,
            JobState::Failed => self.failed += 1,
        }
    }

    pub fn total(&self) -> u64 {
        self.submitted + self.dispatched + self.processing + self.done + self.failed
    }
}

// ── Worker ────────────────────────────────────────────────────────

/// What a worker loop is doing, as reported in its heartbeats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Processing,
    Reporting,
}

/// Health of a fleet member as inferred by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerHealth {
    Starting,
    Healthy,
    Unresponsive,
    Terminating,
}

/// Self-reported worker liveness, written by the worker's heartbeat task.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkerRecord {
    pub worker_id: WorkerId,
    /// Unix millis of self-registration.
    pub registered_at: u64,
    /// Unix millis of the last heartbeat.
    pub last_heartbeat: u64,
    pub phase: WorkerPhase,
    pub current_job_id: Option<JobId>,
    /// Unix millis at which `current_job_id` was claimed.
    pub job_started_at: Option<u64>,
    pub jobs_completed: u64,
}

// ── Pool ──────────────────────────────────────────────────────────

/// The scaling controller's view of the fleet after its last tick.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PoolState {
    pub desired_count: u32,
    /// Healthy workers, reconciled from the fleet listing.
    pub observed_count: u32,
    /// Launched instances that have not yet registered.
    pub in_flight_launches: u32,
    pub in_flight_terminations: u32,
    pub unresponsive: u32,
    pub backlog: u64,
    pub oldest_age_ms: u64,
    /// Unix millis of the last tick that launched instances.
    pub last_scale_up_at: Option<u64>,
    pub updated_at: u64,
}
