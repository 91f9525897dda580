//! Heartbeat registry: worker self-registration records.
//!
//! Persists one [`WorkerRecord`] per worker in the state store. Workers
//! write their own record; the scaling controller reads them and reaps the
//! records of instances it has terminated or lost.

use std::collections::HashSet;

use tracing::{debug, info, warn};

use imgfleet_core::{JobId, WorkerId, epoch_millis};
use imgfleet_state::{StateResult, StateStore, WorkerPhase, WorkerRecord};

/// Contents of one heartbeat.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Heartbeat {
    pub phase: WorkerPhase,
    pub current_job_id: Option<JobId>,
    pub jobs_completed: u64,
}

impl Heartbeat {
    pub fn idle(jobs_completed: u64) -> Self {
        Self {
            phase: WorkerPhase::Idle,
            current_job_id: None,
            jobs_completed,
        }
    }
}

#[derive(Clone)]
pub struct HeartbeatRegistry {
    state: StateStore,
}

impl HeartbeatRegistry {
    pub fn new(state: StateStore) -> Self {
        Self { state }
    }

    /// Self-registration: the first sign of life from a launched instance.
    ///
    /// Re-registering an id resets its record.
    pub fn register(&self, worker_id: &WorkerId) -> StateResult<WorkerRecord> {
        let now = epoch_millis();
        let record = WorkerRecord {
            worker_id: worker_id.clone(),
            registered_at: now,
            last_heartbeat: now,
            phase: WorkerPhase::Idle,
            current_job_id: None,
            job_started_at: None,
            jobs_completed: 0,
        };
        self.state.put_worker(&record)?;
        info!(%worker_id, "worker registered");
        Ok(record)
    }

    /// Record a heartbeat. Returns false if the worker never registered
    /// (or has been reaped), in which case nothing is written.
    pub fn heartbeat(&self, worker_id: &WorkerId, beat: Heartbeat) -> StateResult<bool> {
        let now = epoch_millis();
        let phase = beat.phase;
        let found = self.state.update_worker(worker_id, |record| {
            if record.current_job_id != beat.current_job_id {
                record.job_started_at = beat.current_job_id.as_ref().map(|_| now);
            }
            record.last_heartbeat = now;
            record.phase = beat.phase;
            record.current_job_id = beat.current_job_id;
            record.jobs_completed = beat.jobs_completed;
        })?;
        if found {
            debug!(%worker_id, ?phase, "heartbeat received");
        } else {
            warn!(%worker_id, "heartbeat from unregistered worker");
        }
        Ok(found)
    }

    /// Remove a worker's record on clean shutdown.
    pub fn deregister(&self, worker_id: &WorkerId) -> StateResult<bool> {
        let existed = self.state.delete_worker(worker_id)?;
        if existed {
            info!(%worker_id, "worker deregistered");
        }
        Ok(existed)
    }

    pub fn get(&self, worker_id: &WorkerId) -> StateResult<Option<WorkerRecord>> {
        self.state.get_worker(worker_id)
    }

    pub fn list(&self) -> StateResult<Vec<WorkerRecord>> {
        self.state.list_workers()
    }

    /// Delete the records of the given workers. Returns the ids removed.
    pub fn reap(&self, worker_ids: &[WorkerId]) -> StateResult<Vec<WorkerId>> {
        let mut reaped = Vec::new();
        for worker_id in worker_ids {
            if self.state.delete_worker(worker_id)? {
                warn!(%worker_id, "reaped worker record");
                reaped.push(worker_id.clone());
            }
        }
        Ok(reaped)
    }

    /// Delete records whose instance no longer appears in the fleet listing.
    pub fn reap_orphans(&self, live: &HashSet<WorkerId>) -> StateResult<Vec<WorkerId>> {
        let orphans: Vec<WorkerId> = self
            .list()?
            .into_iter()
            .map(|r| r.worker_id)
            .filter(|id| !live.contains(id))
            .collect();
        self.reap(&orphans)
    }
}
