//! StateStore: redb-backed persistence for imgfleet.
//!
//! Provides typed access to jobs, worker heartbeat records and the pool
//! snapshot. Job mutations go through [`StateStore::update_job`], which runs
//! the caller's check-and-modify closure inside one write transaction.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use redb::{Database, ReadableDatabase, ReadableTable};
use tracing::debug;

use imgfleet_core::{JobId, WorkerId};

use crate::error::{StateError, StateResult, TrackerError, TrackerResult};
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
    /// Remaining injected job-write failures.
    write_faults: Arc<AtomicU32>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self::from_db(db);
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    fn from_db(db: Database) -> Self {
        Self {
            db: Arc::new(db),
            write_faults: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Make the next `count` job writes fail as if the store were
    /// unreachable. Nothing is written by a failed call.
    pub fn fail_next_writes(&self, count: u32) {
        self.write_faults.store(count, Ordering::SeqCst);
    }

    fn check_write_fault(&self) -> StateResult<()> {
        let armed = self
            .write_faults
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        match armed {
            Ok(_) => Err(StateError::Transaction("injected write failure".to_string())),
            Err(_) => Ok(()),
        }
    }

    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(JOBS).map_err(map_err!(Table))?;
        txn.open_table(WORKERS).map_err(map_err!(Table))?;
        txn.open_table(POOL).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Jobs ───────────────────────────────────────────────────────

    /// Insert a new job. Fails with `DuplicateJob` if the id is taken.
    pub(crate) fn insert_job(&self, job: &Job) -> TrackerResult<()> {
        self.check_write_fault()?;
        let value = serde_json::to_vec(job).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            if table
                .get(job.job_id.as_str())
                .map_err(map_err!(Read))?
                .is_some()
            {
                return Err(TrackerError::DuplicateJob(job.job_id.clone()));
            }
            table
                .insert(job.job_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(job_id = %job.job_id, "job stored");
        Ok(())
    }

    /// Read-modify-write a job atomically.
    ///
    /// The closure sees the current record. If it returns `Ok`, the (possibly
    /// modified) record is written and the transaction committed; on `Err`
    /// the transaction is aborted and nothing changes.
    pub(crate) fn update_job<T>(
        &self,
        job_id: &JobId,
        f: impl FnOnce(&mut Job) -> TrackerResult<T>,
    ) -> TrackerResult<T> {
        self.check_write_fault()?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome = {
            let mut table = txn.open_table(JOBS).map_err(map_err!(Table))?;
            let mut job: Job = match table.get(job_id.as_str()).map_err(map_err!(Read))? {
                Some(guard) => {
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                }
                None => return Err(TrackerError::NotFound(job_id.clone())),
            };

            let outcome = f(&mut job);
            if outcome.is_ok() {
                let value = serde_json::to_vec(&job).map_err(map_err!(Serialize))?;
                table
                    .insert(job_id.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }
            outcome
        };

        match outcome {
            Ok(value) => {
                txn.commit().map_err(map_err!(Transaction))?;
                Ok(value)
            }
            Err(e) => {
                txn.abort().map_err(map_err!(Transaction))?;
                Err(e)
            }
        }
    }

    /// Get a job by id.
    pub fn get_job(&self, job_id: &JobId) -> StateResult<Option<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        match table.get(job_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let job: Job =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(job))
            }
            None => Ok(None),
        }
    }

    /// List jobs, optionally restricted to one state, up to `limit` entries.
    pub fn list_jobs(&self, state: Option<JobState>, limit: usize) -> StateResult<Vec<Job>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            if results.len() >= limit {
                break;
            }
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if state.is_none_or(|s| s == job.state) {
                results.push(job);
            }
        }
        Ok(results)
    }

    /// Count jobs per state.
    pub fn job_counts(&self) -> StateResult<JobCounts> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(JOBS).map_err(map_err!(Table))?;
        let mut counts = JobCounts::default();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let job: Job = serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            counts.add(job.state);
        }
        Ok(counts)
    }

    // ── Workers ────────────────────────────────────────────────────

    /// Insert or update a worker heartbeat record.
    pub fn put_worker(&self, record: &WorkerRecord) -> StateResult<()> {
        let value = serde_json::to_vec(record).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            table
                .insert(record.worker_id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Read-modify-write an existing worker record in one write transaction.
    ///
    /// Returns false, writing nothing, when no record exists. A concurrent
    /// delete is therefore never undone.
    pub fn update_worker(
        &self,
        worker_id: &WorkerId,
        f: impl FnOnce(&mut WorkerRecord),
    ) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let found = {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            let current: Option<WorkerRecord> =
                match table.get(worker_id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            match current {
                Some(mut record) => {
                    f(&mut record);
                    let value = serde_json::to_vec(&record).map_err(map_err!(Serialize))?;
                    table
                        .insert(worker_id.as_str(), value.as_slice())
                        .map_err(map_err!(Write))?;
                    true
                }
                None => false,
            }
        };
        if found {
            txn.commit().map_err(map_err!(Transaction))?;
        } else {
            txn.abort().map_err(map_err!(Transaction))?;
        }
        Ok(found)
    }

    pub fn get_worker(&self, worker_id: &WorkerId) -> StateResult<Option<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        match table.get(worker_id.as_str()).map_err(map_err!(Read))? {
            Some(guard) => {
                let record: WorkerRecord =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(record))
            }
            None => Ok(None),
        }
    }

    pub fn list_workers(&self) -> StateResult<Vec<WorkerRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let record: WorkerRecord =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            results.push(record);
        }
        Ok(results)
    }

    /// Delete a worker record. Returns true if it existed.
    pub fn delete_worker(&self, worker_id: &WorkerId) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(WORKERS).map_err(map_err!(Table))?;
            existed = table
                .remove(worker_id.as_str())
                .map_err(map_err!(Write))?
                .is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Pool ───────────────────────────────────────────────────────

    pub fn put_pool_state(&self, pool: &PoolState) -> StateResult<()> {
        let value = serde_json::to_vec(pool).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(POOL).map_err(map_err!(Table))?;
            table
                .insert(POOL_KEY, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_pool_state(&self) -> StateResult<Option<PoolState>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(POOL).map_err(map_err!(Table))?;
        match table.get(POOL_KEY).map_err(map_err!(Read))? {
            Some(guard) => {
                let pool: PoolState =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(pool))
            }
            None => Ok(None),
        }
    }
}
