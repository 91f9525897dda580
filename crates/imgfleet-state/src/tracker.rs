//! Job tracker: the durable, atomically mutated record of job lifecycle.
//!
//! ```text
//! Submitted ──► Dispatched ──► Processing ──► Done
//!     ▲                            │
//!     └──── fail(retryable) ───────┤
//!                                  └────────► Failed
//! ```
//!
//! Every transition runs inside one redb write transaction. A successful
//! `try_claim` mints a fresh attempt token; `complete`, `fail` and `touch`
//! are only accepted with the token of the current attempt, so a worker
//! whose claim was superseded (for example after it stalled past the
//! heartbeat window) can never move the job out of `Processing`.

use std::time::Duration;

use tracing::{debug, info, warn};

use imgfleet_core::config::TrackerConfig;
use imgfleet_core::{
    ArtifactRef, AttemptToken, JobId, Operation, WorkerId, content_digest, epoch_millis,
};

use crate::error::{StateResult, TrackerError, TrackerResult};
use crate::store::StateStore;
use crate::types::{Job, JobCounts, JobState};

/// Limits applied by the tracker.
#[derive(Debug, Clone, Copy)]
pub struct TrackerPolicy {
    pub max_attempts: u32,
    /// A `Processing` job without progress for this long may be re-claimed.
    pub heartbeat_window: Duration,
}

impl Default for TrackerPolicy {
    fn default() -> Self {
        Self::from(&TrackerConfig::default())
    }
}

impl From<&TrackerConfig> for TrackerPolicy {
    fn from(config: &TrackerConfig) -> Self {
        Self {
            max_attempts: config.max_attempts,
            heartbeat_window: config.heartbeat_window,
        }
    }
}

/// Proof of a successful claim. The token is required by every later write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    pub job_id: JobId,
    pub worker_id: WorkerId,
    pub token: AttemptToken,
    pub attempt: u32,
}

/// Result of a claim attempt that did not conflict with another worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The caller now owns the job.
    Claimed(Claim),
    /// The job is already terminal; its message is fully handled.
    Finished(JobState),
}

/// Where a failed job ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    /// Back to `Submitted`, eligible for redispatch.
    Requeued,
    /// Terminal.
    Failed,
}

/// Typed job lifecycle operations over a [`StateStore`].
#[derive(Clone)]
pub struct JobTracker {
    store: StateStore,
    policy: TrackerPolicy,
}

impl JobTracker {
    pub fn new(store: StateStore, policy: TrackerPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> TrackerPolicy {
        self.policy
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// Record a newly submitted job.
    pub fn create(
        &self,
        job_id: JobId,
        input_ref: ArtifactRef,
        operation: Operation,
    ) -> TrackerResult<Job> {
        let now = epoch_millis();
        let job = Job {
            job_id,
            input_ref,
            output_ref: None,
            operation,
            state: JobState::Submitted,
            attempt_count: 0,
            last_claimed_by: None,
            attempt_token: None,
            claimed_at: None,
            last_progress_at: None,
            last_error: None,
            created_at: now,
            updated_at: now,
        };
        self.store.insert_job(&job)?;
        info!(job_id = %job.job_id, input = %job.input_ref, "job created");
        Ok(job)
    }

    /// `Submitted → Dispatched` once the job's message is on the queue.
    ///
    /// Returns false (and changes nothing) if the job has already moved on.
    pub fn mark_dispatched(&self, job_id: &JobId) -> TrackerResult<bool> {
        self.store.update_job(job_id, |job| {
            if job.state != JobState::Submitted {
                return Ok(false);
            }
            job.state = JobState::Dispatched;
            job.updated_at = epoch_millis();
            Ok(true)
        })
    }

    /// Atomically claim a job for `worker_id`.
    ///
    /// `Submitted` and `Dispatched` jobs are claimable, as is a `Processing`
    /// job whose claimant has reported no progress within the heartbeat
    /// window. A claimable job that has used up its attempts is failed
    /// instead of claimed.
    pub fn try_claim(&self, job_id: &JobId, worker_id: &WorkerId) -> TrackerResult<ClaimOutcome> {
        let policy = self.policy;
        let outcome = self.store.update_job(job_id, |job| {
            let now = epoch_millis();
            match job.state {
                JobState::Done | JobState::Failed => return Ok(ClaimOutcome::Finished(job.state)),
                JobState::Processing if !is_stale(job, now, policy.heartbeat_window) => {
                    return Err(TrackerError::AlreadyClaimed {
                        job_id: job.job_id.clone(),
                        holder: job.last_claimed_by.clone(),
                    });
                }
                JobState::Processing => {
                    warn!(
                        job_id = %job.job_id,
                        previous = ?job.last_claimed_by,
                        attempt = job.attempt_count,
                        "re-claiming stale job"
                    );
                }
                JobState::Submitted | JobState::Dispatched => {}
            }

            if job.attempt_count >= policy.max_attempts {
                job.state = JobState::Failed;
                job.last_error = Some(match job.last_error.take() {
                    Some(reason) => format!(
                        "attempts exhausted after {} attempts: {reason}",
                        job.attempt_count
                    ),
                    None => format!("attempts exhausted after {} attempts", job.attempt_count),
                });
                job.updated_at = now;
                return Ok(ClaimOutcome::Finished(JobState::Failed));
            }

            job.attempt_count += 1;
            let token = mint_token(&job.job_id, job.attempt_count, worker_id, now);
            job.state = JobState::Processing;
            job.attempt_token = Some(token.clone());
            job.last_claimed_by = Some(worker_id.clone());
            job.claimed_at = Some(now);
            job.last_progress_at = Some(now);
            job.updated_at = now;

            Ok(ClaimOutcome::Claimed(Claim {
                job_id: job.job_id.clone(),
                worker_id: worker_id.clone(),
                token,
                attempt: job.attempt_count,
            }))
        })?;

        match &outcome {
            ClaimOutcome::Claimed(claim) => {
                info!(%job_id, %worker_id, attempt = claim.attempt, "job claimed");
            }
            ClaimOutcome::Finished(state) => {
                debug!(%job_id, %worker_id, ?state, "claim on finished job");
            }
        }
        Ok(outcome)
    }

    /// Record progress for the current attempt.
    pub fn touch(&self, job_id: &JobId, token: &AttemptToken) -> TrackerResult<()> {
        self.store.update_job(job_id, |job| {
            check_token(job, token)?;
            if job.state != JobState::Processing {
                return Err(wrong_state(job));
            }
            let now = epoch_millis();
            job.last_progress_at = Some(now);
            job.updated_at = now;
            Ok(())
        })
    }

    /// `Processing → Done` for the holder of the current attempt token.
    ///
    /// Repeating the call with the same token and output is a no-op.
    pub fn complete(
        &self,
        job_id: &JobId,
        token: &AttemptToken,
        output_ref: ArtifactRef,
    ) -> TrackerResult<()> {
        let first = self.store.update_job(job_id, |job| {
            check_token(job, token)?;
            match job.state {
                JobState::Processing => {
                    job.state = JobState::Done;
                    job.output_ref = Some(output_ref.clone());
                    job.last_error = None;
                    job.updated_at = epoch_millis();
                    Ok(true)
                }
                JobState::Done if job.output_ref.as_ref() == Some(&output_ref) => Ok(false),
                _ => Err(wrong_state(job)),
            }
        })?;
        if first {
            info!(%job_id, output = %output_ref, "job done");
        }
        Ok(())
    }

    /// Report a failed attempt.
    ///
    /// A retryable failure requeues the job while attempts remain; anything
    /// else is terminal. Repeating the call for the same attempt returns the
    /// outcome of the first call.
    pub fn fail(
        &self,
        job_id: &JobId,
        token: &AttemptToken,
        reason: &str,
        retryable: bool,
    ) -> TrackerResult<FailOutcome> {
        let max_attempts = self.policy.max_attempts;
        let outcome = self.store.update_job(job_id, |job| {
            check_token(job, token)?;
            match job.state {
                JobState::Processing => {
                    let outcome = if retryable && job.attempt_count < max_attempts {
                        job.state = JobState::Submitted;
                        FailOutcome::Requeued
                    } else {
                        job.state = JobState::Failed;
                        FailOutcome::Failed
                    };
                    job.last_error = Some(reason.to_string());
                    job.updated_at = epoch_millis();
                    Ok(outcome)
                }
                // Same attempt already reported; the token is unchanged until
                // the next claim mints a new one.
                JobState::Submitted | JobState::Dispatched => Ok(FailOutcome::Requeued),
                JobState::Failed => Ok(FailOutcome::Failed),
                JobState::Done => Err(wrong_state(job)),
            }
        })?;

        match outcome {
            FailOutcome::Requeued => info!(%job_id, reason, "job requeued"),
            FailOutcome::Failed => warn!(%job_id, reason, "job failed"),
        }
        Ok(outcome)
    }

    /// Status snapshot.
    pub fn get(&self, job_id: &JobId) -> TrackerResult<Job> {
        self.store
            .get_job(job_id)?
            .ok_or_else(|| TrackerError::NotFound(job_id.clone()))
    }

    pub fn list(&self, state: Option<JobState>, limit: usize) -> StateResult<Vec<Job>> {
        self.store.list_jobs(state, limit)
    }

    pub fn counts(&self) -> StateResult<JobCounts> {
        self.store.job_counts()
    }
}

fn is_stale(job: &Job, now: u64, window: Duration) -> bool {
    let last = job.last_progress_at.or(job.claimed_at).unwrap_or(job.updated_at);
    now.saturating_sub(last) > window.as_millis() as u64
}

fn check_token(job: &Job, token: &AttemptToken) -> TrackerResult<()> {
    if job.attempt_token.as_ref() == Some(token) {
        Ok(())
    } else {
        Err(TrackerError::StaleAttempt(job.job_id.clone()))
    }
}

fn wrong_state(job: &Job) -> TrackerError {
    TrackerError::WrongState {
        job_id: job.job_id.clone(),
        state: job.state,
    }
}

fn mint_token(job_id: &JobId, attempt: u32, worker_id: &WorkerId, now: u64) -> AttemptToken {
    let nonce = next_nonce();
    let seed = format!("{job_id}|{attempt}|{worker_id}|{now}|{nonce}");
    let digest = content_digest(seed.as_bytes());
    AttemptToken::new(format!("{attempt}-{}", &digest[..24]))
}

/// Per-process counter mixed into token seeds so two claims in the same
/// millisecond never collide.
fn next_nonce() -> u64 {
    use std::sync::atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    COUNTER.fetch_add(1, Ordering::Relaxed)
}
