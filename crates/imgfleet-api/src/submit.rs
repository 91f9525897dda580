//! Job submission boundary: artifact put, tracker create, enqueue.
//!
//! Submitting again with the same job id is safe at any point of a
//! partially failed submission. An existing job still in `Submitted` is
//! enqueued again; anything further along is reported as is.

use std::sync::Arc;

use bytes::Bytes;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info};

use imgfleet_core::protocol::{ProtocolError, encode_message};
use imgfleet_core::{DispatchMessage, JobId, Operation, content_digest};
use imgfleet_gateway::retry::{RetryPolicy, with_backoff};
use imgfleet_gateway::{ArtifactStore, GatewayError, QueueGateway};
use imgfleet_state::{Job, JobState, JobTracker, TrackerError};

/// Artifact namespace for submitted images.
pub const INPUT_NAMESPACE: &str = "inputs";

#[derive(Debug, Error)]
pub enum SubmitError {
    #[error("input image is empty")]
    EmptyInput,

    #[error("job {0} already exists with a different input or operation")]
    Conflict(JobId),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Tracker(#[from] TrackerError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitReceipt {
    pub job_id: JobId,
    pub state: JobState,
    /// False when an earlier submission already created the job.
    pub created: bool,
}

#[derive(Clone)]
pub struct Submitter {
    tracker: JobTracker,
    queue: Arc<dyn QueueGateway>,
    artifacts: Arc<dyn ArtifactStore>,
    retry: RetryPolicy,
}

impl Submitter {
    pub fn new(
        tracker: JobTracker,
        queue: Arc<dyn QueueGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            tracker,
            queue,
            artifacts,
            retry,
        }
    }

    /// Submit an image. A job id is generated when none is given.
    pub async fn submit(
        &self,
        job_id: Option<JobId>,
        operation: Operation,
        input: Bytes,
    ) -> Result<SubmitReceipt, SubmitError> {
        if input.is_empty() {
            return Err(SubmitError::EmptyInput);
        }
        let job_id = job_id.unwrap_or_else(|| JobId::new(uuid::Uuid::new_v4().to_string()));

        match self.tracker.get(&job_id) {
            Ok(existing) => return self.resubmit(existing, &operation, &input).await,
            Err(TrackerError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        let input_ref = with_backoff(&self.retry, "artifacts.put", || {
            self.artifacts.put(INPUT_NAMESPACE, input.clone())
        })
        .await?;

        let job = match self
            .tracker
            .create(job_id.clone(), input_ref, operation.clone())
        {
            Ok(job) => job,
            // A concurrent submission of the same id got there first.
            Err(TrackerError::DuplicateJob(_)) => {
                let existing = self.tracker.get(&job_id)?;
                return self.resubmit(existing, &operation, &input).await;
            }
            Err(e) => return Err(e.into()),
        };

        let state = self.dispatch(&job).await?;
        Ok(SubmitReceipt {
            job_id,
            state,
            created: true,
        })
    }

    async fn resubmit(
        &self,
        job: Job,
        operation: &Operation,
        input: &[u8],
    ) -> Result<SubmitReceipt, SubmitError> {
        if job.input_ref.sha256 != content_digest(input) || &job.operation != operation {
            return Err(SubmitError::Conflict(job.job_id));
        }
        let state = if job.state == JobState::Submitted {
            self.dispatch(&job).await?
        } else {
            job.state
        };
        debug!(job_id = %job.job_id, state = state.as_str(), "repeated submission");
        Ok(SubmitReceipt {
            job_id: job.job_id,
            state,
            created: false,
        })
    }

    async fn dispatch(&self, job: &Job) -> Result<JobState, SubmitError> {
        let message = DispatchMessage::new(
            job.job_id.clone(),
            job.operation.clone(),
            job.input_ref.clone(),
        );
        let body = Bytes::from(encode_message(&message)?);
        with_backoff(&self.retry, "queue.enqueue", || {
            self.queue.enqueue(body.clone())
        })
        .await?;

        let state = if self.tracker.mark_dispatched(&job.job_id)? {
            JobState::Dispatched
        } else {
            self.tracker.get(&job.job_id)?.state
        };
        info!(job_id = %job.job_id, "job dispatched");
        Ok(state)
    }
}
