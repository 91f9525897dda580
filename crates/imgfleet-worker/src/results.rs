//! Results queue consumer.
//!
//! Workers publish a [`ResultNotice`] after each completion when a results
//! queue is configured. The collector drains those notices, checks each one
//! against the tracker and acknowledges it. The tracker stays the source of
//! truth; a notice is only a hint that a job finished.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use imgfleet_core::protocol::decode_message;
use imgfleet_core::{JobId, ResultNotice};
use imgfleet_gateway::retry::{RetryPolicy, with_backoff};
use imgfleet_gateway::{Delivery, QueueGateway};
use imgfleet_state::{JobState, JobTracker, TrackerError};

/// What one [`ResultCollector::collect_once`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collected {
    Empty,
    Malformed,
    /// The tracker holds the job as done with the announced output.
    Confirmed { job_id: JobId },
    /// The tracker disagrees with the notice (unknown job, other state or
    /// other output).
    Mismatch { job_id: JobId },
}

pub struct ResultCollector {
    results: Arc<dyn QueueGateway>,
    tracker: JobTracker,
    retry: RetryPolicy,
    poll_wait: Duration,
}

impl ResultCollector {
    pub fn new(
        results: Arc<dyn QueueGateway>,
        tracker: JobTracker,
        retry: RetryPolicy,
        poll_wait: Duration,
    ) -> Self {
        Self {
            results,
            tracker,
            retry,
            poll_wait,
        }
    }

    /// Take at most one notice off the results queue.
    ///
    /// Every delivered notice is acknowledged, whatever its verdict. A
    /// tracker read failure leaves the notice for redelivery.
    pub async fn collect_once(&self) -> anyhow::Result<Collected> {
        let polled = with_backoff(&self.retry, "results.poll", || {
            self.results.poll(self.poll_wait)
        })
        .await?;
        let Some(delivery) = polled else {
            return Ok(Collected::Empty);
        };

        let notice: ResultNotice = match decode_message(&delivery.body) {
            Ok(notice) => notice,
            Err(e) => {
                warn!(message_id = %delivery.message_id, error = %e, "dropping malformed result notice");
                self.acknowledge(&delivery).await;
                return Ok(Collected::Malformed);
            }
        };

        let job_id = notice.job_id.clone();
        let verdict = match self.tracker.get(&job_id) {
            Ok(job)
                if job.state == JobState::Done
                    && job.output_ref.as_ref() == Some(&notice.output_ref) =>
            {
                info!(%job_id, output = %notice.output_ref, "result collected");
                Collected::Confirmed { job_id }
            }
            Ok(job) => {
                warn!(
                    %job_id,
                    state = job.state.as_str(),
                    output = %notice.output_ref,
                    "result notice does not match tracked job"
                );
                Collected::Mismatch { job_id }
            }
            Err(TrackerError::NotFound(_)) => {
                warn!(%job_id, "result notice for unknown job");
                Collected::Mismatch { job_id }
            }
            Err(e) => return Err(e.into()),
        };
        self.acknowledge(&delivery).await;
        Ok(verdict)
    }

    /// Drain notices until `shutdown` flips.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!("result collector started");
        loop {
            tokio::select! {
                collected = self.collect_once() => {
                    if let Err(e) = collected {
                        warn!(error = %format!("{e:#}"), "result collection failed");
                        tokio::time::sleep(self.poll_wait).await;
                    }
                }
                _ = shutdown.changed() => {
                    info!("result collector shutting down");
                    break;
                }
            }
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        let acked = with_backoff(&self.retry, "results.acknowledge", || {
            self.results.acknowledge(&delivery.receipt)
        })
        .await;
        match acked {
            Ok(()) => debug!(message_id = %delivery.message_id, "result notice acknowledged"),
            Err(e) => warn!(message_id = %delivery.message_id, error = %e, "failed to acknowledge result notice"),
        }
    }
}
