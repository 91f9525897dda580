//! Worker loop: one job in flight at a time.
//!
//! ```text
//! Idle ──poll──► Claiming ──try_claim──► Processing ──► Reporting ──► Idle
//!   ▲               │                        │              │
//!   └───────────────┴──── error edges ───────┴──────────────┘
//! ```
//!
//! A message is acknowledged only once its job is settled: completed,
//! terminally failed, or found already terminal. A message whose claim
//! conflicts with another worker is left alone so the queue's visibility
//! timeout stays the only authority over redelivery.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use imgfleet_core::config::FleetConfig;
use imgfleet_core::protocol::{decode_message, encode_message};
use imgfleet_core::{ArtifactRef, DispatchMessage, JobId, ResultNotice, WorkerId};
use imgfleet_gateway::retry::{RetryPolicy, with_backoff};
use imgfleet_gateway::{ArtifactStore, Delivery, GatewayError, QueueGateway};
use imgfleet_health::{Heartbeat, HeartbeatRegistry};
use imgfleet_state::{
    Claim, ClaimOutcome, FailOutcome, JobState, JobTracker, TrackerError, WorkerPhase,
};

use crate::processor::{ProcessingError, Processor};

/// Artifact namespace for processed images.
pub const OUTPUT_NAMESPACE: &str = "outputs";

const MIN_PERIOD: Duration = Duration::from_millis(10);

/// Everything a worker needs, shared by all workers of a fleet.
#[derive(Clone)]
pub struct WorkerContext {
    pub tracker: JobTracker,
    pub queue: Arc<dyn QueueGateway>,
    /// Completion notices are published here when set.
    pub results: Option<Arc<dyn QueueGateway>>,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub processor: Arc<dyn Processor>,
    pub poll_wait: Duration,
    pub heartbeat_interval: Duration,
    pub progress_interval: Duration,
    pub retry_delay: Duration,
    /// Visibility granted to an in-flight message on each progress tick.
    pub visibility_timeout: Duration,
    pub retry: RetryPolicy,
}

impl WorkerContext {
    pub fn new(
        config: &FleetConfig,
        tracker: JobTracker,
        queue: Arc<dyn QueueGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        processor: Arc<dyn Processor>,
    ) -> Self {
        Self {
            tracker,
            queue,
            results: None,
            artifacts,
            processor,
            poll_wait: config.worker.poll_wait,
            heartbeat_interval: config.worker.heartbeat_interval,
            progress_interval: config.worker.progress_interval,
            retry_delay: config.worker.retry_delay,
            visibility_timeout: config.queue.visibility_timeout,
            retry: RetryPolicy::from(&config.gateway),
        }
    }

    pub fn with_results(mut self, results: Arc<dyn QueueGateway>) -> Self {
        self.results = Some(results);
        self
    }
}

/// What one [`WorkerLoop::step`] did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing arrived within the poll wait.
    Empty,
    /// Undecodable body, acknowledged and dropped.
    Malformed,
    /// Claimed by another worker or unknown to the tracker. Not acknowledged.
    Skipped { job_id: JobId },
    /// The job was already terminal. Acknowledged.
    Finished { job_id: JobId, state: JobState },
    Completed {
        job_id: JobId,
        output_ref: ArtifactRef,
    },
    /// Retryable failure. The message reappears after the retry delay.
    Requeued { job_id: JobId, reason: String },
    /// Terminal failure or attempts exhausted. Acknowledged.
    Failed { job_id: JobId, reason: String },
    /// A newer claim took the job over. Not acknowledged.
    Superseded { job_id: JobId },
}

enum Attempt {
    Done(Result<Bytes, ProcessingError>),
    Superseded,
}

pub struct WorkerLoop {
    worker_id: WorkerId,
    ctx: WorkerContext,
    registry: HeartbeatRegistry,
    status: watch::Sender<Heartbeat>,
    jobs_completed: u64,
}

impl WorkerLoop {
    pub fn new(worker_id: WorkerId, ctx: WorkerContext) -> Self {
        let registry = HeartbeatRegistry::new(ctx.tracker.store().clone());
        let (status, _) = watch::channel(Heartbeat::idle(0));
        Self {
            worker_id,
            ctx,
            registry,
            status,
            jobs_completed: 0,
        }
    }

    pub fn worker_id(&self) -> &WorkerId {
        &self.worker_id
    }

    /// The heartbeat this worker would send right now.
    pub fn status(&self) -> Heartbeat {
        self.status.borrow().clone()
    }

    pub fn jobs_completed(&self) -> u64 {
        self.jobs_completed
    }

    /// Register, then process messages until `shutdown` flips.
    ///
    /// Shutdown only interrupts the queue poll. A job already claimed is
    /// always carried to a settled state before the loop exits.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        self.registry
            .register(&self.worker_id)
            .context("registering worker")?;
        let heartbeat = self.spawn_heartbeat();
        info!(worker_id = %self.worker_id, "worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }
            let polled = tokio::select! {
                _ = shutdown.changed() => break,
                polled = self.poll() => polled,
            };
            let result = match polled {
                Ok(Some(delivery)) => self.handle(delivery).await,
                Ok(None) => continue,
                Err(e) => Err(e),
            };
            match result {
                Ok(outcome) => debug!(worker_id = %self.worker_id, ?outcome, "step finished"),
                Err(e) => {
                    error!(
                        worker_id = %self.worker_id,
                        error = %format!("{e:#}"),
                        "worker step failed"
                    );
                    tokio::select! {
                        _ = shutdown.changed() => break,
                        _ = tokio::time::sleep(self.ctx.retry_delay) => {}
                    }
                }
            }
        }

        heartbeat.abort();
        if let Err(e) = self.registry.deregister(&self.worker_id) {
            warn!(worker_id = %self.worker_id, error = %e, "failed to deregister");
        }
        info!(
            worker_id = %self.worker_id,
            jobs_completed = self.jobs_completed,
            "worker stopped"
        );
        Ok(())
    }

    /// Process at most one message.
    pub async fn step(&mut self) -> anyhow::Result<StepOutcome> {
        match self.poll().await? {
            Some(delivery) => self.handle(delivery).await,
            None => Ok(StepOutcome::Empty),
        }
    }

    async fn poll(&self) -> anyhow::Result<Option<Delivery>> {
        let wait = self.ctx.poll_wait;
        with_backoff(&self.ctx.retry, "queue.poll", || self.ctx.queue.poll(wait))
            .await
            .context("polling job queue")
    }

    async fn handle(&mut self, delivery: Delivery) -> anyhow::Result<StepOutcome> {
        let outcome = self.settle(&delivery).await;
        self.set_phase(WorkerPhase::Idle, None);
        outcome
    }

    async fn settle(&mut self, delivery: &Delivery) -> anyhow::Result<StepOutcome> {
        let message: DispatchMessage = match decode_message(&delivery.body) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    worker_id = %self.worker_id,
                    message_id = %delivery.message_id,
                    error = %e,
                    "dropping malformed message"
                );
                self.acknowledge(delivery).await;
                return Ok(StepOutcome::Malformed);
            }
        };
        let job_id = message.job_id.clone();

        self.set_phase(WorkerPhase::Claiming, Some(&job_id));
        let claim = match self.ctx.tracker.try_claim(&job_id, &self.worker_id) {
            Ok(ClaimOutcome::Claimed(claim)) => claim,
            Ok(ClaimOutcome::Finished(state)) => {
                debug!(%job_id, ?state, "message for finished job");
                self.acknowledge(delivery).await;
                return Ok(StepOutcome::Finished { job_id, state });
            }
            Err(e @ (TrackerError::AlreadyClaimed { .. } | TrackerError::NotFound(_))) => {
                debug!(%job_id, error = %e, "leaving message on the queue");
                return Ok(StepOutcome::Skipped { job_id });
            }
            Err(e) => return Err(e).with_context(|| format!("claiming job {job_id}")),
        };

        self.set_phase(WorkerPhase::Processing, Some(&job_id));
        let output = match self.process(&message, &claim, delivery).await {
            Attempt::Superseded => return Ok(StepOutcome::Superseded { job_id }),
            Attempt::Done(Ok(output)) => output,
            Attempt::Done(Err(failure)) => {
                return self.report_failure(&claim, delivery, failure).await;
            }
        };

        self.set_phase(WorkerPhase::Reporting, Some(&job_id));
        let stored = with_backoff(&self.ctx.retry, "artifacts.put", || {
            self.ctx.artifacts.put(OUTPUT_NAMESPACE, output.clone())
        })
        .await;
        let output_ref = match stored {
            Ok(output_ref) => output_ref,
            Err(e) => {
                let failure = gateway_failure("storing output", e);
                return self.report_failure(&claim, delivery, failure).await;
            }
        };

        match self
            .ctx
            .tracker
            .complete(&job_id, &claim.token, output_ref.clone())
        {
            Ok(()) => {}
            Err(e @ (TrackerError::StaleAttempt(_) | TrackerError::WrongState { .. })) => {
                warn!(%job_id, error = %e, "completion rejected");
                return Ok(StepOutcome::Superseded { job_id });
            }
            // Not acknowledged: the message comes back and the next claim
            // sees whatever the tracker eventually recorded.
            Err(e) => return Err(e).with_context(|| format!("completing job {job_id}")),
        }

        self.jobs_completed += 1;
        self.publish_result(&claim, &output_ref).await;
        self.acknowledge(delivery).await;
        info!(
            worker_id = %self.worker_id,
            %job_id,
            attempt = claim.attempt,
            output = %output_ref,
            "job completed"
        );
        Ok(StepOutcome::Completed { job_id, output_ref })
    }

    /// Fetch the input and run the processor, reporting progress meanwhile.
    async fn process(
        &self,
        message: &DispatchMessage,
        claim: &Claim,
        delivery: &Delivery,
    ) -> Attempt {
        let fetched = with_backoff(&self.ctx.retry, "artifacts.get", || {
            self.ctx.artifacts.get(&message.input_ref)
        })
        .await;
        let input = match fetched {
            Ok(input) => input,
            Err(e) => return Attempt::Done(Err(gateway_failure("fetching input", e))),
        };

        // Spawned so that a panicking processor surfaces as a JoinError.
        let processor = Arc::clone(&self.ctx.processor);
        let operation = message.operation.clone();
        let mut task = tokio::spawn(async move { processor.process(&operation, input).await });

        let period = self.ctx.progress_interval.max(MIN_PERIOD);
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            tokio::select! {
                joined = &mut task => {
                    return Attempt::Done(joined.unwrap_or_else(|e| {
                        Err(ProcessingError::Retryable(format!("processing task failed: {e}")))
                    }));
                }
                _ = ticker.tick() => {
                    if !self.report_progress(claim, delivery).await {
                        task.abort();
                        return Attempt::Superseded;
                    }
                }
            }
        }
    }

    /// Returns false once the attempt has been taken over.
    async fn report_progress(&self, claim: &Claim, delivery: &Delivery) -> bool {
        match self.ctx.tracker.touch(&claim.job_id, &claim.token) {
            Ok(()) => {}
            Err(TrackerError::State(e)) => {
                warn!(job_id = %claim.job_id, error = %e, "failed to record progress");
            }
            Err(e) => {
                warn!(job_id = %claim.job_id, error = %e, "attempt superseded, abandoning job");
                return false;
            }
        }
        let extended = self
            .ctx
            .queue
            .extend_visibility(&delivery.receipt, self.ctx.visibility_timeout)
            .await;
        if let Err(e) = extended {
            warn!(job_id = %claim.job_id, error = %e, "failed to extend message visibility");
        }
        true
    }

    async fn report_failure(
        &self,
        claim: &Claim,
        delivery: &Delivery,
        failure: ProcessingError,
    ) -> anyhow::Result<StepOutcome> {
        let job_id = claim.job_id.clone();
        let reason = failure.reason().to_string();
        let retryable = failure.is_retryable();

        let outcome = match self.ctx.tracker.fail(&job_id, &claim.token, &reason, retryable) {
            Ok(outcome) => outcome,
            Err(e @ (TrackerError::StaleAttempt(_) | TrackerError::WrongState { .. })) => {
                warn!(%job_id, error = %e, "failure report rejected");
                return Ok(StepOutcome::Superseded { job_id });
            }
            Err(e) => return Err(e).with_context(|| format!("failing job {job_id}")),
        };

        match outcome {
            FailOutcome::Requeued => {
                let delayed = self
                    .ctx
                    .queue
                    .extend_visibility(&delivery.receipt, self.ctx.retry_delay)
                    .await;
                if let Err(e) = delayed {
                    warn!(%job_id, error = %e, "failed to delay redelivery");
                }
                Ok(StepOutcome::Requeued { job_id, reason })
            }
            FailOutcome::Failed => {
                self.acknowledge(delivery).await;
                Ok(StepOutcome::Failed { job_id, reason })
            }
        }
    }

    async fn publish_result(&self, claim: &Claim, output_ref: &ArtifactRef) {
        let Some(results) = &self.ctx.results else {
            return;
        };
        let notice = ResultNotice {
            job_id: claim.job_id.clone(),
            attempt_token: claim.token.clone(),
            output_ref: output_ref.clone(),
        };
        let body = match encode_message(&notice) {
            Ok(body) => Bytes::from(body),
            Err(e) => {
                warn!(job_id = %claim.job_id, error = %e, "failed to encode result notice");
                return;
            }
        };
        let published =
            with_backoff(&self.ctx.retry, "results.enqueue", || results.enqueue(body.clone()))
                .await;
        if let Err(e) = published {
            warn!(job_id = %claim.job_id, error = %e, "failed to publish result notice");
        }
    }

    async fn acknowledge(&self, delivery: &Delivery) {
        let acked = with_backoff(&self.ctx.retry, "queue.acknowledge", || {
            self.ctx.queue.acknowledge(&delivery.receipt)
        })
        .await;
        if let Err(e) = acked {
            warn!(
                worker_id = %self.worker_id,
                message_id = %delivery.message_id,
                error = %e,
                "failed to acknowledge message, it will be redelivered"
            );
        }
    }

    fn set_phase(&self, phase: WorkerPhase, job_id: Option<&JobId>) {
        let jobs_completed = self.jobs_completed;
        self.status.send_modify(|beat| {
            beat.phase = phase;
            beat.current_job_id = job_id.cloned();
            beat.jobs_completed = jobs_completed;
        });
    }

    fn spawn_heartbeat(&self) -> JoinHandle<()> {
        let registry = self.registry.clone();
        let worker_id = self.worker_id.clone();
        let status = self.status.subscribe();
        let period = self.ctx.heartbeat_interval.max(MIN_PERIOD);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let beat = status.borrow().clone();
                match registry.heartbeat(&worker_id, beat) {
                    Ok(true) => {}
                    // Record was reaped while we were still alive.
                    Ok(false) => {
                        if let Err(e) = registry.register(&worker_id) {
                            warn!(%worker_id, error = %e, "failed to re-register");
                        }
                    }
                    Err(e) => warn!(%worker_id, error = %e, "heartbeat failed"),
                }
            }
        })
    }
}

/// A gateway call that exhausted its retries is retryable; anything else
/// about the artifact itself is not.
fn gateway_failure(what: &str, error: GatewayError) -> ProcessingError {
    match error {
        GatewayError::Unavailable { .. } | GatewayError::Io(_) => {
            ProcessingError::Retryable(format!("{what}: {error}"))
        }
        other => ProcessingError::Terminal(format!("{what}: {other}")),
    }
}
