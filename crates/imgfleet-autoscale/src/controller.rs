//! Scaling controller: the periodic control loop.
//!
//! Each tick:
//! 1. reads queue depth and the live fleet listing (ground truth)
//! 2. joins the listing with heartbeat records to infer worker health
//! 3. plans with the [`Autoscaler`] and issues launch/terminate commands
//! 4. reaps heartbeat records of replaced or vanished instances
//! 5. re-enqueues jobs stranded in `Submitted`
//! 6. persists a [`PoolState`] snapshot

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use tracing::{debug, error, info, warn};

use imgfleet_core::config::FleetConfig;
use imgfleet_core::protocol::encode_message;
use imgfleet_core::{DispatchMessage, JobId, WorkerId, epoch_millis};
use imgfleet_gateway::retry::{RetryPolicy, with_backoff};
use imgfleet_gateway::{FleetGateway, FleetInstance, QueueGateway};
use imgfleet_health::{HealthPolicy, HeartbeatRegistry, observe};
use imgfleet_state::{Job, JobState, JobTracker, PoolState};

use crate::policy::ScalingPolicy;
use crate::scaler::{Autoscaler, Observation, ScalePlan};

/// What a single tick did.
#[derive(Debug, Clone, Default)]
pub struct TickReport {
    pub plan: ScalePlan,
    pub launched: Vec<WorkerId>,
    pub terminated: Vec<WorkerId>,
    pub reaped: Vec<WorkerId>,
    pub redispatched: Vec<JobId>,
}

pub struct ScalingController {
    autoscaler: Autoscaler,
    tracker: JobTracker,
    registry: HeartbeatRegistry,
    queue: Arc<dyn QueueGateway>,
    fleet: Arc<dyn FleetGateway>,
    health: HealthPolicy,
    retry: RetryPolicy,
    worker_image: String,
    redispatch_after: Duration,
}

impl ScalingController {
    pub fn new(
        config: &FleetConfig,
        tracker: JobTracker,
        queue: Arc<dyn QueueGateway>,
        fleet: Arc<dyn FleetGateway>,
    ) -> Self {
        let registry = HeartbeatRegistry::new(tracker.store().clone());
        Self {
            autoscaler: Autoscaler::new(ScalingPolicy::from(&config.scaling)),
            tracker,
            registry,
            queue,
            fleet,
            health: HealthPolicy::from(&config.worker),
            retry: RetryPolicy::from(&config.gateway),
            worker_image: config.scaling.worker_image.clone(),
            redispatch_after: config.tracker.redispatch_after,
        }
    }

    pub fn autoscaler(&self) -> &Autoscaler {
        &self.autoscaler
    }

    /// Run one control-loop iteration.
    pub async fn tick(&mut self) -> anyhow::Result<TickReport> {
        let stats = with_backoff(&self.retry, "queue.stats", || self.queue.stats())
            .await
            .context("reading queue depth")?;
        let instances = with_backoff(&self.retry, "fleet.list", || self.fleet.list())
            .await
            .context("listing fleet")?;
        let records = self.registry.list().context("reading heartbeats")?;

        let now = epoch_millis();
        let workers = observe(&instances, &records, now, &self.health);
        let plan = self.autoscaler.plan(
            &Observation {
                backlog: stats.backlog,
                oldest_age: stats.oldest_age,
                workers,
            },
            now,
        );

        let mut report = TickReport::default();

        if plan.launch > 0 {
            // Not retried in-tick: a launch that partly happened before the
            // error shows up in the next listing instead.
            match self.fleet.launch(plan.launch, &self.worker_image).await {
                Ok(ids) => {
                    info!(requested = plan.launch, started = ids.len(), "launched workers");
                    report.launched = ids;
                }
                Err(e) => warn!(count = plan.launch, error = %e, "launch failed"),
            }
        }

        for worker_id in plan.terminate.iter().chain(&plan.replace) {
            let result = with_backoff(&self.retry, "fleet.terminate", || {
                self.fleet.terminate(worker_id)
            })
            .await;
            match result {
                Ok(()) => {
                    info!(%worker_id, "terminated worker");
                    report.terminated.push(worker_id.clone());
                }
                Err(e) => warn!(%worker_id, error = %e, "terminate failed"),
            }
        }

        report.reaped = self.reap(&plan, &instances)?;
        report.redispatched = self.redispatch_stranded(now).await?;

        let pool = PoolState {
            desired_count: plan.desired,
            observed_count: plan.observed,
            in_flight_launches: plan.in_flight_launches + report.launched.len() as u32,
            in_flight_terminations: plan.in_flight_terminations
                + report.terminated.len() as u32,
            unresponsive: plan.replace.len() as u32,
            backlog: stats.backlog,
            oldest_age_ms: stats.oldest_age.as_millis() as u64,
            last_scale_up_at: self.autoscaler.last_scale_up(),
            updated_at: now,
        };
        self.tracker
            .store()
            .put_pool_state(&pool)
            .context("persisting pool state")?;

        debug!(
            desired = plan.desired,
            observed = plan.observed,
            backlog = stats.backlog,
            "tick complete"
        );
        report.plan = plan;
        Ok(report)
    }

    /// Drop heartbeat records of replaced workers and of instances that no
    /// longer appear in the fleet listing.
    fn reap(
        &self,
        plan: &ScalePlan,
        instances: &[FleetInstance],
    ) -> anyhow::Result<Vec<WorkerId>> {
        let mut reaped = self
            .registry
            .reap(&plan.replace)
            .context("reaping unresponsive workers")?;
        let live: HashSet<WorkerId> = instances.iter().map(|i| i.worker_id.clone()).collect();
        reaped.extend(
            self.registry
                .reap_orphans(&live)
                .context("reaping vanished workers")?,
        );
        Ok(reaped)
    }

    /// Re-enqueue jobs that sat in `Submitted` longer than `redispatch_after`:
    /// requeued after a retryable failure, or never enqueued because the
    /// submission path failed part-way.
    async fn redispatch_stranded(&self, now: u64) -> anyhow::Result<Vec<JobId>> {
        let after = self.redispatch_after.as_millis() as u64;
        let stranded: Vec<_> = self
            .tracker
            .list(Some(JobState::Submitted), usize::MAX)
            .context("listing submitted jobs")?
            .into_iter()
            .filter(|job| now.saturating_sub(job.updated_at) >= after)
            .collect();

        let mut redispatched = Vec::new();
        for job in stranded {
            let job_id = job.job_id.clone();
            if self.enqueue(job).await? {
                redispatched.push(job_id);
            }
        }
        Ok(redispatched)
    }

    /// Re-enqueue every unfinished job.
    ///
    /// Called once at startup when the queue does not survive restarts.
    /// Jobs still marked `Processing` are claimed again once their previous
    /// claim goes stale.
    pub async fn requeue_unfinished(&self) -> anyhow::Result<usize> {
        let mut requeued = 0;
        for state in [JobState::Submitted, JobState::Dispatched, JobState::Processing] {
            let jobs = self
                .tracker
                .list(Some(state), usize::MAX)
                .context("listing unfinished jobs")?;
            for job in jobs {
                if self.enqueue(job).await? {
                    requeued += 1;
                }
            }
        }
        info!(requeued, "unfinished jobs requeued");
        Ok(requeued)
    }

    /// Put a fresh dispatch message for `job` on the queue. Returns false if
    /// the enqueue failed; the next sweep tries again.
    async fn enqueue(&self, job: Job) -> anyhow::Result<bool> {
        let msg = DispatchMessage::new(job.job_id.clone(), job.operation, job.input_ref)
            .replacing(job.attempt_token);
        let body = Bytes::from(encode_message(&msg)?);
        let enqueued = with_backoff(&self.retry, "queue.enqueue", || {
            self.queue.enqueue(body.clone())
        })
        .await;
        if let Err(e) = enqueued {
            warn!(job_id = %job.job_id, error = %e, "redispatch enqueue failed");
            return Ok(false);
        }
        // A claim may have raced the enqueue; the state check makes this
        // a no-op then.
        self.tracker.mark_dispatched(&job.job_id)?;
        info!(job_id = %job.job_id, attempts = job.attempt_count, "job redispatched");
        Ok(true)
    }

    /// Run the control loop until shutdown is signalled.
    pub async fn run(
        &mut self,
        interval: Duration,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) {
        info!(interval_ms = interval.as_millis() as u64, "scaling controller started");

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = self.tick().await {
                        error!(error = %format!("{e:#}"), "scaling tick failed");
                    }
                }
                _ = shutdown.changed() => {
                    info!("scaling controller shutting down");
                    break;
                }
            }
        }
    }
}
