//! Autoscaler: turns one observation of queue and fleet into a plan.
//!
//! Planning is pure apart from the cooldown bookkeeping: the autoscaler
//! remembers when it last decided to scale up and refuses to scale down
//! until `cooldown` has elapsed since then.

use std::time::Duration;

use tracing::debug;

use imgfleet_core::WorkerId;
use imgfleet_health::WorkerView;
use imgfleet_state::WorkerHealth;

use crate::policy::ScalingPolicy;

/// Inputs to one planning round.
#[derive(Debug, Clone)]
pub struct Observation {
    pub backlog: u64,
    pub oldest_age: Duration,
    pub workers: Vec<WorkerView>,
}

/// What one tick should do.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalePlan {
    pub desired: u32,
    /// Healthy workers.
    pub observed: u32,
    /// Launched but not yet registered.
    pub in_flight_launches: u32,
    pub in_flight_terminations: u32,
    /// Instances to launch.
    pub launch: u32,
    /// Healthy or starting instances to retire.
    pub terminate: Vec<WorkerId>,
    /// Unresponsive instances, terminated regardless of cooldown.
    pub replace: Vec<WorkerId>,
}

impl ScalePlan {
    pub fn is_noop(&self) -> bool {
        self.launch == 0 && self.terminate.is_empty() && self.replace.is_empty()
    }
}

pub struct Autoscaler {
    policy: ScalingPolicy,
    /// Unix millis of the last plan that launched instances.
    last_scale_up: Option<u64>,
}

impl Autoscaler {
    pub fn new(policy: ScalingPolicy) -> Self {
        Self {
            policy,
            last_scale_up: None,
        }
    }

    pub fn policy(&self) -> &ScalingPolicy {
        &self.policy
    }

    pub fn last_scale_up(&self) -> Option<u64> {
        self.last_scale_up
    }

    /// True while scale-down is suppressed.
    pub fn in_cooldown(&self, now: u64) -> bool {
        let cooldown = self.policy.cooldown.as_millis() as u64;
        self.last_scale_up
            .is_some_and(|at| now.saturating_sub(at) < cooldown)
    }

    pub fn plan(&mut self, obs: &Observation, now: u64) -> ScalePlan {
        let desired = self
            .policy
            .desired_count(obs.backlog, obs.oldest_age);

        let count = |health: WorkerHealth| {
            obs.workers.iter().filter(|w| w.health == health).count() as u32
        };
        let observed = count(WorkerHealth::Healthy);
        let starting = count(WorkerHealth::Starting);
        let terminating = count(WorkerHealth::Terminating);
        let capacity = observed + starting;

        let mut plan = ScalePlan {
            desired,
            observed,
            in_flight_launches: starting,
            in_flight_terminations: terminating,
            replace: obs
                .workers
                .iter()
                .filter(|w| w.health == WorkerHealth::Unresponsive)
                .map(|w| w.worker_id.clone())
                .collect(),
            ..ScalePlan::default()
        };

        if desired > capacity {
            let budget = self
                .policy
                .max_in_flight_launches
                .saturating_sub(starting);
            plan.launch = (desired - capacity).min(budget);
            if plan.launch > 0 {
                self.last_scale_up = Some(now);
                debug!(desired, capacity, launch = plan.launch, "scaling up");
            }
        } else if desired < capacity {
            if self.in_cooldown(now) {
                debug!(desired, capacity, "scale-down suppressed by cooldown");
            } else {
                plan.terminate = self.pick_victims(&obs.workers, capacity - desired, now);
                debug!(
                    desired,
                    capacity,
                    terminate = plan.terminate.len(),
                    "scaling down"
                );
            }
        }

        plan
    }

    /// Choose up to `excess` instances to retire: starting ones first, then
    /// idle healthy ones, then busy ones whose job has run past the hard
    /// staleness timeout.
    fn pick_victims(&self, workers: &[WorkerView], excess: u32, now: u64) -> Vec<WorkerId> {
        let mut starting: Vec<&WorkerView> = workers
            .iter()
            .filter(|w| w.health == WorkerHealth::Starting)
            .collect();
        // Newest launches have the least sunk boot time.
        starting.sort_by(|a, b| b.launched_at.cmp(&a.launched_at));

        let healthy = workers.iter().filter(|w| w.health == WorkerHealth::Healthy);
        let mut idle: Vec<&WorkerView> = healthy.clone().filter(|w| w.is_idle()).collect();
        idle.sort_by(|a, b| b.launched_at.cmp(&a.launched_at));

        let mut stale_busy: Vec<(&WorkerView, Duration)> = healthy
            .filter_map(|w| w.job_age(now).map(|age| (w, age)))
            .filter(|(_, age)| *age > self.policy.hard_staleness_timeout)
            .collect();
        stale_busy.sort_by(|a, b| b.1.cmp(&a.1));

        starting
            .into_iter()
            .chain(idle)
            .chain(stale_busy.into_iter().map(|(w, _)| w))
            .take(excess as usize)
            .map(|w| w.worker_id.clone())
            .collect()
    }
}
