//! Scaling policy: the pure target-size computation.

use std::time::Duration;

use imgfleet_core::config::ScalingConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct ScalingPolicy {
    pub jobs_per_worker_target: u32,
    pub min_pool: u32,
    pub max_pool: u32,
    pub latency_threshold: Duration,
    pub cooldown: Duration,
    pub max_in_flight_launches: u32,
    pub hard_staleness_timeout: Duration,
}

impl Default for ScalingPolicy {
    fn default() -> Self {
        Self::from(&ScalingConfig::default())
    }
}

impl From<&ScalingConfig> for ScalingPolicy {
    fn from(config: &ScalingConfig) -> Self {
        Self {
            jobs_per_worker_target: config.jobs_per_worker_target,
            min_pool: config.min_pool,
            max_pool: config.max_pool,
            latency_threshold: config.latency_threshold,
            cooldown: config.cooldown,
            max_in_flight_launches: config.max_in_flight_launches,
            hard_staleness_timeout: config.hard_staleness_timeout,
        }
    }
}

impl ScalingPolicy {
    /// Target pool size for the given queue depth.
    pub fn desired_count(&self, backlog: u64, oldest_age: Duration) -> u32 {
        let per_worker = u64::from(self.jobs_per_worker_target.max(1));
        let base = backlog
            .div_ceil(per_worker)
            .max(u64::from(self.min_pool))
            .min(u64::from(self.max_pool)) as u32;

        if oldest_age > self.latency_threshold {
            base.saturating_add(1).min(self.max_pool)
        } else {
            base
        }
    }
}
