//! Health inference from the fleet listing and heartbeat records.

use std::collections::HashMap;
use std::time::Duration;

use serde::Serialize;

use imgfleet_core::config::WorkerConfig;
use imgfleet_core::{JobId, WorkerId};
use imgfleet_gateway::{FleetInstance, InstanceState};
use imgfleet_state::{WorkerHealth, WorkerPhase, WorkerRecord};

#[derive(Debug, Clone, Copy)]
pub struct HealthPolicy {
    /// Silence after which a worker is considered unresponsive. Also bounds
    /// how long a launched instance may take to register.
    pub unresponsive_after: Duration,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self::from(&WorkerConfig::default())
    }
}

impl From<&WorkerConfig> for HealthPolicy {
    fn from(config: &WorkerConfig) -> Self {
        Self {
            unresponsive_after: config.unresponsive_after,
        }
    }
}

/// Infer the health of one fleet instance.
pub fn classify(
    instance: &FleetInstance,
    record: Option<&WorkerRecord>,
    now: u64,
    policy: &HealthPolicy,
) -> WorkerHealth {
    let limit = policy.unresponsive_after.as_millis() as u64;
    if instance.state == InstanceState::ShuttingDown {
        return WorkerHealth::Terminating;
    }
    match record {
        None if now.saturating_sub(instance.launched_at) > limit => WorkerHealth::Unresponsive,
        None => WorkerHealth::Starting,
        Some(r) if now.saturating_sub(r.last_heartbeat) <= limit => WorkerHealth::Healthy,
        Some(_) => WorkerHealth::Unresponsive,
    }
}

/// One fleet member as seen by the controller and the API.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerView {
    pub worker_id: WorkerId,
    pub launched_at: u64,
    pub health: WorkerHealth,
    pub phase: Option<WorkerPhase>,
    pub current_job_id: Option<JobId>,
    pub job_started_at: Option<u64>,
    pub last_heartbeat: Option<u64>,
    pub jobs_completed: u64,
}

impl WorkerView {
    pub fn is_idle(&self) -> bool {
        self.current_job_id.is_none()
    }

    /// How long the current job has been running, if any.
    pub fn job_age(&self, now: u64) -> Option<Duration> {
        self.job_started_at
            .filter(|_| self.current_job_id.is_some())
            .map(|started| Duration::from_millis(now.saturating_sub(started)))
    }
}

/// Join the fleet listing with heartbeat records.
///
/// Records with no matching instance are not reported; they belong to
/// instances that are gone and are left for the caller to reap.
pub fn observe(
    instances: &[FleetInstance],
    records: &[WorkerRecord],
    now: u64,
    policy: &HealthPolicy,
) -> Vec<WorkerView> {
    let by_id: HashMap<&WorkerId, &WorkerRecord> =
        records.iter().map(|r| (&r.worker_id, r)).collect();

    instances
        .iter()
        .map(|instance| {
            let record = by_id.get(&instance.worker_id).copied();
            WorkerView {
                worker_id: instance.worker_id.clone(),
                launched_at: instance.launched_at,
                health: classify(instance, record, now, policy),
                phase: record.map(|r| r.phase),
                current_job_id: record.and_then(|r| r.current_job_id.clone()),
                job_started_at: record.and_then(|r| r.job_started_at),
                last_heartbeat: record.map(|r| r.last_heartbeat),
                jobs_completed: record.map_or(0, |r| r.jobs_completed),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_000_000;

    fn policy() -> HealthPolicy {
        HealthPolicy {
            unresponsive_after: Duration::from_secs(30),
        }
    }

    fn instance(id: &str, launched_at: u64, state: InstanceState) -> FleetInstance {
        FleetInstance {
            worker_id: WorkerId::new(id),
            launched_at,
            state,
        }
    }

    fn record(id: &str, last_heartbeat: u64, job: Option<&str>) -> WorkerRecord {
        WorkerRecord {
            worker_id: WorkerId::new(id),
            registered_at: last_heartbeat,
            last_heartbeat,
            phase: if job.is_some() {
                WorkerPhase::Processing
            } else {
                WorkerPhase::Idle
            },
            current_job_id: job.map(JobId::new),
            job_started_at: job.map(|_| last_heartbeat),
            jobs_completed: 0,
        }
    }

    #[test]
    fn unregistered_instance_is_starting_then_unresponsive() {
        let fresh = instance("i-1", NOW - 5_000, InstanceState::Pending);
        assert_eq!(classify(&fresh, None, NOW, &policy()), WorkerHealth::Starting);

        let slow = instance("i-1", NOW - 31_000, InstanceState::Running);
        assert_eq!(
            classify(&slow, None, NOW, &policy()),
            WorkerHealth::Unresponsive
        );
    }

    #[test]
    fn registered_worker_is_healthy_only_while_heartbeating() {
        let inst = instance("i-1", NOW - 600_000, InstanceState::Running);
        let recent = record("i-1", NOW - 10_000, None);
        assert_eq!(
            classify(&inst, Some(&recent), NOW, &policy()),
            WorkerHealth::Healthy
        );

        let silent = record("i-1", NOW - 45_000, None);
        assert_eq!(
            classify(&inst, Some(&silent), NOW, &policy()),
            WorkerHealth::Unresponsive
        );
    }

    #[test]
    fn shutting_down_wins_over_heartbeats() {
        let inst = instance("i-1", NOW - 600_000, InstanceState::ShuttingDown);
        let recent = record("i-1", NOW, None);
        assert_eq!(
            classify(&inst, Some(&recent), NOW, &policy()),
            WorkerHealth::Terminating
        );
    }

    #[test]
    fn observe_joins_listing_and_records() {
        let instances = vec![
            instance("i-1", NOW - 600_000, InstanceState::Running),
            instance("i-2", NOW - 1_000, InstanceState::Pending),
        ];
        let records = vec![
            record("i-1", NOW - 1_000, Some("job-7")),
            record("i-orphan", NOW, None),
        ];

        let views = observe(&instances, &records, NOW, &policy());
        assert_eq!(views.len(), 2);

        assert_eq!(views[0].health, WorkerHealth::Healthy);
        assert_eq!(views[0].current_job_id, Some(JobId::new("job-7")));
        assert!(!views[0].is_idle());
        assert_eq!(views[0].job_age(NOW), Some(Duration::from_secs(1)));

        assert_eq!(views[1].health, WorkerHealth::Starting);
        assert!(views[1].is_idle());
        assert_eq!(views[1].phase, None);
        assert_eq!(views[1].job_age(NOW), None);
    }

    #[test]
    fn view_serializes_health_in_snake_case() {
        let views = observe(
            &[instance("i-1", NOW, InstanceState::Pending)],
            &[],
            NOW,
            &policy(),
        );
        let json = serde_json::to_value(&views[0]).unwrap();
        assert_eq!(json["health"], "starting");
        assert_eq!(json["worker_id"], "i-1");
    }
}
