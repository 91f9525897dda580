//! Prometheus text exposition format.

use imgfleet_state::{JobCounts, PoolState, WorkerPhase, WorkerRecord};

/// Render job, pool and worker gauges.
///
/// Pool gauges are omitted until the scaling controller has written its
/// first snapshot.
pub fn render_prometheus(
    counts: &JobCounts,
    pool: Option<&PoolState>,
    workers: &[WorkerRecord],
) -> String {
    let mut out = String::new();

    out.push_str("# HELP imgfleet_jobs Jobs by lifecycle state.\n");
    out.push_str("# TYPE imgfleet_jobs gauge\n");
    for (state, n) in [
        ("submitted", counts.submitted),
        ("dispatched", counts.dispatched),
        ("processing", counts.processing),
        ("done", counts.done),
        ("failed", counts.failed),
    ] {
        out.push_str(&format!("imgfleet_jobs{{state=\"{state}\"}} {n}\n"));
    }

    if let Some(pool) = pool {
        gauge(
            &mut out,
            "imgfleet_pool_desired",
            "Target pool size from the last scaling tick.",
            pool.desired_count.into(),
        );
        gauge(
            &mut out,
            "imgfleet_pool_observed",
            "Healthy workers in the fleet listing.",
            pool.observed_count.into(),
        );
        gauge(
            &mut out,
            "imgfleet_pool_in_flight_launches",
            "Launched workers not yet registered.",
            pool.in_flight_launches.into(),
        );
        gauge(
            &mut out,
            "imgfleet_pool_in_flight_terminations",
            "Workers shutting down.",
            pool.in_flight_terminations.into(),
        );
        gauge(
            &mut out,
            "imgfleet_pool_unresponsive",
            "Workers that missed their heartbeats.",
            pool.unresponsive.into(),
        );
        gauge(
            &mut out,
            "imgfleet_queue_backlog",
            "Unacknowledged messages on the job queue.",
            pool.backlog,
        );
        out.push_str("# HELP imgfleet_queue_oldest_age_seconds Age of the oldest queued message.\n");
        out.push_str("# TYPE imgfleet_queue_oldest_age_seconds gauge\n");
        out.push_str(&format!(
            "imgfleet_queue_oldest_age_seconds {:.3}\n",
            pool.oldest_age_ms as f64 / 1000.0
        ));
    }

    out.push_str("# HELP imgfleet_workers Registered workers by phase.\n");
    out.push_str("# TYPE imgfleet_workers gauge\n");
    for phase in [
        WorkerPhase::Idle,
        WorkerPhase::Claiming,
        WorkerPhase::Processing,
        WorkerPhase::Reporting,
    ] {
        let n = workers.iter().filter(|w| w.phase == phase).count();
        out.push_str(&format!(
            "imgfleet_workers{{phase=\"{}\"}} {n}\n",
            phase_name(phase)
        ));
    }

    out.push_str("# HELP imgfleet_worker_jobs_completed_total Jobs completed per worker.\n");
    out.push_str("# TYPE imgfleet_worker_jobs_completed_total counter\n");
    for w in workers {
        out.push_str(&format!(
            "imgfleet_worker_jobs_completed_total{{worker=\"{}\"}} {}\n",
            w.worker_id, w.jobs_completed
        ));
    }

    out
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    out.push_str(&format!("# HELP {name} {help}\n"));
    out.push_str(&format!("# TYPE {name} gauge\n"));
    out.push_str(&format!("{name} {value}\n"));
}

fn phase_name(phase: WorkerPhase) -> &'static str {
    match phase {
        WorkerPhase::Idle => "idle",
        WorkerPhase::Claiming => "claiming",
        WorkerPhase::Processing => "processing",
        WorkerPhase::Reporting => "reporting",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use imgfleet_core::WorkerId;

    fn worker(id: &str, phase: WorkerPhase, jobs_completed: u64) -> WorkerRecord {
        WorkerRecord {
            worker_id: WorkerId::new(id),
            registered_at: 1000,
            last_heartbeat: 1000,
            phase,
            current_job_id: None,
            job_started_at: None,
            jobs_completed,
        }
    }

    #[test]
    fn render_empty() {
        let output = render_prometheus(&JobCounts::default(), None, &[]);
        assert!(output.contains("# TYPE imgfleet_jobs gauge"));
        assert!(output.contains("imgfleet_jobs{state=\"done\"} 0"));
        assert!(!output.contains("imgfleet_pool_desired"));
    }

    #[test]
    fn render_jobs_pool_and_workers() {
        let counts = JobCounts {
            submitted: 3,
            processing: 2,
            done: 7,
            failed: 1,
            ..JobCounts::default()
        };
        let pool = PoolState {
            desired_count: 4,
            observed_count: 3,
            in_flight_launches: 1,
            backlog: 12,
            oldest_age_ms: 2500,
            ..PoolState::default()
        };
        let workers = vec![
            worker("i-1", WorkerPhase::Processing, 5),
            worker("i-2", WorkerPhase::Idle, 2),
        ];
        let output = render_prometheus(&counts, Some(&pool), &workers);

        assert!(output.contains("imgfleet_jobs{state=\"submitted\"} 3"));
        assert!(output.contains("imgfleet_jobs{state=\"failed\"} 1"));
        assert!(output.contains("imgfleet_pool_desired 4"));
        assert!(output.contains("imgfleet_pool_observed 3"));
        assert!(output.contains("imgfleet_pool_in_flight_launches 1"));
        assert!(output.contains("imgfleet_queue_backlog 12"));
        assert!(output.contains("imgfleet_queue_oldest_age_seconds 2.500"));
        assert!(output.contains("imgfleet_workers{phase=\"processing\"} 1"));
        assert!(output.contains("imgfleet_workers{phase=\"reporting\"} 0"));
        assert!(output.contains("imgfleet_worker_jobs_completed_total{worker=\"i-1\"} 5"));
    }
}
