//! Standalone end-to-end tests.
//!
//! Assembles the daemon's subsystems in-process and drives them through the
//! REST API: submission, autoscaled processing, failure reporting, pool
//! snapshots, metrics, result notices and restart recovery.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use bytes::Bytes;
use serde_json::Value;
use tower::ServiceExt;

use imgfleet_api::{ApiState, build_router};
use imgfleet_autoscale::ScalingController;
use imgfleet_core::config::FleetConfig;
use imgfleet_core::{JobId, Operation};
use imgfleet_gateway::retry::RetryPolicy;
use imgfleet_gateway::{MemoryArtifactStore, MemoryFleet, MemoryQueue};
use imgfleet_state::{JobState, JobTracker, StateStore, TrackerPolicy};
use imgfleet_worker::{
    Collected, LocalFleet, ProcessFuture, ProcessingError, Processor, ResultCollector,
    WorkerContext,
};

/// Reverses the image bytes; rejects inputs starting with "corrupt".
struct Reverse;

impl Processor for Reverse {
    fn process<'a>(&'a self, _operation: &'a Operation, input: Bytes) -> ProcessFuture<'a> {
        Box::pin(async move {
            if input.starts_with(b"corrupt") {
                return Err(ProcessingError::Terminal("unsupported image header".into()));
            }
            let mut out = input.to_vec();
            out.reverse();
            Ok(Bytes::from(out))
        })
    }
}

struct Daemon {
    router: Router,
    controller: ScalingController,
    tracker: JobTracker,
    queue: Arc<MemoryQueue>,
    results: Option<Arc<MemoryQueue>>,
    fleet: Arc<LocalFleet>,
}

fn test_config() -> FleetConfig {
    let mut config = FleetConfig::default();
    config.gateway.max_retries = 0;
    config.worker.poll_wait = Duration::from_millis(200);
    config.worker.heartbeat_interval = Duration::from_secs(1);
    config
}

fn daemon(config: &FleetConfig) -> Daemon {
    let tracker = JobTracker::new(
        StateStore::open_in_memory().unwrap(),
        TrackerPolicy::from(&config.tracker),
    );
    let queue = Arc::new(MemoryQueue::new("jobs", config.queue.visibility_timeout));
    let results = config
        .queue
        .publish_results
        .then(|| Arc::new(MemoryQueue::new("results", config.queue.visibility_timeout)));
    let artifacts = Arc::new(MemoryArtifactStore::new());
    let mut ctx = WorkerContext::new(
        config,
        tracker.clone(),
        queue.clone(),
        artifacts.clone(),
        Arc::new(Reverse),
    );
    if let Some(results) = &results {
        ctx = ctx.with_results(results.clone());
    }
    let fleet = Arc::new(LocalFleet::new(ctx));
    let controller =
        ScalingController::new(config, tracker.clone(), queue.clone(), fleet.clone());
    let router = build_router(ApiState::new(
        tracker.clone(),
        queue.clone(),
        artifacts,
        RetryPolicy::none(),
    ));
    Daemon {
        router,
        controller,
        tracker,
        queue,
        results,
        fleet,
    }
}

async fn send(router: &Router, req: Request<Body>) -> (StatusCode, Bytes) {
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
        .await
        .unwrap();
    (status, body)
}

async fn get(router: &Router, uri: &str) -> (StatusCode, Bytes) {
    let req = Request::builder().uri(uri).body(Body::empty()).unwrap();
    send(router, req).await
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, Value) {
    let (status, body) = get(router, uri).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn submit(router: &Router, job_id: &str, image: &'static [u8]) -> (StatusCode, Value) {
    let req = Request::builder()
        .method("POST")
        .uri(format!("/api/v1/jobs?job_id={job_id}"))
        .header("content-type", "application/octet-stream")
        .body(Body::from(image))
        .unwrap();
    let (status, body) = send(router, req).await;
    (status, serde_json::from_slice(&body).unwrap())
}

async fn wait_for_state(tracker: &JobTracker, job_id: &str, state: JobState) {
    let id = JobId::new(job_id);
    for _ in 0..100 {
        if tracker.get(&id).unwrap().state == state {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job {job_id} never reached {}", state.as_str());
}

#[tokio::test(start_paused = true)]
async fn submitted_job_is_processed_by_an_autoscaled_worker() {
    let mut d = daemon(&test_config());

    let (status, body) = submit(&d.router, "job-1", b"abc").await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["state"], "dispatched");

    // Backlog of one at min_pool 1: a single worker is launched.
    let report = d.controller.tick().await.unwrap();
    assert_eq!(report.launched.len(), 1);

    wait_for_state(&d.tracker, "job-1", JobState::Done).await;

    let (status, body) = get_json(&d.router, "/api/v1/jobs/job-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["state"], "done");
    assert_eq!(body["data"]["attempt_count"], 1);

    let (status, output) = get(&d.router, "/api/v1/jobs/job-1/output").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&output[..], b"cba");

    // Let the next heartbeat carry the completion count.
    tokio::time::sleep(Duration::from_secs(2)).await;
    let (status, body) = get_json(&d.router, "/api/v1/workers").await;
    assert_eq!(status, StatusCode::OK);
    let workers = body["data"].as_array().unwrap();
    assert_eq!(workers.len(), 1);
    assert_eq!(workers[0]["jobs_completed"], 1);

    // The message was acknowledged.
    assert!(d.queue.is_empty().await);
    d.fleet.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn completion_notice_is_collected_when_results_are_published() {
    let mut config = test_config();
    config.queue.publish_results = true;
    let mut d = daemon(&config);

    submit(&d.router, "job-1", b"abc").await;
    d.controller.tick().await.unwrap();
    wait_for_state(&d.tracker, "job-1", JobState::Done).await;

    let results = d.results.clone().unwrap();
    let collector = ResultCollector::new(
        results.clone(),
        d.tracker.clone(),
        RetryPolicy::none(),
        Duration::from_millis(200),
    );
    assert_eq!(
        collector.collect_once().await.unwrap(),
        Collected::Confirmed {
            job_id: JobId::new("job-1")
        }
    );
    assert!(results.is_empty().await);
    d.fleet.shutdown().await;
}

#[tokio::test]
async fn results_queue_is_off_by_default() {
    assert!(daemon(&test_config()).results.is_none());
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_is_reported_through_status() {
    let mut d = daemon(&test_config());

    submit(&d.router, "job-bad", b"corrupt-bytes").await;
    d.controller.tick().await.unwrap();

    wait_for_state(&d.tracker, "job-bad", JobState::Failed).await;

    let (_, body) = get_json(&d.router, "/api/v1/jobs/job-bad").await;
    assert_eq!(body["data"]["state"], "failed");
    assert_eq!(body["data"]["attempt_count"], 1);
    assert!(
        body["data"]["last_error"]
            .as_str()
            .unwrap()
            .contains("unsupported image header")
    );

    let (status, _) = get(&d.router, "/api/v1/jobs/job-bad/output").await;
    assert_eq!(status, StatusCode::CONFLICT);

    // Not redelivered: the failed job's message is gone.
    assert!(d.queue.is_empty().await);
    d.fleet.shutdown().await;
}

#[tokio::test]
async fn backlog_of_one_hundred_targets_ten_workers() {
    let mut config = test_config();
    config.scaling.max_in_flight_launches = 20;

    let tracker = JobTracker::new(
        StateStore::open_in_memory().unwrap(),
        TrackerPolicy::from(&config.tracker),
    );
    let queue = Arc::new(MemoryQueue::new("jobs", config.queue.visibility_timeout));
    let fleet = Arc::new(MemoryFleet::new());
    let mut controller =
        ScalingController::new(&config, tracker.clone(), queue.clone(), fleet.clone());
    let router = build_router(ApiState::new(
        tracker,
        queue,
        Arc::new(MemoryArtifactStore::new()),
        RetryPolicy::none(),
    ));

    let (status, _) = get(&router, "/api/v1/pool").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    for i in 0..100 {
        let (status, _) = submit(&router, &format!("job-{i}"), b"img").await;
        assert_eq!(status, StatusCode::CREATED);
    }

    let report = controller.tick().await.unwrap();
    assert_eq!(report.plan.desired, 10);
    assert_eq!(fleet.launched_total().await, 10);

    let (status, body) = get_json(&router, "/api/v1/pool").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["desired_count"], 10);
    assert_eq!(body["data"]["backlog"], 100);

    let (status, metrics) = get(&router, "/metrics").await;
    assert_eq!(status, StatusCode::OK);
    let text = String::from_utf8(metrics.to_vec()).unwrap();
    assert!(text.contains("imgfleet_jobs{state=\"dispatched\"} 100"));
    assert!(text.contains("imgfleet_pool_desired 10"));
    assert!(text.contains("imgfleet_queue_backlog 100"));
}

#[tokio::test]
async fn list_filters_by_state() {
    let d = daemon(&test_config());
    submit(&d.router, "job-1", b"one").await;
    submit(&d.router, "job-2", b"two").await;

    let (status, body) = get_json(&d.router, "/api/v1/jobs?state=dispatched").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 2);

    let (_, body) = get_json(&d.router, "/api/v1/jobs?state=done").await;
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, _) = get(&d.router, "/api/v1/jobs?state=lost").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn resubmission_is_idempotent_over_http() {
    let d = daemon(&test_config());
    let (status, _) = submit(&d.router, "job-1", b"img").await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = submit(&d.router, "job-1", b"img").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["created"], false);
    assert_eq!(d.queue.len().await, 1);

    let (status, _) = submit(&d.router, "job-1", b"other").await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn restart_requeues_unfinished_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("imgfleet.redb");
    let config = test_config();

    {
        let tracker = JobTracker::new(
            StateStore::open(&db_path).unwrap(),
            TrackerPolicy::from(&config.tracker),
        );
        let router = build_router(ApiState::new(
            tracker,
            Arc::new(MemoryQueue::new("jobs", config.queue.visibility_timeout)),
            Arc::new(MemoryArtifactStore::new()),
            RetryPolicy::none(),
        ));
        submit(&router, "job-1", b"one").await;
        submit(&router, "job-2", b"two").await;
    }

    // The queue did not survive; the tracker did.
    let tracker = JobTracker::new(
        StateStore::open(&db_path).unwrap(),
        TrackerPolicy::from(&config.tracker),
    );
    let queue = Arc::new(MemoryQueue::new("jobs", config.queue.visibility_timeout));
    let controller = ScalingController::new(
        &config,
        tracker.clone(),
        queue.clone(),
        Arc::new(MemoryFleet::new()),
    );
    assert_eq!(controller.requeue_unfinished().await.unwrap(), 2);
    assert_eq!(queue.len().await, 2);
    assert_eq!(
        tracker.get(&JobId::new("job-1")).unwrap().state,
        JobState::Dispatched
    );
}
