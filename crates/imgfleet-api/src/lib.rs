//! imgfleet-api: REST API for imgfleet.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/jobs?job_id=&operation=` | Submit raw image bytes |
//! | GET | `/api/v1/jobs` | List jobs (`?state=`, `?limit=`) |
//! | GET | `/api/v1/jobs/{id}` | Job status snapshot |
//! | GET | `/api/v1/jobs/{id}/output` | Processed image once `done` |
//! | GET | `/api/v1/workers` | Heartbeat records |
//! | GET | `/api/v1/pool` | Last scaling controller snapshot |
//! | GET | `/metrics` | Prometheus exposition |

pub mod handlers;
pub mod metrics;
pub mod submit;

use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::get;

use imgfleet_gateway::retry::RetryPolicy;
use imgfleet_gateway::{ArtifactStore, QueueGateway};
use imgfleet_health::HeartbeatRegistry;
use imgfleet_state::JobTracker;

pub use submit::{INPUT_NAMESPACE, SubmitError, SubmitReceipt, Submitter};

/// Largest accepted upload.
pub const MAX_IMAGE_BYTES: usize = 64 * 1024 * 1024;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub tracker: JobTracker,
    pub registry: HeartbeatRegistry,
    pub artifacts: Arc<dyn ArtifactStore>,
    pub submitter: Submitter,
}

impl ApiState {
    pub fn new(
        tracker: JobTracker,
        queue: Arc<dyn QueueGateway>,
        artifacts: Arc<dyn ArtifactStore>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry: HeartbeatRegistry::new(tracker.store().clone()),
            submitter: Submitter::new(tracker.clone(), queue, artifacts.clone(), retry),
            tracker,
            artifacts,
        }
    }
}

/// Build the complete API router (REST + metrics).
pub fn build_router(state: ApiState) -> Router {
    let api_routes = Router::new()
        .route(
            "/jobs",
            get(handlers::list_jobs)
                .post(handlers::submit_job)
                .layer(DefaultBodyLimit::max(MAX_IMAGE_BYTES)),
        )
        .route("/jobs/{id}", get(handlers::get_job))
        .route("/jobs/{id}/output", get(handlers::get_job_output))
        .route("/workers", get(handlers::list_workers))
        .route("/pool", get(handlers::get_pool))
        .with_state(state.clone());

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/metrics", get(handlers::prometheus_metrics).with_state(state))
}
