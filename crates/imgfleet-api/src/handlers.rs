//! REST API handlers.
//!
//! Each handler goes through the job tracker, the heartbeat registry or the
//! submitter and returns JSON responses.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use bytes::Bytes;
use serde::Deserialize;

use imgfleet_core::{JobId, Operation};
use imgfleet_gateway::GatewayError;
use imgfleet_state::{JobState, TrackerError};

use crate::ApiState;
use crate::submit::SubmitError;

const DEFAULT_LIST_LIMIT: usize = 100;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn tracker_error(e: &TrackerError) -> axum::response::Response {
    let status = match e {
        TrackerError::NotFound(_) => StatusCode::NOT_FOUND,
        TrackerError::State(_) => StatusCode::INTERNAL_SERVER_ERROR,
        _ => StatusCode::CONFLICT,
    };
    error_response(&e.to_string(), status).into_response()
}

fn gateway_error(e: &GatewayError) -> axum::response::Response {
    let status = if e.is_retryable() {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    error_response(&e.to_string(), status).into_response()
}

// ── Jobs ───────────────────────────────────────────────────────

#[derive(Debug, Default, Deserialize)]
pub struct SubmitParams {
    pub job_id: Option<String>,
    /// JSON-encoded operation.
    pub operation: Option<String>,
}

/// POST /api/v1/jobs
pub async fn submit_job(
    State(state): State<ApiState>,
    Query(params): Query<SubmitParams>,
    body: Bytes,
) -> impl IntoResponse {
    let operation = match params.operation.as_deref() {
        None | Some("") => Operation::default(),
        Some(raw) => match serde_json::from_str(raw) {
            Ok(value) => Operation::new(value),
            Err(e) => {
                return error_response(&format!("invalid operation: {e}"), StatusCode::BAD_REQUEST)
                    .into_response();
            }
        },
    };
    let job_id = params.job_id.filter(|id| !id.is_empty()).map(JobId::new);

    match state.submitter.submit(job_id, operation, body).await {
        Ok(receipt) if receipt.created => {
            (StatusCode::CREATED, ApiResponse::ok(receipt)).into_response()
        }
        Ok(receipt) => ApiResponse::ok(receipt).into_response(),
        Err(SubmitError::EmptyInput) => {
            error_response("request body must contain an image", StatusCode::BAD_REQUEST)
                .into_response()
        }
        Err(e @ SubmitError::Conflict(_)) => {
            error_response(&e.to_string(), StatusCode::CONFLICT).into_response()
        }
        Err(SubmitError::Gateway(e)) => gateway_error(&e),
        Err(SubmitError::Tracker(e)) => tracker_error(&e),
        Err(e @ SubmitError::Protocol(_)) => {
            error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response()
        }
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct ListParams {
    pub state: Option<String>,
    pub limit: Option<usize>,
}

/// GET /api/v1/jobs
pub async fn list_jobs(
    State(state): State<ApiState>,
    Query(params): Query<ListParams>,
) -> impl IntoResponse {
    let filter = match params.state.as_deref() {
        None => None,
        Some(name) => match JobState::parse(name) {
            Some(s) => Some(s),
            None => {
                return error_response(&format!("unknown job state {name:?}"), StatusCode::BAD_REQUEST)
                    .into_response();
            }
        },
    };
    let limit = params.limit.unwrap_or(DEFAULT_LIST_LIMIT);

    match state.tracker.list(filter, limit) {
        Ok(jobs) => ApiResponse::ok(jobs).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/jobs/{id}
pub async fn get_job(State(state): State<ApiState>, Path(id): Path<String>) -> impl IntoResponse {
    match state.tracker.get(&JobId::new(id)) {
        Ok(job) => ApiResponse::ok(job).into_response(),
        Err(e) => tracker_error(&e),
    }
}

/// GET /api/v1/jobs/{id}/output
pub async fn get_job_output(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    let job = match state.tracker.get(&JobId::new(id)) {
        Ok(job) => job,
        Err(e) => return tracker_error(&e),
    };
    let Some(output_ref) = job.output_ref.filter(|_| job.state == JobState::Done) else {
        return error_response(
            &format!("job is {}, no output available", job.state.as_str()),
            StatusCode::CONFLICT,
        )
        .into_response();
    };

    match state.artifacts.get(&output_ref).await {
        Ok(bytes) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/octet-stream")],
            bytes,
        )
            .into_response(),
        Err(e) => gateway_error(&e),
    }
}

// ── Fleet ──────────────────────────────────────────────────────

/// GET /api/v1/workers
pub async fn list_workers(State(state): State<ApiState>) -> impl IntoResponse {
    match state.registry.list() {
        Ok(workers) => ApiResponse::ok(workers).into_response(),
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

/// GET /api/v1/pool
pub async fn get_pool(State(state): State<ApiState>) -> impl IntoResponse {
    match state.tracker.store().get_pool_state() {
        Ok(Some(pool)) => ApiResponse::ok(pool).into_response(),
        Ok(None) => {
            error_response("no scaling tick has run yet", StatusCode::NOT_FOUND).into_response()
        }
        Err(e) => error_response(&e.to_string(), StatusCode::INTERNAL_SERVER_ERROR).into_response(),
    }
}

// ── Prometheus ─────────────────────────────────────────────────

/// GET /metrics
pub async fn prometheus_metrics(State(state): State<ApiState>) -> impl IntoResponse {
    let counts = state.tracker.counts().unwrap_or_default();
    let pool = state.tracker.store().get_pool_state().unwrap_or_default();
    let workers = state.registry.list().unwrap_or_default();

    let body = crate::metrics::render_prometheus(&counts, pool.as_ref(), &workers);
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
        body,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use imgfleet_gateway::retry::RetryPolicy;
    use imgfleet_gateway::{MemoryArtifactStore, MemoryQueue};
    use imgfleet_state::{JobTracker, PoolState, StateStore, TrackerPolicy};

    fn test_state() -> ApiState {
        let tracker = JobTracker::new(
            StateStore::open_in_memory().unwrap(),
            TrackerPolicy::default(),
        );
        ApiState::new(
            tracker,
            Arc::new(MemoryQueue::new("jobs", Duration::from_secs(30))),
            Arc::new(MemoryArtifactStore::new()),
            RetryPolicy::none(),
        )
    }

    async fn body_json(resp: axum::response::Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn submit(state: &ApiState, job_id: &str) -> axum::response::Response {
        let params = SubmitParams {
            job_id: Some(job_id.to_string()),
            operation: None,
        };
        submit_job(
            State(state.clone()),
            Query(params),
            Bytes::from_static(b"img"),
        )
        .await
        .into_response()
    }

    #[tokio::test]
    async fn submit_then_get_job() {
        let state = test_state();
        let resp = submit(&state, "job-1").await;
        assert_eq!(resp.status(), StatusCode::CREATED);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["job_id"], "job-1");
        assert_eq!(json["data"]["state"], "dispatched");

        let resp = get_job(State(state), Path("job-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["state"], "dispatched");
        assert_eq!(json["data"]["attempt_count"], 0);
    }

    #[tokio::test]
    async fn repeated_submit_is_ok_not_created() {
        let state = test_state();
        assert_eq!(submit(&state, "job-1").await.status(), StatusCode::CREATED);
        assert_eq!(submit(&state, "job-1").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn submit_rejects_bad_operation_and_empty_body() {
        let state = test_state();
        let params = SubmitParams {
            job_id: None,
            operation: Some("{not json".to_string()),
        };
        let resp = submit_job(State(state.clone()), Query(params), Bytes::from_static(b"img"))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = submit_job(State(state), Query(SubmitParams::default()), Bytes::new())
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn get_nonexistent_job() {
        let state = test_state();
        let resp = get_job(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn list_jobs_filters_by_state() {
        let state = test_state();
        submit(&state, "job-1").await;
        submit(&state, "job-2").await;

        let params = ListParams {
            state: Some("dispatched".to_string()),
            limit: None,
        };
        let resp = list_jobs(State(state.clone()), Query(params))
            .await
            .into_response();
        let json = body_json(resp).await;
        assert_eq!(json["data"].as_array().unwrap().len(), 2);

        let params = ListParams {
            state: Some("done".to_string()),
            limit: None,
        };
        let resp = list_jobs(State(state.clone()), Query(params))
            .await
            .into_response();
        let json = body_json(resp).await;
        assert!(json["data"].as_array().unwrap().is_empty());

        let params = ListParams {
            state: Some("bogus".to_string()),
            limit: None,
        };
        let resp = list_jobs(State(state), Query(params)).await.into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn output_is_unavailable_until_done() {
        let state = test_state();
        submit(&state, "job-1").await;
        let resp = get_job_output(State(state), Path("job-1".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn pool_is_not_found_before_first_tick() {
        let state = test_state();
        let resp = get_pool(State(state.clone())).await.into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        state
            .tracker
            .store()
            .put_pool_state(&PoolState {
                desired_count: 2,
                ..PoolState::default()
            })
            .unwrap();
        let resp = get_pool(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let json = body_json(resp).await;
        assert_eq!(json["data"]["desired_count"], 2);
    }

    #[tokio::test]
    async fn list_workers_empty() {
        let state = test_state();
        let resp = list_workers(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn prometheus_endpoint_returns_text() {
        let state = test_state();
        submit(&state, "job-1").await;
        let resp = prometheus_metrics(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let content_type = resp
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(content_type.contains("text/plain"));
        let body = axum::body::to_bytes(resp.into_body(), usize::MAX)
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("imgfleet_jobs{state=\"dispatched\"} 1"));
    }
}
