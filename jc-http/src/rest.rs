use std::collections::HashMap;
use std::sync::atomic::Ordering;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::Json;
use futures::StreamExt;
use jc_core::{Backend, Job, JobControllerError, JobRequest, JobResponse};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
struct SubmitResponse {
    job_id: String,
}

/// `POST /jobs`. Rejected with 503 once the shutdown coordinator has
/// flipped `accepting_submissions` off.
pub async fn submit_job(
    State(state): State<AppState>,
    Json(request): Json<JobRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if !state.accepting_submissions.load(Ordering::SeqCst) {
        return Err(ApiError(JobControllerError::ShuttingDown));
    }

    let job_id = state.manager.execute(request).await?;
    Ok((StatusCode::CREATED, Json(SubmitResponse { job_id: job_id.to_string() })))
}

#[derive(Debug, Serialize)]
struct JobsListResponse {
    jobs: HashMap<String, JobResponse>,
}

/// `GET /jobs`. Only live (non-terminal, not-yet-observed-terminal) jobs
/// are visible here; terminal history lives in the DB behind `GET /jobs/{id}`.
pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    let jobs = state
        .registry
        .snapshot()
        .values()
        .map(|job| (job.job_id.to_string(), JobResponse::from(job)))
        .collect();

    Json(JobsListResponse { jobs })
}

async fn find_job(state: &AppState, job_id_raw: &str) -> Result<Option<Job>, JobControllerError> {
    let Ok(job_id) = jc_core::JobId::parse(job_id_raw) else {
        return Ok(None);
    };

    if let Some(job) = state.registry.get(&job_id) {
        return Ok(Some(job));
    }
    state.db.get_job(&job_id).await
}

fn not_found_response(job_id_raw: &str) -> axum::response::Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "message": format!("The job {job_id_raw} doesn't exist") })),
    )
        .into_response()
}

#[derive(Debug, Serialize)]
struct JobDetailResponse {
    job: JobResponse,
}

/// `GET /jobs/{id}`.
pub async fn get_job(State(state): State<AppState>, Path(job_id_raw): Path<String>) -> axum::response::Response {
    match find_job(&state, &job_id_raw).await {
        Ok(Some(job)) => Json(JobDetailResponse { job: JobResponse::from(&job) }).into_response(),
        Ok(None) => not_found_response(&job_id_raw),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct LogsResponse {
    log: String,
}

/// `GET /jobs/{id}/logs`.
pub async fn get_logs(State(state): State<AppState>, Path(job_id_raw): Path<String>) -> axum::response::Response {
    match find_job(&state, &job_id_raw).await {
        Ok(Some(job)) => Json(LogsResponse { log: job.logs }).into_response(),
        Ok(None) => not_found_response(&job_id_raw),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct StopParams {
    #[serde(default)]
    pub compute_backend: Option<Backend>,
}

/// `DELETE /jobs/{id}/?compute_backend=...`. The backend is already
/// recorded on the Job; the query param exists to mirror the wire shape, not
/// to override routing.
pub async fn stop_job(
    State(state): State<AppState>,
    Path(job_id_raw): Path<String>,
    Query(_params): Query<StopParams>,
) -> axum::response::Response {
    let Ok(job_id) = jc_core::JobId::parse(&job_id_raw) else {
        return not_found_response(&job_id_raw);
    };

    if state.registry.get(&job_id).is_none() {
        return not_found_response(&job_id_raw);
    }

    match state.manager.stop(&job_id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Deserialize)]
pub struct JobCacheQuery {
    pub job_spec: String,
    pub workflow_json: String,
    pub workflow_workspace: String,
}

#[derive(Debug, Serialize)]
struct JobCacheResponse {
    cached: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    result_path: Option<String>,
}

/// `GET /job_cache?job_spec&workflow_json&workflow_workspace`. A
/// lookup-only path separate from `POST /jobs`, used by clients that want to
/// know whether a submission would hit the cache before paying for it.
pub async fn job_cache_lookup(State(state): State<AppState>, Query(query): Query<JobCacheQuery>) -> axum::response::Response {
    let job_spec: JobRequest = match serde_json::from_str(&query.job_spec) {
        Ok(spec) => spec,
        Err(e) => return ApiError(JobControllerError::Malformed(format!("invalid job_spec: {e}"))).into_response(),
    };
    let workflow_json: serde_json::Value = match serde_json::from_str(&query.workflow_json) {
        Ok(v) => v,
        Err(e) => return ApiError(JobControllerError::Malformed(format!("invalid workflow_json: {e}"))).into_response(),
    };

    let params = job_spec.compute_backend_params();
    let empty_digests = serde_json::Value::Object(Default::default());
    let spec = jc_queue::CacheSpec {
        cmd: &job_spec.cmd,
        docker_image: &job_spec.docker_img,
        env: &job_spec.env_vars,
        compute_backend_params: &params,
        workflow_json: &workflow_json,
        input_files_digest_map: job_spec.input_files_digest_map.as_ref().unwrap_or(&empty_digests),
    };

    let fingerprint = match jc_queue::fingerprint(&spec) {
        Ok(f) => f,
        Err(e) => return ApiError(e).into_response(),
    };

    match state.cache.lookup(&fingerprint).await {
        Ok(Some(result_path)) => Json(JobCacheResponse { cached: true, result_path: Some(result_path) }).into_response(),
        Ok(None) => Json(JobCacheResponse { cached: false, result_path: None }).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Debug, Serialize)]
struct MessageResponse {
    message: String,
}

/// `DELETE /shutdown`. Flips `accepting_submissions`, stops every live
/// job with bounded concurrency, waits for Monitors to drain, and reports any
/// job that failed to terminalize within the deadline.
pub async fn shutdown(State(state): State<AppState>) -> axum::response::Response {
    state.accepting_submissions.store(false, Ordering::SeqCst);

    let job_ids: Vec<_> = state.registry.snapshot().into_keys().collect();
    const STOP_CONCURRENCY: usize = 32;

    let stop_results = futures::stream::iter(job_ids)
        .map(|job_id| {
            let manager = state.manager.clone();
            async move { (job_id.clone(), manager.stop(&job_id).await) }
        })
        .buffer_unordered(STOP_CONCURRENCY)
        .collect::<Vec<_>>();

    let outcome = tokio::time::timeout(state.shutdown_deadline, stop_results).await;

    let unfinished: Vec<String> = match outcome {
        Ok(results) => results
            .into_iter()
            .filter_map(|(job_id, result)| match result {
                Ok(()) => None,
                Err(e) => {
                    warn!(%job_id, error = %e, "failed to stop job during shutdown");
                    Some(job_id.to_string())
                }
            })
            .collect(),
        Err(_) => {
            warn!("shutdown deadline exceeded while stopping jobs");
            state.registry.snapshot().into_keys().map(|id| id.to_string()).collect()
        }
    };

    if let Some(monitor_set) = state.monitor_set.lock().await.take() {
        monitor_set.shutdown().await;
    }

    if unfinished.is_empty() {
        info!("shutdown complete, all jobs terminalized");
        Json(MessageResponse { message: "job controller stopped".to_string() }).into_response()
    } else {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(MessageResponse {
                message: format!("Could not stop jobs {}", unfinished.join(", ")),
            }),
        )
            .into_response()
    }
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// `GET /health` — ambient addition, not part of the original REANA wire
/// contract, but every production HTTP service in this stack exposes one.
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse { status: "ok" })
}
