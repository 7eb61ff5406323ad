use axum::body::Body;
use axum::http::{HeaderName, HeaderValue, Request};
use axum::routing::{delete, get, post};
use axum::{middleware, response::Response, Router};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

use crate::rest;
use crate::state::AppState;

async fn ensure_request_id(req: Request<Body>, next: middleware::Next) -> Response {
    let header = HeaderName::from_static("x-request-id");
    let mut req = req;
    let request_id = req
        .headers()
        .get(&header)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if req.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            req.headers_mut().insert(header.clone(), v);
        }
    }

    let mut res = next.run(req).await;
    if res.headers().get(&header).is_none() {
        if let Ok(v) = HeaderValue::from_str(&request_id) {
            res.headers_mut().insert(header, v);
        }
    }
    res
}

/// Builds the full router for the job controller's HTTP surface, with the
/// same request-id and tracing layers applied to every route.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/jobs", post(rest::submit_job).get(rest::list_jobs))
        .route("/jobs/{id}", get(rest::get_job).delete(rest::stop_job))
        .route("/jobs/{id}/logs", get(rest::get_logs))
        .route("/job_cache", get(rest::job_cache_lookup))
        .route("/shutdown", delete(rest::shutdown))
        .route("/health", get(rest::health))
        .layer(middleware::from_fn(ensure_request_id))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
