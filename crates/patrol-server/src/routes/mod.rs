//! REST and SSE routes.

mod alerts;
mod assignments;
mod events;
mod shifts;
mod topology;

use axum::{
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::time::Duration;
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// Header carrying the calling guard's id.
pub const GUARD_HEADER: &str = "x-guard-id";

/// Header carrying the calling supervisor's id.
pub const USER_HEADER: &str = "x-user-id";

const DEFAULT_SUPERVISOR: &str = "supervisor";

pub fn build_router(state: AppState, request_timeout: Duration) -> Router {
    Router::new()
        .route("/health", get(health))
        // topology
        .route("/zones", post(topology::create_zone).get(topology::list_zones))
        .route("/zones/{id}", get(topology::get_zone).patch(topology::update_zone))
        .route(
            "/zones/{id}/checkpoints",
            post(topology::create_checkpoint).get(topology::list_checkpoints),
        )
        .route(
            "/checkpoints/{id}",
            get(topology::get_checkpoint).delete(topology::deactivate_checkpoint),
        )
        .route("/checkpoints/{id}/qr", get(topology::checkpoint_qr))
        .route("/plans", post(topology::create_plan).get(topology::list_plans))
        .route(
            "/plans/{id}",
            get(topology::get_plan)
                .patch(topology::update_plan)
                .delete(topology::delete_plan),
        )
        .route("/rounds", post(topology::create_round).get(topology::list_rounds))
        // shifts and scans
        .route("/shifts/start", post(shifts::start))
        .route("/shifts", get(shifts::list))
        .route("/shifts/{id}", get(shifts::get))
        .route("/shifts/{id}/end", post(shifts::end))
        .route("/scans", post(shifts::scan))
        .route("/offline/dump", post(shifts::offline_dump))
        // alerts
        .route("/alerts", post(alerts::raise).get(alerts::list))
        .route("/alerts/{id}", get(alerts::get))
        .route("/alerts/{id}/ack", post(alerts::ack))
        .route("/alerts/{id}/close", post(alerts::close))
        // assignments and jobs
        .route("/assignments", get(assignments::list))
        .route("/assignments/generate", post(assignments::generate))
        .route("/jobs/reconcile", post(assignments::reconcile))
        .route("/jobs", get(assignments::jobs))
        // real-time
        .route("/events", get(events::stream))
        .fallback(not_found)
        .layer(
            ServiceBuilder::new()
                .layer(
                    TraceLayer::new_for_http()
                        .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
                        .on_response(DefaultOnResponse::new().level(Level::INFO)),
                )
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(request_timeout)),
        )
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({
        "status": "healthy",
        "service": "patrol-server",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

async fn not_found() -> ApiError {
    ApiError::NotFound("no such route".to_string())
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(ToString::to_string)
}

/// Guard id from `x-guard-id`, required.
fn require_guard(headers: &HeaderMap) -> ApiResult<String> {
    header(headers, GUARD_HEADER)
        .ok_or_else(|| ApiError::bad_request(format!("missing {GUARD_HEADER} header")))
}

/// Supervisor id from `x-user-id`.
fn supervisor(headers: &HeaderMap) -> String {
    header(headers, USER_HEADER).unwrap_or_else(|| DEFAULT_SUPERVISOR.to_string())
}
