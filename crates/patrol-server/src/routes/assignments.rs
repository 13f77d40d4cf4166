//! Assignment queries and manual job triggers.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use chrono::NaiveDate;
use patrol::scheduler::{AssignmentJob, ReconcileJob, TriggerOutcome};
use patrol::types::Assignment;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssignmentFilter {
    /// Site-local date; today when omitted
    #[serde(default)]
    pub date: Option<NaiveDate>,
    #[serde(default)]
    pub guard_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct GenerateBody {
    #[serde(default)]
    pub date: Option<NaiveDate>,
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<AssignmentFilter>,
) -> ApiResult<Json<Vec<Assignment>>> {
    let generator = &state.engine.assignments;
    let date = filter.date.unwrap_or_else(|| generator.today());
    Ok(Json(
        generator.list(date, filter.guard_id.as_deref()).await?,
    ))
}

/// Generate one date, or run the scheduled horizon when no date is given.
pub async fn generate(
    State(state): State<AppState>,
    body: Option<Json<GenerateBody>>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let date = body.and_then(|Json(b)| b.date);
    if let Some(date) = date {
        info!(%date, "Manual assignment generation");
        let report = state.engine.assignments.generate(date).await?;
        return Ok((
            StatusCode::OK,
            Json(json!({ "status": "completed", "report": report })),
        ));
    }
    trigger(&state, AssignmentJob::NAME).await
}

pub async fn reconcile(State(state): State<AppState>) -> ApiResult<(StatusCode, Json<Value>)> {
    trigger(&state, ReconcileJob::NAME).await
}

pub async fn jobs(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "jobs": state.scheduler.job_names() }))
}

async fn trigger(state: &AppState, name: &str) -> ApiResult<(StatusCode, Json<Value>)> {
    info!(job = name, "Manual job trigger");
    match state.scheduler.trigger(name).await {
        Some(Ok(TriggerOutcome::Completed(report))) => Ok((
            StatusCode::OK,
            Json(json!({ "status": "completed", "report": report })),
        )),
        Some(Ok(TriggerOutcome::Skipped)) => Ok((
            StatusCode::ACCEPTED,
            Json(json!({ "status": "skipped", "reason": "already running" })),
        )),
        Some(Err(e)) => Err(e.into()),
        None => Err(ApiError::NotFound(format!("job {name} is not registered"))),
    }
}
