use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use patrol::alert::RaiseAlert;
use patrol::types::{Alert, AlertQuery, Page};
use serde::Deserialize;
use uuid::Uuid;

use super::{header, supervisor, GUARD_HEADER};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Default, Deserialize)]
pub struct CloseBody {
    #[serde(default)]
    pub note: Option<String>,
}

/// Field alert (panic, fall, incident...). Reported by the guard when
/// `x-guard-id` is present, otherwise by the supervisor.
pub async fn raise(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(mut input): Json<RaiseAlert>,
) -> ApiResult<(StatusCode, Json<Alert>)> {
    let guard = header(&headers, GUARD_HEADER);
    if input.guard_id.is_none() {
        input.guard_id.clone_from(&guard);
    }
    let by = guard.unwrap_or_else(|| supervisor(&headers));
    let alert = state.engine.alerts.raise(input, &by).await?;
    Ok((StatusCode::CREATED, Json(alert)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(query): Query<AlertQuery>,
) -> ApiResult<Json<Page<Alert>>> {
    Ok(Json(state.engine.alerts.list(&query).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Alert>> {
    Ok(Json(state.engine.alerts.get(id).await?))
}

pub async fn ack(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Alert>> {
    Ok(Json(state.engine.alerts.ack(id, &supervisor(&headers)).await?))
}

pub async fn close(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    body: Option<Json<CloseBody>>,
) -> ApiResult<Json<Alert>> {
    let note = body.and_then(|Json(b)| b.note);
    Ok(Json(
        state
            .engine
            .alerts
            .close(id, &supervisor(&headers), note)
            .await?,
    ))
}
