//! Zones, checkpoints, plans and rounds.

use axum::{
    extract::{Path, Query, State},
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use patrol::registry::{NewCheckpoint, NewPlan, NewRound, NewZone, PlanPatch};
use patrol::types::{Checkpoint, Plan, Round, Zone};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{ApiError, ApiResult};
use crate::qr::{self, QrFormat};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ZoneUpdate {
    pub active: bool,
}

#[derive(Debug, Deserialize)]
pub struct QrQuery {
    #[serde(default)]
    pub format: QrFormat,
}

pub async fn create_zone(
    State(state): State<AppState>,
    Json(input): Json<NewZone>,
) -> ApiResult<(StatusCode, Json<Zone>)> {
    let zone = state.engine.registry.create_zone(input).await?;
    Ok((StatusCode::CREATED, Json(zone)))
}

pub async fn list_zones(State(state): State<AppState>) -> ApiResult<Json<Vec<Zone>>> {
    Ok(Json(state.engine.registry.list_zones().await?))
}

pub async fn get_zone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Zone>> {
    Ok(Json(state.engine.registry.get_zone(id).await?))
}

pub async fn update_zone(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(update): Json<ZoneUpdate>,
) -> ApiResult<Json<Zone>> {
    Ok(Json(
        state.engine.registry.set_zone_active(id, update.active).await?,
    ))
}

pub async fn create_checkpoint(
    State(state): State<AppState>,
    Path(zone_id): Path<Uuid>,
    Json(input): Json<NewCheckpoint>,
) -> ApiResult<(StatusCode, Json<Checkpoint>)> {
    let checkpoint = state
        .engine
        .registry
        .create_checkpoint(zone_id, input)
        .await?;
    Ok((StatusCode::CREATED, Json(checkpoint)))
}

pub async fn list_checkpoints(
    State(state): State<AppState>,
    Path(zone_id): Path<Uuid>,
) -> ApiResult<Json<Vec<Checkpoint>>> {
    Ok(Json(state.engine.registry.list_checkpoints(zone_id).await?))
}

pub async fn get_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Checkpoint>> {
    Ok(Json(state.engine.registry.get_checkpoint(id).await?))
}

/// Checkpoints are never removed, only deactivated.
pub async fn deactivate_checkpoint(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Checkpoint>> {
    Ok(Json(state.engine.registry.deactivate_checkpoint(id).await?))
}

pub async fn checkpoint_qr(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<QrQuery>,
) -> ApiResult<impl IntoResponse> {
    let checkpoint = state.engine.registry.get_checkpoint(id).await?;
    let bytes = qr::render(&checkpoint.code, query.format)
        .map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(([(header::CONTENT_TYPE, query.format.content_type())], bytes))
}

pub async fn create_plan(
    State(state): State<AppState>,
    Json(input): Json<NewPlan>,
) -> ApiResult<(StatusCode, Json<Plan>)> {
    let plan = state.engine.registry.create_plan(input).await?;
    Ok((StatusCode::CREATED, Json(plan)))
}

pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<Vec<Plan>>> {
    Ok(Json(state.engine.registry.list_plans().await?))
}

pub async fn get_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.engine.registry.get_plan(id).await?))
}

pub async fn update_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<PlanPatch>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.engine.registry.update_plan(id, patch).await?))
}

/// Soft delete: the plan is deactivated.
pub async fn delete_plan(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<Plan>> {
    Ok(Json(state.engine.registry.delete_plan(id).await?))
}

pub async fn create_round(
    State(state): State<AppState>,
    Json(input): Json<NewRound>,
) -> ApiResult<(StatusCode, Json<Round>)> {
    let round = state.engine.registry.create_round(input).await?;
    Ok((StatusCode::CREATED, Json(round)))
}

pub async fn list_rounds(State(state): State<AppState>) -> ApiResult<Json<Vec<Round>>> {
    Ok(Json(state.engine.registry.list_rounds().await?))
}
