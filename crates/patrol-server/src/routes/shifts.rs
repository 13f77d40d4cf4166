//! Shift lifecycle, live scans and offline uploads.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use patrol::offline::{OfflineBatch, SyncReport};
use patrol::scan::ScanRequest;
use patrol::types::{CheckpointRef, Geo, ScanEvent, ScanSource, Shift, ShiftStatus, ShiftSummary};
use serde::Deserialize;
use uuid::Uuid;

use super::{header, require_guard, GUARD_HEADER};
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StartShift {
    #[serde(default)]
    pub zone_id: Option<Uuid>,
    #[serde(default)]
    pub assignment_id: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct ShiftFilter {
    #[serde(default)]
    pub status: Option<ShiftStatus>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanBody {
    pub shift_id: Uuid,
    /// Checkpoint id or scanned token
    pub checkpoint_ref: String,
    #[serde(default)]
    pub geo: Option<Geo>,
    #[serde(default)]
    pub note: Option<String>,
}

/// Open a shift for the calling guard, from an assignment when one is given.
pub async fn start(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<StartShift>,
) -> ApiResult<(StatusCode, Json<Shift>)> {
    let guard_id = require_guard(&headers)?;
    let shifts = &state.engine.shifts;
    let shift = match (body.assignment_id, body.zone_id) {
        (Some(assignment_id), _) => shifts.start_assignment(assignment_id, &guard_id).await?,
        (None, Some(zone_id)) => shifts.start(zone_id, &guard_id).await?,
        (None, None) => {
            return Err(ApiError::bad_request(
                "either zoneId or assignmentId is required",
            ))
        }
    };
    Ok((StatusCode::CREATED, Json(shift)))
}

pub async fn list(
    State(state): State<AppState>,
    Query(filter): Query<ShiftFilter>,
) -> ApiResult<Json<Vec<Shift>>> {
    Ok(Json(state.engine.shifts.list(filter.status).await?))
}

pub async fn get(State(state): State<AppState>, Path(id): Path<Uuid>) -> ApiResult<Json<Shift>> {
    Ok(Json(state.engine.shifts.get(id).await?))
}

pub async fn end(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> ApiResult<Json<ShiftSummary>> {
    Ok(Json(state.engine.shifts.end(id).await?))
}

pub async fn scan(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<ScanBody>,
) -> ApiResult<(StatusCode, Json<ScanEvent>)> {
    let request = ScanRequest {
        shift_id: body.shift_id,
        checkpoint: CheckpointRef::parse(&body.checkpoint_ref),
        guard_id: header(&headers, GUARD_HEADER),
        geo: body.geo,
        note: body.note,
        timestamp: None,
        source: ScanSource::Live,
    };
    let scan = state.engine.scans.register(request).await?;
    Ok((StatusCode::CREATED, Json(scan)))
}

pub async fn offline_dump(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(batch): Json<OfflineBatch>,
) -> ApiResult<Json<SyncReport>> {
    let guard_id = require_guard(&headers)?;
    Ok(Json(state.engine.offline.sync(&guard_id, batch).await?))
}
