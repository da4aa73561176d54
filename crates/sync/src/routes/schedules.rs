//! Recurring schedule management.

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
};
use naked_pineapple_core::{MappingId, ScheduleConfig, SchedulerInfo, SyncType};
use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::error::AppError;
use crate::state::AppState;

const DEFAULT_UPCOMING: usize = 5;
const MAX_UPCOMING: usize = 50;

pub fn router() -> Router<AppState> {
    Router::new()
        .route(
            "/mappings/{id}/schedule",
            get(show).put(upsert).delete(remove),
        )
        .route("/mappings/{id}/schedule/run", post(run_now))
}

#[derive(Debug, Deserialize)]
pub struct ShowQuery {
    /// How many upcoming run times to include.
    pub upcoming: Option<usize>,
}

#[derive(Debug, Serialize)]
struct UpsertResponse {
    schedule: Option<SchedulerInfo>,
}

#[derive(Debug, Serialize)]
struct RemoveResponse {
    removed: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunNowRequest {
    /// Overrides the stored schedule's type.
    pub sync_type: Option<SyncType>,
}

#[derive(Debug, Serialize)]
struct RunNowResponse {
    job_id: String,
}

async fn show(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(query): Query<ShowQuery>,
) -> Result<Json<SchedulerInfo>, AppError> {
    let upcoming = query.upcoming.unwrap_or(DEFAULT_UPCOMING).min(MAX_UPCOMING);
    state
        .scheduler()
        .info(MappingId::new(id), upcoming)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("No schedule for mapping {id}")))
}

#[instrument(skip(state, config))]
async fn upsert(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(config): Json<ScheduleConfig>,
) -> Result<Json<UpsertResponse>, AppError> {
    let schedule = state
        .scheduler()
        .upsert_schedule(MappingId::new(id), config)
        .await?;
    Ok(Json(UpsertResponse { schedule }))
}

#[instrument(skip(state))]
async fn remove(
    State(state): State<AppState>,
    Path(id): Path<i32>,
) -> Result<Json<RemoveResponse>, AppError> {
    let removed = state.scheduler().remove_schedule(MappingId::new(id)).await?;
    Ok(Json(RemoveResponse { removed }))
}

#[instrument(skip(state, body))]
async fn run_now(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<RunNowRequest>,
) -> Result<(StatusCode, Json<RunNowResponse>), AppError> {
    let job_id = state
        .scheduler()
        .run_now(MappingId::new(id), body.sync_type)
        .await?;
    Ok((StatusCode::ACCEPTED, Json(RunNowResponse { job_id })))
}
