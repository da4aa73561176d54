//! Manual sync control: start, cancel, history.

use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use naked_pineapple_core::{DEFAULT_LOOKBACK_MINUTES, MappingId, SyncHistoryEntry, SyncType};
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};

use crate::error::{AppError, SyncError};
use crate::orchestrator::{FullSyncOptions, IncrementalSyncOptions};
use crate::state::AppState;

const DEFAULT_HISTORY_LIMIT: u32 = 20;
const MAX_HISTORY_LIMIT: u32 = 200;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/mappings/{id}/sync/full", post(start_full))
        .route("/mappings/{id}/sync/incremental", post(start_incremental))
        .route("/mappings/{id}/sync/cancel", post(cancel))
        .route("/mappings/{id}/history", get(history))
}

/// Body for `POST /mappings/{id}/sync/full`.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct FullSyncRequest {
    pub dry_run: bool,
    pub delete_stale: bool,
    pub bulk_timeout_secs: Option<u64>,
    /// Block until the run finishes and return its result.
    pub wait: bool,
}

/// Body for `POST /mappings/{id}/sync/incremental`.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IncrementalSyncRequest {
    pub dry_run: bool,
    pub since: Option<DateTime<Utc>>,
    pub lookback_minutes: u32,
    pub wait: bool,
}

impl Default for IncrementalSyncRequest {
    fn default() -> Self {
        Self {
            dry_run: false,
            since: None,
            lookback_minutes: DEFAULT_LOOKBACK_MINUTES,
            wait: false,
        }
    }
}

#[derive(Debug, Serialize)]
struct StartedResponse {
    mapping_id: MappingId,
    sync_type: SyncType,
    status: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct CancelRequest {
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    cancelled: bool,
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<u32>,
}

/// Fail fast on unknown or busy mappings before handing off to a task.
async fn preflight(state: &AppState, mapping_id: MappingId) -> Result<(), AppError> {
    if let Some(running) = state.orchestrator().running_type(mapping_id) {
        return Err(SyncError::AlreadyRunning {
            mapping_id,
            running,
        }
        .into());
    }
    state
        .orchestrator()
        .catalog()
        .get(mapping_id)
        .await?
        .ok_or_else(|| SyncError::MappingNotFound(mapping_id))?;
    Ok(())
}

fn started(mapping_id: MappingId, sync_type: SyncType) -> Response {
    (
        StatusCode::ACCEPTED,
        Json(StartedResponse {
            mapping_id,
            sync_type,
            status: "started",
        }),
    )
        .into_response()
}

#[instrument(skip(state, body))]
async fn start_full(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<FullSyncRequest>,
) -> Result<Response, AppError> {
    let mapping_id = MappingId::new(id);
    let options = FullSyncOptions {
        dry_run: body.dry_run,
        delete_stale: body.delete_stale,
        bulk_timeout: body.bulk_timeout_secs.map(Duration::from_secs),
    };

    if body.wait {
        let result = state.orchestrator().full_sync(mapping_id, options).await?;
        return Ok(Json(result).into_response());
    }

    preflight(&state, mapping_id).await?;
    let orchestrator = state.orchestrator_handle();
    tokio::spawn(async move {
        match orchestrator.full_sync(mapping_id, options).await {
            Ok(result) => info!(mapping_id = %mapping_id, status = %result.status, "Full sync finished"),
            Err(e) => error!(mapping_id = %mapping_id, error = %e, "Full sync did not start"),
        }
    });
    Ok(started(mapping_id, SyncType::Full))
}

#[instrument(skip(state, body))]
async fn start_incremental(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<IncrementalSyncRequest>,
) -> Result<Response, AppError> {
    let mapping_id = MappingId::new(id);
    let options = IncrementalSyncOptions {
        dry_run: body.dry_run,
        since: body.since,
        lookback_minutes: body.lookback_minutes,
    };

    if body.wait {
        let result = state
            .orchestrator()
            .incremental_sync(mapping_id, options)
            .await?;
        return Ok(Json(result).into_response());
    }

    preflight(&state, mapping_id).await?;
    let orchestrator = state.orchestrator_handle();
    tokio::spawn(async move {
        match orchestrator.incremental_sync(mapping_id, options).await {
            Ok(result) => info!(mapping_id = %mapping_id, status = %result.status, "Incremental sync finished"),
            Err(e) => error!(mapping_id = %mapping_id, error = %e, "Incremental sync did not start"),
        }
    });
    Ok(started(mapping_id, SyncType::Incremental))
}

#[instrument(skip(state, body))]
async fn cancel(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<CancelRequest>,
) -> Json<CancelResponse> {
    let reason = body.reason.as_deref().unwrap_or("user requested");
    Json(CancelResponse {
        cancelled: state.orchestrator().cancel(MappingId::new(id), reason),
    })
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<Vec<SyncHistoryEntry>>, AppError> {
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let runs = state.orchestrator().history(MappingId::new(id), limit).await?;
    Ok(Json(runs))
}
