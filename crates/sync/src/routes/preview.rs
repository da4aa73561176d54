//! Dry-run a mapping against sample records.
//!
//! Nothing is written; lookup tables are still loaded so lookup transforms
//! behave as they would in a real run.

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::post,
};
use naked_pineapple_core::MappingId;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::instrument;

use crate::error::{AppError, SyncError};
use crate::filter::CompiledFilters;
use crate::state::AppState;
use crate::transform::{LookupLoadStats, TransformOptions, TransformResult, TransformStatus};

/// Most records a single preview accepts.
const MAX_PREVIEW_RECORDS: usize = 100;

pub fn router() -> Router<AppState> {
    Router::new().route("/mappings/{id}/preview", post(preview))
}

#[derive(Debug, Deserialize)]
pub struct PreviewRequest {
    pub records: Vec<Value>,
}

#[derive(Debug, Serialize)]
struct PreviewRecord {
    passed_filters: bool,
    status: Option<TransformStatus>,
    result: Option<TransformResult>,
}

#[derive(Debug, Serialize)]
struct PreviewResponse {
    mapping_id: MappingId,
    total: usize,
    passed_filters: usize,
    records: Vec<PreviewRecord>,
    lookups: LookupLoadStats,
}

#[instrument(skip(state, body), fields(records = body.records.len()))]
async fn preview(
    State(state): State<AppState>,
    Path(id): Path<i32>,
    Json(body): Json<PreviewRequest>,
) -> Result<Json<PreviewResponse>, AppError> {
    if body.records.len() > MAX_PREVIEW_RECORDS {
        return Err(AppError::BadRequest(format!(
            "At most {MAX_PREVIEW_RECORDS} records can be previewed"
        )));
    }

    let mapping_id = MappingId::new(id);
    let orchestrator = state.orchestrator();
    let mapping = orchestrator
        .catalog()
        .get(mapping_id)
        .await?
        .ok_or(SyncError::MappingNotFound(mapping_id))?;

    let filters = CompiledFilters::compile(&mapping.filters).map_err(SyncError::from)?;
    let prepared = orchestrator
        .transform_engine()
        .prepare(&mapping, TransformOptions { dry_run: true })
        .await
        .map_err(SyncError::from)?;

    let records: Vec<PreviewRecord> = body
        .records
        .iter()
        .map(|record| {
            if filters.matches(record) {
                let result = prepared.transform_record(record);
                PreviewRecord {
                    passed_filters: true,
                    status: Some(result.status()),
                    result: Some(result),
                }
            } else {
                PreviewRecord {
                    passed_filters: false,
                    status: None,
                    result: None,
                }
            }
        })
        .collect();

    Ok(Json(PreviewResponse {
        mapping_id,
        total: records.len(),
        passed_filters: records.iter().filter(|r| r.passed_filters).count(),
        lookups: prepared.lookup_stats().clone(),
        records,
    }))
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::json;

    use crate::routes::tests::{json_body, json_request, send, test_app};

    #[tokio::test]
    async fn test_preview_filters_and_transforms_without_writing() {
        let app = test_app(Vec::new());
        let body = json!({
            "records": [
                { "id": "gid://shopify/Product/1", "title": "Pineapple", "status": "ACTIVE", "price": "3.50" },
                { "id": "gid://shopify/Product/2", "title": "Mango", "status": "DRAFT", "price": "2.00" },
                { "id": "gid://shopify/Product/3", "title": "Kiwi", "status": "ACTIVE", "price": "not a number" }
            ]
        });

        let response = send(&app.router, json_request("POST", "/mappings/1/preview", &body)).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;

        assert_eq!(body["total"], 3);
        assert_eq!(body["passed_filters"], 2);
        assert_eq!(body["records"][0]["status"], "success");
        assert_eq!(body["records"][0]["result"]["row"]["title"], "Pineapple");
        assert_eq!(body["records"][1]["passed_filters"], false);
        assert_eq!(body["records"][2]["status"], "partial");
        assert!(app.writer.rows("products").is_empty());
    }

    #[tokio::test]
    async fn test_preview_unknown_mapping() {
        let app = test_app(Vec::new());
        let response = send(
            &app.router,
            json_request("POST", "/mappings/7/preview", &json!({ "records": [] })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
