//! Shopify webhook receiver.
//!
//! The signature covers the exact request bytes, so the body is taken raw
//! and only parsed after verification.

use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::HeaderMap,
    routing::post,
};
use serde::Serialize;
use tracing::instrument;
use uuid::Uuid;

use crate::error::AppError;
use crate::state::AppState;
use crate::webhook::{IngestOutcome, WebhookHeaders};

pub fn router() -> Router<AppState> {
    Router::new().route("/webhooks/shopify", post(receive))
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum WebhookResponse {
    Queued { job_id: Uuid },
    Duplicate,
}

fn header(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// Accept a webhook: 401 on a bad signature, 200 once queued or recognised
/// as a duplicate.
#[instrument(skip(state, headers, body))]
async fn receive(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>, AppError> {
    let webhook_headers = WebhookHeaders {
        hmac: header(&headers, "X-Shopify-Hmac-Sha256"),
        topic: header(&headers, "X-Shopify-Topic"),
        shop_domain: header(&headers, "X-Shopify-Shop-Domain"),
        webhook_id: header(&headers, "X-Shopify-Webhook-Id"),
    };

    let response = match state.ingest().ingest(&webhook_headers, &body).await? {
        IngestOutcome::Enqueued(job_id) => WebhookResponse::Queued { job_id },
        IngestOutcome::Duplicate => WebhookResponse::Duplicate,
    };
    Ok(Json(response))
}
