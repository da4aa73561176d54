//! Webhook pipeline: verify, dedupe, enqueue, process.
//!
//! ```text
//! POST /webhooks/shopify
//!   → WebhookIngest::ingest   (HMAC check, idempotency claim, queue push)
//!   → WebhookWorkerPool       (semaphore + governor, retries with backoff)
//!   → WebhookProcessor        (topic → mappings, delete strategy or upsert)
//! ```

pub mod hmac;
pub mod payload;
pub mod processor;
pub mod worker;

pub use hmac::{sign, verify_hmac};
pub use payload::{is_delete_topic, normalize_payload, resource_for_topic};
pub use processor::{WebhookOutcome, WebhookProcessor};
pub use worker::{WebhookWorkerPool, WebhookWorkerSettings};

use std::sync::Arc;
use std::time::Duration;

use secrecy::{ExposeSecret, SecretString};
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::db::{IdempotencyStore, RepositoryError, WebhookJob, WebhookQueue};
use crate::filter::FilterError;
use crate::store::StoreError;
use crate::transform::TransformError;

/// Default window in which a repeated webhook id is dropped.
pub const DEFAULT_DEDUPE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Errors from the webhook pipeline.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("Invalid webhook signature")]
    InvalidSignature,

    #[error("Missing header: {0}")]
    MissingHeader(&'static str),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Mapping misconfigured: {0}")]
    Mapping(String),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Target store error: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Transform(#[from] TransformError),

    #[error("Invalid filter: {0}")]
    Filter(#[from] FilterError),
}

/// The Shopify headers a webhook request carries.
#[derive(Debug, Clone, Default)]
pub struct WebhookHeaders {
    pub hmac: Option<String>,
    pub topic: Option<String>,
    pub shop_domain: Option<String>,
    pub webhook_id: Option<String>,
}

/// Result of accepting a webhook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Queued as the given job.
    Enqueued(Uuid),
    /// Seen within the dedupe window; dropped.
    Duplicate,
}

/// Front door of the pipeline.
pub struct WebhookIngest {
    secret: SecretString,
    dedupe: Arc<dyn IdempotencyStore>,
    queue: Arc<dyn WebhookQueue>,
    notify: Arc<Notify>,
    dedupe_ttl: Duration,
}

impl std::fmt::Debug for WebhookIngest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookIngest")
            .field("secret", &"[REDACTED]")
            .field("dedupe_ttl", &self.dedupe_ttl)
            .finish_non_exhaustive()
    }
}

impl WebhookIngest {
    #[must_use]
    pub fn new(
        secret: SecretString,
        dedupe: Arc<dyn IdempotencyStore>,
        queue: Arc<dyn WebhookQueue>,
        notify: Arc<Notify>,
        dedupe_ttl: Duration,
    ) -> Self {
        Self {
            secret,
            dedupe,
            queue,
            notify,
            dedupe_ttl,
        }
    }

    /// Verify, dedupe and enqueue one webhook.
    ///
    /// # Errors
    ///
    /// - `InvalidSignature` when the HMAC header is missing or wrong
    /// - `MissingHeader` / `InvalidPayload` for malformed requests
    /// - `Repository` if the dedupe store or queue fails
    #[instrument(skip_all, fields(topic = headers.topic.as_deref().unwrap_or("")))]
    pub async fn ingest(
        &self,
        headers: &WebhookHeaders,
        body: &[u8],
    ) -> Result<IngestOutcome, WebhookError> {
        let signature = headers.hmac.as_deref().ok_or(WebhookError::InvalidSignature)?;
        if !verify_hmac(body, signature, self.secret.expose_secret()) {
            warn!("Rejected webhook with invalid signature");
            return Err(WebhookError::InvalidSignature);
        }

        let topic = headers
            .topic
            .as_deref()
            .ok_or(WebhookError::MissingHeader("X-Shopify-Topic"))?;
        let webhook_id = headers
            .webhook_id
            .as_deref()
            .ok_or(WebhookError::MissingHeader("X-Shopify-Webhook-Id"))?;
        let shop_domain = headers.shop_domain.as_deref().unwrap_or_default();
        let payload = serde_json::from_slice(body)
            .map_err(|e| WebhookError::InvalidPayload(e.to_string()))?;

        if !self
            .dedupe
            .claim(&format!("webhook:{webhook_id}"), self.dedupe_ttl)
            .await?
        {
            debug!(%webhook_id, "Duplicate webhook dropped");
            return Ok(IngestOutcome::Duplicate);
        }

        let job = WebhookJob::new(webhook_id, topic, shop_domain, payload);
        self.queue.push(&job).await?;
        self.notify.notify_one();
        info!(%webhook_id, job_id = %job.id, "Webhook queued");
        Ok(IngestOutcome::Enqueued(job.id))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::{JobState, MemoryIdempotencyStore, MemoryWebhookQueue};

    const SECRET: &str = "webhook-secret";

    fn ingest(queue: Arc<MemoryWebhookQueue>) -> WebhookIngest {
        WebhookIngest::new(
            SecretString::from(SECRET.to_string()),
            Arc::new(MemoryIdempotencyStore::new()),
            queue,
            Arc::new(Notify::new()),
            DEFAULT_DEDUPE_TTL,
        )
    }

    fn headers(body: &[u8], webhook_id: &str) -> WebhookHeaders {
        WebhookHeaders {
            hmac: Some(sign(body, SECRET)),
            topic: Some("products/update".to_string()),
            shop_domain: Some("naked-pineapple.myshopify.com".to_string()),
            webhook_id: Some(webhook_id.to_string()),
        }
    }

    #[tokio::test]
    async fn test_duplicate_webhook_dropped() {
        let queue = Arc::new(MemoryWebhookQueue::new());
        let ingest = ingest(queue.clone());
        let body = serde_json::to_vec(&json!({ "id": 1 })).unwrap();

        let first = ingest.ingest(&headers(&body, "w-1"), &body).await.unwrap();
        let second = ingest.ingest(&headers(&body, "w-1"), &body).await.unwrap();
        assert!(matches!(first, IngestOutcome::Enqueued(_)));
        assert_eq!(second, IngestOutcome::Duplicate);
        assert_eq!(queue.count(JobState::Pending), 1);
    }

    #[tokio::test]
    async fn test_bad_signature_rejected() {
        let queue = Arc::new(MemoryWebhookQueue::new());
        let ingest = ingest(queue.clone());
        let body = br#"{"id":1}"#;
        let mut headers = headers(body, "w-2");
        headers.hmac = Some(sign(b"{\"id\":2}", SECRET));

        let err = ingest.ingest(&headers, body).await.unwrap_err();
        assert!(matches!(err, WebhookError::InvalidSignature));
        assert_eq!(queue.count(JobState::Pending), 0);
    }

    #[tokio::test]
    async fn test_missing_topic_rejected() {
        let ingest = ingest(Arc::new(MemoryWebhookQueue::new()));
        let body = br#"{"id":1}"#;
        let mut headers = headers(body, "w-3");
        headers.topic = None;
        assert!(matches!(
            ingest.ingest(&headers, body).await,
            Err(WebhookError::MissingHeader("X-Shopify-Topic"))
        ));
    }
}
