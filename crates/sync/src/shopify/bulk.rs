//! Bulk operation protocol: submit, poll until terminal, hand back the result URL.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::client::{DEFAULT_MAX_RETRIES, check_user_errors};
use super::query::{BULK_CANCEL_MUTATION, BULK_RUN_MUTATION, BULK_STATUS_QUERY};
use super::{ShopifyClient, ShopifyError};

/// Raw chunks of a downloaded bulk result.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>, ShopifyError>>;

/// Bulk operation lifecycle states as reported by Shopify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BulkOperationStatus {
    /// Accepted, not yet started.
    Created,
    /// Executing.
    Running,
    /// Finished; results are available.
    Completed,
    /// Cancellation requested.
    Canceling,
    /// Cancelled.
    Canceled,
    /// Failed; see the error code.
    Failed,
    /// Results expired before download.
    Expired,
}

impl BulkOperationStatus {
    /// Whether the operation will not change state again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Canceled | Self::Failed | Self::Expired
        )
    }
}

impl std::fmt::Display for BulkOperationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Created => "CREATED",
            Self::Running => "RUNNING",
            Self::Completed => "COMPLETED",
            Self::Canceling => "CANCELING",
            Self::Canceled => "CANCELED",
            Self::Failed => "FAILED",
            Self::Expired => "EXPIRED",
        };
        f.write_str(s)
    }
}

/// Snapshot of a bulk operation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BulkOperation {
    /// Operation GID.
    pub id: String,
    /// Current state.
    pub status: BulkOperationStatus,
    /// Error code for failed operations.
    #[serde(default)]
    pub error_code: Option<String>,
    /// Number of objects written so far (Shopify sends this as a string).
    #[serde(default)]
    pub object_count: Option<String>,
    /// JSONL result URL once completed. `None` when nothing matched.
    #[serde(default)]
    pub url: Option<String>,
    /// Partial results for failed operations.
    #[serde(default)]
    pub partial_data_url: Option<String>,
}

/// The four remote calls the bulk protocol needs.
#[async_trait]
pub trait BulkApi: Send + Sync {
    /// Start a bulk query.
    async fn submit(&self, query: &str) -> Result<BulkOperation, ShopifyError>;

    /// Current state of an operation.
    async fn status(&self, id: &str) -> Result<BulkOperation, ShopifyError>;

    /// Request cancellation.
    async fn cancel(&self, id: &str) -> Result<(), ShopifyError>;

    /// Stream the JSONL result file.
    async fn download(&self, url: &str) -> Result<ByteStream, ShopifyError>;
}

#[async_trait]
impl BulkApi for ShopifyClient {
    #[instrument(skip(self, query))]
    async fn submit(&self, query: &str) -> Result<BulkOperation, ShopifyError> {
        let data = self
            .query(BULK_RUN_MUTATION, json!({ "query": query }), DEFAULT_MAX_RETRIES)
            .await?;
        let payload = data.get("bulkOperationRunQuery").ok_or_else(|| {
            ShopifyError::UnexpectedResponse("missing bulkOperationRunQuery".to_string())
        })?;
        check_user_errors(payload)?;
        parse_operation(payload.get("bulkOperation"))
    }

    async fn status(&self, id: &str) -> Result<BulkOperation, ShopifyError> {
        let data = self
            .query(BULK_STATUS_QUERY, json!({ "id": id }), DEFAULT_MAX_RETRIES)
            .await?;
        parse_operation(data.get("node"))
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: &str) -> Result<(), ShopifyError> {
        let data = self
            .query(BULK_CANCEL_MUTATION, json!({ "id": id }), DEFAULT_MAX_RETRIES)
            .await?;
        if let Some(payload) = data.get("bulkOperationCancel") {
            check_user_errors(payload)?;
        }
        Ok(())
    }

    async fn download(&self, url: &str) -> Result<ByteStream, ShopifyError> {
        let response = self.http().get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ShopifyError::Status {
                status: status.as_u16(),
                body: "bulk result download failed".to_string(),
            });
        }
        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(ShopifyError::from))
            .boxed())
    }
}

fn parse_operation(value: Option<&Value>) -> Result<BulkOperation, ShopifyError> {
    match value {
        Some(v) if !v.is_null() => Ok(serde_json::from_value(v.clone())?),
        _ => Err(ShopifyError::UnexpectedResponse(
            "bulk operation missing from response".to_string(),
        )),
    }
}

/// Polling cadence for a bulk operation.
#[derive(Debug, Clone, Copy)]
pub struct BulkPollConfig {
    /// First wait between status checks.
    pub initial_interval: Duration,
    /// Longest wait between status checks.
    pub max_interval: Duration,
    /// Growth factor applied after each check.
    pub backoff: f64,
    /// Give up (and cancel remotely) after this long.
    pub timeout: Duration,
}

impl Default for BulkPollConfig {
    fn default() -> Self {
        Self {
            initial_interval: Duration::from_secs(3),
            max_interval: Duration::from_secs(30),
            backoff: 1.5,
            timeout: Duration::from_secs(10 * 60),
        }
    }
}

impl BulkPollConfig {
    fn next_interval(&self, current: Duration) -> Duration {
        current.mul_f64(self.backoff).min(self.max_interval)
    }
}

/// Drives one bulk operation to completion.
pub struct BulkOperationRunner<'a> {
    api: &'a dyn BulkApi,
    config: BulkPollConfig,
}

impl<'a> BulkOperationRunner<'a> {
    /// Create a runner over `api`.
    #[must_use]
    pub fn new(api: &'a dyn BulkApi, config: BulkPollConfig) -> Self {
        Self { api, config }
    }

    /// Submit `query` and poll until it finishes.
    ///
    /// Returns the result URL, or `None` when the operation completed without
    /// producing a file (no matching objects).
    ///
    /// # Errors
    ///
    /// - `BulkOperationFailed` for `FAILED`, `CANCELED` or `EXPIRED`
    /// - `BulkOperationTimeout` once the deadline passes (the remote operation
    ///   is cancelled first)
    /// - `Cancelled` when `cancel` fires (the remote operation is cancelled first)
    #[instrument(skip(self, query, cancel))]
    pub async fn run(
        &self,
        query: &str,
        cancel: &CancellationToken,
    ) -> Result<Option<String>, ShopifyError> {
        if cancel.is_cancelled() {
            return Err(ShopifyError::Cancelled("before bulk submit".to_string()));
        }

        let started = Instant::now();
        let operation = self.api.submit(query).await?;
        info!(operation_id = %operation.id, "Bulk operation submitted");

        let mut interval = self.config.initial_interval;
        let mut current = operation;

        loop {
            match current.status {
                BulkOperationStatus::Completed => {
                    info!(
                        operation_id = %current.id,
                        object_count = current.object_count.as_deref().unwrap_or("0"),
                        "Bulk operation completed"
                    );
                    return Ok(current.url);
                }
                BulkOperationStatus::Failed
                | BulkOperationStatus::Canceled
                | BulkOperationStatus::Expired => {
                    return Err(ShopifyError::BulkOperationFailed {
                        status: current.status,
                        error_code: current.error_code,
                    });
                }
                BulkOperationStatus::Created
                | BulkOperationStatus::Running
                | BulkOperationStatus::Canceling => {}
            }

            if started.elapsed() >= self.config.timeout {
                self.cancel_remote(&current.id).await;
                return Err(ShopifyError::BulkOperationTimeout(self.config.timeout));
            }

            tokio::select! {
                () = cancel.cancelled() => {
                    self.cancel_remote(&current.id).await;
                    return Err(ShopifyError::Cancelled("bulk operation cancelled".to_string()));
                }
                () = tokio::time::sleep(interval) => {}
            }

            interval = self.config.next_interval(interval);
            current = self.api.status(&current.id).await?;
            debug!(operation_id = %current.id, status = %current.status, "Bulk operation polled");
        }
    }

    async fn cancel_remote(&self, id: &str) {
        if let Err(e) = self.api.cancel(id).await {
            warn!(operation_id = %id, error = %e, "Failed to cancel bulk operation");
        }
    }
}
