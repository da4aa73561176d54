//! The seam the orchestrator pulls Shopify records through.

use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use super::bulk::{BulkApi, BulkOperationRunner, BulkPollConfig};
use super::{QueryPlan, ShopifyClient, ShopifyError, incremental, jsonl};

/// A stream of raw Shopify records (JSON objects).
pub type RecordStream = BoxStream<'static, Result<Value, ShopifyError>>;

/// Fetches records for a mapping's query plan.
pub trait RecordSource: Send + Sync {
    /// Every record of the resource, via a bulk operation. `timeout`
    /// overrides the source's default bulk timeout.
    fn bulk_records(
        &self,
        plan: &QueryPlan,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> RecordStream;

    /// Records updated after `since`, via cursor pagination.
    fn incremental_records(
        &self,
        plan: &QueryPlan,
        since: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> RecordStream;
}

/// [`RecordSource`] backed by the Admin API.
#[derive(Debug, Clone)]
pub struct ShopifyRecordSource {
    client: ShopifyClient,
    poll: BulkPollConfig,
}

impl ShopifyRecordSource {
    /// Create a source with default bulk polling.
    #[must_use]
    pub fn new(client: ShopifyClient) -> Self {
        Self::with_poll_config(client, BulkPollConfig::default())
    }

    /// Create a source with explicit bulk polling settings.
    #[must_use]
    pub const fn with_poll_config(client: ShopifyClient, poll: BulkPollConfig) -> Self {
        Self { client, poll }
    }
}

impl RecordSource for ShopifyRecordSource {
    fn bulk_records(
        &self,
        plan: &QueryPlan,
        timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> RecordStream {
        let poll = BulkPollConfig {
            timeout: timeout.unwrap_or(self.poll.timeout),
            ..self.poll
        };
        bulk_stream(self.client.clone(), poll, plan.bulk_query(), cancel)
    }

    fn incremental_records(
        &self,
        plan: &QueryPlan,
        since: DateTime<Utc>,
        cancel: CancellationToken,
    ) -> RecordStream {
        incremental::records(self.client.clone(), plan, since, cancel)
    }
}

/// Run a bulk operation over `api` and stream its assembled records.
pub fn bulk_stream<A>(
    api: A,
    poll: BulkPollConfig,
    query: String,
    cancel: CancellationToken,
) -> RecordStream
where
    A: BulkApi + 'static,
{
    let stream = async_stream::stream! {
        let url = {
            let runner = BulkOperationRunner::new(&api, poll);
            runner.run(&query, &cancel).await
        };
        let url = match url {
            Ok(Some(url)) => url,
            Ok(None) => return,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let bytes = match api.download(&url).await {
            Ok(b) => b,
            Err(e) => {
                yield Err(e);
                return;
            }
        };

        let mut records = jsonl::records(bytes);
        while let Some(record) = records.next().await {
            if cancel.is_cancelled() {
                yield Err(ShopifyError::Cancelled("bulk download cancelled".to_string()));
                return;
            }
            yield record;
        }
    };
    stream.boxed()
}
