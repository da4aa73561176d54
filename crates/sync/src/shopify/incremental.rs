//! Cursor pagination over `updated_at`-filtered connections.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::StreamExt;
use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::client::DEFAULT_MAX_RETRIES;
use super::source::RecordStream;
use super::{QueryPlan, ShopifyClient, ShopifyError};

/// Records requested per page.
pub const PAGE_SIZE: u32 = 250;

/// Anything that can run a GraphQL document.
#[async_trait]
pub trait GraphQLExecutor: Send + Sync {
    /// Execute `query` and return the `data` object.
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ShopifyError>;
}

#[async_trait]
impl GraphQLExecutor for ShopifyClient {
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ShopifyError> {
        self.query(query, variables, DEFAULT_MAX_RETRIES).await
    }
}

#[async_trait]
impl<T: GraphQLExecutor + ?Sized> GraphQLExecutor for std::sync::Arc<T> {
    async fn execute(&self, query: &str, variables: Value) -> Result<Value, ShopifyError> {
        self.as_ref().execute(query, variables).await
    }
}

/// Shopify search syntax for "updated after `since`".
#[must_use]
pub fn updated_since_filter(since: DateTime<Utc>) -> String {
    format!(
        "updated_at:>'{}'",
        since.to_rfc3339_opts(SecondsFormat::Secs, true)
    )
}

/// One page of a connection.
#[derive(Debug, PartialEq)]
pub struct Page {
    /// Page nodes.
    pub nodes: Vec<Value>,
    /// Cursor for the next page, when there is one.
    pub next_cursor: Option<String>,
}

/// Pull nodes and page info out of `data[connection]`.
///
/// # Errors
///
/// Returns `UnexpectedResponse` if the connection is missing.
pub fn parse_page(data: &Value, connection: &str) -> Result<Page, ShopifyError> {
    let conn = data
        .get(connection)
        .filter(|v| v.is_object())
        .ok_or_else(|| ShopifyError::UnexpectedResponse(format!("missing {connection}")))?;

    let nodes = conn
        .get("edges")
        .and_then(Value::as_array)
        .map(|edges| {
            edges
                .iter()
                .filter_map(|e| e.get("node").cloned())
                .collect()
        })
        .unwrap_or_default();

    let page_info = conn.get("pageInfo");
    let has_next = page_info
        .and_then(|p| p.get("hasNextPage"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    let next_cursor = if has_next {
        page_info
            .and_then(|p| p.get("endCursor"))
            .and_then(Value::as_str)
            .map(String::from)
    } else {
        None
    };

    Ok(Page { nodes, next_cursor })
}

/// Stream every record updated after `since`, one page at a time.
///
/// Resources without an `updated_at` filter are fetched in full.
pub fn records<E>(
    executor: E,
    plan: &QueryPlan,
    since: DateTime<Utc>,
    cancel: CancellationToken,
) -> RecordStream
where
    E: GraphQLExecutor + 'static,
{
    let query = plan.page_query();
    let connection = plan.resource().connection_name();
    let search = plan
        .resource()
        .supports_updated_at_filter()
        .then(|| updated_since_filter(since));

    let stream = async_stream::stream! {
        let mut cursor: Option<String> = None;
        let mut page_number = 0u32;
        loop {
            if cancel.is_cancelled() {
                yield Err(ShopifyError::Cancelled("incremental fetch cancelled".to_string()));
                return;
            }

            let variables = json!({ "first": PAGE_SIZE, "after": cursor, "query": search });
            let page = match executor.execute(&query, variables).await {
                Ok(data) => parse_page(&data, connection),
                Err(e) => Err(e),
            };
            let page = match page {
                Ok(p) => p,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };

            page_number += 1;
            debug!(page = page_number, records = page.nodes.len(), "Fetched page");

            for node in page.nodes {
                if cancel.is_cancelled() {
                    yield Err(ShopifyError::Cancelled("incremental fetch cancelled".to_string()));
                    return;
                }
                yield Ok(node);
            }

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
    };
    stream.boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::TimeZone;
    use futures::TryStreamExt;
    use naked_pineapple_core::MappingConfig;

    use super::*;

    struct PagedExecutor {
        pages: Vec<Value>,
        calls: Mutex<Vec<Value>>,
    }

    #[async_trait]
    impl GraphQLExecutor for PagedExecutor {
        async fn execute(&self, _query: &str, variables: Value) -> Result<Value, ShopifyError> {
            let mut calls = self.calls.lock().unwrap();
            let page = self.pages.get(calls.len()).cloned().unwrap();
            calls.push(variables);
            Ok(page)
        }
    }

    fn plan() -> QueryPlan {
        let mapping: MappingConfig = serde_json::from_value(json!({
            "id": 1, "name": "p", "source_resource": "Product", "target_table": "products"
        }))
        .unwrap();
        QueryPlan::for_mapping(&mapping)
    }

    fn page(ids: &[&str], next: Option<&str>) -> Value {
        let edges: Vec<Value> = ids.iter().map(|id| json!({ "node": { "id": id } })).collect();
        json!({ "products": {
            "edges": edges,
            "pageInfo": { "hasNextPage": next.is_some(), "endCursor": next }
        }})
    }

    #[test]
    fn test_updated_since_filter() {
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        assert_eq!(updated_since_filter(since), "updated_at:>'2026-03-01T12:00:00Z'");
    }

    #[test]
    fn test_parse_page_missing_connection() {
        assert!(parse_page(&json!({}), "orders").is_err());
        let parsed = parse_page(&page(&["a"], None), "products").unwrap();
        assert_eq!(parsed.nodes.len(), 1);
        assert!(parsed.next_cursor.is_none());
    }

    #[tokio::test]
    async fn test_follows_cursors_until_last_page() {
        let executor = std::sync::Arc::new(PagedExecutor {
            pages: vec![page(&["a", "b"], Some("c1")), page(&["c"], None)],
            calls: Mutex::new(Vec::new()),
        });
        let since = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let stream = records(executor.clone(), &plan(), since, CancellationToken::new());
        let nodes: Vec<Value> = stream.try_collect().await.unwrap();
        assert_eq!(nodes.len(), 3);

        let calls = executor.calls.lock().unwrap();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0]["after"], Value::Null);
        assert_eq!(calls[1]["after"], "c1");
        assert_eq!(calls[0]["first"], 250);
        assert_eq!(calls[0]["query"], "updated_at:>'2026-03-01T00:00:00Z'");
    }

    #[tokio::test]
    async fn test_cancelled_before_first_page() {
        let executor = std::sync::Arc::new(PagedExecutor {
            pages: vec![page(&["a"], None)],
            calls: Mutex::new(Vec::new()),
        });
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result: Result<Vec<Value>, _> =
            records(executor.clone(), &plan(), Utc::now(), cancel).try_collect().await;
        assert!(matches!(result, Err(ShopifyError::Cancelled(_))));
        assert!(executor.calls.lock().unwrap().is_empty());
    }
}
