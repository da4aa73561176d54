//! Webhook intake and processing: verify, dedupe, queue, apply.

use std::sync::Arc;

use naked_pineapple_core::{MappingId, WebhookStatus};
use naked_pineapple_integration_tests::{Harness, product, signed_headers, variant_sku_mapping};
use naked_pineapple_sync::memory::{JobState, ScriptedRecordSource};
use naked_pineapple_sync::orchestrator::FullSyncOptions;
use naked_pineapple_sync::webhook::{IngestOutcome, WebhookError};
use serde_json::json;
use tokio::sync::Notify;

fn update_body(n: u32, status: &str) -> Vec<u8> {
    serde_json::to_vec(&json!({
        "id": n,
        "admin_graphql_api_id": format!("gid://shopify/Product/{n}"),
        "title": "Webhook Pineapple",
        "status": status,
        "price": "4.25"
    }))
    .unwrap()
}

#[tokio::test]
async fn test_product_update_is_written_through_the_queue() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = update_body(7, "active");

    let outcome = h
        .ingest
        .ingest(&signed_headers(&body, "products/update", "w-1"), &body)
        .await
        .unwrap();
    let IngestOutcome::Enqueued(job_id) = outcome else {
        panic!("expected the webhook to be queued, got {outcome:?}");
    };

    assert_eq!(h.webhooks.drain().await, 1);

    let row = h.writer.row("products", "gid://shopify/Product/7").unwrap();
    assert_eq!(row["title"], json!("Webhook Pineapple"));
    assert_eq!(row["price"], json!("4.25"));
    assert_eq!(h.queue.state(job_id).unwrap().0, JobState::Completed);

    let webhooks = h.history.webhooks();
    assert_eq!(webhooks.len(), 1);
    assert_eq!(webhooks[0].status, WebhookStatus::Completed);
    assert_eq!(webhooks[0].mappings_processed, vec![MappingId::new(1)]);
    assert_eq!(webhooks[0].records_written, 1);
}

#[tokio::test]
async fn test_redelivered_webhook_is_processed_once() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = update_body(7, "active");
    let headers = signed_headers(&body, "products/update", "w-2");

    assert!(matches!(
        h.ingest.ingest(&headers, &body).await.unwrap(),
        IngestOutcome::Enqueued(_)
    ));
    assert_eq!(
        h.ingest.ingest(&headers, &body).await.unwrap(),
        IngestOutcome::Duplicate
    );

    assert_eq!(h.webhooks.drain().await, 1);
    assert_eq!(h.history.webhooks().len(), 1);
}

#[tokio::test]
async fn test_tampered_body_is_rejected() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = update_body(7, "active");
    let headers = signed_headers(&body, "products/update", "w-3");
    let tampered = update_body(8, "active");

    let err = h.ingest.ingest(&headers, &tampered).await.unwrap_err();
    assert!(matches!(err, WebhookError::InvalidSignature));
    assert_eq!(h.queue.count(JobState::Pending), 0);
}

#[tokio::test]
async fn test_delete_webhook_removes_the_row() {
    let h = Harness::new(ScriptedRecordSource::default());
    h.writer.insert_row(
        "products",
        "shopify_id",
        json!({ "shopify_id": "gid://shopify/Product/7", "title": "Doomed" }),
    );
    let body = serde_json::to_vec(&json!({ "id": 7 })).unwrap();

    h.ingest
        .ingest(&signed_headers(&body, "products/delete", "w-4"), &body)
        .await
        .unwrap();
    h.webhooks.drain().await;

    assert!(h.writer.row("products", "gid://shopify/Product/7").is_none());
    assert_eq!(h.history.webhooks()[0].records_written, 1);
}

#[tokio::test]
async fn test_filtered_record_is_not_written() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = update_body(9, "draft");

    h.ingest
        .ingest(&signed_headers(&body, "products/update", "w-5"), &body)
        .await
        .unwrap();
    h.webhooks.drain().await;

    assert!(h.writer.rows("products").is_empty());
    let webhooks = h.history.webhooks();
    assert_eq!(webhooks[0].status, WebhookStatus::Completed);
    assert_eq!(webhooks[0].records_written, 0);
}

#[tokio::test]
async fn test_unmapped_topic_is_skipped() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = serde_json::to_vec(&json!({ "id": 1, "name": "Naked Pineapple" })).unwrap();

    h.ingest
        .ingest(&signed_headers(&body, "shop/update", "w-6"), &body)
        .await
        .unwrap();
    assert_eq!(h.webhooks.drain().await, 1);

    assert_eq!(h.queue.count(JobState::Completed), 1);
    assert_eq!(h.history.webhooks()[0].status, WebhookStatus::Skipped);
}

#[tokio::test]
async fn test_webhook_skipped_while_full_sync_runs() {
    let gate = Arc::new(Notify::new());
    let h = Harness::new(
        ScriptedRecordSource::new(vec![product(1, "ACTIVE", "1.00")]).with_gate(gate.clone()),
    );
    let orchestrator = h.orchestrator.clone();
    let full = tokio::spawn(async move {
        orchestrator
            .full_sync(MappingId::new(1), FullSyncOptions::default())
            .await
    });
    while !h.is_running(1) {
        tokio::task::yield_now().await;
    }

    let body = update_body(7, "active");
    h.ingest
        .ingest(&signed_headers(&body, "products/update", "w-7"), &body)
        .await
        .unwrap();
    h.webhooks.drain().await;

    assert_eq!(h.history.webhooks()[0].status, WebhookStatus::Skipped);
    assert!(h.writer.row("products", "gid://shopify/Product/7").is_none());

    gate.notify_one();
    assert!(full.await.unwrap().unwrap().success);
}

#[tokio::test]
async fn test_webhook_resolves_the_same_paths_as_bulk_records() {
    let h = Harness::new(ScriptedRecordSource::new(vec![json!({
        "id": "gid://shopify/Product/1",
        "title": "Tea",
        "status": "ACTIVE",
        "variants": { "edges": [
            { "node": { "id": "gid://shopify/ProductVariant/11", "sku": "TEA-12PK" } }
        ] }
    })]));
    h.catalog.insert(variant_sku_mapping(2));

    let result = h
        .orchestrator
        .full_sync(MappingId::new(2), FullSyncOptions::default())
        .await
        .unwrap();
    assert!(result.success);
    let row = h.writer.row("product_skus", "gid://shopify/Product/1").unwrap();
    assert_eq!(row["sku"], json!("TEA-12PK"));

    // REST shape: plain variants array, lowercase status
    let body = serde_json::to_vec(&json!({
        "id": 1,
        "admin_graphql_api_id": "gid://shopify/Product/1",
        "title": "Tea v2",
        "status": "active",
        "variants": [
            { "id": 11, "admin_graphql_api_id": "gid://shopify/ProductVariant/11", "sku": "TEA-24PK" }
        ]
    }))
    .unwrap();
    h.ingest
        .ingest(&signed_headers(&body, "products/update", "w-8"), &body)
        .await
        .unwrap();
    h.webhooks.drain().await;

    let row = h.writer.row("product_skus", "gid://shopify/Product/1").unwrap();
    assert_eq!(row["title"], json!("Tea v2"));
    assert_eq!(row["sku"], json!("TEA-24PK"));
    let webhooks = h.history.webhooks();
    assert_eq!(webhooks[0].status, WebhookStatus::Completed);
    assert!(webhooks[0].mappings_processed.contains(&MappingId::new(2)));
}

#[tokio::test]
async fn test_lowercase_rest_status_passes_uppercase_filter() {
    let h = Harness::new(ScriptedRecordSource::default());
    let body = update_body(12, "active");

    h.ingest
        .ingest(&signed_headers(&body, "products/update", "w-9"), &body)
        .await
        .unwrap();
    h.webhooks.drain().await;

    assert!(h.writer.row("products", "gid://shopify/Product/12").is_some());
    assert_eq!(h.history.webhooks()[0].records_written, 1);
}
