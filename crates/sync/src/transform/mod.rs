//! Field-level transform engine.
//!
//! A [`MappingConfig`] is prepared once per batch: formulas are compiled,
//! lookup tables preloaded. The resulting [`PreparedMapping`] turns raw
//! Shopify records into target rows with per-field diagnostics. Lookup
//! tables are released when the prepared mapping is dropped.

pub mod coerce;
pub mod lookup;
pub mod result;
pub mod template;

pub use coerce::{CoercionError, coerce};
pub use lookup::{LookupCache, LookupKey};
pub use result::{
    BatchTransformResult, FieldError, LookupLoadStats, Row, TransformResult, TransformStats,
    TransformStatus,
};

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;
use futures::stream::BoxStream;
use naked_pineapple_core::{CoerceType, FieldSource, KeyMapping, MappingConfig, Transform};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::expression::{Expression, ExpressionError, Scope};
use crate::record::{display_value, record_id, resolve_or_null, resolve_present};
use crate::shopify::{RecordStream, ShopifyError};
use crate::store::{StoreError, TargetWriter};

/// Default cap on rows loaded per lookup table.
pub const DEFAULT_LOOKUP_MAX_ROWS: usize = 50_000;

/// Mapping-level failures that stop a batch before any record is touched.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("Invalid formula for column '{column}': {source}")]
    Expression {
        column: String,
        #[source]
        source: ExpressionError,
    },

    #[error("Failed to load lookup table {table}: {source}")]
    LookupLoad {
        table: String,
        #[source]
        source: StoreError,
    },
}

/// Options for one transform batch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransformOptions {
    /// Record applied-transform descriptions in
    /// [`TransformResult::applied`]. Live runs leave it empty.
    pub dry_run: bool,
}

/// Compiles mappings and loads lookup tables.
#[derive(Clone)]
pub struct TransformEngine {
    writer: Arc<dyn TargetWriter>,
    lookup_max_rows: usize,
}

impl std::fmt::Debug for TransformEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransformEngine")
            .field("lookup_max_rows", &self.lookup_max_rows)
            .finish_non_exhaustive()
    }
}

impl TransformEngine {
    /// Create an engine that loads lookup tables through `writer`.
    #[must_use]
    pub fn new(writer: Arc<dyn TargetWriter>, lookup_max_rows: usize) -> Self {
        Self {
            writer,
            lookup_max_rows,
        }
    }

    /// Compile formulas and preload lookup tables for `mapping`.
    ///
    /// # Errors
    ///
    /// Returns `TransformError` for invalid formulas or lookup load failures.
    #[instrument(skip_all, fields(mapping_id = %mapping.id))]
    pub async fn prepare(
        &self,
        mapping: &MappingConfig,
        options: TransformOptions,
    ) -> Result<PreparedMapping, TransformError> {
        let mut fields = Vec::new();
        let mut lookup_keys = Vec::new();

        for field in mapping.enabled_fields() {
            let column = field.target.column.clone();
            let step = match field.transform.as_ref().unwrap_or(&Transform::Direct) {
                Transform::Direct => Step::Direct,
                Transform::Coerce { target_type } => Step::Coerce(*target_type),
                Transform::Expression { formula } => {
                    Step::Expression(Expression::compile(formula).map_err(|source| {
                        TransformError::Expression {
                            column: column.clone(),
                            source,
                        }
                    })?)
                }
                Transform::Lookup {
                    table,
                    match_column,
                    return_column,
                    default_value,
                    case_sensitive,
                } => {
                    let key = LookupKey {
                        table: table.clone(),
                        match_column: match_column.clone(),
                        return_column: return_column.clone(),
                        case_sensitive: *case_sensitive,
                    };
                    lookup_keys.push(key.clone());
                    Step::Lookup {
                        key,
                        default: default_value.clone(),
                    }
                }
                Transform::Template { template } => Step::Template(template.clone()),
                Transform::Default {
                    value,
                    only_if_null,
                } => Step::Default {
                    value: value.clone(),
                    only_if_null: *only_if_null,
                },
            };
            fields.push(CompiledField {
                source: field.source.clone(),
                column,
                step,
            });
        }

        let lookups = LookupCache::load(self.writer.as_ref(), lookup_keys, self.lookup_max_rows)
            .await
            .map_err(|(key, source)| TransformError::LookupLoad {
                table: key.table,
                source,
            })?;

        Ok(PreparedMapping {
            fields,
            key: mapping.key_mapping.clone(),
            lookups,
            options,
        })
    }

    /// Transform a slice of records.
    ///
    /// # Errors
    ///
    /// Returns `TransformError` only for mapping-level failures; per-record
    /// problems are reported in the results.
    pub async fn transform_batch(
        &self,
        mapping: &MappingConfig,
        records: &[Value],
        options: TransformOptions,
    ) -> Result<BatchTransformResult, TransformError> {
        let prepared = self.prepare(mapping, options).await?;
        Ok(prepared.transform_batch(records))
    }

    /// Transform a lazy record stream.
    ///
    /// # Errors
    ///
    /// Returns `TransformError` when the mapping cannot be prepared.
    pub async fn transform_stream(
        &self,
        mapping: &MappingConfig,
        records: RecordStream,
        options: TransformOptions,
    ) -> Result<BoxStream<'static, Result<TransformResult, ShopifyError>>, TransformError> {
        let prepared = self.prepare(mapping, options).await?;
        Ok(prepared.into_stream(records))
    }
}

#[derive(Debug)]
enum Step {
    Direct,
    Coerce(CoerceType),
    Expression(Expression),
    Lookup {
        key: LookupKey,
        default: Option<Value>,
    },
    Template(String),
    Default {
        value: Value,
        only_if_null: bool,
    },
}

#[derive(Debug)]
struct CompiledField {
    source: FieldSource,
    column: String,
    step: Step,
}

/// A mapping ready to transform records.
#[derive(Debug)]
pub struct PreparedMapping {
    fields: Vec<CompiledField>,
    key: Option<KeyMapping>,
    lookups: LookupCache,
    options: TransformOptions,
}

impl Drop for PreparedMapping {
    fn drop(&mut self) {
        self.lookups.clear();
        debug!("Transform batch context released");
    }
}

impl PreparedMapping {
    /// Lookup preload statistics.
    #[must_use]
    pub const fn lookup_stats(&self) -> &LookupLoadStats {
        self.lookups.stats()
    }

    /// Transform one record.
    #[must_use]
    pub fn transform_record(&self, record: &Value) -> TransformResult {
        let started = Instant::now();
        let mut result = TransformResult {
            source_id: record_id(record),
            row: Row::new(),
            applied: Vec::new(),
            errors: Vec::new(),
            warnings: Vec::new(),
            stats: TransformStats::default(),
        };

        for field in &self.fields {
            let primary = field
                .source
                .primary_field()
                .map_or(Value::Null, |path| resolve_or_null(record, path));
            let aliases: Option<BTreeMap<String, Value>> = match &field.source {
                FieldSource::Multiple { fields } => Some(
                    fields
                        .iter()
                        .map(|a| (a.alias.clone(), resolve_or_null(record, &a.field)))
                        .collect(),
                ),
                FieldSource::Single { .. } => None,
            };

            match self.apply(field, record, &primary, aliases.as_ref(), &mut result) {
                Ok(value) => {
                    result.row.insert(field.column.clone(), value);
                }
                Err(message) => result.errors.push(FieldError {
                    column: field.column.clone(),
                    source_field: field.source.primary_field().map(str::to_string),
                    message,
                }),
            }
        }

        if let Some(key) = &self.key {
            let usable = result.row.values().any(|v| !v.is_null());
            if (usable || result.errors.is_empty()) && !result.row.contains_key(&key.target_column)
            {
                if let Some(value) = resolve_present(record, &key.source_field) {
                    result.row.insert(key.target_column.clone(), value.clone());
                }
            }
        }

        result.stats.duration_us =
            u64::try_from(started.elapsed().as_micros()).unwrap_or(u64::MAX);
        result
    }

    fn apply(
        &self,
        field: &CompiledField,
        record: &Value,
        primary: &Value,
        aliases: Option<&BTreeMap<String, Value>>,
        result: &mut TransformResult,
    ) -> Result<Value, String> {
        let source = field.source.fields().join(", ");
        let (value, description) = match &field.step {
            Step::Direct => (primary.clone(), format!("{source} -> {}", field.column)),
            Step::Coerce(target) => (
                coerce(primary, *target).map_err(|e| e.to_string())?,
                format!("{source} -> {} as {target}", field.column),
            ),
            Step::Expression(expression) => {
                let mut scope = Scope::new(record).with_value(primary);
                if let Some(aliases) = aliases {
                    scope = scope.with_aliases(aliases);
                }
                result.stats.expressions_evaluated += 1;
                (
                    expression.evaluate(&scope).map_err(|e| e.to_string())?,
                    format!("{} = {}", field.column, expression.source()),
                )
            }
            Step::Lookup { key, default } => {
                result.stats.lookups += 1;
                let found = self.lookups.table(key).and_then(|t| t.get(primary));
                let value = match (found, default) {
                    (Some(v), _) => v.clone(),
                    (None, Some(default)) => default.clone(),
                    (None, None) => {
                        result.warnings.push(format!(
                            "Lookup miss for {}: no {}.{} matching '{}'",
                            field.column,
                            key.table,
                            key.match_column,
                            display_value(primary)
                        ));
                        Value::Null
                    }
                };
                (
                    value,
                    format!(
                        "{} = lookup {}.{} by {}",
                        field.column, key.table, key.return_column, key.match_column
                    ),
                )
            }
            Step::Template(template) => {
                let (text, warnings) = template::render(template, record);
                result.warnings.extend(warnings);
                (
                    Value::String(text),
                    format!("{} = template \"{template}\"", field.column),
                )
            }
            Step::Default {
                value,
                only_if_null,
            } => {
                let chosen = if !*only_if_null || primary.is_null() {
                    value.clone()
                } else {
                    primary.clone()
                };
                (chosen, format!("{} = default {value}", field.column))
            }
        };
        if self.options.dry_run {
            result.applied.push(description);
        }
        Ok(value)
    }

    /// Transform a slice of records.
    #[must_use]
    pub fn transform_batch(&self, records: &[Value]) -> BatchTransformResult {
        let started = Instant::now();
        let mut batch = BatchTransformResult {
            lookup: self.lookups.stats().clone(),
            ..BatchTransformResult::default()
        };
        for record in records {
            batch.push(self.transform_record(record));
        }
        batch.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        batch
    }

    /// Transform records lazily. Lookup tables live as long as the stream.
    #[must_use]
    pub fn into_stream(
        self,
        mut records: RecordStream,
    ) -> BoxStream<'static, Result<TransformResult, ShopifyError>> {
        let stream = async_stream::stream! {
            while let Some(record) = records.next().await {
                match record {
                    Ok(record) => yield Ok(self.transform_record(&record)),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        };
        stream.boxed()
    }
}

#[cfg(test)]
mod tests {
    use futures::stream;
    use naked_pineapple_core::{FieldMapping, MappingId, ResourceType, SourceAlias, TargetColumn};
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryTargetWriter;

    fn field(source: &str, column: &str, transform: Option<Transform>) -> FieldMapping {
        FieldMapping {
            source: FieldSource::Single {
                field: source.into(),
            },
            target: TargetColumn {
                table: "products".into(),
                column: column.into(),
            },
            transform,
            enabled: true,
        }
    }

    fn mapping(fields: Vec<FieldMapping>) -> MappingConfig {
        MappingConfig {
            id: MappingId::new(1),
            name: "Products".into(),
            enabled: true,
            source_resource: ResourceType::Product,
            target_table: "products".into(),
            key_mapping: Some(KeyMapping {
                source_field: "id".into(),
                target_column: "shopify_id".into(),
            }),
            field_mappings: fields,
            filters: Vec::new(),
            webhook: naked_pineapple_core::WebhookSettings::default(),
            schedule: None,
        }
    }

    fn engine() -> TransformEngine {
        let writer = MemoryTargetWriter::new();
        writer.insert_row("vendors", "name", json!({ "name": "Acme", "id": 7 }));
        TransformEngine::new(Arc::new(writer), DEFAULT_LOOKUP_MAX_ROWS)
    }

    #[tokio::test]
    async fn test_decimal_coercion_preserves_text() {
        let mapping = mapping(vec![field(
            "price",
            "Price",
            Some(Transform::Coerce {
                target_type: CoerceType::Decimal,
            }),
        )]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions::default())
            .await
            .unwrap();
        let result = prepared.transform_record(&json!({ "id": "gid://shopify/Product/1", "price": "19.99" }));
        assert_eq!(result.row["Price"], json!("19.99"));
        assert_eq!(result.row["shopify_id"], json!("gid://shopify/Product/1"));
        assert_eq!(result.status(), TransformStatus::Success);
    }

    #[tokio::test]
    async fn test_lookup_miss_warns_without_error() {
        let lookup = |default_value| {
            Some(Transform::Lookup {
                table: "vendors".into(),
                match_column: "name".into(),
                return_column: "id".into(),
                default_value,
                case_sensitive: false,
            })
        };
        let mapping = mapping(vec![
            field("vendor", "vendor_id", lookup(None)),
            field("vendor", "vendor_or_zero", lookup(Some(json!(0)))),
        ]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions::default())
            .await
            .unwrap();

        let hit = prepared.transform_record(&json!({ "id": "1", "vendor": "ACME" }));
        assert_eq!(hit.row["vendor_id"], json!(7));
        assert!(hit.warnings.is_empty());

        let miss = prepared.transform_record(&json!({ "id": "2", "vendor": "Initech" }));
        assert_eq!(miss.row["vendor_id"], Value::Null);
        assert_eq!(miss.row["vendor_or_zero"], json!(0));
        assert_eq!(miss.warnings.len(), 1);
        assert!(miss.errors.is_empty());
        assert_eq!(miss.stats.lookups, 2);
    }

    #[tokio::test]
    async fn test_expression_with_aliases() {
        let mut unit_price = field(
            "",
            "unit_price",
            Some(Transform::Expression {
                formula: "price / parseSkuUnits(sku)".into(),
            }),
        );
        unit_price.source = FieldSource::Multiple {
            fields: vec![
                SourceAlias {
                    field: "variants.0.price".into(),
                    alias: "price".into(),
                },
                SourceAlias {
                    field: "variants.0.sku".into(),
                    alias: "sku".into(),
                },
            ],
        };
        let mapping = mapping(vec![unit_price]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions { dry_run: true })
            .await
            .unwrap();
        let result = prepared.transform_record(&json!({
            "id": "1",
            "variants": [{ "price": "24", "sku": "TEA-12PK" }]
        }));
        assert_eq!(result.row["unit_price"], json!(2));
        assert_eq!(result.applied, vec!["unit_price = price / parseSkuUnits(sku)"]);
    }

    #[tokio::test]
    async fn test_live_run_records_no_descriptions() {
        let mapping = mapping(vec![field(
            "title",
            "title",
            Some(Transform::Template {
                template: "{title}!".into(),
            }),
        )]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions::default())
            .await
            .unwrap();
        let result = prepared.transform_record(&json!({ "id": "1", "title": "Tea" }));
        assert_eq!(result.row["title"], json!("Tea!"));
        assert!(result.applied.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_formula_fails_prepare() {
        let mapping = mapping(vec![field(
            "title",
            "t",
            Some(Transform::Expression {
                formula: "eval(title)".into(),
            }),
        )]);
        assert!(matches!(
            engine().prepare(&mapping, TransformOptions::default()).await,
            Err(TransformError::Expression { .. })
        ));
    }

    #[tokio::test]
    async fn test_errors_make_partial_or_error() {
        let int = Some(Transform::Coerce {
            target_type: CoerceType::Int,
        });
        let mapping = mapping(vec![
            field("title", "title", None),
            field("qty", "qty", int.clone()),
        ]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions::default())
            .await
            .unwrap();

        let partial = prepared.transform_record(&json!({ "id": "1", "title": "Tea", "qty": "lots" }));
        assert_eq!(partial.status(), TransformStatus::Partial);
        assert_eq!(partial.errors[0].column, "qty");

        let failed = prepared.transform_record(&json!({ "id": "2", "qty": "lots" }));
        assert_eq!(failed.status(), TransformStatus::Error);
        assert!(!failed.row.contains_key("shopify_id"));
    }

    #[tokio::test]
    async fn test_template_and_default() {
        let mapping = mapping(vec![
            field(
                "title",
                "label",
                Some(Transform::Template {
                    template: "{vendor} {title}".into(),
                }),
            ),
            field(
                "status",
                "status",
                Some(Transform::Default {
                    value: json!("draft"),
                    only_if_null: true,
                }),
            ),
            field(
                "status",
                "forced",
                Some(Transform::Default {
                    value: json!("x"),
                    only_if_null: false,
                }),
            ),
        ]);
        let prepared = engine()
            .prepare(&mapping, TransformOptions::default())
            .await
            .unwrap();
        let result = prepared.transform_record(&json!({ "id": "1", "title": "Tea", "status": "active" }));
        assert_eq!(result.row["label"], json!(" Tea"));
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.row["status"], json!("active"));
        assert_eq!(result.row["forced"], json!("x"));

        let empty = prepared.transform_record(&json!({ "id": "2" }));
        assert_eq!(empty.row["status"], json!("draft"));
    }

    #[tokio::test]
    async fn test_disabled_fields_are_skipped() {
        let mut disabled = field("title", "title", None);
        disabled.enabled = false;
        let mapping = mapping(vec![disabled]);
        let batch = engine()
            .transform_batch(&mapping, &[json!({ "id": "1", "title": "Tea" })], TransformOptions::default())
            .await
            .unwrap();
        assert_eq!(batch.success, 1);
        assert!(!batch.results[0].row.contains_key("title"));
    }

    #[tokio::test]
    async fn test_transform_stream_is_lazy() {
        let mapping = mapping(vec![field("title", "title", None)]);
        let records: RecordStream = stream::iter(vec![
            Ok(json!({ "id": "1", "title": "A" })),
            Ok(json!({ "id": "2", "title": "B" })),
        ])
        .boxed();
        let results: Vec<_> = engine()
            .transform_stream(&mapping, records, TransformOptions::default())
            .await
            .unwrap()
            .collect()
            .await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[1].as_ref().unwrap().row["title"], json!("B"));
    }
}
