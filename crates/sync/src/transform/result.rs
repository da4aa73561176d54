//! Per-record and per-batch transform outcomes.

use serde::Serialize;
use serde_json::Value;

/// A target row: column name to value.
pub type Row = serde_json::Map<String, Value>;

/// Three-way outcome of transforming one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformStatus {
    /// No field errors.
    Success,
    /// Some columns failed but the row still carries data.
    Partial,
    /// Nothing usable was produced.
    Error,
}

/// One failed field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub column: String,
    pub source_field: Option<String>,
    pub message: String,
}

impl std::fmt::Display for FieldError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.source_field {
            Some(source) => write!(f, "{} (from {source}): {}", self.column, self.message),
            None => write!(f, "{}: {}", self.column, self.message),
        }
    }
}

/// Counters for one record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransformStats {
    pub duration_us: u64,
    pub lookups: u32,
    pub expressions_evaluated: u32,
}

/// Outcome of transforming one source record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransformResult {
    /// Shopify `id` of the record, when it has one.
    pub source_id: Option<String>,
    pub row: Row,
    /// Human-readable description of each applied transform. Only filled
    /// when the batch was prepared with `TransformOptions::dry_run`; empty
    /// for live runs.
    pub applied: Vec<String>,
    pub errors: Vec<FieldError>,
    pub warnings: Vec<String>,
    pub stats: TransformStats,
}

impl TransformResult {
    /// Success when error-free, error when the row is empty, partial otherwise.
    #[must_use]
    pub fn status(&self) -> TransformStatus {
        if self.errors.is_empty() {
            TransformStatus::Success
        } else if self.row.values().any(|v| !v.is_null()) {
            TransformStatus::Partial
        } else {
            TransformStatus::Error
        }
    }
}

/// Statistics from preloading lookup tables.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LookupLoadStats {
    pub tables: usize,
    pub rows_loaded: usize,
    pub warnings: Vec<String>,
    pub load_ms: u64,
}

/// Outcome of transforming a batch.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchTransformResult {
    pub results: Vec<TransformResult>,
    pub success: usize,
    pub partial: usize,
    pub failed: usize,
    pub lookup: LookupLoadStats,
    pub duration_ms: u64,
}

impl BatchTransformResult {
    pub(crate) fn push(&mut self, result: TransformResult) {
        match result.status() {
            TransformStatus::Success => self.success += 1,
            TransformStatus::Partial => self.partial += 1,
            TransformStatus::Error => self.failed += 1,
        }
        self.results.push(result);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn result(row: Value, errors: usize) -> TransformResult {
        TransformResult {
            source_id: None,
            row: row.as_object().cloned().unwrap(),
            applied: Vec::new(),
            errors: (0..errors)
                .map(|i| FieldError {
                    column: format!("c{i}"),
                    source_field: None,
                    message: "bad".into(),
                })
                .collect(),
            warnings: Vec::new(),
            stats: TransformStats::default(),
        }
    }

    #[test]
    fn test_status_is_three_way() {
        assert_eq!(result(json!({ "a": 1 }), 0).status(), TransformStatus::Success);
        assert_eq!(result(json!({ "a": 1 }), 1).status(), TransformStatus::Partial);
        assert_eq!(result(json!({ "a": null }), 1).status(), TransformStatus::Error);
        assert_eq!(result(json!({}), 0).status(), TransformStatus::Success);
    }

    #[test]
    fn test_batch_counts() {
        let mut batch = BatchTransformResult::default();
        batch.push(result(json!({ "a": 1 }), 0));
        batch.push(result(json!({ "a": 1 }), 2));
        batch.push(result(json!({}), 1));
        assert_eq!((batch.success, batch.partial, batch.failed), (1, 1, 1));
    }
}
