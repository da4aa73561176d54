//! Batch-scoped lookup tables.

use std::collections::HashMap;
use std::time::Instant;

use serde_json::Value;
use tracing::{debug, warn};

use super::result::LookupLoadStats;
use crate::record::display_value;
use crate::store::{StoreError, TargetWriter};

/// Identity of one preloaded lookup table.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LookupKey {
    pub table: String,
    pub match_column: String,
    pub return_column: String,
    pub case_sensitive: bool,
}

/// Normalized match value to return value.
#[derive(Debug, Clone, Default)]
pub struct LookupTable {
    case_sensitive: bool,
    entries: HashMap<String, Value>,
}

impl LookupTable {
    fn normalize(&self, value: &Value) -> String {
        let text = display_value(value);
        let text = text.trim();
        if self.case_sensitive {
            text.to_string()
        } else {
            text.to_lowercase()
        }
    }

    /// Return value for `value`. Null never matches.
    #[must_use]
    pub fn get(&self, value: &Value) -> Option<&Value> {
        if value.is_null() {
            return None;
        }
        self.entries.get(&self.normalize(value))
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All lookup tables for one batch.
#[derive(Debug, Default)]
pub struct LookupCache {
    tables: HashMap<LookupKey, LookupTable>,
    stats: LookupLoadStats,
}

impl LookupCache {
    /// Load every table in `keys` once.
    ///
    /// Tables larger than `max_rows` are truncated with a warning.
    ///
    /// # Errors
    ///
    /// Returns the key that failed and the store error.
    pub async fn load(
        writer: &dyn TargetWriter,
        keys: impl IntoIterator<Item = LookupKey>,
        max_rows: usize,
    ) -> Result<Self, (LookupKey, StoreError)> {
        let started = Instant::now();
        let mut cache = Self::default();

        for key in keys {
            if cache.tables.contains_key(&key) {
                continue;
            }
            let mut pairs = match writer
                .load_lookup(&key.table, &key.match_column, &key.return_column, max_rows + 1)
                .await
            {
                Ok(pairs) => pairs,
                Err(e) => return Err((key, e)),
            };
            if pairs.len() > max_rows {
                pairs.truncate(max_rows);
                let message = format!(
                    "Lookup table {} exceeds {max_rows} rows; extra rows ignored",
                    key.table
                );
                warn!(table = %key.table, max_rows, "Lookup table truncated");
                cache.stats.warnings.push(message);
            }

            let mut table = LookupTable {
                case_sensitive: key.case_sensitive,
                entries: HashMap::with_capacity(pairs.len()),
            };
            for (match_value, return_value) in pairs {
                let normalized = table.normalize(&match_value);
                table.entries.entry(normalized).or_insert(return_value);
            }
            cache.stats.rows_loaded += table.len();
            cache.tables.insert(key, table);
        }

        cache.stats.tables = cache.tables.len();
        cache.stats.load_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        debug!(
            tables = cache.stats.tables,
            rows = cache.stats.rows_loaded,
            "Lookup tables loaded"
        );
        Ok(cache)
    }

    /// Table for a key, if it was loaded.
    #[must_use]
    pub fn table(&self, key: &LookupKey) -> Option<&LookupTable> {
        self.tables.get(key)
    }

    /// Load statistics.
    #[must_use]
    pub const fn stats(&self) -> &LookupLoadStats {
        &self.stats
    }

    /// Drop every table.
    pub fn clear(&mut self) {
        self.tables.clear();
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::memory::MemoryTargetWriter;

    fn key(case_sensitive: bool) -> LookupKey {
        LookupKey {
            table: "vendors".into(),
            match_column: "name".into(),
            return_column: "id".into(),
            case_sensitive,
        }
    }

    fn writer() -> MemoryTargetWriter {
        let writer = MemoryTargetWriter::new();
        writer.insert_row("vendors", "name", json!({ "name": " Acme ", "id": 7 }));
        writer.insert_row("vendors", "name", json!({ "name": "Globex", "id": 9 }));
        writer
    }

    #[tokio::test]
    async fn test_case_insensitive_by_default() {
        let writer = writer();
        let cache = LookupCache::load(&writer, [key(false), key(false)], 100)
            .await
            .unwrap();
        assert_eq!(cache.stats().tables, 1);
        let table = cache.table(&key(false)).unwrap();
        assert_eq!(table.get(&json!("acme")), Some(&json!(7)));
        assert_eq!(table.get(&json!("GLOBEX ")), Some(&json!(9)));
        assert_eq!(table.get(&Value::Null), None);
    }

    #[tokio::test]
    async fn test_case_sensitive_tables_are_separate() {
        let writer = writer();
        let cache = LookupCache::load(&writer, [key(true)], 100).await.unwrap();
        let table = cache.table(&key(true)).unwrap();
        assert_eq!(table.get(&json!("Globex")), Some(&json!(9)));
        assert_eq!(table.get(&json!("globex")), None);
        assert!(cache.table(&key(false)).is_none());
    }

    #[tokio::test]
    async fn test_oversized_table_warns() {
        let writer = writer();
        let cache = LookupCache::load(&writer, [key(false)], 1).await.unwrap();
        assert_eq!(cache.stats().rows_loaded, 1);
        assert_eq!(cache.stats().warnings.len(), 1);
    }
}
