//! Mapping configuration repository.

use async_trait::async_trait;
use naked_pineapple_core::{MappingConfig, MappingId, ResourceType};
use serde_json::Value;
use sqlx::PgPool;
use tracing::instrument;

use super::{MappingCatalog, RepositoryError, decode_json};

/// Internal row type for `sync.mappings`.
#[derive(Debug, sqlx::FromRow)]
struct MappingRow {
    id: i32,
    name: String,
    enabled: bool,
    config: Value,
}

impl TryFrom<MappingRow> for MappingConfig {
    type Error = RepositoryError;

    fn try_from(row: MappingRow) -> Result<Self, Self::Error> {
        let mut config = row.config;
        // Columns are authoritative over the document.
        if let Value::Object(map) = &mut config {
            map.insert("id".into(), Value::from(row.id));
            map.insert("name".into(), Value::from(row.name));
            map.insert("enabled".into(), Value::from(row.enabled));
        }
        decode_json(config, "mapping config")
    }
}

/// [`MappingCatalog`] over `sync.mappings`.
#[derive(Debug, Clone)]
pub struct PgMappingCatalog {
    pool: PgPool,
}

impl PgMappingCatalog {
    #[must_use]
    pub const fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl MappingCatalog for PgMappingCatalog {
    #[instrument(skip(self), fields(mapping_id = %id))]
    async fn get(&self, id: MappingId) -> Result<Option<MappingConfig>, RepositoryError> {
        let row = sqlx::query_as::<_, MappingRow>(
            r"
            SELECT id, name, enabled, config
            FROM sync.mappings
            WHERE id = $1
            ",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(TryInto::try_into).transpose()
    }

    #[instrument(skip(self))]
    async fn list_enabled_for_resource(
        &self,
        resource: ResourceType,
    ) -> Result<Vec<MappingConfig>, RepositoryError> {
        let rows = sqlx::query_as::<_, MappingRow>(
            r"
            SELECT id, name, enabled, config
            FROM sync.mappings
            WHERE enabled AND source_resource = $1
            ORDER BY id
            ",
        )
        .bind(resource.to_string())
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }

    async fn list_all(&self) -> Result<Vec<MappingConfig>, RepositoryError> {
        let rows = sqlx::query_as::<_, MappingRow>(
            r"
            SELECT id, name, enabled, config
            FROM sync.mappings
            ORDER BY id
            ",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_row_columns_override_document() {
        let row = MappingRow {
            id: 4,
            name: "Orders".into(),
            enabled: false,
            config: json!({
                "id": 99,
                "name": "stale",
                "source_resource": "Order",
                "target_table": "orders"
            }),
        };
        let mapping = MappingConfig::try_from(row).unwrap();
        assert_eq!(mapping.id, MappingId::new(4));
        assert_eq!(mapping.name, "Orders");
        assert!(!mapping.enabled);
    }

    #[test]
    fn test_invalid_document_is_corruption() {
        let row = MappingRow {
            id: 1,
            name: "x".into(),
            enabled: true,
            config: json!({ "source_resource": "Widget" }),
        };
        assert!(matches!(
            MappingConfig::try_from(row),
            Err(RepositoryError::DataCorruption(_))
        ));
    }
}
