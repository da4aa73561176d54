//! Mapping configuration: the ETL recipe that moves one Shopify resource
//! into one target table.
//!
//! A mapping is authored in the admin panel and stored as a single JSON
//! document. Every sync, webhook and schedule refers to it by [`MappingId`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::id::MappingId;
use super::schedule::ScheduleConfig;
use super::status::DeleteStrategy;

/// Shopify resource types that can feed a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceType {
    Product,
    ProductVariant,
    Order,
    Customer,
    Collection,
    InventoryItem,
    Location,
}

impl ResourceType {
    /// All supported resource types.
    pub const ALL: [Self; 7] = [
        Self::Product,
        Self::ProductVariant,
        Self::Order,
        Self::Customer,
        Self::Collection,
        Self::InventoryItem,
        Self::Location,
    ];

    /// Name of the top-level Admin API connection for this resource.
    #[must_use]
    pub const fn connection_name(self) -> &'static str {
        match self {
            Self::Product => "products",
            Self::ProductVariant => "productVariants",
            Self::Order => "orders",
            Self::Customer => "customers",
            Self::Collection => "collections",
            Self::InventoryItem => "inventoryItems",
            Self::Location => "locations",
        }
    }

    /// Whether the connection accepts an `updated_at` search filter.
    #[must_use]
    pub const fn supports_updated_at_filter(self) -> bool {
        !matches!(self, Self::Location)
    }
}

impl std::fmt::Display for ResourceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Product => "Product",
            Self::ProductVariant => "ProductVariant",
            Self::Order => "Order",
            Self::Customer => "Customer",
            Self::Collection => "Collection",
            Self::InventoryItem => "InventoryItem",
            Self::Location => "Location",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for ResourceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|r| r.to_string() == s)
            .ok_or_else(|| format!("invalid resource type: {s}"))
    }
}

/// A configured source-resource-to-target-table recipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingConfig {
    pub id: MappingId,
    pub name: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    pub source_resource: ResourceType,
    /// Target table, optionally schema-qualified (`schema.table`).
    pub target_table: String,
    /// Natural key used for upserts and stale-row deletion.
    #[serde(default)]
    pub key_mapping: Option<KeyMapping>,
    #[serde(default)]
    pub field_mappings: Vec<FieldMapping>,
    /// Pre-transform filters; all must pass.
    #[serde(default)]
    pub filters: Vec<Filter>,
    #[serde(default)]
    pub webhook: WebhookSettings,
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
}

impl MappingConfig {
    /// Field mappings that take part in transforms.
    pub fn enabled_fields(&self) -> impl Iterator<Item = &FieldMapping> {
        self.field_mappings.iter().filter(|f| f.enabled)
    }

    /// Whether this mapping reacts to the given webhook topic.
    ///
    /// An empty topic list accepts every topic for the source resource.
    #[must_use]
    pub fn accepts_topic(&self, topic: &str) -> bool {
        self.webhook.enabled
            && (self.webhook.topics.is_empty() || self.webhook.topics.iter().any(|t| t == topic))
    }
}

/// Source field and target column forming the natural key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeyMapping {
    pub source_field: String,
    pub target_column: String,
}

/// One source-to-target wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
    pub source: FieldSource,
    pub target: TargetColumn,
    #[serde(default)]
    pub transform: Option<Transform>,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

/// Where a field mapping reads its input.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum FieldSource {
    /// One dotted source path.
    Single { field: String },
    /// Several aliased paths feeding an expression. The first one doubles as
    /// the primary value.
    Multiple { fields: Vec<SourceAlias> },
}

impl FieldSource {
    /// Dotted path of the primary input.
    #[must_use]
    pub fn primary_field(&self) -> Option<&str> {
        match self {
            Self::Single { field } => Some(field),
            Self::Multiple { fields } => fields.first().map(|f| f.field.as_str()),
        }
    }

    /// Every dotted path this source reads.
    #[must_use]
    pub fn fields(&self) -> Vec<&str> {
        match self {
            Self::Single { field } => vec![field.as_str()],
            Self::Multiple { fields } => fields.iter().map(|f| f.field.as_str()).collect(),
        }
    }
}

/// A source path with the name it is bound to inside expressions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceAlias {
    pub field: String,
    pub alias: String,
}

/// Destination of a field mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetColumn {
    pub table: String,
    pub column: String,
}

/// Transform applied to the extracted source value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Transform {
    Direct,
    Coerce {
        target_type: CoerceType,
    },
    Expression {
        formula: String,
    },
    Lookup {
        table: String,
        match_column: String,
        return_column: String,
        #[serde(default)]
        default_value: Option<Value>,
        #[serde(default)]
        case_sensitive: bool,
    },
    Template {
        template: String,
    },
    Default {
        value: Value,
        #[serde(default = "default_true")]
        only_if_null: bool,
    },
}

/// Target types for coercion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoerceType {
    String,
    Int,
    Float,
    Boolean,
    Date,
    Datetime,
    Decimal,
    Bigint,
}

impl std::fmt::Display for CoerceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::String => "string",
            Self::Int => "int",
            Self::Float => "float",
            Self::Boolean => "boolean",
            Self::Date => "date",
            Self::Datetime => "datetime",
            Self::Decimal => "decimal",
            Self::Bigint => "bigint",
        };
        f.write_str(name)
    }
}

/// A predicate over a dotted field path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    #[serde(default)]
    pub value: Value,
}

/// Supported filter operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilterOperator {
    Eq,
    Neq,
    In,
    NotIn,
    Exists,
    NotExists,
    Gt,
    Lt,
    Gte,
    Lte,
    Contains,
    StartsWith,
    Regex,
}

/// Webhook behaviour for a mapping.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WebhookSettings {
    #[serde(default)]
    pub enabled: bool,
    /// Topics this mapping reacts to; empty means all topics of the resource.
    #[serde(default)]
    pub topics: Vec<String>,
    #[serde(default)]
    pub delete_strategy: DeleteStrategy,
    /// Timestamp column stamped by the soft delete strategy.
    #[serde(default)]
    pub soft_delete_column: Option<String>,
}

const fn default_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> Value {
        serde_json::json!({
            "id": 3,
            "name": "Products",
            "source_resource": "Product",
            "target_table": "catalog.products",
            "key_mapping": { "source_field": "id", "target_column": "shopify_id" },
            "field_mappings": [
                {
                    "source": { "type": "single", "field": "title" },
                    "target": { "table": "catalog.products", "column": "title" }
                },
                {
                    "source": { "type": "multiple", "fields": [
                        { "field": "variants.0.price", "alias": "price" },
                        { "field": "variants.0.sku", "alias": "sku" }
                    ]},
                    "target": { "table": "catalog.products", "column": "unit_price" },
                    "transform": { "type": "expression", "formula": "price / parseSkuUnits(sku)" },
                    "enabled": false
                }
            ],
            "filters": [{ "field": "status", "operator": "eq", "value": "ACTIVE" }]
        })
    }

    #[test]
    fn test_mapping_deserializes_with_defaults() {
        let mapping: MappingConfig = serde_json::from_value(sample_json()).unwrap();
        assert!(mapping.enabled);
        assert_eq!(mapping.source_resource, ResourceType::Product);
        assert_eq!(mapping.field_mappings.len(), 2);
        assert!(mapping.field_mappings[0].enabled);
        assert_eq!(mapping.webhook.delete_strategy, DeleteStrategy::Ignore);
        assert!(mapping.schedule.is_none());
    }

    #[test]
    fn test_enabled_fields_skips_disabled() {
        let mapping: MappingConfig = serde_json::from_value(sample_json()).unwrap();
        let enabled: Vec<_> = mapping.enabled_fields().collect();
        assert_eq!(enabled.len(), 1);
        assert_eq!(enabled[0].target.column, "title");
    }

    #[test]
    fn test_multiple_source_primary_is_first_field() {
        let source = FieldSource::Multiple {
            fields: vec![
                SourceAlias {
                    field: "a.b".into(),
                    alias: "ab".into(),
                },
                SourceAlias {
                    field: "c".into(),
                    alias: "c".into(),
                },
            ],
        };
        assert_eq!(source.primary_field(), Some("a.b"));
        assert_eq!(source.fields(), vec!["a.b", "c"]);
    }

    #[test]
    fn test_accepts_topic() {
        let mut mapping: MappingConfig = serde_json::from_value(sample_json()).unwrap();
        assert!(!mapping.accepts_topic("products/update"));

        mapping.webhook.enabled = true;
        assert!(mapping.accepts_topic("products/update"));

        mapping.webhook.topics = vec!["products/delete".into()];
        assert!(!mapping.accepts_topic("products/update"));
        assert!(mapping.accepts_topic("products/delete"));
    }

    #[test]
    fn test_resource_type_parse() {
        assert_eq!(
            "InventoryItem".parse::<ResourceType>().unwrap(),
            ResourceType::InventoryItem
        );
        assert_eq!(ResourceType::Order.connection_name(), "orders");
        assert!("Widget".parse::<ResourceType>().is_err());
    }
}
