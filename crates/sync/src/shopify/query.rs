//! GraphQL documents derived from mapping configuration.
//!
//! The selection set is built from every source path the mapping reads:
//! enabled field sources, template placeholders, identifiers referenced by
//! expressions, the key field and filter fields. Dotted paths become nested
//! selections; numeric segments (array indices) are dropped.

use std::collections::BTreeMap;

use naked_pineapple_core::{MappingConfig, ResourceType, Transform};

use crate::expression::Expression;
use crate::transform::template;

/// Page size used for nested connections in paginated queries.
const NESTED_PAGE_SIZE: u32 = 50;

/// Bulk operation mutation.
pub const BULK_RUN_MUTATION: &str = r"
mutation bulkOperationRunQuery($query: String!) {
  bulkOperationRunQuery(query: $query) {
    bulkOperation { id status }
    userErrors { field message }
  }
}";

/// Bulk operation status query.
pub const BULK_STATUS_QUERY: &str = r"
query bulkOperationStatus($id: ID!) {
  node(id: $id) {
    ... on BulkOperation {
      id
      status
      errorCode
      objectCount
      url
      partialDataUrl
    }
  }
}";

/// Bulk operation cancel mutation.
pub const BULK_CANCEL_MUTATION: &str = r"
mutation bulkOperationCancel($id: ID!) {
  bulkOperationCancel(id: $id) {
    bulkOperation { id status }
    userErrors { field message }
  }
}";

/// Selection tree node; leaves have no children.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
struct Selection {
    children: BTreeMap<String, Selection>,
}

impl Selection {
    fn insert(&mut self, path: &str) {
        let mut node = self;
        for segment in path.split('.') {
            if segment.is_empty() || segment.starts_with("__") || segment.parse::<usize>().is_ok()
            {
                continue;
            }
            node = node.children.entry(segment.to_string()).or_default();
        }
    }

    fn render(&self, out: &mut String, paginate_nested: bool) {
        out.push_str(" {");
        for (name, child) in &self.children {
            out.push(' ');
            out.push_str(name);
            if paginate_nested && child.children.contains_key("edges") {
                out.push_str(&format!("(first: {NESTED_PAGE_SIZE})"));
            }
            if !child.children.is_empty() {
                child.render(out, paginate_nested);
            }
        }
        out.push_str(" }");
    }
}

/// GraphQL selection for one mapping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryPlan {
    resource: ResourceType,
    selection: Selection,
}

impl QueryPlan {
    /// Build the plan for a mapping. `id` and `updatedAt` are always selected.
    #[must_use]
    pub fn for_mapping(mapping: &MappingConfig) -> Self {
        let mut selection = Selection::default();
        selection.insert("id");
        if mapping.source_resource.supports_updated_at_filter() {
            selection.insert("updatedAt");
        }

        if let Some(key) = &mapping.key_mapping {
            selection.insert(&key.source_field);
        }
        for filter in &mapping.filters {
            selection.insert(&filter.field);
        }

        for field in mapping.enabled_fields() {
            let sources = field.source.fields();
            for path in &sources {
                selection.insert(path);
            }
            match &field.transform {
                Some(Transform::Template { template }) => {
                    for placeholder in template::placeholders(template) {
                        selection.insert(&placeholder);
                    }
                }
                Some(Transform::Expression { formula }) => {
                    // Unparseable formulas fail later at compile time with a
                    // proper error; here they just contribute nothing.
                    if let Ok(expr) = Expression::compile(formula) {
                        let aliases = aliases_of(field);
                        for ident in expr.identifiers() {
                            if ident != "value" && !aliases.contains(&ident.as_str()) {
                                selection.insert(&ident);
                            }
                        }
                    }
                }
                _ => {}
            }
        }

        Self {
            resource: mapping.source_resource,
            selection,
        }
    }

    /// Resource this plan targets.
    #[must_use]
    pub const fn resource(&self) -> ResourceType {
        self.resource
    }

    /// Query text submitted to `bulkOperationRunQuery`.
    #[must_use]
    pub fn bulk_query(&self) -> String {
        let mut node = String::new();
        self.selection.render(&mut node, false);
        format!(
            "{{ {} {{ edges {{ node{node} }} }} }}",
            self.resource.connection_name()
        )
    }

    /// Paginated query taking `$first`, `$after` and `$query`.
    #[must_use]
    pub fn page_query(&self) -> String {
        let mut node = String::new();
        self.selection.render(&mut node, true);
        format!(
            "query SyncPage($first: Int!, $after: String, $query: String) {{ {}(first: $first, after: $after, query: $query) {{ edges {{ cursor node{node} }} pageInfo {{ hasNextPage endCursor }} }} }}",
            self.resource.connection_name()
        )
    }
}

fn aliases_of(field: &naked_pineapple_core::FieldMapping) -> Vec<&str> {
    match &field.source {
        naked_pineapple_core::FieldSource::Multiple { fields } => {
            fields.iter().map(|f| f.alias.as_str()).collect()
        }
        naked_pineapple_core::FieldSource::Single { .. } => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapping(json: serde_json::Value) -> MappingConfig {
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_bulk_query_nests_dotted_paths() {
        let m = mapping(serde_json::json!({
            "id": 1, "name": "p", "source_resource": "Product", "target_table": "products",
            "field_mappings": [
                { "source": { "type": "single", "field": "title" },
                  "target": { "table": "products", "column": "title" } },
                { "source": { "type": "single", "field": "priceRangeV2.minVariantPrice.amount" },
                  "target": { "table": "products", "column": "price" } }
            ]
        }));
        let query = QueryPlan::for_mapping(&m).bulk_query();
        assert_eq!(
            query,
            "{ products { edges { node { id priceRangeV2 { minVariantPrice { amount } } title updatedAt } } } }"
        );
    }

    #[test]
    fn test_disabled_fields_are_not_selected() {
        let m = mapping(serde_json::json!({
            "id": 1, "name": "p", "source_resource": "Customer", "target_table": "customers",
            "field_mappings": [
                { "source": { "type": "single", "field": "email" },
                  "target": { "table": "customers", "column": "email" }, "enabled": false }
            ]
        }));
        let query = QueryPlan::for_mapping(&m).bulk_query();
        assert!(!query.contains("email"));
        assert!(query.starts_with("{ customers"));
    }

    #[test]
    fn test_template_and_expression_fields_are_selected() {
        let m = mapping(serde_json::json!({
            "id": 1, "name": "p", "source_resource": "Product", "target_table": "products",
            "filters": [{ "field": "status", "operator": "eq", "value": "ACTIVE" }],
            "field_mappings": [
                { "source": { "type": "single", "field": "title" },
                  "target": { "table": "products", "column": "label" },
                  "transform": { "type": "template", "template": "{vendor} - {title}" } },
                { "source": { "type": "multiple", "fields": [{ "field": "totalInventory", "alias": "qty" }] },
                  "target": { "table": "products", "column": "stock" },
                  "transform": { "type": "expression", "formula": "qty + handle.length" } }
            ]
        }));
        let query = QueryPlan::for_mapping(&m).bulk_query();
        for field in ["vendor", "title", "status", "totalInventory", "handle { length }"] {
            assert!(query.contains(field), "missing {field} in {query}");
        }
        assert!(!query.contains("qty"));
    }

    #[test]
    fn test_page_query_paginates_nested_connections() {
        let m = mapping(serde_json::json!({
            "id": 1, "name": "p", "source_resource": "Product", "target_table": "products",
            "field_mappings": [
                { "source": { "type": "single", "field": "variants.edges.0.node.sku" },
                  "target": { "table": "products", "column": "sku" } }
            ]
        }));
        let plan = QueryPlan::for_mapping(&m);
        let query = plan.page_query();
        assert!(query.contains("variants(first: 50) { edges { node { sku } } }"));
        assert!(query.contains("pageInfo { hasNextPage endCursor }"));
        assert!(!plan.bulk_query().contains("first:"));
    }

    #[test]
    fn test_location_has_no_updated_at() {
        let m = mapping(serde_json::json!({
            "id": 1, "name": "l", "source_resource": "Location", "target_table": "locations"
        }));
        assert_eq!(
            QueryPlan::for_mapping(&m).bulk_query(),
            "{ locations { edges { node { id } } } }"
        );
    }
}
