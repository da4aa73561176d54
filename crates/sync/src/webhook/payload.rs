//! Topic routing and REST payload normalisation.
//!
//! Webhooks carry REST-shaped JSON (`snake_case`, numeric ids, plain arrays,
//! lowercase enums). Mappings are written against GraphQL records
//! (`camelCase`, `gid://` ids, connections, `SCREAMING_CASE` enums), so
//! payloads are rewritten before filters and transforms see them.

use naked_pineapple_core::ResourceType;
use serde_json::{Map, Value};

use crate::shopify::jsonl::{connection_field, gid_type, into_connection, is_connection_field};

/// Fields GraphQL exposes as enums but REST sends in lowercase.
const ENUM_FIELDS: &[&str] = &[
    "status",
    "state",
    "inventoryPolicy",
    "financialStatus",
    "fulfillmentStatus",
    "displayFinancialStatus",
    "displayFulfillmentStatus",
    "cancelReason",
    "publishedScope",
];

/// Resource fed by a webhook topic (`products/update` → `Product`).
#[must_use]
pub fn resource_for_topic(topic: &str) -> Option<ResourceType> {
    let (prefix, _) = topic.split_once('/')?;
    match prefix {
        "products" => Some(ResourceType::Product),
        "orders" => Some(ResourceType::Order),
        "customers" => Some(ResourceType::Customer),
        "collections" => Some(ResourceType::Collection),
        "inventory_items" => Some(ResourceType::InventoryItem),
        "locations" => Some(ResourceType::Location),
        _ => None,
    }
}

/// Whether the topic reports a deletion.
#[must_use]
pub fn is_delete_topic(topic: &str) -> bool {
    topic.ends_with("/delete")
}

/// Rewrite a REST payload into the shape of a GraphQL record.
///
/// - keys become `camelCase`
/// - `admin_graphql_api_id` replaces `id`
/// - a bare numeric top-level `id` (delete payloads) becomes a GID
/// - arrays under connection fields become `{ edges: [{ node }] }`
/// - enum fields are upper-cased (`active` → `ACTIVE`)
#[must_use]
pub fn normalize_payload(payload: Value, resource: ResourceType) -> Value {
    match normalize_value(payload) {
        Value::Object(mut map) => {
            if let Some(Value::Number(n)) = map.get("id") {
                let gid = format!("gid://shopify/{resource}/{n}");
                map.insert("id".to_string(), Value::String(gid));
            }
            Value::Object(map)
        }
        other => other,
    }
}

fn normalize_value(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(normalize_object(map)),
        Value::Array(items) => Value::Array(items.into_iter().map(normalize_value).collect()),
        other => other,
    }
}

fn normalize_object(map: Map<String, Value>) -> Map<String, Value> {
    let mut out = Map::with_capacity(map.len());
    let mut gid = None;
    for (key, value) in map {
        if key == "admin_graphql_api_id" {
            gid = Some(value);
            continue;
        }
        let key = camel_case(&key);
        let value = match normalize_value(value) {
            Value::Array(items) if is_connection(&key, &items) => into_connection(items),
            Value::String(text) if ENUM_FIELDS.contains(&key.as_str()) => {
                Value::String(text.to_ascii_uppercase())
            }
            other => other,
        };
        out.insert(key, value);
    }
    if let Some(gid) = gid.filter(Value::is_string) {
        out.insert("id".to_string(), gid);
    }
    out
}

/// A non-empty array of objects under a known connection field, or whose
/// nodes' GID type maps to this field.
fn is_connection(key: &str, items: &[Value]) -> bool {
    let Some(first) = items.first() else {
        return false;
    };
    if !items.iter().all(Value::is_object) {
        return false;
    }
    is_connection_field(key)
        || first
            .get("id")
            .and_then(Value::as_str)
            .and_then(gid_type)
            .is_some_and(|t| connection_field(t) == key)
}

fn camel_case(key: &str) -> String {
    let mut out = String::with_capacity(key.len());
    let mut upper = false;
    for c in key.chars() {
        if c == '_' && !out.is_empty() {
            upper = true;
        } else if upper {
            out.extend(c.to_uppercase());
            upper = false;
        } else {
            out.push(c);
        }
    }
    out
}
