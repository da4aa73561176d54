//! Dotted-path access into raw Shopify records.

use serde_json::Value;

/// Resolve a dotted path (`variants.edges.0.node.price`) against a record.
///
/// A key that literally contains the whole remaining path wins over
/// descending, so flattened webhook keys resolve too. Numeric segments index
/// arrays. Returns `None` for anything missing.
#[must_use]
pub fn resolve<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(record);
    }
    if let Some(v) = record.as_object().and_then(|o| o.get(path)) {
        return Some(v);
    }
    let (head, rest) = match path.split_once('.') {
        Some((h, r)) => (h, Some(r)),
        None => (path, None),
    };
    let next = match record {
        Value::Object(map) => map.get(head)?,
        Value::Array(items) => items.get(head.parse::<usize>().ok()?)?,
        _ => return None,
    };
    match rest {
        Some(rest) => resolve(next, rest),
        None => Some(next),
    }
}

/// Resolve a path, treating JSON null as missing.
#[must_use]
pub fn resolve_present<'a>(record: &'a Value, path: &str) -> Option<&'a Value> {
    resolve(record, path).filter(|v| !v.is_null())
}

/// Resolved value, or JSON null.
#[must_use]
pub fn resolve_or_null(record: &Value, path: &str) -> Value {
    resolve(record, path).cloned().unwrap_or(Value::Null)
}

/// Render a scalar for templates and string comparisons.
#[must_use]
pub fn display_value(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::Array(_) | Value::Object(_) => value.to_string(),
    }
}

/// A record's `id`, as a string.
#[must_use]
pub fn record_id(record: &Value) -> Option<String> {
    resolve_present(record, "id").map(display_value)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_resolves_nested_objects_and_arrays() {
        let record = json!({
            "title": "Tea",
            "variants": { "edges": [{ "node": { "price": "9.50" } }] },
            "tags": ["a", "b"]
        });
        assert_eq!(resolve(&record, "title"), Some(&json!("Tea")));
        assert_eq!(
            resolve(&record, "variants.edges.0.node.price"),
            Some(&json!("9.50"))
        );
        assert_eq!(resolve(&record, "tags.1"), Some(&json!("b")));
        assert_eq!(resolve(&record, "tags.9"), None);
        assert_eq!(resolve(&record, "title.length"), None);
    }

    #[test]
    fn test_literal_dotted_key_wins() {
        let record = json!({ "a.b": 1, "a": { "b": 2 } });
        assert_eq!(resolve(&record, "a.b"), Some(&json!(1)));
    }

    #[test]
    fn test_null_is_not_present() {
        let record = json!({ "vendor": null });
        assert!(resolve(&record, "vendor").is_some());
        assert!(resolve_present(&record, "vendor").is_none());
        assert_eq!(resolve_or_null(&record, "missing"), Value::Null);
    }

    #[test]
    fn test_display_value() {
        assert_eq!(display_value(&json!(null)), "");
        assert_eq!(display_value(&json!(1.5)), "1.5");
        assert_eq!(display_value(&json!("x")), "x");
        assert_eq!(record_id(&json!({ "id": 7 })).as_deref(), Some("7"));
    }
}
