//! `{field}` placeholder templates.

use serde_json::Value;

use crate::record::{display_value, resolve_present};

/// Dotted paths referenced by `{...}` placeholders, in order of appearance.
#[must_use]
pub fn placeholders(template: &str) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = rest.get(open + 1..).unwrap_or_default();
        let Some(close) = after.find('}') else {
            break;
        };
        let name = after.get(..close).unwrap_or_default().trim();
        if !name.is_empty() && !name.contains('{') && !out.iter().any(|n| n == name) {
            out.push(name.to_string());
        }
        rest = after.get(close + 1..).unwrap_or_default();
    }
    out
}

/// Fill placeholders from `record`.
///
/// Missing or null fields render as an empty string and produce a warning.
#[must_use]
pub fn render(template: &str, record: &Value) -> (String, Vec<String>) {
    let mut out = String::with_capacity(template.len());
    let mut warnings = Vec::new();
    let mut rest = template;

    while let Some(open) = rest.find('{') {
        out.push_str(rest.get(..open).unwrap_or_default());
        let after = rest.get(open + 1..).unwrap_or_default();
        let Some(close) = after.find('}') else {
            out.push('{');
            rest = after;
            continue;
        };
        let raw = after.get(..close).unwrap_or_default();
        let name = raw.trim();
        if name.is_empty() || name.contains('{') {
            out.push('{');
            rest = after;
            continue;
        }
        match resolve_present(record, name) {
            Some(v) => out.push_str(&display_value(v)),
            None => warnings.push(format!("Template placeholder '{name}' has no value")),
        }
        rest = after.get(close + 1..).unwrap_or_default();
    }
    out.push_str(rest);
    (out, warnings)
}
