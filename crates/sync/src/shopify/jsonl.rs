//! Streaming reassembly of bulk operation JSONL output.
//!
//! Bulk results are one JSON object per line. Objects from nested
//! connections arrive as separate lines carrying `__parentId`, directly after
//! their parent. They are folded back into the parent under the connection
//! shape a paginated query would return (`field.edges[].node`), so the same
//! source paths resolve for both fetch modes.

use futures::StreamExt;
use serde_json::{Map, Value, json};
use tracing::warn;

use super::ShopifyError;
use super::bulk::ByteStream;
use super::source::RecordStream;

const PARENT_ID_KEY: &str = "__parentId";

/// Splits byte chunks into complete lines.
#[derive(Debug, Default)]
pub struct LineSplitter {
    buf: Vec<u8>,
}

impl LineSplitter {
    /// Append a chunk and drain every complete line.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let text = String::from_utf8_lossy(&line);
            let trimmed = text.trim();
            if !trimmed.is_empty() {
                lines.push(trimmed.to_string());
            }
        }
        lines
    }

    /// Whatever is left after the last newline.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buf);
        let text = String::from_utf8_lossy(&rest);
        let trimmed = text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    }
}

/// Folds child lines into the parent currently being buffered.
#[derive(Debug, Default)]
pub struct JsonlAssembler {
    pending: Option<Value>,
    malformed: u64,
}

impl JsonlAssembler {
    /// Feed one line. Returns a finished parent record when a new top-level
    /// object starts.
    pub fn push_line(&mut self, line: &str) -> Option<Value> {
        let mut value: Value = match serde_json::from_str(line) {
            Ok(v @ Value::Object(_)) => v,
            Ok(_) | Err(_) => {
                self.malformed += 1;
                warn!(line = %truncate(line, 200), "Skipping malformed JSONL line");
                return None;
            }
        };

        let parent_id = value
            .as_object_mut()
            .and_then(|o| o.remove(PARENT_ID_KEY))
            .and_then(|v| v.as_str().map(String::from));

        match parent_id {
            None => self.pending.replace(value),
            Some(parent_id) => {
                self.attach(&parent_id, value);
                None
            }
        }
    }

    /// Flush the final buffered parent.
    pub fn finish(&mut self) -> Option<Value> {
        self.pending.take()
    }

    /// Lines that could not be parsed.
    #[must_use]
    pub const fn malformed(&self) -> u64 {
        self.malformed
    }

    fn attach(&mut self, parent_id: &str, child: Value) {
        let Some(parent) = self.pending.as_mut() else {
            warn!(parent_id, "Child line with no buffered parent");
            return;
        };
        let field = child
            .get("id")
            .and_then(Value::as_str)
            .and_then(gid_type)
            .map_or_else(|| "children".to_string(), connection_field);

        match find_node_mut(parent, parent_id) {
            Some(Value::Object(target)) => push_edge(target, &field, child),
            _ => warn!(parent_id, "Child line parent not found in buffered record"),
        }
    }
}

fn push_edge(target: &mut Map<String, Value>, field: &str, child: Value) {
    let connection = target
        .entry(field.to_string())
        .or_insert_with(|| json!({ "edges": [] }));
    if let Some(edges) = connection.get_mut("edges").and_then(Value::as_array_mut) {
        edges.push(json!({ "node": child }));
    }
}

/// Depth-first search for the object whose `id` equals `id`.
fn find_node_mut<'a>(value: &'a mut Value, id: &str) -> Option<&'a mut Value> {
    if value.get("id").and_then(Value::as_str) == Some(id) {
        return Some(value);
    }
    match value {
        Value::Object(map) => map.values_mut().find_map(|v| find_node_mut(v, id)),
        Value::Array(items) => items.iter_mut().find_map(|v| find_node_mut(v, id)),
        _ => None,
    }
}

/// `gid://shopify/ProductVariant/1` -> `ProductVariant`.
pub(crate) fn gid_type(gid: &str) -> Option<&str> {
    let rest = gid.strip_prefix("gid://shopify/")?;
    rest.split('/').next().filter(|s| !s.is_empty())
}

/// Child types whose connection field is not the plain plural.
const CONNECTION_FIELDS: &[(&str, &str)] = &[
    ("ProductVariant", "variants"),
    ("LineItem", "lineItems"),
    ("Metafield", "metafields"),
    ("MediaImage", "media"),
    ("Video", "media"),
    ("ExternalVideo", "media"),
    ("Model3d", "media"),
    ("Image", "images"),
    ("InventoryLevel", "inventoryLevels"),
    ("FulfillmentOrder", "fulfillmentOrders"),
    ("Product", "products"),
];

/// Connection field a child type lives under on its parent.
pub(crate) fn connection_field(type_name: &str) -> String {
    CONNECTION_FIELDS
        .iter()
        .find(|(child, _)| *child == type_name)
        .map_or_else(
            || {
                let mut chars = type_name.chars();
                chars.next().map_or_else(String::new, |first| {
                    format!("{}{}s", first.to_ascii_lowercase(), chars.as_str())
                })
            },
            |(_, field)| (*field).to_string(),
        )
}

/// Whether `field` is one of the known connection fields.
pub(crate) fn is_connection_field(field: &str) -> bool {
    CONNECTION_FIELDS.iter().any(|(_, known)| *known == field)
}

/// Wrap nodes in the `{ edges: [{ node }] }` shape of a connection.
pub(crate) fn into_connection(nodes: Vec<Value>) -> Value {
    let edges: Vec<Value> = nodes.into_iter().map(|node| json!({ "node": node })).collect();
    json!({ "edges": edges })
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => s.get(..idx).unwrap_or(s),
        None => s,
    }
}

/// Turn a stream of JSONL bytes into assembled records.
pub fn records(mut bytes: ByteStream) -> RecordStream {
    let stream = async_stream::stream! {
        let mut splitter = LineSplitter::default();
        let mut assembler = JsonlAssembler::default();

        while let Some(chunk) = bytes.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    yield Err(e);
                    return;
                }
            };
            for line in splitter.push(&chunk) {
                if let Some(record) = assembler.push_line(&line) {
                    yield Ok(record);
                }
            }
        }

        if let Some(line) = splitter.finish()
            && let Some(record) = assembler.push_line(&line)
        {
            yield Ok(record);
        }
        if let Some(record) = assembler.finish() {
            yield Ok(record);
        }
    };
    stream.boxed()
}

/// Convenience for tests and small payloads.
pub fn records_from_str(body: &str) -> RecordStream {
    let chunk: Result<Vec<u8>, ShopifyError> = Ok(body.as_bytes().to_vec());
    records(futures::stream::iter(vec![chunk]).boxed())
}
