use crate::models::OrderHandle;
use serde_json::{Map, Value};
use std::collections::BTreeSet;

/// Recognized placement response layouts
#[derive(Debug, PartialEq)]
enum ResponseShape<'a> {
    /// Raw OKX envelope `{code, msg, data: [...]}`
    Envelope(&'a [Value]),
    /// Unified wrapper `{id, info: {...}}`
    Unified {
        id: Option<&'a str>,
        info: Option<&'a Value>,
    },
    /// Bare `data` list
    Rows(&'a [Value]),
    /// A single data row
    Row(&'a Map<String, Value>),
    Unknown,
}

fn classify(raw: &Value) -> ResponseShape<'_> {
    match raw {
        Value::Array(rows) => ResponseShape::Rows(rows),
        Value::Object(map) => {
            if let (Some(_), Some(Value::Array(rows))) = (map.get("code"), map.get("data")) {
                return ResponseShape::Envelope(rows);
            }
            if map.contains_key("info") || map.get("id").is_some_and(Value::is_string) {
                return ResponseShape::Unified {
                    id: map.get("id").and_then(Value::as_str),
                    info: map.get("info"),
                };
            }
            if map.contains_key("ordId") || map.contains_key("algoId") {
                return ResponseShape::Row(map);
            }
            ResponseShape::Unknown
        }
        _ => ResponseShape::Unknown,
    }
}

fn row_handles(row: &Map<String, Value>, out: &mut Vec<OrderHandle>) {
    for (key, is_algo) in [("ordId", false), ("algoId", true)] {
        if let Some(id) = row.get(key).and_then(Value::as_str).filter(|id| !id.is_empty()) {
            out.push(OrderHandle {
                order_id: id.to_string(),
                is_algo,
            });
        }
    }
}

fn collect(raw: &Value, out: &mut Vec<OrderHandle>) {
    match classify(raw) {
        ResponseShape::Envelope(rows) | ResponseShape::Rows(rows) => {
            for row in rows.iter().filter_map(Value::as_object) {
                row_handles(row, out);
            }
        }
        ResponseShape::Row(row) => row_handles(row, out),
        ResponseShape::Unified { id, info } => {
            if let Some(id) = id.filter(|id| !id.is_empty()) {
                out.push(OrderHandle {
                    order_id: id.to_string(),
                    is_algo: false,
                });
            }
            if let Some(info) = info {
                collect(info, out);
            }
        }
        ResponseShape::Unknown => {}
    }
}

/// Order handles found in a placement response, first occurrence of each id wins
pub fn extract_order_handles(raw: &Value) -> Vec<OrderHandle> {
    let mut handles = Vec::new();
    collect(raw, &mut handles);

    let mut seen = BTreeSet::new();
    handles.retain(|handle| seen.insert(handle.order_id.clone()));
    handles
}

/// Every `ordId` / `algoId` / `id` in a placement response, deduplicated.
/// Unrecognized payloads yield an empty set.
pub fn extract_order_ids(raw: &Value) -> BTreeSet<String> {
    let mut handles = Vec::new();
    collect(raw, &mut handles);
    handles.into_iter().map(|handle| handle.order_id).collect()
}
