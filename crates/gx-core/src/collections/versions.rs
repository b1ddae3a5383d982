//! Versions-list payload parsing.
//!
//! v3 servers return `{"data": […], "meta": {"count": N}}`; v2 servers
//! return `{"results": […], "count": N}`.

use serde_json::Value;

use crate::errors::{Error, Result};

/// Extracts the version list and total count from a versions payload.
pub fn parse_versions_payload(payload: &Value) -> Result<(Vec<String>, u64)> {
    if payload.is_null() {
        return Err(Error::VersionsPayloadEmpty);
    }

    if let Some(data) = payload.get("data").and_then(Value::as_array) {
        let versions = extract_versions(data);
        let total = payload
            .get("meta")
            .and_then(|meta| meta.get("count"))
            .map(parse_count)
            .unwrap_or(0);
        return Ok((versions, total));
    }

    if let Some(results) = payload.get("results").and_then(Value::as_array) {
        let versions = extract_versions(results);
        let total = payload.get("count").map(parse_count).unwrap_or(0);
        return Ok((versions, total));
    }

    Err(Error::VersionsPayloadUnsupported)
}

fn extract_versions(items: &[Value]) -> Vec<String> {
    items
        .iter()
        .filter_map(|item| item.get("version").and_then(Value::as_str))
        .filter(|version| !version.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_count(value: &Value) -> u64 {
    match value {
        Value::Number(n) => n.as_u64().unwrap_or_else(|| n.as_f64().unwrap_or(0.0) as u64),
        _ => 0,
    }
}
