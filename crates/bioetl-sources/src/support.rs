//! Helpers shared by the adapters.

use anyhow::{anyhow, Context};
use bioetl_common::{Record, Value};
use bioetl_http::{FallbackRecord, ResilientClient};
use bioetl_pipeline::RunContext;

/// Column holding the raw upstream payload between Extract and Transform.
pub const PAYLOAD: &str = "payload";

/// Bind the run's release to the client so cache keys carry it.
pub fn bind_release(client: &ResilientClient, ctx: &RunContext) -> anyhow::Result<()> {
    let release = ctx
        .source_release()
        .ok_or_else(|| anyhow!("source release has not been captured for this run"))?;
    client.bind_release(release).context("binding source release")?;
    Ok(())
}

/// Numeric identifiers stay numeric; anything else is kept as text.
pub fn key_value(id: &str) -> Value {
    let id = id.trim();
    id.parse::<i64>().map(Value::Int).unwrap_or_else(|_| Value::Str(id.to_string()))
}

/// One raw row: the key column plus the untouched payload.
pub fn raw_record(source: &str, key_column: &str, id: &str, payload: serde_json::Value) -> Record {
    Record::new(source)
        .with(key_column, key_value(id))
        .with(PAYLOAD, Value::Json(payload))
}

/// A placeholder row per identifier, all sharing one failure.
pub fn fallback_rows(fallback: &FallbackRecord, source: &str, key_column: &str, ids: &[String]) -> Vec<Record> {
    ids.iter()
        .map(|id| fallback.record_for(source, [(key_column.to_string(), key_value(id))]))
        .collect()
}

/// Take the payload out of a raw row. Fallback rows have none.
pub fn take_payload(record: &mut Record) -> Option<serde_json::Value> {
    match record.remove(PAYLOAD) {
        Some(Value::Json(json)) => Some(json),
        _ => None,
    }
}

pub fn text(json: &serde_json::Value, pointer: &str) -> Value {
    match json.pointer(pointer) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Value::Str(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Value::Str(n.to_string()),
        _ => Value::Null,
    }
}

/// Numbers, or numeric strings as ChEMBL sends them.
pub fn number(json: &serde_json::Value, pointer: &str) -> Value {
    match json.pointer(pointer) {
        Some(serde_json::Value::Number(n)) => n.as_f64().map(Value::Float).unwrap_or(Value::Null),
        Some(serde_json::Value::String(s)) => s.trim().parse::<f64>().map(Value::Float).unwrap_or(Value::Null),
        _ => Value::Null,
    }
}

pub fn upper(value: Value) -> Value {
    match value {
        Value::Str(s) => Value::Str(s.to_ascii_uppercase()),
        other => other,
    }
}

pub fn lower(value: Value) -> Value {
    match value {
        Value::Str(s) => Value::Str(s.to_ascii_lowercase()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_key_value_keeps_numeric_ids_numeric() {
        assert_eq!(key_value(" 42 "), Value::Int(42));
        assert_eq!(key_value("10.1000/xyz"), Value::Str("10.1000/xyz".into()));
    }

    #[test]
    fn test_number_accepts_numeric_strings() {
        let j = json!({"a": "12.5", "b": 3, "c": "n/a"});
        assert_eq!(number(&j, "/a"), Value::Float(12.5));
        assert_eq!(number(&j, "/b"), Value::Float(3.0));
        assert_eq!(number(&j, "/c"), Value::Null);
        assert_eq!(number(&j, "/missing"), Value::Null);
    }

    #[test]
    fn test_text_blank_is_null() {
        let j = json!({"a": "  ", "b": " x "});
        assert_eq!(text(&j, "/a"), Value::Null);
        assert_eq!(text(&j, "/b"), Value::Str("x".into()));
    }
}
