//! Canonical value rendering.
//!
//! Everything that ends up in a CSV cell or a hash goes through [`render`],
//! so the written bytes and the hashes can never disagree.

use std::collections::HashMap;

use bioetl_common::{canonical_json, Record, Value};
use chrono::SecondsFormat;

use crate::config::{CaseRule, DeterminismConfig};

/// Canonical string for one cell.
pub fn render(value: &Value, float_precision: usize) -> String {
    match value {
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Int(i) => i.to_string(),
        Value::Float(f) => render_float(*f, float_precision),
        Value::Str(s) => s.trim().to_string(),
        Value::DateTime(dt) => dt.to_rfc3339_opts(SecondsFormat::AutoSi, true),
        Value::Json(j) => canonical_json(j),
    }
}

fn render_float(f: f64, precision: usize) -> String {
    if f.is_nan() {
        return String::new();
    }
    if f.is_infinite() {
        return if f > 0.0 { "inf".to_string() } else { "-inf".to_string() };
    }
    let s = format!("{f:.precision$}");
    // -0 and negatives that round to zero lose their sign.
    match s.strip_prefix('-') {
        Some(rest) if rest.bytes().all(|b| b == b'0' || b == b'.') => rest.to_string(),
        _ => s,
    }
}

/// Applies the configured normalization to whole records in place.
#[derive(Debug, Clone)]
pub struct Canonicalizer {
    identifier_case: HashMap<String, CaseRule>,
    float_precision: usize,
}

impl Canonicalizer {
    pub fn new(config: &DeterminismConfig) -> Self {
        Self {
            identifier_case: config
                .identifier_columns
                .iter()
                .map(|c| (c.name.clone(), c.case))
                .collect(),
            float_precision: config.float_precision,
        }
    }

    pub fn float_precision(&self) -> usize {
        self.float_precision
    }

    /// Trim strings, case-normalize identifier columns, turn NaN into null.
    pub fn canonicalize(&self, record: &mut Record) {
        for (column, value) in record.fields_mut().iter_mut() {
            match value {
                Value::Str(s) => {
                    let trimmed = s.trim();
                    let normalized = match self.identifier_case.get(column) {
                        Some(CaseRule::Lower) => trimmed.to_lowercase(),
                        Some(CaseRule::Upper) => trimmed.to_uppercase(),
                        None => trimmed.to_string(),
                    };
                    *value = if normalized.is_empty() { Value::Null } else { Value::Str(normalized) };
                }
                Value::Float(f) if f.is_nan() => *value = Value::Null,
                _ => {}
            }
        }
    }

    pub fn canonicalize_all(&self, records: &mut [Record]) {
        for r in records.iter_mut() {
            self.canonicalize(r);
        }
    }

    pub fn render(&self, value: &Value) -> String {
        render(value, self.float_precision)
    }
}
