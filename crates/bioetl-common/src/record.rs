//! Row-level record passed between pipeline stages.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Metadata columns every record exposes, whether or not they are set.
pub const META_COLUMNS: [&str; 5] = [
    "source_system",
    "fallback_reason",
    "fallback_error_type",
    "fallback_http_status",
    "fallback_attempt",
];

/// Structured failure details attached to a placeholder row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackMetadata {
    /// e.g. "max_retries_exceeded", "circuit_open", "not_found"
    pub reason: String,
    /// Error taxonomy name, e.g. "TransientNetworkError"
    pub error_type: String,
    pub http_status: Option<u16>,
    /// Number of attempts made before giving up (0 when short-circuited).
    pub attempt: u32,
    /// Human-readable detail; logged, never written to the dataset.
    #[serde(default)]
    pub message: Option<String>,
}

/// A mapping of column name → value plus provenance.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    fields: BTreeMap<String, Value>,
    source_system: String,
    fallback: Option<FallbackMetadata>,
}

impl Record {
    pub fn new(source_system: impl Into<String>) -> Self {
        Self {
            fields: BTreeMap::new(),
            source_system: source_system.into(),
            fallback: None,
        }
    }

    /// Placeholder row for an identifier whose retrieval failed.
    pub fn fallback(
        source_system: impl Into<String>,
        key_fields: impl IntoIterator<Item = (String, Value)>,
        meta: FallbackMetadata,
    ) -> Self {
        Self {
            fields: key_fields.into_iter().collect(),
            source_system: source_system.into(),
            fallback: Some(meta),
        }
    }

    /// Builder-style setter.
    pub fn with(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(column, value);
        self
    }

    pub fn set(&mut self, column: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(column.into(), value.into());
    }

    pub fn remove(&mut self, column: &str) -> Option<Value> {
        self.fields.remove(column)
    }

    /// Business field lookup. Metadata columns are served by [`Record::value`].
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.fields.get(column)
    }

    pub fn fields(&self) -> &BTreeMap<String, Value> {
        &self.fields
    }

    pub fn fields_mut(&mut self) -> &mut BTreeMap<String, Value> {
        &mut self.fields
    }

    pub fn source_system(&self) -> &str {
        &self.source_system
    }

    pub fn is_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn fallback_metadata(&self) -> Option<&FallbackMetadata> {
        self.fallback.as_ref()
    }

    pub fn set_fallback(&mut self, meta: FallbackMetadata) {
        self.fallback = Some(meta);
    }

    /// Value of any column, business or metadata. Missing columns are `Null`.
    pub fn value(&self, column: &str) -> Value {
        match column {
            "source_system" => Value::Str(self.source_system.clone()),
            "fallback_reason" => self.fallback.as_ref().map(|f| f.reason.clone()).into(),
            "fallback_error_type" => self.fallback.as_ref().map(|f| f.error_type.clone()).into(),
            "fallback_http_status" => self
                .fallback
                .as_ref()
                .and_then(|f| f.http_status)
                .map(i64::from)
                .into(),
            "fallback_attempt" => self.fallback.as_ref().map(|f| i64::from(f.attempt)).into(),
            _ => self.fields.get(column).cloned().unwrap_or(Value::Null),
        }
    }

    /// Every column this record contributes to a dataset: business fields
    /// followed by the metadata columns.
    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.fields
            .keys()
            .map(String::as_str)
            .chain(META_COLUMNS.iter().copied())
    }
}
