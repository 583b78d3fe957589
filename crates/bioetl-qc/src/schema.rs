//! Declarative schema and its validator.
//!
//! A [`Schema`] is plain data (loaded from YAML); [`validate_schema`] is a
//! pure function from rows to either [`ValidatedRows`] or a full list of
//! violations. Only the writer accepts `ValidatedRows`.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use bioetl_common::{Record, Value, ValueKind, META_COLUMNS};
use bioetl_determinism::render;
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::{QcError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldSpec {
    pub name: String,
    pub dtype: ValueKind,

    #[serde(default = "default_true")]
    pub nullable: bool,

    /// Regex the rendered string value must match in full
    #[serde(default)]
    pub pattern: Option<String>,

    #[serde(default)]
    pub allowed: Option<Vec<String>>,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    #[serde(default)]
    pub unique: bool,
}

fn default_true() -> bool { true }

impl FieldSpec {
    pub fn new(name: impl Into<String>, dtype: ValueKind) -> Self {
        Self {
            name: name.into(),
            dtype,
            nullable: true,
            pattern: None,
            allowed: None,
            min: None,
            max: None,
            unique: false,
        }
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub fn pattern(mut self, pattern: &str) -> Self {
        self.pattern = Some(pattern.to_string());
        self
    }

    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min = min;
        self.max = max;
        self
    }

    pub fn allowed(mut self, values: &[&str]) -> Self {
        self.allowed = Some(values.iter().map(|v| v.to_string()).collect());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,

    #[serde(default = "default_version")]
    pub version: String,

    pub fields: Vec<FieldSpec>,

    /// Reject undeclared data columns (record metadata columns exempt)
    #[serde(default = "default_true")]
    pub strict: bool,

    /// Convert string payloads to the declared type
    #[serde(default = "default_true")]
    pub coerce: bool,
}

fn default_version() -> String { "1.0.0".to_string() }

impl Schema {
    pub fn new(name: impl Into<String>, fields: Vec<FieldSpec>) -> Self {
        Self {
            name: name.into(),
            version: default_version(),
            fields,
            strict: true,
            coerce: true,
        }
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Config-time checks: patterns compile, names unique, bounds ordered.
    pub fn validate(&self) -> Result<()> {
        let mut seen = std::collections::BTreeSet::new();
        for f in &self.fields {
            if !seen.insert(f.name.as_str()) {
                return Err(QcError::Config(format!("schema {} declares {} twice", self.name, f.name)));
            }
            if let Some(p) = &f.pattern {
                Regex::new(p).map_err(|e| QcError::Config(format!("field {}: bad pattern: {e}", f.name)))?;
            }
            if let (Some(lo), Some(hi)) = (f.min, f.max) {
                if lo > hi {
                    return Err(QcError::Config(format!("field {}: min {lo} > max {hi}", f.name)));
                }
            }
        }
        Ok(())
    }
}

// ── Results ───────────────────────────────────────────────────────────────────

/// Rows that passed validation (or were accepted in fail-open mode).
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedRows {
    rows: Vec<Record>,
    schema_valid: bool,
}

impl ValidatedRows {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn as_slice(&self) -> &[Record] {
        &self.rows
    }

    pub fn schema_valid(&self) -> bool {
        self.schema_valid
    }

    pub fn into_inner(self) -> Vec<Record> {
        self.rows
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Violation {
    /// `None` for schema-level problems
    pub row_index: Option<usize>,
    pub column: String,
    pub rule: String,
    pub value: String,
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.row_index {
            Some(i) => write!(f, "row {i}, column {}: {} ({:?})", self.column, self.message, self.value),
            None => write!(f, "column {}: {}", self.column, self.message),
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("schema {schema} failed with {} violation(s): {}", .violations.len(), summary(.by_column))]
pub struct SchemaErrors {
    pub schema: String,
    pub violations: Vec<Violation>,
    pub by_column: BTreeMap<String, usize>,
    pub by_rule: BTreeMap<String, usize>,
    rows: Vec<Record>,
}

fn summary(by_column: &BTreeMap<String, usize>) -> String {
    by_column
        .iter()
        .map(|(c, n)| format!("{c}={n}"))
        .collect::<Vec<_>>()
        .join(", ")
}

impl SchemaErrors {
    /// Keep the (coerced) rows despite the violations. Fail-open only.
    pub fn accept(self) -> ValidatedRows {
        ValidatedRows { rows: self.rows, schema_valid: false }
    }

    pub fn count(&self) -> usize {
        self.violations.len()
    }
}

// ── Validation ────────────────────────────────────────────────────────────────

/// Validate (and, if enabled, coerce) `rows` against `schema`.
///
/// Pattern, allowed-set and uniqueness checks compare values rendered at
/// `float_precision`, the precision the writer uses.
pub fn validate_schema(
    schema: &Schema,
    rows: Vec<Record>,
    float_precision: usize,
) -> std::result::Result<ValidatedRows, SchemaErrors> {
    let mut violations = Vec::new();
    let mut rows = rows;

    let patterns: HashMap<&str, Regex> = schema
        .fields
        .iter()
        .filter_map(|f| {
            let p = f.pattern.as_ref()?;
            match Regex::new(&format!("^(?:{p})$")) {
                Ok(re) => Some((f.name.as_str(), re)),
                Err(e) => {
                    violations.push(Violation {
                        row_index: None,
                        column: f.name.clone(),
                        rule: "pattern".into(),
                        value: p.clone(),
                        message: format!("invalid pattern: {e}"),
                    });
                    None
                }
            }
        })
        .collect();

    let mut seen: HashMap<&str, HashMap<String, usize>> = HashMap::new();

    for (idx, row) in rows.iter_mut().enumerate() {
        let exempt_nulls = row.is_fallback();

        if schema.strict {
            for column in row.fields().keys() {
                if schema.field(column).is_none() && !META_COLUMNS.contains(&column.as_str()) {
                    violations.push(violation(float_precision, idx, column, "strict", &Value::Null, "undeclared column"));
                }
            }
        }

        for spec in &schema.fields {
            let mut value = row.get(&spec.name).cloned().unwrap_or(Value::Null);

            if value.is_null() {
                if !spec.nullable && !exempt_nulls {
                    violations.push(violation(float_precision, idx, &spec.name, "nullable", &value, "required value missing"));
                }
                continue;
            }

            if value.kind() != Some(spec.dtype) && !(spec.dtype == ValueKind::Float && value.kind() == Some(ValueKind::Int)) {
                if !schema.coerce {
                    let msg = format!("expected {}", spec.dtype);
                    violations.push(violation(float_precision, idx, &spec.name, "dtype", &value, &msg));
                    continue;
                }
                match value.coerce(spec.dtype) {
                    Ok(v) => {
                        row.set(spec.name.clone(), v.clone());
                        value = v;
                    }
                    Err(e) => {
                        violations.push(violation(float_precision, idx, &spec.name, "dtype", &value, &e.to_string()));
                        continue;
                    }
                }
            }

            let rendered = render(&value, float_precision);

            if let Some(re) = patterns.get(spec.name.as_str()) {
                if !re.is_match(&rendered) {
                    violations.push(violation(float_precision, idx, &spec.name, "pattern", &value, "does not match pattern"));
                }
            }

            if let Some(allowed) = &spec.allowed {
                if !allowed.iter().any(|a| *a == rendered) {
                    violations.push(violation(float_precision, idx, &spec.name, "allowed", &value, "value not in allowed set"));
                }
            }

            if let Some(x) = value.as_f64() {
                if spec.min.is_some_and(|lo| x < lo) {
                    violations.push(violation(float_precision, idx, &spec.name, "min", &value, "below minimum"));
                }
                if spec.max.is_some_and(|hi| x > hi) {
                    violations.push(violation(float_precision, idx, &spec.name, "max", &value, "above maximum"));
                }
            }

            if spec.unique {
                let first = seen.entry(spec.name.as_str()).or_default().entry(rendered).or_insert(idx);
                if *first != idx {
                    let msg = format!("duplicate of row {first}");
                    violations.push(violation(float_precision, idx, &spec.name, "unique", &value, &msg));
                }
            }
        }
    }

    if violations.is_empty() {
        return Ok(ValidatedRows { rows, schema_valid: true });
    }

    let mut by_column = BTreeMap::new();
    let mut by_rule = BTreeMap::new();
    for v in &violations {
        *by_column.entry(v.column.clone()).or_insert(0) += 1;
        *by_rule.entry(v.rule.clone()).or_insert(0) += 1;
    }

    Err(SchemaErrors {
        schema: schema.name.clone(),
        violations,
        by_column,
        by_rule,
        rows,
    })
}

fn violation(float_precision: usize, idx: usize, column: &str, rule: &str, value: &Value, message: &str) -> Violation {
    Violation {
        row_index: Some(idx),
        column: column.to_string(),
        rule: rule.to_string(),
        value: render(value, float_precision),
        message: message.to_string(),
    }
}

/// Schema fields must appear in `column_order`, in the same relative order.
pub fn check_order(schema: &Schema, column_order: &[String]) -> Result<()> {
    let mut last = None;
    for f in &schema.fields {
        let pos = column_order
            .iter()
            .position(|c| *c == f.name)
            .ok_or_else(|| QcError::Config(format!("schema field {} missing from column_order", f.name)))?;
        if last.is_some_and(|prev| pos < prev) {
            return Err(QcError::Config(format!(
                "schema field {} is out of order relative to column_order",
                f.name
            )));
        }
        last = Some(pos);
    }
    Ok(())
}
