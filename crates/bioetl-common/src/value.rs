//! Cell values carried by records between stages.
//!
//! Values stay typed until the determinism engine renders them; the QC gate
//! coerces string payloads into the types a schema declares.

use std::fmt;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{BioetlError, Result};

/// A single cell.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    DateTime(DateTime<Utc>),
    /// Nested object or array, rendered as sorted-key JSON.
    Json(serde_json::Value),
}

/// Declared type of a column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueKind {
    String,
    Int,
    Float,
    Bool,
    Datetime,
    Json,
}

impl ValueKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ValueKind::String   => "string",
            ValueKind::Int      => "int",
            ValueKind::Float    => "float",
            ValueKind::Bool     => "bool",
            ValueKind::Datetime => "datetime",
            ValueKind::Json     => "json",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Value {
    /// Missing/NA check. Blank strings and NaN count as missing.
    pub fn is_null(&self) -> bool {
        match self {
            Value::Null => true,
            Value::Str(s) => s.trim().is_empty(),
            Value::Float(f) => f.is_nan(),
            Value::Json(j) => j.is_null(),
            _ => false,
        }
    }

    pub fn kind(&self) -> Option<ValueKind> {
        match self {
            Value::Null        => None,
            Value::Bool(_)     => Some(ValueKind::Bool),
            Value::Int(_)      => Some(ValueKind::Int),
            Value::Float(_)    => Some(ValueKind::Float),
            Value::Str(_)      => Some(ValueKind::String),
            Value::DateTime(_) => Some(ValueKind::Datetime),
            Value::Json(_)     => Some(ValueKind::Json),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Numeric view used by sorting and distribution metrics.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(i) => Some(*i as f64),
            Value::Float(f) if !f.is_nan() => Some(*f),
            _ => None,
        }
    }

    /// Build a value from a decoded JSON payload field.
    pub fn from_json(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    Value::Int(i)
                } else {
                    n.as_f64().map(Value::Float).unwrap_or(Value::Null)
                }
            }
            serde_json::Value::String(s) => Value::Str(s),
            other => Value::Json(other),
        }
    }

    /// Convert to the declared kind, parsing strings where needed.
    ///
    /// Nulls pass through untouched; nullability is the caller's concern.
    pub fn coerce(&self, kind: ValueKind) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let fail = || BioetlError::Coercion {
            value: self.render_debug(),
            kind,
        };
        let coerced = match (kind, self) {
            (ValueKind::String, Value::Str(_)) => self.clone(),
            (ValueKind::String, Value::Int(i)) => Value::Str(i.to_string()),
            (ValueKind::String, Value::Bool(b)) => Value::Str(b.to_string()),
            (ValueKind::String, Value::Float(f)) => Value::Str(f.to_string()),

            (ValueKind::Int, Value::Int(_)) => self.clone(),
            (ValueKind::Int, Value::Float(f)) if f.fract() == 0.0 && f.is_finite() => Value::Int(*f as i64),
            (ValueKind::Int, Value::Str(s)) => Value::Int(s.trim().parse().map_err(|_| fail())?),

            (ValueKind::Float, Value::Float(_)) => self.clone(),
            (ValueKind::Float, Value::Int(i)) => Value::Float(*i as f64),
            (ValueKind::Float, Value::Str(s)) => Value::Float(s.trim().parse().map_err(|_| fail())?),

            (ValueKind::Bool, Value::Bool(_)) => self.clone(),
            (ValueKind::Bool, Value::Int(0)) => Value::Bool(false),
            (ValueKind::Bool, Value::Int(1)) => Value::Bool(true),
            (ValueKind::Bool, Value::Str(s)) => match s.trim().to_ascii_lowercase().as_str() {
                "true" | "t" | "yes" | "1" => Value::Bool(true),
                "false" | "f" | "no" | "0" => Value::Bool(false),
                _ => return Err(fail()),
            },

            (ValueKind::Datetime, Value::DateTime(_)) => self.clone(),
            (ValueKind::Datetime, Value::Str(s)) => Value::DateTime(parse_datetime(s.trim()).ok_or_else(fail)?),

            (ValueKind::Json, Value::Json(_)) => self.clone(),
            (ValueKind::Json, Value::Str(s)) => {
                Value::Json(serde_json::from_str(s).map_err(|_| fail())?)
            }

            _ => return Err(fail()),
        };
        Ok(coerced)
    }

    fn render_debug(&self) -> String {
        match self {
            Value::Str(s) => s.clone(),
            Value::Json(j) => j.to_string(),
            other => format!("{other:?}"),
        }
    }
}

/// Accepts RFC 3339 timestamps and bare `YYYY-MM-DD` dates (midnight UTC).
fn parse_datetime(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
}

impl From<&str> for Value {
    fn from(s: &str) -> Self { Value::Str(s.to_string()) }
}

impl From<String> for Value {
    fn from(s: String) -> Self { Value::Str(s) }
}

impl From<i64> for Value {
    fn from(i: i64) -> Self { Value::Int(i) }
}

impl From<f64> for Value {
    fn from(f: f64) -> Self { Value::Float(f) }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self { Value::Bool(b) }
}

impl From<DateTime<Utc>> for Value {
    fn from(dt: DateTime<Utc>) -> Self { Value::DateTime(dt) }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(opt: Option<T>) -> Self {
        opt.map(Into::into).unwrap_or(Value::Null)
    }
}
