//! bioetl-qc — The gate between transformed rows and the writer.
//!
//! - [`schema`]: declarative schema, pure `validate_schema`
//! - [`metrics`]: row/fallback/duplicate/missing/referential/distribution metrics
//! - [`thresholds`]: severity-driven enforcement and the quality report
//! - [`golden`]: artifact parity against a stored golden run

pub mod error;
pub mod golden;
pub mod metrics;
pub mod schema;
pub mod thresholds;

pub use error::{QcError, Result};
pub use golden::{compare_golden, GoldenDiff, DEFAULT_MASKED_META_FIELDS};
pub use metrics::{compute_metrics, MetricPlan, QcMetric, ReferenceCheck, SiblingKeys};
pub use schema::{check_order, validate_schema, FieldSpec, Schema, SchemaErrors, ValidatedRows, Violation};
pub use thresholds::{enforce_thresholds, Breach, QcPlan, QcSummary, Severity, ThresholdRule, ThresholdViolation};
