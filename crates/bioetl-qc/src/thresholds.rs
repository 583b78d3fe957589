//! Threshold enforcement and the quality report.

use std::fmt;

use bioetl_determinism::Table;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::metrics::{MetricPlan, QcMetric};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Info     => "info",
            Severity::Warning  => "warning",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Acceptable range for a metric. The declared severity decides what a
/// breach does.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThresholdRule {
    pub metric: String,

    /// Restrict to one column; `None` matches every column of the metric
    #[serde(default)]
    pub column: Option<String>,

    #[serde(default)]
    pub min: Option<f64>,

    #[serde(default)]
    pub max: Option<f64>,

    #[serde(default = "default_severity")]
    pub severity: Severity,
}

fn default_severity() -> Severity { Severity::Warning }

impl ThresholdRule {
    fn matches(&self, m: &QcMetric) -> bool {
        m.name == self.metric && (self.column.is_none() || self.column == m.column)
    }

    fn admits(&self, value: f64) -> bool {
        self.min.map_or(true, |lo| value >= lo) && self.max.map_or(true, |hi| value <= hi)
    }
}

/// Metrics plus thresholds for one entity.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QcPlan {
    #[serde(default)]
    pub metrics: MetricPlan,

    #[serde(default)]
    pub thresholds: Vec<ThresholdRule>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Breach {
    pub metric: String,
    pub column: Option<String>,
    pub value: f64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub severity: Severity,
}

impl fmt::Display for Breach {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.metric)?;
        if let Some(c) = &self.column {
            write!(f, "[{c}]")?;
        }
        write!(f, "={} outside [{}, {}]", self.value, bound(self.min), bound(self.max))
    }
}

fn bound(b: Option<f64>) -> String {
    b.map(|v| v.to_string()).unwrap_or_else(|| "-".to_string())
}

/// Annotated metrics and every breach, whatever its severity.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QcSummary {
    pub metrics: Vec<QcMetric>,
    pub breaches: Vec<Breach>,
}

impl QcSummary {
    pub fn worst_severity(&self) -> Option<Severity> {
        self.breaches.iter().map(|b| b.severity).max()
    }

    pub fn metric(&self, name: &str) -> Option<&QcMetric> {
        self.metrics.iter().find(|m| m.name == name)
    }

    /// Compact form stored in the meta document.
    pub fn to_json(&self) -> serde_json::Value {
        let status = match self.worst_severity() {
            None | Some(Severity::Info) => "pass",
            Some(Severity::Warning) => "warning",
            Some(Severity::Critical) => "fail",
        };
        let summary: serde_json::Map<String, serde_json::Value> = self
            .metrics
            .iter()
            .filter(|m| m.section == "summary" || m.section == "duplicates")
            .map(|m| (m.name.clone(), serde_json::json!(m.value)))
            .collect();
        serde_json::json!({
            "status": status,
            "metrics": summary,
            "breaches": self.breaches.iter().map(|b| serde_json::json!({
                "metric": b.metric,
                "column": b.column,
                "value": b.value,
                "severity": b.severity,
            })).collect::<Vec<_>>(),
        })
    }

    /// `section, metric, column, value, count, ratio, lower_bound, upper_bound`
    pub fn report_table(&self) -> Table {
        let mut t = Table::new([
            "section", "metric", "column", "value", "count", "ratio", "lower_bound", "upper_bound",
        ]);
        for m in &self.metrics {
            t.push(vec![
                m.section.clone(),
                m.name.clone(),
                m.column.clone().unwrap_or_default(),
                fmt_num(m.value),
                m.count.map(|c| c.to_string()).unwrap_or_default(),
                m.ratio.map(fmt_num).unwrap_or_default(),
                m.lower_bound.map(fmt_num).unwrap_or_default(),
                m.upper_bound.map(fmt_num).unwrap_or_default(),
            ]);
        }
        t
    }
}

fn fmt_num(v: f64) -> String {
    format!("{v:.6}")
}

#[derive(Debug, Clone, Error)]
#[error("{} critical QC threshold(s) breached: {}", .critical.len(), describe(.critical))]
pub struct ThresholdViolation {
    pub critical: Vec<Breach>,
    pub summary: QcSummary,
}

fn describe(breaches: &[Breach]) -> String {
    breaches.iter().map(|b| b.to_string()).collect::<Vec<_>>().join("; ")
}

/// Check `metrics` against `rules`.
///
/// Critical breaches fail; warnings are logged; info breaches are only
/// recorded. Matched metrics are annotated with bounds and severity.
pub fn enforce_thresholds(metrics: Vec<QcMetric>, rules: &[ThresholdRule]) -> Result<QcSummary, ThresholdViolation> {
    let mut metrics = metrics;
    let mut breaches = Vec::new();

    for rule in rules {
        let mut matched = false;
        for m in metrics.iter_mut().filter(|m| rule.matches(m)) {
            matched = true;
            m.lower_bound = rule.min;
            m.upper_bound = rule.max;
            m.severity = Some(rule.severity);
            if rule.admits(m.value) {
                continue;
            }
            let breach = Breach {
                metric: m.name.clone(),
                column: m.column.clone(),
                value: m.value,
                min: rule.min,
                max: rule.max,
                severity: rule.severity,
            };
            match rule.severity {
                Severity::Critical => {}
                Severity::Warning => warn!(breach = %breach, "QC threshold breached"),
                Severity::Info => info!(breach = %breach, "QC threshold breached (info)"),
            }
            breaches.push(breach);
        }
        if !matched {
            warn!(metric = %rule.metric, column = ?rule.column, "Threshold refers to a metric that was not computed");
        }
    }

    let critical: Vec<Breach> = breaches
        .iter()
        .filter(|b| b.severity == Severity::Critical)
        .cloned()
        .collect();
    let summary = QcSummary { metrics, breaches };

    if critical.is_empty() {
        Ok(summary)
    } else {
        Err(ThresholdViolation { critical, summary })
    }
}
