//! Quality metrics over a dataset.

use std::collections::{BTreeMap, BTreeSet, HashMap};

use bioetl_common::Record;
use bioetl_determinism::render;
use serde::{Deserialize, Serialize};

use crate::thresholds::Severity;

/// Key sets of already-loaded sibling entities, by entity name.
pub type SiblingKeys = BTreeMap<String, BTreeSet<String>>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QcMetric {
    pub section: String,
    pub name: String,
    pub column: Option<String>,
    pub value: f64,
    pub count: Option<u64>,
    pub ratio: Option<f64>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub severity: Option<Severity>,
}

impl QcMetric {
    fn new(section: &str, name: &str, column: Option<&str>, value: f64) -> Self {
        Self {
            section: section.to_string(),
            name: name.to_string(),
            column: column.map(str::to_string),
            value,
            count: None,
            ratio: None,
            lower_bound: None,
            upper_bound: None,
            severity: None,
        }
    }

    fn counted(mut self, count: usize, total: usize) -> Self {
        self.count = Some(count as u64);
        self.ratio = Some(ratio(count, total));
        self
    }
}

/// A foreign-key style check against a sibling entity's keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReferenceCheck {
    pub column: String,
    pub sibling: String,
}

/// Which metrics to compute beyond the always-on summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricPlan {
    /// Duplicate detection key; empty disables the duplicate section
    #[serde(default)]
    pub business_key: Vec<String>,

    /// Columns for missing ratios; empty means every data column
    #[serde(default)]
    pub missing_columns: Vec<String>,

    #[serde(default)]
    pub numeric_columns: Vec<String>,

    #[serde(default)]
    pub categorical_columns: Vec<String>,

    #[serde(default)]
    pub references: Vec<ReferenceCheck>,
}

fn ratio(count: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        count as f64 / total as f64
    }
}

/// Compute every planned metric, in a fixed order. Key comparisons use values
/// rendered at `float_precision`.
pub fn compute_metrics(
    rows: &[Record],
    plan: &MetricPlan,
    siblings: &SiblingKeys,
    float_precision: usize,
) -> Vec<QcMetric> {
    let n = rows.len();
    let mut out = Vec::new();

    out.push(QcMetric::new("summary", "row_count", None, n as f64).counted(n, n));
    let fallbacks = rows.iter().filter(|r| r.is_fallback()).count();
    out.push(QcMetric::new("summary", "fallback_count", None, fallbacks as f64).counted(fallbacks, n));
    out.push(QcMetric::new("summary", "fallback_ratio", None, ratio(fallbacks, n)).counted(fallbacks, n));

    if !plan.business_key.is_empty() {
        let dups = duplicate_count(rows, &plan.business_key, float_precision);
        out.push(QcMetric::new("duplicates", "duplicate_count", None, dups as f64).counted(dups, n));
        out.push(QcMetric::new("duplicates", "duplicate_ratio", None, ratio(dups, n)).counted(dups, n));
    }

    let missing_columns: Vec<String> = if plan.missing_columns.is_empty() {
        rows.iter()
            .flat_map(|r| r.fields().keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    } else {
        plan.missing_columns.clone()
    };
    for column in &missing_columns {
        let missing = rows.iter().filter(|r| r.value(column).is_null()).count();
        out.push(QcMetric::new("missing", "missing_ratio", Some(column.as_str()), ratio(missing, n)).counted(missing, n));
    }

    for check in &plan.references {
        let empty = BTreeSet::new();
        let keys = siblings.get(&check.sibling).unwrap_or(&empty);
        let violations = rows
            .iter()
            .map(|r| r.value(&check.column))
            .filter(|v| !v.is_null() && !keys.contains(&render(v, float_precision)))
            .count();
        let mut m = QcMetric::new("referential", "referential_violations", Some(check.column.as_str()), violations as f64)
            .counted(violations, n);
        m.section = format!("referential:{}", check.sibling);
        out.push(m);
    }

    for column in &plan.numeric_columns {
        let values: Vec<f64> = rows.iter().filter_map(|r| r.value(column).as_f64()).collect();
        if values.is_empty() {
            continue;
        }
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len() as f64;
        for (name, v) in [("min", min), ("max", max), ("mean", mean)] {
            out.push(QcMetric::new("distribution", name, Some(column.as_str()), v).counted(values.len(), n));
        }
    }

    for column in &plan.categorical_columns {
        let distinct: BTreeSet<String> = rows
            .iter()
            .map(|r| r.value(column))
            .filter(|v| !v.is_null())
            .map(|v| render(&v, float_precision))
            .collect();
        out.push(QcMetric::new("distribution", "distinct_count", Some(column.as_str()), distinct.len() as f64).counted(distinct.len(), n));
    }

    out
}

/// Rows beyond the first per business key: a key shared by N rows adds N-1.
fn duplicate_count(rows: &[Record], key: &[String], float_precision: usize) -> usize {
    let mut groups: HashMap<Vec<String>, usize> = HashMap::new();
    for r in rows {
        let k: Vec<String> = key.iter().map(|c| render(&r.value(c), float_precision)).collect();
        *groups.entry(k).or_insert(0) += 1;
    }
    groups.values().map(|n| n - 1).sum()
}
