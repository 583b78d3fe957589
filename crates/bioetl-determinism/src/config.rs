//! Determinism settings for one entity.

use serde::{Deserialize, Serialize};

use crate::error::{DeterminismError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NullPosition {
    First,
    #[default]
    Last,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CaseRule {
    Lower,
    Upper,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentifierColumn {
    pub name: String,
    pub case: CaseRule,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeterminismConfig {
    /// Columns identifying an entity; hashed into `hash_business_key`
    #[serde(default)]
    pub business_key: Vec<String>,

    /// Sort columns; falls back to `business_key` when empty
    #[serde(default)]
    pub sort_keys: Vec<String>,

    #[serde(default)]
    pub null_position: NullPosition,

    /// Exact output column order, metadata and hash columns included
    #[serde(default)]
    pub column_order: Vec<String>,

    #[serde(default = "default_float_precision")]
    pub float_precision: usize,

    #[serde(default)]
    pub identifier_columns: Vec<IdentifierColumn>,

    /// Excluded from `hash_row`
    #[serde(default = "default_volatile_columns")]
    pub volatile_columns: Vec<String>,

    #[serde(default = "default_row_hash_column")]
    pub row_hash_column: String,

    #[serde(default = "default_business_key_hash_column")]
    pub business_key_hash_column: String,
}

fn default_float_precision() -> usize { 6 }
fn default_volatile_columns() -> Vec<String> {
    vec!["run_id".to_string(), "generated_at".to_string(), "extracted_at".to_string()]
}
fn default_row_hash_column() -> String { "hash_row".to_string() }
fn default_business_key_hash_column() -> String { "hash_business_key".to_string() }

impl Default for DeterminismConfig {
    fn default() -> Self {
        Self {
            business_key: Vec::new(),
            sort_keys: Vec::new(),
            null_position: NullPosition::default(),
            column_order: Vec::new(),
            float_precision: default_float_precision(),
            identifier_columns: Vec::new(),
            volatile_columns: default_volatile_columns(),
            row_hash_column: default_row_hash_column(),
            business_key_hash_column: default_business_key_hash_column(),
        }
    }
}

impl DeterminismConfig {
    pub fn effective_sort_keys(&self) -> &[String] {
        if self.sort_keys.is_empty() {
            &self.business_key
        } else {
            &self.sort_keys
        }
    }

    pub fn hash_columns(&self) -> [&str; 2] {
        [self.row_hash_column.as_str(), self.business_key_hash_column.as_str()]
    }

    pub fn validate(&self) -> Result<()> {
        if self.business_key.is_empty() {
            return Err(DeterminismError::Config("business_key must list at least one column".into()));
        }
        if self.column_order.is_empty() {
            return Err(DeterminismError::Config("column_order must not be empty".into()));
        }
        if self.float_precision > 17 {
            return Err(DeterminismError::Config(format!(
                "float_precision {} exceeds 17 significant decimals",
                self.float_precision
            )));
        }
        let listed = |c: &String| self.column_order.contains(c);
        let unlisted: Vec<String> = self
            .business_key
            .iter()
            .chain(self.sort_keys.iter())
            .filter(|c| !listed(c))
            .cloned()
            .collect();
        if !unlisted.is_empty() {
            return Err(DeterminismError::Config(format!(
                "key columns not in column_order: {unlisted:?}"
            )));
        }
        let mut seen = std::collections::BTreeSet::new();
        if let Some(dup) = self.column_order.iter().find(|c| !seen.insert(c.as_str())) {
            return Err(DeterminismError::Config(format!("column_order lists {dup:?} twice")));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> DeterminismConfig {
        DeterminismConfig {
            business_key: vec!["activity_id".into()],
            column_order: vec!["activity_id".into(), "standard_value".into()],
            ..DeterminismConfig::default()
        }
    }

    #[test]
    fn test_sort_keys_default_to_business_key() {
        let c = cfg();
        assert_eq!(c.effective_sort_keys(), ["activity_id".to_string()]);
        assert!(c.validate().is_ok());
    }

    #[test]
    fn test_sort_key_outside_column_order_rejected() {
        let mut c = cfg();
        c.sort_keys = vec!["assay_id".into()];
        assert!(matches!(c.validate(), Err(DeterminismError::Config(_))));
    }

    #[test]
    fn test_duplicate_column_rejected() {
        let mut c = cfg();
        c.column_order.push("activity_id".into());
        assert!(c.validate().is_err());
    }
}
