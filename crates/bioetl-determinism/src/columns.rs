//! Column order enforcement.

use std::collections::BTreeSet;

use bioetl_common::Record;

use crate::error::{DeterminismError, Result};

/// Every data column must be listed and, for a non-empty dataset, every
/// listed column must appear in at least one row.
pub fn check_column_order(rows: &[Record], order: &[String]) -> Result<()> {
    let present: BTreeSet<&str> = rows.iter().flat_map(|r| r.columns()).collect();
    let listed: BTreeSet<&str> = order.iter().map(String::as_str).collect();

    let extra: Vec<String> = present.difference(&listed).map(|c| c.to_string()).collect();
    let missing: Vec<String> = if rows.is_empty() {
        Vec::new()
    } else {
        order
            .iter()
            .filter(|c| !present.contains(c.as_str()))
            .cloned()
            .collect()
    };

    if extra.is_empty() && missing.is_empty() {
        Ok(())
    } else {
        Err(DeterminismError::ColumnOrder { missing, extra })
    }
}
