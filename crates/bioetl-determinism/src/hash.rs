//! Row and business-key hashes.
//!
//! Both are SHA-256 over a JSON array built from canonical renderings, so
//! they depend on content only: not on column insertion order, run id or
//! wall clock.

use std::collections::BTreeSet;

use bioetl_common::{sha256_hex, Record, Value};

use crate::canonical::render;
use crate::config::DeterminismConfig;

/// Hash of every column except `excluded`, as `[[column, value], ...]` sorted
/// by column. Columns that render empty are left out, so an absent column, a
/// null and a blank string all hash alike, as they do in the CSV.
pub fn hash_row(record: &Record, excluded: &BTreeSet<&str>, float_precision: usize) -> String {
    let columns: BTreeSet<&str> = record.columns().filter(|c| !excluded.contains(c)).collect();
    let pairs: Vec<serde_json::Value> = columns
        .into_iter()
        .filter_map(|c| {
            let rendered = render(&record.value(c), float_precision);
            (!rendered.is_empty()).then(|| serde_json::json!([c, rendered]))
        })
        .collect();
    sha256_hex(serde_json::Value::Array(pairs).to_string())
}

/// Hash of the business-key values in configured order.
pub fn hash_business_key(record: &Record, key: &[String], float_precision: usize) -> String {
    let values: Vec<serde_json::Value> = key
        .iter()
        .map(|c| render(&record.value(c), float_precision).into())
        .collect();
    sha256_hex(serde_json::Value::Array(values).to_string())
}

/// Compute and store both hash columns on every record.
pub fn attach_hashes(records: &mut [Record], config: &DeterminismConfig) {
    let excluded: BTreeSet<&str> = config
        .volatile_columns
        .iter()
        .map(String::as_str)
        .chain(config.hash_columns())
        .collect();

    for record in records.iter_mut() {
        let row = hash_row(record, &excluded, config.float_precision);
        let key = hash_business_key(record, &config.business_key, config.float_precision);
        record.set(config.row_hash_column.clone(), Value::Str(row));
        record.set(config.business_key_hash_column.clone(), Value::Str(key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bioetl_common::FallbackMetadata;

    fn cfg() -> DeterminismConfig {
        DeterminismConfig {
            business_key: vec!["activity_id".into()],
            ..DeterminismConfig::default()
        }
    }

    #[test]
    fn test_row_hash_ignores_insertion_order_and_volatile_columns() {
        let mut a = vec![Record::new("chembl")
            .with("activity_id", 1i64)
            .with("standard_value", 2.5)
            .with("run_id", "aaa")];
        let mut b = vec![Record::new("chembl")
            .with("run_id", "bbb")
            .with("standard_value", 2.5)
            .with("activity_id", 1i64)];
        attach_hashes(&mut a, &cfg());
        attach_hashes(&mut b, &cfg());
        assert_eq!(a[0].get("hash_row"), b[0].get("hash_row"));
        assert_eq!(a[0].get("hash_business_key"), b[0].get("hash_business_key"));
    }

    #[test]
    fn test_rehashing_is_stable() {
        let mut rows = vec![Record::new("chembl").with("activity_id", 1i64)];
        attach_hashes(&mut rows, &cfg());
        let first = rows[0].get("hash_row").cloned();
        attach_hashes(&mut rows, &cfg());
        assert_eq!(rows[0].get("hash_row").cloned(), first);
    }

    #[test]
    fn test_content_change_changes_row_hash_not_key_hash() {
        let mut rows = vec![
            Record::new("chembl").with("activity_id", 1i64).with("standard_value", 2.5),
            Record::new("chembl").with("activity_id", 1i64).with("standard_value", 2.6),
        ];
        attach_hashes(&mut rows, &cfg());
        assert_ne!(rows[0].get("hash_row"), rows[1].get("hash_row"));
        assert_eq!(rows[0].get("hash_business_key"), rows[1].get("hash_business_key"));
    }

    #[test]
    fn test_absent_null_and_blank_columns_hash_alike() {
        let excluded = BTreeSet::new();
        let bare = Record::new("chembl").with("activity_id", 1i64);
        let null = bare.clone().with("note", Value::Null);
        let blank = bare.clone().with("note", "   ");
        assert_eq!(hash_row(&bare, &excluded, 6), hash_row(&null, &excluded, 6));
        assert_eq!(hash_row(&bare, &excluded, 6), hash_row(&blank, &excluded, 6));

        let noted = bare.clone().with("note", "x");
        assert_ne!(hash_row(&bare, &excluded, 6), hash_row(&noted, &excluded, 6));
    }

    #[test]
    fn test_fallback_metadata_is_hashed() {
        let plain = Record::new("chembl").with("activity_id", 1i64);
        let mut failed = plain.clone();
        failed.set_fallback(FallbackMetadata {
            reason: "not_found".into(),
            error_type: "HttpStatusError".into(),
            http_status: Some(200),
            attempt: 1,
            message: None,
        });
        let excluded = BTreeSet::new();
        assert_ne!(hash_row(&plain, &excluded, 6), hash_row(&failed, &excluded, 6));
    }

    #[test]
    fn test_business_key_hash_is_sha256_of_json_array() {
        let r = Record::new("crossref").with("doi", "10.1/x");
        assert_eq!(hash_business_key(&r, &["doi".to_string()], 6), sha256_hex(r#"["10.1/x"]"#));
    }
}
