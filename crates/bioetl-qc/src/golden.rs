//! Golden-artifact parity.
//!
//! Dataset and manifest must match byte for byte. The meta document is
//! compared structurally with volatile fields masked.

use std::fs;
use std::path::{Path, PathBuf};

use bioetl_determinism::WriteOutcome;
use thiserror::Error;
use tracing::info;

use crate::error::{QcError, Result};

pub const DEFAULT_MASKED_META_FIELDS: [&str; 5] =
    ["run_id", "started_at", "generated_at", "code_version", "stage_durations_ms"];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("golden comparison against {} failed: {}", .golden_dir.display(), .differences.join("; "))]
pub struct GoldenDiff {
    pub golden_dir: PathBuf,
    pub differences: Vec<String>,
}

/// Compare a fresh artifact set against the golden directory.
///
/// Golden files are located by suffix, so a golden run written under a
/// different date still matches.
pub fn compare_golden(outcome: &WriteOutcome, golden_dir: &Path, masked: &[String]) -> Result<()> {
    let golden = GoldenSet::locate(golden_dir)?;
    let mut differences = Vec::new();

    if fs::read(&outcome.dataset_path)? != fs::read(&golden.dataset)? {
        differences.push(format!("dataset differs from {}", golden.dataset.display()));
    }
    if fs::read(&outcome.manifest_path)? != fs::read(&golden.manifest)? {
        differences.push(format!("manifest differs from {}", golden.manifest.display()));
    }

    let fresh = masked_meta(&outcome.meta_path, masked)?;
    let expected = masked_meta(&golden.meta, masked)?;
    if fresh != expected {
        differences.extend(meta_differences(&fresh, &expected));
    }

    if differences.is_empty() {
        info!(golden = %golden_dir.display(), "Golden comparison passed");
        Ok(())
    } else {
        Err(QcError::Golden(GoldenDiff {
            golden_dir: golden_dir.to_path_buf(),
            differences,
        }))
    }
}

struct GoldenSet {
    dataset: PathBuf,
    manifest: PathBuf,
    meta: PathBuf,
}

impl GoldenSet {
    fn locate(dir: &Path) -> Result<Self> {
        let mut names: Vec<PathBuf> = fs::read_dir(dir)?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        names.sort();

        let pick = |what: &str, pred: &dyn Fn(&str) -> bool| -> Result<PathBuf> {
            let found: Vec<&PathBuf> = names
                .iter()
                .filter(|p| p.file_name().and_then(|n| n.to_str()).is_some_and(|n| !n.starts_with('.') && pred(n)))
                .collect();
            match found.as_slice() {
                [one] => Ok((*one).clone()),
                [] => Err(QcError::Golden(GoldenDiff {
                    golden_dir: dir.to_path_buf(),
                    differences: vec![format!("no golden {what} found")],
                })),
                _ => Err(QcError::Golden(GoldenDiff {
                    golden_dir: dir.to_path_buf(),
                    differences: vec![format!("multiple golden {what} candidates")],
                })),
            }
        };

        Ok(Self {
            dataset: pick("dataset", &|n| n.ends_with(".csv") && !n.ends_with("_quality_report.csv"))?,
            manifest: pick("manifest", &|n| n.ends_with("_manifest.json"))?,
            meta: pick("meta", &|n| n.ends_with("_meta.yaml"))?,
        })
    }
}

fn masked_meta(path: &Path, masked: &[String]) -> Result<serde_yaml::Value> {
    let mut doc: serde_yaml::Value = serde_yaml::from_str(&fs::read_to_string(path)?)?;
    mask(&mut doc, masked);
    Ok(doc)
}

fn mask(value: &mut serde_yaml::Value, masked: &[String]) {
    match value {
        serde_yaml::Value::Mapping(map) => {
            for key in masked {
                map.remove(key.as_str());
            }
            for (_, v) in map.iter_mut() {
                mask(v, masked);
            }
        }
        serde_yaml::Value::Sequence(items) => {
            for v in items {
                mask(v, masked);
            }
        }
        _ => {}
    }
}

fn meta_differences(fresh: &serde_yaml::Value, expected: &serde_yaml::Value) -> Vec<String> {
    match (fresh.as_mapping(), expected.as_mapping()) {
        (Some(f), Some(e)) => {
            let mut keys: Vec<String> = f
                .keys()
                .chain(e.keys())
                .filter_map(|k| k.as_str().map(str::to_string))
                .collect();
            keys.sort();
            keys.dedup();
            keys.into_iter()
                .filter(|k| f.get(k.as_str()) != e.get(k.as_str()))
                .map(|k| format!("meta field {k} differs"))
                .collect()
        }
        _ => vec!["meta document differs".to_string()],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_set(dir: &Path, stem: &str, data: &str, run_id: &str) -> WriteOutcome {
        let p = |suffix: &str| dir.join(format!("{stem}{suffix}"));
        fs::write(p(".csv"), data).unwrap();
        fs::write(p("_quality_report.csv"), "section\n").unwrap();
        fs::write(p("_manifest.json"), "{\"row_count\": 1}\n").unwrap();
        fs::write(p("_meta.yaml"), format!("entity: activity\nrow_count: 1\nrun_id: {run_id}\n")).unwrap();
        WriteOutcome {
            dataset_path: p(".csv"),
            quality_report_path: p("_quality_report.csv"),
            meta_path: p("_meta.yaml"),
            manifest_path: p("_manifest.json"),
            artifacts: Vec::new(),
        }
    }

    fn masked() -> Vec<String> {
        DEFAULT_MASKED_META_FIELDS.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_volatile_meta_fields_are_masked() {
        let golden = tempfile::tempdir().unwrap();
        let fresh = tempfile::tempdir().unwrap();
        write_set(golden.path(), "activity_20240101", "a\n1\n", "run-a");
        let out = write_set(fresh.path(), "activity_20240601", "a\n1\n", "run-b");
        assert!(compare_golden(&out, golden.path(), &masked()).is_ok());
    }

    #[test]
    fn test_dataset_byte_difference_fails() {
        let golden = tempfile::tempdir().unwrap();
        let fresh = tempfile::tempdir().unwrap();
        write_set(golden.path(), "activity_x", "a\n1\n", "r");
        let out = write_set(fresh.path(), "activity_x", "a\n2\n", "r");
        match compare_golden(&out, golden.path(), &masked()) {
            Err(QcError::Golden(diff)) => assert_eq!(diff.differences.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_golden_set_fails() {
        let golden = tempfile::tempdir().unwrap();
        let fresh = tempfile::tempdir().unwrap();
        let out = write_set(fresh.path(), "activity_x", "a\n", "r");
        assert!(matches!(compare_golden(&out, golden.path(), &masked()), Err(QcError::Golden(_))));
    }
}
