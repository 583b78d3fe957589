//! Artifact set writer: dataset, quality report, meta and run manifest.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use bioetl_common::{sha256_hex, Record};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::atomic::atomic_write_all;
use crate::canonical::{render, Canonicalizer};
use crate::columns::check_column_order;
use crate::config::{DeterminismConfig, NullPosition};
use crate::error::Result;
use crate::hash::attach_hashes;
use crate::sort::stable_sort;

/// A pre-rendered table (used for the quality report).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Table {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<String>>,
}

impl Table {
    pub fn new(columns: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            columns: columns.into_iter().map(Into::into).collect(),
            rows: Vec::new(),
        }
    }

    pub fn push(&mut self, row: Vec<String>) {
        self.rows.push(row);
    }

    pub fn to_csv(&self) -> Result<Vec<u8>> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(&self.columns)?;
        for row in &self.rows {
            w.write_record(row)?;
        }
        into_bytes(w)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Dataset,
    QualityReport,
    Meta,
    Manifest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub checksum: String,
    pub row_hash_column: String,
    pub business_key_hash_column: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub dataset_path: PathBuf,
    pub quality_report_path: PathBuf,
    pub meta_path: PathBuf,
    pub manifest_path: PathBuf,
    pub artifacts: Vec<Artifact>,
}

/// Run-level facts recorded in the meta document.
#[derive(Debug, Clone, PartialEq)]
pub struct MetaInputs {
    pub schema_name: String,
    pub schema_version: String,
    pub source_release: Option<String>,
    pub schema_valid: bool,
    pub qc_summary: serde_json::Value,
    pub config_hash: String,
    pub code_version: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub stage_durations_ms: BTreeMap<String, u64>,
}

/// `<entity>_<date>_meta.yaml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetaDocument {
    pub entity: String,
    pub schema_name: String,
    pub schema_version: String,
    pub source_release: Option<String>,
    pub row_count: usize,
    pub hash_algorithm: String,
    pub row_hash_column: String,
    pub business_key_hash_column: String,
    pub business_key: Vec<String>,
    pub sort_keys: Vec<String>,
    pub null_position: NullPosition,
    pub float_precision: usize,
    pub column_order: Vec<String>,
    pub checksums: BTreeMap<ArtifactKind, String>,
    pub schema_valid: bool,
    pub qc: serde_json::Value,
    pub config_hash: String,
    pub code_version: String,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub generated_at: DateTime<Utc>,
    pub stage_durations_ms: BTreeMap<String, u64>,
}

/// `<entity>_<date>_manifest.json`. Holds nothing run-specific, so two runs
/// over the same content produce the same bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub entity: String,
    pub source_release: Option<String>,
    pub config_hash: String,
    pub row_count: usize,
    pub artifacts: BTreeMap<ArtifactKind, String>,
}

#[derive(Debug, Clone)]
pub struct ArtifactWriter {
    output_dir: PathBuf,
    entity: String,
    date_tag: Option<String>,
    config: DeterminismConfig,
}

impl ArtifactWriter {
    pub fn new(output_dir: impl Into<PathBuf>, entity: impl Into<String>, config: DeterminismConfig) -> Self {
        Self {
            output_dir: output_dir.into(),
            entity: entity.into(),
            date_tag: None,
            config,
        }
    }

    /// Pin the `<date>` part of file names instead of using the run date.
    pub fn with_date_tag(mut self, tag: Option<String>) -> Self {
        self.date_tag = tag;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    pub fn stem(&self, started_at: DateTime<Utc>) -> String {
        let date = self
            .date_tag
            .clone()
            .unwrap_or_else(|| started_at.format("%Y%m%d").to_string());
        format!("{}_{}", self.entity, date)
    }

    pub fn config(&self) -> &DeterminismConfig {
        &self.config
    }

    /// Canonicalize, sort and hash rows in place, ready for [`write`](Self::write).
    pub fn prepare(&self, rows: &mut [Record]) {
        Canonicalizer::new(&self.config).canonicalize_all(rows);
        stable_sort(
            rows,
            self.config.effective_sort_keys(),
            self.config.null_position,
            self.config.float_precision,
        );
        attach_hashes(rows, &self.config);
    }

    /// Render the dataset in the configured column order.
    pub fn dataset_csv(&self, rows: &[Record]) -> Result<Vec<u8>> {
        let mut w = csv::Writer::from_writer(Vec::new());
        w.write_record(&self.config.column_order)?;
        for row in rows {
            w.write_record(
                self.config
                    .column_order
                    .iter()
                    .map(|c| render(&row.value(c), self.config.float_precision)),
            )?;
        }
        into_bytes(w)
    }

    /// Write all four artifacts. Rows must already be sorted and hashed.
    ///
    /// Column order is verified before the first byte is written.
    #[instrument(skip_all, fields(entity = %self.entity, rows = rows.len()))]
    pub fn write(&self, rows: &[Record], quality_report: &Table, meta: &MetaInputs) -> Result<WriteOutcome> {
        check_column_order(rows, &self.config.column_order)?;

        let stem = self.stem(meta.started_at);
        let dataset_path = self.output_dir.join(format!("{stem}.csv"));
        let quality_report_path = self.output_dir.join(format!("{stem}_quality_report.csv"));
        let meta_path = self.output_dir.join(format!("{stem}_meta.yaml"));
        let manifest_path = self.output_dir.join(format!("{stem}_manifest.json"));

        let dataset = self.dataset_csv(rows)?;
        let quality = quality_report.to_csv()?;

        let mut checksums = BTreeMap::new();
        checksums.insert(ArtifactKind::Dataset, sha256_hex(&dataset));
        checksums.insert(ArtifactKind::QualityReport, sha256_hex(&quality));

        let meta_doc = MetaDocument {
            entity: self.entity.clone(),
            schema_name: meta.schema_name.clone(),
            schema_version: meta.schema_version.clone(),
            source_release: meta.source_release.clone(),
            row_count: rows.len(),
            hash_algorithm: "sha256".to_string(),
            row_hash_column: self.config.row_hash_column.clone(),
            business_key_hash_column: self.config.business_key_hash_column.clone(),
            business_key: self.config.business_key.clone(),
            sort_keys: self.config.effective_sort_keys().to_vec(),
            null_position: self.config.null_position,
            float_precision: self.config.float_precision,
            column_order: self.config.column_order.clone(),
            checksums: checksums.clone(),
            schema_valid: meta.schema_valid,
            qc: meta.qc_summary.clone(),
            config_hash: meta.config_hash.clone(),
            code_version: meta.code_version.clone(),
            run_id: meta.run_id,
            started_at: meta.started_at,
            generated_at: meta.generated_at,
            stage_durations_ms: meta.stage_durations_ms.clone(),
        };
        let meta_bytes = serde_yaml::to_string(&meta_doc)?.into_bytes();

        // The meta document carries run ids and timestamps, so it stays out
        // of the manifest.
        let manifest = RunManifest {
            entity: self.entity.clone(),
            source_release: meta.source_release.clone(),
            config_hash: meta.config_hash.clone(),
            row_count: rows.len(),
            artifacts: checksums.clone(),
        };
        let mut manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        manifest_bytes.push(b'\n');

        // All four land together or none of them does.
        atomic_write_all(
            &[
                (dataset_path.as_path(), dataset.as_slice()),
                (quality_report_path.as_path(), quality.as_slice()),
                (meta_path.as_path(), meta_bytes.as_slice()),
                (manifest_path.as_path(), manifest_bytes.as_slice()),
            ],
            &meta.run_id,
        )?;

        let artifact = |kind, path: &Path, bytes: &[u8]| Artifact {
            kind,
            path: path.to_path_buf(),
            checksum: sha256_hex(bytes),
            row_hash_column: self.config.row_hash_column.clone(),
            business_key_hash_column: self.config.business_key_hash_column.clone(),
        };
        let artifacts = vec![
            artifact(ArtifactKind::Dataset, &dataset_path, &dataset),
            artifact(ArtifactKind::QualityReport, &quality_report_path, &quality),
            artifact(ArtifactKind::Meta, &meta_path, &meta_bytes),
            artifact(ArtifactKind::Manifest, &manifest_path, &manifest_bytes),
        ];

        info!(
            dataset = %dataset_path.display(),
            rows = rows.len(),
            checksum = %checksums[&ArtifactKind::Dataset],
            "Artifacts written"
        );

        Ok(WriteOutcome {
            dataset_path,
            quality_report_path,
            meta_path,
            manifest_path,
            artifacts,
        })
    }
}

fn into_bytes(w: csv::Writer<Vec<u8>>) -> Result<Vec<u8>> {
    w.into_inner().map_err(|e| csv::Error::from(e.into_error()).into())
}
