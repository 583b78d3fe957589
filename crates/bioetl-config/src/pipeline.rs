//! The effective configuration of one run.

use std::path::PathBuf;

use bioetl_common::{canonical_json, sha256_hex};
use bioetl_determinism::DeterminismConfig;
use bioetl_http::{CacheConfig, HttpClientConfig};
use bioetl_qc::{check_order, QcPlan, Schema, DEFAULT_MASKED_META_FIELDS};
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// What the validate stage does with schema violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailMode {
    /// Abort the run.
    #[default]
    #[serde(alias = "fail_closed")]
    Closed,
    /// Log, mark `schema_valid = false` and keep going.
    #[serde(alias = "fail_open")]
    Open,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineSection {
    /// Entity name, used for artifact file names
    pub entity: String,

    /// Source system tag stamped on every record
    pub source: String,

    #[serde(default)]
    pub fail_mode: FailMode,

    /// Keep the first N extracted rows
    #[serde(default)]
    pub limit: Option<usize>,

    /// Keep a deterministic sample of N extracted rows
    #[serde(default)]
    pub sample: Option<usize>,

    #[serde(default = "default_sample_seed")]
    pub sample_seed: u64,

    /// Pin the release instead of asking the source
    #[serde(default)]
    pub source_release: Option<String>,

    /// Source-specific search term or filter used when no identifiers are given
    #[serde(default)]
    pub query: Option<String>,
}

fn default_sample_seed() -> u64 { 42 }

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_dir")]
    pub dir: PathBuf,

    /// Replaces the `YYYYMMDD` part of artifact names
    #[serde(default)]
    pub date_tag: Option<String>,

    #[serde(default)]
    pub golden_dir: Option<PathBuf>,

    /// Meta fields ignored by golden comparison
    #[serde(default = "default_masked_meta_fields")]
    pub masked_meta_fields: Vec<String>,
}

fn default_output_dir() -> PathBuf { PathBuf::from("output") }
fn default_masked_meta_fields() -> Vec<String> {
    DEFAULT_MASKED_META_FIELDS.iter().map(|s| s.to_string()).collect()
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            dir: default_output_dir(),
            date_tag: None,
            golden_dir: None,
            masked_meta_fields: default_masked_meta_fields(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub pipeline: PipelineSection,

    #[serde(default)]
    pub http: HttpClientConfig,

    #[serde(default)]
    pub cache: CacheConfig,

    pub determinism: DeterminismConfig,

    pub schema: Schema,

    #[serde(default)]
    pub qc: QcPlan,

    #[serde(default)]
    pub output: OutputConfig,
}

impl PipelineConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Cross-section consistency checks.
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.entity.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.entity must not be empty".into()));
        }
        if self.pipeline.source.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline.source must not be empty".into()));
        }
        if self.pipeline.limit.is_some() && self.pipeline.sample.is_some() {
            return Err(ConfigError::Invalid("pipeline.limit and pipeline.sample are mutually exclusive".into()));
        }
        if self.pipeline.sample == Some(0) {
            return Err(ConfigError::Invalid("pipeline.sample must be at least 1".into()));
        }
        self.http.validate()?;
        self.determinism.validate()?;
        self.schema.validate()?;
        check_order(&self.schema, &self.determinism.column_order)?;
        for rule in &self.qc.thresholds {
            if let (Some(lo), Some(hi)) = (rule.min, rule.max) {
                if lo > hi {
                    return Err(ConfigError::Invalid(format!(
                        "threshold for {} has min {lo} above max {hi}",
                        rule.metric
                    )));
                }
            }
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON of everything that shapes artifact
    /// content. The `output` section only decides where artifacts land and
    /// is left out.
    pub fn config_hash(&self) -> Result<String> {
        let mut value = serde_json::to_value(self)?;
        if let Some(map) = value.as_object_mut() {
            map.remove("output");
        }
        Ok(sha256_hex(canonical_json(&value)))
    }

    pub fn is_fail_open(&self) -> bool {
        self.pipeline.fail_mode == FailMode::Open
    }
}
