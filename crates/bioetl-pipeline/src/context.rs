//! Per-run context handed to every stage.

use std::sync::Arc;

use bioetl_common::Run;
use bioetl_config::PipelineConfig;
use bioetl_qc::SiblingKeys;
use chrono::{DateTime, Utc};

use crate::error::Result;

/// Everything a stage may read about the current run. Built once by the
/// caller; there is no process-global state.
#[derive(Debug)]
pub struct RunContext {
    pub run: Run,
    pub config: Arc<PipelineConfig>,
    /// Business keys of sibling entities, for referential-integrity metrics
    pub siblings: SiblingKeys,
}

impl RunContext {
    pub fn new(config: PipelineConfig, code_version: impl Into<String>, started_at: DateTime<Utc>) -> Result<Self> {
        config.validate()?;
        let config_hash = config.config_hash()?;
        Ok(Self {
            run: Run::new(config_hash, code_version, started_at),
            config: Arc::new(config),
            siblings: SiblingKeys::new(),
        })
    }

    pub fn with_siblings(mut self, siblings: SiblingKeys) -> Self {
        self.siblings = siblings;
        self
    }

    pub fn entity(&self) -> &str {
        &self.config.pipeline.entity
    }

    pub fn source(&self) -> &str {
        &self.config.pipeline.source
    }

    pub fn source_release(&self) -> Option<&str> {
        self.run.source_release()
    }
}
