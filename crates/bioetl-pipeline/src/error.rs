use bioetl_qc::{GoldenDiff, SchemaErrors, ThresholdViolation};
use thiserror::Error;

use crate::stage::Stage;

/// Process exit code for a clean run.
pub const EXIT_SUCCESS: i32 = 0;
/// Runtime or application failure.
pub const EXIT_FAILURE: i32 = 1;
/// Usage error, or the data failed schema, QC or golden validation.
pub const EXIT_VALIDATION: i32 = 2;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error(transparent)]
    Config(#[from] bioetl_config::ConfigError),

    #[error("{stage} stage failed: {error:#}")]
    Stage { stage: Stage, error: anyhow::Error },

    #[error("source release conflict: {0}")]
    Release(#[from] bioetl_common::BioetlError),

    #[error(transparent)]
    Schema(#[from] SchemaErrors),

    #[error(transparent)]
    Threshold(#[from] ThresholdViolation),

    #[error(transparent)]
    Golden(#[from] GoldenDiff),

    #[error(transparent)]
    Write(#[from] bioetl_determinism::DeterminismError),

    #[error("illegal stage transition {from} -> {to}")]
    Transition { from: Stage, to: Stage },
}

impl PipelineError {
    pub fn stage(stage: Stage, error: impl Into<anyhow::Error>) -> Self {
        PipelineError::Stage { stage, error: error.into() }
    }

    /// Taxonomy name used in the failure log entry.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::Config(_)     => "ConfigError",
            PipelineError::Stage { .. }  => "StageError",
            PipelineError::Release(_)    => "ReleaseConflict",
            PipelineError::Schema(_)     => "SchemaValidationError",
            PipelineError::Threshold(_)  => "QcThresholdViolation",
            PipelineError::Golden(_)     => "GoldenMismatch",
            PipelineError::Write(bioetl_determinism::DeterminismError::ColumnOrder { .. }) => "ColumnOrderError",
            PipelineError::Write(_)      => "WriteIntegrityError",
            PipelineError::Transition { .. } => "IllegalTransition",
        }
    }

    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineError::Config(_)
            | PipelineError::Schema(_)
            | PipelineError::Threshold(_)
            | PipelineError::Golden(_) => EXIT_VALIDATION,
            _ => EXIT_FAILURE,
        }
    }
}

impl From<bioetl_qc::QcError> for PipelineError {
    fn from(e: bioetl_qc::QcError) -> Self {
        match e {
            bioetl_qc::QcError::Schema(s) => PipelineError::Schema(s),
            bioetl_qc::QcError::Threshold(t) => PipelineError::Threshold(t),
            bioetl_qc::QcError::Golden(g) => PipelineError::Golden(g),
            other => PipelineError::stage(Stage::Write, other),
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
