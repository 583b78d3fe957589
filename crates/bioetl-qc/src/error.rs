use thiserror::Error;

use crate::golden::GoldenDiff;
use crate::schema::SchemaErrors;
use crate::thresholds::ThresholdViolation;

#[derive(Debug, Error)]
pub enum QcError {
    #[error(transparent)]
    Schema(#[from] SchemaErrors),

    #[error(transparent)]
    Threshold(#[from] ThresholdViolation),

    #[error(transparent)]
    Golden(#[from] GoldenDiff),

    #[error("invalid QC configuration: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

pub type Result<T> = std::result::Result<T, QcError>;
