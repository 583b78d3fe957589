use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeterminismError {
    #[error("column order mismatch: missing {missing:?}, unexpected {extra:?}")]
    ColumnOrder { missing: Vec<String>, extra: Vec<String> },

    #[error("atomic write of {path} failed: {source}")]
    WriteIntegrity {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid determinism configuration: {0}")]
    Config(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, DeterminismError>;
