use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no configuration given (pass --config or set {0})")]
    Missing(&'static str),

    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid YAML in {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("configuration does not match the expected structure: {0}")]
    Structure(#[from] serde_yaml::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error(transparent)]
    Http(#[from] bioetl_http::HttpError),

    #[error(transparent)]
    Determinism(#[from] bioetl_determinism::DeterminismError),

    #[error(transparent)]
    Qc(#[from] bioetl_qc::QcError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, ConfigError>;
