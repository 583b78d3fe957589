use thiserror::Error;

use crate::value::ValueKind;

#[derive(Debug, Error)]
pub enum BioetlError {
    #[error("cannot coerce {value:?} to {kind}")]
    Coercion { value: String, kind: ValueKind },

    #[error("source release already captured as {existing:?}, refusing {attempted:?}")]
    ReleaseAlreadyCaptured { existing: String, attempted: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, BioetlError>;
