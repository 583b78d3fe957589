//! Error types for the HTTP layer.
//!
//! Upstream failures never surface here; they become fallback records.
//! These errors cover construction and local state only.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, HttpError>;

#[derive(Error, Debug)]
pub enum HttpError {
    #[error("Invalid HTTP client configuration: {0}")]
    Config(String),

    #[error("HTTP client build failed: {0}")]
    Build(#[from] reqwest::Error),

    #[error("release already bound to {existing:?}, refusing {attempted:?}")]
    ReleaseConflict { existing: String, attempted: String },

    #[error("Cache IO error: {0}")]
    CacheIo(#[from] std::io::Error),

    #[error("Cache serialization error: {0}")]
    CacheSerde(#[from] serde_json::Error),
}
