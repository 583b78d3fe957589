//! Placeholder synthesis for identifiers whose retrieval failed.

use std::fmt;

use bioetl_common::{FallbackMetadata, Record, Value};
use serde::{Deserialize, Serialize};

use crate::retry::{ErrorKind, FailureReason};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackReason {
    MaxRetriesExceeded,
    CircuitOpen,
    /// Non-retryable HTTP status
    HttpError,
    /// Non-retryable transport problem
    RequestError,
    /// Successful batch that did not contain the identifier
    NotFound,
    /// Payload arrived but could not be decoded
    ParseError,
}

impl FallbackReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            FallbackReason::MaxRetriesExceeded => "max_retries_exceeded",
            FallbackReason::CircuitOpen        => "circuit_open",
            FallbackReason::HttpError          => "http_error",
            FallbackReason::RequestError       => "request_error",
            FallbackReason::NotFound           => "not_found",
            FallbackReason::ParseError         => "parse_error",
        }
    }
}

impl fmt::Display for FallbackReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackRecord {
    pub reason: FallbackReason,
    pub error_type: String,
    pub http_status: Option<u16>,
    /// Attempts actually sent upstream
    pub attempts: u32,
    pub retries: u32,
    pub message: String,
    pub url: String,
}

impl FallbackRecord {
    pub fn from_failure(reason: FallbackReason, failure: &FailureReason, attempts: u32, url: impl Into<String>) -> Self {
        Self {
            reason,
            error_type: failure.kind.as_str().to_string(),
            http_status: failure.status,
            attempts,
            retries: attempts.saturating_sub(1),
            message: failure.message.clone(),
            url: url.into(),
        }
    }

    pub fn circuit_open(url: impl Into<String>) -> Self {
        Self {
            reason: FallbackReason::CircuitOpen,
            error_type: ErrorKind::CircuitOpen.as_str().to_string(),
            http_status: None,
            attempts: 0,
            retries: 0,
            message: "circuit breaker open".to_string(),
            url: url.into(),
        }
    }

    /// Identifier missing from an otherwise successful response.
    pub fn not_found(url: impl Into<String>, http_status: u16) -> Self {
        Self {
            reason: FallbackReason::NotFound,
            error_type: ErrorKind::HttpStatus.as_str().to_string(),
            http_status: Some(http_status),
            attempts: 1,
            retries: 0,
            message: "identifier absent from response".to_string(),
            url: url.into(),
        }
    }

    pub fn parse_error(url: impl Into<String>, http_status: u16, message: impl Into<String>) -> Self {
        Self {
            reason: FallbackReason::ParseError,
            error_type: "ParseError".to_string(),
            http_status: Some(http_status),
            attempts: 1,
            retries: 0,
            message: message.into(),
            url: url.into(),
        }
    }

    pub fn to_metadata(&self) -> FallbackMetadata {
        FallbackMetadata {
            reason: self.reason.as_str().to_string(),
            error_type: self.error_type.clone(),
            http_status: self.http_status,
            attempt: self.attempts,
            message: Some(self.message.clone()),
        }
    }

    /// One placeholder row carrying the identifier's key columns.
    pub fn record_for(&self, source_system: &str, key_fields: impl IntoIterator<Item = (String, Value)>) -> Record {
        Record::fallback(source_system, key_fields, self.to_metadata())
    }
}
