//! Run-scoped metadata.

use std::sync::OnceLock;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{BioetlError, Result};

/// Identity of one pipeline invocation.
///
/// The source release is captured at most once; all cache keys and the
/// meta artifact read it from here.
#[derive(Debug)]
pub struct Run {
    pub run_id: Uuid,
    pub config_hash: String,
    pub code_version: String,
    pub started_at: DateTime<Utc>,
    source_release: OnceLock<String>,
}

impl Run {
    pub fn new(config_hash: impl Into<String>, code_version: impl Into<String>, started_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            config_hash: config_hash.into(),
            code_version: code_version.into(),
            started_at,
            source_release: OnceLock::new(),
        }
    }

    /// Record the upstream release snapshot. Re-capturing the same value is a
    /// no-op; a different value is refused.
    pub fn capture_release(&self, release: impl Into<String>) -> Result<&str> {
        let release = release.into();
        let stored = self.source_release.get_or_init(|| release.clone());
        if *stored != release {
            return Err(BioetlError::ReleaseAlreadyCaptured {
                existing: stored.clone(),
                attempted: release,
            });
        }
        Ok(stored.as_str())
    }

    pub fn source_release(&self) -> Option<&str> {
        self.source_release.get().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_release_captured_once() {
        let run = Run::new("abc", "0.1.0", Utc::now());
        assert!(run.source_release().is_none());
        assert_eq!(run.capture_release("ChEMBL_34").unwrap(), "ChEMBL_34");
        assert!(run.capture_release("ChEMBL_34").is_ok());
        assert!(run.capture_release("ChEMBL_35").is_err());
        assert_eq!(run.source_release(), Some("ChEMBL_34"));
    }
}
