//! Release-namespaced TTL cache.
//!
//! Keys embed the source release, so a new upstream release never reads a
//! previous release's entries. Entries live in memory and, when a directory is
//! configured, in one JSON file per key so they survive across runs.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use bioetl_common::{sha256_hex, Clock, SystemClock};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheKey {
    pub namespace: String,
    pub release: String,
    pub identifier: String,
}

impl CacheKey {
    pub fn new(namespace: impl Into<String>, release: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            release: release.into(),
            identifier: identifier.into(),
        }
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.namespace, self.release, self.identifier)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub value: serde_json::Value,
    pub inserted_at: DateTime<Utc>,
    pub ttl_secs: u64,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let ttl = chrono::Duration::seconds(self.ttl_secs.min(i64::MAX as u64) as i64);
        match self.inserted_at.checked_add_signed(ttl) {
            Some(expires_at) => now < expires_at,
            None => true,
        }
    }
}

pub struct ResponseCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    dir: Option<PathBuf>,
    clock: Arc<dyn Clock>,
}

impl fmt::Debug for ResponseCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseCache").field("dir", &self.dir).finish_non_exhaustive()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl ResponseCache {
    pub fn in_memory() -> Self {
        Self::with_clock(None, Arc::new(SystemClock))
    }

    pub fn persistent(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self::with_clock(Some(dir), Arc::new(SystemClock)))
    }

    pub fn with_clock(dir: Option<PathBuf>, clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            dir,
            clock,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Fresh value for `key`, if any. Expired entries are evicted.
    pub fn get(&self, key: &CacheKey) -> Option<serde_json::Value> {
        let id = key.to_string();
        let now = self.clock.now();

        let in_memory = self
            .entries
            .read()
            .ok()
            .and_then(|m| m.get(&id).cloned());
        let entry = match in_memory {
            Some(e) => Some(e),
            None => self.load_from_disk(&id),
        };

        match entry {
            Some(e) if e.is_fresh(now) => {
                debug!(key = %id, "Cache hit");
                if let Ok(mut m) = self.entries.write() {
                    m.entry(id).or_insert_with(|| e.clone());
                }
                Some(e.value)
            }
            Some(_) => {
                debug!(key = %id, "Cache entry expired");
                self.evict(&id);
                None
            }
            None => None,
        }
    }

    pub fn set(&self, key: &CacheKey, value: serde_json::Value, ttl: Duration) -> Result<()> {
        let id = key.to_string();
        let entry = CacheEntry {
            key: key.clone(),
            value,
            inserted_at: self.clock.now(),
            ttl_secs: ttl.as_secs(),
        };
        if let Some(dir) = &self.dir {
            write_entry(dir, &id, &entry)?;
        }
        if let Ok(mut m) = self.entries.write() {
            m.insert(id, entry);
        }
        Ok(())
    }

    /// Return the cached value, or run `fetch`, store its success and return it.
    ///
    /// Errors from `fetch` are passed through and nothing is stored.
    pub async fn get_or_fetch<T, F, Fut, E>(&self, key: &CacheKey, ttl: Duration, fetch: F) -> std::result::Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        F: FnOnce() -> Fut,
        Fut: Future<Output = std::result::Result<T, E>>,
    {
        if let Some(cached) = self.get(key) {
            match serde_json::from_value::<T>(cached) {
                Ok(v) => return Ok(v),
                Err(e) => warn!(key = %key, error = %e, "Undecodable cache entry, refetching"),
            }
        }

        let value = fetch().await?;
        match serde_json::to_value(&value) {
            Ok(json) => {
                if let Err(e) = self.set(key, json, ttl) {
                    warn!(key = %key, error = %e, "Failed to store cache entry");
                }
            }
            Err(e) => warn!(key = %key, error = %e, "Value not cacheable"),
        }
        Ok(value)
    }

    fn evict(&self, id: &str) {
        if let Ok(mut m) = self.entries.write() {
            m.remove(id);
        }
        if let Some(dir) = &self.dir {
            let _ = std::fs::remove_file(entry_path(dir, id));
        }
    }

    fn load_from_disk(&self, id: &str) -> Option<CacheEntry> {
        let dir = self.dir.as_ref()?;
        let bytes = std::fs::read(entry_path(dir, id)).ok()?;
        match serde_json::from_slice::<CacheEntry>(&bytes) {
            Ok(entry) if entry.key.to_string() == id => Some(entry),
            Ok(_) => None,
            Err(e) => {
                warn!(key = %id, error = %e, "Corrupt cache file ignored");
                None
            }
        }
    }
}

fn entry_path(dir: &Path, id: &str) -> PathBuf {
    dir.join(format!("{}.json", sha256_hex(id)))
}

fn write_entry(dir: &Path, id: &str, entry: &CacheEntry) -> Result<()> {
    let mut tmp = tempfile::NamedTempFile::new_in(dir)?;
    serde_json::to_writer(&mut tmp, entry)?;
    tmp.flush()?;
    tmp.as_file().sync_all()?;
    tmp.persist(entry_path(dir, id)).map_err(|e| e.error)?;
    Ok(())
}
