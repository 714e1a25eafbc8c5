//! Cache types

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Default validity for requests that pass a zero duration
pub const DEFAULT_TTL_SECS: u64 = 24 * 60 * 60;

/// Persisted metadata for a cache entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMeta {
    pub file_name: String,
    pub created_at: DateTime<Utc>,
    pub valid_to: DateTime<Utc>,
}

impl EntryMeta {
    pub fn new(file_name: &str, now: DateTime<Utc>, valid_to: DateTime<Utc>) -> Self {
        Self {
            file_name: file_name.to_string(),
            created_at: now,
            valid_to,
        }
    }

    /// An entry stays live until its expiry instant
    pub fn is_live(&self, now: DateTime<Utc>) -> bool {
        self.valid_to > now
    }

    /// Push the expiry out to `until`, never pulling it in
    pub fn extend_to(&mut self, until: DateTime<Utc>) {
        if until > self.valid_to {
            self.valid_to = until;
        }
    }
}

/// Compute the expiry for a request made at `now`.
///
/// A zero duration selects `default_ttl_secs`. Durations that overflow
/// the calendar saturate at the latest representable instant.
pub fn expiry_for(now: DateTime<Utc>, duration_secs: u64, default_ttl_secs: u64) -> DateTime<Utc> {
    let secs = if duration_secs == 0 {
        default_ttl_secs
    } else {
        duration_secs
    };
    i64::try_from(secs)
        .ok()
        .and_then(Duration::try_seconds)
        .and_then(|d| now.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Statistics about the cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStats {
    pub entries: usize,
    pub created: u64,
    pub reused: u64,
    pub expired: u64,
    pub sweep_failures: u64,
}

/// Outcome of a single expiry sweep
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub scanned: usize,
    pub removed: usize,
    pub failed: usize,
}

/// Storage strategy selected at construction time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// In-memory bookkeeping over a flat directory
    Memory,
    /// Hash-sharded directory tree with per-entry sidecars
    #[default]
    Sharded,
    /// Flat directory described by a single index file
    Indexed,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BackendKind::Memory => "memory",
            BackendKind::Sharded => "sharded",
            BackendKind::Indexed => "indexed",
        };
        f.write_str(name)
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(BackendKind::Memory),
            "sharded" => Ok(BackendKind::Sharded),
            "indexed" => Ok(BackendKind::Indexed),
            other => Err(format!(
                "unknown cache backend '{}' (expected memory, sharded or indexed)",
                other
            )),
        }
    }
}

/// Configuration for opening a backend
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub cache_dir: PathBuf,
    pub backend: BackendKind,
    pub default_ttl_secs: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            cache_dir: PathBuf::from("./cache/derived"),
            backend: BackendKind::Sharded,
            default_ttl_secs: DEFAULT_TTL_SECS,
        }
    }
}
