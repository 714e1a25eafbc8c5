//! Core types for the derived cache sweeper

use crate::error::{Result, SweeperError};
use chrono::{DateTime, Utc};
use derived_file_cache::{BackendKind, CacheConfig, SweepReport, DEFAULT_TTL_SECS};
use serde::Serialize;
use std::path::PathBuf;

pub const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;

/// Configuration for the sweeper
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub cache: CacheConfig,
    pub sweep_interval_secs: u64,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS, // 5 minutes
        }
    }
}

impl SweeperConfig {
    /// Build the configuration from a variable lookup (the process
    /// environment in production)
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let cache_dir = lookup("CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("./cache/derived"));

        let backend = match lookup("CACHE_BACKEND") {
            Some(name) => name.parse::<BackendKind>().map_err(SweeperError::Config)?,
            None => BackendKind::default(),
        };

        let default_ttl_secs = lookup("CACHE_TTL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(DEFAULT_TTL_SECS);

        let sweep_interval_secs = lookup("SWEEP_INTERVAL_SECS")
            .and_then(|s| s.parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .unwrap_or(DEFAULT_SWEEP_INTERVAL_SECS);

        Ok(Self {
            cache: CacheConfig {
                cache_dir,
                backend,
                default_ttl_secs,
            },
            sweep_interval_secs,
        })
    }
}

/// Printed by the `request` command
#[derive(Debug, Serialize)]
pub struct RequestResponse {
    pub id: String,
    pub file_name: String,
    pub path: PathBuf,
    pub valid_to: Option<DateTime<Utc>>,
}

/// Printed by the `sweep` command
#[derive(Debug, Serialize)]
pub struct SweepResponse {
    pub backend: String,
    pub swept_at: DateTime<Utc>,
    pub report: SweepReport,
}
