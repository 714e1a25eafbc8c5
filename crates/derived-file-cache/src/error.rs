//! Error types for the derived file cache

use std::fmt;
use std::path::PathBuf;

#[derive(Debug)]
pub enum CacheError {
    /// The managed directory (or a path beneath it) cannot be read or written
    StorageUnavailable {
        path: PathBuf,
        source: std::io::Error,
    },
    /// A new entry could not be materialized for a valid request
    EntryCreationFailed { file_name: String, reason: String },
    /// An id that is invalid, stale, or was issued by another backend instance
    InvalidIdUsage(String),
    InvalidFileName(String),
    /// Entry metadata or the index could not be encoded or decoded
    Index(String),
}

impl CacheError {
    pub(crate) fn storage(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::StorageUnavailable {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn creation(file_name: &str, reason: impl fmt::Display) -> Self {
        CacheError::EntryCreationFailed {
            file_name: file_name.to_string(),
            reason: reason.to_string(),
        }
    }
}

impl fmt::Display for CacheError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CacheError::StorageUnavailable { path, source } => {
                write!(f, "Storage unavailable at {}: {}", path.display(), source)
            }
            CacheError::EntryCreationFailed { file_name, reason } => {
                write!(f, "Failed to create cache entry '{}': {}", file_name, reason)
            }
            CacheError::InvalidIdUsage(msg) => write!(f, "Invalid id usage: {}", msg),
            CacheError::InvalidFileName(name) => write!(f, "Invalid file name: {:?}", name),
            CacheError::Index(msg) => write!(f, "Index error: {}", msg),
        }
    }
}

impl std::error::Error for CacheError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CacheError::StorageUnavailable { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CacheError {
    fn from(err: serde_json::Error) -> Self {
        CacheError::Index(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CacheError>;
