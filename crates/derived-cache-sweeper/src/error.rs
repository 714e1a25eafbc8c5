//! Error types for the derived cache sweeper

use std::fmt;

#[derive(Debug)]
pub enum SweeperError {
    Cache(derived_file_cache::CacheError),
    Config(String),
    Output(Box<serde_json::Error>),
}

impl fmt::Display for SweeperError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SweeperError::Cache(err) => write!(f, "Cache error: {}", err),
            SweeperError::Config(msg) => write!(f, "Configuration error: {}", msg),
            SweeperError::Output(err) => write!(f, "Output error: {}", err),
        }
    }
}

impl std::error::Error for SweeperError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SweeperError::Cache(err) => Some(err),
            SweeperError::Output(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<derived_file_cache::CacheError> for SweeperError {
    fn from(err: derived_file_cache::CacheError) -> Self {
        SweeperError::Cache(err)
    }
}

impl From<serde_json::Error> for SweeperError {
    fn from(err: serde_json::Error) -> Self {
        SweeperError::Output(Box::new(err))
    }
}

impl From<tracing_subscriber::filter::ParseError> for SweeperError {
    fn from(err: tracing_subscriber::filter::ParseError) -> Self {
        SweeperError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, SweeperError>;
