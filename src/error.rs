//! Error Module
//!
//! Defines error types and result types used throughout the hybrid cache.

use thiserror::Error;

/// Main error type for the hybrid cache
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("IO error: {0}")]
    IoError(String),

    #[error("Key not found: {0}")]
    NotFound(String),

    #[error("Corrupt index: {0}")]
    CorruptIndex(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),

    #[error("Lock contention: {0}")]
    LockContention(String),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl CacheError {
    /// Whether the error means the key simply was not there
    pub fn is_not_found(&self) -> bool {
        matches!(self, CacheError::NotFound(_))
    }
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        CacheError::IoError(err.to_string())
    }
}

impl From<serde_yaml::Error> for CacheError {
    fn from(err: serde_yaml::Error) -> Self {
        CacheError::SerializationError(err.to_string())
    }
}

/// Result type alias for the hybrid cache
pub type Result<T> = std::result::Result<T, CacheError>;
