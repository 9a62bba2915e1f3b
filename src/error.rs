//! Error types for volume access operations

use std::sync::Arc;
use thiserror::Error;

/// Main error type for volume access operations
#[derive(Error, Debug)]
pub enum VolumeError {
    /// Underlying storage is unreachable or corrupt. Never retried at this layer.
    #[error("container I/O failure at `{path}`: {source}")]
    ContainerIo {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Decoding one chunk failed. Shared between all waiters of the same load.
    #[error("failed to load cell {cell} of `{dataset}`: {source}")]
    Load {
        dataset: String,
        cell: u64,
        #[source]
        source: Arc<VolumeError>,
    },

    #[error("configuration error at `{path}`: {message}")]
    Configuration { path: String, message: String },

    #[error("codec error: {0}")]
    Codec(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("out of bounds: {0}")]
    OutOfBounds(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("dataset closed: {0}")]
    Closed(String),

    #[error("background task failed: {0}")]
    Task(String),
}

/// Specialized Result type for volume access operations
pub type Result<T> = std::result::Result<T, VolumeError>;

impl VolumeError {
    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        VolumeError::ContainerIo {
            path: path.into(),
            source,
        }
    }

    pub fn configuration(path: impl Into<String>, message: impl Into<String>) -> Self {
        VolumeError::Configuration {
            path: path.into(),
            message: message.into(),
        }
    }

    /// True for errors that stem from storage access rather than content.
    pub fn is_container_failure(&self) -> bool {
        match self {
            VolumeError::ContainerIo { .. } => true,
            VolumeError::Load { source, .. } => source.is_container_failure(),
            _ => false,
        }
    }
}

impl From<serde_json::Error> for VolumeError {
    fn from(err: serde_json::Error) -> Self {
        VolumeError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configuration_error_names_path() {
        let err = VolumeError::configuration("volumes/labels/s1", "non-integer factor");
        let message = err.to_string();
        assert!(message.contains("volumes/labels/s1"));
        assert!(message.contains("non-integer factor"));
    }

    #[test]
    fn test_load_failure_keeps_cause() {
        let cause = Arc::new(VolumeError::io(
            "raw/0/0/0",
            std::io::Error::new(std::io::ErrorKind::Other, "disk gone"),
        ));
        let err = VolumeError::Load {
            dataset: "raw".to_string(),
            cell: 0,
            source: cause,
        };
        assert!(err.is_container_failure());
        assert!(std::error::Error::source(&err).is_some());
    }
}
