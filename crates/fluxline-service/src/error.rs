//! Service-level error types.

use thiserror::Error;

/// Result type alias using ServiceError
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Errors from the service layer around the engine
#[derive(Debug, Error)]
pub enum ServiceError {
    /// No stored schema matched the requested id/version.
    #[error("schema '{id}' (version {version:?}) not found")]
    SchemaNotFound { id: String, version: Option<u32> },

    /// No run is stored under the given test id.
    #[error("run '{test_id}' not found")]
    RunNotFound { test_id: String },

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}
