//! Error types for the core crate.

use thiserror::Error;

/// Core error type.
///
/// Variants follow the failure taxonomy the orchestrator reports on:
/// validation and resource errors happen before any side effect, process
/// and proxy-configuration errors trigger rollback.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Settings or profile failed validation.
    #[error("{0}")]
    Validation(String),

    /// A required resource (port, secret, profile) is unavailable.
    #[error("{0}")]
    Resource(String),

    /// The proxy engine process could not be started, stopped, or reached.
    #[error("{0}")]
    Process(String),

    /// The OS proxy configuration could not be read or written.
    #[error("{0}")]
    ProxyConfig(String),

    /// PAC rule parsing, generation, or resolution failed.
    #[error("{0}")]
    Pac(String),

    /// An operation exceeded its time budget.
    #[error("{0}")]
    Timeout(String),

    /// The operation was cancelled by its caller.
    #[error("operation cancelled")]
    Cancelled,

    /// Persistent storage failed.
    #[error("storage error: {0}")]
    Storage(String),

    /// A network fetch failed.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed URI.
    #[error("invalid URI: {0}")]
    InvalidUri(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl CoreError {
    /// Returns true if this error represents caller cancellation.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, CoreError::Cancelled)
    }
}

/// Result type for core operations.
pub type Result<T> = std::result::Result<T, CoreError>;
