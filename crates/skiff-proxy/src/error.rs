//! Error types for the proxy crate.

use skiff_core::CoreError;
use skiff_storage::StorageError;
use thiserror::Error;

/// Proxy crate error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// OS proxy settings could not be read or written.
    #[error("System proxy error: {0}")]
    Backend(String),

    /// A proxy session is required for this operation.
    #[error("{0}")]
    Session(String),

    /// HTTP fetch failed.
    #[error("{0}")]
    Http(String),

    /// The proxy engine process failed.
    #[error("{0}")]
    Process(String),

    /// PAC generation or resolution failed.
    #[error("{0}")]
    Pac(String),

    /// Archive extraction failed.
    #[error("Archive error: {0}")]
    Archive(String),

    /// Storage error.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        ProxyError::Http(e.to_string())
    }
}

impl From<ProxyError> for CoreError {
    fn from(e: ProxyError) -> Self {
        match e {
            ProxyError::Backend(_) | ProxyError::Session(_) => CoreError::ProxyConfig(e.to_string()),
            ProxyError::Http(m) => CoreError::Network(m),
            ProxyError::Process(m) => CoreError::Process(m),
            ProxyError::Archive(_) => CoreError::Process(e.to_string()),
            ProxyError::Pac(m) => CoreError::Pac(m),
            ProxyError::Storage(e) => e.into(),
            ProxyError::Io(e) => CoreError::Io(e),
            ProxyError::Json(e) => CoreError::Json(e),
        }
    }
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
