//! PAC server error types.

use std::net::SocketAddr;

use skiff_core::CoreError;
use thiserror::Error;

/// PAC server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind to address.
    #[error("failed to bind to {0}: {1}")]
    BindError(SocketAddr, std::io::Error),

    /// Server runtime error.
    #[error("server error: {0}")]
    Runtime(String),
}

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

impl From<ServerError> for CoreError {
    fn from(err: ServerError) -> Self {
        CoreError::Pac(err.to_string())
    }
}
