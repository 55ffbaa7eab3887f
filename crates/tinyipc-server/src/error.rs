//! Server error types.

use std::io;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors that stop a server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// IO error outside the transport (signal setup, etc.).
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// The host sent an invalid frame or the transport failed.
    #[error("Protocol error: {0}")]
    Protocol(#[from] tinyipc_protocol::ProtocolError),

    /// Configuration error.
    #[error("Configuration error: {message}")]
    Config { message: String },
}

impl ServerError {
    /// Creates a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }
}
