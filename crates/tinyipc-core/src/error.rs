//! Host-side error types.

use std::io;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;
use tinyipc_protocol::{ErrorCode, ErrorInfo};

/// Result type for calls into a worker.
pub type CallResult<T> = Result<T, CallError>;

/// Result type for applications driving a worker.
pub type IpcResult<T> = Result<T, IpcError>;

/// Errors raised while starting a worker process.
///
/// Spawn failures are never retried automatically.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The executable could not be started.
    #[error("failed to start worker `{program}`: {source}")]
    Launch {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The child was started but one of its pipes is missing.
    #[error("worker {stream} is not available")]
    MissingStream { stream: &'static str },
}

/// Errors a single call can fail with.
#[derive(Debug, Error)]
pub enum CallError {
    /// No response arrived before the deadline.
    #[error("call timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    /// The worker has no handler for the method.
    #[error("unknown method: {message}")]
    UnknownMethod { message: String },

    /// The handler reported an error.
    #[error("{code}: {message}")]
    Remote {
        code: ErrorCode,
        message: String,
        data: Option<Value>,
    },

    /// The connection to the worker is gone.
    #[error("worker unavailable: {0}")]
    WorkerUnavailable(String),

    /// The client was closed.
    #[error("client closed")]
    ClientClosed,

    /// Typed parameters could not be serialized.
    #[error("failed to encode call parameters: {0}")]
    Encode(#[source] serde_json::Error),

    /// The result did not match the expected type.
    #[error("failed to decode call result: {0}")]
    Decode(#[source] serde_json::Error),
}

impl CallError {
    /// Returns the protocol error code matching this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::Timeout(_) => ErrorCode::DeadlineExceeded,
            Self::UnknownMethod { .. } => ErrorCode::UnknownMethod,
            Self::Remote { code, .. } => code.clone(),
            Self::WorkerUnavailable(_) | Self::ClientClosed => ErrorCode::ProcessDied,
            Self::Encode(_) => ErrorCode::BadParams,
            Self::Decode(_) => ErrorCode::Protocol,
        }
    }

    /// Returns true if the connection can no longer be used.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::WorkerUnavailable(_) | Self::ClientClosed)
    }
}

impl From<ErrorInfo> for CallError {
    fn from(info: ErrorInfo) -> Self {
        match info.code {
            ErrorCode::UnknownMethod => Self::UnknownMethod {
                message: info.message,
            },
            code => Self::Remote {
                code,
                message: info.message,
                data: info.data,
            },
        }
    }
}

/// Any error an application driving a worker can see.
#[derive(Debug, Error)]
pub enum IpcError {
    /// The worker could not be started.
    #[error(transparent)]
    Spawn(#[from] SpawnError),

    /// A call failed.
    #[error(transparent)]
    Call(#[from] CallError),
}
