//! Demo error types.

use thiserror::Error;

/// Result type for the demo binaries.
pub type DemoResult<T> = Result<T, DemoError>;

/// Errors the demo binaries report.
#[derive(Debug, Error)]
pub enum DemoError {
    /// The configuration file is unreadable or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Launching or calling the worker failed.
    #[error(transparent)]
    Ipc(#[from] tinyipc_core::IpcError),

    /// Command-line parameters are not valid JSON.
    #[error("invalid JSON parameters: {0}")]
    Params(#[from] serde_json::Error),
}

impl From<tinyipc_core::SpawnError> for DemoError {
    fn from(err: tinyipc_core::SpawnError) -> Self {
        Self::Ipc(err.into())
    }
}

impl From<tinyipc_core::CallError> for DemoError {
    fn from(err: tinyipc_core::CallError) -> Self {
        Self::Ipc(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tinyipc_core::{CallError, IpcError};

    #[test]
    fn call_errors_keep_their_message() {
        let err = DemoError::from(CallError::Timeout(Duration::from_millis(250)));
        assert!(matches!(err, DemoError::Ipc(IpcError::Call(_))));
        assert_eq!(err.to_string(), "call timed out after 250ms");
    }

    #[test]
    fn bad_json_params() {
        let err: DemoError = serde_json::from_str::<serde_json::Value>("{")
            .unwrap_err()
            .into();
        assert!(err.to_string().starts_with("invalid JSON parameters"));
    }
}
