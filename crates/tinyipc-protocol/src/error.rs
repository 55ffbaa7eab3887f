//! Protocol error types.

use thiserror::Error;

/// Result type for protocol operations.
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Errors that can occur while encoding, decoding or moving frames.
///
/// Every variant except [`ProtocolError::Closed`] means the byte stream can
/// no longer be trusted and the connection must be dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Frame exceeds maximum allowed size.
    #[error("frame too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: u32, max: u32 },

    /// Failed to serialize or parse the frame body.
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error during read/write.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Stream ended in the middle of a frame.
    #[error("incomplete frame: expected {expected} bytes, got {received}")]
    IncompleteMessage { expected: usize, received: usize },

    /// Zero-length frame received.
    #[error("empty frame")]
    EmptyMessage,

    /// A field required by the frame kind is absent.
    #[error("frame is missing required field `{field}`")]
    MissingField { field: &'static str },

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,
}
