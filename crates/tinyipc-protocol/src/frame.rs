//! Frame types for the tinyipc protocol.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::PROTOCOL_VERSION;
use crate::error::{ProtocolError, ProtocolResult};

/// Identifier linking a request to its response.
///
/// Allocated by the host, monotonically increasing per connection.
pub type CorrelationId = u64;

/// Kind of frame on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FrameKind {
    /// A method invocation sent by the host.
    Request,
    /// A successful result sent by the worker.
    Response,
    /// A failed result sent by the worker.
    Error,
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Request => write!(f, "REQUEST"),
            Self::Response => write!(f, "RESPONSE"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A single protocol message.
///
/// Serialized as a JSON map with the keys `v`, `correlationId`, `kind`,
/// `method`, `payload` and `error`. Unknown keys are ignored when decoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    /// Protocol version.
    #[serde(rename = "v", default = "default_version")]
    pub version: u32,
    /// Correlation id shared by a request and its response.
    #[serde(rename = "correlationId")]
    pub correlation_id: CorrelationId,
    /// Frame kind.
    pub kind: FrameKind,
    /// Method name (requests only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// Arguments of a request or result of a response.
    #[serde(default)]
    pub payload: Value,
    /// Error details (error frames only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

fn default_version() -> u32 {
    PROTOCOL_VERSION
}

impl Frame {
    /// Creates a request frame.
    pub fn request(
        correlation_id: CorrelationId,
        method: impl Into<String>,
        payload: Value,
    ) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            kind: FrameKind::Request,
            method: Some(method.into()),
            payload,
            error: None,
        }
    }

    /// Creates a response frame carrying a result.
    pub fn response(correlation_id: CorrelationId, payload: Value) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            kind: FrameKind::Response,
            method: None,
            payload,
            error: None,
        }
    }

    /// Creates an error frame.
    pub fn error(correlation_id: CorrelationId, error: ErrorInfo) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            correlation_id,
            kind: FrameKind::Error,
            method: None,
            payload: Value::Null,
            error: Some(error),
        }
    }

    /// Checks if this frame uses a compatible protocol version.
    pub fn is_compatible(&self) -> bool {
        self.version == PROTOCOL_VERSION
    }

    /// Returns the method name of a request frame.
    pub fn method(&self) -> Option<&str> {
        self.method.as_deref()
    }

    /// Checks that the fields required by the frame kind are present.
    pub fn validate(&self) -> ProtocolResult<()> {
        match self.kind {
            FrameKind::Request if self.method.is_none() => {
                Err(ProtocolError::MissingField { field: "method" })
            }
            FrameKind::Error if self.error.is_none() => {
                Err(ProtocolError::MissingField { field: "error" })
            }
            _ => Ok(()),
        }
    }
}

/// Error kind tag carried by error frames.
///
/// Well-known kinds use fixed wire strings. Any other string is a kind
/// defined by a handler and is kept as-is in [`ErrorCode::Custom`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ErrorCode {
    /// The requested method is not registered.
    UnknownMethod,
    /// The request parameters were missing or invalid.
    BadParams,
    /// The handler failed unexpectedly.
    Internal,
    /// A deadline elapsed.
    DeadlineExceeded,
    /// The worker process died.
    ProcessDied,
    /// A frame could not be decoded.
    Protocol,
    /// Handler-defined kind.
    Custom(String),
}

impl ErrorCode {
    /// Returns the wire representation.
    pub fn as_str(&self) -> &str {
        match self {
            Self::UnknownMethod => "E_NO_SUCH_METHOD",
            Self::BadParams => "E_BAD_PARAMS",
            Self::Internal => "E_INTERNAL",
            Self::DeadlineExceeded => "E_DEADLINE_EXCEEDED",
            Self::ProcessDied => "E_PROCESS_DIED",
            Self::Protocol => "E_PROTOCOL",
            Self::Custom(code) => code,
        }
    }

    /// Returns a human-readable description of the error code.
    pub fn description(&self) -> &str {
        match self {
            Self::UnknownMethod => "no handler is registered for the method",
            Self::BadParams => "invalid or missing parameters",
            Self::Internal => "internal worker error",
            Self::DeadlineExceeded => "deadline exceeded",
            Self::ProcessDied => "worker process died",
            Self::Protocol => "malformed frame",
            Self::Custom(_) => "application error",
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        match code.as_str() {
            "E_NO_SUCH_METHOD" => Self::UnknownMethod,
            "E_BAD_PARAMS" => Self::BadParams,
            "E_INTERNAL" => Self::Internal,
            "E_DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "E_PROCESS_DIED" => Self::ProcessDied,
            "E_PROTOCOL" => Self::Protocol,
            _ => Self::Custom(code),
        }
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        Self::from(code.to_string())
    }
}

impl From<ErrorCode> for String {
    fn from(code: ErrorCode) -> Self {
        match code {
            ErrorCode::Custom(code) => code,
            other => other.as_str().to_string(),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error details carried by an error frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Error kind.
    #[serde(alias = "kind")]
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Optional structured details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl ErrorInfo {
    /// Creates error details.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Creates an unknown-method error for `method`.
    pub fn unknown_method(method: &str) -> Self {
        Self::new(ErrorCode::UnknownMethod, format!("no such method: {method}"))
    }

    /// Creates an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::Internal, message)
    }

    /// Attaches structured details.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl fmt::Display for ErrorInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}
