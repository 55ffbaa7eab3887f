//! Wire protocol and transport for tinyipc.
//!
//! A host process and a worker process exchange [`Frame`]s over a byte
//! stream, usually the worker's stdin/stdout.
//!
//! # Framing
//!
//! Frames are sent as length-prefixed JSON:
//! - 4 bytes: body length (u32, big-endian)
//! - N bytes: JSON body
//!
//! # Frame Structure
//!
//! Every frame is a JSON map with:
//! - `v`: protocol version, currently 1
//! - `correlationId`: links a request to its response
//! - `kind`: `REQUEST`, `RESPONSE` or `ERROR`
//! - `method`: the method name (requests only)
//! - `payload`: arguments or result
//! - `error`: `{code, message, data}` (error frames only)
//!
//! # Example
//!
//! ```rust
//! use tinyipc_protocol::{Frame, decode_frame, encode_frame};
//!
//! let request = Frame::request(1, "echo", serde_json::json!({"x": 1}));
//! let bytes = encode_frame(&request).unwrap();
//! let decoded = decode_frame(&bytes).unwrap();
//! assert_eq!(decoded, request);
//! ```

mod error;
mod frame;
mod framing;
mod transport;

pub use error::{ProtocolError, ProtocolResult};
pub use frame::{CorrelationId, ErrorCode, ErrorInfo, Frame, FrameKind};
pub use framing::{decode_frame, encode_frame, read_frame, write_frame};
pub use transport::{CloseHandle, FrameReceiver, FrameSender, Transport};

/// Current protocol version.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame body size (16 MiB).
pub const MAX_FRAME_SIZE: u32 = 16 * 1024 * 1024;

/// Reserved method asking a worker to stop after answering.
pub const SHUTDOWN_METHOD: &str = "__shutdown__";
