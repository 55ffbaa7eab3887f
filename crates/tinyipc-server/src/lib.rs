//! Worker side of tinyipc.
//!
//! A worker registers async handlers on an [`IpcServer`] and serves them on
//! its stdin/stdout. The dispatch loop runs every request in its own task,
//! turns handler errors and panics into ERROR frames, and stops when the
//! host disconnects, sends `__shutdown__`, or the [`ShutdownHandle`] fires.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod registry;
pub mod server;
pub mod signals;

pub use config::ServerConfig;
pub use dispatch::{DispatchLoop, LoopState};
pub use error::{ServerError, ServerResult};
pub use registry::{Handler, HandlerError, HandlerRegistry, HandlerResult};
pub use server::IpcServer;
pub use signals::{ShutdownHandle, ShutdownSignal, SignalHandler};
