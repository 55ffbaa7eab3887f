//! Host side of tinyipc: spawn workers and call them.
//!
//! A [`Client`] launches a worker process from a [`LaunchSpec`], attaches a
//! [`CallMultiplexer`] to the worker's stdin/stdout and lets any number of
//! tasks issue correlated calls over that single connection.
//!
//! ```ignore
//! use std::time::Duration;
//! use tinyipc_core::{Client, ClientConfig, LaunchSpec};
//!
//! let client = Client::open(&LaunchSpec::new("./worker"), ClientConfig::default())?;
//! let sum: i64 = client
//!     .call_as("add", &serde_json::json!({"a": 2, "b": 3}), Some(Duration::from_secs(1)))
//!     .await?;
//! client.close().await;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod multiplexer;
pub mod supervisor;
pub mod tracing;

pub use client::Client;
pub use config::{ClientConfig, LaunchSpec, StderrMode};
pub use error::{CallError, CallResult, IpcError, IpcResult, SpawnError};
pub use multiplexer::{CallMultiplexer, CloseReason};
pub use supervisor::{WorkerProcess, WorkerState, WorkerStatus, spawn};
pub use self::tracing::{TracingConfig, TracingError, TracingOutputFormat, init_tracing};
