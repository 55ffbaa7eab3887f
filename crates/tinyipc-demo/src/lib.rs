//! Demo host and worker built on tinyipc.
//!
//! `tinyipc-parent` launches `tinyipc-worker` and calls a few methods on it.
//! `tinyipc-test-worker` serves extra methods that misbehave on purpose
//! (crash, stall, panic, flood stderr) for the integration tests.

pub mod cli;
pub mod config;
pub mod error;
pub mod handlers;
