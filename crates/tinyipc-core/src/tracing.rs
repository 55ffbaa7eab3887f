//! Log setup shared by hosts and workers.
//!
//! Both sides log to stderr. A worker's stdout is the frame stream, so a
//! single stray log line there would corrupt the protocol; a host receives
//! its workers' stderr through the supervisor and re-logs it.
//!
//! ```ignore
//! use tinyipc_core::tracing::{init_tracing, TracingConfig};
//!
//! // host
//! init_tracing(TracingConfig::host())?;
//! // worker
//! init_tracing(TracingConfig::worker())?;
//! ```
//!
//! `RUST_LOG` replaces the default `tinyipc=<level>` filter, and
//! `TINYIPC_LOG_FORMAT` (`pretty`, `compact` or `json`) replaces the preset's
//! output format.

use std::str::FromStr;

use thiserror::Error;
use tracing::Level;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Variable selecting the output format at runtime.
pub const FORMAT_ENV: &str = "TINYIPC_LOG_FORMAT";

#[derive(Debug, Error)]
pub enum TracingError {
    #[error("a global tracing subscriber is already installed: {0}")]
    AlreadyInstalled(#[from] tracing::subscriber::SetGlobalDefaultError),

    #[error("invalid log filter: {0}")]
    Filter(#[from] tracing_subscriber::filter::ParseError),

    #[error("unknown log format `{0}`, expected pretty, compact or json")]
    Format(String),
}

/// How log lines are rendered.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TracingOutputFormat {
    Pretty,
    #[default]
    Compact,
    /// One JSON object per line, for collectors.
    Json,
}

impl FromStr for TracingOutputFormat {
    type Err = TracingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(TracingError::Format(other.to_string())),
        }
    }
}

/// Subscriber settings.
#[derive(Debug, Clone)]
pub struct TracingConfig {
    /// Level of the `tinyipc` targets when no filter is given.
    pub default_level: Level,
    pub output_format: TracingOutputFormat,
    /// Source file and line of each event.
    pub include_location: bool,
    pub include_target: bool,
    pub include_timestamp: bool,
    /// Log span creation and closing, with their busy/idle time.
    pub include_span_events: bool,
    pub ansi: bool,
    /// Filter directives taking precedence over `RUST_LOG`.
    pub env_filter: Option<String>,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self::host()
    }
}

impl TracingConfig {
    /// Preset for the process that launches workers.
    #[must_use]
    pub fn host() -> Self {
        Self {
            default_level: Level::INFO,
            output_format: TracingOutputFormat::Compact,
            include_location: false,
            include_target: true,
            include_timestamp: true,
            include_span_events: false,
            ansi: true,
            env_filter: None,
        }
    }

    /// Preset for a worker process.
    ///
    /// The host's forwarder stamps every line it re-logs, so worker lines
    /// carry no time and no color codes.
    #[must_use]
    pub fn worker() -> Self {
        Self {
            include_timestamp: false,
            ansi: false,
            ..Self::host()
        }
    }

    #[must_use]
    pub fn with_level(mut self, level: Level) -> Self {
        self.default_level = level;
        self
    }

    #[must_use]
    pub fn with_format(mut self, format: TracingOutputFormat) -> Self {
        self.output_format = format;
        self
    }

    #[must_use]
    pub fn with_env_filter(mut self, filter: impl Into<String>) -> Self {
        self.env_filter = Some(filter.into());
        self
    }

    /// Applies `TINYIPC_LOG_FORMAT` when it is set.
    pub fn with_format_from_env(self) -> Result<Self, TracingError> {
        match std::env::var(FORMAT_ENV) {
            Ok(value) => Ok(self.with_format(value.parse()?)),
            Err(_) => Ok(self),
        }
    }

    fn filter(&self) -> Result<EnvFilter, TracingError> {
        if let Some(directives) = &self.env_filter {
            return Ok(EnvFilter::try_new(directives)?);
        }
        Ok(EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("tinyipc={}", self.default_level))))
    }

    fn layer(&self) -> Box<dyn Layer<Registry> + Send + Sync> {
        let span_events = if self.include_span_events {
            FmtSpan::NEW | FmtSpan::CLOSE
        } else {
            FmtSpan::NONE
        };
        let base = tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_ansi(self.ansi)
            .with_file(self.include_location)
            .with_line_number(self.include_location)
            .with_target(self.include_target)
            .with_span_events(span_events);

        // `without_time` changes the layer type, hence one arm per pair
        match (self.output_format, self.include_timestamp) {
            (TracingOutputFormat::Pretty, true) => base.pretty().boxed(),
            (TracingOutputFormat::Pretty, false) => base.pretty().without_time().boxed(),
            (TracingOutputFormat::Compact, true) => base.compact().boxed(),
            (TracingOutputFormat::Compact, false) => base.compact().without_time().boxed(),
            (TracingOutputFormat::Json, true) => base.json().boxed(),
            (TracingOutputFormat::Json, false) => base.json().without_time().boxed(),
        }
    }
}

/// Installs the global subscriber. Call once, before spawning workers or
/// serving.
pub fn init_tracing(config: TracingConfig) -> Result<(), TracingError> {
    let filter = config.filter()?;
    let subscriber = tracing_subscriber::registry()
        .with(config.layer())
        .with(filter);
    tracing::subscriber::set_global_default(subscriber)?;
    Ok(())
}
