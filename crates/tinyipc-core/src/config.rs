//! Client and launch configuration.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Timeout applied to calls that do not pass one. `None` waits forever.
    pub default_timeout: Option<Duration>,

    /// Maximum number of calls in flight at once.
    pub max_in_flight: usize,

    /// How long the worker gets to exit on close before it is killed.
    pub shutdown_grace: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_timeout: Some(Duration::from_secs(30)),
            max_in_flight: 16,
            shutdown_grace: Duration::from_millis(500),
        }
    }
}

impl ClientConfig {
    /// Builder: set the default call timeout.
    pub fn with_default_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Builder: set the in-flight call limit (at least 1).
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max.max(1);
        self
    }

    /// Builder: set the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }
}

/// What happens to a worker's stderr.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StderrMode {
    /// Share the host's stderr.
    Inherit,
    /// Read it line by line and emit each line as a tracing event.
    #[default]
    Forward,
    /// Discard it.
    Discard,
}

/// Everything needed to start a worker process.
///
/// The command line is opaque to tinyipc: interpreters, packaging and similar
/// details belong to whoever builds the launch spec.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments.
    pub args: Vec<OsString>,
    /// Extra environment variables.
    pub env: Vec<(OsString, OsString)>,
    /// Working directory, or the host's when unset.
    pub working_dir: Option<PathBuf>,
    /// Stderr handling.
    pub stderr: StderrMode,
}

impl LaunchSpec {
    /// Creates a launch spec for `program` with no arguments.
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            working_dir: None,
            stderr: StderrMode::default(),
        }
    }

    /// Builder: append one argument.
    pub fn with_arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Builder: append arguments.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Builder: set an environment variable.
    pub fn with_env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Builder: set environment variables.
    pub fn with_envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Builder: set the working directory.
    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Builder: set stderr handling.
    pub fn with_stderr(mut self, mode: StderrMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Returns the program path.
    pub fn program(&self) -> &Path {
        &self.program
    }
}
