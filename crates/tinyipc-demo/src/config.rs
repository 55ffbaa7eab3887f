//! Demo parent configuration.
//!
//! An optional TOML file with two tables:
//!
//! ```toml
//! [worker]
//! program = "/usr/local/bin/tinyipc-worker"
//! args = ["--quiet"]
//! stderr = "forward"
//!
//! [worker.env]
//! RUST_LOG = "debug"
//!
//! [client]
//! timeout_ms = 2000
//! max_in_flight = 16
//! shutdown_grace_ms = 500
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tinyipc_core::{ClientConfig, LaunchSpec, StderrMode};

use crate::error::{DemoError, DemoResult};

/// Configuration for the demo parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// How to launch the worker.
    pub worker: WorkerSettings,

    /// Call behavior.
    pub client: ClientSettings,
}

/// Worker launch settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerSettings {
    /// Worker executable.
    pub program: Option<PathBuf>,

    /// Extra arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Working directory.
    pub working_dir: Option<PathBuf>,

    /// What to do with the worker's stderr.
    pub stderr: StderrSetting,
}

/// Worker stderr handling as written in the config file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StderrSetting {
    Inherit,
    #[default]
    Forward,
    Discard,
}

impl From<StderrSetting> for StderrMode {
    fn from(setting: StderrSetting) -> Self {
        match setting {
            StderrSetting::Inherit => StderrMode::Inherit,
            StderrSetting::Forward => StderrMode::Forward,
            StderrSetting::Discard => StderrMode::Discard,
        }
    }
}

/// Client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    /// Default call timeout in milliseconds; 0 waits forever.
    pub timeout_ms: u64,

    /// Maximum number of calls in flight.
    pub max_in_flight: usize,

    /// Grace period for the worker to exit on close, in milliseconds.
    pub shutdown_grace_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        let defaults = ClientConfig::default();
        Self {
            timeout_ms: defaults
                .default_timeout
                .map_or(0, |t| t.as_millis() as u64),
            max_in_flight: defaults.max_in_flight,
            shutdown_grace_ms: defaults.shutdown_grace.as_millis() as u64,
        }
    }
}

impl DemoConfig {
    /// Loads configuration from a specific path.
    pub fn load_from(path: &Path) -> DemoResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            DemoError::Config(format!("failed to read {}: {e}", path.display()))
        })?;
        Self::parse(&content)
    }

    /// Parses configuration from TOML text.
    pub fn parse(content: &str) -> DemoResult<Self> {
        toml::from_str(content).map_err(|e| DemoError::Config(format!("failed to parse config: {e}")))
    }

    /// Builds the client configuration, with `timeout_ms` overriding the
    /// configured default timeout.
    pub fn client_config(&self, timeout_ms: Option<u64>) -> ClientConfig {
        let timeout = match timeout_ms.unwrap_or(self.client.timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        };
        ClientConfig::default()
            .with_default_timeout(timeout)
            .with_max_in_flight(self.client.max_in_flight)
            .with_shutdown_grace(Duration::from_millis(self.client.shutdown_grace_ms))
    }

    /// Builds the launch spec. `program` wins over the configured one; when
    /// neither is set, `fallback` is used.
    pub fn launch_spec(
        &self,
        program: Option<&Path>,
        fallback: impl FnOnce() -> DemoResult<PathBuf>,
    ) -> DemoResult<LaunchSpec> {
        let program = match program.or(self.worker.program.as_deref()) {
            Some(program) => program.to_path_buf(),
            None => fallback()?,
        };

        let mut spec = LaunchSpec::new(program)
            .with_args(&self.worker.args)
            .with_envs(&self.worker.env)
            .with_stderr(self.worker.stderr.into());
        if let Some(dir) = &self.worker.working_dir {
            spec = spec.with_working_dir(dir);
        }
        Ok(spec)
    }
}

/// Returns the path of a sibling binary of the running executable.
pub fn sibling_binary(name: &str) -> DemoResult<PathBuf> {
    let exe = std::env::current_exe()?;
    Ok(exe.with_file_name(format!("{name}{}", std::env::consts::EXE_SUFFIX)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsString;
    use std::io::Write;

    fn no_fallback() -> DemoResult<PathBuf> {
        Err(DemoError::Config("no worker".into()))
    }

    #[test]
    fn defaults_match_client_defaults() {
        let config = DemoConfig::default();
        let client = config.client_config(None);
        assert_eq!(client.default_timeout, Some(Duration::from_secs(30)));
        assert_eq!(client.max_in_flight, 16);
        assert_eq!(client.shutdown_grace, Duration::from_millis(500));
        assert_eq!(config.worker.stderr, StderrSetting::Forward);
    }

    #[test]
    fn parse_full_config() {
        let config = DemoConfig::parse(
            r#"
            [worker]
            program = "/opt/worker"
            args = ["--quiet", "-x"]
            stderr = "discard"
            working_dir = "/tmp"

            [worker.env]
            RUST_LOG = "debug"

            [client]
            timeout_ms = 0
            max_in_flight = 4
            "#,
        )
        .unwrap();

        let client = config.client_config(None);
        assert_eq!(client.default_timeout, None);
        assert_eq!(client.max_in_flight, 4);
        assert_eq!(client.shutdown_grace, Duration::from_millis(500));

        let spec = config.launch_spec(None, no_fallback).unwrap();
        assert_eq!(spec.program(), Path::new("/opt/worker"));
        assert_eq!(spec.args, vec![OsString::from("--quiet"), OsString::from("-x")]);
        assert_eq!(
            spec.env,
            vec![(OsString::from("RUST_LOG"), OsString::from("debug"))]
        );
        assert_eq!(spec.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(spec.stderr, StderrMode::Discard);
    }

    #[test]
    fn command_line_overrides() {
        let config = DemoConfig::parse("[worker]\nprogram = \"/opt/worker\"\n").unwrap();
        let spec = config
            .launch_spec(Some(Path::new("/usr/bin/other")), no_fallback)
            .unwrap();
        assert_eq!(spec.program(), Path::new("/usr/bin/other"));

        let client = config.client_config(Some(250));
        assert_eq!(client.default_timeout, Some(Duration::from_millis(250)));
    }

    #[test]
    fn fallback_program() {
        let config = DemoConfig::default();
        let spec = config
            .launch_spec(None, || Ok(PathBuf::from("/fallback")))
            .unwrap();
        assert_eq!(spec.program(), Path::new("/fallback"));
        assert!(config.launch_spec(None, no_fallback).is_err());
    }

    #[test]
    fn load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[client]\nmax_in_flight = 2").unwrap();

        let config = DemoConfig::load_from(file.path()).unwrap();
        assert_eq!(config.client.max_in_flight, 2);
    }

    #[test]
    fn invalid_config_is_reported() {
        let err = DemoConfig::parse("[client]\nmax_in_flight = \"many\"").unwrap_err();
        assert!(err.to_string().starts_with("configuration error: failed to parse config"));

        let err = DemoConfig::load_from(Path::new("/nonexistent/tinyipc.toml")).unwrap_err();
        assert!(matches!(err, DemoError::Config(_)));
    }
}
