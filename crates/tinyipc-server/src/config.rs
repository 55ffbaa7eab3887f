//! Server configuration.

use std::time::Duration;

use crate::error::{ServerError, ServerResult};

/// Server configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of requests handled concurrently.
    pub max_in_flight: usize,

    /// How long in-flight handlers may run once the server stops.
    pub drain_timeout: Duration,

    /// Whether SIGTERM/SIGINT stop the server.
    pub handle_signals: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_in_flight: 64,
            drain_timeout: Duration::from_secs(5),
            handle_signals: false,
        }
    }
}

impl ServerConfig {
    /// Builder: set the concurrent request limit.
    pub fn with_max_in_flight(mut self, max: usize) -> Self {
        self.max_in_flight = max;
        self
    }

    /// Builder: set the drain timeout.
    pub fn with_drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout = timeout;
        self
    }

    /// Builder: enable stopping on SIGTERM/SIGINT.
    pub fn with_handle_signals(mut self, handle: bool) -> Self {
        self.handle_signals = handle;
        self
    }

    /// Checks the configuration before serving.
    pub fn validate(&self) -> ServerResult<()> {
        if self.max_in_flight == 0 {
            return Err(ServerError::config("max_in_flight must be at least 1"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.max_in_flight, 64);
        assert_eq!(config.drain_timeout, Duration::from_secs(5));
        assert!(!config.handle_signals);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn custom_config() {
        let config = ServerConfig::default()
            .with_max_in_flight(4)
            .with_drain_timeout(Duration::from_millis(250))
            .with_handle_signals(true);

        assert_eq!(config.max_in_flight, 4);
        assert_eq!(config.drain_timeout, Duration::from_millis(250));
        assert!(config.handle_signals);
    }

    #[test]
    fn zero_in_flight_is_rejected() {
        let err = ServerConfig::default()
            .with_max_in_flight(0)
            .validate()
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Configuration error: max_in_flight must be at least 1"
        );
    }
}
