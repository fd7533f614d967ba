use std::{fs, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{
    error::{Error, Result},
    poll::DEFAULT_EVENTS_CAPACITY,
    thread_pool::DEFAULT_POOL_CAPACITY,
};

pub const DEFAULT_PORT: u16 = 12345;

/// Server startup configuration.
///
/// Read from a JSON object such as `{"port": 12345, "num_threads": 4}`. Every field is
/// optional; missing ones take their defaults. Use [`ServerConfig::builder`] to build one in
/// code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Port bound on `0.0.0.0`
    pub port: u16,
    /// Worker threads running `process()`
    pub num_threads: usize,
    /// Hard limit on concurrent connections (None for unlimited)
    pub max_connections: Option<usize>,
    /// Events fetched per `wait()`
    pub events_capacity: usize,
    /// `wait()` timeout; None blocks until an event or a stop request
    pub poll_timeout_ms: Option<u64>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            num_threads: DEFAULT_POOL_CAPACITY,
            max_connections: None,
            events_capacity: DEFAULT_EVENTS_CAPACITY,
            poll_timeout_ms: None,
        }
    }
}

impl ServerConfig {
    pub fn builder() -> ServerConfigBuilder {
        ServerConfigBuilder::new()
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Loads `path`, falling back to the defaults when the file is missing or unusable.
    pub fn load_or_default(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match Self::load(path) {
            Ok(config) => {
                info!(
                    "Loaded {}(port={}, num_threads={}).",
                    path.display(),
                    config.port,
                    config.num_threads
                );
                config
            }
            Err(e) => {
                let config = Self::default();
                info!(
                    "Failed to load {} ({e}), using default values(port={}, num_threads={}).",
                    path.display(),
                    config.port,
                    config.num_threads
                );
                config
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.num_threads == 0 {
            return Err(Error::Config("num_threads must be at least 1".into()));
        }
        if self.events_capacity == 0 {
            return Err(Error::Config("events_capacity must be at least 1".into()));
        }
        Ok(())
    }

    pub fn poll_timeout(&self) -> Option<Duration> {
        self.poll_timeout_ms.map(Duration::from_millis)
    }
}

/// Builder for [`ServerConfig`]. Unset fields use the defaults.
#[derive(Default)]
pub struct ServerConfigBuilder {
    port: Option<u16>,
    num_threads: Option<usize>,
    max_connections: Option<usize>,
    events_capacity: Option<usize>,
    poll_timeout: Option<Duration>,
}

impl ServerConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = Some(num_threads);
        self
    }

    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    pub fn events_capacity(mut self, capacity: usize) -> Self {
        self.events_capacity = Some(capacity);
        self
    }

    pub fn poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout = Some(timeout);
        self
    }

    pub fn build(self) -> ServerConfig {
        let default = ServerConfig::default();
        ServerConfig {
            port: self.port.unwrap_or(default.port),
            num_threads: self.num_threads.unwrap_or(default.num_threads),
            max_connections: self.max_connections.or(default.max_connections),
            events_capacity: self.events_capacity.unwrap_or(default.events_capacity),
            poll_timeout_ms: self
                .poll_timeout
                .map(|t| t.as_millis() as u64)
                .or(default.poll_timeout_ms),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = ServerConfig::default();
        assert_eq!(config.port, 12345);
        assert_eq!(config.num_threads, 4);
        assert_eq!(config.poll_timeout(), None);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = ServerConfig::from_json(r#"{"port": 8080}"#).unwrap();
        assert_eq!(config.port, 8080);
        assert_eq!(config.num_threads, 4);
    }

    #[test]
    fn test_full_json() {
        let config = ServerConfig::from_json(
            r#"{"port": 9000, "num_threads": 8, "max_connections": 100, "poll_timeout_ms": 50}"#,
        )
        .unwrap();
        assert_eq!(config.num_threads, 8);
        assert_eq!(config.max_connections, Some(100));
        assert_eq!(config.poll_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_rejects_zero_threads() {
        assert!(matches!(
            ServerConfig::from_json(r#"{"num_threads": 0}"#),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_load_or_default_on_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{ not json").unwrap();
        assert_eq!(
            ServerConfig::load_or_default(file.path()),
            ServerConfig::default()
        );
    }

    #[test]
    fn test_load_or_default_on_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let config = ServerConfig::load_or_default(dir.path().join("echo_server.json"));
        assert_eq!(config, ServerConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(br#"{"port": 4242, "num_threads": 2}"#).unwrap();
        let config = ServerConfig::load(file.path()).unwrap();
        assert_eq!((config.port, config.num_threads), (4242, 2));
    }

    #[test]
    fn test_builder() {
        let config = ServerConfig::builder()
            .port(0)
            .num_threads(2)
            .max_connections(10)
            .poll_timeout(Duration::from_millis(20))
            .build();
        assert_eq!(config.port, 0);
        assert_eq!(config.num_threads, 2);
        assert_eq!(config.max_connections, Some(10));
        assert_eq!(config.poll_timeout_ms, Some(20));
        assert_eq!(config.events_capacity, DEFAULT_EVENTS_CAPACITY);
    }
}
