//! Configuration types for genproxy

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{ProxyError, Result};

/// Default proxy listen port
pub const DEFAULT_PORT: u16 = 8500;

/// Environment variable overriding the listen port
pub const PORT_ENV: &str = "ProxyPort";

/// Environment variable overriding the store address
pub const STORE_ADDRESS_ENV: &str = "RedisAddress";

/// Operating mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Capture live upstream responses into the store
    Record,
    /// Serve responses from the store
    #[default]
    Playback,
}

impl Mode {
    /// Check if mode is Record
    #[must_use]
    pub fn is_record(&self) -> bool {
        matches!(self, Mode::Record)
    }
}

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Operating mode at startup
    #[serde(default)]
    pub mode: Mode,
    /// Regular expression selecting intercepted hosts
    #[serde(default = "default_destination")]
    pub destination: String,
    /// Port the proxy listens on
    #[serde(default = "default_port")]
    pub listen_port: u16,
    /// Response store configuration
    #[serde(default)]
    pub store: StoreConfig,
    /// Deadlines for blocking operations
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Resource limits
    #[serde(default)]
    pub limits: LimitsConfig,
}

fn default_destination() -> String {
    ".".to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

/// Response store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Redis connection URL
    pub address: String,
    /// Prefix prepended to every fingerprint key
    pub prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            address: "redis://127.0.0.1:6379".to_string(),
            prefix: "genproxy:".to_string(),
        }
    }
}

/// Deadlines, in milliseconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Live upstream round-trip in record mode and on pass-through
    pub upstream_ms: u64,
    /// Each read inside a CONNECT tunnel
    pub tunnel_read_ms: u64,
    /// Establishing the upstream leg of a tunnel
    pub connect_ms: u64,
    /// Connecting to the store and each store command
    pub store_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            upstream_ms: 30_000,
            tunnel_read_ms: 60_000,
            connect_ms: 5_000,
            store_ms: 2_000,
        }
    }
}

impl TimeoutConfig {
    /// Upstream round-trip deadline
    #[must_use]
    pub fn upstream(&self) -> Duration {
        Duration::from_millis(self.upstream_ms)
    }

    /// Tunnel read deadline
    #[must_use]
    pub fn tunnel_read(&self) -> Duration {
        Duration::from_millis(self.tunnel_read_ms)
    }

    /// Tunnel connect deadline
    #[must_use]
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }

    /// Store command deadline
    #[must_use]
    pub fn store(&self) -> Duration {
        Duration::from_millis(self.store_ms)
    }
}

/// Resource limits
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum concurrent connections
    pub max_connections: usize,
    /// Maximum request size in bytes
    pub max_request_size: usize,
    /// Maximum response size in bytes
    pub max_response_size: usize,
    /// Maximum headers per request/response
    pub max_headers: usize,
    /// Maximum size of a request/response head on a tunnel
    pub max_head_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_connections: 4096,
            max_request_size: 16 * 1024 * 1024,   // 16 MB
            max_response_size: 256 * 1024 * 1024, // 256 MB
            max_headers: 128,
            max_head_size: 64 * 1024,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::default(),
            destination: default_destination(),
            listen_port: DEFAULT_PORT,
            store: StoreConfig::default(),
            timeouts: TimeoutConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    ///
    /// # Errors
    ///
    /// Returns error if file cannot be read or parsed
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to read config file: {e}")))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| ProxyError::ConfigError(format!("Failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    /// Apply `ProxyPort` and `RedisAddress` from the environment
    ///
    /// # Errors
    ///
    /// Returns error if `ProxyPort` is not a valid port
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(
            std::env::var(PORT_ENV).ok().as_deref(),
            std::env::var(STORE_ADDRESS_ENV).ok().as_deref(),
        )
    }

    fn apply_overrides(&mut self, port: Option<&str>, address: Option<&str>) -> Result<()> {
        if let Some(port) = port.filter(|p| !p.is_empty()) {
            self.listen_port = port
                .parse()
                .map_err(|e| ProxyError::ConfigError(format!("Invalid {PORT_ENV} '{port}': {e}")))?;
        }

        if let Some(address) = address.filter(|a| !a.is_empty()) {
            self.store.address = address.to_string();
        }

        Ok(())
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns error if configuration is invalid
    pub fn validate(&self) -> Result<()> {
        regex::Regex::new(&self.destination).map_err(|e| {
            ProxyError::ConfigError(format!("Invalid destination '{}': {e}", self.destination))
        })?;

        if self.listen_port == 0 {
            return Err(ProxyError::ConfigError(
                "listen_port cannot be 0".to_string(),
            ));
        }

        if self.store.address.is_empty() {
            return Err(ProxyError::ConfigError(
                "store.address cannot be empty".to_string(),
            ));
        }

        let timeouts = [
            ("timeouts.upstream_ms", self.timeouts.upstream_ms),
            ("timeouts.tunnel_read_ms", self.timeouts.tunnel_read_ms),
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.store_ms", self.timeouts.store_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ProxyError::ConfigError(format!("{name} must be > 0")));
            }
        }

        let limits = [
            ("limits.max_connections", self.limits.max_connections),
            ("limits.max_request_size", self.limits.max_request_size),
            ("limits.max_response_size", self.limits.max_response_size),
            ("limits.max_headers", self.limits.max_headers),
            ("limits.max_head_size", self.limits.max_head_size),
        ];
        for (name, value) in limits {
            if value == 0 {
                return Err(ProxyError::ConfigError(format!("{name} must be > 0")));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parse() {
        let config_toml = r#"
            mode = "record"
            destination = "example\\.com"
            listen_port = 9000

            [store]
            address = "redis://cache:6379"
            prefix = "rec:"
        "#;

        let config: Config = toml::from_str(config_toml).unwrap();
        assert_eq!(config.mode, Mode::Record);
        assert_eq!(config.destination, "example\\.com");
        assert_eq!(config.listen_port, 9000);
        assert_eq!(config.store.prefix, "rec:");
        assert_eq!(config.timeouts.upstream_ms, 30_000);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.mode, Mode::Playback);
        assert_eq!(config.destination, ".");
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_from_file() {
        let mut file = NamedTempFile::new().unwrap();
        let config_toml = r#"
            mode = "playback"

            [timeouts]
            upstream_ms = 1000
            tunnel_read_ms = 2000
            connect_ms = 500
        "#;
        file.write_all(config_toml.as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.mode, Mode::Playback);
        assert_eq!(config.timeouts.tunnel_read(), Duration::from_secs(2));
    }

    #[test]
    fn test_partial_sections_keep_defaults() {
        let config: Config = toml::from_str(
            "[store]\nprefix = \"rec:\"\n\n[timeouts]\nupstream_ms = 750\n\n[limits]\nmax_headers = 32\n",
        )
        .unwrap();

        assert_eq!(config.store.prefix, "rec:");
        assert_eq!(config.store.address, StoreConfig::default().address);
        assert_eq!(config.timeouts.upstream_ms, 750);
        assert_eq!(config.timeouts.store(), Duration::from_secs(2));
        assert_eq!(config.limits.max_headers, 32);
        assert_eq!(config.limits.max_head_size, 64 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_destination_regex() {
        let config = Config {
            destination: "([a-z".to_string(),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let mut config = Config::default();
        config.timeouts.upstream_ms = 0;
        assert!(config.validate().is_err());

        let mut config = Config::default();
        config.timeouts.store_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = Config::default();
        config
            .apply_overrides(Some("9100"), Some("redis://other:6380"))
            .unwrap();
        assert_eq!(config.listen_port, 9100);
        assert_eq!(config.store.address, "redis://other:6380");

        assert!(config.apply_overrides(Some("not-a-port"), None).is_err());
    }

    #[test]
    fn test_empty_env_values_ignored() {
        let mut config = Config::default();
        config.apply_overrides(Some(""), Some("")).unwrap();
        assert_eq!(config.listen_port, DEFAULT_PORT);
        assert_eq!(config.store.address, StoreConfig::default().address);
    }
}
