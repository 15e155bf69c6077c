// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Downstream node configuration.

use crate::types::{FeedType, ServiceAddr, DEFAULT_PORT};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Downstream node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownstreamConfig {
    /// Upstream server (`host:port`)
    #[serde(default = "default_server")]
    pub server: ServiceAddr,

    /// Feed to subscribe to
    #[serde(default)]
    pub feed: FeedType,

    /// Directory holding the session memory files
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,

    /// Product store database
    #[serde(default = "default_product_db")]
    pub product_db: PathBuf,

    /// Local interface for joining multicast groups
    #[serde(default = "default_mcast_interface")]
    pub mcast_interface: Ipv4Addr,

    /// Sleep between sessions (seconds)
    #[serde(default = "default_retry_interval")]
    pub retry_interval_secs: u64,

    /// TCP connect timeout (seconds)
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Timeout of the subscription reply (seconds)
    #[serde(default = "default_rpc_timeout")]
    pub rpc_timeout_secs: u64,

    /// Backlog lower bound when the previous session left no signature
    #[serde(default = "default_backlog_time_offset")]
    pub backlog_time_offset_secs: u32,

    /// Maximum RPC message size (bytes)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Maximum product size accepted by the store (0 = unlimited)
    #[serde(default)]
    pub max_product_size: u64,

    /// Default log filter
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_server() -> ServiceAddr {
    ServiceAddr::new("localhost", DEFAULT_PORT)
}

fn default_session_dir() -> PathBuf {
    PathBuf::from("sessions")
}

fn default_product_db() -> PathBuf {
    PathBuf::from("products.sqlite")
}

fn default_mcast_interface() -> Ipv4Addr {
    Ipv4Addr::UNSPECIFIED
}

fn default_retry_interval() -> u64 {
    60
}

fn default_connect_timeout() -> u64 {
    30
}

fn default_rpc_timeout() -> u64 {
    25
}

fn default_backlog_time_offset() -> u32 {
    3600
}

fn default_max_message_size() -> usize {
    64 * 1024 * 1024 // 64 MB
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for DownstreamConfig {
    fn default() -> Self {
        Self {
            server: default_server(),
            feed: FeedType::default(),
            session_dir: default_session_dir(),
            product_db: default_product_db(),
            mcast_interface: default_mcast_interface(),
            retry_interval_secs: default_retry_interval(),
            connect_timeout_secs: default_connect_timeout(),
            rpc_timeout_secs: default_rpc_timeout(),
            backlog_time_offset_secs: default_backlog_time_offset(),
            max_message_size: default_max_message_size(),
            max_product_size: 0,
            log_level: default_log_level(),
        }
    }
}

impl DownstreamConfig {
    /// Create a new config builder
    pub fn builder() -> DownstreamConfigBuilder {
        DownstreamConfigBuilder::default()
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a TOML file.
    pub fn to_file(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    pub fn retry_interval(&self) -> Duration {
        Duration::from_secs(self.retry_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn rpc_timeout(&self) -> Duration {
        Duration::from_secs(self.rpc_timeout_secs)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.host.is_empty() {
            return Err(ConfigError::InvalidValue("server host cannot be empty".into()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue("server port cannot be 0".into()));
        }
        if self.feed == FeedType::NONE {
            return Err(ConfigError::InvalidValue("feed cannot be empty".into()));
        }
        if self.retry_interval_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "retry_interval_secs cannot be 0".into(),
            ));
        }
        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue(
                "connect_timeout_secs cannot be 0".into(),
            ));
        }
        if self.rpc_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue("rpc_timeout_secs cannot be 0".into()));
        }
        if self.max_message_size < 1024 {
            return Err(ConfigError::InvalidValue(
                "max_message_size must be at least 1024".into(),
            ));
        }
        Ok(())
    }
}

/// Builder for [`DownstreamConfig`]; unset fields keep their defaults.
#[derive(Debug, Default)]
pub struct DownstreamConfigBuilder {
    config: DownstreamConfig,
}

impl DownstreamConfigBuilder {
    pub fn server(mut self, server: ServiceAddr) -> Self {
        self.config.server = server;
        self
    }

    pub fn feed(mut self, feed: FeedType) -> Self {
        self.config.feed = feed;
        self
    }

    pub fn session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.session_dir = dir.into();
        self
    }

    pub fn product_db(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.product_db = path.into();
        self
    }

    pub fn mcast_interface(mut self, interface: Ipv4Addr) -> Self {
        self.config.mcast_interface = interface;
        self
    }

    /// Set the sleep between sessions in seconds
    pub fn retry_interval_secs(mut self, secs: u64) -> Self {
        self.config.retry_interval_secs = secs;
        self
    }

    pub fn connect_timeout_secs(mut self, secs: u64) -> Self {
        self.config.connect_timeout_secs = secs;
        self
    }

    pub fn rpc_timeout_secs(mut self, secs: u64) -> Self {
        self.config.rpc_timeout_secs = secs;
        self
    }

    pub fn backlog_time_offset_secs(mut self, secs: u32) -> Self {
        self.config.backlog_time_offset_secs = secs;
        self
    }

    pub fn max_message_size(mut self, size: usize) -> Self {
        self.config.max_message_size = size;
        self
    }

    pub fn max_product_size(mut self, size: u64) -> Self {
        self.config.max_product_size = size;
        self
    }

    pub fn log_level(mut self, level: impl Into<String>) -> Self {
        self.config.log_level = level.into();
        self
    }

    /// Build and validate the configuration.
    pub fn build(self) -> Result<DownstreamConfig, ConfigError> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Configuration error types.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Serialize error: {0}")]
    Serialize(String),

    #[error("Invalid value: {0}")]
    InvalidValue(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DownstreamConfig::default();
        assert_eq!(config.server.port, DEFAULT_PORT);
        assert_eq!(config.feed, FeedType::ANY);
        assert_eq!(config.retry_interval(), Duration::from_secs(60));
        assert_eq!(config.max_product_size, 0);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_with_defaults() {
        let config: DownstreamConfig = toml::from_str(
            r#"
            server = "upstream.example.com:4000"
            feed = "0x10"
            retry_interval_secs = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.server, ServiceAddr::new("upstream.example.com", 4000));
        assert_eq!(config.feed, FeedType(16));
        assert_eq!(config.retry_interval_secs, 5);
        assert_eq!(config.rpc_timeout_secs, 25);
        assert_eq!(config.backlog_time_offset_secs, 3600);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("downstream.toml");

        let config = DownstreamConfig::builder()
            .server(ServiceAddr::new("10.0.0.1", 5000))
            .feed(FeedType(3))
            .retry_interval_secs(7)
            .build()
            .unwrap();
        config.to_file(&path).unwrap();

        let loaded = DownstreamConfig::from_file(&path).unwrap();
        assert_eq!(loaded.server, config.server);
        assert_eq!(loaded.feed, FeedType(3));
        assert_eq!(loaded.retry_interval_secs, 7);
    }

    #[test]
    fn test_validation() {
        assert!(DownstreamConfig::builder().feed(FeedType::NONE).build().is_err());
        assert!(DownstreamConfig::builder()
            .connect_timeout_secs(0)
            .build()
            .is_err());
        assert!(DownstreamConfig::builder().max_message_size(10).build().is_err());
    }

    #[test]
    fn test_zero_retry_interval_rejected() {
        let err = DownstreamConfig::builder().retry_interval_secs(0).build();
        assert!(matches!(err, Err(ConfigError::InvalidValue(_))));

        let parsed: DownstreamConfig = toml::from_str("retry_interval_secs = 0").unwrap();
        assert!(parsed.validate().is_err());
    }

    #[test]
    fn test_missing_file() {
        let err = DownstreamConfig::from_file(Path::new("/nonexistent/downstream.toml"));
        assert!(matches!(err, Err(ConfigError::Io(_))));
    }
}
