//! Configuration file support for arpcollectord
//!
//! Loads and validates the collector configuration from a TOML file.
//! Default location: /etc/arpcollector/arpcollectord.toml

use crate::error::{CollectorError, Result};
use arp_types::Ipv4Network;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

/// Default configuration file location
pub const DEFAULT_CONFIG_PATH: &str = "/etc/arpcollector/arpcollectord.toml";

/// Reference capacity of the intake and output channels
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Neighbor discovery configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArpConfig {
    /// Subnets to monitor; empty means every local network
    #[serde(default)]
    pub subnets: Vec<Ipv4Network>,

    /// Interval between reprobes of known neighbors
    #[serde(default = "default_probe_interval")]
    pub probe_interval_secs: u64,

    /// Interval between probes of every address of a network
    #[serde(default = "default_full_scan_interval")]
    pub full_scan_interval_secs: u64,

    /// Time without confirmation after which a neighbor is offline
    #[serde(default = "default_offline_deadline")]
    pub offline_deadline_secs: u64,

    /// Log every watcher event at debug level
    #[serde(default)]
    pub verbose: bool,

    /// Capacity of the intake and output channels
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

/// Redis cache writer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RedisConfig {
    #[serde(default = "default_redis_host")]
    pub host: String,

    #[serde(default = "default_redis_port")]
    pub port: u16,

    #[serde(default)]
    pub db: i64,

    /// Prefix of every cache key, e.g. "arc:192.168.1.10"
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Expiry of dynamic entries in seconds
    #[serde(default = "default_dynamic_ttl")]
    pub dynamic_ttl_secs: u64,
}

/// Complete arpcollectord configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectordConfig {
    #[serde(default)]
    pub arp: ArpConfig,

    #[serde(default)]
    pub redis: RedisConfig,
}

fn default_probe_interval() -> u64 {
    60
}

fn default_full_scan_interval() -> u64 {
    600
}

fn default_offline_deadline() -> u64 {
    300
}

fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}

fn default_redis_host() -> String {
    "127.0.0.1".to_string()
}

fn default_redis_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "arc".to_string()
}

fn default_dynamic_ttl() -> u64 {
    600
}

impl Default for ArpConfig {
    fn default() -> Self {
        Self {
            subnets: Vec::new(),
            probe_interval_secs: default_probe_interval(),
            full_scan_interval_secs: default_full_scan_interval(),
            offline_deadline_secs: default_offline_deadline(),
            verbose: false,
            channel_capacity: default_channel_capacity(),
        }
    }
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: default_redis_host(),
            port: default_redis_port(),
            db: 0,
            key_prefix: default_key_prefix(),
            dynamic_ttl_secs: default_dynamic_ttl(),
        }
    }
}

impl ArpConfig {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_secs(self.probe_interval_secs)
    }

    pub fn full_scan_interval(&self) -> Duration {
        Duration::from_secs(self.full_scan_interval_secs)
    }

    pub fn offline_deadline(&self) -> Duration {
        Duration::from_secs(self.offline_deadline_secs)
    }

    /// Validate discovery settings
    pub fn validate(&self) -> Result<()> {
        if self.channel_capacity == 0 {
            return Err(CollectorError::Config(
                "channel_capacity must be > 0".to_string(),
            ));
        }

        if self.probe_interval_secs == 0 || self.full_scan_interval_secs == 0 {
            return Err(CollectorError::Config(
                "probe and full scan intervals must be > 0".to_string(),
            ));
        }

        if self.offline_deadline_secs < self.probe_interval_secs {
            return Err(CollectorError::Config(format!(
                "offline_deadline_secs ({}) must be >= probe_interval_secs ({})",
                self.offline_deadline_secs, self.probe_interval_secs
            )));
        }

        Ok(())
    }
}

impl RedisConfig {
    pub fn url(&self) -> String {
        format!("redis://{}:{}/{}", self.host, self.port, self.db)
    }
}

impl CollectordConfig {
    /// Load configuration from file, falling back to defaults if file not found
    pub fn load_or_default(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        match fs::read_to_string(path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                CollectorError::Config(format!(
                    "Failed to parse config file {}: {}",
                    path.display(),
                    e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(CollectorError::Io(e)),
        }
    }

    /// Validate the whole configuration
    pub fn validate(&self) -> Result<()> {
        self.arp.validate()?;

        if self.redis.port == 0 {
            return Err(CollectorError::Config("redis port must be > 0".to_string()));
        }

        if self.redis.key_prefix.is_empty() {
            return Err(CollectorError::Config(
                "redis key_prefix must not be empty".to_string(),
            ));
        }

        // Online neighbors are renewed at most once per probe interval
        if self.redis.dynamic_ttl_secs <= self.arp.probe_interval_secs {
            return Err(CollectorError::Config(format!(
                "redis dynamic_ttl_secs ({}) must be > arp probe_interval_secs ({})",
                self.redis.dynamic_ttl_secs, self.arp.probe_interval_secs
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = CollectordConfig::default();
        assert!(config.arp.subnets.is_empty());
        assert_eq!(config.arp.channel_capacity, 256);
        assert_eq!(config.arp.probe_interval(), Duration::from_secs(60));
        assert_eq!(config.redis.url(), "redis://127.0.0.1:6379/0");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_toml_deserialization() {
        let toml_str = r#"
[arp]
subnets = ["192.168.1.0/24", "10.0.0.0/8"]
verbose = true

[redis]
host = "cache.local"
dynamic_ttl_secs = 120
"#;
        let config: CollectordConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.arp.subnets.len(), 2);
        assert_eq!(config.arp.subnets[0].to_string(), "192.168.1.0/24");
        assert!(config.arp.verbose);
        assert_eq!(config.redis.host, "cache.local");
        assert_eq!(config.redis.dynamic_ttl_secs, 120);
        // Unspecified values should use defaults
        assert_eq!(config.arp.offline_deadline_secs, 300);
        assert_eq!(config.redis.key_prefix, "arc");
    }

    #[test]
    fn test_invalid_subnet_rejected() {
        let toml_str = r#"
[arp]
subnets = ["192.168.1.0"]
"#;
        assert!(toml::from_str::<CollectordConfig>(toml_str).is_err());
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let mut config = CollectordConfig::default();
        config.arp.channel_capacity = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_short_deadline() {
        let mut config = CollectordConfig::default();
        config.arp.offline_deadline_secs = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_ttl_within_probe_interval() {
        let mut config = CollectordConfig::default();
        config.redis.dynamic_ttl_secs = config.arp.probe_interval_secs;
        let err = config.validate().unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));

        config.redis.dynamic_ttl_secs = config.arp.probe_interval_secs + 1;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_nonexistent_file_defaults() {
        let config = CollectordConfig::load_or_default("/nonexistent/arpcollectord.toml").unwrap();
        assert_eq!(config, CollectordConfig::default());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[redis]\nport = 6380").unwrap();

        let config = CollectordConfig::load_or_default(file.path()).unwrap();
        assert_eq!(config.redis.port, 6380);
    }

    #[test]
    fn test_load_malformed_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[arp\nsubnets = ").unwrap();

        let err = CollectordConfig::load_or_default(file.path()).unwrap_err();
        assert!(matches!(err, CollectorError::Config(_)));
    }
}
