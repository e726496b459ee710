//! Error types for the ARP collector

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors that can occur while building or running the collector
#[derive(Debug, Error)]
pub enum CollectorError {
    /// Local interfaces or routing information could not be read
    #[error("Network discovery failed: {0}")]
    Discovery(String),

    /// A per-network watcher could not be built
    #[error("Failed to construct watcher for {interface}: {reason}")]
    Construction { interface: String, reason: String },

    /// A synchronous address resolution got no answer
    #[error("Lookup of {ip} failed: {reason}")]
    Lookup { ip: Ipv4Addr, reason: String },

    /// Netlink socket error
    #[error("Netlink error: {0}")]
    Netlink(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Redis connection or operation failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// Metric registration failed
    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for collector operations
pub type Result<T> = std::result::Result<T, CollectorError>;
