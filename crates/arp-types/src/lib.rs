//! Common types for the ARP collector.
//!
//! - [`MacAddress`]: 48-bit Ethernet hardware addresses
//! - [`Ipv4Network`]: an IPv4 host address together with its prefix length

mod mac;
mod network;

pub use mac::MacAddress;
pub use network::{Ipv4Network, MAX_SCAN_HOSTS};

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IPv4 address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IPv4 network format: {0}")]
    InvalidNetwork(String),
}
