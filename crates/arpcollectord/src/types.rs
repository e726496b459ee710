//! Core types shared by the collector, its watchers and the cache writer

use arp_types::{Ipv4Network, MacAddress};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;

/// Most IP observations a watcher keeps per MAC address
pub const MAX_IPS_PER_MAC: usize = 4;

/// Local interface a network was discovered on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceInfo {
    /// Interface name (e.g. "eth0")
    pub name: String,
    /// Kernel interface index
    pub index: u32,
    /// Hardware address of the interface
    pub mac: MacAddress,
}

/// One local IPv4 network: interface, own address with prefix, and gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetworkTuple {
    pub interface: InterfaceInfo,
    /// Host address on this network together with its prefix length
    pub network: Ipv4Network,
    /// Default gateway reachable through this interface, when known
    pub gateway: Option<Ipv4Addr>,
}

impl NetworkTuple {
    /// Host's own IPv4 address on this network
    pub fn host_ip(&self) -> Ipv4Addr {
        self.network.address()
    }
}

/// A single IP address seen for a MAC and when it was last confirmed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpObservation {
    pub ip: Ipv4Addr,
    pub last_updated: DateTime<Utc>,
}

/// Snapshot of one neighbor as reported by a watcher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub mac: MacAddress,
    /// Newest observation first
    pub ips: Vec<IpObservation>,
    pub online: bool,
}

impl NeighborEntry {
    /// Entry with a single observation stamped now
    pub fn observed(mac: MacAddress, ip: Ipv4Addr, online: bool) -> Self {
        Self {
            mac,
            ips: vec![IpObservation {
                ip,
                last_updated: Utc::now(),
            }],
            online,
        }
    }

    /// Records `ip` as the most recent address of this MAC.
    ///
    /// An existing observation of the same address is refreshed and moved to
    /// the front; the oldest observation is evicted past [`MAX_IPS_PER_MAC`].
    pub fn touch(&mut self, ip: Ipv4Addr, at: DateTime<Utc>) {
        self.ips.retain(|obs| obs.ip != ip);
        self.ips.insert(0, IpObservation { ip, last_updated: at });
        self.ips.truncate(MAX_IPS_PER_MAC);
    }

    pub fn has_ip(&self, ip: Ipv4Addr) -> bool {
        self.ips.iter().any(|obs| obs.ip == ip)
    }
}

/// Unit of output handed to the cache writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheMessage {
    pub entry: NeighborEntry,
    /// Seeded once at startup (self or gateway) and never expired downstream
    #[serde(rename = "static")]
    pub is_static: bool,
}

impl CacheMessage {
    pub fn dynamic(entry: NeighborEntry) -> Self {
        Self {
            entry,
            is_static: false,
        }
    }

    pub fn fixed(entry: NeighborEntry) -> Self {
        Self {
            entry,
            is_static: true,
        }
    }
}
