//! Local network discovery
//!
//! Lists every non-loopback IPv4 network of the host together with its
//! default gateway, optionally restricted to an allow-list of subnets.

use crate::error::{CollectorError, Result};
use crate::types::{InterfaceInfo, NetworkTuple};
use arp_types::{Ipv4Network, MacAddress};
use std::fs;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use tracing::{debug, instrument};

/// Kernel IPv4 routing table
const PROC_NET_ROUTE: &str = "/proc/net/route";

/// Source of the networks the collector should watch
#[cfg_attr(test, mockall::automock)]
pub trait NetworkEnumerator: Send + Sync {
    /// Returns one tuple per matching local IPv4 network, in interface order.
    ///
    /// An empty `filters` slice selects every network.
    ///
    /// # Errors
    ///
    /// Returns [`CollectorError::Discovery`] when interface or routing
    /// information cannot be read.
    fn discover(&self, filters: &[Ipv4Network]) -> Result<Vec<NetworkTuple>>;
}

/// IPv4 address assigned to a local interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalAddress {
    pub interface: InterfaceInfo,
    pub network: Ipv4Network,
}

/// Enumerator backed by `getifaddrs` and the kernel routing table
#[derive(Debug, Clone)]
pub struct SystemNetworkEnumerator {
    route_table: PathBuf,
}

impl Default for SystemNetworkEnumerator {
    fn default() -> Self {
        Self {
            route_table: PathBuf::from(PROC_NET_ROUTE),
        }
    }
}

impl SystemNetworkEnumerator {
    /// Reads gateways from `route_table` instead of `/proc/net/route`
    pub fn with_route_table(route_table: impl Into<PathBuf>) -> Self {
        Self {
            route_table: route_table.into(),
        }
    }
}

impl NetworkEnumerator for SystemNetworkEnumerator {
    #[instrument(skip(self))]
    fn discover(&self, filters: &[Ipv4Network]) -> Result<Vec<NetworkTuple>> {
        let addresses = local_addresses()?;
        let routes = fs::read_to_string(&self.route_table).map_err(|e| {
            CollectorError::Discovery(format!(
                "Failed to read {}: {}",
                self.route_table.display(),
                e
            ))
        })?;

        let networks = select_networks(addresses, filters, &routes);
        debug!(count = networks.len(), "Discovered local networks");
        Ok(networks)
    }
}

/// Applies the subnet filter and attaches each interface's gateway
pub fn select_networks(
    addresses: Vec<LocalAddress>,
    filters: &[Ipv4Network],
    route_table: &str,
) -> Vec<NetworkTuple> {
    addresses
        .into_iter()
        .filter(|addr| {
            let keep = !addr.network.address().is_loopback()
                && (filters.is_empty() || filters.iter().any(|f| f.contains(addr.network.address())));
            if !keep {
                debug!(
                    interface = %addr.interface.name,
                    network = %addr.network,
                    "Network excluded"
                );
            }
            keep
        })
        .map(|addr| {
            let gateway = parse_default_gateway(route_table, &addr.interface.name);
            NetworkTuple {
                interface: addr.interface,
                network: addr.network,
                gateway,
            }
        })
        .collect()
}

/// Finds the first non-zero gateway routed through `interface`
///
/// `/proc/net/route` columns are Iface, Destination, Gateway, ...; addresses
/// are host-order hex, i.e. little-endian on the platforms we run on.
pub fn parse_default_gateway(route_table: &str, interface: &str) -> Option<Ipv4Addr> {
    route_table.lines().skip(1).find_map(|line| {
        let mut fields = line.split_whitespace();
        if fields.next()? != interface {
            return None;
        }
        let raw = u32::from_str_radix(fields.nth(1)?, 16).ok()?;
        (raw != 0).then(|| Ipv4Addr::from(raw.to_le_bytes()))
    })
}

#[cfg(target_os = "linux")]
fn local_addresses() -> Result<Vec<LocalAddress>> {
    use nix::ifaddrs::getifaddrs;
    use nix::net::if_::{InterfaceFlags, if_nametoindex};
    use std::collections::HashMap;

    let entries: Vec<_> = getifaddrs()
        .map_err(|e| CollectorError::Discovery(format!("getifaddrs failed: {}", e)))?
        .collect();

    let macs: HashMap<&str, MacAddress> = entries
        .iter()
        .filter_map(|ifa| {
            let link = ifa.address.as_ref()?.as_link_addr()?;
            Some((ifa.interface_name.as_str(), MacAddress::new(link.addr()?)))
        })
        .collect();

    let mut addresses = Vec::new();
    for ifa in &entries {
        if ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK) {
            continue;
        }
        let (Some(addr), Some(mask)) = (
            ifa.address.as_ref().and_then(|a| a.as_sockaddr_in()),
            ifa.netmask.as_ref().and_then(|a| a.as_sockaddr_in()),
        ) else {
            continue;
        };

        let name = ifa.interface_name.as_str();
        let mac = match macs.get(name) {
            Some(mac) if !mac.is_zero() => *mac,
            _ => {
                debug!(interface = name, "Skipping interface without hardware address");
                continue;
            }
        };
        let index = if_nametoindex(name).map_err(|e| {
            CollectorError::Discovery(format!("Failed to resolve index of {}: {}", name, e))
        })?;
        let network = Ipv4Network::with_netmask(addr.ip(), mask.ip())
            .map_err(|e| CollectorError::Discovery(format!("{}: {}", name, e)))?;

        addresses.push(LocalAddress {
            interface: InterfaceInfo {
                name: name.to_string(),
                index,
                mac,
            },
            network,
        });
    }

    Ok(addresses)
}

#[cfg(not(target_os = "linux"))]
fn local_addresses() -> Result<Vec<LocalAddress>> {
    Err(CollectorError::Discovery(
        "interface enumeration is only supported on Linux".to_string(),
    ))
}
