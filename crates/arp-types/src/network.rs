//! IPv4 network type with containment and host iteration.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Upper bound on the number of hosts a full network scan will walk.
pub const MAX_SCAN_HOSTS: usize = 4094;

/// An IPv4 address together with its prefix length (CIDR notation).
///
/// The address is kept as given, so an interface network such as
/// `192.168.1.20/24` remembers the host's own address while
/// [`Ipv4Network::network_address`] yields `192.168.1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ipv4Network {
    address: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Network {
    /// # Errors
    ///
    /// Returns an error if `prefix_len` exceeds 32.
    pub fn new(address: Ipv4Addr, prefix_len: u8) -> Result<Self, ParseError> {
        if prefix_len > 32 {
            return Err(ParseError::InvalidNetwork(format!(
                "prefix length {prefix_len} exceeds maximum 32"
            )));
        }
        Ok(Self {
            address,
            prefix_len,
        })
    }

    /// Builds a network from an address and a dotted netmask.
    ///
    /// # Errors
    ///
    /// Returns an error if the mask is not contiguous.
    pub fn with_netmask(address: Ipv4Addr, netmask: Ipv4Addr) -> Result<Self, ParseError> {
        let bits = u32::from(netmask);
        let prefix_len = bits.leading_ones();
        if bits.count_ones() != prefix_len {
            return Err(ParseError::InvalidNetwork(format!(
                "non-contiguous netmask {netmask}"
            )));
        }
        Self::new(address, prefix_len as u8)
    }

    pub const fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::from(self.mask_bits())
    }

    pub fn network_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) & self.mask_bits())
    }

    pub fn broadcast_address(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.address) | !self.mask_bits())
    }

    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & self.mask_bits() == u32::from(self.network_address())
    }

    /// Usable host addresses, excluding the network and broadcast addresses
    /// for prefixes shorter than /31, capped at [`MAX_SCAN_HOSTS`].
    pub fn hosts(&self) -> impl Iterator<Item = Ipv4Addr> {
        let first = u32::from(self.network_address());
        let last = u32::from(self.broadcast_address());
        let (start, end) = if self.prefix_len >= 31 {
            (first, last)
        } else {
            (first + 1, last - 1)
        };
        (start..=end).take(MAX_SCAN_HOSTS).map(Ipv4Addr::from)
    }

    fn mask_bits(&self) -> u32 {
        u32::MAX
            .checked_shl(32 - u32::from(self.prefix_len))
            .unwrap_or(0)
    }
}

impl fmt::Display for Ipv4Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for Ipv4Network {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .trim()
            .split_once('/')
            .ok_or_else(|| ParseError::InvalidNetwork(s.to_string()))?;

        let address: Ipv4Addr = addr_str
            .parse()
            .map_err(|_| ParseError::InvalidIpAddress(addr_str.to_string()))?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidNetwork(s.to_string()))?;

        Self::new(address, prefix_len)
    }
}

impl TryFrom<String> for Ipv4Network {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Ipv4Network> for String {
    fn from(net: Ipv4Network) -> String {
        net.to_string()
    }
}
