//! Hardware address type used for neighbor bindings.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A 48-bit Ethernet MAC address.
///
/// ```
/// use arp_types::MacAddress;
///
/// let mac: MacAddress = "b8:27:eb:12:34:56".parse().unwrap();
/// assert_eq!(mac.to_string(), "b8:27:eb:12:34:56");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// The zero MAC address, reported by the kernel for unresolved neighbors.
    pub const ZERO: MacAddress = MacAddress([0; 6]);

    pub const fn new(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }

    /// Builds a MAC from a link-layer attribute, which must be exactly 6 bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 6]>::try_from(bytes).ok().map(MacAddress)
    }

    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }

    /// Group bit of the first octet.
    pub const fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// True for an address a neighbor can actually own.
    pub fn is_usable(&self) -> bool {
        !self.is_zero() && !self.is_multicast()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

impl FromStr for MacAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let separator = if s.contains(':') { ':' } else { '-' };
        let invalid = || ParseError::InvalidMacAddress(s.to_string());

        let mut bytes = [0u8; 6];
        let mut parts = s.split(separator);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or_else(invalid)?;
            if part.is_empty() || part.len() > 2 {
                return Err(invalid());
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = ParseError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl From<[u8; 6]> for MacAddress {
    fn from(bytes: [u8; 6]) -> Self {
        MacAddress(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let mac: MacAddress = "00:1A:2b:3c:4d:5e".parse().unwrap();
        assert_eq!(mac, MacAddress::new([0x00, 0x1a, 0x2b, 0x3c, 0x4d, 0x5e]));
        assert_eq!(mac.to_string(), "00:1a:2b:3c:4d:5e");

        let hyphen: MacAddress = "00-1a-2b-3c-4d-5e".parse().unwrap();
        assert_eq!(mac, hyphen);
    }

    #[test]
    fn test_invalid_format() {
        assert!("".parse::<MacAddress>().is_err());
        assert!("00:11:22:33:44".parse::<MacAddress>().is_err());
        assert!("00:11:22:33:44:55:66".parse::<MacAddress>().is_err());
        assert!("00:11:22:33:44:555".parse::<MacAddress>().is_err());
        assert!("zz:11:22:33:44:55".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(
            MacAddress::from_slice(&[1, 2, 3, 4, 5, 6]),
            Some(MacAddress::new([1, 2, 3, 4, 5, 6]))
        );
        assert_eq!(MacAddress::from_slice(&[1, 2, 3]), None);
    }

    #[test]
    fn test_usable() {
        assert!(!MacAddress::ZERO.is_usable());
        assert!(!"ff:ff:ff:ff:ff:ff".parse::<MacAddress>().unwrap().is_usable());
        assert!(!"01:00:5e:00:00:01".parse::<MacAddress>().unwrap().is_usable());
        assert!("02:42:ac:11:00:02".parse::<MacAddress>().unwrap().is_usable());
    }

    #[test]
    fn test_serde_as_string() {
        let mac = MacAddress::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        let json = serde_json::to_string(&mac).unwrap();
        assert_eq!(json, "\"aa:bb:cc:dd:ee:ff\"");
        let back: MacAddress = serde_json::from_str(&json).unwrap();
        assert_eq!(back, mac);
    }
}
