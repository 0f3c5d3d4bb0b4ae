//! IP address and prefix types with safe parsing.

use crate::ParseError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// An IP address that can be either IPv4 or IPv6.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(untagged)]
pub enum IpAddress {
    V4(Ipv4Addr),
    V6(Ipv6Addr),
}

impl IpAddress {
    /// Returns true if this is an IPv4 address.
    pub const fn is_ipv4(&self) -> bool {
        matches!(self, IpAddress::V4(_))
    }

    /// Returns true if this is an IPv6 address.
    pub const fn is_ipv6(&self) -> bool {
        matches!(self, IpAddress::V6(_))
    }

    /// Returns the unspecified address of the same family.
    pub const fn unspecified_v4() -> Self {
        IpAddress::V4(Ipv4Addr::UNSPECIFIED)
    }
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IpAddress::V4(addr) => addr.fmt(f),
            IpAddress::V6(addr) => addr.fmt(f),
        }
    }
}

impl FromStr for IpAddress {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.contains(':') {
            s.parse::<Ipv6Addr>()
                .map(IpAddress::V6)
                .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
        } else {
            s.parse::<Ipv4Addr>()
                .map(IpAddress::V4)
                .map_err(|_| ParseError::InvalidIpAddress(s.to_string()))
        }
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress::V4(addr)
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress::V6(addr)
    }
}

/// An IP prefix in CIDR notation (e.g. 10.0.0.0/24 or 2001:db8::/32).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct IpPrefix {
    address: IpAddress,
    prefix_len: u8,
}

impl IpPrefix {
    /// Creates a new prefix, rejecting lengths that exceed the address
    /// family maximum (32 for IPv4, 128 for IPv6).
    pub fn new(address: IpAddress, prefix_len: u8) -> Result<Self, ParseError> {
        let max_len = match address {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        };

        if prefix_len > max_len {
            return Err(ParseError::InvalidIpPrefix(format!(
                "prefix length {} exceeds maximum {}",
                prefix_len, max_len
            )));
        }

        Ok(IpPrefix {
            address,
            prefix_len,
        })
    }

    /// The IPv4 default route, 0.0.0.0/0.
    pub const fn default_v4() -> Self {
        IpPrefix {
            address: IpAddress::V4(Ipv4Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// The IPv6 default route, ::/0.
    pub const fn default_v6() -> Self {
        IpPrefix {
            address: IpAddress::V6(Ipv6Addr::UNSPECIFIED),
            prefix_len: 0,
        }
    }

    /// Returns the (unmasked) address of this prefix.
    pub const fn ip(&self) -> IpAddress {
        self.address
    }

    /// Returns the prefix length in bits.
    pub const fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub const fn is_ipv4(&self) -> bool {
        self.address.is_ipv4()
    }

    pub const fn is_ipv6(&self) -> bool {
        self.address.is_ipv6()
    }

    /// Returns true if this is a default route (0.0.0.0/0 or ::/0).
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }

    /// Returns the prefix with its address masked to the network
    /// address (10.1.2.3/24 -> 10.1.2.0/24).
    pub fn network(&self) -> IpPrefix {
        let address = match self.address {
            IpAddress::V4(addr) => {
                let bits = u32::from(addr) & mask_v4(self.prefix_len);
                IpAddress::V4(Ipv4Addr::from(bits))
            }
            IpAddress::V6(addr) => {
                let bits = u128::from(addr) & mask_v6(self.prefix_len);
                IpAddress::V6(Ipv6Addr::from(bits))
            }
        };
        IpPrefix {
            address,
            prefix_len: self.prefix_len,
        }
    }

    /// Returns the host prefix of this prefix's address (/32 or /128).
    pub fn host_prefix(&self) -> IpPrefix {
        let prefix_len = match self.address {
            IpAddress::V4(_) => 32,
            IpAddress::V6(_) => 128,
        };
        IpPrefix {
            address: self.address,
            prefix_len,
        }
    }

    /// Returns true if `ip` lies within this prefix. Addresses of the
    /// other family never match.
    pub fn contains(&self, ip: &IpAddress) -> bool {
        match (self.address, ip) {
            (IpAddress::V4(net), IpAddress::V4(addr)) => {
                let mask = mask_v4(self.prefix_len);
                u32::from(net) & mask == u32::from(*addr) & mask
            }
            (IpAddress::V6(net), IpAddress::V6(addr)) => {
                let mask = mask_v6(self.prefix_len);
                u128::from(net) & mask == u128::from(*addr) & mask
            }
            _ => false,
        }
    }
}

fn mask_v4(len: u8) -> u32 {
    if len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(len))
    }
}

fn mask_v6(len: u8) -> u128 {
    if len == 0 {
        0
    } else {
        u128::MAX << (128 - u32::from(len))
    }
}

impl fmt::Display for IpPrefix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.address, self.prefix_len)
    }
}

impl FromStr for IpPrefix {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr_str, len_str) = s
            .rsplit_once('/')
            .ok_or_else(|| ParseError::InvalidIpPrefix(s.to_string()))?;

        let address: IpAddress = addr_str.parse()?;
        let prefix_len: u8 = len_str
            .parse()
            .map_err(|_| ParseError::InvalidIpPrefix(s.to_string()))?;

        IpPrefix::new(address, prefix_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_and_display() {
        let prefix: IpPrefix = "10.0.0.0/24".parse().unwrap();
        assert!(prefix.is_ipv4());
        assert_eq!(prefix.prefix_len(), 24);
        assert_eq!(prefix.to_string(), "10.0.0.0/24");

        let v6: IpPrefix = "2001:db8::/32".parse().unwrap();
        assert!(v6.is_ipv6());
    }

    #[test]
    fn test_invalid_prefix_length() {
        assert!("10.0.0.0/33".parse::<IpPrefix>().is_err());
        assert!("2001:db8::/129".parse::<IpPrefix>().is_err());
    }

    #[test]
    fn test_default_routes() {
        assert!(IpPrefix::default_v4().is_default());
        assert!(IpPrefix::default_v6().is_default());
        assert_eq!(IpPrefix::default_v4().to_string(), "0.0.0.0/0");
        assert_eq!(IpPrefix::default_v6().to_string(), "::/0");
    }

    #[test]
    fn test_network_masks_host_bits() {
        let prefix: IpPrefix = "10.1.2.3/24".parse().unwrap();
        assert_eq!(prefix.network().to_string(), "10.1.2.0/24");

        let v6: IpPrefix = "2001:db8::5/64".parse().unwrap();
        assert_eq!(v6.network().to_string(), "2001:db8::/64");
    }

    #[test]
    fn test_contains() {
        let prefix: IpPrefix = "20.1.1.0/24".parse().unwrap();
        let inside: IpAddress = "20.1.1.7".parse().unwrap();
        let outside: IpAddress = "20.1.2.7".parse().unwrap();
        let v6: IpAddress = "2001:db8::1".parse().unwrap();

        assert!(prefix.contains(&inside));
        assert!(!prefix.contains(&outside));
        assert!(!prefix.contains(&v6));

        // The default route contains everything in its family.
        assert!(IpPrefix::default_v4().contains(&inside));
        assert!(!IpPrefix::default_v4().contains(&v6));
    }

    #[test]
    fn test_host_prefix() {
        let prefix: IpPrefix = "10.0.0.5/24".parse().unwrap();
        assert_eq!(prefix.host_prefix().to_string(), "10.0.0.5/32");
    }
}
