//! Network primitive types shared across the switchyd control plane.
//!
//! - [`MacAddress`]: 48-bit Ethernet addresses
//! - [`IpAddress`] / [`IpPrefix`]: IPv4/IPv6 addresses and CIDR prefixes
//! - [`VlanId`]: IEEE 802.1Q VLAN identifiers

mod ip;
mod mac;
mod vlan;

pub use ip::{IpAddress, IpPrefix};
pub use mac::MacAddress;
pub use vlan::VlanId;

/// Common error type for parsing failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("invalid MAC address format: {0}")]
    InvalidMacAddress(String),

    #[error("invalid IP address format: {0}")]
    InvalidIpAddress(String),

    #[error("invalid IP prefix format: {0}")]
    InvalidIpPrefix(String),

    #[error("invalid VLAN ID: {0} (must be 1-4094)")]
    InvalidVlanId(u16),
}
