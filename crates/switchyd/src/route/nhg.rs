//! Next-hop group identity and table entry.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use switchyd_orch_common::HasRefCount;
use switchyd_sad::{NextHopGroupMemberOid, NextHopGroupOid};
use switchyd_types::{IpAddress, ParseError};

/// The identity of a next-hop set: the member IPs, order-irrelevant.
/// Two routes naming the same IPs in any order share one group.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct NextHopGroupKey {
    ips: BTreeSet<IpAddress>,
}

impl NextHopGroupKey {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn single(ip: IpAddress) -> Self {
        let mut ips = BTreeSet::new();
        ips.insert(ip);
        Self { ips }
    }

    pub fn len(&self) -> usize {
        self.ips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ips.is_empty()
    }

    pub fn is_ecmp(&self) -> bool {
        self.ips.len() > 1
    }

    pub fn contains(&self, ip: &IpAddress) -> bool {
        self.ips.contains(ip)
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddress> {
        self.ips.iter()
    }

    /// The lowest member, used when a single representative is needed.
    pub fn first(&self) -> Option<IpAddress> {
        self.ips.iter().next().copied()
    }

    pub fn ips(&self) -> BTreeSet<IpAddress> {
        self.ips.clone()
    }
}

impl FromIterator<IpAddress> for NextHopGroupKey {
    fn from_iter<I: IntoIterator<Item = IpAddress>>(iter: I) -> Self {
        Self {
            ips: iter.into_iter().collect(),
        }
    }
}

impl FromStr for NextHopGroupKey {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ips = BTreeSet::new();
        for token in s.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            ips.insert(token.parse()?);
        }
        Ok(Self { ips })
    }
}

impl fmt::Display for NextHopGroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for ip in &self.ips {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{}", ip)?;
            first = false;
        }
        Ok(())
    }
}

/// A live ECMP group: its driver handle, the member handles per IP,
/// and the number of routes (and redirect rules) pointing at it.
#[derive(Debug)]
pub struct NextHopGroupEntry {
    pub oid: NextHopGroupOid,
    pub members: Vec<(IpAddress, NextHopGroupMemberOid)>,
    ref_count: u32,
}

impl NextHopGroupEntry {
    pub fn new(oid: NextHopGroupOid, members: Vec<(IpAddress, NextHopGroupMemberOid)>) -> Self {
        Self {
            oid,
            members,
            ref_count: 0,
        }
    }
}

impl HasRefCount for NextHopGroupEntry {
    fn increment_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.ref_count.checked_sub(1).map(|n| {
            self.ref_count = n;
            n
        })
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_irrelevant_identity() {
        let a: NextHopGroupKey = "10.0.0.1,10.0.0.2".parse().unwrap();
        let b: NextHopGroupKey = "10.0.0.2,10.0.0.1".parse().unwrap();
        assert_eq!(a, b);
        assert!(a.is_ecmp());
        assert_eq!(a.len(), 2);
    }

    #[test]
    fn test_single_and_empty() {
        let single: NextHopGroupKey = "10.0.0.1".parse().unwrap();
        assert_eq!(single.len(), 1);
        assert!(!single.is_ecmp());
        assert_eq!(single.first(), Some("10.0.0.1".parse().unwrap()));

        let empty: NextHopGroupKey = "".parse().unwrap();
        assert!(empty.is_empty());
    }

    #[test]
    fn test_display_roundtrip() {
        let key: NextHopGroupKey = "10.0.0.2,10.0.0.1".parse().unwrap();
        assert_eq!(key.to_string(), "10.0.0.1,10.0.0.2");
    }
}
