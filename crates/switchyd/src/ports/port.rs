//! The port registry entry.

use std::collections::BTreeSet;
use switchyd_sad::{BridgePortOid, LagOid, PortOid, RawOid, RouterInterfaceOid, VlanOid};

/// What a registry entry stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortKind {
    Phy,
    Lag,
    Vlan,
    Cpu,
}

/// One entry of the port catalog. Driver handles are created on first
/// use and destroyed when the entry is removed; sibling subsystems
/// look ports up by alias and never keep handles of their own.
#[derive(Debug, Clone)]
pub struct Port {
    pub alias: String,
    pub kind: PortKind,
    pub port_oid: PortOid,
    pub lag_oid: Option<LagOid>,
    pub vlan_oid: Option<VlanOid>,
    /// VLAN id for VLAN entries; port VLAN id (pvid) otherwise.
    pub vlan_id: u16,
    pub rif: Option<RouterInterfaceOid>,
    pub bridge_port: Option<BridgePortOid>,
    /// Member aliases for LAG and VLAN entries.
    pub members: BTreeSet<String>,
    pub admin_up: bool,
}

impl Port {
    pub fn phy(alias: impl Into<String>, port_oid: PortOid) -> Self {
        Self {
            alias: alias.into(),
            kind: PortKind::Phy,
            port_oid,
            lag_oid: None,
            vlan_oid: None,
            vlan_id: 0,
            rif: None,
            bridge_port: None,
            members: BTreeSet::new(),
            admin_up: false,
        }
    }

    pub fn cpu(port_oid: PortOid) -> Self {
        Self {
            kind: PortKind::Cpu,
            ..Self::phy("CPU", port_oid)
        }
    }

    pub fn lag(alias: impl Into<String>, lag_oid: LagOid) -> Self {
        Self {
            kind: PortKind::Lag,
            lag_oid: Some(lag_oid),
            ..Self::phy(alias, PortOid::NULL)
        }
    }

    pub fn vlan(alias: impl Into<String>, vlan_oid: VlanOid, vlan_id: u16) -> Self {
        Self {
            kind: PortKind::Vlan,
            vlan_oid: Some(vlan_oid),
            vlan_id,
            ..Self::phy(alias, PortOid::NULL)
        }
    }

    /// The handle a bridge port is anchored on: the port itself for a
    /// physical port, the LAG for a LAG.
    pub fn bridge_anchor(&self) -> RawOid {
        match self.kind {
            PortKind::Lag => self.lag_oid.map(|l| l.as_raw()).unwrap_or(0),
            _ => self.port_oid.as_raw(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_constructors() {
        let phy = Port::phy("Ethernet0", PortOid::from_raw(1));
        assert_eq!(phy.kind, PortKind::Phy);
        assert_eq!(phy.bridge_anchor(), 1);

        let lag = Port::lag("PortChannel1", LagOid::from_raw(2));
        assert_eq!(lag.kind, PortKind::Lag);
        assert_eq!(lag.bridge_anchor(), 2);

        let vlan = Port::vlan("Vlan100", VlanOid::from_raw(3), 100);
        assert_eq!(vlan.kind, PortKind::Vlan);
        assert_eq!(vlan.vlan_id, 100);
    }
}
