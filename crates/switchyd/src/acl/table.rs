//! ACL table objects and their port bindings.

use super::rule::AclRule;
use std::collections::BTreeMap;
use switchyd_sad::{AclBindOid, AclRangeKind, AclTableField, AclTableOid, AclTableSpec};

/// Table flavor, deciding which rules and match fields it accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclTableKind {
    L3,
    Mirror,
}

impl AclTableKind {
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_uppercase().as_str() {
            "L3" => Some(AclTableKind::L3),
            "MIRROR" => Some(AclTableKind::Mirror),
            _ => None,
        }
    }
}

/// One ACL table: its driver object, the per-port bind handles and the
/// rules it carries.
pub struct AclTable {
    pub id: String,
    pub description: String,
    pub kind: AclTableKind,
    pub ports: Vec<String>,
    pub oid: AclTableOid,
    pub binds: Vec<AclBindOid>,
    pub rules: BTreeMap<String, AclRule>,
}

/// Every table is created with a fixed superset of match fields;
/// mirror tables additionally match DSCP.
pub fn table_spec(kind: AclTableKind) -> AclTableSpec {
    let mut fields = vec![
        AclTableField::EtherType,
        AclTableField::IpType,
        AclTableField::IpProtocol,
        AclTableField::SrcIp,
        AclTableField::DstIp,
        AclTableField::L4SrcPort,
        AclTableField::L4DstPort,
        AclTableField::TcpFlags,
        AclTableField::Tc,
    ];
    if kind == AclTableKind::Mirror {
        fields.push(AclTableField::Dscp);
    }
    AclTableSpec {
        fields,
        range_kinds: vec![AclRangeKind::L4DstPort, AclRangeKind::L4SrcPort],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_parse() {
        assert_eq!(AclTableKind::parse("l3"), Some(AclTableKind::L3));
        assert_eq!(AclTableKind::parse("MIRROR"), Some(AclTableKind::Mirror));
        assert_eq!(AclTableKind::parse("nat"), None);
    }

    #[test]
    fn test_mirror_tables_match_dscp() {
        assert!(!table_spec(AclTableKind::L3)
            .fields
            .contains(&AclTableField::Dscp));
        assert!(table_spec(AclTableKind::Mirror)
            .fields
            .contains(&AclTableField::Dscp));
    }
}
