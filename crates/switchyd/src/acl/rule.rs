//! ACL rule parsing and representation.

use super::table::AclTableKind;
use crate::route::NextHopGroupKey;
use switchyd_orch_common::{parse_u32_auto, KeyOpFieldValues};
use switchyd_sad::{
    AclCounterOid, AclEntryOid, AclIpType, AclMatch, AclRangeKind,
};
use switchyd_types::{IpAddress, IpPrefix};

/// Where a redirect sends matching packets. Parsed once and kept on
/// the rule so removal can reverse the references it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RedirectTarget {
    /// A physical port or LAG, resolved by alias at install time.
    Iface(String),
    /// An existing next hop.
    NextHop(IpAddress),
    /// An ECMP set, reusing or creating the next-hop group.
    NextHopGroup(NextHopGroupKey),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum L3PacketAction {
    Forward,
    Drop,
    Redirect(RedirectTarget),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleAction {
    L3(L3PacketAction),
    Mirror { session: String },
}

/// One logical rule. `installed` tracks whether the driver entry
/// exists right now: mirror rules stay logical-only while their
/// session is inactive, carrying their counters across.
pub struct AclRule {
    pub id: String,
    pub table_id: String,
    pub priority: u32,
    pub matches: Vec<AclMatch>,
    pub ranges: Vec<(AclRangeKind, u16, u16)>,
    pub action: RuleAction,
    pub entry_oid: Option<AclEntryOid>,
    pub counter_oid: Option<AclCounterOid>,
    pub installed: bool,
    pub carry_packets: u64,
    pub carry_bytes: u64,
}

impl AclRule {
    pub fn counters_key(&self) -> String {
        format!("{}:{}", self.table_id, self.id)
    }

    pub fn mirror_session(&self) -> Option<&str> {
        match &self.action {
            RuleAction::Mirror { session } => Some(session),
            RuleAction::L3(_) => None,
        }
    }
}

fn parse_u8_field(value: &str, max: u32) -> Result<u8, String> {
    let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
    if v > max {
        return Err(format!("value {} out of range", v));
    }
    Ok(v as u8)
}

fn parse_u16_field(value: &str) -> Result<u16, String> {
    let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
    u16::try_from(v).map_err(|_| format!("value {} out of range", v))
}

fn parse_ip_prefix(value: &str) -> Result<IpPrefix, String> {
    if value.contains('/') {
        value.parse().map_err(|e| format!("{}", e))
    } else {
        let ip: IpAddress = value.parse().map_err(|e| format!("{}", e))?;
        Ok(IpPrefix::new(ip, if ip.is_ipv4() { 32 } else { 128 })
            .expect("host prefix length is always valid"))
    }
}

fn parse_tcp_flags(value: &str) -> Result<AclMatch, String> {
    let (flags, mask) = value
        .split_once('/')
        .ok_or_else(|| format!("TCP flags {:?} must be flags/mask", value))?;
    Ok(AclMatch::TcpFlags {
        flags: parse_u8_field(flags.trim(), 0xff)?,
        mask: parse_u8_field(mask.trim(), 0xff)?,
    })
}

fn parse_ip_type(value: &str) -> Result<AclIpType, String> {
    let ip_type = match value.to_uppercase().as_str() {
        "ANY" => AclIpType::Any,
        "IP" => AclIpType::Ip,
        "NON_IP" => AclIpType::NonIp,
        "IPV4ANY" => AclIpType::Ipv4Any,
        "NON_IPV4" => AclIpType::NonIpv4,
        "IPV6ANY" => AclIpType::Ipv6Any,
        "NON_IPV6" => AclIpType::NonIpv6,
        "ARP" => AclIpType::Arp,
        "ARP_REQUEST" => AclIpType::ArpRequest,
        "ARP_REPLY" => AclIpType::ArpReply,
        other => return Err(format!("unknown IP type {:?}", other)),
    };
    Ok(ip_type)
}

fn parse_port_range(value: &str) -> Result<(u16, u16), String> {
    let (low, high) = value
        .split_once('-')
        .ok_or_else(|| format!("range {:?} must be lo-hi", value))?;
    let low = parse_u16_field(low.trim())?;
    let high = parse_u16_field(high.trim())?;
    if low > high {
        return Err(format!("range {}-{} inverted", low, high));
    }
    Ok((low, high))
}

fn parse_packet_action(value: &str) -> Result<L3PacketAction, String> {
    let upper = value.to_uppercase();
    if upper == "FORWARD" {
        return Ok(L3PacketAction::Forward);
    }
    if upper == "DROP" {
        return Ok(L3PacketAction::Drop);
    }
    if let Some(target) = upper
        .starts_with("REDIRECT:")
        .then(|| &value["REDIRECT:".len()..])
    {
        if target.is_empty() {
            return Err("redirect action has no target".to_string());
        }
        // A single IP names a next hop, a comma list names a group,
        // anything else is a port or LAG alias.
        if let Ok(ip) = target.parse::<IpAddress>() {
            return Ok(L3PacketAction::Redirect(RedirectTarget::NextHop(ip)));
        }
        if target.contains(',') {
            let key: NextHopGroupKey = target
                .parse()
                .map_err(|e| format!("redirect target: {}", e))?;
            return Ok(L3PacketAction::Redirect(RedirectTarget::NextHopGroup(key)));
        }
        return Ok(L3PacketAction::Redirect(RedirectTarget::Iface(
            target.to_string(),
        )));
    }
    Err(format!("unknown packet action {:?}", value))
}

/// Parses one `ACL_RULE_TABLE` entry against its table's kind and the
/// switch priority window. At least one match and exactly one action
/// are required.
pub fn parse_rule(
    table_kind: AclTableKind,
    table_id: &str,
    rule_id: &str,
    entry: &KeyOpFieldValues,
    min_priority: u32,
    max_priority: u32,
) -> Result<AclRule, String> {
    let mut priority = None;
    let mut matches = Vec::new();
    let mut ranges = Vec::new();
    let mut action = None;

    fn set_action(a: RuleAction, action: &mut Option<RuleAction>) -> Result<(), String> {
        if action.is_some() {
            return Err("more than one action".to_string());
        }
        *action = Some(a);
        Ok(())
    }

    for (field, value) in &entry.field_values {
        let name = field.to_uppercase();
        match name.as_str() {
            "PRIORITY" => {
                let p = parse_u32_auto(value).map_err(|e| e.to_string())?;
                if p < min_priority || p > max_priority {
                    return Err(format!(
                        "priority {} outside [{}, {}]",
                        p, min_priority, max_priority
                    ));
                }
                priority = Some(p);
            }
            "SRC_IP" => matches.push(AclMatch::SrcIp(parse_ip_prefix(value)?)),
            "DST_IP" => matches.push(AclMatch::DstIp(parse_ip_prefix(value)?)),
            "L4_SRC_PORT" => matches.push(AclMatch::L4SrcPort(parse_u16_field(value)?)),
            "L4_DST_PORT" => matches.push(AclMatch::L4DstPort(parse_u16_field(value)?)),
            "ETHER_TYPE" => matches.push(AclMatch::EtherType(parse_u16_field(value)?)),
            "IP_PROTOCOL" => matches.push(AclMatch::IpProtocol(parse_u8_field(value, 0xff)?)),
            "TCP_FLAGS" => matches.push(parse_tcp_flags(value)?),
            "IP_TYPE" => matches.push(AclMatch::IpType(parse_ip_type(value)?)),
            "DSCP" => {
                if table_kind == AclTableKind::L3 {
                    return Err("DSCP match is not supported on L3 tables".to_string());
                }
                matches.push(AclMatch::Dscp(parse_u8_field(value, 0x3f)?));
            }
            "TC" => matches.push(AclMatch::Tc(parse_u8_field(value, 0xff)?)),
            "L4_SRC_PORT_RANGE" => {
                let (low, high) = parse_port_range(value)?;
                ranges.push((AclRangeKind::L4SrcPort, low, high));
            }
            "L4_DST_PORT_RANGE" => {
                let (low, high) = parse_port_range(value)?;
                ranges.push((AclRangeKind::L4DstPort, low, high));
            }
            "PACKET_ACTION" => {
                if table_kind != AclTableKind::L3 {
                    return Err("packet actions require an L3 table".to_string());
                }
                set_action(RuleAction::L3(parse_packet_action(value)?), &mut action)?;
            }
            "MIRROR_ACTION" => {
                set_action(
                    RuleAction::Mirror {
                        session: value.clone(),
                    },
                    &mut action,
                )?;
            }
            other => return Err(format!("unknown rule attribute {:?}", other)),
        }
    }

    let action = action.ok_or("rule has no action")?;
    if matches.is_empty() && ranges.is_empty() {
        return Err("rule has no matches".to_string());
    }

    Ok(AclRule {
        id: rule_id.to_string(),
        table_id: table_id.to_string(),
        priority: priority.ok_or("rule has no priority")?,
        matches,
        ranges,
        action,
        entry_oid: None,
        counter_oid: None,
        installed: false,
        carry_packets: 0,
        carry_bytes: 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pairs: &[(&str, &str)]) -> KeyOpFieldValues {
        KeyOpFieldValues::set(
            "table:rule",
            pairs
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        )
    }

    fn parse(kind: AclTableKind, pairs: &[(&str, &str)]) -> Result<AclRule, String> {
        parse_rule(kind, "table", "rule", &entry(pairs), 1, 10000)
    }

    #[test]
    fn test_basic_l3_rule() {
        let rule = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "100"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "FORWARD"),
            ],
        )
        .unwrap();
        assert_eq!(rule.priority, 100);
        assert_eq!(rule.matches.len(), 1);
        assert_eq!(rule.action, RuleAction::L3(L3PacketAction::Forward));
        assert_eq!(rule.counters_key(), "table:rule");
    }

    #[test]
    fn test_priority_window_enforced() {
        assert!(parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10001"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .is_err());
    }

    #[test]
    fn test_tcp_flags() {
        let rule = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("TCP_FLAGS", "0x12/0xff"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .unwrap();
        assert_eq!(
            rule.matches[0],
            AclMatch::TcpFlags {
                flags: 0x12,
                mask: 0xff
            }
        );

        assert!(parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("TCP_FLAGS", "0x1ff/0xff"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .is_err());
    }

    #[test]
    fn test_port_range() {
        let rule = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("L4_SRC_PORT_RANGE", "1000-2000"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .unwrap();
        assert_eq!(rule.ranges, vec![(AclRangeKind::L4SrcPort, 1000, 2000)]);

        assert!(parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("L4_SRC_PORT_RANGE", "2000-1000"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .is_err());
    }

    #[test]
    fn test_redirect_targets() {
        let single = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "REDIRECT:1.1.1.1"),
            ],
        )
        .unwrap();
        assert_eq!(
            single.action,
            RuleAction::L3(L3PacketAction::Redirect(RedirectTarget::NextHop(
                "1.1.1.1".parse().unwrap()
            )))
        );

        let group = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "REDIRECT:1.1.1.1,2.2.2.2"),
            ],
        )
        .unwrap();
        match group.action {
            RuleAction::L3(L3PacketAction::Redirect(RedirectTarget::NextHopGroup(key))) => {
                assert_eq!(key.len(), 2);
            }
            other => panic!("unexpected action {:?}", other),
        }

        let iface = parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "REDIRECT:Ethernet4"),
            ],
        )
        .unwrap();
        assert_eq!(
            iface.action,
            RuleAction::L3(L3PacketAction::Redirect(RedirectTarget::Iface(
                "Ethernet4".to_string()
            )))
        );
    }

    #[test]
    fn test_dscp_rejected_on_l3() {
        assert!(parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("DSCP", "8"),
                ("PACKET_ACTION", "DROP"),
            ],
        )
        .is_err());

        assert!(parse(
            AclTableKind::Mirror,
            &[("PRIORITY", "10"), ("DSCP", "8"), ("MIRROR_ACTION", "s")],
        )
        .is_ok());
    }

    #[test]
    fn test_exactly_one_action() {
        assert!(parse(
            AclTableKind::L3,
            &[("PRIORITY", "10"), ("SRC_IP", "10.0.0.0/24")],
        )
        .is_err());

        assert!(parse(
            AclTableKind::L3,
            &[
                ("PRIORITY", "10"),
                ("SRC_IP", "10.0.0.0/24"),
                ("PACKET_ACTION", "DROP"),
                ("MIRROR_ACTION", "s"),
            ],
        )
        .is_err());
    }
}
