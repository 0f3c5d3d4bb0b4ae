//! CoPP orchestration.

use crate::context::SwitchContext;
use crate::tables::COPP_TABLE;
use log::{error, info, warn};
use std::collections::HashMap;
use switchyd_orch_common::{Consumer, KeyOpFieldValues, Operation, TaskStatus};
use switchyd_sad::{PacketAction, PolicerSpec, SadResult, TrapGroupOid, TrapKind, TrapOid};

const DEFAULT_TRAP_GROUP: &str = "default";

/// Traps the switch carries from the start, bound to the default
/// group.
const DEFAULT_TRAP_IDS: [TrapKind; 1] = [TrapKind::TtlError];

/// CoPP orchestration (C13). The default trap group comes from the
/// switch and can never be removed; removing another group rebinds
/// its traps to the default group first.
pub struct CoppOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    trap_groups: HashMap<String, TrapGroupOid>,
    group_policers: HashMap<String, switchyd_sad::PolicerOid>,
    traps: HashMap<TrapKind, (TrapOid, String)>,
}

impl CoppOrch {
    pub fn new(ctx: SwitchContext) -> SadResult<Self> {
        let mut trap_groups = HashMap::new();
        let default_group = ctx.info().default_trap_group;
        trap_groups.insert(DEFAULT_TRAP_GROUP.to_string(), default_group);

        let mut traps = HashMap::new();
        for kind in DEFAULT_TRAP_IDS {
            let trap = ctx.sad().create_trap(kind, default_group, PacketAction::Trap)?;
            traps.insert(kind, (trap, DEFAULT_TRAP_GROUP.to_string()));
        }
        info!("seeded default trap group");

        Ok(Self {
            ctx,
            consumer: Consumer::new(COPP_TABLE),
            trap_groups,
            group_policers: HashMap::new(),
            traps,
        })
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    pub fn has_trap_group(&self, name: &str) -> bool {
        self.trap_groups.contains_key(name)
    }

    pub fn trap_group_count(&self) -> usize {
        self.trap_groups.len()
    }

    pub fn do_task(&mut self) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = self.process(&entry);
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", COPP_TABLE, entry.key);
                }
            }
        }

        self.consumer.requeue(retained);
    }

    fn process(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let group_name = entry.key.clone();
        match entry.op {
            Operation::Set => self.apply_group(&group_name, entry),
            Operation::Del => self.remove_group(&group_name),
        }
    }

    fn apply_group(&mut self, group_name: &str, entry: &KeyOpFieldValues) -> TaskStatus {
        let mut trap_ids = Vec::new();
        let mut trap_action = None;
        let mut queue = None;
        let mut policer = PolicerSpec::default();
        let mut has_policer = false;

        for (field, value) in &entry.field_values {
            let result: Result<(), String> = match field.as_str() {
                "trap_ids" => value
                    .split(',')
                    .map(|token| {
                        parse_trap_kind(token.trim())
                            .map(|kind| trap_ids.push(kind))
                            .ok_or_else(|| format!("unknown trap id {:?}", token))
                            .map(|_| ())
                    })
                    .collect(),
                "trap_action" => parse_packet_action(value)
                    .map(|action| trap_action = Some(action))
                    .ok_or_else(|| format!("unknown trap action {:?}", value)),
                "queue" => value
                    .parse::<u8>()
                    .map(|q| queue = Some(q))
                    .map_err(|_| format!("invalid queue {:?}", value)),
                "meter_type" => {
                    has_policer = true;
                    match value.as_str() {
                        "packets" => {
                            policer.meter_packets = true;
                            Ok(())
                        }
                        "bytes" => {
                            policer.meter_packets = false;
                            Ok(())
                        }
                        other => Err(format!("unknown meter type {:?}", other)),
                    }
                }
                "mode" => {
                    // sr_tcm, tr_tcm and storm modes share the same
                    // attribute surface here.
                    has_policer = true;
                    Ok(())
                }
                "color" => {
                    has_policer = true;
                    policer.color_aware = value == "aware";
                    Ok(())
                }
                "cbs" => parse_u64_into(value, &mut policer.cbs, &mut has_policer),
                "cir" => parse_u64_into(value, &mut policer.cir, &mut has_policer),
                "pbs" => parse_u64_into(value, &mut policer.pbs, &mut has_policer),
                "pir" => parse_u64_into(value, &mut policer.pir, &mut has_policer),
                "green_action" => parse_color_action(value, &mut policer.green_action, &mut has_policer),
                "yellow_action" => {
                    parse_color_action(value, &mut policer.yellow_action, &mut has_policer)
                }
                "red_action" => parse_color_action(value, &mut policer.red_action, &mut has_policer),
                other => Err(format!("unknown attribute {:?}", other)),
            };
            if let Err(message) = result {
                error!("invalid {} entry {}: {}", COPP_TABLE, group_name, message);
                return TaskStatus::Invalid;
            }
        }

        let group = match self.trap_groups.get(group_name) {
            Some(group) => {
                let group = *group;
                if let Some(q) = queue {
                    if let Err(e) = self.ctx.sad().set_trap_group_queue(group, q) {
                        error!("failed to set queue on trap group {}: {}", group_name, e);
                        return TaskStatus::Retry;
                    }
                }
                group
            }
            None => match self.ctx.sad().create_trap_group(queue) {
                Ok(group) => {
                    self.trap_groups.insert(group_name.to_string(), group);
                    info!("created trap group {}", group_name);
                    group
                }
                Err(e) => {
                    error!("failed to create trap group {}: {}", group_name, e);
                    return TaskStatus::Retry;
                }
            },
        };

        if has_policer {
            match self.group_policers.get(group_name) {
                Some(policer_oid) => {
                    if let Err(e) = self.ctx.sad().set_policer(*policer_oid, &policer) {
                        error!("failed to update policer of {}: {}", group_name, e);
                        return TaskStatus::Retry;
                    }
                }
                None => {
                    let policer_oid = match self.ctx.sad().create_policer(&policer) {
                        Ok(oid) => oid,
                        Err(e) => {
                            error!("failed to create policer for {}: {}", group_name, e);
                            return TaskStatus::Retry;
                        }
                    };
                    if let Err(e) = self.ctx.sad().bind_trap_group_policer(group, policer_oid) {
                        error!("failed to bind policer to {}: {}", group_name, e);
                        let _ = self.ctx.sad().remove_policer(policer_oid);
                        return TaskStatus::Retry;
                    }
                    self.group_policers
                        .insert(group_name.to_string(), policer_oid);
                }
            }
        }

        // Point the named traps at this group, creating missing ones.
        let action = trap_action.unwrap_or(PacketAction::Trap);
        for kind in trap_ids {
            match self.traps.get_mut(&kind) {
                Some((trap, owner)) => {
                    if let Err(e) = self.ctx.sad().set_trap_group_binding(*trap, group) {
                        error!("failed to rebind trap {:?}: {}", kind, e);
                        return TaskStatus::Retry;
                    }
                    if trap_action.is_some() {
                        if let Err(e) = self.ctx.sad().set_trap_action(*trap, action) {
                            error!("failed to set action on trap {:?}: {}", kind, e);
                            return TaskStatus::Retry;
                        }
                    }
                    *owner = group_name.to_string();
                }
                None => match self.ctx.sad().create_trap(kind, group, action) {
                    Ok(trap) => {
                        self.traps.insert(kind, (trap, group_name.to_string()));
                    }
                    Err(e) => {
                        error!("failed to create trap {:?}: {}", kind, e);
                        return TaskStatus::Retry;
                    }
                },
            }
        }

        TaskStatus::Consumed
    }

    fn remove_group(&mut self, group_name: &str) -> TaskStatus {
        // Drop the policer first in any case.
        if let Some(policer) = self.group_policers.remove(group_name) {
            if let Some(group) = self.trap_groups.get(group_name) {
                if let Err(e) = self.ctx.sad().unbind_trap_group_policer(*group) {
                    error!("failed to unbind policer of {}: {}", group_name, e);
                }
            }
            if let Err(e) = self.ctx.sad().remove_policer(policer) {
                error!("failed to remove policer of {}: {}", group_name, e);
            }
        }

        if group_name == DEFAULT_TRAP_GROUP {
            warn!("cannot remove the default trap group");
            return TaskStatus::Consumed;
        }
        let Some(group) = self.trap_groups.get(group_name).copied() else {
            return TaskStatus::Consumed;
        };

        // Orphaned traps fall back to the default group with a
        // forward action before the group dies.
        let default_group = self.trap_groups[DEFAULT_TRAP_GROUP];
        for (kind, (trap, owner)) in self.traps.iter_mut() {
            if owner != group_name {
                continue;
            }
            if let Err(e) = self.ctx.sad().set_trap_group_binding(*trap, default_group) {
                error!("failed to rebind trap {:?} to default: {}", kind, e);
                return TaskStatus::Retry;
            }
            if let Err(e) = self.ctx.sad().set_trap_action(*trap, PacketAction::Forward) {
                error!("failed to reset action of trap {:?}: {}", kind, e);
            }
            *owner = DEFAULT_TRAP_GROUP.to_string();
        }

        if let Err(e) = self.ctx.sad().remove_trap_group(group) {
            error!("failed to remove trap group {}: {}", group_name, e);
            return TaskStatus::Retry;
        }
        self.trap_groups.remove(group_name);
        info!("removed trap group {}", group_name);
        TaskStatus::Consumed
    }
}

fn parse_u64_into(value: &str, slot: &mut u64, has_policer: &mut bool) -> Result<(), String> {
    *has_policer = true;
    *slot = value
        .parse()
        .map_err(|_| format!("invalid policer value {:?}", value))?;
    Ok(())
}

fn parse_color_action(
    value: &str,
    slot: &mut Option<PacketAction>,
    has_policer: &mut bool,
) -> Result<(), String> {
    *has_policer = true;
    *slot = Some(
        parse_packet_action(value).ok_or_else(|| format!("unknown packet action {:?}", value))?,
    );
    Ok(())
}

fn parse_packet_action(value: &str) -> Option<PacketAction> {
    match value {
        "drop" => Some(PacketAction::Drop),
        "forward" => Some(PacketAction::Forward),
        "copy" => Some(PacketAction::Copy),
        "trap" => Some(PacketAction::Trap),
        "log" => Some(PacketAction::Log),
        "deny" => Some(PacketAction::Deny),
        _ => None,
    }
}

fn parse_trap_kind(value: &str) -> Option<TrapKind> {
    match value {
        "stp" => Some(TrapKind::Stp),
        "lacp" => Some(TrapKind::Lacp),
        "lldp" => Some(TrapKind::Lldp),
        "bgp" => Some(TrapKind::Bgp),
        "bgpv6" => Some(TrapKind::Bgpv6),
        "arp_req" => Some(TrapKind::ArpRequest),
        "arp_resp" => Some(TrapKind::ArpResponse),
        "neigh_discovery" => Some(TrapKind::NeighborDiscovery),
        "dhcp" => Some(TrapKind::Dhcp),
        "dhcpv6" => Some(TrapKind::Dhcpv6),
        "ssh" => Some(TrapKind::Ssh),
        "snmp" => Some(TrapKind::Snmp),
        "ip2me" => Some(TrapKind::Ip2Me),
        "l3_mtu_error" => Some(TrapKind::L3MtuError),
        "ttl_error" => Some(TrapKind::TtlError),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    fn fv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> CoppOrch {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver).unwrap();
        CoppOrch::new(ctx).unwrap()
    }

    #[test]
    fn test_group_with_policer_and_traps() {
        let mut copp = setup();
        copp.consumer_mut().add_to_sync(vec![KeyOpFieldValues::set(
            "queue4_group1",
            fv(&[
                ("trap_ids", "bgp,bgpv6"),
                ("trap_action", "trap"),
                ("queue", "4"),
                ("meter_type", "packets"),
                ("mode", "sr_tcm"),
                ("cir", "600"),
                ("cbs", "600"),
                ("red_action", "drop"),
            ]),
        )]);
        copp.do_task();

        assert!(copp.has_trap_group("queue4_group1"));
        assert_eq!(copp.pending(), 0);
        assert_eq!(copp.trap_group_count(), 2);
    }

    #[test]
    fn test_default_group_cannot_be_removed() {
        let mut copp = setup();
        copp.consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("default")]);
        copp.do_task();
        assert!(copp.has_trap_group("default"));
    }

    #[test]
    fn test_remove_rebinds_traps_to_default() {
        let mut copp = setup();
        copp.consumer_mut().add_to_sync(vec![KeyOpFieldValues::set(
            "queue4_group1",
            fv(&[("trap_ids", "bgp"), ("queue", "4")]),
        )]);
        copp.do_task();
        assert_eq!(
            copp.traps[&TrapKind::Bgp].1,
            "queue4_group1".to_string()
        );

        copp.consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("queue4_group1")]);
        copp.do_task();
        assert!(!copp.has_trap_group("queue4_group1"));
        assert_eq!(copp.traps[&TrapKind::Bgp].1, "default".to_string());
    }

    #[test]
    fn test_unknown_trap_id_is_invalid() {
        let mut copp = setup();
        copp.consumer_mut().add_to_sync(vec![KeyOpFieldValues::set(
            "bad",
            fv(&[("trap_ids", "warp_drive")]),
        )]);
        copp.do_task();
        assert_eq!(copp.pending(), 0);
        assert!(!copp.has_trap_group("bad"));
    }
}
