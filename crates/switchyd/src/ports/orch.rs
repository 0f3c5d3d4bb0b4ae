//! Port catalog orchestration.

use super::port::{Port, PortKind};
use crate::context::SwitchContext;
use crate::observer::{EventQueue, LagMemberUpdate, Update, VlanMemberUpdate};
use crate::tables::{self, LAG_MEMBER_TABLE, LAG_TABLE, PORT_TABLE, VLAN_MEMBER_TABLE, VLAN_TABLE};
use log::{error, info, warn};
use std::collections::{BTreeMap, HashMap};
use switchyd_orch_common::{
    Consumer, KeyOpFieldValues, OrchError, OrchResult, Operation, Store, TaskStatus,
};
use switchyd_sad::{AclBindOid, AclTableOid, PortOid, TaggingMode};
use switchyd_types::VlanId;

/// The port catalog (C4). Owns every registry entry and the driver
/// handles hanging off it.
pub struct PortsOrch {
    ctx: SwitchContext,
    consumers: HashMap<&'static str, Consumer>,
    ports: BTreeMap<String, Port>,
    cpu: Port,
    vlan_members: HashMap<(String, String), switchyd_sad::VlanMemberOid>,
    lag_members: HashMap<(String, String), switchyd_sad::LagMemberOid>,
    /// VLAN membership count per bridged port.
    bridge_refs: HashMap<String, u32>,
    config_done: bool,
    init_posted: bool,
}

pub const TABLES: [&str; 5] = [
    PORT_TABLE,
    VLAN_TABLE,
    VLAN_MEMBER_TABLE,
    LAG_TABLE,
    LAG_MEMBER_TABLE,
];

impl PortsOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        let cpu = Port::cpu(ctx.info().cpu_port);
        let consumers = TABLES
            .iter()
            .map(|table| (*table, Consumer::new(*table)))
            .collect();
        Self {
            ctx,
            consumers,
            ports: BTreeMap::new(),
            cpu,
            vlan_members: HashMap::new(),
            lag_members: HashMap::new(),
            bridge_refs: HashMap::new(),
            config_done: false,
            init_posted: false,
        }
    }

    pub fn consumer_mut(&mut self, table: &str) -> &mut Consumer {
        self.consumers
            .get_mut(table)
            .unwrap_or_else(|| panic!("ports orch has no consumer for table {}", table))
    }

    pub fn pending(&self, table: &str) -> usize {
        self.consumers.get(table).map(|c| c.len()).unwrap_or(0)
    }

    pub fn get(&self, alias: &str) -> Option<&Port> {
        self.ports.get(alias)
    }

    /// Looks a port up by its driver handle.
    pub fn get_by_oid(&self, oid: PortOid) -> Option<&Port> {
        self.ports.values().find(|p| p.port_oid == oid)
    }

    /// Looks a port up by its bridge port handle.
    pub fn get_by_bridge_port(&self, oid: switchyd_sad::BridgePortOid) -> Option<&Port> {
        self.ports.values().find(|p| p.bridge_port == Some(oid))
    }

    pub fn cpu_port(&self) -> PortOid {
        self.cpu.port_oid
    }

    /// All physical port aliases, in catalog order.
    pub fn phy_aliases(&self) -> Vec<String> {
        self.ports
            .values()
            .filter(|p| p.kind == PortKind::Phy)
            .map(|p| p.alias.clone())
            .collect()
    }

    pub fn set_rif(&mut self, alias: &str, rif: Option<switchyd_sad::RouterInterfaceOid>) {
        if let Some(port) = self.ports.get_mut(alias) {
            port.rif = rif;
        }
    }

    /// Binds an ingress ACL table to a physical port, returning the
    /// bind handle the caller must keep for unbinding.
    pub fn bind_acl_table(&self, alias: &str, table: AclTableOid) -> OrchResult<AclBindOid> {
        let port = self
            .ports
            .get(alias)
            .ok_or_else(|| OrchError::unresolved(format!("port {} does not exist", alias)))?;
        if port.kind != PortKind::Phy {
            return Err(OrchError::parse(format!(
                "port {} is not a physical port",
                alias
            )));
        }
        Ok(self.ctx.sad().bind_ingress_acl(port.port_oid, table)?)
    }

    pub fn init_done(&self) -> bool {
        self.init_posted
    }

    /// Posts the init-done signal once the seed configuration has been
    /// applied and every seeded alias has a live port. Returns true
    /// exactly once, on the tick that posts it.
    pub fn post_init_done(&mut self, store: &Store) -> bool {
        if !self.config_done || self.init_posted {
            return false;
        }
        let all_seeded = store
            .keys(PORT_TABLE)
            .into_iter()
            .filter(|key| key != tables::PORT_CONFIG_DONE && key != tables::PORT_INIT_DONE)
            .all(|alias| self.ports.contains_key(&alias));
        if !all_seeded {
            return false;
        }
        store.set(PORT_TABLE, tables::PORT_INIT_DONE, vec![]);
        self.init_posted = true;
        info!("port initialization done");
        true
    }

    pub fn do_task(&mut self, table: &str, events: &mut EventQueue) {
        let drained = self.consumer_mut(table).drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = match table {
                PORT_TABLE => self.process_port(&entry),
                VLAN_TABLE => self.process_vlan(&entry),
                VLAN_MEMBER_TABLE => self.process_vlan_member(&entry, events),
                LAG_TABLE => self.process_lag(&entry),
                LAG_MEMBER_TABLE => self.process_lag_member(&entry, events),
                _ => {
                    error!("ports orch received unknown table {}", table);
                    TaskStatus::Invalid
                }
            };
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", table, entry.key);
                }
            }
        }

        self.consumer_mut(table).requeue(retained);
    }

    fn process_port(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let alias = entry.key.as_str();

        if alias == tables::PORT_CONFIG_DONE {
            if entry.op == Operation::Set {
                info!("port seed configuration complete");
                self.config_done = true;
            }
            return TaskStatus::Consumed;
        }
        if alias == tables::PORT_INIT_DONE {
            return TaskStatus::Consumed;
        }

        match entry.op {
            Operation::Set => match self.apply_port(alias, entry) {
                Ok(()) => TaskStatus::Consumed,
                Err(e) => {
                    warn!("failed to apply port {}: {}", alias, e);
                    e.status()
                }
            },
            Operation::Del => {
                let Some(port) = self.ports.get(alias) else {
                    return TaskStatus::Consumed;
                };
                if port.rif.is_some() || port.bridge_port.is_some() {
                    return TaskStatus::Retry;
                }
                self.ports.remove(alias);
                info!("removed port {}", alias);
                TaskStatus::Consumed
            }
        }
    }

    fn apply_port(&mut self, alias: &str, entry: &KeyOpFieldValues) -> OrchResult<()> {
        if !self.ports.contains_key(alias) {
            let lanes_field = entry
                .field("lanes")
                .ok_or_else(|| OrchError::parse(format!("port {} has no lanes", alias)))?;
            let lanes: Vec<u32> = lanes_field
                .split(',')
                .map(|l| {
                    l.trim()
                        .parse::<u32>()
                        .map_err(|_| OrchError::parse(format!("invalid lane {:?}", l)))
                })
                .collect::<OrchResult<_>>()?;
            let port_oid = self.ctx.sad().port_by_lanes(&lanes)?;
            self.ports
                .insert(alias.to_string(), Port::phy(alias, port_oid));
            info!("created port {} on lanes {}", alias, lanes_field);
        }

        let port_oid = self.ports[alias].port_oid;
        if let Some(speed) = entry.field("speed") {
            let speed: u32 = speed
                .parse()
                .map_err(|_| OrchError::parse(format!("invalid speed {:?}", speed)))?;
            self.ctx.sad().set_port_speed(port_oid, speed)?;
        }
        if let Some(mtu) = entry.field("mtu") {
            let mtu: u32 = mtu
                .parse()
                .map_err(|_| OrchError::parse(format!("invalid mtu {:?}", mtu)))?;
            self.ctx.sad().set_port_mtu(port_oid, mtu)?;
        }
        if let Some(admin) = entry.field("admin_status") {
            let up = admin == "up";
            self.ctx.sad().set_port_admin_state(port_oid, up)?;
            if let Some(port) = self.ports.get_mut(alias) {
                port.admin_up = up;
            }
        }
        Ok(())
    }

    fn parse_vlan_id(key: &str) -> OrchResult<u16> {
        let digits = key
            .strip_prefix("Vlan")
            .ok_or_else(|| OrchError::parse(format!("invalid VLAN key {:?}", key)))?;
        let id: u16 = digits
            .parse()
            .map_err(|_| OrchError::parse(format!("invalid VLAN id {:?}", digits)))?;
        VlanId::new(id).map_err(|e| OrchError::parse(e.to_string()))?;
        Ok(id)
    }

    fn process_vlan(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let alias = entry.key.as_str();
        let vlan_id = match Self::parse_vlan_id(alias) {
            Ok(id) => id,
            Err(e) => {
                warn!("{}", e);
                return TaskStatus::Invalid;
            }
        };

        match entry.op {
            Operation::Set => {
                if self.ports.contains_key(alias) {
                    return TaskStatus::Consumed;
                }
                match self.ctx.sad().create_vlan(vlan_id) {
                    Ok(vlan_oid) => {
                        self.ports
                            .insert(alias.to_string(), Port::vlan(alias, vlan_oid, vlan_id));
                        info!("created VLAN {}", alias);
                        TaskStatus::Consumed
                    }
                    Err(e) => {
                        error!("failed to create VLAN {}: {}", alias, e);
                        TaskStatus::Retry
                    }
                }
            }
            Operation::Del => {
                let Some(port) = self.ports.get(alias) else {
                    return TaskStatus::Consumed;
                };
                if !port.members.is_empty() || port.rif.is_some() {
                    return TaskStatus::Retry;
                }
                let vlan_oid = port.vlan_oid.expect("VLAN entry without a VLAN handle");
                if let Err(e) = self.ctx.sad().remove_vlan(vlan_oid) {
                    error!("failed to remove VLAN {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
                self.ports.remove(alias);
                info!("removed VLAN {}", alias);
                TaskStatus::Consumed
            }
        }
    }

    fn process_vlan_member(
        &mut self,
        entry: &KeyOpFieldValues,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let Some((vlan_alias, member_alias)) = entry.key.split_once(':') else {
            warn!("invalid VLAN member key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let vlan_alias = vlan_alias.to_string();
        let member_alias = member_alias.to_string();
        let member_key = (vlan_alias.clone(), member_alias.clone());

        match entry.op {
            Operation::Set => {
                let Some(vlan) = self.ports.get(&vlan_alias) else {
                    return TaskStatus::Retry;
                };
                let (vlan_oid, vlan_id) = match (vlan.vlan_oid, vlan.vlan_id) {
                    (Some(oid), id) => (oid, id),
                    _ => return TaskStatus::Retry,
                };
                if self.vlan_members.contains_key(&member_key) {
                    return TaskStatus::Consumed;
                }
                let Some(member) = self.ports.get(&member_alias) else {
                    return TaskStatus::Retry;
                };
                let mode = match entry.field("tagging_mode") {
                    Some("tagged") => TaggingMode::Tagged,
                    Some("untagged") | None => TaggingMode::Untagged,
                    Some(other) => {
                        warn!("unknown tagging mode {:?}", other);
                        return TaskStatus::Invalid;
                    }
                };

                let bridge_anchor = member.bridge_anchor();
                let member_port_oid = member.port_oid;
                let member_kind = member.kind;
                let existing_bridge_port = member.bridge_port;
                let bridge_port = match existing_bridge_port {
                    Some(bp) => bp,
                    None => match self.ctx.sad().create_bridge_port(bridge_anchor) {
                        Ok(bp) => {
                            if let Some(m) = self.ports.get_mut(&member_alias) {
                                m.bridge_port = Some(bp);
                            }
                            bp
                        }
                        Err(e) => {
                            error!("failed to create bridge port for {}: {}", member_alias, e);
                            return TaskStatus::Retry;
                        }
                    },
                };

                let member_oid = match self.ctx.sad().create_vlan_member(vlan_oid, bridge_port, mode)
                {
                    Ok(oid) => oid,
                    Err(e) => {
                        error!(
                            "failed to add {} to {}: {}",
                            member_alias, vlan_alias, e
                        );
                        return TaskStatus::Retry;
                    }
                };

                if mode == TaggingMode::Untagged {
                    if let Some(m) = self.ports.get_mut(&member_alias) {
                        m.vlan_id = vlan_id;
                    }
                    if member_kind == PortKind::Phy {
                        if let Err(e) = self.ctx.sad().set_port_default_vlan(member_port_oid, vlan_id)
                        {
                            warn!("failed to set pvid on {}: {}", member_alias, e);
                        }
                    }
                }

                *self.bridge_refs.entry(member_alias.clone()).or_insert(0) += 1;
                self.vlan_members.insert(member_key, member_oid);
                if let Some(v) = self.ports.get_mut(&vlan_alias) {
                    v.members.insert(member_alias.clone());
                }
                info!("added {} to {}", member_alias, vlan_alias);
                events.push(Update::VlanMember(VlanMemberUpdate {
                    vlan: vlan_alias,
                    member: member_alias,
                    add: true,
                }));
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(member_oid) = self.vlan_members.remove(&member_key) else {
                    return TaskStatus::Consumed;
                };
                if let Err(e) = self.ctx.sad().remove_vlan_member(member_oid) {
                    error!(
                        "failed to remove {} from {}: {}",
                        member_alias, vlan_alias, e
                    );
                    self.vlan_members.insert(member_key, member_oid);
                    return TaskStatus::Retry;
                }
                if let Some(v) = self.ports.get_mut(&vlan_alias) {
                    v.members.remove(&member_alias);
                }
                let drop_bridge = match self.bridge_refs.get_mut(&member_alias) {
                    Some(count) => {
                        *count = count.saturating_sub(1);
                        *count == 0
                    }
                    None => false,
                };
                if drop_bridge {
                    self.bridge_refs.remove(&member_alias);
                    if let Some(m) = self.ports.get_mut(&member_alias) {
                        if let Some(bp) = m.bridge_port.take() {
                            if let Err(e) = self.ctx.sad().remove_bridge_port(bp) {
                                warn!("failed to remove bridge port of {}: {}", member_alias, e);
                            }
                        }
                    }
                }
                info!("removed {} from {}", member_alias, vlan_alias);
                events.push(Update::VlanMember(VlanMemberUpdate {
                    vlan: vlan_alias,
                    member: member_alias,
                    add: false,
                }));
                TaskStatus::Consumed
            }
        }
    }

    fn process_lag(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let alias = entry.key.as_str();
        match entry.op {
            Operation::Set => {
                if self.ports.contains_key(alias) {
                    return TaskStatus::Consumed;
                }
                match self.ctx.sad().create_lag() {
                    Ok(lag_oid) => {
                        self.ports
                            .insert(alias.to_string(), Port::lag(alias, lag_oid));
                        info!("created LAG {}", alias);
                        TaskStatus::Consumed
                    }
                    Err(e) => {
                        error!("failed to create LAG {}: {}", alias, e);
                        TaskStatus::Retry
                    }
                }
            }
            Operation::Del => {
                let Some(port) = self.ports.get(alias) else {
                    return TaskStatus::Consumed;
                };
                if !port.members.is_empty() || port.rif.is_some() || port.bridge_port.is_some() {
                    return TaskStatus::Retry;
                }
                let lag_oid = port.lag_oid.expect("LAG entry without a LAG handle");
                if let Err(e) = self.ctx.sad().remove_lag(lag_oid) {
                    error!("failed to remove LAG {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
                self.ports.remove(alias);
                info!("removed LAG {}", alias);
                TaskStatus::Consumed
            }
        }
    }

    fn process_lag_member(
        &mut self,
        entry: &KeyOpFieldValues,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let Some((lag_alias, member_alias)) = entry.key.split_once(':') else {
            warn!("invalid LAG member key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let lag_alias = lag_alias.to_string();
        let member_alias = member_alias.to_string();
        let member_key = (lag_alias.clone(), member_alias.clone());

        let enabled = entry.field("status").map(|s| s == "enabled").unwrap_or(true);
        let removing = entry.op == Operation::Del || !enabled;

        if removing {
            let Some(member_oid) = self.lag_members.remove(&member_key) else {
                return TaskStatus::Consumed;
            };
            if let Err(e) = self.ctx.sad().remove_lag_member(member_oid) {
                error!(
                    "failed to remove {} from {}: {}",
                    member_alias, lag_alias, e
                );
                self.lag_members.insert(member_key, member_oid);
                return TaskStatus::Retry;
            }
            if let Some(lag) = self.ports.get_mut(&lag_alias) {
                lag.members.remove(&member_alias);
            }
            info!("removed {} from {}", member_alias, lag_alias);
            events.push(Update::LagMember(LagMemberUpdate {
                lag: lag_alias,
                member: member_alias,
                add: false,
            }));
            return TaskStatus::Consumed;
        }

        if self.lag_members.contains_key(&member_key) {
            return TaskStatus::Consumed;
        }
        let Some(lag) = self.ports.get(&lag_alias) else {
            return TaskStatus::Retry;
        };
        let Some(lag_oid) = lag.lag_oid else {
            return TaskStatus::Retry;
        };
        let Some(member) = self.ports.get(&member_alias) else {
            return TaskStatus::Retry;
        };
        let member_port_oid = member.port_oid;

        match self.ctx.sad().create_lag_member(lag_oid, member_port_oid) {
            Ok(member_oid) => {
                self.lag_members.insert(member_key, member_oid);
                if let Some(lag) = self.ports.get_mut(&lag_alias) {
                    lag.members.insert(member_alias.clone());
                }
                info!("added {} to {}", member_alias, lag_alias);
                events.push(Update::LagMember(LagMemberUpdate {
                    lag: lag_alias,
                    member: member_alias,
                    add: true,
                }));
                TaskStatus::Consumed
            }
            Err(e) => {
                error!("failed to add {} to {}: {}", member_alias, lag_alias, e);
                TaskStatus::Retry
            }
        }
    }
}
