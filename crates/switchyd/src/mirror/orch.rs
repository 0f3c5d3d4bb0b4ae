//! Mirror session orchestration.
//!
//! A session walks `created -> nexthop resolved -> neighbor resolved
//! -> active`, falling back to inactive whenever any resolution is
//! lost. The resolved state is re-derived from queued updates: a
//! longest-prefix-match change picks the next hop, a neighbor change
//! supplies the MAC and port, FDB and LAG membership changes track the
//! monitor port for VLAN- and LAG-backed destinations.

use crate::context::SwitchContext;
use crate::fdb::FdbOrch;
use crate::neigh::{NeighOrch, NeighborEntry};
use crate::observer::{
    EventQueue, FdbUpdate, LagMemberUpdate, MirrorSessionUpdate, NeighborUpdate, NextHopUpdate,
    Update, VlanMemberUpdate,
};
use crate::ports::{PortKind, PortsOrch};
use crate::route::RouteOrch;
use crate::tables::MIRROR_SESSION_TABLE;
use log::{error, info, warn};
use std::collections::BTreeMap;
use switchyd_orch_common::{
    parse_u32_auto, Consumer, KeyOpFieldValues, Operation, Store, TaskStatus,
};
use switchyd_sad::{MirrorSessionOid, MirrorSessionSpec, MirrorVlanTag, RawOid};
use switchyd_types::{IpAddress, IpPrefix, MacAddress};

const SESSION_STATUS: &str = "status";
const SESSION_STATUS_ACTIVE: &str = "active";
const SESSION_STATUS_INACTIVE: &str = "inactive";

const DSCP_MAX: u32 = 63;
const DSCP_SHIFT: u8 = 2;
const IP_HDR_VERSION: u8 = 4;
const VLAN_TPID: u16 = 0x8100;

#[derive(Debug, Clone, Default)]
struct NexthopInfo {
    resolved: bool,
    nexthop: Option<IpAddress>,
    prefix: Option<IpPrefix>,
}

#[derive(Debug, Clone, Default)]
struct NeighborInfo {
    resolved: bool,
    mac: MacAddress,
    port_kind: Option<PortKind>,
    /// Alias of the port the neighbor resolved on (possibly a LAG or
    /// VLAN).
    port_alias: String,
    /// Alias of the physical port the session monitors.
    monitor_alias: String,
    monitor_port: RawOid,
    vlan_id: u16,
}

/// One mirror session and its resolution state.
#[derive(Debug, Clone)]
pub struct MirrorEntry {
    pub src_ip: IpAddress,
    pub dst_ip: IpAddress,
    pub gre_type: u16,
    pub dscp: u8,
    pub ttl: u8,
    pub queue: u8,
    pub add_vlan_tag: bool,
    status: bool,
    session_oid: Option<MirrorSessionOid>,
    ref_count: u32,
    nexthop: NexthopInfo,
    neighbor: NeighborInfo,
}

impl MirrorEntry {
    pub fn is_active(&self) -> bool {
        self.status
    }

    pub fn session_oid(&self) -> Option<MirrorSessionOid> {
        self.session_oid
    }
}

/// Mirror session orchestration (C8).
pub struct MirrorOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    store: Store,
    sessions: BTreeMap<String, MirrorEntry>,
}

impl MirrorOrch {
    pub fn new(ctx: SwitchContext, store: Store) -> Self {
        Self {
            ctx,
            consumer: Consumer::new(MIRROR_SESSION_TABLE),
            store,
            sessions: BTreeMap::new(),
        }
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    pub fn session_exists(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    pub fn session_state(&self, name: &str) -> Option<bool> {
        self.sessions.get(name).map(|s| s.status)
    }

    pub fn session_oid(&self, name: &str) -> Option<MirrorSessionOid> {
        self.sessions.get(name).and_then(|s| s.session_oid)
    }

    pub fn get_session(&self, name: &str) -> Option<&MirrorEntry> {
        self.sessions.get(name)
    }

    /// Takes a reference on a session (ACL rules do this to pin the
    /// session while they point at it). Returns false if the session
    /// does not exist.
    pub fn increase_ref(&mut self, name: &str) -> bool {
        match self.sessions.get_mut(name) {
            Some(session) => {
                session.ref_count += 1;
                true
            }
            None => false,
        }
    }

    pub fn decrease_ref(&mut self, name: &str) {
        let session = self
            .sessions
            .get_mut(name)
            .unwrap_or_else(|| panic!("reference decrement on missing mirror session {}", name));
        session.ref_count = session
            .ref_count
            .checked_sub(1)
            .unwrap_or_else(|| panic!("reference underflow on mirror session {}", name));
    }

    pub fn do_task(
        &mut self,
        route: &mut RouteOrch,
        neigh: &NeighOrch,
        ports: &PortsOrch,
        fdb: &FdbOrch,
        events: &mut EventQueue,
    ) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = match entry.op {
                Operation::Set => self.create_entry(&entry, route, neigh, ports, fdb, events),
                Operation::Del => self.delete_entry(&entry.key, route, events),
            };
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!(
                        "dropping invalid {} entry {}",
                        MIRROR_SESSION_TABLE, entry.key
                    );
                }
            }
        }

        self.consumer.requeue(retained);
    }

    fn create_entry(
        &mut self,
        entry: &KeyOpFieldValues,
        route: &mut RouteOrch,
        neigh: &NeighOrch,
        ports: &PortsOrch,
        fdb: &FdbOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let name = entry.key.clone();

        // Status writes are this orchestrator's own feedback loop.
        if entry.has_field(SESSION_STATUS) {
            return TaskStatus::Consumed;
        }

        let session = match parse_session(entry) {
            Ok(session) => session,
            Err(message) => {
                error!("failed to parse mirror session {}: {}", name, message);
                return TaskStatus::Invalid;
            }
        };

        if self.sessions.contains_key(&name) {
            error!("mirror session {} already exists", name);
            return TaskStatus::Invalid;
        }

        let dst_ip = session.dst_ip;
        self.sessions.insert(name.clone(), session);
        info!("created mirror session {}", name);

        let state = self.sessions.get(&name).expect("session just inserted");
        set_session_state(&self.store, &name, state);

        if let Some(update) = route.attach_nexthop_observer(dst_ip) {
            self.on_next_hop_update(&update, ports, fdb, neigh, events);
        }
        TaskStatus::Consumed
    }

    fn delete_entry(
        &mut self,
        name: &str,
        route: &mut RouteOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let Some(session) = self.sessions.get(name) else {
            error!("mirror session {} does not exist", name);
            return TaskStatus::Consumed;
        };
        if session.ref_count > 0 {
            error!("mirror session {} is in use", name);
            return TaskStatus::Consumed;
        }

        let dst_ip = session.dst_ip;
        let ctx = self.ctx.clone();
        let store = self.store.clone();

        route.detach_nexthop_observer(&dst_ip);
        if let Some(session) = self.sessions.get_mut(name) {
            if session.status {
                deactivate_session(&ctx, &store, name, session, events);
            }
        }
        self.sessions.remove(name);
        info!("removed mirror session {}", name);
        TaskStatus::Consumed
    }

    /// Longest-prefix-match change for some destination.
    pub fn on_next_hop_update(
        &mut self,
        update: &NextHopUpdate,
        ports: &PortsOrch,
        fdb: &FdbOrch,
        neigh: &NeighOrch,
        events: &mut EventQueue,
    ) {
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let names: Vec<String> = self.sessions.keys().cloned().collect();

        for name in names {
            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            if !update.prefix.contains(&session.dst_ip) {
                continue;
            }

            if update.nexthops.is_empty() {
                // The covering route went away.
                session.nexthop = NexthopInfo::default();
                session.neighbor.resolved = false;
                if session.status {
                    deactivate_session(&ctx, &store, &name, session, events);
                }
                continue;
            }

            if session.nexthop.resolved
                && session.nexthop.prefix == Some(update.prefix)
                && session
                    .nexthop
                    .nexthop
                    .map(|nh| update.nexthops.contains(&nh))
                    .unwrap_or(false)
            {
                // Same route, current next hop still in the group.
                continue;
            }

            let nexthop = *update.nexthops.iter().next().expect("non-empty next hop set");
            session.nexthop = NexthopInfo {
                resolved: true,
                nexthop: Some(nexthop),
                prefix: Some(update.prefix),
            };

            match neigh.neighbor_by_ip(&nexthop) {
                Some((neighbor, mac)) => {
                    if resolve_neighbor(session, &neighbor, mac, ports, fdb) {
                        if session.status {
                            update_session_dst_mac(&ctx, &name, session);
                            update_session_monitor_port(&ctx, &name, session);
                        } else {
                            activate_session(&ctx, &store, &name, session, events);
                        }
                    } else if session.status {
                        deactivate_session(&ctx, &store, &name, session, events);
                    }
                }
                None => {
                    session.neighbor.resolved = false;
                    if session.status {
                        deactivate_session(&ctx, &store, &name, session, events);
                    }
                }
            }
        }
    }

    /// Neighbor appeared, changed its MAC, or went away.
    pub fn on_neighbor_update(
        &mut self,
        update: &NeighborUpdate,
        ports: &PortsOrch,
        fdb: &FdbOrch,
        events: &mut EventQueue,
    ) {
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let names: Vec<String> = self.sessions.keys().cloned().collect();

        for name in names {
            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            if !session.nexthop.resolved
                || session.nexthop.nexthop != Some(update.entry.ip)
            {
                continue;
            }

            if update.add {
                if resolve_neighbor(session, &update.entry, update.mac, ports, fdb) {
                    if session.status {
                        update_session_dst_mac(&ctx, &name, session);
                        update_session_monitor_port(&ctx, &name, session);
                    } else {
                        activate_session(&ctx, &store, &name, session, events);
                    }
                } else if session.status {
                    deactivate_session(&ctx, &store, &name, session, events);
                }
            } else if session.status {
                deactivate_session(&ctx, &store, &name, session, events);
                session.neighbor.resolved = false;
            }
        }
    }

    /// FDB entry for some (MAC, VLAN) appeared or was flushed.
    pub fn on_fdb_update(
        &mut self,
        update: &FdbUpdate,
        ports: &PortsOrch,
        events: &mut EventQueue,
    ) {
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let names: Vec<String> = self.sessions.keys().cloned().collect();

        for name in names {
            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            if session.neighbor.port_kind != Some(PortKind::Vlan)
                || session.neighbor.mac != update.mac
                || session.neighbor.vlan_id != update.vlan_id
            {
                continue;
            }

            if update.add {
                let Some(member) = ports.get(&update.port) else {
                    continue;
                };
                let monitor = member.port_oid.as_raw();
                if session.status {
                    if session.neighbor.monitor_port != monitor {
                        session.neighbor.monitor_port = monitor;
                        session.neighbor.monitor_alias = update.port.clone();
                        update_session_monitor_port(&ctx, &name, session);
                    }
                } else {
                    session.neighbor.resolved = true;
                    session.neighbor.monitor_port = monitor;
                    session.neighbor.monitor_alias = update.port.clone();
                    activate_session(&ctx, &store, &name, session, events);
                }
            } else if session.status {
                deactivate_session(&ctx, &store, &name, session, events);
                session.neighbor.resolved = false;
                session.neighbor.monitor_port = 0;
            }
        }
    }

    /// LAG membership changed under a LAG-resolved session.
    pub fn on_lag_member_update(
        &mut self,
        update: &LagMemberUpdate,
        ports: &PortsOrch,
        events: &mut EventQueue,
    ) {
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let names: Vec<String> = self.sessions.keys().cloned().collect();

        for name in names {
            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            if session.neighbor.port_kind != Some(PortKind::Lag)
                || session.neighbor.port_alias != update.lag
            {
                continue;
            }

            let first_member = ports
                .get(&update.lag)
                .and_then(|lag| lag.members.iter().next().cloned());

            match first_member {
                None => {
                    // The LAG lost its last member.
                    if session.status {
                        deactivate_session(&ctx, &store, &name, session, events);
                    }
                    session.neighbor.resolved = false;
                    session.neighbor.monitor_port = 0;
                }
                Some(member_alias) => {
                    let Some(member) = ports.get(&member_alias) else {
                        continue;
                    };
                    let monitor = member.port_oid.as_raw();
                    if session.status {
                        if session.neighbor.monitor_port != monitor {
                            session.neighbor.monitor_port = monitor;
                            session.neighbor.monitor_alias = member_alias;
                            update_session_monitor_port(&ctx, &name, session);
                        }
                    } else if update.add && session.nexthop.resolved {
                        session.neighbor.resolved = true;
                        session.neighbor.monitor_port = monitor;
                        session.neighbor.monitor_alias = member_alias;
                        activate_session(&ctx, &store, &name, session, events);
                    }
                }
            }
        }
    }

    /// VLAN membership loss invalidates the monitor port; the session
    /// waits for the next FDB update to re-resolve.
    pub fn on_vlan_member_update(&mut self, update: &VlanMemberUpdate, events: &mut EventQueue) {
        if update.add {
            return;
        }
        let ctx = self.ctx.clone();
        let store = self.store.clone();
        let names: Vec<String> = self.sessions.keys().cloned().collect();

        for name in names {
            let Some(session) = self.sessions.get_mut(&name) else {
                continue;
            };
            if session.neighbor.port_kind != Some(PortKind::Vlan)
                || session.neighbor.port_alias != update.vlan
                || session.neighbor.monitor_alias != update.member
            {
                continue;
            }

            if session.status {
                deactivate_session(&ctx, &store, &name, session, events);
            }
            session.neighbor.resolved = false;
            session.neighbor.monitor_port = 0;
        }
    }
}

fn parse_session(entry: &KeyOpFieldValues) -> Result<MirrorEntry, String> {
    let mut src_ip = None;
    let mut dst_ip = None;
    let mut gre_type = 0u16;
    let mut dscp = 0u8;
    let mut ttl = 0u8;
    let mut queue = 0u8;
    let mut add_vlan_tag = false;

    for (field, value) in &entry.field_values {
        match field.as_str() {
            "src_ip" => {
                let ip: IpAddress = value
                    .parse()
                    .map_err(|e| format!("source address: {}", e))?;
                if !ip.is_ipv4() {
                    return Err("unsupported source address family".to_string());
                }
                src_ip = Some(ip);
            }
            "dst_ip" => {
                let ip: IpAddress = value
                    .parse()
                    .map_err(|e| format!("destination address: {}", e))?;
                if !ip.is_ipv4() {
                    return Err("unsupported destination address family".to_string());
                }
                dst_ip = Some(ip);
            }
            "gre_type" => {
                let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
                gre_type = u16::try_from(v).map_err(|_| format!("gre_type {} too large", v))?;
            }
            "dscp" => {
                let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
                if v > DSCP_MAX {
                    return Err(format!("dscp {} out of range", v));
                }
                dscp = v as u8;
            }
            "ttl" => {
                let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
                ttl = u8::try_from(v).map_err(|_| format!("ttl {} too large", v))?;
            }
            "queue" => {
                let v = parse_u32_auto(value).map_err(|e| e.to_string())?;
                queue = u8::try_from(v).map_err(|_| format!("queue {} too large", v))?;
            }
            "add_vlan_tag" => {
                add_vlan_tag = value == "true";
            }
            other => {
                return Err(format!("unknown attribute {:?}", other));
            }
        }
    }

    Ok(MirrorEntry {
        src_ip: src_ip.ok_or("missing src_ip")?,
        dst_ip: dst_ip.ok_or("missing dst_ip")?,
        gre_type,
        dscp,
        ttl,
        queue,
        add_vlan_tag,
        status: false,
        session_oid: None,
        ref_count: 0,
        nexthop: NexthopInfo::default(),
        neighbor: NeighborInfo::default(),
    })
}

/// Looks the neighbor's port up and derives the monitor port. Returns
/// false (leaving the session unresolved) when any hop is missing.
fn resolve_neighbor(
    session: &mut MirrorEntry,
    neighbor: &NeighborEntry,
    mac: MacAddress,
    ports: &PortsOrch,
    fdb: &FdbOrch,
) -> bool {
    session.neighbor.resolved = false;
    session.neighbor.mac = mac;

    let Some(port) = ports.get(&neighbor.alias) else {
        return false;
    };
    session.neighbor.port_kind = Some(port.kind);
    session.neighbor.port_alias = neighbor.alias.clone();

    match port.kind {
        PortKind::Vlan => {
            session.neighbor.vlan_id = port.vlan_id;
            let Some(member_alias) = fdb.lookup(&mac, port.vlan_id) else {
                return false;
            };
            let Some(member) = ports.get(member_alias) else {
                return false;
            };
            session.neighbor.monitor_alias = member_alias.to_string();
            session.neighbor.monitor_port = member.port_oid.as_raw();
        }
        PortKind::Lag => {
            session.neighbor.vlan_id = if session.add_vlan_tag { port.vlan_id } else { 0 };
            let Some(member_alias) = port.members.iter().next() else {
                return false;
            };
            let Some(member) = ports.get(member_alias) else {
                return false;
            };
            session.neighbor.monitor_alias = member_alias.clone();
            session.neighbor.monitor_port = member.port_oid.as_raw();
        }
        PortKind::Phy | PortKind::Cpu => {
            session.neighbor.vlan_id = if session.add_vlan_tag { port.vlan_id } else { 0 };
            session.neighbor.monitor_alias = neighbor.alias.clone();
            session.neighbor.monitor_port = port.port_oid.as_raw();
        }
    }

    session.neighbor.resolved = true;
    true
}

fn set_session_state(store: &Store, name: &str, session: &MirrorEntry) {
    let status = if session.status {
        SESSION_STATUS_ACTIVE
    } else {
        SESSION_STATUS_INACTIVE
    };
    store.set(
        MIRROR_SESSION_TABLE,
        name,
        vec![(SESSION_STATUS.to_string(), status.to_string())],
    );
}

fn activate_session(
    ctx: &SwitchContext,
    store: &Store,
    name: &str,
    session: &mut MirrorEntry,
    events: &mut EventQueue,
) {
    assert!(!session.status, "activating an active mirror session");

    let vlan = (session.neighbor.vlan_id != 0).then_some(MirrorVlanTag {
        tpid: VLAN_TPID,
        vlan_id: session.neighbor.vlan_id,
        pri: 0,
        cfi: 0,
    });
    let spec = MirrorSessionSpec {
        monitor_port: session.neighbor.monitor_port,
        vlan,
        iphdr_version: IP_HDR_VERSION,
        tos: session.dscp << DSCP_SHIFT,
        ttl: session.ttl,
        src_ip: session.src_ip,
        dst_ip: session.dst_ip,
        src_mac: ctx.info().mac,
        dst_mac: session.neighbor.mac,
        gre_protocol: session.gre_type,
        traffic_class: (session.queue != 0).then_some(session.queue),
    };

    match ctx.sad().create_mirror_session(&spec) {
        Ok(oid) => {
            session.session_oid = Some(oid);
            session.status = true;
            info!("activated mirror session {}", name);
        }
        Err(e) => {
            error!("failed to activate mirror session {}: {}", name, e);
            session.status = false;
        }
    }

    set_session_state(store, name, session);
    events.push(Update::MirrorSession(MirrorSessionUpdate {
        name: name.to_string(),
        active: session.status,
    }));
}

fn deactivate_session(
    ctx: &SwitchContext,
    store: &Store,
    name: &str,
    session: &mut MirrorEntry,
    events: &mut EventQueue,
) {
    assert!(session.status, "deactivating an inactive mirror session");

    // Observers see the session go down before its handle dies, so
    // rules referencing it detach first.
    events.push(Update::MirrorSession(MirrorSessionUpdate {
        name: name.to_string(),
        active: false,
    }));

    if let Some(oid) = session.session_oid.take() {
        if let Err(e) = ctx.sad().remove_mirror_session(oid) {
            error!("failed to deactivate mirror session {}: {}", name, e);
        }
    }
    session.status = false;
    set_session_state(store, name, session);
    info!("deactivated mirror session {}", name);
}

fn update_session_dst_mac(ctx: &SwitchContext, name: &str, session: &MirrorEntry) {
    let Some(oid) = session.session_oid else {
        return;
    };
    if let Err(e) = ctx.sad().set_mirror_dst_mac(oid, session.neighbor.mac) {
        error!(
            "failed to update mirror session {} destination MAC: {}",
            name, e
        );
    }
}

fn update_session_monitor_port(ctx: &SwitchContext, name: &str, session: &MirrorEntry) {
    let Some(oid) = session.session_oid else {
        return;
    };
    if let Err(e) = ctx
        .sad()
        .set_mirror_monitor_port(oid, session.neighbor.monitor_port)
    {
        error!(
            "failed to update mirror session {} monitor port: {}",
            name, e
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_parse_session() {
        let entry = KeyOpFieldValues::set(
            "everflow0",
            fv(&[
                ("src_ip", "10.1.1.1"),
                ("dst_ip", "20.1.1.1"),
                ("gre_type", "0x88be"),
                ("dscp", "8"),
                ("ttl", "255"),
                ("queue", "0"),
            ]),
        );
        let session = parse_session(&entry).unwrap();
        assert_eq!(session.gre_type, 0x88be);
        assert_eq!(session.dscp, 8);
        assert_eq!(session.ttl, 255);
        assert!(!session.is_active());
    }

    #[test]
    fn test_parse_rejects_ipv6_and_bad_dscp() {
        let v6 = KeyOpFieldValues::set(
            "s",
            fv(&[("src_ip", "2001:db8::1"), ("dst_ip", "20.1.1.1")]),
        );
        assert!(parse_session(&v6).is_err());

        let dscp = KeyOpFieldValues::set(
            "s",
            fv(&[("src_ip", "10.1.1.1"), ("dst_ip", "20.1.1.1"), ("dscp", "64")]),
        );
        assert!(parse_session(&dscp).is_err());
    }

    #[test]
    fn test_parse_rejects_unknown_attribute() {
        let entry = KeyOpFieldValues::set(
            "s",
            fv(&[("src_ip", "10.1.1.1"), ("dst_ip", "20.1.1.1"), ("bogus", "1")]),
        );
        assert!(parse_session(&entry).is_err());
    }
}
