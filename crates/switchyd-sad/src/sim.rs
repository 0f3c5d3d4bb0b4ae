//! In-process software driver.
//!
//! `SimDriver` implements the full [`SwitchDriver`] surface against
//! in-memory object tables. It validates handles, enforces the same
//! existence rules a hardware backend would, and keeps an operation
//! log the test suite inspects to verify call sequences.

use crate::driver::*;
use crate::error::{SadError, SadResult};
use crate::types::*;
use log::debug;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use switchyd_types::{IpPrefix, MacAddress};

/// Construction parameters for the software switch.
#[derive(Debug, Clone)]
pub struct SimConfig {
    pub port_count: usize,
    pub queues_per_port: usize,
    pub priority_groups_per_port: usize,
    pub mac: MacAddress,
    pub max_ecmp_groups: u32,
    pub ecmp_count_for_unit_group: bool,
    pub acl_min_priority: u32,
    pub acl_max_priority: u32,
    pub dscp_ecn_match_capable: bool,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            port_count: 32,
            queues_per_port: 8,
            priority_groups_per_port: 8,
            mac: MacAddress::new([0x52, 0x54, 0x00, 0x42, 0x07, 0x01]),
            max_ecmp_groups: 128,
            ecmp_count_for_unit_group: false,
            acl_min_priority: 1,
            acl_max_priority: 10000,
            dscp_ecn_match_capable: true,
        }
    }
}

struct SimPort {
    oid: RawOid,
    assigned: bool,
    queues: Vec<RawOid>,
    priority_groups: Vec<RawOid>,
    /// (group handle, child handles)
    scheduler_groups: Vec<(RawOid, Vec<RawOid>)>,
}

struct SimRoute {
    action: PacketAction,
    next_hop: Option<RawOid>,
}

struct SimState {
    next_oid: RawOid,
    /// Kind string per live handle.
    objects: HashMap<RawOid, &'static str>,
    ports: Vec<SimPort>,
    lane_map: HashMap<Vec<u32>, RawOid>,
    routes: HashMap<RouteId, SimRoute>,
    neighbors: HashMap<NeighborId, MacAddress>,
    fdb: HashMap<FdbId, RawOid>,
    mirror_sessions: HashMap<RawOid, MirrorSessionSpec>,
    nhg_members: HashMap<RawOid, RawOid>,
    acl_counters: HashMap<RawOid, (u64, u64)>,
    ops: VecDeque<String>,
    route_creates: u64,
    route_removes: u64,
}

impl SimState {
    fn alloc(&mut self, kind: &'static str) -> RawOid {
        self.next_oid += 1;
        let oid = self.next_oid;
        self.objects.insert(oid, kind);
        oid
    }

    fn check(&self, oid: RawOid, kind: &'static str) -> SadResult<()> {
        match self.objects.get(&oid) {
            Some(k) if *k == kind => Ok(()),
            Some(k) => Err(SadError::invalid_parameter(format!(
                "handle 0x{:x} is a {} not a {}",
                oid, k, kind
            ))),
            None => Err(SadError::not_found(format!("{} 0x{:x}", kind, oid))),
        }
    }

    fn free(&mut self, oid: RawOid, kind: &'static str) -> SadResult<()> {
        self.check(oid, kind)?;
        self.objects.remove(&oid);
        Ok(())
    }

    fn count_kind(&self, kind: &str) -> usize {
        self.objects.values().filter(|k| **k == kind).count()
    }

    fn op(&mut self, op: String) {
        debug!("sim: {}", op);
        self.ops.push_back(op);
    }
}

/// The software switch.
pub struct SimDriver {
    info: SwitchInfo,
    state: Mutex<SimState>,
    log_rotate_requested: AtomicBool,
}

impl SimDriver {
    pub fn new(config: SimConfig) -> Self {
        let mut state = SimState {
            next_oid: 0,
            objects: HashMap::new(),
            ports: Vec::new(),
            lane_map: HashMap::new(),
            routes: HashMap::new(),
            neighbors: HashMap::new(),
            fdb: HashMap::new(),
            mirror_sessions: HashMap::new(),
            nhg_members: HashMap::new(),
            acl_counters: HashMap::new(),
            ops: VecDeque::new(),
            route_creates: 0,
            route_removes: 0,
        };

        let cpu_port = state.alloc("port");
        let virtual_router = state.alloc("vrouter");
        let default_trap_group = state.alloc("trapgroup");

        for _ in 0..config.port_count {
            let oid = state.alloc("port");
            let queues: Vec<RawOid> = (0..config.queues_per_port)
                .map(|_| state.alloc("queue"))
                .collect();
            let priority_groups: Vec<RawOid> = (0..config.priority_groups_per_port)
                .map(|_| state.alloc("prioritygroup"))
                .collect();
            // Two levels are enough to exercise the tree walk: split
            // the queue list across two groups.
            let half = queues.len() / 2;
            let g0 = state.alloc("schedgroup");
            let g1 = state.alloc("schedgroup");
            let scheduler_groups = vec![
                (g0, queues[..half].to_vec()),
                (g1, queues[half..].to_vec()),
            ];
            state.ports.push(SimPort {
                oid,
                assigned: false,
                queues,
                priority_groups,
                scheduler_groups,
            });
        }

        let info = SwitchInfo {
            mac: config.mac,
            cpu_port: PortOid::from_raw(cpu_port),
            virtual_router: VirtualRouterOid::from_raw(virtual_router),
            default_trap_group: TrapGroupOid::from_raw(default_trap_group),
            max_ecmp_groups: config.max_ecmp_groups,
            ecmp_count_for_unit_group: config.ecmp_count_for_unit_group,
            acl_min_priority: config.acl_min_priority,
            acl_max_priority: config.acl_max_priority,
            dscp_ecn_match_capable: config.dscp_ecn_match_capable,
        };

        Self {
            info,
            state: Mutex::new(state),
            log_rotate_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SimState> {
        self.state.lock().expect("sim driver state poisoned")
    }

    fn default_route_id(&self, destination: IpPrefix) -> RouteId {
        RouteId {
            virtual_router: self.info.virtual_router,
            destination,
        }
    }

    // Test and inspection helpers; not part of the driver contract.

    /// Drains and returns the operation log.
    pub fn take_ops(&self) -> Vec<String> {
        self.lock().ops.drain(..).collect()
    }

    pub fn route_count(&self) -> usize {
        self.lock().routes.len()
    }

    pub fn has_route(&self, destination: &IpPrefix) -> bool {
        let id = self.default_route_id(*destination);
        self.lock().routes.contains_key(&id)
    }

    /// Returns (action, next hop) for a route in the default virtual
    /// router.
    pub fn route_state(&self, destination: &IpPrefix) -> Option<(PacketAction, Option<RawOid>)> {
        let id = self.default_route_id(*destination);
        self.lock()
            .routes
            .get(&id)
            .map(|r| (r.action, r.next_hop))
    }

    pub fn route_creates(&self) -> u64 {
        self.lock().route_creates
    }

    pub fn route_removes(&self) -> u64 {
        self.lock().route_removes
    }

    pub fn next_hop_count(&self) -> usize {
        self.lock().count_kind("nexthop")
    }

    pub fn next_hop_group_count(&self) -> usize {
        self.lock().count_kind("nexthopgroup")
    }

    pub fn mirror_session_count(&self) -> usize {
        self.lock().mirror_sessions.len()
    }

    pub fn mirror_sessions(&self) -> Vec<MirrorSessionSpec> {
        self.lock().mirror_sessions.values().cloned().collect()
    }

    pub fn acl_table_count(&self) -> usize {
        self.lock().count_kind("acltable")
    }

    pub fn acl_entry_count(&self) -> usize {
        self.lock().count_kind("aclentry")
    }

    pub fn acl_range_count(&self) -> usize {
        self.lock().count_kind("aclrange")
    }

    pub fn acl_counter_count(&self) -> usize {
        self.lock().acl_counters.len()
    }

    /// Seeds a counter value, as traffic would.
    pub fn set_acl_counter(&self, counter: AclCounterOid, packets: u64, bytes: u64) {
        self.lock()
            .acl_counters
            .insert(counter.as_raw(), (packets, bytes));
    }

    pub fn log_rotate_requested(&self) -> bool {
        self.log_rotate_requested.load(Ordering::SeqCst)
    }
}

impl SwitchDriver for SimDriver {
    fn switch_info(&self) -> SadResult<SwitchInfo> {
        Ok(self.info.clone())
    }

    fn request_log_rotate(&self) {
        self.log_rotate_requested.store(true, Ordering::SeqCst);
    }

    fn port_by_lanes(&self, lanes: &[u32]) -> SadResult<PortOid> {
        let mut st = self.lock();
        let key: Vec<u32> = lanes.to_vec();
        if let Some(oid) = st.lane_map.get(&key) {
            return Ok(PortOid::from_raw(*oid));
        }
        let slot = st
            .ports
            .iter()
            .position(|p| !p.assigned)
            .ok_or_else(|| SadError::table_full("port"))?;
        st.ports[slot].assigned = true;
        let oid = st.ports[slot].oid;
        st.lane_map.insert(key, oid);
        Ok(PortOid::from_raw(oid))
    }

    fn set_port_admin_state(&self, port: PortOid, up: bool) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.op(format!("set_port_admin_state {} {}", port, up));
        Ok(())
    }

    fn set_port_mtu(&self, port: PortOid, mtu: u32) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.op(format!("set_port_mtu {} {}", port, mtu));
        Ok(())
    }

    fn set_port_speed(&self, port: PortOid, speed: u32) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.op(format!("set_port_speed {} {}", port, speed));
        Ok(())
    }

    fn set_port_default_vlan(&self, port: PortOid, vlan_id: u16) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.op(format!("set_port_default_vlan {} {}", port, vlan_id));
        Ok(())
    }

    fn bind_ingress_acl(&self, port: PortOid, table: AclTableOid) -> SadResult<AclBindOid> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.check(table.as_raw(), "acltable")?;
        let oid = st.alloc("aclbind");
        st.op(format!("bind_ingress_acl {} {}", port, table));
        Ok(AclBindOid::from_raw(oid))
    }

    fn unbind_ingress_acl(&self, bind: AclBindOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(bind.as_raw(), "aclbind")?;
        st.op(format!("unbind_ingress_acl {}", bind));
        Ok(())
    }

    fn port_queues(&self, port: PortOid) -> SadResult<Vec<QueueOid>> {
        let st = self.lock();
        let p = st
            .ports
            .iter()
            .find(|p| p.oid == port.as_raw())
            .ok_or_else(|| SadError::not_found(format!("port {}", port)))?;
        Ok(p.queues.iter().map(|q| QueueOid::from_raw(*q)).collect())
    }

    fn port_priority_groups(&self, port: PortOid) -> SadResult<Vec<PriorityGroupOid>> {
        let st = self.lock();
        let p = st
            .ports
            .iter()
            .find(|p| p.oid == port.as_raw())
            .ok_or_else(|| SadError::not_found(format!("port {}", port)))?;
        Ok(p.priority_groups
            .iter()
            .map(|g| PriorityGroupOid::from_raw(*g))
            .collect())
    }

    fn port_scheduler_groups(&self, port: PortOid) -> SadResult<Vec<SchedulerGroupOid>> {
        let st = self.lock();
        let p = st
            .ports
            .iter()
            .find(|p| p.oid == port.as_raw())
            .ok_or_else(|| SadError::not_found(format!("port {}", port)))?;
        Ok(p.scheduler_groups
            .iter()
            .map(|(g, _)| SchedulerGroupOid::from_raw(*g))
            .collect())
    }

    fn scheduler_group_children(&self, group: SchedulerGroupOid) -> SadResult<Vec<RawOid>> {
        let st = self.lock();
        for p in &st.ports {
            for (g, children) in &p.scheduler_groups {
                if *g == group.as_raw() {
                    return Ok(children.clone());
                }
            }
        }
        Err(SadError::not_found(format!("scheduler group {}", group)))
    }

    fn set_scheduler_group_profile(
        &self,
        group: SchedulerGroupOid,
        profile: Option<SchedulerOid>,
    ) -> SadResult<()> {
        let mut st = self.lock();
        if let Some(p) = profile {
            st.check(p.as_raw(), "scheduler")?;
        }
        st.op(format!(
            "set_scheduler_group_profile {} {:?}",
            group,
            profile.map(|p| p.as_raw())
        ));
        Ok(())
    }

    fn set_queue_wred_profile(&self, queue: QueueOid, profile: Option<WredOid>) -> SadResult<()> {
        let mut st = self.lock();
        st.check(queue.as_raw(), "queue")?;
        if let Some(p) = profile {
            st.check(p.as_raw(), "wred")?;
        }
        st.op(format!(
            "set_queue_wred_profile {} {:?}",
            queue,
            profile.map(|p| p.as_raw())
        ));
        Ok(())
    }

    fn set_queue_buffer_profile(
        &self,
        queue: QueueOid,
        profile: Option<BufferProfileOid>,
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(queue.as_raw(), "queue")?;
        if let Some(p) = profile {
            st.check(p.as_raw(), "bufferprofile")?;
        }
        st.op(format!(
            "set_queue_buffer_profile {} {:?}",
            queue,
            profile.map(|p| p.as_raw())
        ));
        Ok(())
    }

    fn set_priority_group_buffer_profile(
        &self,
        group: PriorityGroupOid,
        profile: Option<BufferProfileOid>,
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(group.as_raw(), "prioritygroup")?;
        if let Some(p) = profile {
            st.check(p.as_raw(), "bufferprofile")?;
        }
        st.op(format!(
            "set_priority_group_buffer_profile {} {:?}",
            group,
            profile.map(|p| p.as_raw())
        ));
        Ok(())
    }

    fn set_port_qos_map(
        &self,
        port: PortOid,
        kind: QosMapKind,
        map: Option<QosMapOid>,
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        if let Some(m) = map {
            st.check(m.as_raw(), "qosmap")?;
        }
        st.op(format!(
            "set_port_qos_map {} {:?} {:?}",
            port,
            kind,
            map.map(|m| m.as_raw())
        ));
        Ok(())
    }

    fn set_port_pfc(&self, port: PortOid, bitmask: u8) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        st.op(format!("set_port_pfc {} {:#04x}", port, bitmask));
        Ok(())
    }

    fn set_port_buffer_profile_list(
        &self,
        port: PortOid,
        direction: BufferDirection,
        profiles: &[BufferProfileOid],
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(port.as_raw(), "port")?;
        for p in profiles {
            st.check(p.as_raw(), "bufferprofile")?;
        }
        st.op(format!(
            "set_port_buffer_profile_list {} {:?} {}",
            port,
            direction,
            profiles.len()
        ));
        Ok(())
    }

    fn create_bridge_port(&self, port: RawOid) -> SadResult<BridgePortOid> {
        let mut st = self.lock();
        if !st.objects.contains_key(&port) {
            return Err(SadError::not_found(format!("port 0x{:x}", port)));
        }
        let oid = st.alloc("bridgeport");
        st.op(format!("create_bridge_port 0x{:x}", port));
        Ok(BridgePortOid::from_raw(oid))
    }

    fn remove_bridge_port(&self, bridge_port: BridgePortOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(bridge_port.as_raw(), "bridgeport")?;
        st.op(format!("remove_bridge_port {}", bridge_port));
        Ok(())
    }

    fn create_vlan(&self, vlan_id: u16) -> SadResult<VlanOid> {
        let mut st = self.lock();
        let oid = st.alloc("vlan");
        st.op(format!("create_vlan {}", vlan_id));
        Ok(VlanOid::from_raw(oid))
    }

    fn remove_vlan(&self, vlan: VlanOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(vlan.as_raw(), "vlan")?;
        st.op(format!("remove_vlan {}", vlan));
        Ok(())
    }

    fn create_vlan_member(
        &self,
        vlan: VlanOid,
        bridge_port: BridgePortOid,
        mode: TaggingMode,
    ) -> SadResult<VlanMemberOid> {
        let mut st = self.lock();
        st.check(vlan.as_raw(), "vlan")?;
        st.check(bridge_port.as_raw(), "bridgeport")?;
        let oid = st.alloc("vlanmember");
        st.op(format!("create_vlan_member {} {} {:?}", vlan, bridge_port, mode));
        Ok(VlanMemberOid::from_raw(oid))
    }

    fn remove_vlan_member(&self, member: VlanMemberOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(member.as_raw(), "vlanmember")?;
        st.op(format!("remove_vlan_member {}", member));
        Ok(())
    }

    fn create_lag(&self) -> SadResult<LagOid> {
        let mut st = self.lock();
        let oid = st.alloc("lag");
        st.op("create_lag".to_string());
        Ok(LagOid::from_raw(oid))
    }

    fn remove_lag(&self, lag: LagOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(lag.as_raw(), "lag")?;
        st.op(format!("remove_lag {}", lag));
        Ok(())
    }

    fn create_lag_member(&self, lag: LagOid, port: PortOid) -> SadResult<LagMemberOid> {
        let mut st = self.lock();
        st.check(lag.as_raw(), "lag")?;
        st.check(port.as_raw(), "port")?;
        let oid = st.alloc("lagmember");
        st.op(format!("create_lag_member {} {}", lag, port));
        Ok(LagMemberOid::from_raw(oid))
    }

    fn remove_lag_member(&self, member: LagMemberOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(member.as_raw(), "lagmember")?;
        st.op(format!("remove_lag_member {}", member));
        Ok(())
    }

    fn create_router_interface(&self, config: &RifConfig) -> SadResult<RouterInterfaceOid> {
        let mut st = self.lock();
        let anchor = match config.anchor {
            RifAnchor::Port(p) => {
                st.check(p.as_raw(), "port")?;
                p.as_raw()
            }
            RifAnchor::Lag(l) => {
                st.check(l.as_raw(), "lag")?;
                l.as_raw()
            }
            RifAnchor::Vlan(v) => {
                st.check(v.as_raw(), "vlan")?;
                v.as_raw()
            }
        };
        let oid = st.alloc("rif");
        st.op(format!("create_router_interface 0x{:x}", anchor));
        Ok(RouterInterfaceOid::from_raw(oid))
    }

    fn remove_router_interface(&self, rif: RouterInterfaceOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(rif.as_raw(), "rif")?;
        st.op(format!("remove_router_interface {}", rif));
        Ok(())
    }

    fn create_neighbor(&self, id: &NeighborId, mac: MacAddress) -> SadResult<()> {
        let mut st = self.lock();
        st.check(id.rif.as_raw(), "rif")?;
        if st.neighbors.contains_key(id) {
            return Err(SadError::already_exists(format!("neighbor {}", id.ip)));
        }
        st.neighbors.insert(*id, mac);
        st.op(format!("create_neighbor {} {}", id.ip, mac));
        Ok(())
    }

    fn set_neighbor_mac(&self, id: &NeighborId, mac: MacAddress) -> SadResult<()> {
        let mut st = self.lock();
        match st.neighbors.get_mut(id) {
            Some(entry) => {
                *entry = mac;
            }
            None => return Err(SadError::not_found(format!("neighbor {}", id.ip))),
        }
        st.op(format!("set_neighbor_mac {} {}", id.ip, mac));
        Ok(())
    }

    fn remove_neighbor(&self, id: &NeighborId) -> SadResult<()> {
        let mut st = self.lock();
        if st.neighbors.remove(id).is_none() {
            return Err(SadError::not_found(format!("neighbor {}", id.ip)));
        }
        st.op(format!("remove_neighbor {}", id.ip));
        Ok(())
    }

    fn create_next_hop(&self, ip: switchyd_types::IpAddress, rif: RouterInterfaceOid) -> SadResult<NextHopOid> {
        let mut st = self.lock();
        st.check(rif.as_raw(), "rif")?;
        let oid = st.alloc("nexthop");
        st.op(format!("create_next_hop {}", ip));
        Ok(NextHopOid::from_raw(oid))
    }

    fn remove_next_hop(&self, next_hop: NextHopOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(next_hop.as_raw(), "nexthop")?;
        st.op(format!("remove_next_hop {}", next_hop));
        Ok(())
    }

    fn create_next_hop_group(&self) -> SadResult<NextHopGroupOid> {
        let mut st = self.lock();
        let oid = st.alloc("nexthopgroup");
        st.op("create_next_hop_group".to_string());
        Ok(NextHopGroupOid::from_raw(oid))
    }

    fn remove_next_hop_group(&self, group: NextHopGroupOid) -> SadResult<()> {
        let mut st = self.lock();
        if st.nhg_members.values().any(|g| *g == group.as_raw()) {
            return Err(SadError::object_in_use(format!("next hop group {}", group)));
        }
        st.free(group.as_raw(), "nexthopgroup")?;
        st.op(format!("remove_next_hop_group {}", group));
        Ok(())
    }

    fn create_next_hop_group_member(
        &self,
        group: NextHopGroupOid,
        next_hop: NextHopOid,
    ) -> SadResult<NextHopGroupMemberOid> {
        let mut st = self.lock();
        st.check(group.as_raw(), "nexthopgroup")?;
        st.check(next_hop.as_raw(), "nexthop")?;
        let oid = st.alloc("nhgmember");
        st.nhg_members.insert(oid, group.as_raw());
        st.op(format!("create_next_hop_group_member {} {}", group, next_hop));
        Ok(NextHopGroupMemberOid::from_raw(oid))
    }

    fn remove_next_hop_group_member(&self, member: NextHopGroupMemberOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(member.as_raw(), "nhgmember")?;
        st.nhg_members.remove(&member.as_raw());
        st.op(format!("remove_next_hop_group_member {}", member));
        Ok(())
    }

    fn create_route(
        &self,
        id: &RouteId,
        action: PacketAction,
        next_hop: Option<RawOid>,
    ) -> SadResult<()> {
        let mut st = self.lock();
        if st.routes.contains_key(id) {
            return Err(SadError::already_exists(format!("route {}", id.destination)));
        }
        st.routes.insert(*id, SimRoute { action, next_hop });
        st.route_creates += 1;
        st.op(format!("create_route {} {:?}", id.destination, action));
        Ok(())
    }

    fn set_route_action(&self, id: &RouteId, action: PacketAction) -> SadResult<()> {
        let mut st = self.lock();
        match st.routes.get_mut(id) {
            Some(route) => route.action = action,
            None => return Err(SadError::not_found(format!("route {}", id.destination))),
        }
        st.op(format!("set_route_action {} {:?}", id.destination, action));
        Ok(())
    }

    fn set_route_next_hop(&self, id: &RouteId, next_hop: Option<RawOid>) -> SadResult<()> {
        let mut st = self.lock();
        match st.routes.get_mut(id) {
            Some(route) => route.next_hop = next_hop,
            None => return Err(SadError::not_found(format!("route {}", id.destination))),
        }
        st.op(format!("set_route_next_hop {}", id.destination));
        Ok(())
    }

    fn remove_route(&self, id: &RouteId) -> SadResult<()> {
        let mut st = self.lock();
        if st.routes.remove(id).is_none() {
            return Err(SadError::not_found(format!("route {}", id.destination)));
        }
        st.route_removes += 1;
        st.op(format!("remove_route {}", id.destination));
        Ok(())
    }

    fn create_fdb_entry(
        &self,
        id: &FdbId,
        bridge_port: BridgePortOid,
        is_static: bool,
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(bridge_port.as_raw(), "bridgeport")?;
        if st.fdb.contains_key(id) {
            return Err(SadError::already_exists(format!("fdb entry {}", id.mac)));
        }
        st.fdb.insert(*id, bridge_port.as_raw());
        st.op(format!("create_fdb_entry {} {} {}", id.mac, id.vlan_id, is_static));
        Ok(())
    }

    fn remove_fdb_entry(&self, id: &FdbId) -> SadResult<()> {
        let mut st = self.lock();
        if st.fdb.remove(id).is_none() {
            return Err(SadError::not_found(format!("fdb entry {}", id.mac)));
        }
        st.op(format!("remove_fdb_entry {} {}", id.mac, id.vlan_id));
        Ok(())
    }

    fn create_mirror_session(&self, spec: &MirrorSessionSpec) -> SadResult<MirrorSessionOid> {
        let mut st = self.lock();
        let oid = st.alloc("mirrorsession");
        st.mirror_sessions.insert(oid, spec.clone());
        st.op(format!("create_mirror_session dst {}", spec.dst_ip));
        Ok(MirrorSessionOid::from_raw(oid))
    }

    fn set_mirror_monitor_port(&self, session: MirrorSessionOid, port: RawOid) -> SadResult<()> {
        let mut st = self.lock();
        match st.mirror_sessions.get_mut(&session.as_raw()) {
            Some(spec) => spec.monitor_port = port,
            None => return Err(SadError::not_found(format!("mirror session {}", session))),
        }
        st.op(format!("set_mirror_monitor_port {}", session));
        Ok(())
    }

    fn set_mirror_dst_mac(&self, session: MirrorSessionOid, mac: MacAddress) -> SadResult<()> {
        let mut st = self.lock();
        match st.mirror_sessions.get_mut(&session.as_raw()) {
            Some(spec) => spec.dst_mac = mac,
            None => return Err(SadError::not_found(format!("mirror session {}", session))),
        }
        st.op(format!("set_mirror_dst_mac {} {}", session, mac));
        Ok(())
    }

    fn remove_mirror_session(&self, session: MirrorSessionOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(session.as_raw(), "mirrorsession")?;
        st.mirror_sessions.remove(&session.as_raw());
        st.op(format!("remove_mirror_session {}", session));
        Ok(())
    }

    fn create_acl_table(&self, spec: &AclTableSpec) -> SadResult<AclTableOid> {
        let mut st = self.lock();
        let oid = st.alloc("acltable");
        st.op(format!("create_acl_table fields {}", spec.fields.len()));
        Ok(AclTableOid::from_raw(oid))
    }

    fn remove_acl_table(&self, table: AclTableOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(table.as_raw(), "acltable")?;
        st.op(format!("remove_acl_table {}", table));
        Ok(())
    }

    fn create_acl_counter(&self, table: AclTableOid) -> SadResult<AclCounterOid> {
        let mut st = self.lock();
        st.check(table.as_raw(), "acltable")?;
        let oid = st.alloc("aclcounter");
        st.acl_counters.insert(oid, (0, 0));
        st.op(format!("create_acl_counter {}", table));
        Ok(AclCounterOid::from_raw(oid))
    }

    fn remove_acl_counter(&self, counter: AclCounterOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(counter.as_raw(), "aclcounter")?;
        st.acl_counters.remove(&counter.as_raw());
        st.op(format!("remove_acl_counter {}", counter));
        Ok(())
    }

    fn read_acl_counter(&self, counter: AclCounterOid) -> SadResult<(u64, u64)> {
        let st = self.lock();
        st.acl_counters
            .get(&counter.as_raw())
            .copied()
            .ok_or_else(|| SadError::not_found(format!("acl counter {}", counter)))
    }

    fn create_acl_range(
        &self,
        kind: AclRangeKind,
        low: u16,
        high: u16,
    ) -> SadResult<AclRangeOid> {
        let mut st = self.lock();
        if low > high {
            return Err(SadError::invalid_parameter(format!(
                "range {}-{} inverted",
                low, high
            )));
        }
        let oid = st.alloc("aclrange");
        st.op(format!("create_acl_range {:?} {}-{}", kind, low, high));
        Ok(AclRangeOid::from_raw(oid))
    }

    fn remove_acl_range(&self, range: AclRangeOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(range.as_raw(), "aclrange")?;
        st.op(format!("remove_acl_range {}", range));
        Ok(())
    }

    fn create_acl_entry(&self, spec: &AclEntrySpec) -> SadResult<AclEntryOid> {
        let mut st = self.lock();
        st.check(spec.table.as_raw(), "acltable")?;
        if let Some(counter) = spec.counter {
            st.check(counter.as_raw(), "aclcounter")?;
        }
        for range in &spec.ranges {
            st.check(range.as_raw(), "aclrange")?;
        }
        if let AclEntryAction::MirrorIngress(session) = spec.action {
            st.check(session.as_raw(), "mirrorsession")?;
        }
        let oid = st.alloc("aclentry");
        st.op(format!("create_acl_entry prio {}", spec.priority));
        Ok(AclEntryOid::from_raw(oid))
    }

    fn remove_acl_entry(&self, entry: AclEntryOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(entry.as_raw(), "aclentry")?;
        st.op(format!("remove_acl_entry {}", entry));
        Ok(())
    }

    fn create_qos_map(&self, kind: QosMapKind, entries: &[(u8, u8)]) -> SadResult<QosMapOid> {
        let mut st = self.lock();
        let oid = st.alloc("qosmap");
        st.op(format!("create_qos_map {:?} {}", kind, entries.len()));
        Ok(QosMapOid::from_raw(oid))
    }

    fn set_qos_map(&self, map: QosMapOid, entries: &[(u8, u8)]) -> SadResult<()> {
        let mut st = self.lock();
        st.check(map.as_raw(), "qosmap")?;
        st.op(format!("set_qos_map {} {}", map, entries.len()));
        Ok(())
    }

    fn remove_qos_map(&self, map: QosMapOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(map.as_raw(), "qosmap")?;
        st.op(format!("remove_qos_map {}", map));
        Ok(())
    }

    fn create_wred(&self, _spec: &WredSpec) -> SadResult<WredOid> {
        let mut st = self.lock();
        let oid = st.alloc("wred");
        st.op("create_wred".to_string());
        Ok(WredOid::from_raw(oid))
    }

    fn set_wred(&self, wred: WredOid, _spec: &WredSpec) -> SadResult<()> {
        let mut st = self.lock();
        st.check(wred.as_raw(), "wred")?;
        st.op(format!("set_wred {}", wred));
        Ok(())
    }

    fn remove_wred(&self, wred: WredOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(wred.as_raw(), "wred")?;
        st.op(format!("remove_wred {}", wred));
        Ok(())
    }

    fn create_scheduler(&self, spec: &SchedulerSpec) -> SadResult<SchedulerOid> {
        let mut st = self.lock();
        let oid = st.alloc("scheduler");
        st.op(format!("create_scheduler {:?}", spec.kind));
        Ok(SchedulerOid::from_raw(oid))
    }

    fn set_scheduler(&self, scheduler: SchedulerOid, _spec: &SchedulerSpec) -> SadResult<()> {
        let mut st = self.lock();
        st.check(scheduler.as_raw(), "scheduler")?;
        st.op(format!("set_scheduler {}", scheduler));
        Ok(())
    }

    fn remove_scheduler(&self, scheduler: SchedulerOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(scheduler.as_raw(), "scheduler")?;
        st.op(format!("remove_scheduler {}", scheduler));
        Ok(())
    }

    fn create_buffer_pool(&self, spec: &BufferPoolSpec) -> SadResult<BufferPoolOid> {
        let mut st = self.lock();
        let oid = st.alloc("bufferpool");
        st.op(format!("create_buffer_pool size {}", spec.size));
        Ok(BufferPoolOid::from_raw(oid))
    }

    fn set_buffer_pool_size(&self, pool: BufferPoolOid, size: u64) -> SadResult<()> {
        let mut st = self.lock();
        st.check(pool.as_raw(), "bufferpool")?;
        st.op(format!("set_buffer_pool_size {} {}", pool, size));
        Ok(())
    }

    fn remove_buffer_pool(&self, pool: BufferPoolOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(pool.as_raw(), "bufferpool")?;
        st.op(format!("remove_buffer_pool {}", pool));
        Ok(())
    }

    fn create_buffer_profile(&self, spec: &BufferProfileSpec) -> SadResult<BufferProfileOid> {
        let mut st = self.lock();
        st.check(spec.pool.as_raw(), "bufferpool")?;
        let oid = st.alloc("bufferprofile");
        st.op(format!("create_buffer_profile pool {}", spec.pool));
        Ok(BufferProfileOid::from_raw(oid))
    }

    fn set_buffer_profile(
        &self,
        profile: BufferProfileOid,
        _spec: &BufferProfileSpec,
    ) -> SadResult<()> {
        let mut st = self.lock();
        st.check(profile.as_raw(), "bufferprofile")?;
        st.op(format!("set_buffer_profile {}", profile));
        Ok(())
    }

    fn remove_buffer_profile(&self, profile: BufferProfileOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(profile.as_raw(), "bufferprofile")?;
        st.op(format!("remove_buffer_profile {}", profile));
        Ok(())
    }

    fn create_trap_group(&self, queue: Option<u8>) -> SadResult<TrapGroupOid> {
        let mut st = self.lock();
        let oid = st.alloc("trapgroup");
        st.op(format!("create_trap_group {:?}", queue));
        Ok(TrapGroupOid::from_raw(oid))
    }

    fn set_trap_group_queue(&self, group: TrapGroupOid, queue: u8) -> SadResult<()> {
        let mut st = self.lock();
        st.check(group.as_raw(), "trapgroup")?;
        st.op(format!("set_trap_group_queue {} {}", group, queue));
        Ok(())
    }

    fn remove_trap_group(&self, group: TrapGroupOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(group.as_raw(), "trapgroup")?;
        st.op(format!("remove_trap_group {}", group));
        Ok(())
    }

    fn create_trap(
        &self,
        kind: TrapKind,
        group: TrapGroupOid,
        action: PacketAction,
    ) -> SadResult<TrapOid> {
        let mut st = self.lock();
        st.check(group.as_raw(), "trapgroup")?;
        let oid = st.alloc("trap");
        st.op(format!("create_trap {:?} {:?}", kind, action));
        Ok(TrapOid::from_raw(oid))
    }

    fn set_trap_group_binding(&self, trap: TrapOid, group: TrapGroupOid) -> SadResult<()> {
        let mut st = self.lock();
        st.check(trap.as_raw(), "trap")?;
        st.check(group.as_raw(), "trapgroup")?;
        st.op(format!("set_trap_group_binding {} {}", trap, group));
        Ok(())
    }

    fn set_trap_action(&self, trap: TrapOid, action: PacketAction) -> SadResult<()> {
        let mut st = self.lock();
        st.check(trap.as_raw(), "trap")?;
        st.op(format!("set_trap_action {} {:?}", trap, action));
        Ok(())
    }

    fn remove_trap(&self, trap: TrapOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(trap.as_raw(), "trap")?;
        st.op(format!("remove_trap {}", trap));
        Ok(())
    }

    fn create_policer(&self, _spec: &PolicerSpec) -> SadResult<PolicerOid> {
        let mut st = self.lock();
        let oid = st.alloc("policer");
        st.op("create_policer".to_string());
        Ok(PolicerOid::from_raw(oid))
    }

    fn set_policer(&self, policer: PolicerOid, _spec: &PolicerSpec) -> SadResult<()> {
        let mut st = self.lock();
        st.check(policer.as_raw(), "policer")?;
        st.op(format!("set_policer {}", policer));
        Ok(())
    }

    fn remove_policer(&self, policer: PolicerOid) -> SadResult<()> {
        let mut st = self.lock();
        st.free(policer.as_raw(), "policer")?;
        st.op(format!("remove_policer {}", policer));
        Ok(())
    }

    fn bind_trap_group_policer(&self, group: TrapGroupOid, policer: PolicerOid) -> SadResult<()> {
        let mut st = self.lock();
        st.check(group.as_raw(), "trapgroup")?;
        st.check(policer.as_raw(), "policer")?;
        st.op(format!("bind_trap_group_policer {} {}", group, policer));
        Ok(())
    }

    fn unbind_trap_group_policer(&self, group: TrapGroupOid) -> SadResult<()> {
        let mut st = self.lock();
        st.check(group.as_raw(), "trapgroup")?;
        st.op(format!("unbind_trap_group_policer {}", group));
        Ok(())
    }
}
