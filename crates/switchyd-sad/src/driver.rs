//! The [`SwitchDriver`] trait and its attribute structures.

use crate::error::SadResult;
use crate::types::*;
use switchyd_types::{IpAddress, IpPrefix, MacAddress};

/// Switch-wide facts read once at initialization and treated as
/// read-only afterwards.
#[derive(Debug, Clone)]
pub struct SwitchInfo {
    /// The switch source MAC address.
    pub mac: MacAddress,
    /// The CPU port handle.
    pub cpu_port: PortOid,
    /// The default virtual router handle.
    pub virtual_router: VirtualRouterOid,
    /// The default host trap group handle.
    pub default_trap_group: TrapGroupOid,
    /// Maximum number of ECMP next-hop groups.
    pub max_ecmp_groups: u32,
    /// True when `max_ecmp_groups` is reported for a group size of 1
    /// and must be scaled down for the real group size.
    pub ecmp_count_for_unit_group: bool,
    /// ACL entry priority range supported by the packet engine.
    pub acl_min_priority: u32,
    pub acl_max_priority: u32,
    /// False when the packet engine cannot match DSCP and ECN
    /// together (no ECN coloring rules can be installed).
    pub dscp_ecn_match_capable: bool,
}

/// Packet treatment for routes, traps and ACL actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketAction {
    Forward,
    Drop,
    Trap,
    Copy,
    Log,
    Deny,
}

/// Packet color for metering actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketColor {
    Green,
    Yellow,
    Red,
}

/// VLAN membership tagging mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaggingMode {
    Untagged,
    Tagged,
}

/// Anchor object a router interface is created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RifAnchor {
    Port(PortOid),
    Lag(LagOid),
    Vlan(VlanOid),
}

/// Router interface creation attributes.
#[derive(Debug, Clone)]
pub struct RifConfig {
    pub virtual_router: VirtualRouterOid,
    pub src_mac: MacAddress,
    pub anchor: RifAnchor,
}

/// Entry key for neighbor objects: (router interface, IP).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NeighborId {
    pub rif: RouterInterfaceOid,
    pub ip: IpAddress,
}

/// Entry key for route objects: (virtual router, destination).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RouteId {
    pub virtual_router: VirtualRouterOid,
    pub destination: IpPrefix,
}

/// Entry key for FDB objects: (MAC, VLAN id).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdbId {
    pub mac: MacAddress,
    pub vlan_id: u16,
}

/// Optional VLAN header on an encapsulated mirror packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MirrorVlanTag {
    pub tpid: u16,
    pub vlan_id: u16,
    pub pri: u8,
    pub cfi: u8,
}

/// Attributes of an enhanced-remote (GRE) mirror session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSessionSpec {
    pub monitor_port: RawOid,
    pub vlan: Option<MirrorVlanTag>,
    pub iphdr_version: u8,
    pub tos: u8,
    pub ttl: u8,
    pub src_ip: IpAddress,
    pub dst_ip: IpAddress,
    pub src_mac: MacAddress,
    pub dst_mac: MacAddress,
    pub gre_protocol: u16,
    pub traffic_class: Option<u8>,
}

/// Match fields an ACL table can be created with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclTableField {
    SrcIp,
    DstIp,
    L4SrcPort,
    L4DstPort,
    EtherType,
    IpType,
    IpProtocol,
    TcpFlags,
    Tc,
    Dscp,
    Ecn,
}

/// Range object kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclRangeKind {
    L4SrcPort,
    L4DstPort,
}

/// ACL table creation attributes (ingress stage, port bind point).
#[derive(Debug, Clone)]
pub struct AclTableSpec {
    pub fields: Vec<AclTableField>,
    pub range_kinds: Vec<AclRangeKind>,
}

/// IP type keywords for the IP-type match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AclIpType {
    Any,
    Ip,
    NonIp,
    Ipv4Any,
    NonIpv4,
    Ipv6Any,
    NonIpv6,
    Arp,
    ArpRequest,
    ArpReply,
}

/// A single match on an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclMatch {
    SrcIp(IpPrefix),
    DstIp(IpPrefix),
    L4SrcPort(u16),
    L4DstPort(u16),
    EtherType(u16),
    IpProtocol(u8),
    TcpFlags { flags: u8, mask: u8 },
    IpType(AclIpType),
    Dscp(u8),
    Tc(u8),
    Ecn(u8),
}

/// The single action on an ACL entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclEntryAction {
    Packet(PacketAction),
    Redirect(RawOid),
    MirrorIngress(MirrorSessionOid),
    SetColor(PacketColor),
}

/// ACL entry creation attributes.
#[derive(Debug, Clone)]
pub struct AclEntrySpec {
    pub table: AclTableOid,
    pub priority: u32,
    pub counter: Option<AclCounterOid>,
    pub matches: Vec<AclMatch>,
    pub ranges: Vec<AclRangeOid>,
    pub action: AclEntryAction,
}

/// QoS map kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QosMapKind {
    DscpToTc,
    TcToQueue,
    TcToPriorityGroup,
    PfcPriorityToQueue,
    PfcPriorityToPriorityGroup,
}

/// WRED profile attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WredSpec {
    pub green_enable: bool,
    pub green_min_threshold: u32,
    pub green_max_threshold: u32,
    pub yellow_enable: bool,
    pub yellow_min_threshold: u32,
    pub yellow_max_threshold: u32,
    pub red_enable: bool,
    pub red_min_threshold: u32,
    pub red_max_threshold: u32,
    pub ecn_mark: bool,
}

/// Scheduling discipline of a scheduler profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerKind {
    Strict,
    Dwrr,
}

/// Scheduler profile attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulerSpec {
    pub kind: SchedulerKind,
    pub weight: u8,
    pub priority: u8,
}

/// Buffer pool attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferPoolSpec {
    pub ingress: bool,
    pub dynamic: bool,
    pub size: u64,
}

/// Buffer profile attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferProfileSpec {
    pub pool: BufferPoolOid,
    pub size: u64,
    pub dynamic_th: Option<i32>,
    pub static_th: Option<u64>,
    pub xon: Option<u64>,
    pub xoff: Option<u64>,
}

/// Buffer profile list direction on a port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferDirection {
    Ingress,
    Egress,
}

/// Host trap codes understood by the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TrapKind {
    Stp,
    Lacp,
    Lldp,
    Bgp,
    Bgpv6,
    ArpRequest,
    ArpResponse,
    NeighborDiscovery,
    Dhcp,
    Dhcpv6,
    Ssh,
    Snmp,
    Ip2Me,
    L3MtuError,
    TtlError,
}

/// Policer attributes for control-plane policing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicerSpec {
    pub meter_packets: bool,
    pub color_aware: bool,
    pub cbs: u64,
    pub cir: u64,
    pub pbs: u64,
    pub pir: u64,
    pub green_action: Option<PacketAction>,
    pub yellow_action: Option<PacketAction>,
    pub red_action: Option<PacketAction>,
}

/// The switch abstraction driver.
///
/// All calls are synchronous and made from the control thread, with
/// the single exception of [`SwitchDriver::read_acl_counter`], which
/// the counter collector thread also calls. Implementations must be
/// internally synchronized.
pub trait SwitchDriver: Send + Sync {
    // Switch scope.

    /// Reads the switch-wide facts. Called once at initialization.
    fn switch_info(&self) -> SadResult<SwitchInfo>;

    /// Asks the driver to rotate its internal log file.
    fn request_log_rotate(&self);

    // Ports.

    /// Claims the physical port backed by the given lane set.
    fn port_by_lanes(&self, lanes: &[u32]) -> SadResult<PortOid>;
    fn set_port_admin_state(&self, port: PortOid, up: bool) -> SadResult<()>;
    fn set_port_mtu(&self, port: PortOid, mtu: u32) -> SadResult<()>;
    fn set_port_speed(&self, port: PortOid, speed: u32) -> SadResult<()>;
    fn set_port_default_vlan(&self, port: PortOid, vlan_id: u16) -> SadResult<()>;
    fn bind_ingress_acl(&self, port: PortOid, table: AclTableOid) -> SadResult<AclBindOid>;
    fn unbind_ingress_acl(&self, bind: AclBindOid) -> SadResult<()>;
    fn port_queues(&self, port: PortOid) -> SadResult<Vec<QueueOid>>;
    fn port_priority_groups(&self, port: PortOid) -> SadResult<Vec<PriorityGroupOid>>;
    fn port_scheduler_groups(&self, port: PortOid) -> SadResult<Vec<SchedulerGroupOid>>;
    fn scheduler_group_children(&self, group: SchedulerGroupOid) -> SadResult<Vec<RawOid>>;
    fn set_scheduler_group_profile(
        &self,
        group: SchedulerGroupOid,
        profile: Option<SchedulerOid>,
    ) -> SadResult<()>;
    fn set_queue_wred_profile(&self, queue: QueueOid, profile: Option<WredOid>) -> SadResult<()>;
    fn set_queue_buffer_profile(
        &self,
        queue: QueueOid,
        profile: Option<BufferProfileOid>,
    ) -> SadResult<()>;
    fn set_priority_group_buffer_profile(
        &self,
        group: PriorityGroupOid,
        profile: Option<BufferProfileOid>,
    ) -> SadResult<()>;
    fn set_port_qos_map(
        &self,
        port: PortOid,
        kind: QosMapKind,
        map: Option<QosMapOid>,
    ) -> SadResult<()>;
    fn set_port_pfc(&self, port: PortOid, bitmask: u8) -> SadResult<()>;
    fn set_port_buffer_profile_list(
        &self,
        port: PortOid,
        direction: BufferDirection,
        profiles: &[BufferProfileOid],
    ) -> SadResult<()>;

    // Bridge, VLAN and LAG.

    fn create_bridge_port(&self, port: RawOid) -> SadResult<BridgePortOid>;
    fn remove_bridge_port(&self, bridge_port: BridgePortOid) -> SadResult<()>;
    fn create_vlan(&self, vlan_id: u16) -> SadResult<VlanOid>;
    fn remove_vlan(&self, vlan: VlanOid) -> SadResult<()>;
    fn create_vlan_member(
        &self,
        vlan: VlanOid,
        bridge_port: BridgePortOid,
        mode: TaggingMode,
    ) -> SadResult<VlanMemberOid>;
    fn remove_vlan_member(&self, member: VlanMemberOid) -> SadResult<()>;
    fn create_lag(&self) -> SadResult<LagOid>;
    fn remove_lag(&self, lag: LagOid) -> SadResult<()>;
    fn create_lag_member(&self, lag: LagOid, port: PortOid) -> SadResult<LagMemberOid>;
    fn remove_lag_member(&self, member: LagMemberOid) -> SadResult<()>;

    // Router interfaces.

    fn create_router_interface(&self, config: &RifConfig) -> SadResult<RouterInterfaceOid>;
    fn remove_router_interface(&self, rif: RouterInterfaceOid) -> SadResult<()>;

    // Neighbors and next hops.

    fn create_neighbor(&self, id: &NeighborId, mac: MacAddress) -> SadResult<()>;
    fn set_neighbor_mac(&self, id: &NeighborId, mac: MacAddress) -> SadResult<()>;
    fn remove_neighbor(&self, id: &NeighborId) -> SadResult<()>;
    fn create_next_hop(&self, ip: IpAddress, rif: RouterInterfaceOid) -> SadResult<NextHopOid>;
    fn remove_next_hop(&self, next_hop: NextHopOid) -> SadResult<()>;
    fn create_next_hop_group(&self) -> SadResult<NextHopGroupOid>;
    fn remove_next_hop_group(&self, group: NextHopGroupOid) -> SadResult<()>;
    fn create_next_hop_group_member(
        &self,
        group: NextHopGroupOid,
        next_hop: NextHopOid,
    ) -> SadResult<NextHopGroupMemberOid>;
    fn remove_next_hop_group_member(&self, member: NextHopGroupMemberOid) -> SadResult<()>;

    // Routes.

    fn create_route(
        &self,
        id: &RouteId,
        action: PacketAction,
        next_hop: Option<RawOid>,
    ) -> SadResult<()>;
    fn set_route_action(&self, id: &RouteId, action: PacketAction) -> SadResult<()>;
    fn set_route_next_hop(&self, id: &RouteId, next_hop: Option<RawOid>) -> SadResult<()>;
    fn remove_route(&self, id: &RouteId) -> SadResult<()>;

    // FDB.

    fn create_fdb_entry(
        &self,
        id: &FdbId,
        bridge_port: BridgePortOid,
        is_static: bool,
    ) -> SadResult<()>;
    fn remove_fdb_entry(&self, id: &FdbId) -> SadResult<()>;

    // Mirror sessions.

    fn create_mirror_session(&self, spec: &MirrorSessionSpec) -> SadResult<MirrorSessionOid>;
    fn set_mirror_monitor_port(&self, session: MirrorSessionOid, port: RawOid) -> SadResult<()>;
    fn set_mirror_dst_mac(&self, session: MirrorSessionOid, mac: MacAddress) -> SadResult<()>;
    fn remove_mirror_session(&self, session: MirrorSessionOid) -> SadResult<()>;

    // ACL.

    fn create_acl_table(&self, spec: &AclTableSpec) -> SadResult<AclTableOid>;
    fn remove_acl_table(&self, table: AclTableOid) -> SadResult<()>;
    fn create_acl_counter(&self, table: AclTableOid) -> SadResult<AclCounterOid>;
    fn remove_acl_counter(&self, counter: AclCounterOid) -> SadResult<()>;
    /// Reads (packets, bytes). Also called from the counter collector
    /// thread.
    fn read_acl_counter(&self, counter: AclCounterOid) -> SadResult<(u64, u64)>;
    fn create_acl_range(&self, kind: AclRangeKind, low: u16, high: u16)
        -> SadResult<AclRangeOid>;
    fn remove_acl_range(&self, range: AclRangeOid) -> SadResult<()>;
    fn create_acl_entry(&self, spec: &AclEntrySpec) -> SadResult<AclEntryOid>;
    fn remove_acl_entry(&self, entry: AclEntryOid) -> SadResult<()>;

    // QoS objects.

    fn create_qos_map(&self, kind: QosMapKind, entries: &[(u8, u8)]) -> SadResult<QosMapOid>;
    fn set_qos_map(&self, map: QosMapOid, entries: &[(u8, u8)]) -> SadResult<()>;
    fn remove_qos_map(&self, map: QosMapOid) -> SadResult<()>;
    fn create_wred(&self, spec: &WredSpec) -> SadResult<WredOid>;
    fn set_wred(&self, wred: WredOid, spec: &WredSpec) -> SadResult<()>;
    fn remove_wred(&self, wred: WredOid) -> SadResult<()>;
    fn create_scheduler(&self, spec: &SchedulerSpec) -> SadResult<SchedulerOid>;
    fn set_scheduler(&self, scheduler: SchedulerOid, spec: &SchedulerSpec) -> SadResult<()>;
    fn remove_scheduler(&self, scheduler: SchedulerOid) -> SadResult<()>;

    // Buffer objects.

    fn create_buffer_pool(&self, spec: &BufferPoolSpec) -> SadResult<BufferPoolOid>;
    fn set_buffer_pool_size(&self, pool: BufferPoolOid, size: u64) -> SadResult<()>;
    fn remove_buffer_pool(&self, pool: BufferPoolOid) -> SadResult<()>;
    fn create_buffer_profile(&self, spec: &BufferProfileSpec) -> SadResult<BufferProfileOid>;
    fn set_buffer_profile(
        &self,
        profile: BufferProfileOid,
        spec: &BufferProfileSpec,
    ) -> SadResult<()>;
    fn remove_buffer_profile(&self, profile: BufferProfileOid) -> SadResult<()>;

    // Control-plane policing.

    fn create_trap_group(&self, queue: Option<u8>) -> SadResult<TrapGroupOid>;
    fn set_trap_group_queue(&self, group: TrapGroupOid, queue: u8) -> SadResult<()>;
    fn remove_trap_group(&self, group: TrapGroupOid) -> SadResult<()>;
    fn create_trap(
        &self,
        kind: TrapKind,
        group: TrapGroupOid,
        action: PacketAction,
    ) -> SadResult<TrapOid>;
    fn set_trap_group_binding(&self, trap: TrapOid, group: TrapGroupOid) -> SadResult<()>;
    fn set_trap_action(&self, trap: TrapOid, action: PacketAction) -> SadResult<()>;
    fn remove_trap(&self, trap: TrapOid) -> SadResult<()>;
    fn create_policer(&self, spec: &PolicerSpec) -> SadResult<PolicerOid>;
    fn set_policer(&self, policer: PolicerOid, spec: &PolicerSpec) -> SadResult<()>;
    fn remove_policer(&self, policer: PolicerOid) -> SadResult<()>;
    fn bind_trap_group_policer(&self, group: TrapGroupOid, policer: PolicerOid) -> SadResult<()>;
    fn unbind_trap_group_policer(&self, group: TrapGroupOid) -> SadResult<()>;
}
