//! Switch abstraction driver (SAD) contract.
//!
//! The SAD is the boundary between the switchyd control plane and the
//! forwarding hardware. The control plane sees it as a black-box
//! capability provider: a flat, synchronous create/set/remove surface
//! over typed object handles. This crate defines that surface:
//!
//! - [`SwitchDriver`]: the driver trait every backend implements
//! - [`ObjectId`] and per-kind aliases: type-safe object handles
//! - [`SadError`] / [`SadStatus`]: the status model
//! - [`SimDriver`]: an in-process software driver backing the daemon
//!   binary and the test suite

mod driver;
mod error;
mod sim;
mod types;

pub use driver::{
    AclEntryAction, AclEntrySpec, AclMatch, AclIpType, AclRangeKind, AclTableField,
    AclTableSpec, BufferDirection, BufferPoolSpec, BufferProfileSpec, FdbId, MirrorSessionSpec,
    MirrorVlanTag, NeighborId, PacketAction, PacketColor, PolicerSpec, QosMapKind, RifAnchor,
    RifConfig, RouteId, SchedulerKind, SchedulerSpec, SwitchDriver, SwitchInfo, TaggingMode,
    TrapKind, WredSpec,
};
pub use error::{SadError, SadResult, SadStatus};
pub use sim::{SimConfig, SimDriver};
pub use types::{
    AclBindOid, AclCounterOid, AclEntryOid, AclRangeOid, AclTableOid, BridgePortOid,
    BufferPoolOid, BufferProfileOid, LagMemberOid, LagOid, MirrorSessionOid,
    NextHopGroupMemberOid, NextHopGroupOid, NextHopOid, ObjectId, ObjectKind, PolicerOid,
    PortOid, PriorityGroupOid, QosMapOid, QueueOid, RawOid, RouterInterfaceOid, SchedulerOid,
    SchedulerGroupOid, SwitchOid, TrapGroupOid, TrapOid, VirtualRouterOid, VlanMemberOid,
    VlanOid, WredOid,
};
