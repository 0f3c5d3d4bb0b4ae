//! Type-safe driver object handles.
//!
//! Every object the driver hands out is identified by a 64-bit handle.
//! The phantom-typed [`ObjectId`] wrapper keeps handles of different
//! kinds from being mixed up at compile time; the raw value is still
//! reachable for the few genuinely polymorphic attributes (a route's
//! next hop may be a next hop, a group, a router interface or the CPU
//! port).

use std::fmt;
use std::hash::Hash;
use std::marker::PhantomData;

/// Raw object handle value.
pub type RawOid = u64;

/// Marker trait for object kinds.
pub trait ObjectKind: Send + Sync + 'static {
    fn kind_name() -> &'static str;
}

/// A type-safe object handle.
pub struct ObjectId<T: ObjectKind> {
    raw: RawOid,
    _marker: PhantomData<T>,
}

impl<T: ObjectKind> ObjectId<T> {
    /// The null handle.
    pub const NULL: Self = Self {
        raw: 0,
        _marker: PhantomData,
    };

    pub const fn from_raw(raw: RawOid) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub const fn as_raw(&self) -> RawOid {
        self.raw
    }

    pub const fn is_null(&self) -> bool {
        self.raw == 0
    }
}

impl<T: ObjectKind> Clone for ObjectId<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T: ObjectKind> Copy for ObjectId<T> {}

impl<T: ObjectKind> fmt::Debug for ObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(0x{:x})", T::kind_name(), self.raw)
    }
}

impl<T: ObjectKind> fmt::Display for ObjectId<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.raw)
    }
}

impl<T: ObjectKind> PartialEq for ObjectId<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}

impl<T: ObjectKind> Eq for ObjectId<T> {}

impl<T: ObjectKind> Hash for ObjectId<T> {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.raw.hash(state);
    }
}

impl<T: ObjectKind> Default for ObjectId<T> {
    fn default() -> Self {
        Self::NULL
    }
}

macro_rules! define_object_kind {
    ($kind:ident, $name:literal, $alias:ident) => {
        #[derive(Debug, Clone, Copy)]
        pub struct $kind;

        impl ObjectKind for $kind {
            fn kind_name() -> &'static str {
                $name
            }
        }

        pub type $alias = ObjectId<$kind>;
    };
}

define_object_kind!(SwitchKind, "Switch", SwitchOid);
define_object_kind!(PortKind, "Port", PortOid);
define_object_kind!(VirtualRouterKind, "VirtualRouter", VirtualRouterOid);
define_object_kind!(RouterInterfaceKind, "RouterInterface", RouterInterfaceOid);
define_object_kind!(NextHopKind, "NextHop", NextHopOid);
define_object_kind!(NextHopGroupKind, "NextHopGroup", NextHopGroupOid);
define_object_kind!(
    NextHopGroupMemberKind,
    "NextHopGroupMember",
    NextHopGroupMemberOid
);
define_object_kind!(VlanKind, "Vlan", VlanOid);
define_object_kind!(VlanMemberKind, "VlanMember", VlanMemberOid);
define_object_kind!(LagKind, "Lag", LagOid);
define_object_kind!(LagMemberKind, "LagMember", LagMemberOid);
define_object_kind!(BridgePortKind, "BridgePort", BridgePortOid);
define_object_kind!(MirrorSessionKind, "MirrorSession", MirrorSessionOid);
define_object_kind!(AclTableKind, "AclTable", AclTableOid);
define_object_kind!(AclEntryKind, "AclEntry", AclEntryOid);
define_object_kind!(AclCounterKind, "AclCounter", AclCounterOid);
define_object_kind!(AclRangeKindMarker, "AclRange", AclRangeOid);
define_object_kind!(AclBindKind, "AclBind", AclBindOid);
define_object_kind!(PolicerKind, "Policer", PolicerOid);
define_object_kind!(TrapGroupKind, "TrapGroup", TrapGroupOid);
define_object_kind!(TrapKindMarker, "Trap", TrapOid);
define_object_kind!(QosMapKindMarker, "QosMap", QosMapOid);
define_object_kind!(WredKind, "Wred", WredOid);
define_object_kind!(SchedulerKindMarker, "Scheduler", SchedulerOid);
define_object_kind!(SchedulerGroupKind, "SchedulerGroup", SchedulerGroupOid);
define_object_kind!(QueueKind, "Queue", QueueOid);
define_object_kind!(PriorityGroupKind, "PriorityGroup", PriorityGroupOid);
define_object_kind!(BufferPoolKind, "BufferPool", BufferPoolOid);
define_object_kind!(BufferProfileKind, "BufferProfile", BufferProfileOid);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oid_basics() {
        let port = PortOid::from_raw(0x1001);
        assert_eq!(port.as_raw(), 0x1001);
        assert!(!port.is_null());
        assert!(PortOid::NULL.is_null());
    }

    #[test]
    fn test_oid_debug_carries_kind() {
        let nh = NextHopOid::from_raw(7);
        assert!(format!("{:?}", nh).contains("NextHop"));
    }

    #[test]
    fn test_oid_equality() {
        assert_eq!(PortOid::from_raw(1), PortOid::from_raw(1));
        assert_ne!(PortOid::from_raw(1), PortOid::from_raw(2));
    }
}
