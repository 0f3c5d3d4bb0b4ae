//! Observer fabric: typed updates queued between subsystems.
//!
//! A subsystem mutating its own table pushes an update; the daemon
//! drains the queue after each `do_task` and hands every update to the
//! subsystems subscribed to that subject. Handlers may push further
//! updates while the queue drains, so a neighbor change can resolve a
//! mirror session which in turn activates staged ACL rules, all within
//! one drain.

use crate::neigh::NeighborEntry;
use std::collections::{BTreeSet, VecDeque};
use switchyd_types::{IpAddress, IpPrefix, MacAddress};

/// Longest-prefix-match change for an observed destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NextHopUpdate {
    pub prefix: IpPrefix,
    /// Empty when no route covers the observed destinations anymore.
    pub nexthops: BTreeSet<IpAddress>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborUpdate {
    pub entry: NeighborEntry,
    pub mac: MacAddress,
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FdbUpdate {
    pub mac: MacAddress,
    pub vlan_id: u16,
    pub port: String,
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagMemberUpdate {
    pub lag: String,
    pub member: String,
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VlanMemberUpdate {
    pub vlan: String,
    pub member: String,
    pub add: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorSessionUpdate {
    pub name: String,
    pub active: bool,
}

/// A typed subject change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Update {
    NextHop(NextHopUpdate),
    Neighbor(NeighborUpdate),
    Fdb(FdbUpdate),
    LagMember(LagMemberUpdate),
    VlanMember(VlanMemberUpdate),
    MirrorSession(MirrorSessionUpdate),
}

/// FIFO of pending updates, drained by the daemon.
#[derive(Default)]
pub struct EventQueue {
    queue: VecDeque<Update>,
}

impl EventQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, update: Update) {
        self.queue.push_back(update);
    }

    pub fn pop(&mut self) -> Option<Update> {
        self.queue.pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let mut events = EventQueue::new();
        events.push(Update::MirrorSession(MirrorSessionUpdate {
            name: "a".to_string(),
            active: true,
        }));
        events.push(Update::MirrorSession(MirrorSessionUpdate {
            name: "b".to_string(),
            active: false,
        }));

        match events.pop() {
            Some(Update::MirrorSession(u)) => assert_eq!(u.name, "a"),
            other => panic!("unexpected update {:?}", other.is_some()),
        }
        assert_eq!(events.len(), 1);
    }
}
