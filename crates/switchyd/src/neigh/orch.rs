//! Neighbor orchestration: neighbor entries and their next hops.

use crate::context::SwitchContext;
use crate::intfs::IntfsOrch;
use crate::observer::{EventQueue, NeighborUpdate, Update};
use crate::ports::PortsOrch;
use crate::tables::{self, NEIGH_TABLE};
use log::{info, warn};
use std::collections::BTreeMap;
use switchyd_orch_common::{
    Consumer, HasRefCount, KeyOpFieldValues, Operation, SyncMap, TaskStatus,
};
use switchyd_sad::{NeighborId, NextHopOid, RouterInterfaceOid};
use switchyd_types::{IpAddress, MacAddress};

/// Identity of a neighbor: the IP and the interface it lives on.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NeighborEntry {
    pub ip: IpAddress,
    pub alias: String,
}

#[derive(Debug)]
struct NextHopEntry {
    oid: NextHopOid,
    ref_count: u32,
}

impl HasRefCount for NextHopEntry {
    fn increment_ref(&mut self) -> u32 {
        self.ref_count += 1;
        self.ref_count
    }

    fn decrement_ref(&mut self) -> Option<u32> {
        self.ref_count.checked_sub(1).map(|n| {
            self.ref_count = n;
            n
        })
    }

    fn ref_count(&self) -> u32 {
        self.ref_count
    }
}

/// Neighbor/next-hop orchestration (C6). A next hop is created
/// together with its neighbor on the same IP and removed only when
/// nothing references it.
pub struct NeighOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    neighbors: BTreeMap<NeighborEntry, MacAddress>,
    next_hops: SyncMap<IpAddress, NextHopEntry>,
}

impl NeighOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        Self {
            ctx,
            consumer: Consumer::new(NEIGH_TABLE),
            neighbors: BTreeMap::new(),
            next_hops: SyncMap::new(),
        }
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    pub fn has_next_hop(&self, ip: &IpAddress) -> bool {
        self.next_hops.contains_key(ip)
    }

    pub fn next_hop_oid(&self, ip: &IpAddress) -> Option<NextHopOid> {
        self.next_hops.get(ip).map(|e| e.oid)
    }

    pub fn next_hop_ref_count(&self, ip: &IpAddress) -> Option<u32> {
        self.next_hops.ref_count(ip)
    }

    pub fn increase_next_hop_ref(&mut self, ip: &IpAddress) {
        self.next_hops.increment_ref(ip);
    }

    pub fn decrease_next_hop_ref(&mut self, ip: &IpAddress) {
        self.next_hops.decrement_ref(ip);
    }

    /// Finds a neighbor by its next-hop IP.
    pub fn neighbor_by_ip(&self, ip: &IpAddress) -> Option<(NeighborEntry, MacAddress)> {
        if !self.has_next_hop(ip) {
            return None;
        }
        self.neighbors
            .iter()
            .find(|(entry, _)| entry.ip == *ip)
            .map(|(entry, mac)| (entry.clone(), *mac))
    }

    pub fn do_task(
        &mut self,
        ports: &PortsOrch,
        intfs: &mut IntfsOrch,
        events: &mut EventQueue,
    ) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = self.process(&entry, ports, intfs, events);
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", NEIGH_TABLE, entry.key);
                }
            }
        }

        self.consumer.requeue(retained);
    }

    fn process(
        &mut self,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        intfs: &mut IntfsOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let Some((alias, ip_str)) = entry.key.split_once(':') else {
            warn!("invalid neighbor key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let alias = alias.to_string();

        if tables::is_mgmt_alias(&alias) {
            return TaskStatus::Consumed;
        }

        let ip: IpAddress = match ip_str.parse() {
            Ok(ip) => ip,
            Err(e) => {
                warn!("invalid neighbor address {:?}: {}", ip_str, e);
                return TaskStatus::Invalid;
            }
        };

        let Some(port) = ports.get(&alias) else {
            return TaskStatus::Retry;
        };
        let Some(rif) = port.rif else {
            // No L3 interface on the port; nothing to resolve against.
            info!("no router interface on {}, dropping neighbor {}", alias, ip);
            return TaskStatus::Consumed;
        };

        let neighbor = NeighborEntry { ip, alias };

        match entry.op {
            Operation::Set => {
                let mac: MacAddress = match entry.field("neigh").map(str::parse) {
                    Some(Ok(mac)) => mac,
                    Some(Err(e)) => {
                        warn!("invalid neighbor MAC: {}", e);
                        return TaskStatus::Invalid;
                    }
                    None => {
                        warn!("neighbor {} has no MAC field", neighbor.ip);
                        return TaskStatus::Invalid;
                    }
                };

                if self.neighbors.get(&neighbor) == Some(&mac) {
                    return TaskStatus::Consumed;
                }
                self.add_neighbor(neighbor, mac, rif, intfs, events)
            }
            Operation::Del => {
                if !self.neighbors.contains_key(&neighbor) {
                    return TaskStatus::Consumed;
                }
                self.remove_neighbor(neighbor, rif, intfs, events)
            }
        }
    }

    fn add_neighbor(
        &mut self,
        neighbor: NeighborEntry,
        mac: MacAddress,
        rif: RouterInterfaceOid,
        intfs: &mut IntfsOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let id = NeighborId {
            rif,
            ip: neighbor.ip,
        };

        if !self.neighbors.contains_key(&neighbor) {
            if let Err(e) = self.ctx.sad().create_neighbor(&id, mac) {
                warn!(
                    "failed to create neighbor {} on {}: {}",
                    neighbor.ip, neighbor.alias, e
                );
                return TaskStatus::Retry;
            }
            intfs.increase_rif_ref(&neighbor.alias);

            match self.ctx.sad().create_next_hop(neighbor.ip, rif) {
                Ok(oid) => {
                    self.next_hops.insert(
                        neighbor.ip,
                        NextHopEntry { oid, ref_count: 0 },
                    );
                    intfs.increase_rif_ref(&neighbor.alias);
                }
                Err(e) => {
                    warn!(
                        "failed to create next hop {} on {}: {}",
                        neighbor.ip, neighbor.alias, e
                    );
                    // Unwind the neighbor so the retry starts clean.
                    if let Err(e) = self.ctx.sad().remove_neighbor(&id) {
                        warn!("failed to unwind neighbor {}: {}", neighbor.ip, e);
                    }
                    intfs.decrease_rif_ref(&neighbor.alias);
                    return TaskStatus::Retry;
                }
            }
            info!("created neighbor {} on {}", neighbor.ip, neighbor.alias);
        } else if let Err(e) = self.ctx.sad().set_neighbor_mac(&id, mac) {
            warn!(
                "failed to update neighbor {} on {}: {}",
                neighbor.ip, neighbor.alias, e
            );
            return TaskStatus::Retry;
        }

        self.neighbors.insert(neighbor.clone(), mac);
        events.push(Update::Neighbor(NeighborUpdate {
            entry: neighbor,
            mac,
            add: true,
        }));
        TaskStatus::Consumed
    }

    fn remove_neighbor(
        &mut self,
        neighbor: NeighborEntry,
        rif: RouterInterfaceOid,
        intfs: &mut IntfsOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        if let Some(count) = self.next_hops.ref_count(&neighbor.ip) {
            if count > 0 {
                info!(
                    "next hop {} still referenced ({}), deferring removal",
                    neighbor.ip, count
                );
                return TaskStatus::Retry;
            }
        }

        if let Some(nh) = self.next_hops.get(&neighbor.ip) {
            if let Err(e) = self.ctx.sad().remove_next_hop(nh.oid) {
                warn!("failed to remove next hop {}: {}", neighbor.ip, e);
                return TaskStatus::Retry;
            }
        }
        self.next_hops.remove(&neighbor.ip);
        intfs.decrease_rif_ref(&neighbor.alias);

        let id = NeighborId {
            rif,
            ip: neighbor.ip,
        };
        if let Err(e) = self.ctx.sad().remove_neighbor(&id) {
            warn!(
                "failed to remove neighbor {} on {}: {}",
                neighbor.ip, neighbor.alias, e
            );
            return TaskStatus::Retry;
        }
        self.neighbors.remove(&neighbor);
        intfs.decrease_rif_ref(&neighbor.alias);
        info!("removed neighbor {} on {}", neighbor.ip, neighbor.alias);

        events.push(Update::Neighbor(NeighborUpdate {
            entry: neighbor,
            mac: MacAddress::default(),
            add: false,
        }));
        TaskStatus::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::PORT_TABLE;
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    fn setup() -> (PortsOrch, IntfsOrch, NeighOrch, Arc<SimDriver>, EventQueue) {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver.clone()).unwrap();
        let mut ports = PortsOrch::new(ctx.clone());
        let mut intfs = IntfsOrch::new(ctx.clone());
        let neigh = NeighOrch::new(ctx);
        let mut events = EventQueue::new();

        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet4",
                vec![("lanes".to_string(), "4,5,6,7".to_string())],
            )]);
        ports.do_task(PORT_TABLE, &mut events);

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet4:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 0, "interface must install in setup");

        (ports, intfs, neigh, driver, events)
    }

    fn neigh_set(neigh: &mut NeighOrch, key: &str, mac: &str) {
        neigh
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set(
                key,
                vec![("neigh".to_string(), mac.to_string())],
            )]);
    }

    #[test]
    fn test_add_neighbor_creates_next_hop() {
        let (ports, mut intfs, mut neigh, driver, mut events) = setup();

        neigh_set(&mut neigh, "Ethernet4:10.0.0.2", "aa:bb:cc:dd:ee:ff");
        neigh.do_task(&ports, &mut intfs, &mut events);

        let ip: IpAddress = "10.0.0.2".parse().unwrap();
        assert!(neigh.has_next_hop(&ip));
        assert_eq!(neigh.next_hop_ref_count(&ip), Some(0));
        assert_eq!(driver.next_hop_count(), 1);
        // Neighbor + next hop each hold an interface reference, on top
        // of the two route references from the interface itself.
        assert_eq!(intfs.rif_ref_count("Ethernet4"), Some(4));

        let mut saw = false;
        while let Some(update) = events.pop() {
            if let Update::Neighbor(u) = update {
                assert!(u.add);
                assert_eq!(u.entry.ip, ip);
                saw = true;
            }
        }
        assert!(saw);
    }

    #[test]
    fn test_mac_update_does_not_recreate() {
        let (ports, mut intfs, mut neigh, driver, mut events) = setup();

        neigh_set(&mut neigh, "Ethernet4:10.0.0.2", "aa:bb:cc:dd:ee:01");
        neigh.do_task(&ports, &mut intfs, &mut events);
        neigh_set(&mut neigh, "Ethernet4:10.0.0.2", "aa:bb:cc:dd:ee:02");
        neigh.do_task(&ports, &mut intfs, &mut events);

        assert_eq!(driver.next_hop_count(), 1);
        let ip: IpAddress = "10.0.0.2".parse().unwrap();
        let (_, mac) = neigh.neighbor_by_ip(&ip).unwrap();
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:02");
    }

    #[test]
    fn test_remove_deferred_while_referenced() {
        let (ports, mut intfs, mut neigh, driver, mut events) = setup();

        neigh_set(&mut neigh, "Ethernet4:10.0.0.2", "aa:bb:cc:dd:ee:ff");
        neigh.do_task(&ports, &mut intfs, &mut events);

        let ip: IpAddress = "10.0.0.2".parse().unwrap();
        neigh.increase_next_hop_ref(&ip);

        neigh
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("Ethernet4:10.0.0.2")]);
        neigh.do_task(&ports, &mut intfs, &mut events);
        assert_eq!(neigh.pending(), 1);
        assert!(neigh.has_next_hop(&ip));

        neigh.decrease_next_hop_ref(&ip);
        neigh.do_task(&ports, &mut intfs, &mut events);
        assert_eq!(neigh.pending(), 0);
        assert!(!neigh.has_next_hop(&ip));
        assert_eq!(driver.next_hop_count(), 0);
    }

    #[test]
    fn test_waits_for_port() {
        let (ports, mut intfs, mut neigh, _driver, mut events) = setup();

        neigh_set(&mut neigh, "Ethernet8:10.1.0.2", "aa:bb:cc:dd:ee:ff");
        neigh.do_task(&ports, &mut intfs, &mut events);
        assert_eq!(neigh.pending(), 1);
    }
}
