//! Interface orchestration: per-interface IP sets, subnet and IP2Me
//! routes, router interface lifetime.

use crate::context::SwitchContext;
use crate::ports::{PortKind, PortsOrch};
use crate::tables::INTF_TABLE;
use log::{info, warn};
use std::collections::{BTreeMap, BTreeSet};
use switchyd_orch_common::{
    Consumer, KeyOpFieldValues, OrchError, OrchResult, Operation, TaskStatus,
};
use switchyd_sad::{
    PacketAction, RifAnchor, RifConfig, RouteId, RouterInterfaceOid, SadError,
};
use switchyd_types::IpPrefix;

struct IntfsEntry {
    ip_prefixes: BTreeSet<IpPrefix>,
    ref_count: u32,
}

/// Interface/L3 orchestration (C5).
///
/// A router interface exists while its address set is non-empty or
/// its reference count is positive, and is destroyed exactly when
/// both drop to zero.
pub struct IntfsOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    entries: BTreeMap<String, IntfsEntry>,
}

impl IntfsOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        Self {
            ctx,
            consumer: Consumer::new(INTF_TABLE),
            entries: BTreeMap::new(),
        }
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    /// Bumps the reference count of a live interface.
    ///
    /// Panics if the interface does not exist: taking a reference on
    /// an interface that was never installed is a programmer error.
    pub fn increase_rif_ref(&mut self, alias: &str) {
        match self.entries.get_mut(alias) {
            Some(entry) => entry.ref_count += 1,
            None => panic!("reference increment on missing router interface {}", alias),
        }
    }

    /// Drops one reference of a live interface; panics on underflow.
    pub fn decrease_rif_ref(&mut self, alias: &str) {
        match self.entries.get_mut(alias) {
            Some(entry) => {
                entry.ref_count = entry
                    .ref_count
                    .checked_sub(1)
                    .unwrap_or_else(|| {
                        panic!("reference underflow on router interface {}", alias)
                    });
            }
            None => panic!("reference decrement on missing router interface {}", alias),
        }
    }

    pub fn rif_ref_count(&self, alias: &str) -> Option<u32> {
        self.entries.get(alias).map(|e| e.ref_count)
    }

    pub fn do_task(&mut self, ports: &mut PortsOrch) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = self.process(&entry, ports);
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", INTF_TABLE, entry.key);
                }
            }
        }

        self.consumer.requeue(retained);
    }

    fn process(&mut self, entry: &KeyOpFieldValues, ports: &mut PortsOrch) -> TaskStatus {
        let Some((alias, prefix_str)) = entry.key.split_once(':') else {
            warn!("invalid interface key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let alias = alias.to_string();
        let prefix: IpPrefix = match prefix_str.parse() {
            Ok(p) => p,
            Err(e) => {
                warn!("invalid interface prefix {:?}: {}", prefix_str, e);
                return TaskStatus::Invalid;
            }
        };

        if alias == "eth0" || alias == "docker0" {
            return TaskStatus::Consumed;
        }

        match entry.op {
            Operation::Set => {
                if alias == "lo" {
                    return match self.add_ip2me_route(&prefix) {
                        Ok(()) => TaskStatus::Consumed,
                        Err(e) => {
                            warn!("failed to add IP2me route for {}: {}", prefix, e);
                            e.status()
                        }
                    };
                }
                self.add(&alias, &prefix, ports)
            }
            Operation::Del => {
                if alias == "lo" {
                    return match self.remove_ip2me_route(&prefix) {
                        Ok(()) => TaskStatus::Consumed,
                        Err(e) => {
                            warn!("failed to remove IP2me route for {}: {}", prefix, e);
                            e.status()
                        }
                    };
                }
                self.remove(&alias, &prefix, ports)
            }
        }
    }

    fn add(&mut self, alias: &str, prefix: &IpPrefix, ports: &mut PortsOrch) -> TaskStatus {
        let Some(port) = ports.get(alias) else {
            return TaskStatus::Retry;
        };

        if !self.entries.contains_key(alias) {
            if port.rif.is_none() {
                let anchor = match port.kind {
                    PortKind::Phy | PortKind::Cpu => RifAnchor::Port(port.port_oid),
                    PortKind::Lag => match port.lag_oid {
                        Some(lag) => RifAnchor::Lag(lag),
                        None => return TaskStatus::Retry,
                    },
                    PortKind::Vlan => match port.vlan_oid {
                        Some(vlan) => RifAnchor::Vlan(vlan),
                        None => return TaskStatus::Retry,
                    },
                };
                let config = RifConfig {
                    virtual_router: self.ctx.info().virtual_router,
                    src_mac: self.ctx.info().mac,
                    anchor,
                };
                match self.ctx.sad().create_router_interface(&config) {
                    Ok(rif) => {
                        ports.set_rif(alias, Some(rif));
                        info!("created router interface on {}", alias);
                    }
                    Err(e) => {
                        warn!("failed to create router interface on {}: {}", alias, e);
                        return TaskStatus::Retry;
                    }
                }
            }
            self.entries.insert(
                alias.to_string(),
                IntfsEntry {
                    ip_prefixes: BTreeSet::new(),
                    ref_count: 0,
                },
            );
        }

        if self.entries[alias].ip_prefixes.contains(prefix) {
            return TaskStatus::Consumed;
        }

        // Some host configurators apply an address in two stages with
        // different masks; wait for the stale overlapping prefix to be
        // withdrawn instead of programming both.
        let overlaps = self.entries[alias].ip_prefixes.iter().any(|existing| {
            existing.contains(&prefix.ip()) || prefix.contains(&existing.ip())
        });
        if overlaps {
            info!("interface {} address {} overlaps, deferring", alias, prefix);
            return TaskStatus::Retry;
        }

        let rif = ports
            .get(alias)
            .and_then(|p| p.rif)
            .expect("router interface vanished during interface add");

        if let Err(e) = self.add_subnet_route(rif, prefix) {
            warn!("failed to add subnet route for {}: {}", prefix, e);
            return e.status();
        }
        self.increase_rif_ref(alias);

        if let Err(e) = self.add_ip2me_route(prefix) {
            warn!("failed to add IP2me route for {}: {}", prefix, e);
            return e.status();
        }
        self.increase_rif_ref(alias);

        self.entries
            .get_mut(alias)
            .expect("interface entry vanished")
            .ip_prefixes
            .insert(*prefix);
        info!("added {} to interface {}", prefix, alias);
        TaskStatus::Consumed
    }

    fn remove(&mut self, alias: &str, prefix: &IpPrefix, ports: &mut PortsOrch) -> TaskStatus {
        if ports.get(alias).is_none() || !self.entries.contains_key(alias) {
            return TaskStatus::Consumed;
        }

        if self.entries[alias].ip_prefixes.contains(prefix) {
            if let Err(e) = self.remove_subnet_route(prefix) {
                warn!("failed to remove subnet route for {}: {}", prefix, e);
                return e.status();
            }
            self.decrease_rif_ref(alias);

            if let Err(e) = self.remove_ip2me_route(prefix) {
                warn!("failed to remove IP2me route for {}: {}", prefix, e);
                return e.status();
            }
            self.decrease_rif_ref(alias);

            self.entries
                .get_mut(alias)
                .expect("interface entry vanished")
                .ip_prefixes
                .remove(prefix);
            info!("removed {} from interface {}", prefix, alias);
        }

        let entry = &self.entries[alias];
        if !entry.ip_prefixes.is_empty() {
            return TaskStatus::Consumed;
        }
        if entry.ref_count > 0 {
            return TaskStatus::Retry;
        }

        let rif = ports
            .get(alias)
            .and_then(|p| p.rif)
            .expect("interface entry without a router interface");
        if let Err(e) = self.ctx.sad().remove_router_interface(rif) {
            warn!("failed to remove router interface on {}: {}", alias, e);
            return TaskStatus::Retry;
        }
        ports.set_rif(alias, None);
        self.entries.remove(alias);
        info!("removed router interface on {}", alias);
        TaskStatus::Consumed
    }

    fn route_id(&self, destination: IpPrefix) -> RouteId {
        RouteId {
            virtual_router: self.ctx.info().virtual_router,
            destination,
        }
    }

    fn add_subnet_route(&self, rif: RouterInterfaceOid, prefix: &IpPrefix) -> OrchResult<()> {
        let id = self.route_id(prefix.network());
        match self
            .ctx
            .sad()
            .create_route(&id, PacketAction::Forward, Some(rif.as_raw()))
        {
            Ok(()) | Err(SadError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(OrchError::from(e)),
        }
    }

    fn remove_subnet_route(&self, prefix: &IpPrefix) -> OrchResult<()> {
        let id = self.route_id(prefix.network());
        match self.ctx.sad().remove_route(&id) {
            Ok(()) | Err(SadError::NotFound { .. }) => Ok(()),
            Err(e) => Err(OrchError::from(e)),
        }
    }

    fn add_ip2me_route(&self, prefix: &IpPrefix) -> OrchResult<()> {
        let id = self.route_id(prefix.host_prefix());
        let cpu = self.ctx.info().cpu_port;
        match self
            .ctx
            .sad()
            .create_route(&id, PacketAction::Forward, Some(cpu.as_raw()))
        {
            Ok(()) | Err(SadError::AlreadyExists { .. }) => Ok(()),
            Err(e) => Err(OrchError::from(e)),
        }
    }

    fn remove_ip2me_route(&self, prefix: &IpPrefix) -> OrchResult<()> {
        let id = self.route_id(prefix.host_prefix());
        match self.ctx.sad().remove_route(&id) {
            Ok(()) | Err(SadError::NotFound { .. }) => Ok(()),
            Err(e) => Err(OrchError::from(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::EventQueue;
    use crate::tables::PORT_TABLE;
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    fn setup() -> (SwitchContext, PortsOrch, IntfsOrch, Arc<SimDriver>) {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver.clone()).unwrap();
        let ports = PortsOrch::new(ctx.clone());
        let intfs = IntfsOrch::new(ctx.clone());
        (ctx, ports, intfs, driver)
    }

    fn add_port(ports: &mut PortsOrch, alias: &str, lanes: &str) {
        let mut events = EventQueue::new();
        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                alias,
                vec![("lanes".to_string(), lanes.to_string())],
            )]);
        ports.do_task(PORT_TABLE, &mut events);
    }

    #[test]
    fn test_interface_add_installs_routes() {
        let (_ctx, mut ports, mut intfs, driver) = setup();
        add_port(&mut ports, "Ethernet0", "0,1,2,3");

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);

        assert!(ports.get("Ethernet0").unwrap().rif.is_some());
        assert!(driver.has_route(&"10.0.0.0/24".parse().unwrap()));
        assert!(driver.has_route(&"10.0.0.1/32".parse().unwrap()));
        assert_eq!(intfs.rif_ref_count("Ethernet0"), Some(2));
    }

    #[test]
    fn test_interface_waits_for_port() {
        let (_ctx, mut ports, mut intfs, _driver) = setup();

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 1);

        add_port(&mut ports, "Ethernet0", "0,1,2,3");
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 0);
    }

    #[test]
    fn test_overlapping_prefix_defers() {
        let (_ctx, mut ports, mut intfs, _driver) = setup();
        add_port(&mut ports, "Ethernet0", "0,1,2,3");

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/8", vec![])]);
        intfs.do_task(&mut ports);

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 1);

        // Withdrawing the stage-one /8 unblocks the /24.
        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("Ethernet0:10.0.0.1/8")]);
        intfs.do_task(&mut ports);
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 0);
    }

    #[test]
    fn test_rif_destroyed_when_ips_and_refs_zero() {
        let (_ctx, mut ports, mut intfs, _driver) = setup();
        add_port(&mut ports, "Ethernet0", "0,1,2,3");

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);

        // An external reference keeps the interface alive.
        intfs.increase_rif_ref("Ethernet0");

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("Ethernet0:10.0.0.1/24")]);
        intfs.do_task(&mut ports);
        assert!(ports.get("Ethernet0").unwrap().rif.is_some());
        assert_eq!(intfs.pending(), 1);

        intfs.decrease_rif_ref("Ethernet0");
        intfs.do_task(&mut ports);
        assert!(ports.get("Ethernet0").unwrap().rif.is_none());
        assert_eq!(intfs.pending(), 0);
    }

    #[test]
    fn test_mgmt_interfaces_skipped() {
        let (_ctx, mut ports, mut intfs, driver) = setup();

        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("eth0:10.3.0.1/24", vec![])]);
        intfs.do_task(&mut ports);
        assert_eq!(intfs.pending(), 0);
        assert_eq!(driver.route_count(), 0);

        // Loopback addresses only install IP2me routes.
        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("lo:127.0.0.1/8", vec![])]);
        intfs.do_task(&mut ports);
        assert!(driver.has_route(&"127.0.0.1/32".parse().unwrap()));
        assert!(!driver.has_route(&"127.0.0.0/8".parse().unwrap()));
    }
}
