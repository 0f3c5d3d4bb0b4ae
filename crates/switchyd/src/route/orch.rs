//! Route orchestration: route entries, ECMP group lifetime, the
//! default-route invariant, resync and longest-prefix observers.

use super::nhg::{NextHopGroupEntry, NextHopGroupKey};
use crate::context::SwitchContext;
use crate::neigh::NeighOrch;
use crate::observer::{EventQueue, NextHopUpdate, Update};
use crate::tables::{self, ROUTE_TABLE};
use log::{debug, info, warn};
use rand::Rng;
use std::collections::BTreeMap;
use switchyd_orch_common::{
    Consumer, HasRefCount, KeyOpFieldValues, OrchError, OrchResult, Operation, SyncMap,
    TaskStatus,
};
use switchyd_sad::{PacketAction, RawOid, RouteId, SadResult};
use switchyd_types::{IpAddress, IpPrefix};

/// Scale factor applied when the switch reports the ECMP group count
/// for a group size of 1.
const ECMP_UNIT_GROUP_SIZE: u32 = 32;

/// Route/next-hop-group orchestration (C7).
pub struct RouteOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    /// Installed routes; the default routes are always present, with
    /// an empty key while they drop.
    routes: BTreeMap<IpPrefix, NextHopGroupKey>,
    nhgs: SyncMap<NextHopGroupKey, NextHopGroupEntry>,
    max_nhg: usize,
    resync: bool,
    /// Destinations observed for longest-prefix-match changes, with a
    /// registration count each.
    observers: BTreeMap<IpAddress, u32>,
}

impl RouteOrch {
    /// Builds the orchestrator and installs the IPv4/IPv6 default
    /// routes with a drop action.
    pub fn new(ctx: SwitchContext) -> SadResult<Self> {
        let info = ctx.info();
        let mut max_nhg = info.max_ecmp_groups;
        if info.ecmp_count_for_unit_group {
            max_nhg /= ECMP_UNIT_GROUP_SIZE;
        }
        info!("maximum number of ECMP groups is {}", max_nhg);

        let mut routes = BTreeMap::new();
        for destination in [IpPrefix::default_v4(), IpPrefix::default_v6()] {
            let id = RouteId {
                virtual_router: info.virtual_router,
                destination,
            };
            ctx.sad().create_route(&id, PacketAction::Drop, None)?;
            routes.insert(destination, NextHopGroupKey::new());
        }

        Ok(Self {
            ctx,
            consumer: Consumer::new(ROUTE_TABLE),
            routes,
            nhgs: SyncMap::new(),
            max_nhg: max_nhg as usize,
            resync: false,
            observers: BTreeMap::new(),
        })
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    pub fn route_count(&self) -> usize {
        self.routes.len()
    }

    pub fn route_nexthops(&self, prefix: &IpPrefix) -> Option<&NextHopGroupKey> {
        self.routes.get(prefix)
    }

    pub fn has_nhg(&self, key: &NextHopGroupKey) -> bool {
        self.nhgs.contains_key(key)
    }

    pub fn nhg_count(&self) -> usize {
        self.nhgs.len()
    }

    pub fn nhg_oid(&self, key: &NextHopGroupKey) -> Option<switchyd_sad::NextHopGroupOid> {
        self.nhgs.get(key).map(|e| e.oid)
    }

    pub fn nhg_ref_count(&self, key: &NextHopGroupKey) -> Option<u32> {
        self.nhgs.ref_count(key)
    }

    pub fn increase_nhg_ref(&mut self, key: &NextHopGroupKey) {
        self.nhgs.increment_ref(key);
    }

    pub fn decrease_nhg_ref(&mut self, key: &NextHopGroupKey) {
        self.nhgs.decrement_ref(key);
    }

    /// Registers a destination for longest-prefix-match updates and
    /// returns the current best match immediately.
    pub fn attach_nexthop_observer(&mut self, ip: IpAddress) -> Option<NextHopUpdate> {
        *self.observers.entry(ip).or_insert(0) += 1;
        self.best_match(&ip).map(|(prefix, key)| NextHopUpdate {
            prefix,
            nexthops: key.ips(),
        })
    }

    pub fn detach_nexthop_observer(&mut self, ip: &IpAddress) {
        if let Some(count) = self.observers.get_mut(ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.observers.remove(ip);
            }
        }
    }

    fn best_match(&self, ip: &IpAddress) -> Option<(IpPrefix, NextHopGroupKey)> {
        self.routes
            .iter()
            .filter(|(prefix, key)| prefix.contains(ip) && !key.is_empty())
            .max_by_key(|(prefix, _)| prefix.prefix_len())
            .map(|(prefix, key)| (*prefix, key.clone()))
    }

    /// Emits a longest-prefix-match update for every observed
    /// destination the changed prefix covers.
    fn notify_observers(&self, changed: &IpPrefix, events: &mut EventQueue) {
        for ip in self.observers.keys() {
            if !changed.contains(ip) {
                continue;
            }
            let update = match self.best_match(ip) {
                Some((prefix, key)) => NextHopUpdate {
                    prefix,
                    nexthops: key.ips(),
                },
                None => NextHopUpdate {
                    prefix: *changed,
                    nexthops: Default::default(),
                },
            };
            events.push(Update::NextHop(update));
        }
    }

    pub fn do_task(&mut self, neigh: &mut NeighOrch, events: &mut EventQueue) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            if entry.key == tables::ROUTE_RESYNC {
                self.handle_resync(&entry);
                continue;
            }
            if self.resync {
                retained.push(entry);
                continue;
            }

            let status = self.process(&entry, neigh, events);
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", ROUTE_TABLE, entry.key);
                }
            }
        }

        self.consumer.requeue(retained);
    }

    /// Resync: a SET seeds a synthetic DEL for every installed route;
    /// routes re-sent before the closing marker supersede their DELs
    /// in the pending map, so draining reconciles the feed (identical
    /// routes become no-ops, missing ones are deleted).
    fn handle_resync(&mut self, entry: &KeyOpFieldValues) {
        if entry.op == Operation::Set {
            info!("start route resync");
            let stale: Vec<KeyOpFieldValues> = self
                .routes
                .keys()
                .map(|prefix| KeyOpFieldValues::del(prefix.to_string()))
                .collect();
            self.consumer.add_to_sync(stale);
            self.resync = true;
        } else {
            info!("complete route resync");
            self.resync = false;
        }
    }

    fn process(
        &mut self,
        entry: &KeyOpFieldValues,
        neigh: &mut NeighOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let prefix: IpPrefix = match entry.key.parse() {
            Ok(p) => p,
            Err(e) => {
                warn!("invalid route key {:?}: {}", entry.key, e);
                return TaskStatus::Invalid;
            }
        };

        match entry.op {
            Operation::Set => {
                let ifname = entry.field("ifname").unwrap_or_default();
                if tables::is_mgmt_alias(ifname) {
                    // Routes repointed at host interfaces leave the
                    // forwarding plane.
                    if self.is_installed(&prefix) {
                        return match self.remove_route(&prefix, neigh, events) {
                            Ok(()) => TaskStatus::Consumed,
                            Err(e) => e.status(),
                        };
                    }
                    return TaskStatus::Consumed;
                }

                let key: NextHopGroupKey = match entry.field("nexthop").unwrap_or_default().parse()
                {
                    Ok(key) => key,
                    Err(e) => {
                        warn!("invalid nexthops for {}: {}", entry.key, e);
                        return TaskStatus::Invalid;
                    }
                };
                if key.is_empty() {
                    debug!("route {} carries no next hops, ignoring", prefix);
                    return TaskStatus::Consumed;
                }

                if self.routes.get(&prefix) == Some(&key) {
                    return TaskStatus::Consumed;
                }

                match self.add_route(&prefix, &key, neigh, events) {
                    Ok(()) => TaskStatus::Consumed,
                    Err(e) => {
                        debug!("route {} not installed: {}", prefix, e);
                        e.status()
                    }
                }
            }
            Operation::Del => match self.remove_route(&prefix, neigh, events) {
                Ok(()) => TaskStatus::Consumed,
                Err(e) => e.status(),
            },
        }
    }

    /// True when the prefix is installed with a live next hop (the
    /// dropping default entries do not count).
    fn is_installed(&self, prefix: &IpPrefix) -> bool {
        match self.routes.get(prefix) {
            Some(key) => !key.is_empty() || !prefix.is_default(),
            None => false,
        }
    }

    fn resolve_single(&self, key: &NextHopGroupKey, neigh: &NeighOrch) -> OrchResult<RawOid> {
        let ip = key.first().expect("single next hop key is empty");
        neigh
            .next_hop_oid(&ip)
            .map(|oid| oid.as_raw())
            .ok_or_else(|| OrchError::unresolved(format!("next hop {} is not installed", ip)))
    }

    pub fn add_route(
        &mut self,
        prefix: &IpPrefix,
        key: &NextHopGroupKey,
        neigh: &mut NeighOrch,
        events: &mut EventQueue,
    ) -> OrchResult<()> {
        let mut created_group = false;

        let next_hop: RawOid = if key.len() == 1 {
            self.resolve_single(key, neigh)?
        } else if let Some(oid) = self.nhg_oid(key) {
            oid.as_raw()
        } else {
            match self.add_next_hop_group(key, neigh) {
                Ok(oid) => {
                    created_group = true;
                    oid.as_raw()
                }
                Err(e) => {
                    // When the installed route already points at one
                    // member of the wanted set, keep it rather than
                    // churning through another temporary route.
                    if let Some(current) = self.routes.get(prefix) {
                        if current.len() == 1
                            && current.first().map(|ip| key.contains(&ip)).unwrap_or(false)
                        {
                            return Err(e);
                        }
                    }
                    self.add_temp_route(prefix, key, neigh, events);
                    return Err(e);
                }
            }
        };

        let id = RouteId {
            virtual_router: self.ctx.info().virtual_router,
            destination: *prefix,
        };

        let previous = self.routes.get(prefix).cloned();
        let result: OrchResult<()> = match &previous {
            None => self
                .ctx
                .sad()
                .create_route(&id, PacketAction::Forward, Some(next_hop))
                .map_err(OrchError::from),
            Some(old) => {
                let set = || -> OrchResult<()> {
                    if old.is_empty() {
                        self.ctx.sad().set_route_action(&id, PacketAction::Forward)?;
                    }
                    self.ctx.sad().set_route_next_hop(&id, Some(next_hop))?;
                    Ok(())
                };
                set()
            }
        };

        if let Err(e) = result {
            warn!("failed to program route {}: {}", prefix, e);
            if created_group {
                if let Err(e) = self.remove_next_hop_group(key, neigh) {
                    warn!("failed to unwind next hop group {}: {}", key, e);
                }
            }
            return Err(e);
        }

        self.increase_key_ref(key, neigh);
        if let Some(old) = previous {
            self.decrease_key_ref(&old, neigh);
            self.drop_unreferenced_group(&old, neigh);
        }

        self.routes.insert(*prefix, key.clone());
        info!("installed route {} via {}", prefix, key);
        self.notify_observers(prefix, events);
        Ok(())
    }

    pub fn remove_route(
        &mut self,
        prefix: &IpPrefix,
        neigh: &mut NeighOrch,
        events: &mut EventQueue,
    ) -> OrchResult<()> {
        let Some(old) = self.routes.get(prefix).cloned() else {
            return Ok(());
        };

        let id = RouteId {
            virtual_router: self.ctx.info().virtual_router,
            destination: *prefix,
        };

        if prefix.is_default() {
            // The default entries always exist; dropping is the
            // closest thing to removal they get.
            self.ctx.sad().set_route_action(&id, PacketAction::Drop)?;
            self.ctx.sad().set_route_next_hop(&id, None)?;
            if !old.is_empty() {
                self.decrease_key_ref(&old, neigh);
                self.drop_unreferenced_group(&old, neigh);
            }
            self.routes.insert(*prefix, NextHopGroupKey::new());
            info!("default route {} set to drop", prefix);
        } else {
            self.ctx.sad().remove_route(&id)?;
            self.decrease_key_ref(&old, neigh);
            self.drop_unreferenced_group(&old, neigh);
            self.routes.remove(prefix);
            info!("removed route {}", prefix);
        }

        self.notify_observers(prefix, events);
        Ok(())
    }

    /// Installs a temporary route over one live member of the wanted
    /// set, picked at random, while the group waits for capacity.
    fn add_temp_route(
        &mut self,
        prefix: &IpPrefix,
        key: &NextHopGroupKey,
        neigh: &mut NeighOrch,
        events: &mut EventQueue,
    ) {
        let live: Vec<IpAddress> = key
            .iter()
            .filter(|ip| neigh.has_next_hop(ip))
            .copied()
            .collect();
        if live.is_empty() {
            return;
        }

        let pick = live[rand::thread_rng().gen_range(0..live.len())];
        let temp = NextHopGroupKey::single(pick);
        info!("installing temporary route {} via {}", prefix, pick);
        if let Err(e) = self.add_route(prefix, &temp, neigh, events) {
            warn!("failed to install temporary route {}: {}", prefix, e);
        }
    }

    /// Creates the ECMP group for a next-hop set. Fails when capacity
    /// is exhausted or a member next hop is not installed.
    pub fn add_next_hop_group(
        &mut self,
        key: &NextHopGroupKey,
        neigh: &mut NeighOrch,
    ) -> OrchResult<switchyd_sad::NextHopGroupOid> {
        assert!(!self.has_nhg(key), "next hop group {} already exists", key);

        if self.nhgs.len() >= self.max_nhg {
            return Err(OrchError::unresolved(format!(
                "maximum of {} next hop groups reached",
                self.max_nhg
            )));
        }

        let mut member_oids = Vec::with_capacity(key.len());
        for ip in key.iter() {
            let oid = neigh.next_hop_oid(ip).ok_or_else(|| {
                OrchError::unresolved(format!("next hop {} of group {} is not installed", ip, key))
            })?;
            member_oids.push((*ip, oid));
        }

        let group = self.ctx.sad().create_next_hop_group()?;
        let mut members = Vec::with_capacity(member_oids.len());
        for (ip, nh_oid) in member_oids {
            match self.ctx.sad().create_next_hop_group_member(group, nh_oid) {
                Ok(member) => members.push((ip, member)),
                Err(e) => {
                    for (_, member) in &members {
                        if let Err(e) = self.ctx.sad().remove_next_hop_group_member(*member) {
                            warn!("failed to unwind group member: {}", e);
                        }
                    }
                    if let Err(e) = self.ctx.sad().remove_next_hop_group(group) {
                        warn!("failed to unwind next hop group {}: {}", key, e);
                    }
                    return Err(OrchError::from(e));
                }
            }
        }

        for ip in key.iter() {
            neigh.increase_next_hop_ref(ip);
        }
        self.nhgs.insert(key.clone(), NextHopGroupEntry::new(group, members));
        info!("created next hop group {}", key);
        Ok(group)
    }

    /// Destroys an unreferenced group and releases its member next
    /// hops.
    pub fn remove_next_hop_group(
        &mut self,
        key: &NextHopGroupKey,
        neigh: &mut NeighOrch,
    ) -> OrchResult<()> {
        let Some(entry) = self.nhgs.get(key) else {
            return Ok(());
        };
        if entry.ref_count() > 0 {
            return Err(OrchError::unresolved(format!(
                "next hop group {} is still referenced",
                key
            )));
        }

        for (_, member) in &entry.members {
            self.ctx.sad().remove_next_hop_group_member(*member)?;
        }
        self.ctx.sad().remove_next_hop_group(entry.oid)?;

        self.nhgs.remove(key);
        for ip in key.iter() {
            neigh.decrease_next_hop_ref(ip);
        }
        info!("removed next hop group {}", key);
        Ok(())
    }

    fn increase_key_ref(&mut self, key: &NextHopGroupKey, neigh: &mut NeighOrch) {
        if key.is_empty() {
            return;
        }
        if key.len() == 1 {
            let ip = key.first().expect("single next hop key is empty");
            neigh.increase_next_hop_ref(&ip);
        } else {
            self.increase_nhg_ref(key);
        }
    }

    fn decrease_key_ref(&mut self, key: &NextHopGroupKey, neigh: &mut NeighOrch) {
        if key.is_empty() {
            return;
        }
        if key.len() == 1 {
            let ip = key.first().expect("single next hop key is empty");
            neigh.decrease_next_hop_ref(&ip);
        } else {
            self.decrease_nhg_ref(key);
        }
    }

    fn drop_unreferenced_group(&mut self, key: &NextHopGroupKey, neigh: &mut NeighOrch) {
        if key.is_ecmp() && self.nhg_ref_count(key) == Some(0) {
            if let Err(e) = self.remove_next_hop_group(key, neigh) {
                warn!("failed to remove next hop group {}: {}", key, e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intfs::IntfsOrch;
    use crate::ports::PortsOrch;
    use crate::tables::PORT_TABLE;
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    struct Fixture {
        ports: PortsOrch,
        intfs: IntfsOrch,
        neigh: NeighOrch,
        route: RouteOrch,
        driver: Arc<SimDriver>,
        events: EventQueue,
    }

    fn setup_with(config: SimConfig) -> Fixture {
        let driver = Arc::new(SimDriver::new(config));
        let ctx = SwitchContext::new(driver.clone()).unwrap();
        let mut ports = PortsOrch::new(ctx.clone());
        let mut intfs = IntfsOrch::new(ctx.clone());
        let neigh = NeighOrch::new(ctx.clone());
        let route = RouteOrch::new(ctx).unwrap();
        let mut events = EventQueue::new();

        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                vec![("lanes".to_string(), "0,1,2,3".to_string())],
            )]);
        ports.do_task(PORT_TABLE, &mut events);
        intfs
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set("Ethernet0:10.0.0.1/24", vec![])]);
        intfs.do_task(&mut ports);

        Fixture {
            ports,
            intfs,
            neigh,
            route,
            driver,
            events,
        }
    }

    fn setup() -> Fixture {
        setup_with(SimConfig::default())
    }

    fn add_neighbor(fx: &mut Fixture, ip: &str, mac: &str) {
        fx.neigh
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set(
                format!("Ethernet0:{}", ip),
                vec![("neigh".to_string(), mac.to_string())],
            )]);
        fx.neigh
            .do_task(&fx.ports, &mut fx.intfs, &mut fx.events);
    }

    fn publish_route(fx: &mut Fixture, prefix: &str, nexthops: &str) {
        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set(
                prefix,
                vec![("nexthop".to_string(), nexthops.to_string())],
            )]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
    }

    #[test]
    fn test_default_routes_installed_at_construction() {
        let fx = setup();
        assert_eq!(fx.route.route_count(), 2);
        let (action, _) = fx.driver.route_state(&IpPrefix::default_v4()).unwrap();
        assert_eq!(action, PacketAction::Drop);
        assert!(fx.driver.has_route(&IpPrefix::default_v6()));
    }

    #[test]
    fn test_route_waits_for_next_hop() {
        let mut fx = setup();
        publish_route(&mut fx, "20.1.0.0/24", "10.0.0.2");
        assert_eq!(fx.route.pending(), 1);

        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        assert_eq!(fx.route.pending(), 0);
        assert!(fx.driver.has_route(&"20.1.0.0/24".parse().unwrap()));
    }

    #[test]
    fn test_ecmp_group_reuse_and_teardown() {
        let mut fx = setup();
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");
        add_neighbor(&mut fx, "10.0.0.3", "aa:bb:cc:dd:ee:02");

        publish_route(&mut fx, "20.1.0.0/24", "10.0.0.2,10.0.0.3");
        publish_route(&mut fx, "20.2.0.0/24", "10.0.0.3,10.0.0.2");

        assert_eq!(fx.driver.next_hop_group_count(), 1);
        let key: NextHopGroupKey = "10.0.0.2,10.0.0.3".parse().unwrap();
        assert_eq!(fx.route.nhg_ref_count(&key), Some(2));

        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("20.1.0.0/24")]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        assert_eq!(fx.driver.next_hop_group_count(), 1);

        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("20.2.0.0/24")]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        assert_eq!(fx.driver.next_hop_group_count(), 0);

        // The member next hops are free again.
        let ip: IpAddress = "10.0.0.2".parse().unwrap();
        assert_eq!(fx.neigh.next_hop_ref_count(&ip), Some(0));
    }

    #[test]
    fn test_default_route_never_removed() {
        let mut fx = setup();
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");

        publish_route(&mut fx, "0.0.0.0/0", "10.0.0.2");
        let (action, _) = fx.driver.route_state(&IpPrefix::default_v4()).unwrap();
        assert_eq!(action, PacketAction::Forward);

        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("0.0.0.0/0")]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);

        assert!(fx.driver.has_route(&IpPrefix::default_v4()));
        let (action, _) = fx.driver.route_state(&IpPrefix::default_v4()).unwrap();
        assert_eq!(action, PacketAction::Drop);
        assert_eq!(
            fx.route.route_nexthops(&IpPrefix::default_v4()),
            Some(&NextHopGroupKey::new())
        );
    }

    #[test]
    fn test_max_ecmp_backoff_installs_temp_route() {
        let mut fx = setup_with(SimConfig {
            max_ecmp_groups: 1,
            ..SimConfig::default()
        });
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");
        add_neighbor(&mut fx, "10.0.0.3", "aa:bb:cc:dd:ee:02");
        add_neighbor(&mut fx, "10.0.0.4", "aa:bb:cc:dd:ee:03");

        publish_route(&mut fx, "20.1.0.0/24", "10.0.0.2,10.0.0.3");
        assert_eq!(fx.driver.next_hop_group_count(), 1);
        assert_eq!(fx.route.pending(), 0);

        // The second distinct set exceeds capacity: a temporary
        // single-member route is installed and the entry stays pending.
        publish_route(&mut fx, "20.2.0.0/24", "10.0.0.3,10.0.0.4");
        assert_eq!(fx.driver.next_hop_group_count(), 1);
        assert_eq!(fx.route.pending(), 1);
        let temp = fx.route.route_nexthops(&"20.2.0.0/24".parse().unwrap());
        assert_eq!(temp.map(|k| k.len()), Some(1));

        // Freeing the first group drains the retry.
        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("20.1.0.0/24")]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        assert_eq!(fx.route.pending(), 0);
        let key: NextHopGroupKey = "10.0.0.3,10.0.0.4".parse().unwrap();
        assert_eq!(fx.route.nhg_ref_count(&key), Some(1));
    }

    #[test]
    fn test_observer_attach_delivers_current_best() {
        let mut fx = setup();
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");
        publish_route(&mut fx, "20.1.1.0/24", "10.0.0.2");

        let dst: IpAddress = "20.1.1.7".parse().unwrap();
        let update = fx.route.attach_nexthop_observer(dst).unwrap();
        assert_eq!(update.prefix, "20.1.1.0/24".parse().unwrap());
        assert!(update.nexthops.contains(&"10.0.0.2".parse().unwrap()));
    }

    #[test]
    fn test_observer_notified_on_route_change() {
        let mut fx = setup();
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");

        let dst: IpAddress = "20.1.1.7".parse().unwrap();
        assert!(fx.route.attach_nexthop_observer(dst).is_none());

        publish_route(&mut fx, "20.1.1.0/24", "10.0.0.2");
        let mut saw = false;
        while let Some(update) = fx.events.pop() {
            if let Update::NextHop(u) = update {
                assert_eq!(u.prefix, "20.1.1.0/24".parse().unwrap());
                assert!(!u.nexthops.is_empty());
                saw = true;
            }
        }
        assert!(saw);

        // Removal notifies with an empty set.
        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("20.1.1.0/24")]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        let mut saw_empty = false;
        while let Some(update) = fx.events.pop() {
            if let Update::NextHop(u) = update {
                saw_empty = u.nexthops.is_empty();
            }
        }
        assert!(saw_empty);
    }

    #[test]
    fn test_resync_reconciles_feed() {
        let mut fx = setup();
        add_neighbor(&mut fx, "10.0.0.2", "aa:bb:cc:dd:ee:01");

        for i in 0..10 {
            publish_route(&mut fx, &format!("20.{}.0.0/24", i), "10.0.0.2");
        }
        assert_eq!(fx.route.pending(), 0);
        fx.driver.take_ops();
        let removes_before = fx.driver.route_removes();
        let creates_before = fx.driver.route_creates();

        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::set(tables::ROUTE_RESYNC, vec![])]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);

        for i in 0..7 {
            fx.route
                .consumer_mut()
                .add_to_sync(vec![KeyOpFieldValues::set(
                    format!("20.{}.0.0/24", i),
                    vec![("nexthop".to_string(), "10.0.0.2".to_string())],
                )]);
        }
        fx.route.do_task(&mut fx.neigh, &mut fx.events);

        fx.route
            .consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del(tables::ROUTE_RESYNC)]);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);
        fx.route.do_task(&mut fx.neigh, &mut fx.events);

        assert_eq!(fx.route.pending(), 0);
        assert_eq!(fx.driver.route_removes() - removes_before, 3);
        assert_eq!(fx.driver.route_creates(), creates_before);
        for i in 0..7 {
            let prefix: IpPrefix = format!("20.{}.0.0/24", i).parse().unwrap();
            assert!(fx.driver.has_route(&prefix));
        }
    }
}
