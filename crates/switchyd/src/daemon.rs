//! The reconciliation event loop.
//!
//! One control thread owns every orchestrator and all driver calls:
//! it selects on the store, pops one table at a time, runs that
//! table's `do_task`, drains the update queue and then gives pending
//! entries a retry pass so work unblocked by a sibling subsystem
//! lands on the same tick. The ACL counter collector is the only
//! auxiliary thread.

use crate::acl::{AclOrch, CounterCollector, CounterHub, COUNTERS_READ_INTERVAL};
use crate::buffer::{BufferOrch, BUFFER_TABLES};
use crate::context::SwitchContext;
use crate::copp::CoppOrch;
use crate::fdb::FdbOrch;
use crate::intfs::IntfsOrch;
use crate::mirror::MirrorOrch;
use crate::neigh::NeighOrch;
use crate::observer::{EventQueue, Update};
use crate::ports::PortsOrch;
use crate::qos::{QosOrch, QOS_TABLES};
use crate::route::RouteOrch;
use crate::tables::*;
use log::{debug, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use switchyd_orch_common::{KeyOpFieldValues, Recorder, Store};
use switchyd_sad::{SadError, SadResult, SwitchDriver};

/// The tables the daemon consumes, in drain priority order.
pub const ALL_TABLES: [&str; 28] = [
    PORT_TABLE,
    VLAN_TABLE,
    VLAN_MEMBER_TABLE,
    LAG_TABLE,
    LAG_MEMBER_TABLE,
    INTF_TABLE,
    NEIGH_TABLE,
    ROUTE_TABLE,
    FDB_TABLE,
    MIRROR_SESSION_TABLE,
    ACL_TABLE,
    ACL_RULE_TABLE,
    COPP_TABLE,
    DSCP_TO_TC_MAP_TABLE,
    TC_TO_QUEUE_MAP_TABLE,
    TC_TO_PG_MAP_TABLE,
    PFC_PRIORITY_TO_QUEUE_MAP_TABLE,
    PFC_PRIORITY_TO_PG_MAP_TABLE,
    WRED_PROFILE_TABLE,
    SCHEDULER_TABLE,
    QUEUE_TABLE,
    PORT_QOS_MAP_TABLE,
    BUFFER_POOL_TABLE,
    BUFFER_PROFILE_TABLE,
    BUFFER_QUEUE_TABLE,
    BUFFER_PG_TABLE,
    BUFFER_PORT_INGRESS_PROFILE_LIST,
    BUFFER_PORT_EGRESS_PROFILE_LIST,
];

#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub batch_size: usize,
    pub select_timeout: Duration,
    pub counter_interval: Duration,
    pub record_path: Option<PathBuf>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            batch_size: 128,
            select_timeout: Duration::from_millis(500),
            counter_interval: COUNTERS_READ_INTERVAL,
            record_path: None,
        }
    }
}

/// The daemon: owns the store handle, every subsystem orchestrator,
/// the update queue and the counter collector.
pub struct OrchDaemon {
    ctx: SwitchContext,
    store: Store,
    events: EventQueue,
    recorder: Option<Recorder>,
    batch_size: usize,
    select_timeout: Duration,
    ports: PortsOrch,
    intfs: IntfsOrch,
    neigh: NeighOrch,
    route: RouteOrch,
    fdb: FdbOrch,
    mirror: MirrorOrch,
    acl: AclOrch,
    qos: QosOrch,
    buffer: BufferOrch,
    copp: CoppOrch,
    collector: Option<CounterCollector>,
}

impl OrchDaemon {
    pub fn new(
        store: Store,
        driver: Arc<dyn SwitchDriver>,
        config: DaemonConfig,
    ) -> SadResult<Self> {
        let ctx = SwitchContext::new(Arc::clone(&driver))?;

        for table in ALL_TABLES {
            store.watch(table);
        }

        let recorder = match &config.record_path {
            Some(path) => Some(
                Recorder::open(path)
                    .map_err(|e| SadError::internal(format!("record log: {}", e)))?,
            ),
            None => None,
        };

        let hub = Arc::new(CounterHub::new());
        let collector = CounterCollector::spawn(
            Arc::clone(&hub),
            driver,
            store.clone(),
            config.counter_interval,
        );

        let ports = PortsOrch::new(ctx.clone());
        let intfs = IntfsOrch::new(ctx.clone());
        let neigh = NeighOrch::new(ctx.clone());
        let route = RouteOrch::new(ctx.clone())?;
        let fdb = FdbOrch::new(ctx.clone());
        let mirror = MirrorOrch::new(ctx.clone(), store.clone());
        let acl = AclOrch::new(ctx.clone(), store.clone(), hub);
        let qos = QosOrch::new(ctx.clone());
        let buffer = BufferOrch::new(ctx.clone());
        let copp = CoppOrch::new(ctx.clone())?;

        info!("orchestration daemon initialized");
        Ok(Self {
            ctx,
            store,
            events: EventQueue::new(),
            recorder,
            batch_size: config.batch_size,
            select_timeout: config.select_timeout,
            ports,
            intfs,
            neigh,
            route,
            fdb,
            mirror,
            acl,
            qos,
            buffer,
            copp,
            collector: Some(collector),
        })
    }

    pub fn ports(&self) -> &PortsOrch {
        &self.ports
    }

    pub fn route(&self) -> &RouteOrch {
        &self.route
    }

    pub fn neigh(&self) -> &NeighOrch {
        &self.neigh
    }

    pub fn mirror(&self) -> &MirrorOrch {
        &self.mirror
    }

    pub fn acl(&self) -> &AclOrch {
        &self.acl
    }

    pub fn qos(&self) -> &QosOrch {
        &self.qos
    }

    /// Pops and processes one table, then drains the updates that
    /// processing queued.
    pub fn execute(&mut self, table: &str) {
        let entries = self.store.pop_batch(table, self.batch_size);
        if entries.is_empty() {
            return;
        }
        if let Some(recorder) = &mut self.recorder {
            for entry in &entries {
                recorder.record(table, entry);
            }
        }
        debug!("popped {} entries from {}", entries.len(), table);
        self.feed(table, entries);
        self.dispatch(table);
        self.drain_events();
    }

    fn feed(&mut self, table: &str, entries: Vec<KeyOpFieldValues>) {
        match table {
            PORT_TABLE | VLAN_TABLE | VLAN_MEMBER_TABLE | LAG_TABLE | LAG_MEMBER_TABLE => {
                self.ports.consumer_mut(table).add_to_sync(entries)
            }
            INTF_TABLE => self.intfs.consumer_mut().add_to_sync(entries),
            NEIGH_TABLE => self.neigh.consumer_mut().add_to_sync(entries),
            ROUTE_TABLE => self.route.consumer_mut().add_to_sync(entries),
            FDB_TABLE => self.fdb.consumer_mut().add_to_sync(entries),
            MIRROR_SESSION_TABLE => self.mirror.consumer_mut().add_to_sync(entries),
            ACL_TABLE | ACL_RULE_TABLE => self.acl.consumer_mut(table).add_to_sync(entries),
            COPP_TABLE => self.copp.consumer_mut().add_to_sync(entries),
            table if QOS_TABLES.contains(&table) => {
                self.qos.consumer_mut(table).add_to_sync(entries)
            }
            table if BUFFER_TABLES.contains(&table) => {
                self.buffer.consumer_mut(table).add_to_sync(entries)
            }
            _ => debug!("no consumer for table {}", table),
        }
    }

    fn dispatch(&mut self, table: &str) {
        match table {
            PORT_TABLE | VLAN_TABLE | VLAN_MEMBER_TABLE | LAG_TABLE | LAG_MEMBER_TABLE => {
                self.ports.do_task(table, &mut self.events)
            }
            INTF_TABLE => self.intfs.do_task(&mut self.ports),
            NEIGH_TABLE => self
                .neigh
                .do_task(&self.ports, &mut self.intfs, &mut self.events),
            ROUTE_TABLE => self.route.do_task(&mut self.neigh, &mut self.events),
            FDB_TABLE => self.fdb.do_task(&self.ports, &mut self.events),
            MIRROR_SESSION_TABLE => self.mirror.do_task(
                &mut self.route,
                &self.neigh,
                &self.ports,
                &self.fdb,
                &mut self.events,
            ),
            ACL_TABLE | ACL_RULE_TABLE => self.acl.do_task(
                table,
                &self.ports,
                &mut self.mirror,
                &mut self.route,
                &mut self.neigh,
            ),
            COPP_TABLE => self.copp.do_task(),
            table if QOS_TABLES.contains(&table) => {
                self.qos.do_task(table, &self.ports)
            }
            table if BUFFER_TABLES.contains(&table) => {
                self.buffer.do_task(table, &self.ports)
            }
            _ => {}
        }
    }

    fn pending(&self, table: &str) -> usize {
        match table {
            PORT_TABLE | VLAN_TABLE | VLAN_MEMBER_TABLE | LAG_TABLE | LAG_MEMBER_TABLE => {
                self.ports.pending(table)
            }
            INTF_TABLE => self.intfs.pending(),
            NEIGH_TABLE => self.neigh.pending(),
            ROUTE_TABLE => self.route.pending(),
            FDB_TABLE => self.fdb.pending(),
            MIRROR_SESSION_TABLE => self.mirror.pending(),
            ACL_TABLE | ACL_RULE_TABLE => self.acl.pending(table),
            COPP_TABLE => self.copp.pending(),
            table if QOS_TABLES.contains(&table) => self.qos.pending(table),
            table if BUFFER_TABLES.contains(&table) => self.buffer.pending(table),
            _ => 0,
        }
    }

    /// Hands every queued update to its subscribers. Handlers may
    /// queue further updates; the queue drains until it is empty.
    fn drain_events(&mut self) {
        while let Some(update) = self.events.pop() {
            match update {
                Update::NextHop(u) => self.mirror.on_next_hop_update(
                    &u,
                    &self.ports,
                    &self.fdb,
                    &self.neigh,
                    &mut self.events,
                ),
                Update::Neighbor(u) => {
                    self.mirror
                        .on_neighbor_update(&u, &self.ports, &self.fdb, &mut self.events)
                }
                Update::Fdb(u) => self.mirror.on_fdb_update(&u, &self.ports, &mut self.events),
                Update::LagMember(u) => {
                    self.mirror
                        .on_lag_member_update(&u, &self.ports, &mut self.events)
                }
                Update::VlanMember(u) => {
                    self.mirror.on_vlan_member_update(&u, &mut self.events)
                }
                Update::MirrorSession(u) => {
                    self.acl.on_mirror_session_update(&u, &self.mirror)
                }
            }
        }
    }

    /// Re-runs `do_task` for every table with pending entries, so
    /// dependencies installed this tick unblock their dependents.
    fn retry_pass(&mut self) {
        for table in ALL_TABLES {
            if self.pending(table) > 0 {
                self.dispatch(table);
                self.drain_events();
            }
        }
    }

    /// The timeout-driven housekeeping: post init-done once the seed
    /// port set is complete, then bootstrap the QoS coloring rules.
    fn tick(&mut self) {
        if self.ports.post_init_done(&self.store) {
            self.qos.init_ecn_color_rules(&self.ports);
        }
    }

    /// One scheduling round: drain every ready table, retry pending
    /// work, run housekeeping.
    pub fn run_once(&mut self) {
        let ready = self.store.ready_tables();
        for table in ALL_TABLES {
            if ready.contains(table) {
                self.execute(table);
            }
        }
        self.retry_pass();
        self.tick();
    }

    /// Drives scheduling rounds until the store is quiet. Blocked
    /// entries stay pending; the bound keeps a feedback loop (like the
    /// mirror status write-back) from spinning forever.
    pub fn process_all(&mut self) {
        for _ in 0..8 {
            if self.store.ready_tables().is_empty() {
                break;
            }
            self.run_once();
        }
        self.retry_pass();
        self.tick();
    }

    /// The main loop: select with a timeout, process, repeat until
    /// the terminate flag raises. A raised rotate flag reopens the
    /// record log and asks the driver to rotate its own.
    pub fn run(&mut self, terminate: Arc<AtomicBool>, rotate: Arc<AtomicBool>) {
        info!("entering reconciliation loop");
        while !terminate.load(Ordering::SeqCst) {
            if rotate.swap(false, Ordering::SeqCst) {
                if let Some(recorder) = &self.recorder {
                    recorder.rotate_flag().store(true, Ordering::SeqCst);
                }
                self.ctx.sad().request_log_rotate();
            }

            self.store.wait_ready(self.select_timeout);
            self.run_once();
        }
        info!("reconciliation loop stopped");
        self.shutdown();
    }

    /// Stops the counter collector and joins it.
    pub fn shutdown(&mut self) {
        if let Some(mut collector) = self.collector.take() {
            collector.stop();
        }
    }
}

impl Drop for OrchDaemon {
    fn drop(&mut self) {
        self.shutdown();
    }
}
