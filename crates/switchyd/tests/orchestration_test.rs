//! End-to-end reconciliation scenarios driven through the store.

use std::sync::Arc;
use std::time::Duration;
use switchyd::tables::*;
use switchyd::{DaemonConfig, OrchDaemon};
use switchyd_orch_common::Store;
use switchyd_sad::{AclRangeKind, PacketAction, SimConfig, SimDriver};
use switchyd_types::IpPrefix;

struct Harness {
    store: Store,
    driver: Arc<SimDriver>,
    daemon: OrchDaemon,
}

fn harness_with(sim: SimConfig, config: DaemonConfig) -> Harness {
    let store = Store::new();
    let driver = Arc::new(SimDriver::new(sim));
    let daemon = OrchDaemon::new(store.clone(), driver.clone(), config)
        .expect("daemon initialization");
    Harness {
        store,
        driver,
        daemon,
    }
}

fn harness() -> Harness {
    harness_with(SimConfig::default(), DaemonConfig::default())
}

impl Harness {
    fn set(&self, table: &str, key: &str, fields: &[(&str, &str)]) {
        self.store.set(
            table,
            key,
            fields
                .iter()
                .map(|(f, v)| (f.to_string(), v.to_string()))
                .collect(),
        );
    }

    fn del(&self, table: &str, key: &str) {
        self.store.del(table, key);
    }

    fn run(&mut self) {
        self.daemon.process_all();
    }

    /// Seeds two front-panel ports with L3 interfaces.
    fn seed_l3(&mut self) {
        self.set(
            PORT_TABLE,
            "Ethernet0",
            &[("lanes", "0,1,2,3"), ("admin_status", "up")],
        );
        self.set(
            PORT_TABLE,
            "Ethernet4",
            &[("lanes", "4,5,6,7"), ("admin_status", "up")],
        );
        self.set(PORT_TABLE, PORT_CONFIG_DONE, &[]);
        self.set(INTF_TABLE, "Ethernet0:10.1.0.1/16", &[]);
        self.set(INTF_TABLE, "Ethernet4:10.0.0.1/24", &[]);
        self.run();
        assert!(self.daemon.ports().init_done());
    }

    fn add_neighbor(&mut self, alias: &str, ip: &str, mac: &str) {
        self.set(
            NEIGH_TABLE,
            &format!("{}:{}", alias, ip),
            &[("neigh", mac)],
        );
        self.run();
    }

    fn mirror_status(&self, name: &str) -> Option<String> {
        self.store.get_field(MIRROR_SESSION_TABLE, name, "status")
    }
}

#[test]
fn publishing_a_route_twice_is_idempotent() {
    let mut h = harness();
    h.seed_l3();
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:01");

    h.set(
        ROUTE_TABLE,
        "20.1.0.0/24",
        &[("nexthop", "10.0.0.2"), ("ifname", "Ethernet4")],
    );
    h.run();
    assert!(h.driver.has_route(&"20.1.0.0/24".parse().unwrap()));
    h.driver.take_ops();

    // The identical publication reconciles to a no-op.
    h.set(
        ROUTE_TABLE,
        "20.1.0.0/24",
        &[("nexthop", "10.0.0.2"), ("ifname", "Ethernet4")],
    );
    h.run();
    assert!(h.driver.take_ops().is_empty());
}

#[test]
fn del_wins_over_set_within_a_batch() {
    let mut h = harness();
    h.seed_l3();
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:01");
    let creates_before = h.driver.route_creates();

    h.set(ROUTE_TABLE, "20.9.0.0/24", &[("nexthop", "10.0.0.2")]);
    h.del(ROUTE_TABLE, "20.9.0.0/24");
    h.run();

    assert!(!h.driver.has_route(&"20.9.0.0/24".parse().unwrap()));
    assert_eq!(h.driver.route_creates(), creates_before);
}

#[test]
fn default_routes_always_present() {
    let mut h = harness();
    h.seed_l3();
    assert!(h.driver.has_route(&IpPrefix::default_v4()));
    assert!(h.driver.has_route(&IpPrefix::default_v6()));

    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:01");
    h.set(ROUTE_TABLE, "0.0.0.0/0", &[("nexthop", "10.0.0.2")]);
    h.run();
    assert_eq!(
        h.driver.route_state(&IpPrefix::default_v4()).unwrap().0,
        PacketAction::Forward
    );

    h.del(ROUTE_TABLE, "0.0.0.0/0");
    h.run();
    let (action, _) = h.driver.route_state(&IpPrefix::default_v4()).unwrap();
    assert_eq!(action, PacketAction::Drop);
    assert!(h.driver.has_route(&IpPrefix::default_v6()));
}

#[test]
fn next_hop_groups_are_shared_and_refcounted() {
    let mut h = harness();
    h.seed_l3();
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:01");
    h.add_neighbor("Ethernet4", "10.0.0.3", "aa:bb:cc:dd:ee:02");

    h.set(ROUTE_TABLE, "20.1.0.0/24", &[("nexthop", "10.0.0.2,10.0.0.3")]);
    h.set(ROUTE_TABLE, "20.2.0.0/24", &[("nexthop", "10.0.0.3,10.0.0.2")]);
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 1);

    h.del(ROUTE_TABLE, "20.1.0.0/24");
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 1);

    h.del(ROUTE_TABLE, "20.2.0.0/24");
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 0);
}

#[test]
fn max_ecmp_overflow_backs_off_to_temporary_route() {
    let mut h = harness_with(
        SimConfig {
            max_ecmp_groups: 2,
            ..SimConfig::default()
        },
        DaemonConfig::default(),
    );
    h.seed_l3();
    for (i, mac) in ["01", "02", "03", "04"].iter().enumerate() {
        h.add_neighbor(
            "Ethernet4",
            &format!("10.0.0.{}", i + 2),
            &format!("aa:bb:cc:dd:ee:{}", mac),
        );
    }

    h.set(ROUTE_TABLE, "20.1.0.0/24", &[("nexthop", "10.0.0.2,10.0.0.3")]);
    h.set(ROUTE_TABLE, "20.2.0.0/24", &[("nexthop", "10.0.0.3,10.0.0.4")]);
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 2);

    // The third distinct set exceeds capacity: a single-member
    // temporary route goes in and the entry stays pending.
    h.set(ROUTE_TABLE, "20.3.0.0/24", &[("nexthop", "10.0.0.4,10.0.0.5")]);
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 2);
    assert_eq!(h.daemon.route().pending(), 1);
    let temp = h
        .daemon
        .route()
        .route_nexthops(&"20.3.0.0/24".parse().unwrap())
        .expect("temporary route installed");
    assert_eq!(temp.len(), 1);

    // Freeing a group slot drains the retry.
    h.del(ROUTE_TABLE, "20.1.0.0/24");
    h.run();
    assert_eq!(h.daemon.route().pending(), 0);
    let full = h
        .daemon
        .route()
        .route_nexthops(&"20.3.0.0/24".parse().unwrap())
        .expect("route upgraded from temporary");
    assert_eq!(full.len(), 2);
}

#[test]
fn mirror_session_end_to_end() {
    let mut h = harness();
    h.seed_l3();

    h.set(
        MIRROR_SESSION_TABLE,
        "everflow0",
        &[
            ("src_ip", "10.1.1.1"),
            ("dst_ip", "20.1.1.1"),
            ("gre_type", "0x88be"),
            ("dscp", "8"),
            ("ttl", "255"),
            ("queue", "0"),
        ],
    );
    h.run();
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("inactive"));

    // A covering route alone does not activate: the next hop has no
    // neighbor yet, so the route itself stays pending.
    h.set(
        ROUTE_TABLE,
        "20.1.1.0/24",
        &[("nexthop", "10.0.0.2"), ("ifname", "Ethernet4")],
    );
    h.run();
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("inactive"));

    // The neighbor resolves the whole chain.
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:ff");
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("active"));
    assert_eq!(h.driver.mirror_session_count(), 1);

    let spec = &h.driver.mirror_sessions()[0];
    assert_eq!(spec.dst_mac.to_string(), "aa:bb:cc:dd:ee:ff");
    assert_eq!(spec.gre_protocol, 0x88be);
    assert_eq!(spec.tos, 8 << 2);
    assert_eq!(spec.ttl, 255);
    assert_eq!(
        spec.monitor_port,
        h.daemon.ports().get("Ethernet4").unwrap().port_oid.as_raw()
    );

    // The installed route holds the next hop, so teardown withdraws
    // the route first; losing the route deactivates the session.
    h.del(ROUTE_TABLE, "20.1.1.0/24");
    h.run();
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("inactive"));
    assert_eq!(h.driver.mirror_session_count(), 0);

    h.del(NEIGH_TABLE, "Ethernet4:10.0.0.2");
    h.run();
    assert_eq!(h.driver.next_hop_count(), 0);
}

#[test]
fn acl_rules_share_range_objects() {
    let mut h = harness();
    h.seed_l3();

    h.set(
        ACL_TABLE,
        "DATAACL",
        &[
            ("TYPE", "L3"),
            ("PORTS", "Ethernet0,Ethernet4"),
            ("POLICY_DESC", "data plane"),
        ],
    );
    h.run();
    assert_eq!(h.daemon.acl().table_count(), 1);

    for rule in ["rule1", "rule2"] {
        h.set(
            ACL_RULE_TABLE,
            &format!("DATAACL:{}", rule),
            &[
                ("PRIORITY", "100"),
                ("L4_SRC_PORT_RANGE", "1000-2000"),
                ("PACKET_ACTION", "FORWARD"),
            ],
        );
    }
    h.run();

    assert_eq!(h.driver.acl_range_count(), 1);
    assert_eq!(
        h.daemon
            .acl()
            .range_ref_count(AclRangeKind::L4SrcPort, 1000, 2000),
        Some(2)
    );

    h.del(ACL_RULE_TABLE, "DATAACL:rule1");
    h.run();
    assert_eq!(h.driver.acl_range_count(), 1);
    assert_eq!(
        h.daemon
            .acl()
            .range_ref_count(AclRangeKind::L4SrcPort, 1000, 2000),
        Some(1)
    );

    h.del(ACL_RULE_TABLE, "DATAACL:rule2");
    h.run();
    assert_eq!(h.driver.acl_range_count(), 0);
}

#[test]
fn redirect_rule_waits_for_neighbors_and_owns_its_group() {
    let mut h = harness();
    h.seed_l3();

    h.set(
        ACL_TABLE,
        "DATAACL",
        &[("TYPE", "L3"), ("PORTS", "Ethernet0"), ("POLICY_DESC", "x")],
    );
    h.run();

    h.set(
        ACL_RULE_TABLE,
        "DATAACL:redir",
        &[
            ("PRIORITY", "50"),
            ("SRC_IP", "192.168.0.0/16"),
            ("PACKET_ACTION", "REDIRECT:10.1.1.1,10.1.2.2"),
        ],
    );
    h.run();
    // Neither target has a neighbor yet; the rule stays pending.
    assert_eq!(h.daemon.acl().pending(ACL_RULE_TABLE), 1);
    assert_eq!(h.driver.next_hop_group_count(), 0);

    h.add_neighbor("Ethernet0", "10.1.1.1", "aa:bb:cc:00:00:01");
    assert_eq!(h.daemon.acl().pending(ACL_RULE_TABLE), 1);

    h.add_neighbor("Ethernet0", "10.1.2.2", "aa:bb:cc:00:00:02");
    assert_eq!(h.daemon.acl().pending(ACL_RULE_TABLE), 0);
    assert_eq!(h.driver.next_hop_group_count(), 1);
    let key: switchyd::route::NextHopGroupKey = "10.1.1.1,10.1.2.2".parse().unwrap();
    assert_eq!(h.daemon.route().nhg_ref_count(&key), Some(1));

    // Removing the rule destroys the group it created.
    h.del(ACL_RULE_TABLE, "DATAACL:redir");
    h.run();
    assert_eq!(h.driver.next_hop_group_count(), 0);
}

#[test]
fn resync_reconciles_the_feed() {
    let mut h = harness();
    h.seed_l3();
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:01");

    for i in 0..10 {
        h.set(
            ROUTE_TABLE,
            &format!("20.{}.0.0/24", i),
            &[("nexthop", "10.0.0.2")],
        );
    }
    h.run();
    assert_eq!(h.daemon.route().pending(), 0);
    let removes_before = h.driver.route_removes();
    let creates_before = h.driver.route_creates();

    h.set(ROUTE_TABLE, ROUTE_RESYNC, &[]);
    h.run();
    for i in 0..7 {
        h.set(
            ROUTE_TABLE,
            &format!("20.{}.0.0/24", i),
            &[("nexthop", "10.0.0.2")],
        );
    }
    h.run();
    h.del(ROUTE_TABLE, ROUTE_RESYNC);
    h.run();

    assert_eq!(h.driver.route_removes() - removes_before, 3);
    assert_eq!(h.driver.route_creates(), creates_before);
    for i in 0..7 {
        let prefix: IpPrefix = format!("20.{}.0.0/24", i).parse().unwrap();
        assert!(h.driver.has_route(&prefix));
    }
    for i in 7..10 {
        let prefix: IpPrefix = format!("20.{}.0.0/24", i).parse().unwrap();
        assert!(!h.driver.has_route(&prefix));
    }
}

#[test]
fn counter_collector_publishes_rule_counters() {
    let mut h = harness_with(
        SimConfig::default(),
        DaemonConfig {
            counter_interval: Duration::from_millis(30),
            ..DaemonConfig::default()
        },
    );
    h.seed_l3();

    h.set(
        ACL_TABLE,
        "DATAACL",
        &[("TYPE", "L3"), ("PORTS", "Ethernet0"), ("POLICY_DESC", "x")],
    );
    h.set(
        ACL_RULE_TABLE,
        "DATAACL:rule1",
        &[
            ("PRIORITY", "100"),
            ("SRC_IP", "192.168.0.0/16"),
            ("PACKET_ACTION", "DROP"),
        ],
    );
    h.run();

    let counter = h
        .daemon
        .acl()
        .get_table("DATAACL")
        .unwrap()
        .rules
        .get("rule1")
        .unwrap()
        .counter_oid
        .expect("installed rule has a counter");
    h.driver.set_acl_counter(counter, 100, 9000);

    // Within two cycles the row reflects the hardware count.
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(
        h.store
            .get_field(COUNTERS_TABLE, "DATAACL:rule1", "Packets")
            .as_deref(),
        Some("100")
    );
    assert_eq!(
        h.store
            .get_field(COUNTERS_TABLE, "DATAACL:rule1", "Bytes")
            .as_deref(),
        Some("9000")
    );
}

#[test]
fn mirror_rule_stages_until_session_activates() {
    let mut h = harness();
    h.seed_l3();

    h.set(
        MIRROR_SESSION_TABLE,
        "everflow0",
        &[
            ("src_ip", "10.1.1.1"),
            ("dst_ip", "20.1.1.1"),
            ("gre_type", "0x88be"),
            ("dscp", "8"),
            ("ttl", "64"),
        ],
    );
    h.set(
        ACL_TABLE,
        "EVERFLOW",
        &[("TYPE", "MIRROR"), ("PORTS", "Ethernet0"), ("POLICY_DESC", "x")],
    );
    h.run();
    // The ECN coloring bootstrap owns some entries already.
    let baseline = h.driver.acl_entry_count();

    h.set(
        ACL_RULE_TABLE,
        "EVERFLOW:rule1",
        &[
            ("PRIORITY", "100"),
            ("DSCP", "8"),
            ("MIRROR_ACTION", "everflow0"),
        ],
    );
    h.run();

    // The session is inactive: the rule is logical only.
    assert_eq!(h.daemon.acl().pending(ACL_RULE_TABLE), 0);
    assert_eq!(h.driver.acl_entry_count(), baseline);

    // Resolving the session installs the staged rule.
    h.set(
        ROUTE_TABLE,
        "20.1.1.0/24",
        &[("nexthop", "10.0.0.2"), ("ifname", "Ethernet4")],
    );
    h.run();
    h.add_neighbor("Ethernet4", "10.0.0.2", "aa:bb:cc:dd:ee:ff");
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("active"));
    assert_eq!(h.driver.acl_entry_count(), baseline + 1);

    // Losing the session removes the hardware entry but keeps the
    // logical rule for the next activation.
    h.del(ROUTE_TABLE, "20.1.1.0/24");
    h.run();
    assert_eq!(h.mirror_status("everflow0").as_deref(), Some("inactive"));
    assert_eq!(h.driver.acl_entry_count(), baseline);
    assert!(h
        .daemon
        .acl()
        .get_table("EVERFLOW")
        .unwrap()
        .rules
        .contains_key("rule1"));

    // A session delete while the rule references it is refused.
    h.del(MIRROR_SESSION_TABLE, "everflow0");
    h.run();
    assert!(h.daemon.mirror().session_exists("everflow0"));
}

#[test]
fn record_log_captures_popped_tuples() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("switchyd.rec");
    let mut h = harness_with(
        SimConfig::default(),
        DaemonConfig {
            record_path: Some(path.clone()),
            ..DaemonConfig::default()
        },
    );

    h.set(PORT_TABLE, "Ethernet0", &[("lanes", "0,1,2,3")]);
    h.run();

    let content = std::fs::read_to_string(&path).unwrap();
    assert!(content.contains("PORT_TABLE:Ethernet0|SET|lanes:0,1,2,3"));
}

#[test]
fn ecn_color_rules_bootstrap_after_init() {
    let mut h = harness();
    assert!(!h.daemon.qos().ecn_rules_installed());
    h.seed_l3();
    assert!(h.daemon.qos().ecn_rules_installed());
}
