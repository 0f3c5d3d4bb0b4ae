//! FDB orchestration.

use crate::context::SwitchContext;
use crate::observer::{EventQueue, FdbUpdate, Update};
use crate::ports::PortsOrch;
use crate::tables::FDB_TABLE;
use log::{info, warn};
use std::collections::BTreeMap;
use switchyd_orch_common::{Consumer, KeyOpFieldValues, Operation, TaskStatus};
use switchyd_sad::FdbId;
use switchyd_types::MacAddress;

/// FDB orchestration (C9). Owns the (MAC, VLAN) to port mapping used
/// to resolve VLAN-backed mirror destinations.
pub struct FdbOrch {
    ctx: SwitchContext,
    consumer: Consumer,
    entries: BTreeMap<(MacAddress, u16), String>,
}

impl FdbOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        Self {
            ctx,
            consumer: Consumer::new(FDB_TABLE),
            entries: BTreeMap::new(),
        }
    }

    pub fn consumer_mut(&mut self) -> &mut Consumer {
        &mut self.consumer
    }

    pub fn pending(&self) -> usize {
        self.consumer.len()
    }

    /// The port a (MAC, VLAN) pair was learned or configured on.
    pub fn lookup(&self, mac: &MacAddress, vlan_id: u16) -> Option<&str> {
        self.entries.get(&(*mac, vlan_id)).map(String::as_str)
    }

    pub fn do_task(&mut self, ports: &PortsOrch, events: &mut EventQueue) {
        let drained = self.consumer.drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = self.process(&entry, ports, events);
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", FDB_TABLE, entry.key);
                }
            }
        }

        self.consumer.requeue(retained);
    }

    fn process(
        &mut self,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        events: &mut EventQueue,
    ) -> TaskStatus {
        let Some((vlan_key, mac_str)) = entry.key.split_once(':') else {
            warn!("invalid FDB key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let Some(digits) = vlan_key.strip_prefix("Vlan") else {
            warn!("invalid FDB VLAN {:?}", vlan_key);
            return TaskStatus::Invalid;
        };
        let Ok(vlan_id) = digits.parse::<u16>() else {
            warn!("invalid FDB VLAN id {:?}", digits);
            return TaskStatus::Invalid;
        };
        let mac: MacAddress = match mac_str.parse() {
            Ok(mac) => mac,
            Err(e) => {
                warn!("invalid FDB MAC {:?}: {}", mac_str, e);
                return TaskStatus::Invalid;
            }
        };
        let id = FdbId { mac, vlan_id };

        match entry.op {
            Operation::Set => {
                let Some(port_alias) = entry.field("port") else {
                    warn!("FDB entry {} has no port", entry.key);
                    return TaskStatus::Invalid;
                };
                let is_static = entry.field("type") == Some("static");

                if ports.get(vlan_key).is_none() {
                    return TaskStatus::Retry;
                }
                let Some(port) = ports.get(port_alias) else {
                    return TaskStatus::Retry;
                };
                let Some(bridge_port) = port.bridge_port else {
                    // The port joins the bridge with its first VLAN
                    // membership; wait for it.
                    return TaskStatus::Retry;
                };

                if self.entries.get(&(mac, vlan_id)).map(String::as_str) == Some(port_alias) {
                    return TaskStatus::Consumed;
                }

                if let Err(e) = self.ctx.sad().create_fdb_entry(&id, bridge_port, is_static) {
                    warn!("failed to create FDB entry {}: {}", entry.key, e);
                    return TaskStatus::Retry;
                }
                self.entries
                    .insert((mac, vlan_id), port_alias.to_string());
                info!("learned {} on {} vlan {}", mac, port_alias, vlan_id);
                events.push(Update::Fdb(FdbUpdate {
                    mac,
                    vlan_id,
                    port: port_alias.to_string(),
                    add: true,
                }));
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(port_alias) = self.entries.remove(&(mac, vlan_id)) else {
                    return TaskStatus::Consumed;
                };
                if let Err(e) = self.ctx.sad().remove_fdb_entry(&id) {
                    warn!("failed to remove FDB entry {}: {}", entry.key, e);
                }
                info!("flushed {} from vlan {}", mac, vlan_id);
                events.push(Update::Fdb(FdbUpdate {
                    mac,
                    vlan_id,
                    port: port_alias,
                    add: false,
                }));
                TaskStatus::Consumed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::{PORT_TABLE, VLAN_MEMBER_TABLE, VLAN_TABLE};
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    fn setup() -> (PortsOrch, FdbOrch, EventQueue) {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver).unwrap();
        let mut ports = PortsOrch::new(ctx.clone());
        let fdb = FdbOrch::new(ctx);
        let mut events = EventQueue::new();

        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                vec![("lanes".to_string(), "0,1,2,3".to_string())],
            )]);
        ports.do_task(PORT_TABLE, &mut events);
        ports
            .consumer_mut(VLAN_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set("Vlan100", vec![])]);
        ports.do_task(VLAN_TABLE, &mut events);
        ports
            .consumer_mut(VLAN_MEMBER_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Vlan100:Ethernet0",
                vec![("tagging_mode".to_string(), "untagged".to_string())],
            )]);
        ports.do_task(VLAN_MEMBER_TABLE, &mut events);

        (ports, fdb, EventQueue::new())
    }

    #[test]
    fn test_fdb_entry_lifecycle() {
        let (ports, mut fdb, mut events) = setup();
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();

        fdb.consumer_mut().add_to_sync(vec![KeyOpFieldValues::set(
            "Vlan100:aa:bb:cc:dd:ee:ff",
            vec![
                ("port".to_string(), "Ethernet0".to_string()),
                ("type".to_string(), "dynamic".to_string()),
            ],
        )]);
        fdb.do_task(&ports, &mut events);

        assert_eq!(fdb.lookup(&mac, 100), Some("Ethernet0"));
        match events.pop() {
            Some(Update::Fdb(u)) => {
                assert!(u.add);
                assert_eq!(u.port, "Ethernet0");
            }
            other => panic!("expected an FDB update, got {:?}", other),
        }

        fdb.consumer_mut()
            .add_to_sync(vec![KeyOpFieldValues::del("Vlan100:aa:bb:cc:dd:ee:ff")]);
        fdb.do_task(&ports, &mut events);
        assert!(fdb.lookup(&mac, 100).is_none());
    }

    #[test]
    fn test_fdb_waits_for_bridge_port() {
        let (ports, mut fdb, mut events) = setup();

        // Ethernet4 exists in hardware but was never bridged.
        fdb.consumer_mut().add_to_sync(vec![KeyOpFieldValues::set(
            "Vlan100:00:00:00:00:00:01",
            vec![("port".to_string(), "Ethernet4".to_string())],
        )]);
        fdb.do_task(&ports, &mut events);
        assert_eq!(fdb.pending(), 1);
    }
}
