//! QoS orchestration.
//!
//! Each table dispatches to a handler that parses attributes into a
//! driver spec: create on first sight, set on update, remove on DEL.
//! Object references use `[TABLE:NAME]` fields and must resolve
//! before an operation proceeds.

use crate::context::SwitchContext;
use crate::ports::PortsOrch;
use crate::tables::*;
use log::{error, info, warn};
use std::collections::HashMap;
use switchyd_orch_common::{
    parse_index_range, resolve_field_ref, Consumer, KeyOpFieldValues, Operation, RefResolve,
    TaskStatus, TypeMaps,
};
use switchyd_sad::{
    AclBindOid, AclEntryAction, AclEntryOid, AclEntrySpec, AclMatch, AclTableField, AclTableOid,
    AclTableSpec, PacketColor, PortOid, QosMapKind, QosMapOid, SadError, SchedulerKind,
    SchedulerOid, SchedulerSpec, WredOid, WredSpec,
};

pub const QOS_TABLES: [&str; 9] = [
    DSCP_TO_TC_MAP_TABLE,
    TC_TO_QUEUE_MAP_TABLE,
    TC_TO_PG_MAP_TABLE,
    PFC_PRIORITY_TO_QUEUE_MAP_TABLE,
    PFC_PRIORITY_TO_PG_MAP_TABLE,
    WRED_PROFILE_TABLE,
    SCHEDULER_TABLE,
    QUEUE_TABLE,
    PORT_QOS_MAP_TABLE,
];

/// Priorities of the two bootstrap coloring rules.
const ECN_RULE_PRIORITY_DSCP8: u32 = 1000;
const ECN_RULE_PRIORITY_DSCP0: u32 = 999;

/// QoS orchestration (C11).
pub struct QosOrch {
    ctx: SwitchContext,
    consumers: HashMap<&'static str, Consumer>,
    /// `[TABLE:NAME]` resolution maps for every object this
    /// orchestrator owns.
    type_maps: TypeMaps,
    ecn_acl_table: Option<AclTableOid>,
    ecn_acl_entries: Vec<AclEntryOid>,
    ecn_acl_binds: Vec<AclBindOid>,
}

impl QosOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        let consumers = QOS_TABLES
            .iter()
            .map(|table| (*table, Consumer::new(*table)))
            .collect();
        let mut type_maps = TypeMaps::new();
        for table in [
            DSCP_TO_TC_MAP_TABLE,
            TC_TO_QUEUE_MAP_TABLE,
            TC_TO_PG_MAP_TABLE,
            PFC_PRIORITY_TO_QUEUE_MAP_TABLE,
            PFC_PRIORITY_TO_PG_MAP_TABLE,
            WRED_PROFILE_TABLE,
            SCHEDULER_TABLE,
        ] {
            type_maps.insert(table.to_string(), HashMap::new());
        }
        Self {
            ctx,
            consumers,
            type_maps,
            ecn_acl_table: None,
            ecn_acl_entries: Vec::new(),
            ecn_acl_binds: Vec::new(),
        }
    }

    pub fn consumer_mut(&mut self, table: &str) -> &mut Consumer {
        self.consumers
            .get_mut(table)
            .unwrap_or_else(|| panic!("qos orch has no consumer for table {}", table))
    }

    pub fn pending(&self, table: &str) -> usize {
        self.consumers.get(table).map(|c| c.len()).unwrap_or(0)
    }

    pub fn object_oid(&self, table: &str, name: &str) -> Option<u64> {
        self.type_maps.get(table)?.get(name).copied()
    }

    /// Bootstraps the ECN coloring rules: an ingress table matching
    /// DSCP+ECN with two low-priority rules painting ECN=0/DSCP=0 and
    /// ECN=0/DSCP=8 traffic yellow, bound to every physical port.
    /// Runs once, when the port catalog finishes initialization; a
    /// packet engine that cannot match DSCP and ECN together skips it.
    pub fn init_ecn_color_rules(&mut self, ports: &PortsOrch) {
        if self.ecn_acl_table.is_some() {
            return;
        }
        if !self.ctx.info().dscp_ecn_match_capable {
            info!("packet engine cannot match DSCP+ECN, skipping coloring rules");
            return;
        }

        let spec = AclTableSpec {
            fields: vec![AclTableField::Ecn, AclTableField::Dscp],
            range_kinds: vec![],
        };
        let table = match self.ctx.sad().create_acl_table(&spec) {
            Ok(table) => table,
            Err(e) => {
                error!("failed to create ECN coloring table: {}", e);
                return;
            }
        };

        for (priority, dscp) in [
            (ECN_RULE_PRIORITY_DSCP8, 8u8),
            (ECN_RULE_PRIORITY_DSCP0, 0u8),
        ] {
            let entry = AclEntrySpec {
                table,
                priority,
                counter: None,
                matches: vec![AclMatch::Ecn(0), AclMatch::Dscp(dscp)],
                ranges: vec![],
                action: AclEntryAction::SetColor(PacketColor::Yellow),
            };
            match self.ctx.sad().create_acl_entry(&entry) {
                Ok(oid) => self.ecn_acl_entries.push(oid),
                Err(e) => error!("failed to create ECN coloring rule: {}", e),
            }
        }

        for alias in ports.phy_aliases() {
            match ports.bind_acl_table(&alias, table) {
                Ok(bind) => self.ecn_acl_binds.push(bind),
                Err(e) => error!("failed to bind ECN coloring table to {}: {}", alias, e),
            }
        }

        self.ecn_acl_table = Some(table);
        info!("installed ECN coloring rules");
    }

    pub fn ecn_rules_installed(&self) -> bool {
        self.ecn_acl_table.is_some()
    }

    pub fn do_task(&mut self, table: &str, ports: &PortsOrch) {
        let drained = self.consumer_mut(table).drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = match table {
                DSCP_TO_TC_MAP_TABLE => self.handle_map(table, QosMapKind::DscpToTc, &entry),
                TC_TO_QUEUE_MAP_TABLE => self.handle_map(table, QosMapKind::TcToQueue, &entry),
                TC_TO_PG_MAP_TABLE => {
                    self.handle_map(table, QosMapKind::TcToPriorityGroup, &entry)
                }
                PFC_PRIORITY_TO_QUEUE_MAP_TABLE => {
                    self.handle_map(table, QosMapKind::PfcPriorityToQueue, &entry)
                }
                PFC_PRIORITY_TO_PG_MAP_TABLE => {
                    self.handle_map(table, QosMapKind::PfcPriorityToPriorityGroup, &entry)
                }
                WRED_PROFILE_TABLE => self.handle_wred(&entry),
                SCHEDULER_TABLE => self.handle_scheduler(&entry),
                QUEUE_TABLE => self.handle_queue(&entry, ports),
                PORT_QOS_MAP_TABLE => self.handle_port_qos_map(&entry, ports),
                _ => {
                    error!("qos orch received unknown table {}", table);
                    TaskStatus::Invalid
                }
            };
            match status {
                TaskStatus::Consumed => {}
                TaskStatus::Retry => retained.push(entry),
                TaskStatus::Invalid => {
                    warn!("dropping invalid {} entry {}", table, entry.key);
                }
            }
        }

        self.consumer_mut(table).requeue(retained);
    }

    fn parse_map_entries(entry: &KeyOpFieldValues) -> Result<Vec<(u8, u8)>, String> {
        let mut pairs = Vec::with_capacity(entry.field_values.len());
        for (field, value) in &entry.field_values {
            let from: u8 = field
                .parse()
                .map_err(|_| format!("invalid map key {:?}", field))?;
            let to: u8 = value
                .parse()
                .map_err(|_| format!("invalid map value {:?}", value))?;
            pairs.push((from, to));
        }
        Ok(pairs)
    }

    fn handle_map(
        &mut self,
        table: &str,
        kind: QosMapKind,
        entry: &KeyOpFieldValues,
    ) -> TaskStatus {
        let name = entry.key.clone();
        match entry.op {
            Operation::Set => {
                let pairs = match Self::parse_map_entries(entry) {
                    Ok(pairs) => pairs,
                    Err(message) => {
                        error!("invalid {} entry {}: {}", table, name, message);
                        return TaskStatus::Invalid;
                    }
                };
                let existing = self.object_oid(table, &name);
                match existing {
                    Some(oid) => {
                        if let Err(e) = self
                            .ctx
                            .sad()
                            .set_qos_map(QosMapOid::from_raw(oid), &pairs)
                        {
                            error!("failed to update {} {}: {}", table, name, e);
                            return TaskStatus::Retry;
                        }
                    }
                    None => match self.ctx.sad().create_qos_map(kind, &pairs) {
                        Ok(oid) => {
                            self.type_maps
                                .get_mut(table)
                                .expect("qos type map exists")
                                .insert(name.clone(), oid.as_raw());
                            info!("created {} {}", table, name);
                        }
                        Err(e) => {
                            error!("failed to create {} {}: {}", table, name, e);
                            return TaskStatus::Retry;
                        }
                    },
                }
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(oid) = self.object_oid(table, &name) else {
                    return TaskStatus::Consumed;
                };
                match self.ctx.sad().remove_qos_map(QosMapOid::from_raw(oid)) {
                    Ok(()) => {
                        self.type_maps
                            .get_mut(table)
                            .expect("qos type map exists")
                            .remove(&name);
                        TaskStatus::Consumed
                    }
                    Err(SadError::ObjectInUse { .. }) => TaskStatus::Retry,
                    Err(e) => {
                        error!("failed to remove {} {}: {}", table, name, e);
                        TaskStatus::Retry
                    }
                }
            }
        }
    }

    fn parse_wred_spec(entry: &KeyOpFieldValues) -> Result<WredSpec, String> {
        let mut spec = WredSpec::default();
        for (field, value) in &entry.field_values {
            let parse_u32 = || -> Result<u32, String> {
                value
                    .parse()
                    .map_err(|_| format!("invalid threshold {:?}", value))
            };
            match field.as_str() {
                "wred_green_enable" => spec.green_enable = value == "true",
                "wred_yellow_enable" => spec.yellow_enable = value == "true",
                "wred_red_enable" => spec.red_enable = value == "true",
                "green_min_threshold" => spec.green_min_threshold = parse_u32()?,
                "green_max_threshold" => spec.green_max_threshold = parse_u32()?,
                "yellow_min_threshold" => spec.yellow_min_threshold = parse_u32()?,
                "yellow_max_threshold" => spec.yellow_max_threshold = parse_u32()?,
                "red_min_threshold" => spec.red_min_threshold = parse_u32()?,
                "red_max_threshold" => spec.red_max_threshold = parse_u32()?,
                "ecn" => spec.ecn_mark = value != "ecn_none",
                other => return Err(format!("unknown WRED attribute {:?}", other)),
            }
        }
        Ok(spec)
    }

    fn handle_wred(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let name = entry.key.clone();
        match entry.op {
            Operation::Set => {
                let spec = match Self::parse_wred_spec(entry) {
                    Ok(spec) => spec,
                    Err(message) => {
                        error!("invalid WRED profile {}: {}", name, message);
                        return TaskStatus::Invalid;
                    }
                };
                match self.object_oid(WRED_PROFILE_TABLE, &name) {
                    Some(oid) => {
                        if let Err(e) = self.ctx.sad().set_wred(WredOid::from_raw(oid), &spec) {
                            error!("failed to update WRED profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    }
                    None => match self.ctx.sad().create_wred(&spec) {
                        Ok(oid) => {
                            self.type_maps
                                .get_mut(WRED_PROFILE_TABLE)
                                .expect("qos type map exists")
                                .insert(name.clone(), oid.as_raw());
                            info!("created WRED profile {}", name);
                        }
                        Err(e) => {
                            error!("failed to create WRED profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    },
                }
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(oid) = self.object_oid(WRED_PROFILE_TABLE, &name) else {
                    return TaskStatus::Consumed;
                };
                match self.ctx.sad().remove_wred(WredOid::from_raw(oid)) {
                    Ok(()) => {
                        self.type_maps
                            .get_mut(WRED_PROFILE_TABLE)
                            .expect("qos type map exists")
                            .remove(&name);
                        TaskStatus::Consumed
                    }
                    Err(SadError::ObjectInUse { .. }) => TaskStatus::Retry,
                    Err(e) => {
                        error!("failed to remove WRED profile {}: {}", name, e);
                        TaskStatus::Retry
                    }
                }
            }
        }
    }

    fn parse_scheduler_spec(entry: &KeyOpFieldValues) -> Result<SchedulerSpec, String> {
        let mut spec = SchedulerSpec {
            kind: SchedulerKind::Dwrr,
            weight: 1,
            priority: 0,
        };
        for (field, value) in &entry.field_values {
            match field.as_str() {
                "type" => {
                    spec.kind = match value.to_uppercase().as_str() {
                        "DWRR" => SchedulerKind::Dwrr,
                        "STRICT" => SchedulerKind::Strict,
                        other => return Err(format!("unknown scheduler type {:?}", other)),
                    };
                }
                "weight" => {
                    spec.weight = value
                        .parse()
                        .map_err(|_| format!("invalid weight {:?}", value))?;
                }
                "priority" => {
                    spec.priority = value
                        .parse()
                        .map_err(|_| format!("invalid priority {:?}", value))?;
                }
                other => return Err(format!("unknown scheduler attribute {:?}", other)),
            }
        }
        Ok(spec)
    }

    fn handle_scheduler(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let name = entry.key.clone();
        match entry.op {
            Operation::Set => {
                let spec = match Self::parse_scheduler_spec(entry) {
                    Ok(spec) => spec,
                    Err(message) => {
                        error!("invalid scheduler profile {}: {}", name, message);
                        return TaskStatus::Invalid;
                    }
                };
                match self.object_oid(SCHEDULER_TABLE, &name) {
                    Some(oid) => {
                        if let Err(e) = self
                            .ctx
                            .sad()
                            .set_scheduler(SchedulerOid::from_raw(oid), &spec)
                        {
                            error!("failed to update scheduler profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    }
                    None => match self.ctx.sad().create_scheduler(&spec) {
                        Ok(oid) => {
                            self.type_maps
                                .get_mut(SCHEDULER_TABLE)
                                .expect("qos type map exists")
                                .insert(name.clone(), oid.as_raw());
                            info!("created scheduler profile {}", name);
                        }
                        Err(e) => {
                            error!("failed to create scheduler profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    },
                }
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(oid) = self.object_oid(SCHEDULER_TABLE, &name) else {
                    return TaskStatus::Consumed;
                };
                match self
                    .ctx
                    .sad()
                    .remove_scheduler(SchedulerOid::from_raw(oid))
                {
                    Ok(()) => {
                        self.type_maps
                            .get_mut(SCHEDULER_TABLE)
                            .expect("qos type map exists")
                            .remove(&name);
                        TaskStatus::Consumed
                    }
                    Err(SadError::ObjectInUse { .. }) => TaskStatus::Retry,
                    Err(e) => {
                        error!("failed to remove scheduler profile {}: {}", name, e);
                        TaskStatus::Retry
                    }
                }
            }
        }
    }

    /// Finds the scheduler group whose child list carries the queue
    /// and points its profile attribute. The tree is walked per
    /// assignment; nothing is cached.
    fn apply_scheduler_to_queue(
        &self,
        port_oid: PortOid,
        queue_index: usize,
        profile: Option<SchedulerOid>,
    ) -> Result<(), String> {
        let queues = self
            .ctx
            .sad()
            .port_queues(port_oid)
            .map_err(|e| e.to_string())?;
        let queue = queues
            .get(queue_index)
            .ok_or_else(|| format!("queue index {} out of range", queue_index))?;

        let groups = self
            .ctx
            .sad()
            .port_scheduler_groups(port_oid)
            .map_err(|e| e.to_string())?;
        for group in groups {
            let children = self
                .ctx
                .sad()
                .scheduler_group_children(group)
                .map_err(|e| e.to_string())?;
            if !children.contains(&queue.as_raw()) {
                continue;
            }
            return self
                .ctx
                .sad()
                .set_scheduler_group_profile(group, profile)
                .map_err(|e| e.to_string());
        }
        Err(format!("no scheduler group carries queue {}", queue_index))
    }

    fn handle_queue(&mut self, entry: &KeyOpFieldValues, ports: &PortsOrch) -> TaskStatus {
        let Some((port_list, range_str)) = entry.key.split_once(':') else {
            warn!("invalid queue key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let (low, high) = match parse_index_range(range_str) {
            Ok(range) => range,
            Err(e) => {
                warn!("invalid queue range {:?}: {}", range_str, e);
                return TaskStatus::Invalid;
            }
        };

        let scheduler = resolve_field_ref(&self.type_maps, "scheduler", entry);
        if scheduler == RefResolve::NotResolved {
            return TaskStatus::Retry;
        }
        if scheduler == RefResolve::Multiple {
            return TaskStatus::Invalid;
        }
        let wred = resolve_field_ref(&self.type_maps, "wred_profile", entry);
        if wred == RefResolve::NotResolved {
            return TaskStatus::Retry;
        }
        if wred == RefResolve::Multiple {
            return TaskStatus::Invalid;
        }

        for alias in port_list.split(',') {
            let alias = alias.trim();
            let Some(port) = ports.get(alias) else {
                return TaskStatus::Retry;
            };
            let port_oid = port.port_oid;

            for index in low..=high {
                if let RefResolve::Success(oid) = scheduler {
                    let profile = match entry.op {
                        Operation::Set => Some(SchedulerOid::from_raw(oid)),
                        Operation::Del => None,
                    };
                    if let Err(message) =
                        self.apply_scheduler_to_queue(port_oid, index as usize, profile)
                    {
                        error!(
                            "failed to apply scheduler to {} queue {}: {}",
                            alias, index, message
                        );
                        return TaskStatus::Retry;
                    }
                }

                if let RefResolve::Success(oid) = wred {
                    let queues = match self.ctx.sad().port_queues(port_oid) {
                        Ok(queues) => queues,
                        Err(e) => {
                            error!("failed to read queues of {}: {}", alias, e);
                            return TaskStatus::Retry;
                        }
                    };
                    let Some(queue) = queues.get(index as usize) else {
                        warn!("queue index {} out of range on {}", index, alias);
                        return TaskStatus::Invalid;
                    };
                    let profile = match entry.op {
                        Operation::Set => Some(WredOid::from_raw(oid)),
                        Operation::Del => None,
                    };
                    if let Err(e) = self.ctx.sad().set_queue_wred_profile(*queue, profile) {
                        error!(
                            "failed to apply WRED profile to {} queue {}: {}",
                            alias, index, e
                        );
                        return TaskStatus::Retry;
                    }
                }
            }
        }
        TaskStatus::Consumed
    }

    fn handle_port_qos_map(&mut self, entry: &KeyOpFieldValues, ports: &PortsOrch) -> TaskStatus {
        const MAP_FIELDS: [(&str, QosMapKind); 5] = [
            ("dscp_to_tc_map", QosMapKind::DscpToTc),
            ("tc_to_queue_map", QosMapKind::TcToQueue),
            ("tc_to_pg_map", QosMapKind::TcToPriorityGroup),
            ("pfc_to_queue_map", QosMapKind::PfcPriorityToQueue),
            ("pfc_to_pg_map", QosMapKind::PfcPriorityToPriorityGroup),
        ];

        let mut resolved: Vec<(QosMapKind, u64)> = Vec::new();
        for (field, kind) in MAP_FIELDS {
            match resolve_field_ref(&self.type_maps, field, entry) {
                RefResolve::Success(oid) => resolved.push((kind, oid)),
                RefResolve::FieldNotFound => {}
                RefResolve::NotResolved => return TaskStatus::Retry,
                RefResolve::Multiple => return TaskStatus::Invalid,
            }
        }

        let pfc_bitmask = match entry.field("pfc_enable") {
            None => None,
            Some(list) => {
                let mut mask = 0u8;
                for token in list.split(',') {
                    match token.trim().parse::<u8>() {
                        Ok(priority) if priority < 8 => mask |= 1 << priority,
                        _ => {
                            warn!("invalid pfc_enable value {:?}", list);
                            return TaskStatus::Invalid;
                        }
                    }
                }
                Some(mask)
            }
        };

        for alias in entry.key.split(',') {
            let alias = alias.trim();
            let Some(port) = ports.get(alias) else {
                return TaskStatus::Retry;
            };
            let port_oid = port.port_oid;

            for (kind, oid) in &resolved {
                let map = match entry.op {
                    Operation::Set => Some(QosMapOid::from_raw(*oid)),
                    Operation::Del => None,
                };
                if let Err(e) = self.ctx.sad().set_port_qos_map(port_oid, *kind, map) {
                    error!("failed to apply QoS map to {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
            }
            if let Some(mask) = pfc_bitmask {
                let mask = if entry.op == Operation::Del { 0 } else { mask };
                if let Err(e) = self.ctx.sad().set_port_pfc(port_oid, mask) {
                    error!("failed to apply PFC bitmask to {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
            }
        }
        TaskStatus::Consumed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::EventQueue;
    use std::sync::Arc;
    use switchyd_sad::{SimConfig, SimDriver};

    fn fv(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    fn setup() -> (QosOrch, PortsOrch) {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver).unwrap();
        let mut ports = PortsOrch::new(ctx.clone());
        let qos = QosOrch::new(ctx);
        let mut events = EventQueue::new();

        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                fv(&[("lanes", "0,1,2,3")]),
            )]);
        ports.do_task(PORT_TABLE, &mut events);

        (qos, ports)
    }

    #[test]
    fn test_map_create_and_remove() {
        let (mut qos, ports) = setup();
        qos.consumer_mut(DSCP_TO_TC_MAP_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "AZURE",
                fv(&[("0", "0"), ("8", "1")]),
            )]);
        qos.do_task(DSCP_TO_TC_MAP_TABLE, &ports);
        assert!(qos.object_oid(DSCP_TO_TC_MAP_TABLE, "AZURE").is_some());

        qos.consumer_mut(DSCP_TO_TC_MAP_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::del("AZURE")]);
        qos.do_task(DSCP_TO_TC_MAP_TABLE, &ports);
        assert!(qos.object_oid(DSCP_TO_TC_MAP_TABLE, "AZURE").is_none());
    }

    #[test]
    fn test_queue_entry_waits_for_profile() {
        let (mut qos, ports) = setup();
        qos.consumer_mut(QUEUE_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0:3",
                fv(&[("scheduler", "[SCHEDULER_TABLE:sched0]")]),
            )]);
        qos.do_task(QUEUE_TABLE, &ports);
        assert_eq!(qos.pending(QUEUE_TABLE), 1);

        qos.consumer_mut(SCHEDULER_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "sched0",
                fv(&[("type", "DWRR"), ("weight", "20")]),
            )]);
        qos.do_task(SCHEDULER_TABLE, &ports);
        qos.do_task(QUEUE_TABLE, &ports);
        assert_eq!(qos.pending(QUEUE_TABLE), 0);
    }

    #[test]
    fn test_port_qos_map_application() {
        let (mut qos, ports) = setup();
        qos.consumer_mut(DSCP_TO_TC_MAP_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set("AZURE", fv(&[("0", "0")]))]);
        qos.do_task(DSCP_TO_TC_MAP_TABLE, &ports);

        qos.consumer_mut(PORT_QOS_MAP_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                fv(&[
                    ("dscp_to_tc_map", "[DSCP_TO_TC_MAP_TABLE:AZURE]"),
                    ("pfc_enable", "3,4"),
                ]),
            )]);
        qos.do_task(PORT_QOS_MAP_TABLE, &ports);
        assert_eq!(qos.pending(PORT_QOS_MAP_TABLE), 0);
    }

    #[test]
    fn test_ecn_bootstrap_runs_once() {
        let (mut qos, ports) = setup();
        qos.init_ecn_color_rules(&ports);
        assert!(qos.ecn_rules_installed());
        assert_eq!(qos.ecn_acl_entries.len(), 2);
        let binds = qos.ecn_acl_binds.len();

        qos.init_ecn_color_rules(&ports);
        assert_eq!(qos.ecn_acl_binds.len(), binds);
    }

    #[test]
    fn test_ecn_bootstrap_respects_capability() {
        let driver = Arc::new(SimDriver::new(SimConfig {
            dscp_ecn_match_capable: false,
            ..SimConfig::default()
        }));
        let ctx = SwitchContext::new(driver).unwrap();
        let ports = PortsOrch::new(ctx.clone());
        let mut qos = QosOrch::new(ctx);

        qos.init_ecn_color_rules(&ports);
        assert!(!qos.ecn_rules_installed());
    }
}
