//! Buffer orchestration.

use crate::context::SwitchContext;
use crate::ports::PortsOrch;
use crate::tables::*;
use log::{error, info, warn};
use std::collections::HashMap;
use switchyd_orch_common::{
    parse_index_range, resolve_field_ref, resolve_field_ref_array, Consumer, KeyOpFieldValues,
    Operation, RefArrayResolve, RefResolve, TaskStatus, TypeMaps,
};
use switchyd_sad::{
    BufferDirection, BufferPoolOid, BufferPoolSpec, BufferProfileOid, BufferProfileSpec,
    SadError,
};

pub const BUFFER_TABLES: [&str; 6] = [
    BUFFER_POOL_TABLE,
    BUFFER_PROFILE_TABLE,
    BUFFER_QUEUE_TABLE,
    BUFFER_PG_TABLE,
    BUFFER_PORT_INGRESS_PROFILE_LIST,
    BUFFER_PORT_EGRESS_PROFILE_LIST,
];

/// Buffer orchestration (C12): pool and profile objects plus their
/// application to queues, priority groups and per-port profile lists.
pub struct BufferOrch {
    ctx: SwitchContext,
    consumers: HashMap<&'static str, Consumer>,
    type_maps: TypeMaps,
}

impl BufferOrch {
    pub fn new(ctx: SwitchContext) -> Self {
        let consumers = BUFFER_TABLES
            .iter()
            .map(|table| (*table, Consumer::new(*table)))
            .collect();
        let mut type_maps = TypeMaps::new();
        type_maps.insert(BUFFER_POOL_TABLE.to_string(), HashMap::new());
        type_maps.insert(BUFFER_PROFILE_TABLE.to_string(), HashMap::new());
        Self {
            ctx,
            consumers,
            type_maps,
        }
    }

    pub fn consumer_mut(&mut self, table: &str) -> &mut Consumer {
        self.consumers
            .get_mut(table)
            .unwrap_or_else(|| panic!("buffer orch has no consumer for table {}", table))
    }

    pub fn pending(&self, table: &str) -> usize {
        self.consumers.get(table).map(|c| c.len()).unwrap_or(0)
    }

    pub fn object_oid(&self, table: &str, name: &str) -> Option<u64> {
        self.type_maps.get(table)?.get(name).copied()
    }

    pub fn do_task(&mut self, table: &str, ports: &PortsOrch) {
        let drained = self.consumer_mut(table).drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = match table {
                BUFFER_POOL_TABLE => self.handle_pool(&entry),
                BUFFER_PROFILE_TABLE => self.handle_profile(&entry),
                BUFFER_QUEUE_TABLE => self.handle_queue_binding(&entry, ports),
                BUFFER_PG_TABLE => self.handle_pg_binding(&entry, ports),
                BUFFER_PORT_INGRESS_PROFILE_LIST => {
                    self.handle_profile_list(&entry, ports, BufferDirection::Ingress)
                }
                BUFFER_PORT_EGRESS_PROFILE_LIST => {
                    self.handle_profile_list(&entry, ports, BufferDirection::Egress)
                }
                _ => {
                    error!("buffer orch received unknown table {}", table);
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

    fn parse_pool_spec(entry: &KeyOpFieldValues) -> Result<BufferPoolSpec, String> {
        let mut ingress = true;
        let mut dynamic = true;
        let mut size = 0u64;
        for (field, value) in &entry.field_values {
            match field.as_str() {
                "type" => {
                    ingress = match value.as_str() {
                        "ingress" => true,
                        "egress" => false,
                        other => return Err(format!("unknown pool type {:?}", other)),
                    };
                }
                "mode" => {
                    dynamic = match value.as_str() {
                        "dynamic" => true,
                        "static" => false,
                        other => return Err(format!("unknown pool mode {:?}", other)),
                    };
                }
                "size" => {
                    size = value
                        .parse()
                        .map_err(|_| format!("invalid pool size {:?}", value))?;
                }
                other => return Err(format!("unknown pool attribute {:?}", other)),
            }
        }
        Ok(BufferPoolSpec {
            ingress,
            dynamic,
            size,
        })
    }

    fn handle_pool(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let name = entry.key.clone();
        match entry.op {
            Operation::Set => {
                let spec = match Self::parse_pool_spec(entry) {
                    Ok(spec) => spec,
                    Err(message) => {
                        error!("invalid buffer pool {}: {}", name, message);
                        return TaskStatus::Invalid;
                    }
                };
                match self.object_oid(BUFFER_POOL_TABLE, &name) {
                    Some(oid) => {
                        if let Err(e) = self
                            .ctx
                            .sad()
                            .set_buffer_pool_size(BufferPoolOid::from_raw(oid), spec.size)
                        {
                            error!("failed to update buffer pool {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    }
                    None => match self.ctx.sad().create_buffer_pool(&spec) {
                        Ok(oid) => {
                            self.type_maps
                                .get_mut(BUFFER_POOL_TABLE)
                                .expect("buffer type map exists")
                                .insert(name.clone(), oid.as_raw());
                            info!("created buffer pool {}", name);
                        }
                        Err(e) => {
                            error!("failed to create buffer pool {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    },
                }
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(oid) = self.object_oid(BUFFER_POOL_TABLE, &name) else {
                    return TaskStatus::Consumed;
                };
                match self
                    .ctx
                    .sad()
                    .remove_buffer_pool(BufferPoolOid::from_raw(oid))
                {
                    Ok(()) => {
                        self.type_maps
                            .get_mut(BUFFER_POOL_TABLE)
                            .expect("buffer type map exists")
                            .remove(&name);
                        TaskStatus::Consumed
                    }
                    Err(SadError::ObjectInUse { .. }) => TaskStatus::Retry,
                    Err(e) => {
                        error!("failed to remove buffer pool {}: {}", name, e);
                        TaskStatus::Retry
                    }
                }
            }
        }
    }

    fn parse_profile_spec(
        &self,
        entry: &KeyOpFieldValues,
    ) -> Result<Result<BufferProfileSpec, TaskStatus>, String> {
        let pool = match resolve_field_ref(&self.type_maps, "pool", entry) {
            RefResolve::Success(oid) => BufferPoolOid::from_raw(oid),
            RefResolve::NotResolved => return Ok(Err(TaskStatus::Retry)),
            RefResolve::FieldNotFound => return Err("profile has no pool".to_string()),
            RefResolve::Multiple => return Err("profile names several pools".to_string()),
        };

        let mut spec = BufferProfileSpec {
            pool,
            size: 0,
            dynamic_th: None,
            static_th: None,
            xon: None,
            xoff: None,
        };
        for (field, value) in &entry.field_values {
            match field.as_str() {
                "pool" => {}
                "size" => {
                    spec.size = value
                        .parse()
                        .map_err(|_| format!("invalid profile size {:?}", value))?;
                }
                "dynamic_th" => {
                    spec.dynamic_th = Some(
                        value
                            .parse()
                            .map_err(|_| format!("invalid dynamic_th {:?}", value))?,
                    );
                }
                "static_th" => {
                    spec.static_th = Some(
                        value
                            .parse()
                            .map_err(|_| format!("invalid static_th {:?}", value))?,
                    );
                }
                "xon" => {
                    spec.xon = Some(
                        value
                            .parse()
                            .map_err(|_| format!("invalid xon {:?}", value))?,
                    );
                }
                "xoff" => {
                    spec.xoff = Some(
                        value
                            .parse()
                            .map_err(|_| format!("invalid xoff {:?}", value))?,
                    );
                }
                other => return Err(format!("unknown profile attribute {:?}", other)),
            }
        }
        Ok(Ok(spec))
    }

    fn handle_profile(&mut self, entry: &KeyOpFieldValues) -> TaskStatus {
        let name = entry.key.clone();
        match entry.op {
            Operation::Set => {
                let spec = match self.parse_profile_spec(entry) {
                    Ok(Ok(spec)) => spec,
                    Ok(Err(status)) => return status,
                    Err(message) => {
                        error!("invalid buffer profile {}: {}", name, message);
                        return TaskStatus::Invalid;
                    }
                };
                match self.object_oid(BUFFER_PROFILE_TABLE, &name) {
                    Some(oid) => {
                        if let Err(e) = self
                            .ctx
                            .sad()
                            .set_buffer_profile(BufferProfileOid::from_raw(oid), &spec)
                        {
                            error!("failed to update buffer profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    }
                    None => match self.ctx.sad().create_buffer_profile(&spec) {
                        Ok(oid) => {
                            self.type_maps
                                .get_mut(BUFFER_PROFILE_TABLE)
                                .expect("buffer type map exists")
                                .insert(name.clone(), oid.as_raw());
                            info!("created buffer profile {}", name);
                        }
                        Err(e) => {
                            error!("failed to create buffer profile {}: {}", name, e);
                            return TaskStatus::Retry;
                        }
                    },
                }
                TaskStatus::Consumed
            }
            Operation::Del => {
                let Some(oid) = self.object_oid(BUFFER_PROFILE_TABLE, &name) else {
                    return TaskStatus::Consumed;
                };
                match self
                    .ctx
                    .sad()
                    .remove_buffer_profile(BufferProfileOid::from_raw(oid))
                {
                    Ok(()) => {
                        self.type_maps
                            .get_mut(BUFFER_PROFILE_TABLE)
                            .expect("buffer type map exists")
                            .remove(&name);
                        TaskStatus::Consumed
                    }
                    Err(SadError::ObjectInUse { .. }) => TaskStatus::Retry,
                    Err(e) => {
                        error!("failed to remove buffer profile {}: {}", name, e);
                        TaskStatus::Retry
                    }
                }
            }
        }
    }

    /// Shared shape of the queue and PG binding handlers: a
    /// `ports:range` key and a profile reference to apply per index.
    fn binding_parts(
        &self,
        entry: &KeyOpFieldValues,
    ) -> Result<(Vec<String>, u32, u32, Option<u64>), TaskStatus> {
        let Some((port_list, range_str)) = entry.key.split_once(':') else {
            warn!("invalid buffer binding key {:?}", entry.key);
            return Err(TaskStatus::Invalid);
        };
        let (low, high) = match parse_index_range(range_str) {
            Ok(range) => range,
            Err(e) => {
                warn!("invalid buffer binding range {:?}: {}", range_str, e);
                return Err(TaskStatus::Invalid);
            }
        };
        let profile = match resolve_field_ref(&self.type_maps, "profile", entry) {
            RefResolve::Success(oid) => Some(oid),
            RefResolve::FieldNotFound => None,
            RefResolve::NotResolved => return Err(TaskStatus::Retry),
            RefResolve::Multiple => return Err(TaskStatus::Invalid),
        };
        let aliases = port_list
            .split(',')
            .map(|a| a.trim().to_string())
            .collect();
        Ok((aliases, low, high, profile))
    }

    fn handle_queue_binding(&mut self, entry: &KeyOpFieldValues, ports: &PortsOrch) -> TaskStatus {
        let (aliases, low, high, profile) = match self.binding_parts(entry) {
            Ok(parts) => parts,
            Err(status) => return status,
        };
        let profile = match (entry.op, profile) {
            (Operation::Set, Some(oid)) => Some(BufferProfileOid::from_raw(oid)),
            (Operation::Set, None) => {
                warn!("buffer queue binding {} has no profile", entry.key);
                return TaskStatus::Invalid;
            }
            (Operation::Del, _) => None,
        };

        for alias in &aliases {
            let Some(port) = ports.get(alias) else {
                return TaskStatus::Retry;
            };
            let queues = match self.ctx.sad().port_queues(port.port_oid) {
                Ok(queues) => queues,
                Err(e) => {
                    error!("failed to read queues of {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
            };
            for index in low..=high {
                let Some(queue) = queues.get(index as usize) else {
                    warn!("queue index {} out of range on {}", index, alias);
                    return TaskStatus::Invalid;
                };
                if let Err(e) = self.ctx.sad().set_queue_buffer_profile(*queue, profile) {
                    error!(
                        "failed to apply buffer profile to {} queue {}: {}",
                        alias, index, e
                    );
                    return TaskStatus::Retry;
                }
            }
        }
        TaskStatus::Consumed
    }

    fn handle_pg_binding(&mut self, entry: &KeyOpFieldValues, ports: &PortsOrch) -> TaskStatus {
        let (aliases, low, high, profile) = match self.binding_parts(entry) {
            Ok(parts) => parts,
            Err(status) => return status,
        };
        let profile = match (entry.op, profile) {
            (Operation::Set, Some(oid)) => Some(BufferProfileOid::from_raw(oid)),
            (Operation::Set, None) => {
                warn!("buffer PG binding {} has no profile", entry.key);
                return TaskStatus::Invalid;
            }
            (Operation::Del, _) => None,
        };

        for alias in &aliases {
            let Some(port) = ports.get(alias) else {
                return TaskStatus::Retry;
            };
            let groups = match self.ctx.sad().port_priority_groups(port.port_oid) {
                Ok(groups) => groups,
                Err(e) => {
                    error!("failed to read priority groups of {}: {}", alias, e);
                    return TaskStatus::Retry;
                }
            };
            for index in low..=high {
                let Some(group) = groups.get(index as usize) else {
                    warn!("priority group index {} out of range on {}", index, alias);
                    return TaskStatus::Invalid;
                };
                if let Err(e) = self
                    .ctx
                    .sad()
                    .set_priority_group_buffer_profile(*group, profile)
                {
                    error!(
                        "failed to apply buffer profile to {} PG {}: {}",
                        alias, index, e
                    );
                    return TaskStatus::Retry;
                }
            }
        }
        TaskStatus::Consumed
    }

    fn handle_profile_list(
        &mut self,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        direction: BufferDirection,
    ) -> TaskStatus {
        let profiles = match resolve_field_ref_array(&self.type_maps, "profile_list", entry) {
            RefArrayResolve::Success(oids) => oids
                .into_iter()
                .map(BufferProfileOid::from_raw)
                .collect::<Vec<_>>(),
            RefArrayResolve::FieldNotFound => {
                warn!("buffer profile list {} has no profiles", entry.key);
                return TaskStatus::Invalid;
            }
            RefArrayResolve::NotResolved => return TaskStatus::Retry,
            RefArrayResolve::Multiple => return TaskStatus::Invalid,
        };
        let profiles = match entry.op {
            Operation::Set => profiles,
            Operation::Del => Vec::new(),
        };

        for alias in entry.key.split(',') {
            let alias = alias.trim();
            let Some(port) = ports.get(alias) else {
                return TaskStatus::Retry;
            };
            if let Err(e) =
                self.ctx
                    .sad()
                    .set_port_buffer_profile_list(port.port_oid, direction, &profiles)
            {
                error!("failed to apply buffer profile list to {}: {}", alias, e);
                return TaskStatus::Retry;
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

    fn setup() -> (BufferOrch, PortsOrch) {
        let driver = Arc::new(SimDriver::new(SimConfig::default()));
        let ctx = SwitchContext::new(driver).unwrap();
        let mut ports = PortsOrch::new(ctx.clone());
        let buffer = BufferOrch::new(ctx);
        let mut events = EventQueue::new();

        ports
            .consumer_mut(PORT_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                fv(&[("lanes", "0,1,2,3")]),
            )]);
        ports.do_task(PORT_TABLE, &mut events);

        (buffer, ports)
    }

    fn add_pool_and_profile(buffer: &mut BufferOrch, ports: &PortsOrch) {
        buffer
            .consumer_mut(BUFFER_POOL_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "ingress_pool",
                fv(&[("type", "ingress"), ("mode", "dynamic"), ("size", "12766208")]),
            )]);
        buffer.do_task(BUFFER_POOL_TABLE, ports);

        buffer
            .consumer_mut(BUFFER_PROFILE_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "lossless",
                fv(&[
                    ("pool", "[BUFFER_POOL_TABLE:ingress_pool]"),
                    ("size", "9216"),
                    ("dynamic_th", "-1"),
                    ("xon", "18432"),
                    ("xoff", "32768"),
                ]),
            )]);
        buffer.do_task(BUFFER_PROFILE_TABLE, ports);
    }

    #[test]
    fn test_profile_requires_pool() {
        let (mut buffer, ports) = setup();
        buffer
            .consumer_mut(BUFFER_PROFILE_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "lossless",
                fv(&[("pool", "[BUFFER_POOL_TABLE:ingress_pool]"), ("size", "9216")]),
            )]);
        buffer.do_task(BUFFER_PROFILE_TABLE, &ports);
        assert_eq!(buffer.pending(BUFFER_PROFILE_TABLE), 1);

        add_pool_and_profile(&mut buffer, &ports);
        assert_eq!(buffer.pending(BUFFER_PROFILE_TABLE), 0);
        assert!(buffer.object_oid(BUFFER_PROFILE_TABLE, "lossless").is_some());
    }

    #[test]
    fn test_pg_binding() {
        let (mut buffer, ports) = setup();
        add_pool_and_profile(&mut buffer, &ports);

        buffer
            .consumer_mut(BUFFER_PG_TABLE)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0:3-4",
                fv(&[("profile", "[BUFFER_PROFILE_TABLE:lossless]")]),
            )]);
        buffer.do_task(BUFFER_PG_TABLE, &ports);
        assert_eq!(buffer.pending(BUFFER_PG_TABLE), 0);
    }

    #[test]
    fn test_profile_list() {
        let (mut buffer, ports) = setup();
        add_pool_and_profile(&mut buffer, &ports);

        buffer
            .consumer_mut(BUFFER_PORT_INGRESS_PROFILE_LIST)
            .add_to_sync(vec![KeyOpFieldValues::set(
                "Ethernet0",
                fv(&[("profile_list", "[BUFFER_PROFILE_TABLE:lossless]")]),
            )]);
        buffer.do_task(BUFFER_PORT_INGRESS_PROFILE_LIST, &ports);
        assert_eq!(buffer.pending(BUFFER_PORT_INGRESS_PROFILE_LIST), 0);
    }
}
