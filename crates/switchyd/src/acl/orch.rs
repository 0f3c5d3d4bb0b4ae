//! ACL orchestration.

use super::counter::{CounterHub, CounterRow};
use super::range::AclRangeCache;
use super::rule::{parse_rule, AclRule, L3PacketAction, RedirectTarget, RuleAction};
use super::table::{table_spec, AclTable, AclTableKind};
use crate::context::SwitchContext;
use crate::mirror::MirrorOrch;
use crate::neigh::NeighOrch;
use crate::observer::MirrorSessionUpdate;
use crate::ports::{PortKind, PortsOrch};
use crate::route::RouteOrch;
use crate::tables::{ACL_RULE_TABLE, ACL_TABLE, COUNTERS_TABLE};
use log::{error, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use switchyd_orch_common::{
    Consumer, KeyOpFieldValues, OrchError, OrchResult, Operation, Store, TaskStatus,
};
use switchyd_sad::{AclEntryAction, AclEntrySpec, AclTableOid, PacketAction, RawOid};

pub const TABLES: [&str; 2] = [ACL_TABLE, ACL_RULE_TABLE];

/// ACL orchestration (C10): tables, rules, the shared range cache and
/// the counter rows the background collector samples.
pub struct AclOrch {
    ctx: SwitchContext,
    consumers: HashMap<&'static str, Consumer>,
    tables: BTreeMap<String, AclTable>,
    ranges: AclRangeCache,
    hub: Arc<CounterHub>,
    store: Store,
    min_priority: u32,
    max_priority: u32,
}

impl AclOrch {
    pub fn new(ctx: SwitchContext, store: Store, hub: Arc<CounterHub>) -> Self {
        let consumers = TABLES
            .iter()
            .map(|table| (*table, Consumer::new(*table)))
            .collect();
        let min_priority = ctx.info().acl_min_priority;
        let max_priority = ctx.info().acl_max_priority;
        Self {
            ctx,
            consumers,
            tables: BTreeMap::new(),
            ranges: AclRangeCache::new(),
            hub,
            store,
            min_priority,
            max_priority,
        }
    }

    pub fn consumer_mut(&mut self, table: &str) -> &mut Consumer {
        self.consumers
            .get_mut(table)
            .unwrap_or_else(|| panic!("acl orch has no consumer for table {}", table))
    }

    pub fn pending(&self, table: &str) -> usize {
        self.consumers.get(table).map(|c| c.len()).unwrap_or(0)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    pub fn get_table(&self, id: &str) -> Option<&AclTable> {
        self.tables.get(id)
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    pub fn range_ref_count(
        &self,
        kind: switchyd_sad::AclRangeKind,
        low: u16,
        high: u16,
    ) -> Option<u32> {
        self.ranges.ref_count(kind, low, high)
    }

    pub fn do_task(
        &mut self,
        table: &str,
        ports: &PortsOrch,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) {
        let drained = self.consumer_mut(table).drain();
        let mut retained = Vec::new();

        for entry in drained {
            let status = match table {
                ACL_TABLE => self.process_table_entry(&entry, ports, mirror, route, neigh),
                ACL_RULE_TABLE => self.process_rule_entry(&entry, ports, mirror, route, neigh),
                _ => {
                    error!("acl orch received unknown table {}", table);
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

    fn process_table_entry(
        &mut self,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        // A composite key's first token names the table.
        let table_id = entry
            .key
            .split(':')
            .next()
            .unwrap_or_default()
            .to_string();
        if table_id.is_empty() {
            return TaskStatus::Invalid;
        }

        match entry.op {
            Operation::Set => self.add_table(&table_id, entry, ports, mirror, route, neigh),
            Operation::Del => self.remove_table(&table_id, mirror, route, neigh),
        }
    }

    fn add_table(
        &mut self,
        table_id: &str,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        let mut kind = None;
        let mut description = String::new();
        let mut port_aliases: Vec<String> = Vec::new();

        for (field, value) in &entry.field_values {
            match field.to_uppercase().as_str() {
                "TYPE" => match AclTableKind::parse(value) {
                    Some(k) => kind = Some(k),
                    None => {
                        error!("unknown ACL table type {:?}", value);
                        return TaskStatus::Invalid;
                    }
                },
                "POLICY_DESC" => description = value.clone(),
                "PORTS" => {
                    port_aliases = value.split(',').map(|p| p.trim().to_string()).collect();
                }
                other => {
                    error!("unknown ACL table attribute {:?}", other);
                    return TaskStatus::Invalid;
                }
            }
        }

        let Some(kind) = kind else {
            error!("ACL table {} has no type", table_id);
            return TaskStatus::Invalid;
        };
        if port_aliases.is_empty() {
            error!("ACL table {} has no ports", table_id);
            return TaskStatus::Invalid;
        }
        let unique: BTreeSet<&String> = port_aliases.iter().collect();
        if unique.len() != port_aliases.len() {
            error!("ACL table {} port list has duplicates", table_id);
            return TaskStatus::Invalid;
        }
        for alias in &port_aliases {
            match ports.get(alias) {
                None => return TaskStatus::Retry,
                Some(port) if port.kind != PortKind::Phy => {
                    error!("ACL table {} port {} is not physical", table_id, alias);
                    return TaskStatus::Invalid;
                }
                Some(_) => {}
            }
        }

        // Re-publication replaces the table wholesale.
        if self.tables.contains_key(table_id) {
            let status = self.remove_table(table_id, mirror, route, neigh);
            if status != TaskStatus::Consumed {
                return status;
            }
        }

        let oid = match self.ctx.sad().create_acl_table(&table_spec(kind)) {
            Ok(oid) => oid,
            Err(e) => {
                error!("failed to create ACL table {}: {}", table_id, e);
                return TaskStatus::Retry;
            }
        };

        let mut binds = Vec::with_capacity(port_aliases.len());
        for alias in &port_aliases {
            match ports.bind_acl_table(alias, oid) {
                Ok(bind) => binds.push(bind),
                Err(e) => {
                    error!("failed to bind ACL table {} to {}: {}", table_id, alias, e);
                    for bind in binds {
                        let _ = self.ctx.sad().unbind_ingress_acl(bind);
                    }
                    let _ = self.ctx.sad().remove_acl_table(oid);
                    return e.status();
                }
            }
        }

        self.tables.insert(
            table_id.to_string(),
            AclTable {
                id: table_id.to_string(),
                description,
                kind,
                ports: port_aliases,
                oid,
                binds,
                rules: BTreeMap::new(),
            },
        );
        info!("created ACL table {}", table_id);
        TaskStatus::Consumed
    }

    fn remove_table(
        &mut self,
        table_id: &str,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        if !self.tables.contains_key(table_id) {
            return TaskStatus::Consumed;
        }

        let rule_ids: Vec<String> = self.tables[table_id].rules.keys().cloned().collect();
        for rule_id in rule_ids {
            let status = self.remove_rule(table_id, &rule_id, mirror, route, neigh);
            if status != TaskStatus::Consumed {
                return status;
            }
        }

        let table = self.tables.get_mut(table_id).expect("table checked above");
        let binds = std::mem::take(&mut table.binds);
        let oid = table.oid;
        for bind in binds {
            if let Err(e) = self.ctx.sad().unbind_ingress_acl(bind) {
                error!("failed to unbind ACL table {}: {}", table_id, e);
            }
        }
        if let Err(e) = self.ctx.sad().remove_acl_table(oid) {
            error!("failed to remove ACL table {}: {}", table_id, e);
            return TaskStatus::Retry;
        }
        self.tables.remove(table_id);
        info!("removed ACL table {}", table_id);
        TaskStatus::Consumed
    }

    fn process_rule_entry(
        &mut self,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        let Some((table_id, rule_id)) = entry.key.split_once(':') else {
            warn!("invalid ACL rule key {:?}", entry.key);
            return TaskStatus::Invalid;
        };
        let table_id = table_id.to_string();
        let rule_id = rule_id.to_string();

        match entry.op {
            Operation::Set => {
                self.add_rule(&table_id, &rule_id, entry, ports, mirror, route, neigh)
            }
            Operation::Del => self.remove_rule(&table_id, &rule_id, mirror, route, neigh),
        }
    }

    fn add_rule(
        &mut self,
        table_id: &str,
        rule_id: &str,
        entry: &KeyOpFieldValues,
        ports: &PortsOrch,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        let Some(table) = self.tables.get(table_id) else {
            // The table has not been created yet.
            return TaskStatus::Retry;
        };
        let kind = table.kind;
        let table_oid = table.oid;

        let mut rule = match parse_rule(
            kind,
            table_id,
            rule_id,
            entry,
            self.min_priority,
            self.max_priority,
        ) {
            Ok(rule) => rule,
            Err(message) => {
                error!("invalid ACL rule {}: {}", entry.key, message);
                return TaskStatus::Invalid;
            }
        };

        // Resolve the action before touching any state; an unresolved
        // redirect keeps the entry pending without side effects.
        let resolved_action = match &rule.action {
            RuleAction::L3(L3PacketAction::Forward) => {
                Some(AclEntryAction::Packet(PacketAction::Forward))
            }
            RuleAction::L3(L3PacketAction::Drop) => {
                Some(AclEntryAction::Packet(PacketAction::Drop))
            }
            RuleAction::L3(L3PacketAction::Redirect(target)) => {
                match resolve_redirect(target, ports, route, neigh) {
                    Ok(oid) => Some(AclEntryAction::Redirect(oid)),
                    Err(e) => {
                        info!("ACL rule {} redirect not ready: {}", entry.key, e);
                        return e.status();
                    }
                }
            }
            RuleAction::Mirror { session } => {
                if !mirror.session_exists(session) {
                    error!(
                        "ACL rule {} references unknown mirror session {}",
                        entry.key, session
                    );
                    return TaskStatus::Invalid;
                }
                None
            }
        };

        // Re-publication replaces the rule.
        if self.tables[table_id].rules.contains_key(rule_id) {
            let status = self.remove_rule(table_id, rule_id, mirror, route, neigh);
            if status != TaskStatus::Consumed {
                if let RuleAction::L3(L3PacketAction::Redirect(target)) = &rule.action {
                    release_redirect(target, route, neigh);
                }
                return status;
            }
        }

        match &rule.action {
            RuleAction::Mirror { session } => {
                let session = session.clone();
                // The reference pins the session regardless of state.
                mirror.increase_ref(&session);

                if mirror.session_state(&session) == Some(true) {
                    let oid = mirror
                        .session_oid(&session)
                        .expect("active mirror session has a handle");
                    if let Err(e) = install_rule(
                        &self.ctx,
                        &mut self.ranges,
                        &self.hub,
                        &mut rule,
                        table_oid,
                        AclEntryAction::MirrorIngress(oid),
                    ) {
                        error!("failed to install ACL rule {}: {}", entry.key, e);
                        mirror.decrease_ref(&session);
                        return e.status();
                    }
                } else {
                    // Staged until the session activates; the counter
                    // row exists so the collector reports the carry.
                    let mut state = self.hub.lock();
                    state
                        .rows
                        .insert(rule.counters_key(), CounterRow::default());
                }
            }
            RuleAction::L3(_) => {
                let action = resolved_action.expect("l3 action resolved above");
                if let Err(e) = install_rule(
                    &self.ctx,
                    &mut self.ranges,
                    &self.hub,
                    &mut rule,
                    table_oid,
                    action,
                ) {
                    error!("failed to install ACL rule {}: {}", entry.key, e);
                    if let RuleAction::L3(L3PacketAction::Redirect(target)) = &rule.action {
                        release_redirect(target, route, neigh);
                    }
                    return e.status();
                }
            }
        }

        info!("created ACL rule {} in table {}", rule_id, table_id);
        self.tables
            .get_mut(table_id)
            .expect("table checked above")
            .rules
            .insert(rule_id.to_string(), rule);
        TaskStatus::Consumed
    }

    fn remove_rule(
        &mut self,
        table_id: &str,
        rule_id: &str,
        mirror: &mut MirrorOrch,
        route: &mut RouteOrch,
        neigh: &mut NeighOrch,
    ) -> TaskStatus {
        let Some(table) = self.tables.get_mut(table_id) else {
            return TaskStatus::Consumed;
        };
        let Some(mut rule) = table.rules.remove(rule_id) else {
            return TaskStatus::Consumed;
        };

        if rule.installed {
            if let Err(e) = uninstall_rule(&self.ctx, &mut self.ranges, &mut rule) {
                error!("failed to remove ACL rule {}:{}: {}", table_id, rule_id, e);
                table.rules.insert(rule_id.to_string(), rule);
                return TaskStatus::Retry;
            }
        }

        match &rule.action {
            RuleAction::Mirror { session } => mirror.decrease_ref(session),
            RuleAction::L3(L3PacketAction::Redirect(target)) => {
                release_redirect(target, route, neigh);
            }
            RuleAction::L3(_) => {}
        }

        let key = rule.counters_key();
        self.hub.lock().rows.remove(&key);
        self.store.del(COUNTERS_TABLE, &key);
        info!("removed ACL rule {} from table {}", rule_id, table_id);
        TaskStatus::Consumed
    }

    /// Mirror session state change: install staged rules when the
    /// session comes up, fold counters into the carry and tear rules
    /// down when it goes away. The logical rule survives either way.
    pub fn on_mirror_session_update(&mut self, update: &MirrorSessionUpdate, mirror: &MirrorOrch) {
        let ctx = self.ctx.clone();

        for table in self.tables.values_mut() {
            let table_oid = table.oid;
            for rule in table.rules.values_mut() {
                if rule.mirror_session() != Some(update.name.as_str()) {
                    continue;
                }

                if update.active && !rule.installed {
                    let Some(oid) = mirror.session_oid(&update.name) else {
                        continue;
                    };
                    info!(
                        "activating mirror ACL rule {}:{} for session {}",
                        rule.table_id, rule.id, update.name
                    );
                    if let Err(e) = install_rule(
                        &ctx,
                        &mut self.ranges,
                        &self.hub,
                        rule,
                        table_oid,
                        AclEntryAction::MirrorIngress(oid),
                    ) {
                        error!(
                            "failed to activate mirror ACL rule {}:{}: {}",
                            rule.table_id, rule.id, e
                        );
                    }
                } else if !update.active && rule.installed {
                    if let Some(counter) = rule.counter_oid {
                        match ctx.sad().read_acl_counter(counter) {
                            Ok((packets, bytes)) => {
                                rule.carry_packets += packets;
                                rule.carry_bytes += bytes;
                            }
                            Err(e) => {
                                warn!(
                                    "failed to read counters of rule {}:{}: {}",
                                    rule.table_id, rule.id, e
                                );
                            }
                        }
                    }
                    info!(
                        "deactivating mirror ACL rule {}:{} for session {}",
                        rule.table_id, rule.id, update.name
                    );
                    if let Err(e) = uninstall_rule(&ctx, &mut self.ranges, rule) {
                        error!(
                            "failed to deactivate mirror ACL rule {}:{}: {}",
                            rule.table_id, rule.id, e
                        );
                    }
                    let mut state = self.hub.lock();
                    if let Some(row) = state.rows.get_mut(&rule.counters_key()) {
                        row.counter = None;
                        row.carry_packets = rule.carry_packets;
                        row.carry_bytes = rule.carry_bytes;
                    }
                }
            }
        }
    }
}

/// Creates the counter and any range objects, then the entry itself,
/// unwinding everything created so far on any failure.
fn install_rule(
    ctx: &SwitchContext,
    ranges: &mut AclRangeCache,
    hub: &CounterHub,
    rule: &mut AclRule,
    table_oid: AclTableOid,
    action: AclEntryAction,
) -> OrchResult<()> {
    let counter = ctx.sad().create_acl_counter(table_oid)?;

    let mut range_oids = Vec::with_capacity(rule.ranges.len());
    for (kind, low, high) in &rule.ranges {
        match ranges.get_or_create(ctx.sad(), *kind, *low, *high) {
            Ok(oid) => range_oids.push(oid),
            Err(e) => {
                ranges.release_by_oids(ctx.sad(), &range_oids);
                if let Err(e) = ctx.sad().remove_acl_counter(counter) {
                    warn!("failed to unwind ACL counter: {}", e);
                }
                return Err(e);
            }
        }
    }

    let spec = AclEntrySpec {
        table: table_oid,
        priority: rule.priority,
        counter: Some(counter),
        matches: rule.matches.clone(),
        ranges: range_oids.clone(),
        action,
    };

    match ctx.sad().create_acl_entry(&spec) {
        Ok(entry) => {
            rule.entry_oid = Some(entry);
            rule.counter_oid = Some(counter);
            rule.installed = true;
            let mut state = hub.lock();
            let row = state.rows.entry(rule.counters_key()).or_default();
            row.counter = Some(counter);
            Ok(())
        }
        Err(e) => {
            ranges.release_by_oids(ctx.sad(), &range_oids);
            if let Err(e) = ctx.sad().remove_acl_counter(counter) {
                warn!("failed to unwind ACL counter: {}", e);
            }
            Err(OrchError::from(e))
        }
    }
}

/// Removes the entry, releases the rule's ranges and drops the
/// counter. The logical rule object is untouched beyond its handles.
fn uninstall_rule(
    ctx: &SwitchContext,
    ranges: &mut AclRangeCache,
    rule: &mut AclRule,
) -> OrchResult<()> {
    if let Some(entry) = rule.entry_oid {
        ctx.sad().remove_acl_entry(entry)?;
    }
    rule.entry_oid = None;

    for (kind, low, high) in &rule.ranges {
        ranges.release(ctx.sad(), *kind, *low, *high);
    }
    if let Some(counter) = rule.counter_oid.take() {
        ctx.sad().remove_acl_counter(counter)?;
    }
    rule.installed = false;
    Ok(())
}

/// Resolves a redirect target in order: port or LAG alias, then an
/// installed next hop, then an ECMP set (created on demand). A
/// resolved next hop or group comes back with a reference taken.
fn resolve_redirect(
    target: &RedirectTarget,
    ports: &PortsOrch,
    route: &mut RouteOrch,
    neigh: &mut NeighOrch,
) -> OrchResult<RawOid> {
    match target {
        RedirectTarget::Iface(alias) => {
            let port = ports.get(alias).ok_or_else(|| {
                OrchError::unresolved(format!("redirect target {} does not exist", alias))
            })?;
            match port.kind {
                PortKind::Phy => Ok(port.port_oid.as_raw()),
                PortKind::Lag => port
                    .lag_oid
                    .map(|l| l.as_raw())
                    .ok_or_else(|| OrchError::unresolved(format!("LAG {} has no handle", alias))),
                _ => Err(OrchError::parse(format!(
                    "redirect target {} must be a physical port or LAG",
                    alias
                ))),
            }
        }
        RedirectTarget::NextHop(ip) => {
            let oid = neigh.next_hop_oid(ip).ok_or_else(|| {
                OrchError::unresolved(format!("redirect next hop {} is not installed", ip))
            })?;
            neigh.increase_next_hop_ref(ip);
            Ok(oid.as_raw())
        }
        RedirectTarget::NextHopGroup(key) => {
            let oid = match route.nhg_oid(key) {
                Some(oid) => oid,
                None => route.add_next_hop_group(key, neigh)?,
            };
            route.increase_nhg_ref(key);
            Ok(oid.as_raw())
        }
    }
}

/// Reverses the references a resolved redirect took, destroying a
/// group the redirect was the last user of.
fn release_redirect(target: &RedirectTarget, route: &mut RouteOrch, neigh: &mut NeighOrch) {
    match target {
        RedirectTarget::Iface(_) => {}
        RedirectTarget::NextHop(ip) => neigh.decrease_next_hop_ref(ip),
        RedirectTarget::NextHopGroup(key) => {
            route.decrease_nhg_ref(key);
            if route.nhg_ref_count(key) == Some(0) {
                if let Err(e) = route.remove_next_hop_group(key, neigh) {
                    warn!("failed to remove redirect next hop group {}: {}", key, e);
                }
            }
        }
    }
}
