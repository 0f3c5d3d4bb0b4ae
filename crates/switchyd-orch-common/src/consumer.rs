//! Per-table pending map with the pop merge policy.

use std::collections::{HashMap, VecDeque};

/// Operation carried by a store mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    Set,
    Del,
}

impl Operation {
    pub fn is_set(&self) -> bool {
        matches!(self, Operation::Set)
    }

    pub fn is_del(&self) -> bool {
        matches!(self, Operation::Del)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Set => "SET",
            Operation::Del => "DEL",
        }
    }
}

/// Ordered (field, value) pairs of a store entry.
pub type FieldValues = Vec<(String, String)>;

/// One (key, op, fields) tuple popped from a table.
#[derive(Debug, Clone)]
pub struct KeyOpFieldValues {
    pub key: String,
    pub op: Operation,
    pub field_values: FieldValues,
}

impl KeyOpFieldValues {
    pub fn new(key: impl Into<String>, op: Operation, field_values: FieldValues) -> Self {
        Self {
            key: key.into(),
            op,
            field_values,
        }
    }

    pub fn set(key: impl Into<String>, field_values: FieldValues) -> Self {
        Self::new(key, Operation::Set, field_values)
    }

    pub fn del(key: impl Into<String>) -> Self {
        Self::new(key, Operation::Del, vec![])
    }

    /// Returns the value for a field, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.field_values
            .iter()
            .find(|(f, _)| f == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_field(&self, name: &str) -> bool {
        self.field_values.iter().any(|(f, _)| f == name)
    }
}

/// The pending map of one table, in insertion order.
///
/// Merge policy when a popped entry lands on a pending one:
/// - a new key or a DEL replaces outright;
/// - a SET merges field-by-field (last writer wins) and the merged
///   entry carries the SET op, superseding a pending DEL. The resync
///   protocol relies on that: routes re-sent during resync overwrite
///   the synthetic DELs seeded at resync start.
pub struct Consumer {
    table_name: String,
    order: VecDeque<String>,
    entries: HashMap<String, KeyOpFieldValues>,
}

impl Consumer {
    pub fn new(table_name: impl Into<String>) -> Self {
        Self {
            table_name: table_name.into(),
            order: VecDeque::new(),
            entries: HashMap::new(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Adds popped entries, merging onto pending ones.
    pub fn add_to_sync(&mut self, batch: Vec<KeyOpFieldValues>) {
        for entry in batch {
            self.add_entry(entry);
        }
    }

    fn add_entry(&mut self, entry: KeyOpFieldValues) {
        match self.entries.get_mut(&entry.key) {
            None => {
                self.order.push_back(entry.key.clone());
                self.entries.insert(entry.key.clone(), entry);
            }
            Some(existing) => {
                if entry.op == Operation::Del {
                    *existing = entry;
                } else {
                    for (field, value) in entry.field_values {
                        if let Some(slot) =
                            existing.field_values.iter_mut().find(|(f, _)| *f == field)
                        {
                            slot.1 = value;
                        } else {
                            existing.field_values.push((field, value));
                        }
                    }
                    existing.op = Operation::Set;
                }
            }
        }
    }

    /// Drains all pending entries in insertion order.
    pub fn drain(&mut self) -> Vec<KeyOpFieldValues> {
        let mut out = Vec::with_capacity(self.entries.len());
        while let Some(key) = self.order.pop_front() {
            if let Some(entry) = self.entries.remove(&key) {
                out.push(entry);
            }
        }
        out
    }

    /// Puts entries that came back `Retry` back into the pending map,
    /// preserving their relative order.
    pub fn requeue(&mut self, entries: Vec<KeyOpFieldValues>) {
        for entry in entries {
            self.add_entry(entry);
        }
    }

    /// Dumps pending entries for diagnostics.
    pub fn dump(&self) -> Vec<String> {
        self.order
            .iter()
            .filter_map(|key| self.entries.get(key))
            .map(|e| format!("{}:{}|{}", self.table_name, e.key, e.op.as_str()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn fv(pairs: &[(&str, &str)]) -> FieldValues {
        pairs
            .iter()
            .map(|(f, v)| (f.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_set_merge_is_idempotent() {
        let mut consumer = Consumer::new("PORT_TABLE");
        consumer.add_to_sync(vec![KeyOpFieldValues::set(
            "Ethernet0",
            fv(&[("speed", "100000")]),
        )]);
        consumer.add_to_sync(vec![KeyOpFieldValues::set(
            "Ethernet0",
            fv(&[("speed", "100000")]),
        )]);

        let drained = consumer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].field("speed"), Some("100000"));
    }

    #[test]
    fn test_set_merge_last_writer_wins() {
        let mut consumer = Consumer::new("PORT_TABLE");
        consumer.add_to_sync(vec![KeyOpFieldValues::set(
            "Ethernet0",
            fv(&[("speed", "100000")]),
        )]);
        consumer.add_to_sync(vec![KeyOpFieldValues::set(
            "Ethernet0",
            fv(&[("speed", "40000"), ("mtu", "9100")]),
        )]);

        let drained = consumer.drain();
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].field("speed"), Some("40000"));
        assert_eq!(drained[0].field("mtu"), Some("9100"));
    }

    #[test]
    fn test_del_wins_over_pending_set() {
        let mut consumer = Consumer::new("PORT_TABLE");
        consumer.add_to_sync(vec![
            KeyOpFieldValues::set("Ethernet0", fv(&[("speed", "100000")])),
            KeyOpFieldValues::del("Ethernet0"),
        ]);

        let drained = consumer.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].op.is_del());
        assert!(drained[0].field_values.is_empty());
    }

    #[test]
    fn test_set_supersedes_pending_del() {
        // Resync seeds synthetic DELs; a re-sent SET must replace one.
        let mut consumer = Consumer::new("ROUTE_TABLE");
        consumer.add_to_sync(vec![KeyOpFieldValues::del("10.0.0.0/24")]);
        consumer.add_to_sync(vec![KeyOpFieldValues::set(
            "10.0.0.0/24",
            fv(&[("nexthop", "10.0.0.2")]),
        )]);

        let drained = consumer.drain();
        assert_eq!(drained.len(), 1);
        assert!(drained[0].op.is_set());
        assert_eq!(drained[0].field("nexthop"), Some("10.0.0.2"));
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut consumer = Consumer::new("ROUTE_TABLE");
        consumer.add_to_sync(vec![
            KeyOpFieldValues::set("c", vec![]),
            KeyOpFieldValues::set("a", vec![]),
            KeyOpFieldValues::set("b", vec![]),
        ]);

        let keys: Vec<String> = consumer.drain().into_iter().map(|e| e.key).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }

    #[test]
    fn test_requeue_keeps_entries_pending() {
        let mut consumer = Consumer::new("ROUTE_TABLE");
        consumer.add_to_sync(vec![KeyOpFieldValues::set("a", vec![])]);

        let drained = consumer.drain();
        assert!(consumer.is_empty());

        consumer.requeue(drained);
        assert_eq!(consumer.len(), 1);
    }
}
