//! The in-process application store.
//!
//! Producers publish (key, op, fields) tuples per table; the daemon
//! selects on readiness, pops batches and reads committed state. One
//! mutex guards the whole store; publication order is preserved within
//! a table. Only tables registered with [`Store::watch`] queue entries
//! for consumption; writes to other tables (such as the counters
//! table) update committed state only.

use crate::consumer::{FieldValues, KeyOpFieldValues, Operation};
use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

#[derive(Default)]
struct TableState {
    queue: VecDeque<KeyOpFieldValues>,
    committed: BTreeMap<String, FieldValues>,
}

#[derive(Default)]
struct StoreInner {
    tables: HashMap<String, TableState>,
    watched: HashSet<String>,
}

/// Cheaply clonable handle to the shared store.
#[derive(Clone, Default)]
pub struct Store {
    inner: Arc<(Mutex<StoreInner>, Condvar)>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StoreInner> {
        self.inner.0.lock().expect("store mutex poisoned")
    }

    /// Registers a table for consumption; its mutations are queued.
    pub fn watch(&self, table: &str) {
        let mut inner = self.lock();
        inner.watched.insert(table.to_string());
        inner.tables.entry(table.to_string()).or_default();
    }

    /// Publishes one mutation: applies it to committed state and, for
    /// watched tables, queues it for consumption.
    pub fn publish(&self, table: &str, entry: KeyOpFieldValues) {
        let mut inner = self.lock();
        let watched = inner.watched.contains(table);
        let state = inner.tables.entry(table.to_string()).or_default();

        match entry.op {
            Operation::Set => {
                let committed = state.committed.entry(entry.key.clone()).or_default();
                for (field, value) in &entry.field_values {
                    if let Some(slot) = committed.iter_mut().find(|(f, _)| f == field) {
                        slot.1 = value.clone();
                    } else {
                        committed.push((field.clone(), value.clone()));
                    }
                }
            }
            Operation::Del => {
                state.committed.remove(&entry.key);
            }
        }

        if watched {
            state.queue.push_back(entry);
            self.inner.1.notify_all();
        }
    }

    /// Publishes a SET.
    pub fn set(&self, table: &str, key: &str, field_values: FieldValues) {
        self.publish(table, KeyOpFieldValues::set(key, field_values));
    }

    /// Publishes a DEL.
    pub fn del(&self, table: &str, key: &str) {
        self.publish(table, KeyOpFieldValues::del(key));
    }

    /// Non-blocking pop of up to `limit` queued entries of a table.
    pub fn pop_batch(&self, table: &str, limit: usize) -> Vec<KeyOpFieldValues> {
        let mut inner = self.lock();
        let Some(state) = inner.tables.get_mut(table) else {
            return Vec::new();
        };
        let count = state.queue.len().min(limit);
        state.queue.drain(..count).collect()
    }

    /// Returns the committed fields of a key.
    pub fn get(&self, table: &str, key: &str) -> Option<FieldValues> {
        let inner = self.lock();
        inner
            .tables
            .get(table)
            .and_then(|state| state.committed.get(key))
            .cloned()
    }

    /// Returns one committed field of a key.
    pub fn get_field(&self, table: &str, key: &str, field: &str) -> Option<String> {
        self.get(table, key)?
            .into_iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v)
    }

    /// Returns the committed keys of a table.
    pub fn keys(&self, table: &str) -> Vec<String> {
        let inner = self.lock();
        inner
            .tables
            .get(table)
            .map(|state| state.committed.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Returns the watched tables that have queued entries.
    pub fn ready_tables(&self) -> HashSet<String> {
        let inner = self.lock();
        inner
            .tables
            .iter()
            .filter(|(name, state)| inner.watched.contains(*name) && !state.queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Blocks until any watched table has queued entries or the
    /// timeout elapses. Returns true when data is ready.
    pub fn wait_ready(&self, timeout: Duration) -> bool {
        let mut inner = self.lock();
        let has_ready = |inner: &StoreInner| {
            inner
                .tables
                .iter()
                .any(|(name, state)| inner.watched.contains(name) && !state.queue.is_empty())
        };
        if has_ready(&inner) {
            return true;
        }
        let (guard, _timeout) = self
            .inner
            .1
            .wait_timeout(inner, timeout)
            .expect("store mutex poisoned");
        inner = guard;
        has_ready(&inner)
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
    fn test_publish_and_pop_in_order() {
        let store = Store::new();
        store.watch("ROUTE_TABLE");

        store.set("ROUTE_TABLE", "10.0.0.0/24", fv(&[("nexthop", "10.0.0.2")]));
        store.del("ROUTE_TABLE", "10.0.1.0/24");

        let batch = store.pop_batch("ROUTE_TABLE", 16);
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].key, "10.0.0.0/24");
        assert!(batch[0].op.is_set());
        assert!(batch[1].op.is_del());

        assert!(store.pop_batch("ROUTE_TABLE", 16).is_empty());
    }

    #[test]
    fn test_pop_respects_limit() {
        let store = Store::new();
        store.watch("T");
        for i in 0..5 {
            store.set("T", &format!("k{}", i), vec![]);
        }
        assert_eq!(store.pop_batch("T", 3).len(), 3);
        assert_eq!(store.pop_batch("T", 3).len(), 2);
    }

    #[test]
    fn test_committed_state_merges_fields() {
        let store = Store::new();
        store.watch("T");
        store.set("T", "k", fv(&[("a", "1"), ("b", "2")]));
        store.set("T", "k", fv(&[("b", "3")]));

        assert_eq!(store.get_field("T", "k", "a").as_deref(), Some("1"));
        assert_eq!(store.get_field("T", "k", "b").as_deref(), Some("3"));

        store.del("T", "k");
        assert!(store.get("T", "k").is_none());
    }

    #[test]
    fn test_unwatched_table_commits_without_queueing() {
        let store = Store::new();
        store.set("COUNTERS", "table:rule", fv(&[("Packets", "10")]));

        assert_eq!(
            store.get_field("COUNTERS", "table:rule", "Packets").as_deref(),
            Some("10")
        );
        assert!(store.ready_tables().is_empty());
        assert!(store.pop_batch("COUNTERS", 16).is_empty());
    }

    #[test]
    fn test_wait_ready() {
        let store = Store::new();
        store.watch("T");
        assert!(!store.wait_ready(Duration::from_millis(10)));

        store.set("T", "k", vec![]);
        assert!(store.wait_ready(Duration::from_millis(10)));
    }
}
