//! Refcounted object tables that never auto-create entries.
//!
//! Subsystems connect through reference counts on each other's
//! objects. Indexing a plain map can silently create a default entry
//! and corrupt a count; `SyncMap` makes every creation explicit and
//! turns a count touching a missing key into a hard error at the call
//! site.

use std::collections::HashMap;
use std::hash::Hash;

/// Trait for entries carrying a reference count.
pub trait HasRefCount {
    /// Increments and returns the new count.
    fn increment_ref(&mut self) -> u32;

    /// Decrements and returns the new count; `None` on underflow.
    fn decrement_ref(&mut self) -> Option<u32>;

    /// Returns the current count.
    fn ref_count(&self) -> u32;
}

/// A map whose lookups never insert.
#[derive(Debug, Clone, Default)]
pub struct SyncMap<K, V> {
    inner: HashMap<K, V>,
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self {
            inner: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn contains_key(&self, key: &K) -> bool {
        self.inner.contains_key(key)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.inner.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.inner.get_mut(key)
    }

    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.inner.insert(key, value)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.inner.remove(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.inner.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.inner.keys()
    }

    pub fn values(&self) -> impl Iterator<Item = &V> {
        self.inner.values()
    }
}

impl<K, V> SyncMap<K, V>
where
    K: Eq + Hash + std::fmt::Debug,
    V: HasRefCount,
{
    /// Bumps the count of an existing entry.
    ///
    /// Panics if the key is absent: incrementing a reference on an
    /// object that was never installed is a programmer error.
    pub fn increment_ref(&mut self, key: &K) -> u32 {
        match self.inner.get_mut(key) {
            Some(entry) => entry.increment_ref(),
            None => panic!("reference increment on missing entry {:?}", key),
        }
    }

    /// Drops one reference of an existing entry.
    ///
    /// Panics on a missing key or on underflow.
    pub fn decrement_ref(&mut self, key: &K) -> u32 {
        match self.inner.get_mut(key) {
            Some(entry) => entry
                .decrement_ref()
                .unwrap_or_else(|| panic!("reference underflow on entry {:?}", key)),
            None => panic!("reference decrement on missing entry {:?}", key),
        }
    }

    pub fn ref_count(&self, key: &K) -> Option<u32> {
        self.inner.get(key).map(|e| e.ref_count())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Entry {
        refs: u32,
    }

    impl HasRefCount for Entry {
        fn increment_ref(&mut self) -> u32 {
            self.refs += 1;
            self.refs
        }

        fn decrement_ref(&mut self) -> Option<u32> {
            self.refs.checked_sub(1).map(|n| {
                self.refs = n;
                n
            })
        }

        fn ref_count(&self) -> u32 {
            self.refs
        }
    }

    #[test]
    fn test_get_never_creates() {
        let mut map: SyncMap<String, Entry> = SyncMap::new();
        assert!(map.get(&"k".to_string()).is_none());
        assert!(map.get_mut(&"k".to_string()).is_none());
        assert!(map.is_empty());
    }

    #[test]
    fn test_ref_counting() {
        let mut map: SyncMap<String, Entry> = SyncMap::new();
        map.insert("k".to_string(), Entry { refs: 0 });

        assert_eq!(map.increment_ref(&"k".to_string()), 1);
        assert_eq!(map.increment_ref(&"k".to_string()), 2);
        assert_eq!(map.decrement_ref(&"k".to_string()), 1);
        assert_eq!(map.ref_count(&"k".to_string()), Some(1));
    }

    #[test]
    #[should_panic(expected = "missing entry")]
    fn test_increment_missing_panics() {
        let mut map: SyncMap<String, Entry> = SyncMap::new();
        map.increment_ref(&"k".to_string());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn test_underflow_panics() {
        let mut map: SyncMap<String, Entry> = SyncMap::new();
        map.insert("k".to_string(), Entry { refs: 0 });
        map.decrement_ref(&"k".to_string());
    }
}
