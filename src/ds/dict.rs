//! Dict
//!
//! Hash table used for the keyspace, large sets, large hashes and the
//! member index of sorted sets. A thin wrapper over the standard
//! `HashMap` that additionally exposes the bookkeeping numbers the memory
//! estimator needs: bucket-array length and per-entry overhead.

use std::collections::HashMap;
use std::hash::Hash;

/// Hash table with size-introspection hooks.
#[derive(Debug, Clone, Default)]
pub struct Dict<K, V> {
    map: HashMap<K, V>,
}

impl<K: Eq + Hash, V> Dict<K, V> {
    pub fn new() -> Self {
        Self {
            map: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Inserts a key/value pair, returning the previous value if any.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        self.map.insert(key, value)
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        self.map.get(key)
    }

    pub fn get_mut(&mut self, key: &K) -> Option<&mut V> {
        self.map.get_mut(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.map.contains_key(key)
    }

    pub fn remove(&mut self, key: &K) -> Option<V> {
        self.map.remove(key)
    }

    pub fn clear(&mut self) {
        self.map.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.map.iter()
    }

    /// Length of the bucket array backing the table.
    ///
    /// The standard table does not expose its raw bucket count, so this
    /// reports the capacity rounded up to a power of two, which is how the
    /// buckets grow.
    pub fn slots(&self) -> usize {
        let cap = self.map.capacity();
        if cap == 0 {
            0
        } else {
            cap.next_power_of_two()
        }
    }

    /// Fixed bookkeeping bytes one entry costs beyond its key and value
    /// payloads: the stored pair plus hash/control metadata.
    pub fn entry_overhead() -> usize {
        std::mem::size_of::<(K, V)>() + std::mem::size_of::<u64>()
    }

    /// Bytes spent on the bucket array itself.
    pub fn bucket_bytes(&self) -> usize {
        self.slots() * std::mem::size_of::<usize>()
    }
}
