//! The hashed collection types (`set` and `frozenset`).
//!
//! Both share [`SetStorage`], the same bucket-table-plus-dense-entries
//! design as `Dict` minus the values. `frozenset` is the immutable,
//! hashable wrapper.

use hashbrown::HashTable;

use crate::{heap::HeapId, value::Value};

#[derive(Debug)]
struct SetEntry {
    key: Value,
    hash: u64,
}

/// Hash-bucketed unique collection, insertion-ordered for iteration.
#[derive(Debug, Default)]
pub struct SetStorage {
    indices: HashTable<usize>,
    entries: Vec<SetEntry>,
}

impl SetStorage {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn find_index(&self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<usize> {
        self.indices
            .find(key_hash, |&idx| self.entries[idx].hash == key_hash && eq(&self.entries[idx].key))
            .copied()
    }

    /// Adds a member; returns the key back if it was already present (the
    /// caller releases the duplicate).
    pub fn add(&mut self, key: Value, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<Value> {
        if self.find_index(key_hash, eq).is_some() {
            return Some(key);
        }
        let idx = self.entries.len();
        self.entries.push(SetEntry { key, hash: key_hash });
        self.indices.insert_unique(key_hash, idx, |&i| self.entries[i].hash);
        None
    }

    #[must_use]
    pub fn contains(&self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> bool {
        self.find_index(key_hash, eq).is_some()
    }

    /// Removes a member, returning it for release.
    pub fn remove(&mut self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<Value> {
        let idx = self.find_index(key_hash, eq)?;
        if let Ok(occupied) = self.indices.find_entry(key_hash, |&i| i == idx) {
            occupied.remove();
        }
        let entry = self.entries.remove(idx);
        for slot in self.indices.iter_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        Some(entry.key)
    }

    /// Members in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Value> + Clone {
        self.entries.iter().map(|e| &e.key)
    }

    /// Member hashes, for frozenset hashing and fast copies.
    pub fn iter_with_hash(&self) -> impl Iterator<Item = (&Value, u64)> {
        self.entries.iter().map(|e| (&e.key, e.hash))
    }

    pub fn drain_entries(&mut self) -> Vec<Value> {
        self.indices.clear();
        self.entries.drain(..).map(|e| e.key).collect()
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for entry in &self.entries {
            if let Value::Ref(id) = &entry.key {
                out.push(*id);
            }
        }
    }
}

/// Mutable set.
#[derive(Debug, Default)]
pub struct Set(pub SetStorage);

impl Set {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_eq(expected: i64) -> impl Fn(&Value) -> bool {
        move |v| matches!(v, Value::Int(i) if *i == expected)
    }

    #[test]
    fn add_is_idempotent() {
        let mut storage = SetStorage::new();
        assert!(storage.add(Value::Int(3), 3, int_eq(3)).is_none());
        assert!(storage.add(Value::Int(3), 3, int_eq(3)).is_some());
        assert_eq!(storage.len(), 1);
        assert!(storage.contains(3, int_eq(3)));
    }

    #[test]
    fn remove_keeps_remaining_lookups() {
        let mut storage = SetStorage::new();
        for i in 0..4 {
            storage.add(Value::Int(i), i as u64, int_eq(i));
        }
        assert!(storage.remove(1, int_eq(1)).is_some());
        assert!(storage.contains(3, int_eq(3)));
        assert!(!storage.contains(1, int_eq(1)));
        assert_eq!(storage.len(), 3);
    }
}
