//! The insertion-ordered mapping type.
//!
//! Storage couples a `hashbrown::HashTable<usize>` (hash buckets mapping
//! to entry indices) with a dense `Vec<DictEntry>` that preserves
//! insertion order, giving O(1) average lookup and ordered iteration.
//!
//! The struct itself knows nothing about the heap: key hashes are
//! precomputed by the caller, and key equality arrives as a closure. This
//! keeps dict logic usable while the dict is temporarily detached from its
//! heap slot (the take/restore pattern the VM uses for container ops).

use hashbrown::HashTable;

use crate::{heap::HeapId, value::Value};

#[derive(Debug)]
struct DictEntry {
    key: Value,
    value: Value,
    /// Kept so the table can rehash without recomputing value hashes.
    hash: u64,
}

/// Mutable insertion-ordered mapping.
#[derive(Debug, Default)]
pub struct Dict {
    indices: HashTable<usize>,
    entries: Vec<DictEntry>,
}

impl Dict {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            indices: HashTable::with_capacity(capacity),
            entries: Vec::with_capacity(capacity),
        }
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

    /// Inserts or replaces.
    ///
    /// On replacement, returns `(old_value, new_key)` — the caller owns
    /// both and must release them (the dict keeps its original key, per
    /// mapping semantics).
    pub fn insert(
        &mut self,
        key: Value,
        key_hash: u64,
        value: Value,
        eq: impl Fn(&Value) -> bool,
    ) -> Option<(Value, Value)> {
        if let Some(idx) = self.find_index(key_hash, eq) {
            let old = std::mem::replace(&mut self.entries[idx].value, value);
            return Some((old, key));
        }
        let idx = self.entries.len();
        self.entries.push(DictEntry {
            key,
            value,
            hash: key_hash,
        });
        self.indices
            .insert_unique(key_hash, idx, |&i| self.entries[i].hash);
        None
    }

    /// Looks up a value by precomputed hash and equality witness.
    #[must_use]
    pub fn get(&self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<&Value> {
        self.find_index(key_hash, eq).map(|idx| &self.entries[idx].value)
    }

    #[must_use]
    pub fn get_mut(&mut self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<&mut Value> {
        let idx = self.find_index(key_hash, eq)?;
        Some(&mut self.entries[idx].value)
    }

    #[must_use]
    pub fn contains(&self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> bool {
        self.find_index(key_hash, eq).is_some()
    }

    /// Removes an entry, preserving the order of the rest.
    ///
    /// Returns `(key, value)` for the caller to release. Removal is O(n)
    /// because later entry indices shift down; mapping mutation is rare
    /// compared to lookup.
    pub fn remove(&mut self, key_hash: u64, eq: impl Fn(&Value) -> bool) -> Option<(Value, Value)> {
        let idx = self.find_index(key_hash, eq)?;
        Some(self.remove_at(idx, key_hash))
    }

    fn remove_at(&mut self, idx: usize, key_hash: u64) -> (Value, Value) {
        let entry_hash = key_hash;
        if let Ok(occupied) = self
            .indices
            .find_entry(entry_hash, |&i| i == idx)
        {
            occupied.remove();
        }
        let entry = self.entries.remove(idx);
        // Entries after the removed one shifted down by one.
        for slot in self.indices.iter_mut() {
            if *slot > idx {
                *slot -= 1;
            }
        }
        (entry.key, entry.value)
    }

    /// Removes and returns the most recently inserted pair.
    pub fn pop_last(&mut self) -> Option<(Value, Value)> {
        let idx = self.entries.len().checked_sub(1)?;
        let hash = self.entries[idx].hash;
        Some(self.remove_at(idx, hash))
    }

    /// Entries in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&Value, &Value)> {
        self.entries.iter().map(|e| (&e.key, &e.value))
    }

    /// Entries with their stored hashes, for copies that skip rehashing.
    pub fn iter_with_hash(&self) -> impl Iterator<Item = (&Value, &Value, u64)> {
        self.entries.iter().map(|e| (&e.key, &e.value, e.hash))
    }

    /// Drains all entries, releasing storage.
    pub fn drain_entries(&mut self) -> Vec<(Value, Value)> {
        self.indices.clear();
        self.entries.drain(..).map(|e| (e.key, e.value)).collect()
    }

    pub fn collect_refs(&self, out: &mut Vec<HeapId>) {
        for entry in &self.entries {
            if let Value::Ref(id) = &entry.key {
                out.push(*id);
            }
            if let Value::Ref(id) = &entry.value {
                out.push(*id);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn int_eq(expected: i64) -> impl Fn(&Value) -> bool {
        move |v| matches!(v, Value::Int(i) if *i == expected)
    }

    #[test]
    fn insert_get_remove() {
        let mut dict = Dict::new();
        assert!(dict.insert(Value::Int(1), 1, Value::Int(10), int_eq(1)).is_none());
        assert!(dict.insert(Value::Int(2), 2, Value::Int(20), int_eq(2)).is_none());
        assert!(matches!(dict.get(1, int_eq(1)), Some(Value::Int(10))));

        let replaced = dict.insert(Value::Int(1), 1, Value::Int(11), int_eq(1));
        assert!(matches!(replaced, Some((Value::Int(10), Value::Int(1)))));

        let removed = dict.remove(1, int_eq(1)).unwrap();
        assert!(matches!(removed, (Value::Int(1), Value::Int(11))));
        assert_eq!(dict.len(), 1);
        assert!(matches!(dict.get(2, int_eq(2)), Some(Value::Int(20))));
    }

    #[test]
    fn iteration_preserves_insertion_order_across_removal() {
        let mut dict = Dict::new();
        for i in 0..5 {
            dict.insert(Value::Int(i), i as u64, Value::Int(i * 10), int_eq(i));
        }
        dict.remove(2, int_eq(2));
        let keys: Vec<i64> = dict
            .iter()
            .map(|(k, _)| match k {
                Value::Int(i) => *i,
                _ => unreachable!(),
            })
            .collect();
        assert_eq!(keys, vec![0, 1, 3, 4]);
        // Lookups still work after index fixup.
        assert!(matches!(dict.get(4, int_eq(4)), Some(Value::Int(40))));
    }
}
