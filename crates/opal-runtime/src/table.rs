//! String-keyed hash table
//!
//! Open addressing with linear probing, a 0.75 load factor, and capacity
//! doubling from 8. Keys are interned-string handles compared by identity;
//! each entry caches the key's precomputed FNV-1a hash so probing and
//! rehashing never touch the heap. Deletion leaves a tombstone: tombstones
//! are reused by inserts but probing continues past them on lookup.

use std::mem;

use crate::heap::ObjRef;
use crate::value::Value;

const INITIAL_CAPACITY: usize = 8;
const MAX_LOAD_NUMERATOR: usize = 3;
const MAX_LOAD_DENOMINATOR: usize = 4;

#[derive(Debug, Clone, PartialEq)]
enum Entry {
    Empty,
    Tombstone,
    Full { key: ObjRef, hash: u32, value: Value },
}

/// Open-addressed hash map from interned strings to values
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Table {
    /// Occupied + tombstone entries (tombstones count toward load)
    count: usize,
    entries: Vec<Entry>,
}

impl Table {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live key/value pairs
    pub fn len(&self) -> usize {
        self.entries
            .iter()
            .filter(|e| matches!(e, Entry::Full { .. }))
            .count()
    }

    /// Whether the table holds no live entries
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a key by handle identity
    ///
    /// `hash` is the key's precomputed FNV-1a hash; every caller has it at
    /// hand (it lives in the string object), so lookups never re-hash.
    pub fn get(&self, key: ObjRef, hash: u32) -> Option<Value> {
        if self.count == 0 {
            return None;
        }
        match &self.entries[self.probe(key, hash)] {
            Entry::Full { value, .. } => Some(*value),
            _ => None,
        }
    }

    /// Insert or update; returns true when the key was new
    pub fn set(&mut self, key: ObjRef, hash: u32, value: Value) -> bool {
        if (self.count + 1) * MAX_LOAD_DENOMINATOR
            > self.entries.len() * MAX_LOAD_NUMERATOR
        {
            self.grow();
        }

        let index = self.probe_for_insert(key, hash);
        let entry = &mut self.entries[index];
        let is_new = !matches!(entry, Entry::Full { .. });
        // A reused tombstone was already counted toward the load factor
        if matches!(entry, Entry::Empty) {
            self.count += 1;
        }
        *entry = Entry::Full { key, hash, value };
        is_new
    }

    /// Remove a key, leaving a tombstone; returns true when it was present
    pub fn delete(&mut self, key: ObjRef, hash: u32) -> bool {
        if self.count == 0 {
            return false;
        }
        let index = self.probe(key, hash);
        match self.entries[index] {
            Entry::Full { .. } => {
                self.entries[index] = Entry::Tombstone;
                true
            }
            _ => false,
        }
    }

    /// Copy every live entry of `other` into `self` (used for inheritance)
    pub fn extend_from(&mut self, other: &Table) {
        for entry in &other.entries {
            if let Entry::Full { key, hash, value } = entry {
                self.set(*key, *hash, *value);
            }
        }
    }

    /// Iterate live key/value pairs
    pub fn iter(&self) -> impl Iterator<Item = (ObjRef, Value)> + '_ {
        self.entries.iter().filter_map(|e| match e {
            Entry::Full { key, value, .. } => Some((*key, *value)),
            _ => None,
        })
    }

    /// Drop every entry whose key fails the predicate
    ///
    /// The heap uses this to clean the weak intern table before sweeping.
    pub fn retain_keys(&mut self, mut keep: impl FnMut(ObjRef) -> bool) {
        for entry in &mut self.entries {
            if let Entry::Full { key, .. } = entry {
                if !keep(*key) {
                    *entry = Entry::Tombstone;
                }
            }
        }
    }

    /// Content-keyed lookup, used only by the string intern table
    ///
    /// `matches` receives candidate keys whose cached hash equals `hash`
    /// and decides byte equality; every other table compares by identity.
    pub fn find_string(
        &self,
        hash: u32,
        mut matches: impl FnMut(ObjRef) -> bool,
    ) -> Option<ObjRef> {
        if self.count == 0 {
            return None;
        }
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match &self.entries[index] {
                Entry::Empty => return None,
                Entry::Tombstone => {}
                Entry::Full {
                    key, hash: entry_hash, ..
                } => {
                    if *entry_hash == hash && matches(*key) {
                        return Some(*key);
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Approximate footprint of the entry storage, for GC accounting
    pub fn byte_size(&self) -> usize {
        self.entries.capacity() * mem::size_of::<Entry>()
    }

    /// Find the slot holding `key`, or the first empty slot of its probe
    /// sequence. Only valid when the table is non-empty.
    fn probe(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        loop {
            match &self.entries[index] {
                Entry::Empty => return index,
                Entry::Tombstone => {}
                Entry::Full { key: k, .. } => {
                    if *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    /// Like `probe`, but remembers the first tombstone so inserts reuse it
    fn probe_for_insert(&self, key: ObjRef, hash: u32) -> usize {
        let mask = self.entries.len() - 1;
        let mut index = hash as usize & mask;
        let mut tombstone = None;
        loop {
            match &self.entries[index] {
                Entry::Empty => return tombstone.unwrap_or(index),
                Entry::Tombstone => {
                    if tombstone.is_none() {
                        tombstone = Some(index);
                    }
                }
                Entry::Full { key: k, .. } => {
                    if *k == key {
                        return index;
                    }
                }
            }
            index = (index + 1) & mask;
        }
    }

    fn grow(&mut self) {
        let new_capacity = if self.entries.is_empty() {
            INITIAL_CAPACITY
        } else {
            self.entries.len() * 2
        };
        let old = mem::replace(&mut self.entries, vec![Entry::Empty; new_capacity]);
        self.count = 0;
        for entry in old {
            if let Entry::Full { key, hash, value } = entry {
                let mask = self.entries.len() - 1;
                let mut index = hash as usize & mask;
                while matches!(self.entries[index], Entry::Full { .. }) {
                    index = (index + 1) & mask;
                }
                self.entries[index] = Entry::Full { key, hash, value };
                self.count += 1;
            }
        }
    }
}
