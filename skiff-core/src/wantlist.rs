//! Per-peer wantlist
//!
//! The set of keys a peer is trying to obtain, each tagged with a priority.
//! At most one entry exists per key; re-adding a key updates its priority.

use cid::Cid;
use std::collections::HashMap;

/// A single want: a key and the priority the peer assigned to it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Entry {
    pub key: Cid,
    pub priority: i32,
}

/// Set of entries keyed by block CID
#[derive(Clone, Debug, Default)]
pub struct Wantlist {
    set: HashMap<Cid, Entry>,
}

impl Wantlist {
    pub fn new() -> Self {
        Self {
            set: HashMap::new(),
        }
    }

    /// Upsert an entry. Returns the prior priority if the key was already
    /// wanted.
    pub fn add(&mut self, key: Cid, priority: i32) -> Option<i32> {
        self.set
            .insert(key, Entry { key, priority })
            .map(|prev| prev.priority)
    }

    /// Remove an entry. Returns whether it was present.
    pub fn remove(&mut self, key: &Cid) -> bool {
        self.set.remove(key).is_some()
    }

    /// Look up the entry for a key
    pub fn contains(&self, key: &Cid) -> Option<&Entry> {
        self.set.get(key)
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Entry> {
        self.set.values()
    }

    /// Entries in descending priority order, ties broken by ascending key
    /// bytes. Sorts on demand; callers are diagnostic and low-frequency.
    pub fn sorted_entries(&self) -> Vec<Entry> {
        let mut entries: Vec<Entry> = self.set.values().cloned().collect();
        entries.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then_with(|| a.key.to_bytes().cmp(&b.key.to_bytes()))
        });
        entries
    }
}
