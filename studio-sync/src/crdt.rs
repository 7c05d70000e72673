//! State-based CRDT primitives: last-writer-wins map/register and an
//! append-only log.
//!
//! Merge is a pure function of the two stamped values ([`resolve`]), which
//! makes it commutative, associative and idempotent:
//!
//! ```text
//!   local  ──┐
//!            ├── resolve(local, remote) ──► KeepLocal | TakeRemote
//!   remote ──┘        (stamp order only, never wall-clock)
//! ```
//!
//! Deletes are tombstones (`value: None`) so a late-arriving stale write can
//! never resurrect a removed key.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::clock::Stamp;

/// A stamped value. `None` marks a deleted key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<V> {
    pub stamp: Stamp,
    pub value: Option<V>,
}

impl<V> Versioned<V> {
    pub fn live(stamp: Stamp, value: V) -> Self {
        Self { stamp, value: Some(value) }
    }

    pub fn tombstone(stamp: Stamp) -> Self {
        Self { stamp, value: None }
    }

    pub fn is_tombstone(&self) -> bool {
        self.value.is_none()
    }
}

/// Outcome of merging one remote entry against the local one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    KeepLocal,
    TakeRemote,
}

/// Last-writer-wins rule: the higher stamp wins, equal stamps are the same write.
pub fn resolve<V>(local: Option<&Versioned<V>>, remote: &Versioned<V>) -> Resolution {
    match local {
        None => Resolution::TakeRemote,
        Some(current) if remote.stamp > current.stamp => Resolution::TakeRemote,
        Some(_) => Resolution::KeepLocal,
    }
}

/// Map with an independent LWW register per key.
#[derive(Debug, Clone, PartialEq)]
pub struct LwwMap<K: Ord, V> {
    entries: BTreeMap<K, Versioned<V>>,
}

impl<K: Ord + Clone, V: Clone> LwwMap<K, V> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Live value for `key`.
    pub fn get(&self, key: &K) -> Option<&V> {
        self.entries.get(key).and_then(|e| e.value.as_ref())
    }

    /// Raw entry for `key`, tombstones included.
    pub fn entry(&self, key: &K) -> Option<&Versioned<V>> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.get(key).is_some()
    }

    /// Write locally. Returns the entry that was replaced.
    pub fn set(&mut self, key: K, value: V, stamp: Stamp) -> Option<Versioned<V>> {
        self.entries.insert(key, Versioned::live(stamp, value))
    }

    /// Delete locally by writing a tombstone. Returns the replaced entry.
    pub fn remove(&mut self, key: K, stamp: Stamp) -> Option<Versioned<V>> {
        self.entries.insert(key, Versioned::tombstone(stamp))
    }

    /// Merge a remote entry. Returns `true` if local state changed.
    pub fn merge(&mut self, key: K, remote: Versioned<V>) -> bool {
        match resolve(self.entries.get(&key), &remote) {
            Resolution::TakeRemote => {
                self.entries.insert(key, remote);
                true
            }
            Resolution::KeepLocal => false,
        }
    }

    /// Live key/value pairs in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> {
        self.entries
            .iter()
            .filter_map(|(k, e)| e.value.as_ref().map(|v| (k, v)))
    }

    /// Every entry including tombstones (snapshot encoding).
    pub fn entries(&self) -> impl Iterator<Item = (&K, &Versioned<V>)> {
        self.entries.iter()
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<K: Ord + Clone, V: Clone> Default for LwwMap<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Single LWW slot.
#[derive(Debug, Clone, PartialEq)]
pub struct LwwRegister<V> {
    entry: Option<Versioned<V>>,
}

impl<V: Clone> LwwRegister<V> {
    pub fn new() -> Self {
        Self { entry: None }
    }

    pub fn get(&self) -> Option<&V> {
        self.entry.as_ref().and_then(|e| e.value.as_ref())
    }

    pub fn entry(&self) -> Option<&Versioned<V>> {
        self.entry.as_ref()
    }

    pub fn set(&mut self, value: V, stamp: Stamp) -> Option<Versioned<V>> {
        self.entry.replace(Versioned::live(stamp, value))
    }

    pub fn merge(&mut self, remote: Versioned<V>) -> bool {
        match resolve(self.entry.as_ref(), &remote) {
            Resolution::TakeRemote => {
                self.entry = Some(remote);
                true
            }
            Resolution::KeepLocal => false,
        }
    }

    pub fn clear(&mut self) {
        self.entry = None;
    }
}

impl<V: Clone> Default for LwwRegister<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Grow-only log ordered by stamp. Concurrent appends interleave
/// deterministically and never overwrite each other.
#[derive(Debug, Clone, PartialEq)]
pub struct AppendLog<T> {
    entries: BTreeMap<Stamp, T>,
}

impl<T: Clone> AppendLog<T> {
    pub fn new() -> Self {
        Self { entries: BTreeMap::new() }
    }

    /// Append (or merge) an entry. Returns `true` if it was new.
    pub fn insert(&mut self, stamp: Stamp, item: T) -> bool {
        if self.entries.contains_key(&stamp) {
            return false;
        }
        self.entries.insert(stamp, item);
        true
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Stamp, &T)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }
}

impl<T: Clone> Default for AppendLog<T> {
    fn default() -> Self {
        Self::new()
    }
}
