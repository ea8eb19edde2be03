//! OrderedTable: insertion-ordered hash storage with stable handles.
//!
//! Entries live in a generational `SlotMap`; a `HashTable` of slot keys
//! indexes them by key hash and a `BTreeMap` keyed by a monotonically
//! increasing sequence number records insertion order. Overwriting a key
//! keeps its sequence number, so the entry stays where it was first
//! inserted; removing and re-inserting moves it to the back.
//!
//! Lookups run user `Eq`/`Hash` code mid-probe. Debug builds record which
//! table operation is probing and panic, naming both operations, if that
//! user code calls back into the same table.

use core::borrow::Borrow;
use core::hash::{BuildHasher, Hash};
use core::ops::Bound;
use hashbrown::HashTable;
use slotmap::{DefaultKey, SlotMap};
use std::collections::hash_map::RandomState;
use std::collections::BTreeMap;

/// Stable reference to one entry. Stale handles never resolve to a newer
/// entry that happens to reuse the same slot.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct Handle(DefaultKey);

/// Position in insertion order.
///
/// A cursor stays meaningful after the entry it was taken from is removed,
/// which is what lets callers walk the table across mutations.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Cursor(u64);

#[derive(Debug)]
struct Entry<K, V> {
    key: K,
    value: V,
    hash: u64,
    seq: u64,
}

pub struct OrderedTable<K, V, S = RandomState> {
    hasher: S,
    index: HashTable<DefaultKey>,
    slots: SlotMap<DefaultKey, Entry<K, V>>,
    order: BTreeMap<u64, DefaultKey>,
    next_seq: u64,
    probing: Probing,
}

/// The operation currently running user code against this table.
#[derive(Debug, Default)]
struct Probing {
    #[cfg(debug_assertions)]
    active: core::cell::Cell<Option<&'static str>>,
}

impl Probing {
    #[inline]
    fn begin(&self, op: &'static str) -> ProbeScope<'_> {
        #[cfg(debug_assertions)]
        {
            if let Some(active) = self.active.replace(Some(op)) {
                self.active.set(Some(active));
                panic!("OrderedTable::{op} re-entered from user Eq/Hash while {active} was probing");
            }
        }
        #[cfg(not(debug_assertions))]
        let _ = op;
        ProbeScope { probing: self }
    }

    #[inline]
    fn end(&self) {
        #[cfg(debug_assertions)]
        {
            self.active.set(None);
        }
    }
}

struct ProbeScope<'a> {
    probing: &'a Probing,
}

impl Drop for ProbeScope<'_> {
    fn drop(&mut self) {
        self.probing.end();
    }
}

impl<K, V> OrderedTable<K, V>
where
    K: Eq + Hash,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }
}

impl<K, V> Default for OrderedTable<K, V>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self::new()
    }
}

/// Iterator over entries in insertion order.
pub struct Iter<'a, K, V> {
    order: std::collections::btree_map::Values<'a, u64, DefaultKey>,
    slots: &'a SlotMap<DefaultKey, Entry<K, V>>,
}

impl<'a, K, V> Iterator for Iter<'a, K, V> {
    type Item = (Handle, &'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let slots = self.slots;
        self.order.find_map(|&k| {
            slots
                .get(k)
                .map(|e| (Handle(k), &e.key, &e.value))
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.order.size_hint()
    }
}

// Accessors that never hash or compare keys. Kept free of bounds so that
// owners can reach them from `Drop`.
impl<K, V, S> OrderedTable<K, V, S> {
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn get(&self, h: Handle) -> Option<(&K, &V)> {
        let _p = self.probing.begin("get");
        self.slots.get(h.0).map(|e| (&e.key, &e.value))
    }

    /// First entry strictly after `cursor` in insertion order, or the first
    /// entry overall when `cursor` is `None`.
    pub fn next_after(&self, cursor: Option<Cursor>) -> Option<(Cursor, Handle)> {
        let lower = match cursor {
            Some(Cursor(seq)) => Bound::Excluded(seq),
            None => Bound::Unbounded,
        };
        self.order
            .range((lower, Bound::Unbounded))
            .next()
            .map(|(&seq, &k)| (Cursor(seq), Handle(k)))
    }

    pub fn iter(&self) -> Iter<'_, K, V> {
        Iter {
            order: self.order.values(),
            slots: &self.slots,
        }
    }

    /// Unlink every entry and hand them back in insertion order. Dropping
    /// the returned pairs is left to the caller.
    pub fn drain(&mut self) -> Vec<(K, V)> {
        let _p = self.probing.begin("drain");
        self.index.clear();
        let order = core::mem::take(&mut self.order);
        let mut out = Vec::with_capacity(order.len());
        for k in order.into_values() {
            if let Some(e) = self.slots.remove(k) {
                out.push((e.key, e.value));
            }
        }
        debug_assert!(self.slots.is_empty());
        self.slots.clear();
        out
    }

    pub fn remove(&mut self, handle: Handle) -> Option<(K, V)> {
        let _p = self.probing.begin("remove");
        let k = handle.0;

        let entry = self.slots.remove(k)?;
        if let Ok(found) = self.index.find_entry(entry.hash, |&kk| kk == k) {
            found.remove();
        }
        self.order.remove(&entry.seq);

        Some((entry.key, entry.value))
    }

    /// Remove every entry for which `keep` returns false, returning the
    /// removed pairs in insertion order.
    pub fn retain<F>(&mut self, mut keep: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let doomed: Vec<Handle> = self
            .iter()
            .filter(|&(_, k, v)| !keep(k, v))
            .map(|(h, _, _)| h)
            .collect();
        doomed.into_iter().filter_map(|h| self.remove(h)).collect()
    }
}

impl<K, V, S> OrderedTable<K, V, S>
where
    K: Eq + Hash,
    S: BuildHasher + Clone + Default,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self {
            hasher,
            index: HashTable::new(),
            slots: SlotMap::with_key(),
            order: BTreeMap::new(),
            next_seq: 0,
            probing: Probing::default(),
        }
    }

    /// Hash a query the way stored keys are hashed. Pair with `find_by` when
    /// the query is not a `Borrow` of `K`.
    pub fn hash_one<Q>(&self, q: &Q) -> u64
    where
        Q: ?Sized + Hash,
    {
        let _p = self.probing.begin("hash_one");
        self.hasher.hash_one(q)
    }

    pub fn find<Q>(&self, q: &Q) -> Option<Handle>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let _p = self.probing.begin("find");
        let hash = self.hasher.hash_one(q);
        self.probe(hash, |k| k.borrow() == q)
    }

    pub fn find_by<F>(&self, hash: u64, eq: F) -> Option<Handle>
    where
        F: FnMut(&K) -> bool,
    {
        let _p = self.probing.begin("find_by");
        self.probe(hash, eq)
    }

    fn probe<F>(&self, hash: u64, mut eq: F) -> Option<Handle>
    where
        F: FnMut(&K) -> bool,
    {
        self.index
            .find(hash, |&k| self.slots.get(k).map(|e| eq(&e.key)).unwrap_or(false))
            .map(|&k| Handle(k))
    }

    /// Insert or overwrite. An overwrite keeps the stored key and position
    /// and hands back the rejected duplicate key with the displaced value,
    /// so the caller decides where both are dropped.
    pub fn insert(&mut self, key: K, value: V) -> (Handle, Option<(K, V)>) {
        let _p = self.probing.begin("insert");
        let hash = self.hasher.hash_one(&key);
        match self.index.entry(
            hash,
            |&kk| self.slots.get(kk).map(|e| e.key == key).unwrap_or(false),
            |&kk| self.slots.get(kk).map(|e| e.hash).unwrap_or(0),
        ) {
            hashbrown::hash_table::Entry::Occupied(o) => {
                let k = *o.get();
                let entry = self
                    .slots
                    .get_mut(k)
                    .expect("indexed slot must be occupied");
                let old = core::mem::replace(&mut entry.value, value);
                (Handle(k), Some((key, old)))
            }
            hashbrown::hash_table::Entry::Vacant(v) => {
                let seq = self.next_seq;
                self.next_seq += 1;
                let k = self.slots.insert(Entry {
                    key,
                    value,
                    hash,
                    seq,
                });
                let _ = v.insert(k);
                self.order.insert(seq, k);
                (Handle(k), None)
            }
        }
    }

    pub fn remove_key<Q>(&mut self, q: &Q) -> Option<(K, V)>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let h = self.find(q)?;
        self.remove(h)
    }
}
