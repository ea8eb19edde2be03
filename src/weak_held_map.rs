//! WeakHeldMap: insertion-ordered map whose object values are held weakly.

use crate::ordered_table::{Cursor, OrderedTable};
use crate::reclaim::Reclaimer;
use crate::tracker::{Slot, Tracked};
use crate::value::Value;
use core::borrow::Borrow;
use core::cell::{Cell, RefCell};
use core::fmt;
use core::hash::{BuildHasher, Hash};
use std::collections::hash_map::RandomState;
use std::rc::{Rc, Weak};

type Table<K, T, P, S> = OrderedTable<K, Slot<T, P>, S>;

/// State shared with the cleanups the map registers.
struct Shared<K, T, P, S> {
    table: RefCell<Table<K, T, P, S>>,
    // Set by a cleanup that found `table` borrowed.
    needs_purge: Cell<bool>,
}

/// Ordered map from `K` to [`Value<T, P>`].
///
/// Object values are stored as `Weak<T>`; once the caller drops the last
/// `Rc`, the entry reads as absent and is purged on the next
/// [`Reclaimer::collect`] (or earlier, by `delete`, `set`, `clear` or
/// `purge`). Keys and primitive values are held strongly.
///
/// Every method takes `&self`, so callbacks and iterator loops may mutate
/// the map they are walking.
pub struct WeakHeldMap<K, T, P = (), S = RandomState> {
    inner: Rc<Shared<K, T, P, S>>,
    reclaimer: Reclaimer,
}

impl<K, T, P> WeakHeldMap<K, T, P>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }

    pub fn with_reclaimer(reclaimer: &Reclaimer) -> Self {
        Self::with_hasher_in(Default::default(), reclaimer)
    }
}

impl<K, T, P> Default for WeakHeldMap<K, T, P>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, T, P, S> WeakHeldMap<K, T, P, S>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    pub fn with_hasher(hasher: S) -> Self {
        Self::with_hasher_in(hasher, &Reclaimer::current())
    }

    pub fn with_hasher_in(hasher: S, reclaimer: &Reclaimer) -> Self {
        Self {
            inner: Rc::new(Shared {
                table: RefCell::new(OrderedTable::with_hasher(hasher)),
                needs_purge: Cell::new(false),
            }),
            reclaimer: reclaimer.clone(),
        }
    }

    /// Build a map by `set`-ing each pair in order, tracking objects with
    /// `reclaimer`.
    pub fn from_iter_in<I>(iter: I, reclaimer: &Reclaimer) -> Self
    where
        I: IntoIterator<Item = (K, Value<T, P>)>,
    {
        let map = Self::with_hasher_in(S::default(), reclaimer);
        for (k, v) in iter {
            map.set(k, v);
        }
        map
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Stored rows, counting entries whose object was reclaimed but not
    /// yet purged.
    pub fn len(&self) -> usize {
        self.inner.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.borrow().is_empty()
    }

    /// Store `value` under `key`, replacing any previous value in place.
    pub fn set(&self, key: K, value: Value<T, P>) -> &Self {
        self.sweep_if_flagged();
        // The old object's cleanup targets this key; cancel it before the
        // key can hold anything new.
        let previous = {
            let table = self.inner.table.borrow();
            table
                .find(&key)
                .and_then(|h| table.get(h))
                .and_then(|(_, slot)| slot.registration())
        };
        if let Some(registration) = previous {
            self.reclaimer.unregister(registration);
        }

        let slot = match value {
            Value::Object(object) => {
                let cleanup = purge_on_reclaim(Rc::downgrade(&self.inner), key.clone());
                Slot::Wrapped(Tracked::track(&object, &self.reclaimer, cleanup))
            }
            Value::Primitive(p) => Slot::Raw(p),
        };
        // A rejected duplicate key and the displaced slot both drop here,
        // after the table borrow.
        let (_, replaced) = self.inner.table.borrow_mut().insert(key, slot);
        drop(replaced);
        self
    }

    pub fn get<Q>(&self, key: &Q) -> Option<Value<T, P>>
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.inner.table.borrow();
        let h = table.find(key)?;
        table.get(h).and_then(|(_, slot)| slot.load())
    }

    /// True when `key` was set and its value is still alive. A primitive
    /// counts even when it is the unit/"nothing" marker.
    pub fn has<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        let table = self.inner.table.borrow();
        table
            .find(key)
            .and_then(|h| table.get(h))
            .map_or(false, |(_, slot)| slot.is_live())
    }

    /// Remove `key`. For an object value, returns whether the object was
    /// still alive; a reclaimed-but-unpurged row is removed and reports
    /// `false`.
    pub fn delete<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: ?Sized + Hash + Eq,
    {
        self.sweep_if_flagged();
        let removed = self.inner.table.borrow_mut().remove_key(key);
        match removed {
            None => false,
            Some((_, Slot::Wrapped(tracked))) => tracked.untrack(&self.reclaimer),
            Some((_, Slot::Raw(_))) => true,
        }
    }

    pub fn clear(&self) {
        self.inner.needs_purge.set(false);
        let drained = self.inner.table.borrow_mut().drain();
        for registration in drained.iter().filter_map(|(_, slot)| slot.registration()) {
            self.reclaimer.unregister(registration);
        }
        drop(drained);
    }

    /// Remove rows whose object is gone without waiting for the reclaimer,
    /// returning how many were removed.
    pub fn purge(&self) -> usize {
        self.inner.needs_purge.set(false);
        let removed = self.inner.table.borrow_mut().retain(|_, slot| slot.is_live());
        for registration in removed.iter().filter_map(|(_, slot)| slot.registration()) {
            self.reclaimer.unregister(registration);
        }
        if !removed.is_empty() {
            log::debug!("weak map: purged {} reclaimed entries", removed.len());
        }
        removed.len()
    }

    /// Finish the purge a busy cleanup had to skip.
    fn sweep_if_flagged(&self) {
        if self.inner.needs_purge.get() {
            self.purge();
        }
    }

    /// Call `f(value, key, map)` for each live entry in order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Value<T, P>, K, &Self),
    {
        for (key, value) in self.iter() {
            f(value, key, self);
        }
    }

    /// Live `(key, value)` pairs in insertion order.
    pub fn iter(&self) -> Iter<'_, K, T, P, S> {
        Iter {
            map: self,
            cursor: None,
        }
    }

    pub fn entries(&self) -> Iter<'_, K, T, P, S> {
        self.iter()
    }

    pub fn keys(&self) -> Keys<'_, K, T, P, S> {
        Keys { inner: self.iter() }
    }

    pub fn values(&self) -> Values<'_, K, T, P, S> {
        Values { inner: self.iter() }
    }
}

/// Cleanup run by the reclaimer: drop `key`'s row if it still holds a dead
/// handle. A missing row, a live replacement or a dropped map leave things
/// as they are; a busy map is flagged for a sweep on its next mutation.
fn purge_on_reclaim<K, T, P, S>(
    inner: Weak<Shared<K, T, P, S>>,
    key: K,
) -> impl FnOnce() + 'static
where
    K: Eq + Hash + 'static,
    T: 'static,
    P: 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let removed = match inner.table.try_borrow_mut() {
            Ok(mut table) => match table.find(&key) {
                Some(h) if table.get(h).map_or(false, |(_, slot)| !slot.is_live()) => {
                    table.remove(h)
                }
                _ => None,
            },
            Err(_) => {
                log::debug!("weak map: busy during cleanup, sweep deferred to next mutation");
                inner.needs_purge.set(true);
                None
            }
        };
        if removed.is_some() {
            log::trace!("weak map: purged reclaimed entry");
        }
        drop(removed);
    }
}

impl<K, T, P, S> Drop for WeakHeldMap<K, T, P, S> {
    fn drop(&mut self) {
        let registrations: Vec<_> = match self.inner.table.try_borrow() {
            Ok(table) => table
                .iter()
                .filter_map(|(_, _, slot)| slot.registration())
                .collect(),
            Err(_) => return,
        };
        for registration in registrations {
            self.reclaimer.unregister(registration);
        }
    }
}

/// Lazy walk over live entries. Each step re-reads the map, so entries
/// removed ahead of the cursor are skipped and appended ones are visited.
pub struct Iter<'a, K, T, P, S> {
    map: &'a WeakHeldMap<K, T, P, S>,
    cursor: Option<Cursor>,
}

impl<K, T, P, S> Iterator for Iter<'_, K, T, P, S>
where
    K: Clone,
    P: Clone,
{
    type Item = (K, Value<T, P>);

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.map.inner.table.borrow();
        loop {
            let (cursor, h) = table.next_after(self.cursor)?;
            self.cursor = Some(cursor);
            if let Some((key, slot)) = table.get(h) {
                if let Some(value) = slot.load() {
                    return Some((key.clone(), value));
                }
            }
        }
    }
}

pub struct Keys<'a, K, T, P, S> {
    inner: Iter<'a, K, T, P, S>,
}

impl<K: Clone, T, P: Clone, S> Iterator for Keys<'_, K, T, P, S> {
    type Item = K;

    fn next(&mut self) -> Option<K> {
        self.inner.next().map(|(k, _)| k)
    }
}

pub struct Values<'a, K, T, P, S> {
    inner: Iter<'a, K, T, P, S>,
}

impl<K: Clone, T, P: Clone, S> Iterator for Values<'_, K, T, P, S> {
    type Item = Value<T, P>;

    fn next(&mut self) -> Option<Value<T, P>> {
        self.inner.next().map(|(_, v)| v)
    }
}

impl<'a, K, T, P, S> IntoIterator for &'a WeakHeldMap<K, T, P, S>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    type Item = (K, Value<T, P>);
    type IntoIter = Iter<'a, K, T, P, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K, T, P, S> FromIterator<(K, Value<T, P>)> for WeakHeldMap<K, T, P, S>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    fn from_iter<I: IntoIterator<Item = (K, Value<T, P>)>>(iter: I) -> Self {
        Self::from_iter_in(iter, &Reclaimer::current())
    }
}

impl<K, T, P, S> Extend<(K, Value<T, P>)> for WeakHeldMap<K, T, P, S>
where
    K: Eq + Hash + Clone + 'static,
    T: 'static,
    P: Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    fn extend<I: IntoIterator<Item = (K, Value<T, P>)>>(&mut self, iter: I) {
        for (k, v) in iter {
            self.set(k, v);
        }
    }
}

impl<K, T, P, S> fmt::Debug for WeakHeldMap<K, T, P, S>
where
    K: fmt::Debug + Clone,
    T: fmt::Debug,
    P: fmt::Debug + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(Iter {
                map: self,
                cursor: None,
            })
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Invariant: a cleanup that finds the map borrowed leaves the dead row
    /// alone instead of panicking; reads still treat it as absent.
    #[test]
    fn cleanup_degrades_when_map_is_busy() {
        let r = Reclaimer::new();
        let map: WeakHeldMap<&str, i32> = WeakHeldMap::with_reclaimer(&r);
        map.set("k", Value::object(1));

        {
            let _busy = map.inner.table.borrow_mut();
            assert_eq!(r.collect(), 1);
        }
        assert_eq!(map.len(), 1);
        assert!(!map.has("k"));
        assert_eq!(map.purge(), 1);
        assert!(map.is_empty());
    }

    /// Invariant: a cleanup skipped because the map was busy is finished by
    /// the next `set` or `delete`, without the caller calling `purge`.
    #[test]
    fn busy_cleanup_is_swept_by_next_mutation() {
        let r = Reclaimer::new();
        let map: WeakHeldMap<&str, i32> = WeakHeldMap::with_reclaimer(&r);
        map.set("dead", Value::object(1));
        {
            let _busy = map.inner.table.borrow_mut();
            assert_eq!(r.collect(), 1);
        }
        assert!(map.inner.needs_purge.get());
        assert_eq!(map.len(), 1);

        map.set("fresh", Value::Primitive(()));
        assert!(!map.inner.needs_purge.get());
        assert_eq!(map.keys().collect::<Vec<_>>(), ["fresh"]);
        assert_eq!(map.len(), 1);

        map.set("dead2", Value::object(2));
        {
            let _busy = map.inner.table.borrow_mut();
            assert_eq!(r.collect(), 1);
        }
        assert!(!map.delete("unrelated"));
        assert_eq!(map.len(), 1);
        assert!(r.is_empty());
    }

    /// Invariant: a cleanup that outlives its map does nothing.
    #[test]
    fn cleanup_after_map_drop_is_noop() {
        let r = Reclaimer::new();
        let map: WeakHeldMap<&str, i32> = WeakHeldMap::with_reclaimer(&r);
        let obj = Rc::new(3);
        map.set("k", Value::Object(obj.clone()));
        let cleanup = purge_on_reclaim(Rc::downgrade(&map.inner), "k");
        drop(map);
        assert!(r.is_empty(), "dropping the map cancels its registrations");
        drop(obj);
        cleanup();
        assert_eq!(r.collect(), 0);
    }
}
