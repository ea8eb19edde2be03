//! WeakHeldSet: insertion-ordered set whose object members are held weakly.
//!
//! Rows are keyed by [`Member`]: primitives by value, objects by allocation
//! identity. The object half of the index is the membership side-table;
//! each object row carries the [`Tracked`] handle for that object. A
//! tracked row pins its allocation through the `Weak<T>`, so an identity
//! cannot be reused by a new object while the row exists.

use crate::ordered_table::{Cursor, Handle, OrderedTable};
use crate::reclaim::Reclaimer;
use crate::tracker::Tracked;
use crate::value::{ObjectId, Value};
use core::cell::{Cell, RefCell};
use core::fmt;
use core::hash::{BuildHasher, Hash, Hasher};
use std::collections::hash_map::RandomState;
use std::rc::{Rc, Weak};

#[derive(Clone, Debug, PartialEq, Eq)]
enum Member<P> {
    Primitive(P),
    Object(ObjectId),
}

/// Borrowed lookup key. Hashes exactly like the `Member` it mirrors.
#[derive(Debug, PartialEq, Hash)]
enum MemberRef<'a, P> {
    Primitive(&'a P),
    Object(ObjectId),
}

impl<P> Member<P> {
    fn as_ref(&self) -> MemberRef<'_, P> {
        match self {
            Member::Primitive(p) => MemberRef::Primitive(p),
            Member::Object(id) => MemberRef::Object(*id),
        }
    }
}

impl<P: Hash> Hash for Member<P> {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.as_ref().hash(state)
    }
}

impl<'a, P> MemberRef<'a, P> {
    fn of<T>(value: &'a Value<T, P>) -> Self {
        match value {
            Value::Object(o) => MemberRef::Object(ObjectId::of(o)),
            Value::Primitive(p) => MemberRef::Primitive(p),
        }
    }
}

// Object rows carry their tracker; primitive rows carry nothing.
type Table<T, P, S> = OrderedTable<Member<P>, Option<Tracked<T>>, S>;

/// State shared with the cleanups the set registers.
struct Shared<T, P, S> {
    table: RefCell<Table<T, P, S>>,
    // Set by a cleanup that found `table` borrowed.
    needs_purge: Cell<bool>,
}

fn locate<T, P, S>(table: &Table<T, P, S>, query: MemberRef<'_, P>) -> Option<Handle>
where
    P: Eq + Hash,
    S: BuildHasher + Clone + Default,
{
    let hash = table.hash_one(&query);
    table.find_by(hash, |m| m.as_ref() == query)
}

fn load<T, P: Clone>(member: &Member<P>, tracked: &Option<Tracked<T>>) -> Option<Value<T, P>> {
    match (member, tracked) {
        (Member::Primitive(p), _) => Some(Value::Primitive(p.clone())),
        (Member::Object(_), Some(t)) => t.deref().map(Value::Object),
        (Member::Object(_), None) => None,
    }
}

/// Ordered set of [`Value<T, P>`] with identity-based membership for
/// objects.
///
/// Object members are stored as `Weak<T>` and vanish once the caller drops
/// the last `Rc`. Two distinct allocations with equal contents are two
/// members; adding the same `Rc` twice keeps one.
pub struct WeakHeldSet<T, P = (), S = RandomState> {
    inner: Rc<Shared<T, P, S>>,
    reclaimer: Reclaimer,
}

impl<T, P> WeakHeldSet<T, P>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
{
    pub fn new() -> Self {
        Self::with_hasher(Default::default())
    }

    pub fn with_reclaimer(reclaimer: &Reclaimer) -> Self {
        Self::with_hasher_in(Default::default(), reclaimer)
    }
}

impl<T, P> Default for WeakHeldSet<T, P>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, P, S> WeakHeldSet<T, P, S>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
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

    /// Build a set by `add`-ing each value in order, tracking objects with
    /// `reclaimer`.
    pub fn from_iter_in<I>(iter: I, reclaimer: &Reclaimer) -> Self
    where
        I: IntoIterator<Item = Value<T, P>>,
    {
        let set = Self::with_hasher_in(S::default(), reclaimer);
        for v in iter {
            set.add(v);
        }
        set
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    /// Stored rows, counting members whose object was reclaimed but not
    /// yet purged.
    pub fn len(&self) -> usize {
        self.inner.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.table.borrow().is_empty()
    }

    /// Add `value`; a no-op when it is already a live member.
    pub fn add(&self, value: Value<T, P>) -> &Self {
        self.sweep_if_flagged();
        match value {
            Value::Primitive(p) => {
                let present =
                    locate(&*self.inner.table.borrow(), MemberRef::Primitive(&p)).is_some();
                if !present {
                    self.inner.table.borrow_mut().insert(Member::Primitive(p), None);
                }
            }
            Value::Object(object) => {
                let id = ObjectId::of(&object);
                let stale = {
                    let table = self.inner.table.borrow();
                    match locate(&*table, MemberRef::Object(id)).and_then(|h| table.get(h)) {
                        Some((_, Some(tracked))) if tracked.is_live() => return self,
                        Some((_, Some(tracked))) => Some(tracked.registration()),
                        _ => None,
                    }
                };
                if let Some(registration) = stale {
                    self.reclaimer.unregister(registration);
                }

                let cleanup = purge_on_reclaim(Rc::downgrade(&self.inner), id);
                let tracked = Tracked::track(&object, &self.reclaimer, cleanup);
                debug_assert_eq!(tracked.id(), id);
                let (_, replaced) = self
                    .inner
                    .table
                    .borrow_mut()
                    .insert(Member::Object(id), Some(tracked));
                drop(replaced);
            }
        }
        self
    }

    pub fn has(&self, value: &Value<T, P>) -> bool {
        let table = self.inner.table.borrow();
        locate(&*table, MemberRef::of(value))
            .and_then(|h| table.get(h))
            .map_or(false, |(member, tracked)| match member {
                Member::Primitive(_) => true,
                Member::Object(_) => tracked.as_ref().map_or(false, Tracked::is_live),
            })
    }

    /// Remove `value`. For an object, returns whether it was still alive.
    pub fn delete(&self, value: &Value<T, P>) -> bool {
        self.sweep_if_flagged();
        let removed = {
            let mut table = self.inner.table.borrow_mut();
            locate(&*table, MemberRef::of(value)).and_then(|h| table.remove(h))
        };
        match removed {
            None => false,
            Some((_, Some(tracked))) => tracked.untrack(&self.reclaimer),
            Some((_, None)) => true,
        }
    }

    pub fn clear(&self) {
        self.inner.needs_purge.set(false);
        let drained = self.inner.table.borrow_mut().drain();
        for (_, tracked) in &drained {
            if let Some(t) = tracked {
                self.reclaimer.unregister(t.registration());
            }
        }
        drop(drained);
    }

    /// Remove members whose object is gone without waiting for the
    /// reclaimer, returning how many were removed.
    pub fn purge(&self) -> usize {
        self.inner.needs_purge.set(false);
        let removed = self
            .inner
            .table
            .borrow_mut()
            .retain(|_, tracked| tracked.as_ref().map_or(true, Tracked::is_live));
        for t in removed.iter().filter_map(|(_, tracked)| tracked.as_ref()) {
            self.reclaimer.unregister(t.registration());
        }
        if !removed.is_empty() {
            log::debug!("weak set: purged {} reclaimed members", removed.len());
        }
        removed.len()
    }

    fn sweep_if_flagged(&self) {
        if self.inner.needs_purge.get() {
            self.purge();
        }
    }

    /// Call `f(value, value, set)` for each live member in order.
    pub fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(Value<T, P>, Value<T, P>, &Self),
    {
        for value in self.iter() {
            f(value.clone(), value, self);
        }
    }

    /// Live members in insertion order.
    pub fn iter(&self) -> Iter<'_, T, P, S> {
        Iter {
            set: self,
            cursor: None,
        }
    }

    pub fn keys(&self) -> Iter<'_, T, P, S> {
        self.iter()
    }

    pub fn values(&self) -> Iter<'_, T, P, S> {
        self.iter()
    }

    /// Live members as `(value, value)` pairs.
    pub fn entries(&self) -> Entries<'_, T, P, S> {
        Entries { inner: self.iter() }
    }
}

/// Cleanup run by the reclaimer: drop the row for `id` if its handle is
/// dead. A busy set is flagged so its next `add`/`delete` sweeps instead.
fn purge_on_reclaim<T, P, S>(
    inner: Weak<Shared<T, P, S>>,
    id: ObjectId,
) -> impl FnOnce() + 'static
where
    T: 'static,
    P: Eq + Hash + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    move || {
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let removed = match inner.table.try_borrow_mut() {
            Ok(mut table) => match locate(&*table, MemberRef::Object(id)) {
                Some(h)
                    if table
                        .get(h)
                        .map_or(false, |(_, t)| t.as_ref().map_or(false, |t| !t.is_live())) =>
                {
                    table.remove(h)
                }
                _ => None,
            },
            Err(_) => {
                log::debug!("weak set: busy during cleanup, sweep deferred to next mutation");
                inner.needs_purge.set(true);
                None
            }
        };
        if removed.is_some() {
            log::trace!("weak set: purged reclaimed member");
        }
        drop(removed);
    }
}

impl<T, P, S> Drop for WeakHeldSet<T, P, S> {
    fn drop(&mut self) {
        let registrations: Vec<_> = match self.inner.table.try_borrow() {
            Ok(table) => table
                .iter()
                .filter_map(|(_, _, tracked)| tracked.as_ref().map(Tracked::registration))
                .collect(),
            Err(_) => return,
        };
        for registration in registrations {
            self.reclaimer.unregister(registration);
        }
    }
}

/// Lazy walk over live members; tolerates mutation between steps.
pub struct Iter<'a, T, P, S> {
    set: &'a WeakHeldSet<T, P, S>,
    cursor: Option<Cursor>,
}

impl<T, P: Clone, S> Iterator for Iter<'_, T, P, S> {
    type Item = Value<T, P>;

    fn next(&mut self) -> Option<Self::Item> {
        let table = self.set.inner.table.borrow();
        loop {
            let (cursor, h) = table.next_after(self.cursor)?;
            self.cursor = Some(cursor);
            if let Some(value) = table.get(h).and_then(|(m, t)| load(m, t)) {
                return Some(value);
            }
        }
    }
}

pub struct Entries<'a, T, P, S> {
    inner: Iter<'a, T, P, S>,
}

impl<T, P: Clone, S> Iterator for Entries<'_, T, P, S> {
    type Item = (Value<T, P>, Value<T, P>);

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|v| (v.clone(), v))
    }
}

impl<'a, T, P, S> IntoIterator for &'a WeakHeldSet<T, P, S>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    type Item = Value<T, P>;
    type IntoIter = Iter<'a, T, P, S>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<T, P, S> FromIterator<Value<T, P>> for WeakHeldSet<T, P, S>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    fn from_iter<I: IntoIterator<Item = Value<T, P>>>(iter: I) -> Self {
        Self::from_iter_in(iter, &Reclaimer::current())
    }
}

impl<T, P, S> Extend<Value<T, P>> for WeakHeldSet<T, P, S>
where
    T: 'static,
    P: Eq + Hash + Clone + 'static,
    S: BuildHasher + Clone + Default + 'static,
{
    fn extend<I: IntoIterator<Item = Value<T, P>>>(&mut self, iter: I) {
        for v in iter {
            self.add(v);
        }
    }
}

impl<T: fmt::Debug, P: fmt::Debug + Clone, S> fmt::Debug for WeakHeldSet<T, P, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(Iter {
                set: self,
                cursor: None,
            })
            .finish()
    }
}
