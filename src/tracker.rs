//! Weak-entry tracking shared by the map and the set.
//!
//! A [`Slot`] is resolved once, when a payload is stored: objects become
//! `Wrapped` with a [`Tracked`] record, primitives stay `Raw`. Whether a
//! slot is one of ours is decided by the variant, never by inspecting the
//! payload type, so a caller-supplied `Weak` stored as a primitive comes
//! back untouched.

use crate::reclaim::{Reclaimer, Registration};
use crate::value::{ObjectId, Value};
use std::rc::{Rc, Weak};

/// A container-created weak handle plus the registration that will purge
/// its row once the referent is reclaimed.
pub(crate) struct Tracked<T> {
    handle: Weak<T>,
    registration: Registration,
}

impl<T: 'static> Tracked<T> {
    pub(crate) fn track<F>(object: &Rc<T>, reclaimer: &Reclaimer, cleanup: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        Tracked {
            handle: Rc::downgrade(object),
            registration: reclaimer.register(object, cleanup),
        }
    }
}

impl<T> Tracked<T> {
    pub(crate) fn deref(&self) -> Option<Rc<T>> {
        self.handle.upgrade()
    }

    pub(crate) fn is_live(&self) -> bool {
        self.handle.strong_count() > 0
    }

    pub(crate) fn id(&self) -> ObjectId {
        ObjectId::of_weak(&self.handle)
    }

    pub(crate) fn registration(&self) -> Registration {
        self.registration
    }

    /// Cancel the pending cleanup and report whether the referent was
    /// still alive at this moment.
    pub(crate) fn untrack(self, reclaimer: &Reclaimer) -> bool {
        let live = self.is_live();
        reclaimer.unregister(self.registration);
        live
    }
}

pub(crate) enum Slot<T, P> {
    Wrapped(Tracked<T>),
    Raw(P),
}

impl<T, P> Slot<T, P> {
    pub(crate) fn is_live(&self) -> bool {
        match self {
            Slot::Wrapped(t) => t.is_live(),
            Slot::Raw(_) => true,
        }
    }

    pub(crate) fn registration(&self) -> Option<Registration> {
        match self {
            Slot::Wrapped(t) => Some(t.registration()),
            Slot::Raw(_) => None,
        }
    }

    /// The stored payload, or `None` when the referent is gone.
    pub(crate) fn load(&self) -> Option<Value<T, P>>
    where
        P: Clone,
    {
        match self {
            Slot::Wrapped(t) => t.deref().map(Value::Object),
            Slot::Raw(p) => Some(Value::Primitive(p.clone())),
        }
    }
}
