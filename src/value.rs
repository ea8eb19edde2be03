use core::fmt;
use std::rc::{Rc, Weak};

/// A payload handed to or returned from a weak-held container.
///
/// `Object` payloads are held weakly once stored: the container keeps a
/// `Weak<T>` and the entry disappears after the last outside `Rc` is gone.
/// `Primitive` payloads are stored as-is and only leave when removed.
pub enum Value<T, P = ()> {
    Object(Rc<T>),
    Primitive(P),
}

impl<T, P> Value<T, P> {
    /// Allocate a fresh object payload.
    pub fn object(value: T) -> Self {
        Value::Object(Rc::new(value))
    }

    pub fn is_object(&self) -> bool {
        matches!(self, Value::Object(_))
    }

    pub fn as_object(&self) -> Option<&Rc<T>> {
        match self {
            Value::Object(o) => Some(o),
            Value::Primitive(_) => None,
        }
    }

    pub fn as_primitive(&self) -> Option<&P> {
        match self {
            Value::Object(_) => None,
            Value::Primitive(p) => Some(p),
        }
    }

    pub fn into_object(self) -> Option<Rc<T>> {
        match self {
            Value::Object(o) => Some(o),
            Value::Primitive(_) => None,
        }
    }
}

impl<T, P: Clone> Clone for Value<T, P> {
    fn clone(&self) -> Self {
        match self {
            Value::Object(o) => Value::Object(o.clone()),
            Value::Primitive(p) => Value::Primitive(p.clone()),
        }
    }
}

/// Objects compare by identity, primitives by value.
impl<T, P: PartialEq> PartialEq for Value<T, P> {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Object(a), Value::Object(b)) => Rc::ptr_eq(a, b),
            (Value::Primitive(a), Value::Primitive(b)) => a == b,
            _ => false,
        }
    }
}

impl<T, P: Eq> Eq for Value<T, P> {}

impl<T: fmt::Debug, P: fmt::Debug> fmt::Debug for Value<T, P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Object(o) => f.debug_tuple("Object").field(&**o).finish(),
            Value::Primitive(p) => f.debug_tuple("Primitive").field(p).finish(),
        }
    }
}

impl<T, P> From<Rc<T>> for Value<T, P> {
    fn from(o: Rc<T>) -> Self {
        Value::Object(o)
    }
}

/// Allocation identity of an object payload.
///
/// Only meaningful while something keeps the allocation pinned; tracked
/// rows hold a `Weak<T>` for exactly that reason.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub(crate) struct ObjectId(usize);

impl ObjectId {
    pub(crate) fn of<T>(object: &Rc<T>) -> Self {
        ObjectId(Rc::as_ptr(object) as *const () as usize)
    }

    pub(crate) fn of_weak<T>(handle: &Weak<T>) -> Self {
        ObjectId(Weak::as_ptr(handle) as *const () as usize)
    }
}
