//! Reclamation notifications for `Rc` payloads.
//!
//! `Rc` offers no finalization hook, so each registration keeps a weak
//! probe of its referent (pinning the allocation, not the value). Nothing
//! fires on its own: [`Reclaimer::collect`] is the point on the cooperative
//! timeline where dead referents are noticed and their cleanups delivered.
//! How long that takes is up to whoever drives `collect`; it may be never.
//!
//! Registrations are addressed by generational [`Registration`] keys, so
//! cancelling twice, or cancelling something that already fired, reports
//! `false` and does nothing else.

use core::cell::RefCell;
use core::fmt;
use slotmap::{new_key_type, SlotMap};
use std::any::Any;
use std::rc::{Rc, Weak};

new_key_type! {
    /// Cancellation key for one pending cleanup.
    pub struct Registration;
}

struct Pending {
    referent: Weak<dyn Any>,
    cleanup: Box<dyn FnOnce()>,
}

impl Pending {
    fn is_reclaimed(&self) -> bool {
        self.referent.strong_count() == 0
    }
}

/// Shared handle to a table of reclamation registrations.
///
/// Cloning yields another handle to the same table. Single-threaded: the
/// handle is neither `Send` nor `Sync`.
#[derive(Clone)]
pub struct Reclaimer {
    table: Rc<RefCell<SlotMap<Registration, Pending>>>,
}

thread_local! {
    static CURRENT: Reclaimer = Reclaimer::new();
}

impl Reclaimer {
    pub fn new() -> Self {
        Self {
            table: Rc::new(RefCell::new(SlotMap::with_key())),
        }
    }

    /// The calling thread's default reclaimer, used by containers built
    /// without an explicit one.
    pub fn current() -> Self {
        CURRENT.with(Reclaimer::clone)
    }

    /// Arrange for `cleanup` to run during some `collect` after `referent`
    /// has been dropped by its last strong owner.
    pub fn register<T, F>(&self, referent: &Rc<T>, cleanup: F) -> Registration
    where
        T: 'static,
        F: FnOnce() + 'static,
    {
        let referent: Weak<dyn Any> = Rc::<T>::downgrade(referent);
        let registration = self.table.borrow_mut().insert(Pending {
            referent,
            cleanup: Box::new(cleanup),
        });
        log::trace!("reclaimer: registered {:?}", registration);
        registration
    }

    /// Cancel a pending cleanup. Returns `false` when it was already
    /// cancelled or has already fired.
    pub fn unregister(&self, registration: Registration) -> bool {
        let removed = self.table.borrow_mut().remove(registration);
        match removed {
            Some(pending) => {
                log::trace!("reclaimer: cancelled {:?}", registration);
                // Captured state drops here, outside the table borrow.
                drop(pending);
                true
            }
            None => false,
        }
    }

    pub fn is_registered(&self, registration: Registration) -> bool {
        self.table.borrow().contains_key(registration)
    }

    /// Number of registrations not yet cancelled or fired.
    pub fn len(&self) -> usize {
        self.table.borrow().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.borrow().is_empty()
    }

    /// Registrations whose referent is gone but whose cleanup is still
    /// waiting for a `collect`.
    pub fn pending(&self) -> usize {
        self.table
            .borrow()
            .values()
            .filter(|p| p.is_reclaimed())
            .count()
    }

    /// Run the cleanup of every registration whose referent has been
    /// dropped, returning how many ran.
    ///
    /// Due registrations are detached before any cleanup runs, so cleanups
    /// may register, cancel, or collect again on this reclaimer.
    pub fn collect(&self) -> usize {
        let due: Vec<Pending> = {
            let mut table = self.table.borrow_mut();
            let dead: Vec<Registration> = table
                .iter()
                .filter(|(_, p)| p.is_reclaimed())
                .map(|(r, _)| r)
                .collect();
            dead.into_iter().filter_map(|r| table.remove(r)).collect()
        };
        let fired = due.len();
        if fired > 0 {
            log::debug!("reclaimer: running {} cleanup(s)", fired);
        }
        for Pending { cleanup, .. } in due {
            cleanup();
        }
        fired
    }

    /// Whether two handles share one registration table.
    pub fn ptr_eq(&self, other: &Reclaimer) -> bool {
        Rc::ptr_eq(&self.table, &other.table)
    }
}

impl Default for Reclaimer {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Reclaimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.table.try_borrow() {
            Ok(table) => f
                .debug_struct("Reclaimer")
                .field("registrations", &table.len())
                .finish(),
            Err(_) => f.debug_struct("Reclaimer").finish_non_exhaustive(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn counter() -> (Rc<Cell<u32>>, impl Fn() -> Box<dyn FnOnce()>) {
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let make = move || -> Box<dyn FnOnce()> {
            let h = h.clone();
            Box::new(move || h.set(h.get() + 1))
        };
        (hits, make)
    }

    #[test]
    fn cleanup_waits_for_collect_after_drop() {
        let r = Reclaimer::new();
        let (hits, make) = counter();
        let obj = Rc::new(5u8);
        let reg = r.register(&obj, make());

        assert_eq!(r.collect(), 0, "live referent must not fire");
        assert_eq!(r.pending(), 0);

        drop(obj);
        assert_eq!(hits.get(), 0, "nothing fires before collect");
        assert_eq!(r.pending(), 1);

        assert_eq!(r.collect(), 1);
        assert_eq!(hits.get(), 1);
        assert!(!r.is_registered(reg));
        assert_eq!(r.collect(), 0, "a cleanup fires at most once");
    }

    #[test]
    fn unregister_cancels_and_is_idempotent() {
        let r = Reclaimer::new();
        let (hits, make) = counter();
        let obj = Rc::new(());
        let reg = r.register(&obj, make());
        assert!(r.unregister(reg));
        assert!(!r.unregister(reg));
        drop(obj);
        assert_eq!(r.collect(), 0);
        assert_eq!(hits.get(), 0);
        assert!(r.is_empty());
    }

    #[test]
    fn unregister_after_fire_reports_false() {
        let r = Reclaimer::new();
        let (_hits, make) = counter();
        let obj = Rc::new(1);
        let reg = r.register(&obj, make());
        drop(obj);
        r.collect();
        assert!(!r.unregister(reg));
    }

    /// Invariant: cleanups run with the table released.
    #[test]
    fn cleanup_may_reenter_reclaimer() {
        let r = Reclaimer::new();
        let second = Rc::new(Cell::new(false));
        let obj = Rc::new(0u32);
        let r2 = r.clone();
        let flag = second.clone();
        r.register(&obj, move || {
            let fresh = Rc::new(1u32);
            let f = flag.clone();
            r2.register(&fresh, move || f.set(true));
            drop(fresh);
            assert_eq!(r2.collect(), 1);
        });
        drop(obj);
        assert_eq!(r.collect(), 1);
        assert!(second.get());
        assert!(r.is_empty());
    }

    #[test]
    fn current_is_shared_per_thread() {
        let a = Reclaimer::current();
        let b = Reclaimer::current();
        assert!(a.ptr_eq(&b));
        assert!(!a.ptr_eq(&Reclaimer::new()));
    }
}
