//! weak-held: insertion-ordered maps and sets whose `Rc` payloads are held
//! weakly and purged after the runtime notices they were reclaimed.
//!
//! Internal Design:
//!
//! Summary
//! - Goal: an ordered map and an ordered set that behave like plain ones
//!   for primitive payloads, while object payloads (`Rc<T>`) do not keep
//!   their referent alive.
//! - Layers:
//!   - OrderedTable<K, V, S>: structural storage with stable generational
//!     handles and insertion order. Debug builds panic, naming both
//!     operations, when user `Eq`/`Hash` re-enters a probing table.
//!   - Reclaimer: a single-threaded registry of "run this once that `Rc` is
//!     gone" cleanups, delivered by `collect`.
//!   - Slot / Tracked: the per-entry tag deciding, once at insertion,
//!     whether a payload was weak-wrapped by us or stored verbatim.
//!   - WeakHeldMap / WeakHeldSet: public containers wiring the three
//!     together.
//!
//! Lifecycle
//! - An entry disappears through `delete`, `clear`, an overwriting `set`,
//!   or its reclamation cleanup. Every path that removes or replaces a
//!   wrapped slot cancels that slot's registration synchronously, so a
//!   late cleanup can never hit a key that has since been reused.
//! - Cleanups additionally only remove rows whose handle is dead. A stale
//!   cleanup meeting a live row is a no-op.
//! - Reads upgrade the weak handle and treat a failed upgrade as absence,
//!   so reclaimed-but-unpurged rows are never observed.
//!
//! Constraints
//! - Single-threaded: containers and `Reclaimer` are `!Send`/`!Sync`.
//! - Reclamation timing is best effort; nothing is purged until someone
//!   calls `Reclaimer::collect` (or `purge`, or touches the key).
//! - Object membership is by allocation identity, primitives by `Eq`.
//!
//! Reentrancy
//! - Container methods take `&self` and hold their `RefCell` borrow only
//!   for the structural step. Removed user data is dropped after the
//!   borrow ends, so `Drop` impls may call back in.
//! - A cleanup that finds its container borrowed (user `Eq`/`Hash`/`Clone`
//!   running under a table borrow) backs off and flags the container. The
//!   dead row stays invisible to reads and the next `set`/`add`/`delete`
//!   sweeps every dead row before doing its own work.
//!
//! Notes and non-goals
//! - No deterministic reclamation, no thread-safety, no custom equality for
//!   object payloads.
//! - `len()` counts physical rows, including dead rows awaiting purge.

#[cfg(feature = "bench_internal")]
pub mod ordered_table;
#[cfg(not(feature = "bench_internal"))]
mod ordered_table;
mod ordered_table_proptest;
mod reclaim;
mod tracker;
mod value;
mod weak_held_map;
mod weak_held_set;

// Public surface
pub use reclaim::{Reclaimer, Registration};
pub use value::Value;
pub use weak_held_map::WeakHeldMap;
pub use weak_held_set::WeakHeldSet;

pub mod map {
    //! Iterator types for [`WeakHeldMap`](crate::WeakHeldMap).
    pub use crate::weak_held_map::{Iter, Keys, Values};
}

pub mod set {
    //! Iterator types for [`WeakHeldSet`](crate::WeakHeldSet).
    pub use crate::weak_held_set::{Entries, Iter};
}
