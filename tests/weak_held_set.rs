// WeakHeldSet unit test suite.
//
// Invariants exercised:
// - Membership: objects by identity, primitives by equality.
// - Liveness: an object member is visible iff its `Rc` is still held.
// - Cancellation: delete, clear and drop retract pending cleanups.
// - Iteration: insertion-ordered, live-only, `(v, v)` entries.
use std::cell::RefCell;
use std::rc::Rc;
use weak_held::{Reclaimer, Value, WeakHeldSet};

#[derive(Debug, PartialEq)]
struct Shape {
    y: i32,
}

type S = WeakHeldSet<Shape, &'static str>;

fn obj(o: &Rc<Shape>) -> Value<Shape, &'static str> {
    Value::Object(o.clone())
}

fn prim(p: &'static str) -> Value<Shape, &'static str> {
    Value::Primitive(p)
}

#[test]
fn equal_shapes_with_distinct_identity_are_both_kept() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    let b = Rc::new(Shape { y: 1 });
    set.add(obj(&a)).add(obj(&b));
    assert_eq!(set.len(), 2);
    assert!(set.has(&obj(&a)));
    assert!(set.has(&obj(&b)));
}

#[test]
fn same_identity_is_kept_once() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    set.add(obj(&a)).add(obj(&a));
    assert_eq!(set.len(), 1);
    assert_eq!(r.len(), 1, "second add must not register again");
    assert_eq!(set.iter().count(), 1);
}

#[test]
fn primitives_use_equality() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    set.add(prim("x")).add(prim("y")).add(prim("x"));
    let members: Vec<_> = set.iter().collect();
    assert_eq!(members, [prim("x"), prim("y")]);
    assert!(set.has(&prim("y")));
    assert!(!set.has(&prim("z")));
    assert!(r.is_empty(), "primitives are never registered");
}

#[test]
fn reclaimed_member_disappears() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    let b = Rc::new(Shape { y: 2 });
    set.add(obj(&a)).add(obj(&b)).add(prim("p"));
    let probe = Rc::downgrade(&a);
    drop(a);
    assert!(probe.upgrade().is_none());

    let members: Vec<_> = set.values().collect();
    assert_eq!(members, [obj(&b), prim("p")]);
    assert_eq!(set.len(), 3);
    assert_eq!(r.collect(), 1);
    assert_eq!(set.len(), 2);
    assert!(set.has(&obj(&b)));
}

#[test]
fn delete_semantics() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    assert!(!set.delete(&obj(&a)), "never added");
    set.add(obj(&a));
    assert!(set.delete(&obj(&a)));
    assert!(!set.delete(&obj(&a)));
    assert!(!set.has(&obj(&a)));
    assert!(r.is_empty());

    set.add(prim("p"));
    assert!(set.delete(&prim("p")));
    assert!(!set.delete(&prim("p")));
}

// After delete, re-adding the same object tracks it afresh, and the old
// cleanup (already cancelled) cannot remove it.
#[test]
fn re_add_after_delete_is_tracked_again() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    let b = Rc::new(Shape { y: 2 });
    set.add(obj(&a)).add(obj(&b));
    set.delete(&obj(&a));
    set.add(obj(&a));
    let order: Vec<_> = set.keys().collect();
    assert_eq!(order, [obj(&b), obj(&a)], "re-added member goes to the back");
    assert_eq!(r.len(), 2);
    assert_eq!(r.collect(), 0);
    assert!(set.has(&obj(&a)));
}

#[test]
fn entries_are_value_pairs() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    set.add(prim("p")).add(obj(&a));
    let entries: Vec<_> = set.entries().collect();
    assert_eq!(entries, [(prim("p"), prim("p")), (obj(&a), obj(&a))]);
}

#[test]
fn for_each_passes_value_twice() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    set.add(prim("a")).add(prim("b"));
    let seen = RefCell::new(Vec::new());
    set.for_each(|v1, v2, s| {
        assert_eq!(v1, v2);
        assert!(s.has(&v1));
        seen.borrow_mut().push(v1);
    });
    assert_eq!(seen.into_inner(), [prim("a"), prim("b")]);
}

// The walk re-reads the set each step: a member deleted ahead of the
// cursor is skipped and one added during the walk is reached.
#[test]
fn for_each_sees_mutation_ahead_of_cursor() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    set.add(obj(&a)).add(prim("b")).add(prim("c"));

    let seen = RefCell::new(Vec::new());
    set.for_each(|v, _, s| {
        if v == obj(&a) {
            assert!(s.delete(&prim("b")));
            s.add(prim("d"));
        }
        seen.borrow_mut().push(v);
    });
    assert_eq!(seen.into_inner(), [obj(&a), prim("c"), prim("d")]);
    let members: Vec<_> = set.iter().collect();
    assert_eq!(members, [obj(&a), prim("c"), prim("d")]);
}

#[test]
fn clear_cancels_everything() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    set.add(obj(&a)).add(prim("p"));
    set.clear();
    assert!(set.is_empty());
    assert!(r.is_empty());
    assert!(!set.has(&obj(&a)));
    assert!(!set.has(&prim("p")));
    drop(a);
    assert_eq!(r.collect(), 0);
}

#[test]
fn dropping_set_cancels_registrations() {
    let r = Reclaimer::new();
    let a = Rc::new(Shape { y: 1 });
    {
        let set = S::with_reclaimer(&r);
        set.add(obj(&a));
        assert!(!r.is_empty());
    }
    assert!(r.is_empty());
}

#[test]
fn construct_and_extend() {
    let r = Reclaimer::new();
    let a = Rc::new(Shape { y: 1 });
    let set = S::from_iter_in(vec![obj(&a), prim("p"), obj(&a)], &r);
    assert_eq!(set.len(), 2);

    let mut collected: S = vec![prim("q")].into_iter().collect();
    collected.extend(vec![prim("r"), prim("q")]);
    let members: Vec<_> = (&collected).into_iter().collect();
    assert_eq!(members, [prim("q"), prim("r")]);
}

#[test]
fn purge_removes_dead_members() {
    let r = Reclaimer::new();
    let set = S::with_reclaimer(&r);
    let a = Rc::new(Shape { y: 1 });
    set.add(obj(&a)).add(Value::object(Shape { y: 2 }));
    assert_eq!(set.purge(), 1);
    assert_eq!(set.len(), 1);
    assert_eq!(r.collect(), 0);
}

#[test]
fn debug_lists_live_members() {
    let set: WeakHeldSet<Shape, i32> = WeakHeldSet::with_reclaimer(&Reclaimer::new());
    let a = Rc::new(Shape { y: 1 });
    set.add(Value::Object(a.clone())).add(Value::Primitive(2));
    set.add(Value::object(Shape { y: 3 }));
    assert_eq!(
        format!("{:?}", set),
        "{Object(Shape { y: 1 }), Primitive(2)}"
    );
}
