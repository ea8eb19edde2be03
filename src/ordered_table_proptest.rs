#![cfg(test)]

// Property tests for OrderedTable kept inside the crate so they do not need
// the bench feature to reach the internal module.

use crate::ordered_table::{Handle, OrderedTable};
use proptest::prelude::*;
use std::hash::Hasher;

#[derive(Clone, Debug)]
enum Op {
    Insert(String, i32),
    Remove(String),
    Find(String),
    Iterate,
    WalkRemovingEveryOther,
    Drain,
}

prop_compose! {
    fn arb_key()(s in "[a-d]{1,2}") -> String { s }
}

prop_compose! {
    fn arb_ops()(ops in proptest::collection::vec(
        prop_oneof![
            6 => (arb_key(), any::<i32>()).prop_map(|(k, v)| Op::Insert(k, v)),
            3 => arb_key().prop_map(Op::Remove),
            2 => arb_key().prop_map(Op::Find),
            1 => Just(Op::Iterate),
            1 => Just(Op::WalkRemovingEveryOther),
            1 => Just(Op::Drain),
        ], 1..120)) -> Vec<Op> { ops }
}

// Model: Vec in insertion order; overwrite keeps position.
fn model_insert(model: &mut Vec<(String, i32)>, k: String, v: i32) -> Option<i32> {
    match model.iter_mut().find(|(mk, _)| *mk == k) {
        Some(slot) => Some(std::mem::replace(&mut slot.1, v)),
        None => {
            model.push((k, v));
            None
        }
    }
}

fn run<S>(mut sut: OrderedTable<String, i32, S>, ops: Vec<Op>) -> Result<(), TestCaseError>
where
    S: std::hash::BuildHasher + Clone + Default,
{
    let mut model: Vec<(String, i32)> = Vec::new();
    let mut stale: Vec<Handle> = Vec::new();

    for op in ops {
        match op {
            Op::Insert(k, v) => {
                let (_, old) = sut.insert(k.clone(), v);
                prop_assert_eq!(old.map(|(_, v)| v), model_insert(&mut model, k, v));
            }
            Op::Remove(k) => {
                let h = sut.find(k.as_str());
                let removed = sut.remove_key(k.as_str());
                let pos = model.iter().position(|(mk, _)| *mk == k);
                prop_assert_eq!(removed, pos.map(|i| model.remove(i)));
                stale.extend(h);
            }
            Op::Find(k) => {
                let found = sut.find(k.as_str()).and_then(|h| sut.get(h)).map(|(_, v)| *v);
                let expected = model.iter().find(|(mk, _)| *mk == k).map(|(_, v)| *v);
                prop_assert_eq!(found, expected);
            }
            Op::Iterate => {
                let seen: Vec<(String, i32)> =
                    sut.iter().map(|(_, k, v)| (k.clone(), *v)).collect();
                prop_assert_eq!(&seen, &model);
            }
            Op::WalkRemovingEveryOther => {
                let mut cursor = None;
                let mut visited = Vec::new();
                let mut idx = 0;
                while let Some((c, h)) = sut.next_after(cursor) {
                    cursor = Some(c);
                    let (k, _) = sut.get(h).map(|(k, v)| (k.clone(), *v)).unwrap();
                    if idx % 2 == 0 {
                        sut.remove(h);
                        stale.push(h);
                    }
                    visited.push(k);
                    idx += 1;
                }
                let expected: Vec<String> = model.iter().map(|(k, _)| k.clone()).collect();
                prop_assert_eq!(visited, expected);
                let mut i = 0;
                model.retain(|_| {
                    let keep = i % 2 == 1;
                    i += 1;
                    keep
                });
            }
            Op::Drain => {
                let drained = sut.drain();
                prop_assert_eq!(&drained, &model);
                model.clear();
            }
        }

        for &h in &stale {
            prop_assert!(sut.get(h).is_none(), "stale handle resolved");
        }
        prop_assert_eq!(sut.len(), model.len());
        prop_assert_eq!(sut.is_empty(), model.is_empty());
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_matches_ordered_model(ops in arb_ops()) {
        run(OrderedTable::new(), ops)?;
    }
}

#[derive(Clone, Default)]
struct ConstBuildHasher;
struct ConstHasher;
impl std::hash::BuildHasher for ConstBuildHasher {
    type Hasher = ConstHasher;
    fn build_hasher(&self) -> Self::Hasher {
        ConstHasher
    }
}
impl Hasher for ConstHasher {
    fn write(&mut self, _bytes: &[u8]) {}
    fn finish(&self) -> u64 {
        0
    }
}

// Same model under total hash collision.
proptest! {
    #![proptest_config(ProptestConfig { cases: 64, .. ProptestConfig::default() })]
    #[test]
    fn prop_matches_ordered_model_with_collisions(ops in arb_ops()) {
        run(OrderedTable::with_hasher(ConstBuildHasher), ops)?;
    }
}
