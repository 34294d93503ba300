//! Property-Based Tests for the Ordered Index
//!
//! Runs random operation sequences against both the B-tree and
//! `std::collections::BTreeMap`, checking structural invariants after every
//! step.

use proptest::prelude::*;
use std::collections::BTreeMap;
use std::ops::Bound;

use crate::btree::BTree;
use crate::error::IndexError;

#[derive(Debug, Clone)]
enum IndexOp {
    Insert(u16, u32),
    Delete(u16),
    PopFirst,
}

fn index_op_strategy() -> impl Strategy<Value = IndexOp> {
    prop_oneof![
        4 => (0u16..512, any::<u32>()).prop_map(|(k, v)| IndexOp::Insert(k, v)),
        3 => (0u16..512).prop_map(IndexOp::Delete),
        1 => Just(IndexOp::PopFirst),
    ]
}

fn bound_strategy() -> impl Strategy<Value = Bound<u16>> {
    prop_oneof![
        (0u16..600).prop_map(Bound::Included),
        (0u16..600).prop_map(Bound::Excluded),
        Just(Bound::Unbounded),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    // **Property 1: Model Equivalence**
    // *For any* order and sequence of inserts, deletes and pops, the tree
    // returns the same results as `BTreeMap` and satisfies every structural
    // invariant after each step.
    #[test]
    fn prop_matches_btreemap(
        order in 3usize..12,
        ops in prop::collection::vec(index_op_strategy(), 1..300)
    ) {
        let mut tree = BTree::new(order);
        let mut model = BTreeMap::new();

        for op in ops {
            match op {
                IndexOp::Insert(k, v) => {
                    prop_assert_eq!(tree.insert(k, v), model.insert(k, v));
                }
                IndexOp::Delete(k) => {
                    let expected = model.remove(&k).ok_or(IndexError::NotFound);
                    prop_assert_eq!(tree.delete(&k), expected);
                }
                IndexOp::PopFirst => {
                    prop_assert_eq!(tree.pop_first(), model.pop_first());
                }
            }
            if let Err(violation) = tree.check_invariants() {
                prop_assert!(false, "invariant broken: {}", violation);
            }
            prop_assert_eq!(tree.len(), model.len());
        }

        prop_assert!(tree.iter().eq(model.iter()));
        prop_assert_eq!(tree.min(), model.first_key_value());
        prop_assert_eq!(tree.max(), model.last_key_value());
    }

    // **Property 2: Range Equivalence**
    // *For any* set of keys and pair of bounds, `range` yields exactly the
    // entries `BTreeMap::range` yields, in the same order. Inverted bounds
    // yield nothing.
    #[test]
    fn prop_range_matches_btreemap(
        order in 3usize..9,
        keys in prop::collection::btree_set(0u16..512, 0..200),
        start in bound_strategy(),
        end in bound_strategy()
    ) {
        let mut tree = BTree::new(order);
        let mut model = BTreeMap::new();
        for k in keys {
            tree.insert(k, ());
            model.insert(k, ());
        }

        let inverted = match (start, end) {
            (Bound::Included(s), Bound::Included(e)) => s > e,
            (Bound::Included(s), Bound::Excluded(e))
            | (Bound::Excluded(s), Bound::Included(e)) => s >= e,
            (Bound::Excluded(s), Bound::Excluded(e)) => s >= e,
            _ => false,
        };

        let got: Vec<u16> = tree.range((start, end)).map(|(k, _)| *k).collect();
        if inverted {
            prop_assert!(got.is_empty());
        } else {
            let expected: Vec<u16> = model.range((start, end)).map(|(k, _)| *k).collect();
            prop_assert_eq!(got, expected);
        }
    }

    // **Property 3: Sorted Iteration**
    // *For any* N distinct keys, full iteration is strictly increasing, and
    // deleting every key leaves `min` and `max` empty.
    #[test]
    fn prop_sorted_then_emptied(keys in prop::collection::hash_set(any::<i64>(), 1..300)) {
        let mut tree = BTree::new(4);
        for &k in &keys {
            tree.insert(k, k);
        }

        let ordered: Vec<i64> = tree.iter().map(|(k, _)| *k).collect();
        prop_assert!(ordered.windows(2).all(|pair| pair[0] < pair[1]));
        prop_assert_eq!(ordered.len(), keys.len());

        for k in &keys {
            prop_assert_eq!(tree.delete(k), Ok(*k));
        }
        prop_assert!(tree.min().is_none());
        prop_assert!(tree.max().is_none());
        prop_assert_eq!(tree.height(), 0);
    }
}
