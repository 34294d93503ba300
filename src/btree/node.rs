//! B-Tree Node Module
//!
//! Nodes live in an arena owned by the tree and refer to their children by
//! index, so the structure holds no internal pointers.

use std::borrow::Borrow;
use std::cmp::Ordering;

/// Index of a node inside the tree's arena.
pub(crate) type NodeId = usize;

/// A B-tree node. Leaves have no children; internal nodes have exactly one
/// more child than keys.
#[derive(Debug)]
pub(crate) struct Node<K, V> {
    pub(crate) keys: Vec<K>,
    pub(crate) vals: Vec<V>,
    pub(crate) children: Vec<NodeId>,
}

impl<K, V> Default for Node<K, V> {
    fn default() -> Self {
        Self {
            keys: Vec::new(),
            vals: Vec::new(),
            children: Vec::new(),
        }
    }
}

impl<K, V> Node<K, V> {
    /// Creates an empty leaf with room for `capacity` keys.
    pub(crate) fn with_capacity(capacity: usize) -> Self {
        Self {
            keys: Vec::with_capacity(capacity),
            vals: Vec::with_capacity(capacity),
            children: Vec::new(),
        }
    }

    pub(crate) fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Binary search for `key`: `Ok(i)` if `keys[i] == key`, otherwise
    /// `Err(i)` with `i` the child to descend into.
    pub(crate) fn search<Q>(&self, key: &Q) -> Result<usize, usize>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.keys.binary_search_by(|k| Borrow::<Q>::borrow(k).cmp(key))
    }

    /// Number of leading keys for which `before` holds. Keys are sorted, so
    /// `before` must be monotone over them.
    pub(crate) fn partition<F>(&self, before: F) -> usize
    where
        F: Fn(&K) -> bool,
    {
        self.keys.partition_point(before)
    }
}

/// Compares two optional bound keys against a candidate.
pub(crate) fn within<K: Ord>(key: &K, lower: Option<&K>, upper: Option<&K>) -> bool {
    let above = lower.map_or(true, |low| key.cmp(low) == Ordering::Greater);
    let below = upper.map_or(true, |high| key.cmp(high) == Ordering::Less);
    above && below
}
