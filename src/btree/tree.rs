//! B-Tree Module
//!
//! An ordered map of configurable order backed by a node arena. Insert and
//! delete are iterative: the descent records a path stack which is then
//! walked back up to split overflowing nodes or repair underflowing ones.

use std::borrow::Borrow;
use std::fmt;
use std::mem;
use std::ops::{Bound, RangeBounds};

use crate::btree::node::{within, Node, NodeId};
use crate::btree::range::Range;
use crate::error::IndexError;

/// Smallest supported order.
pub const MIN_ORDER: usize = 3;

/// Order used by [`BTree::default`].
pub const DEFAULT_ORDER: usize = 32;

// == B-Tree ==
/// Ordered key/value index.
///
/// `order` is the maximum number of children per node: every node holds at
/// most `order - 1` keys and every non-root node at least
/// `ceil(order / 2) - 1`. All leaves sit at the same depth.
pub struct BTree<K, V> {
    nodes: Vec<Node<K, V>>,
    /// Released arena slots available for reuse
    vacant: Vec<NodeId>,
    root: NodeId,
    order: usize,
    len: usize,
}

impl<K, V> BTree<K, V> {
    // == Constructor ==
    /// Creates an empty tree. Orders below [`MIN_ORDER`] are raised to it.
    pub fn new(order: usize) -> Self {
        let order = order.max(MIN_ORDER);
        Self {
            nodes: vec![Node::with_capacity(order)],
            vacant: Vec::new(),
            root: 0,
            order,
            len: 0,
        }
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of levels; zero for an empty tree.
    pub fn height(&self) -> usize {
        if self.is_empty() {
            return 0;
        }
        let mut height = 1;
        let mut node = &self.nodes[self.root];
        while let Some(&child) = node.children.first() {
            node = &self.nodes[child];
            height += 1;
        }
        height
    }

    /// Removes every entry.
    pub fn clear(&mut self) {
        self.nodes.clear();
        self.nodes.push(Node::with_capacity(self.order));
        self.vacant.clear();
        self.root = 0;
        self.len = 0;
    }

    /// Smallest entry.
    pub fn min(&self) -> Option<(&K, &V)> {
        if self.is_empty() {
            return None;
        }
        let mut node = &self.nodes[self.root];
        while let Some(&child) = node.children.first() {
            node = &self.nodes[child];
        }
        Some((node.keys.first()?, node.vals.first()?))
    }

    /// Largest entry.
    pub fn max(&self) -> Option<(&K, &V)> {
        if self.is_empty() {
            return None;
        }
        let mut node = &self.nodes[self.root];
        while let Some(&child) = node.children.last() {
            node = &self.nodes[child];
        }
        Some((node.keys.last()?, node.vals.last()?))
    }

    /// In-order iterator over every entry.
    pub fn iter(&self) -> Range<'_, K, V> {
        if self.is_empty() {
            return Range::empty(self);
        }
        let (stack, _) = self.seek(|_| false);
        Range::new(self, stack, None)
    }

    pub(crate) fn node(&self, id: NodeId) -> &Node<K, V> {
        &self.nodes[id]
    }

    fn max_keys(&self) -> usize {
        self.order - 1
    }

    fn min_keys(&self) -> usize {
        (self.order + 1) / 2 - 1
    }

    fn alloc_node(&mut self, node: Node<K, V>) -> NodeId {
        match self.vacant.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        }
    }

    fn release_node(&mut self, id: NodeId) {
        self.nodes[id] = Node::default();
        self.vacant.push(id);
    }

    /// Descends toward the first entry for which `before` is false.
    ///
    /// Returns the cursor stack and the position of that entry, if any.
    fn seek<F>(&self, before: F) -> (Vec<(NodeId, usize)>, Option<(NodeId, usize)>)
    where
        F: Fn(&K) -> bool,
    {
        let mut stack = Vec::new();
        let mut found = None;
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            let index = node.partition(&before);
            stack.push((id, index));
            if index < node.keys.len() {
                found = Some((id, index));
            }
            match node.children.get(index) {
                Some(&child) => id = child,
                None => break,
            }
        }
        (stack, found)
    }

    // == Removal Helpers ==
    /// Removes the entry at `keys[index]` of `id`, reached through `path`.
    fn remove_found(&mut self, mut path: Vec<(NodeId, usize)>, id: NodeId, index: usize) -> (K, V) {
        let (entry, leaf) = if self.nodes[id].is_leaf() {
            let node = &mut self.nodes[id];
            ((node.keys.remove(index), node.vals.remove(index)), id)
        } else {
            // Swap in the predecessor: the rightmost entry of the left subtree.
            path.push((id, index));
            let mut current = self.nodes[id].children[index];
            while let Some(&child) = self.nodes[current].children.last() {
                path.push((current, self.nodes[current].children.len() - 1));
                current = child;
            }
            let leaf = &mut self.nodes[current];
            let last = leaf.keys.len() - 1;
            let pred_key = leaf.keys.remove(last);
            let pred_val = leaf.vals.remove(last);

            let node = &mut self.nodes[id];
            let key = mem::replace(&mut node.keys[index], pred_key);
            let val = mem::replace(&mut node.vals[index], pred_val);
            ((key, val), current)
        };

        self.len -= 1;
        self.rebalance(leaf, path);
        entry
    }

    /// Repairs underflow from `id` upward, then shrinks an empty root.
    fn rebalance(&mut self, mut id: NodeId, mut path: Vec<(NodeId, usize)>) {
        let min = self.min_keys();
        while let Some((parent, index)) = path.pop() {
            if self.nodes[id].keys.len() >= min {
                return;
            }
            let siblings = &self.nodes[parent].children;
            let left = index.checked_sub(1).map(|i| siblings[i]);
            let right = siblings.get(index + 1).copied();

            if left.is_some_and(|l| self.nodes[l].keys.len() > min) {
                self.rotate_right(parent, index);
                return;
            }
            if right.is_some_and(|r| self.nodes[r].keys.len() > min) {
                self.rotate_left(parent, index);
                return;
            }
            self.merge(parent, index.saturating_sub(1));
            id = parent;
        }

        let root = &self.nodes[self.root];
        if root.keys.is_empty() {
            if let Some(&child) = root.children.first() {
                let old = self.root;
                self.root = child;
                self.release_node(old);
            }
        }
    }

    /// Moves the left sibling's last entry up into the parent and the
    /// parent's separator down into `children[index]`.
    fn rotate_right(&mut self, parent: NodeId, index: usize) {
        let left = self.nodes[parent].children[index - 1];
        let target = self.nodes[parent].children[index];

        let donor = &mut self.nodes[left];
        let last = donor.keys.len() - 1;
        let key = donor.keys.remove(last);
        let val = donor.vals.remove(last);
        let child = donor.children.pop();

        let separator = &mut self.nodes[parent];
        let key = mem::replace(&mut separator.keys[index - 1], key);
        let val = mem::replace(&mut separator.vals[index - 1], val);

        let node = &mut self.nodes[target];
        node.keys.insert(0, key);
        node.vals.insert(0, val);
        if let Some(child) = child {
            node.children.insert(0, child);
        }
    }

    /// Mirror image of [`BTree::rotate_right`] using the right sibling.
    fn rotate_left(&mut self, parent: NodeId, index: usize) {
        let right = self.nodes[parent].children[index + 1];
        let target = self.nodes[parent].children[index];

        let donor = &mut self.nodes[right];
        let key = donor.keys.remove(0);
        let val = donor.vals.remove(0);
        let child = if donor.is_leaf() {
            None
        } else {
            Some(donor.children.remove(0))
        };

        let separator = &mut self.nodes[parent];
        let key = mem::replace(&mut separator.keys[index], key);
        let val = mem::replace(&mut separator.vals[index], val);

        let node = &mut self.nodes[target];
        node.keys.push(key);
        node.vals.push(val);
        if let Some(child) = child {
            node.children.push(child);
        }
    }

    /// Merges `children[index + 1]` and the separator between them into
    /// `children[index]`.
    fn merge(&mut self, parent: NodeId, index: usize) {
        let node = &mut self.nodes[parent];
        let key = node.keys.remove(index);
        let val = node.vals.remove(index);
        let right = node.children.remove(index + 1);
        let left = node.children[index];

        let absorbed = mem::take(&mut self.nodes[right]);
        let node = &mut self.nodes[left];
        node.keys.push(key);
        node.vals.push(val);
        node.keys.extend(absorbed.keys);
        node.vals.extend(absorbed.vals);
        node.children.extend(absorbed.children);
        self.release_node(right);
    }

    /// Removes and returns the smallest entry.
    pub fn pop_first(&mut self) -> Option<(K, V)> {
        if self.is_empty() {
            return None;
        }
        let mut path = Vec::new();
        let mut id = self.root;
        while let Some(&child) = self.nodes[id].children.first() {
            path.push((id, 0));
            id = child;
        }
        Some(self.remove_found(path, id, 0))
    }
}

impl<K: Ord, V> BTree<K, V> {
    fn find<Q>(&self, key: &Q) -> Result<(NodeId, usize), IndexError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match node.search(key) {
                Ok(index) => return Ok((id, index)),
                Err(index) => match node.children.get(index) {
                    Some(&child) => id = child,
                    None => return Err(IndexError::NotFound),
                },
            }
        }
    }

    // == Lookup ==
    /// Returns the value stored under `key`.
    pub fn lookup<Q>(&self, key: &Q) -> Result<&V, IndexError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (id, index) = self.find(key)?;
        Ok(&self.nodes[id].vals[index])
    }

    /// Returns a mutable reference to the value stored under `key`.
    pub fn lookup_mut<Q>(&mut self, key: &Q) -> Result<&mut V, IndexError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let (id, index) = self.find(key)?;
        Ok(&mut self.nodes[id].vals[index])
    }

    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.find(key).is_ok()
    }

    // == Insert ==
    /// Inserts `key`, returning the previous value if the key was present.
    ///
    /// New keys go into a leaf; a leaf that overflows splits at its median
    /// and the median moves up, repeating until a parent has room. The tree
    /// only grows in height when the root splits.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let mut path = Vec::new();
        let mut id = self.root;
        loop {
            let node = &mut self.nodes[id];
            match node.search(&key) {
                Ok(index) => return Some(mem::replace(&mut node.vals[index], value)),
                Err(index) => match node.children.get(index) {
                    Some(&child) => {
                        path.push((id, index));
                        id = child;
                    }
                    None => {
                        node.keys.insert(index, key);
                        node.vals.insert(index, value);
                        break;
                    }
                },
            }
        }

        self.len += 1;
        while self.nodes[id].keys.len() > self.max_keys() {
            let (key, val, right) = self.split(id);
            match path.pop() {
                Some((parent, index)) => {
                    let node = &mut self.nodes[parent];
                    node.keys.insert(index, key);
                    node.vals.insert(index, val);
                    node.children.insert(index + 1, right);
                    id = parent;
                }
                None => {
                    let mut root = Node::with_capacity(self.order);
                    root.keys.push(key);
                    root.vals.push(val);
                    root.children.extend([id, right]);
                    self.root = self.alloc_node(root);
                    break;
                }
            }
        }
        None
    }

    /// Splits an overflowing node at its median, returning the median entry
    /// and the new right sibling.
    fn split(&mut self, id: NodeId) -> (K, V, NodeId) {
        let order = self.order;
        let node = &mut self.nodes[id];
        let mid = node.keys.len() / 2;

        let mut right = Node::with_capacity(order);
        right.keys.extend(node.keys.drain(mid + 1..));
        right.vals.extend(node.vals.drain(mid + 1..));
        if !node.is_leaf() {
            right.children = node.children.split_off(mid + 1);
        }
        let key = node.keys.remove(mid);
        let val = node.vals.remove(mid);

        let right = self.alloc_node(right);
        (key, val, right)
    }

    // == Delete ==
    /// Removes `key` and returns its value.
    pub fn delete<Q>(&mut self, key: &Q) -> Result<V, IndexError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.remove_entry(key).map(|(_, val)| val)
    }

    /// Removes `key` and returns the stored key and value.
    pub fn remove_entry<Q>(&mut self, key: &Q) -> Result<(K, V), IndexError>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let mut path = Vec::new();
        let mut id = self.root;
        loop {
            let node = &self.nodes[id];
            match node.search(key) {
                Ok(index) => return Ok(self.remove_found(path, id, index)),
                Err(index) => match node.children.get(index) {
                    Some(&child) => {
                        path.push((id, index));
                        id = child;
                    }
                    None => return Err(IndexError::NotFound),
                },
            }
        }
    }

    // == Range ==
    /// Lazy ordered iterator over the entries whose keys fall in `range`.
    ///
    /// An inverted range yields nothing.
    pub fn range<Q, R>(&self, range: R) -> Range<'_, K, V>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        R: RangeBounds<Q>,
    {
        if self.is_empty() {
            return Range::empty(self);
        }

        let (stack, first) = match range.start_bound() {
            Bound::Included(low) => self.seek(|k| Borrow::<Q>::borrow(k) < low),
            Bound::Excluded(low) => self.seek(|k| Borrow::<Q>::borrow(k) <= low),
            Bound::Unbounded => self.seek(|_| false),
        };
        let end = match range.end_bound() {
            Bound::Included(high) => self.seek(|k| Borrow::<Q>::borrow(k) <= high).1,
            Bound::Excluded(high) => self.seek(|k| Borrow::<Q>::borrow(k) < high).1,
            Bound::Unbounded => None,
        };

        match (first, end) {
            (None, _) => Range::empty(self),
            (Some((a, i)), Some((b, j))) if self.nodes[a].keys[i] > self.nodes[b].keys[j] => {
                Range::empty(self)
            }
            _ => Range::new(self, stack, end),
        }
    }

    // == Invariants ==
    /// Verifies ordering, occupancy and balance over the whole tree.
    pub fn check_invariants(&self) -> Result<(), String> {
        let mut leaf_depth = None;
        let mut count = 0;
        let mut stack: Vec<(NodeId, usize, Option<&K>, Option<&K>)> =
            vec![(self.root, 0, None, None)];

        while let Some((id, depth, lower, upper)) = stack.pop() {
            let node = &self.nodes[id];
            let keys = node.keys.len();
            count += keys;

            if node.vals.len() != keys {
                return Err(format!("node {id} has {keys} keys but {} values", node.vals.len()));
            }
            if keys > self.max_keys() {
                return Err(format!("node {id} overflows with {keys} keys"));
            }
            if id != self.root && keys < self.min_keys() {
                return Err(format!("node {id} underflows with {keys} keys"));
            }
            if node.keys.windows(2).any(|pair| pair[0] >= pair[1]) {
                return Err(format!("node {id} keys are not strictly increasing"));
            }
            if !node.keys.iter().all(|k| within(k, lower, upper)) {
                return Err(format!("node {id} has keys outside its parent bounds"));
            }

            if node.is_leaf() {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        return Err(format!("leaf {id} at depth {depth}, expected {expected}"));
                    }
                    Some(_) => {}
                }
                continue;
            }

            if node.children.len() != keys + 1 {
                return Err(format!(
                    "node {id} has {keys} keys but {} children",
                    node.children.len()
                ));
            }
            for (i, &child) in node.children.iter().enumerate() {
                let low = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                let high = node.keys.get(i).or(upper);
                stack.push((child, depth + 1, low, high));
            }
        }

        if count != self.len {
            return Err(format!("counted {count} entries, expected {}", self.len));
        }
        Ok(())
    }
}

impl<K, V> Default for BTree<K, V> {
    fn default() -> Self {
        Self::new(DEFAULT_ORDER)
    }
}

impl<'a, K, V> IntoIterator for &'a BTree<K, V> {
    type Item = (&'a K, &'a V);
    type IntoIter = Range<'a, K, V>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for BTree<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map().entries(self.iter()).finish()
    }
}

// == Unit Tests ==
#[cfg(test)]
mod tests {
    use super::*;

    fn tree_with(order: usize, keys: impl IntoIterator<Item = u32>) -> BTree<u32, String> {
        let mut tree = BTree::new(order);
        for k in keys {
            tree.insert(k, format!("v{k}"));
        }
        tree
    }

    fn keys(range: Range<'_, u32, String>) -> Vec<u32> {
        range.map(|(k, _)| *k).collect()
    }

    #[test]
    fn test_empty_tree() {
        let tree: BTree<u32, u32> = BTree::new(4);
        assert!(tree.is_empty());
        assert_eq!(tree.height(), 0);
        assert_eq!(tree.min(), None);
        assert_eq!(tree.max(), None);
        assert_eq!(tree.lookup(&1), Err(IndexError::NotFound));
        assert_eq!(tree.iter().count(), 0);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_order_clamped() {
        let tree: BTree<u32, u32> = BTree::new(1);
        assert_eq!(tree.order(), MIN_ORDER);
    }

    #[test]
    fn test_insert_and_lookup() {
        let tree = tree_with(4, 1..=10);
        assert_eq!(tree.len(), 10);
        for k in 1..=10 {
            assert_eq!(tree.lookup(&k).unwrap(), &format!("v{k}"));
        }
        assert_eq!(tree.lookup(&11), Err(IndexError::NotFound));
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_insert_overwrite_returns_previous() {
        let mut tree = tree_with(4, 1..=3);
        assert_eq!(tree.insert(2, "new".to_string()), Some("v2".to_string()));
        assert_eq!(tree.len(), 3);
        assert_eq!(tree.lookup(&2).unwrap(), "new");
    }

    #[test]
    fn test_root_split_grows_height() {
        let tree = tree_with(3, 1..=2);
        assert_eq!(tree.height(), 1);
        let tree = tree_with(3, 1..=3);
        assert_eq!(tree.height(), 2);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_order_four_delete_internal_key() {
        let mut tree = tree_with(4, 1..=10);
        assert_eq!(tree.delete(&5).unwrap(), "v5");
        tree.check_invariants().unwrap();
        assert_eq!(keys(tree.range(1..=10)), vec![1, 2, 3, 4, 6, 7, 8, 9, 10]);
        assert_eq!(tree.delete(&5), Err(IndexError::NotFound));
    }

    #[test]
    fn test_delete_everything_ascending_and_descending() {
        for order in [3, 4, 5, 8] {
            let mut tree = tree_with(order, 0..200);
            for k in 0..100 {
                tree.delete(&k).unwrap();
                tree.check_invariants().unwrap();
            }
            for k in (100..200).rev() {
                tree.delete(&k).unwrap();
                tree.check_invariants().unwrap();
            }
            assert!(tree.is_empty());
            assert_eq!(tree.min(), None);
            assert_eq!(tree.max(), None);
            assert_eq!(tree.height(), 0);
        }
    }

    #[test]
    fn test_min_max() {
        let tree = tree_with(5, [42, 7, 19, 88, 3]);
        assert_eq!(tree.min().map(|(k, _)| *k), Some(3));
        assert_eq!(tree.max().map(|(k, _)| *k), Some(88));
    }

    #[test]
    fn test_pop_first_drains_in_order() {
        let mut tree = tree_with(4, [5, 1, 9, 3, 7, 2, 8]);
        let mut drained = Vec::new();
        while let Some((k, _)) = tree.pop_first() {
            drained.push(k);
            tree.check_invariants().unwrap();
        }
        assert_eq!(drained, vec![1, 2, 3, 5, 7, 8, 9]);
    }

    #[test]
    fn test_range_bounds() {
        let tree = tree_with(4, (0..50).map(|k| k * 2));
        assert_eq!(keys(tree.range(10..16)), vec![10, 12, 14]);
        assert_eq!(keys(tree.range(9..=16)), vec![10, 12, 14, 16]);
        assert_eq!(keys(tree.range(..4)), vec![0, 2]);
        assert_eq!(keys(tree.range(95..)), vec![96, 98]);
        assert_eq!(
            keys(tree.range((Bound::Excluded(10), Bound::Excluded(14)))),
            vec![12]
        );
        assert_eq!(keys(tree.range(200..)), Vec::<u32>::new());
        assert_eq!(keys(tree.range(11..12)), Vec::<u32>::new());
        assert_eq!(tree.range(..).count(), 50);
    }

    #[test]
    fn test_inverted_range_is_empty() {
        let tree = tree_with(4, 0..20);
        assert_eq!(
            keys(tree.range((Bound::Included(15), Bound::Excluded(5)))),
            Vec::<u32>::new()
        );
    }

    #[test]
    fn test_range_is_restartable() {
        let tree = tree_with(4, 0..20);
        let mut range = tree.range(5..10);
        range.next();
        let fork = range.clone();
        assert_eq!(keys(range), vec![6, 7, 8, 9]);
        assert_eq!(keys(fork), vec![6, 7, 8, 9]);
        assert_eq!(keys(tree.range(5..10)), vec![5, 6, 7, 8, 9]);
    }

    #[test]
    fn test_borrowed_lookup() {
        let mut tree: BTree<String, u32> = BTree::new(4);
        tree.insert("alpha".to_string(), 1);
        tree.insert("beta".to_string(), 2);
        assert_eq!(tree.lookup("beta"), Ok(&2));
        *tree.lookup_mut("alpha").unwrap() += 10;
        assert_eq!(tree.delete("alpha"), Ok(11));
        let collected: Vec<_> = tree
            .range::<str, _>((Bound::Included("a"), Bound::Excluded("z")))
            .map(|(k, _)| k.as_str())
            .collect();
        assert_eq!(collected, vec!["beta"]);
    }

    #[test]
    fn test_clear_resets() {
        let mut tree = tree_with(4, 0..100);
        tree.clear();
        assert!(tree.is_empty());
        tree.check_invariants().unwrap();
        tree.insert(1, "one".to_string());
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_arena_nodes_reused() {
        let mut tree = tree_with(3, 0..64);
        let arena = tree.nodes.len();
        for k in 0..64 {
            tree.delete(&k).unwrap();
        }
        for k in 0..64 {
            tree.insert(k, String::new());
        }
        assert_eq!(tree.nodes.len(), arena);
        tree.check_invariants().unwrap();
    }

    #[test]
    fn test_debug_output() {
        let tree = tree_with(4, [2, 1]);
        assert_eq!(format!("{tree:?}"), r#"{1: "v1", 2: "v2"}"#);
    }
}
