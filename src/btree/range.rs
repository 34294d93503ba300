//! Ordered iteration over a key range.

use std::fmt;

use crate::btree::node::NodeId;
use crate::btree::BTree;

/// Lazy in-order iterator over the entries of a [`BTree`] within a range.
///
/// Holds an explicit stack of `(node, next key index)` frames. Cloning the
/// iterator restarts nothing; it forks the cursor at its current position.
pub struct Range<'a, K, V> {
    tree: &'a BTree<K, V>,
    stack: Vec<(NodeId, usize)>,
    /// Position of the first entry past the range, if any
    end: Option<(NodeId, usize)>,
}

impl<'a, K, V> Range<'a, K, V> {
    pub(crate) fn new(
        tree: &'a BTree<K, V>,
        stack: Vec<(NodeId, usize)>,
        end: Option<(NodeId, usize)>,
    ) -> Self {
        Self { tree, stack, end }
    }

    pub(crate) fn empty(tree: &'a BTree<K, V>) -> Self {
        Self {
            tree,
            stack: Vec::new(),
            end: None,
        }
    }
}

impl<'a, K, V> Iterator for Range<'a, K, V> {
    type Item = (&'a K, &'a V);

    fn next(&mut self) -> Option<Self::Item> {
        let tree = self.tree;
        loop {
            let &(id, index) = self.stack.last()?;
            let node = tree.node(id);
            if index >= node.keys.len() {
                self.stack.pop();
                continue;
            }
            if self.end == Some((id, index)) {
                self.stack.clear();
                return None;
            }

            if let Some(frame) = self.stack.last_mut() {
                frame.1 += 1;
            }
            if !node.is_leaf() {
                let mut child = node.children[index + 1];
                loop {
                    self.stack.push((child, 0));
                    let next = tree.node(child);
                    if next.is_leaf() {
                        break;
                    }
                    child = next.children[0];
                }
            }
            return Some((&node.keys[index], &node.vals[index]));
        }
    }
}

impl<K, V> Clone for Range<'_, K, V> {
    fn clone(&self) -> Self {
        Self {
            tree: self.tree,
            stack: self.stack.clone(),
            end: self.end,
        }
    }
}

impl<K, V> fmt::Debug for Range<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Range")
            .field("depth", &self.stack.len())
            .field("end", &self.end)
            .finish()
    }
}
