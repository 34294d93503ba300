//! Ordered Index Module
//!
//! A B-tree map used by the cache for key lookup and expiry ordering.

mod node;
mod range;
mod tree;

#[cfg(test)]
mod property_tests;

pub use range::Range;
pub use tree::{BTree, DEFAULT_ORDER, MIN_ORDER};
