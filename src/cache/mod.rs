//! Cache Module
//!
//! Provides a thread-safe in-memory cache with TTL expiration, ordered keys
//! and capacity eviction by nearest expiry.

mod entry;
mod stats;
mod store;

#[cfg(test)]
mod property_tests;

// Re-export public types
pub use entry::{CacheEntry, ExpiryKey};
pub use stats::CacheStats;
pub use store::{CacheOptions, TtlCache};

// == Public Constants ==
/// Maximum allowed value size in bytes
pub const MAX_VALUE_SIZE: usize = 1024 * 1024; // 1 MB
