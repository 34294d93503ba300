//! Cache Entry Module
//!
//! Defines the per-key record held by the key index and the key that orders
//! the expiry index.

use std::time::Duration;

use crate::mem::MemHandle;

// == Expiry Key ==
/// Ordering key of the expiry index.
///
/// Entries sort by expiry time, nearest first, with entries that never expire
/// last. Ties and no-expiry entries fall back to insertion order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExpiryKey {
    pub expires_at: u64,
    pub seq: u64,
}

impl ExpiryKey {
    /// Expiry time used for entries without a TTL.
    pub const NEVER: u64 = u64::MAX;

    /// Returns true once `now_ms` has reached the expiry time.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expires_at != Self::NEVER && now_ms >= self.expires_at
    }
}

// == Cache Entry ==
/// Metadata for one stored value. The bytes live in allocator-owned storage
/// referenced by `handle`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    /// Handle of the value storage
    pub handle: MemHandle,
    /// Value length in bytes
    pub len: usize,
    /// Creation timestamp (clock milliseconds)
    pub created_at: u64,
    /// TTL in milliseconds, None = no expiration
    pub ttl_ms: Option<u64>,
    /// Expiration timestamp (clock milliseconds), None = no expiration
    pub expires_at: Option<u64>,
    /// Insertion sequence number, unique per cache
    pub seq: u64,
}

impl CacheEntry {
    // == Constructor ==
    /// Creates a new cache entry with optional TTL.
    ///
    /// # Arguments
    /// * `handle` - Storage holding the value bytes
    /// * `len` - Value length in bytes
    /// * `now_ms` - Current clock reading
    /// * `ttl` - Optional time to live
    /// * `seq` - Insertion sequence number
    pub fn new(handle: MemHandle, len: usize, now_ms: u64, ttl: Option<Duration>, seq: u64) -> Self {
        let ttl_ms = ttl.map(duration_ms);
        let expires_at = ttl_ms.map(|ttl| now_ms.saturating_add(ttl));

        Self {
            handle,
            len,
            created_at: now_ms,
            ttl_ms,
            expires_at,
            seq,
        }
    }

    // == Is Expired ==
    /// Checks if the entry has expired.
    ///
    /// An entry is expired once the current time is greater than or equal to
    /// its expiration time, so a zero TTL is expired immediately.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        self.expiry_key().is_expired(now_ms)
    }

    /// Position of this entry in the expiry index.
    pub fn expiry_key(&self) -> ExpiryKey {
        ExpiryKey {
            expires_at: self.expires_at.unwrap_or(ExpiryKey::NEVER),
            seq: self.seq,
        }
    }

    // == Time To Live ==
    /// Returns remaining TTL in milliseconds, or None if no expiration is set.
    ///
    /// # Returns
    /// - `Some(0)` if the entry has expired (TTL elapsed)
    /// - `Some(remaining_ms)` if the entry has TTL and hasn't expired
    /// - `None` if the entry has no TTL (never expires)
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> Option<u64> {
        self.expires_at
            .map(|expires| expires.saturating_sub(now_ms))
    }

    /// Remaining TTL as a `Duration`.
    pub fn ttl_remaining(&self, now_ms: u64) -> Option<Duration> {
        self.ttl_remaining_ms(now_ms).map(Duration::from_millis)
    }
}

/// Converts a duration to whole milliseconds, saturating.
pub(crate) fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
