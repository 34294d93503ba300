//! Cache Store Module
//!
//! Main cache engine: a key index and an expiry index, both B-trees behind
//! one epoch lock, with value bytes held in lifecycle-tracked allocations.
//!
//! Value storage is allocated and filled before the write permit is taken and
//! replaced storage is freed after it is released, so the critical section
//! only touches the indexes.

use std::borrow::Borrow;
use std::fmt::{self, Display};
use std::mem;
use std::ops::RangeBounds;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::btree::{BTree, DEFAULT_ORDER};
use crate::cache::stats::StatsRecorder;
use crate::cache::{CacheEntry, CacheStats, ExpiryKey, MAX_VALUE_SIZE};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{CacheError, Result};
use crate::mem::{AllocFlags, Allocator, MemHandle};
use crate::sync::EpochLock;

// == Cache Options ==
/// Construction parameters for [`TtlCache`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheOptions {
    /// Maximum number of entries the cache can hold
    pub max_entries: usize,
    /// TTL applied when `put` is called without one, None = no expiry
    pub default_ttl: Option<Duration>,
    /// Order of both B-tree indexes
    pub btree_order: usize,
    /// Flags used for value allocations
    pub value_flags: AllocFlags,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            max_entries: 1000,
            default_ttl: Some(Duration::from_secs(300)),
            btree_order: DEFAULT_ORDER,
            value_flags: AllocFlags::DEFAULT,
        }
    }
}

impl From<&Config> for CacheOptions {
    fn from(config: &Config) -> Self {
        let value_flags = if config.strict_values {
            AllocFlags::STRICT_CHECK
        } else {
            AllocFlags::DEFAULT
        };
        Self {
            max_entries: config.max_entries,
            default_ttl: config.default_ttl(),
            btree_order: config.btree_order,
            value_flags,
        }
    }
}

// == Indexes ==
/// Key index plus expiry index. Every entry appears in both.
struct Indexes<K> {
    by_key: BTree<K, CacheEntry>,
    by_expiry: BTree<ExpiryKey, K>,
}

/// What a put did besides inserting.
enum PutOutcome {
    Inserted,
    Replaced(MemHandle),
    Evicted(MemHandle),
}

impl<K> Indexes<K> {
    fn new(order: usize) -> Self {
        Self {
            by_key: BTree::new(order),
            by_expiry: BTree::new(order),
        }
    }
}

impl<K: Ord + Clone> Indexes<K> {
    fn upsert(&mut self, key: K, entry: CacheEntry, max_entries: usize) -> Result<PutOutcome> {
        let new_expiry = entry.expiry_key();

        if let Ok(slot) = self.by_key.lookup_mut(&key) {
            if self.by_expiry.delete(&slot.expiry_key()).is_err() {
                return Err(violation("overwritten entry missing from expiry index"));
            }
            let old = mem::replace(slot, entry);
            self.by_expiry.insert(new_expiry, key);
            return Ok(PutOutcome::Replaced(old.handle));
        }

        let mut outcome = PutOutcome::Inserted;
        if self.by_key.len() >= max_entries {
            let Some((_, victim)) = self.by_expiry.pop_first() else {
                return Err(violation("cache at capacity with an empty expiry index"));
            };
            match self.by_key.delete(&victim) {
                Ok(evicted) => outcome = PutOutcome::Evicted(evicted.handle),
                Err(_) => return Err(violation("eviction victim missing from key index")),
            }
        }

        self.by_key.insert(key.clone(), entry);
        self.by_expiry.insert(new_expiry, key);
        Ok(outcome)
    }

    fn remove<Q>(&mut self, key: &Q) -> Result<Option<CacheEntry>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let Ok(entry) = self.by_key.delete(key) else {
            return Ok(None);
        };
        if self.by_expiry.delete(&entry.expiry_key()).is_err() {
            return Err(violation("deleted entry missing from expiry index"));
        }
        Ok(Some(entry))
    }

    /// Removes entries from the front of the expiry index while they are
    /// expired, returning their storage handles.
    ///
    /// Stops at the first inconsistency; handles already detached are
    /// returned alongside the error so their storage can still be freed.
    fn reap_expired(&mut self, now_ms: u64) -> (Vec<MemHandle>, Result<()>) {
        let mut reaped = Vec::new();
        while self
            .by_expiry
            .min()
            .is_some_and(|(expiry, _)| expiry.is_expired(now_ms))
        {
            let Some((_, key)) = self.by_expiry.pop_first() else {
                break;
            };
            match self.by_key.delete(&key) {
                Ok(entry) => reaped.push(entry.handle),
                Err(_) => return (reaped, Err(violation("expired entry missing from key index"))),
            }
        }
        (reaped, Ok(()))
    }

    fn check_invariants(&self) -> Result<()> {
        self.by_key
            .check_invariants()
            .map_err(|msg| violation(&format!("key index: {msg}")))?;
        self.by_expiry
            .check_invariants()
            .map_err(|msg| violation(&format!("expiry index: {msg}")))?;
        if self.by_key.len() != self.by_expiry.len() {
            return Err(violation("key and expiry indexes differ in size"));
        }
        for (key, entry) in &self.by_key {
            match self.by_expiry.lookup(&entry.expiry_key()) {
                Ok(back) if back == key => {}
                _ => return Err(violation("entry not mirrored in expiry index")),
            }
        }
        Ok(())
    }
}

fn violation(message: &str) -> CacheError {
    error!(reason = message, "cache invariant violated");
    CacheError::InvariantViolation(message.to_string())
}

// == TTL Cache ==
/// Thread-safe TTL cache over lifecycle-tracked value storage.
///
/// Share it between threads with `Arc<TtlCache<K>>`; every operation takes
/// `&self`.
pub struct TtlCache<K> {
    indexes: EpochLock<Indexes<K>>,
    allocator: Allocator,
    clock: Arc<dyn Clock>,
    stats: StatsRecorder,
    next_seq: AtomicU64,
    options: CacheOptions,
}

impl<K> TtlCache<K> {
    // == Constructor ==
    /// Creates a cache with its own allocator and the system clock.
    ///
    /// # Arguments
    /// * `max_entries` - Maximum number of entries the cache can hold
    /// * `default_ttl` - TTL for entries stored without one, None = no expiry
    pub fn new(max_entries: usize, default_ttl: Option<Duration>) -> Self {
        let options = CacheOptions {
            max_entries,
            default_ttl,
            ..CacheOptions::default()
        };
        Self::with_options(options, Allocator::new(), Arc::new(SystemClock::new()))
    }

    /// Creates a cache from loaded configuration, storing values in
    /// `allocator`.
    pub fn from_config(config: &Config, allocator: Allocator) -> Self {
        Self::with_options(config.into(), allocator, Arc::new(SystemClock::new()))
    }

    /// Creates a cache with explicit options, allocator and clock.
    pub fn with_options(options: CacheOptions, allocator: Allocator, clock: Arc<dyn Clock>) -> Self {
        Self {
            indexes: EpochLock::new(Indexes::new(options.btree_order)),
            allocator,
            clock,
            stats: StatsRecorder::default(),
            next_seq: AtomicU64::new(0),
            options,
        }
    }

    pub fn options(&self) -> &CacheOptions {
        &self.options
    }

    /// The allocator holding value storage.
    pub fn allocator(&self) -> &Allocator {
        &self.allocator
    }

    // == Length ==
    /// Returns the number of entries, including expired ones not yet reaped.
    pub fn len(&self) -> usize {
        self.indexes.read().by_key.len()
    }

    // == Is Empty ==
    /// Returns true if the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Count of completed write critical sections.
    pub fn epoch(&self) -> u64 {
        self.indexes.epoch()
    }

    // == Stats ==
    /// Returns current cache statistics.
    pub fn stats(&self) -> CacheStats {
        self.stats.snapshot(self.len())
    }

    /// Frees storage detached from the indexes. Runs outside any permit.
    fn release<I>(&self, handles: I)
    where
        I: IntoIterator<Item = MemHandle>,
    {
        for handle in handles {
            if let Err(err) = self.allocator.free(handle) {
                error!(%handle, error = %err, "failed to free cache value");
            }
        }
    }

    fn store_value(&self, value: &[u8]) -> Result<MemHandle> {
        let handle = self.allocator.alloc(value.len(), self.options.value_flags)?;
        match self.allocator.access(handle) {
            Ok(block) => {
                block.write().copy_from_slice(value);
                Ok(handle)
            }
            Err(err) => {
                self.release([handle]);
                Err(err.into())
            }
        }
    }
}

impl<K: Ord + Clone> TtlCache<K> {
    // == Put ==
    /// Stores a value under `key`, replacing any previous entry.
    ///
    /// A new key at capacity evicts the entry nearest to expiry, or the oldest
    /// entry when none expire.
    ///
    /// # Arguments
    /// * `key` - The key to store
    /// * `value` - The bytes to store
    /// * `ttl` - Time to live (uses the default TTL if None)
    pub fn put(&self, key: K, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        self.insert(key, value, ttl.or(self.options.default_ttl))
    }

    /// Stores a value that never expires.
    pub fn put_persistent(&self, key: K, value: &[u8]) -> Result<()> {
        self.insert(key, value, None)
    }

    fn insert(&self, key: K, value: &[u8], ttl: Option<Duration>) -> Result<()> {
        if value.len() > MAX_VALUE_SIZE {
            return Err(CacheError::InvalidRequest(format!(
                "Value exceeds maximum size of {} bytes",
                MAX_VALUE_SIZE
            )));
        }
        if self.options.max_entries == 0 {
            return Err(CacheError::CapacityExceeded(
                "cache configured with zero capacity".to_string(),
            ));
        }

        let handle = self.store_value(value)?;

        let outcome = {
            let mut indexes = self.indexes.write();
            let now = self.clock.now_ms();
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            let entry = CacheEntry::new(handle, value.len(), now, ttl, seq);
            indexes.upsert(key, entry, self.options.max_entries)
        };

        match outcome {
            Ok(PutOutcome::Inserted) => {
                self.stats.record_put(false);
            }
            Ok(PutOutcome::Replaced(old)) => {
                self.stats.record_put(true);
                self.release([old]);
            }
            Ok(PutOutcome::Evicted(victim)) => {
                self.stats.record_put(false);
                self.stats.record_eviction();
                debug!(%victim, "evicted entry to admit new key");
                self.release([victim]);
            }
            Err(err) => {
                self.release([handle]);
                return Err(err);
            }
        }
        Ok(())
    }

    // == Get ==
    /// Retrieves a copy of the value stored under `key`.
    ///
    /// Never modifies the cache: an expired entry keeps reporting `Expired`
    /// until a sweep, eviction, overwrite or delete removes it.
    pub fn get<Q>(&self, key: &Q) -> Result<Vec<u8>>
    where
        K: Borrow<Q>,
        Q: Ord + Display + ?Sized,
    {
        let block = {
            let indexes = self.indexes.read();
            let now = self.clock.now_ms();
            match indexes.by_key.lookup(key) {
                Err(_) => {
                    self.stats.record_miss();
                    return Err(CacheError::NotFound(key.to_string()));
                }
                Ok(entry) if entry.is_expired(now) => {
                    self.stats.record_expired_read();
                    return Err(CacheError::Expired(key.to_string()));
                }
                Ok(entry) => self.allocator.access(entry.handle)?,
            }
        };

        self.stats.record_hit();
        Ok(block.to_vec())
    }

    /// Returns true if `key` holds an unexpired entry.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        let indexes = self.indexes.read();
        let now = self.clock.now_ms();
        indexes
            .by_key
            .lookup(key)
            .is_ok_and(|entry| !entry.is_expired(now))
    }

    /// Remaining lifetime of the entry under `key`, None if it never expires.
    pub fn ttl_remaining<Q>(&self, key: &Q) -> Result<Option<Duration>>
    where
        K: Borrow<Q>,
        Q: Ord + Display + ?Sized,
    {
        let indexes = self.indexes.read();
        let now = self.clock.now_ms();
        match indexes.by_key.lookup(key) {
            Err(_) => Err(CacheError::NotFound(key.to_string())),
            Ok(entry) if entry.is_expired(now) => Err(CacheError::Expired(key.to_string())),
            Ok(entry) => Ok(entry.ttl_remaining(now)),
        }
    }

    /// Storage handle of the entry under `key`, expired or not.
    pub fn entry_handle<Q>(&self, key: &Q) -> Option<MemHandle>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
    {
        self.indexes
            .read()
            .by_key
            .lookup(key)
            .ok()
            .map(|entry| entry.handle)
    }

    // == Range ==
    /// Unexpired entries with keys in `range`, in key order.
    pub fn range<Q, R>(&self, range: R) -> Result<Vec<(K, Vec<u8>)>>
    where
        K: Borrow<Q>,
        Q: Ord + ?Sized,
        R: RangeBounds<Q>,
    {
        let blocks = {
            let indexes = self.indexes.read();
            let now = self.clock.now_ms();
            indexes
                .by_key
                .range(range)
                .filter(|(_, entry)| !entry.is_expired(now))
                .map(|(key, entry)| {
                    self.allocator
                        .access(entry.handle)
                        .map(|block| (key.clone(), block))
                        .map_err(CacheError::from)
                })
                .collect::<Result<Vec<_>>>()?
        };

        Ok(blocks
            .into_iter()
            .map(|(key, block)| (key, block.to_vec()))
            .collect())
    }

    // == Delete ==
    /// Removes an entry by key.
    ///
    /// # Arguments
    /// * `key` - The key to delete
    pub fn delete<Q>(&self, key: &Q) -> Result<()>
    where
        K: Borrow<Q>,
        Q: Ord + Display + ?Sized,
    {
        let removed = self.indexes.write().remove(key)?;
        match removed {
            Some(entry) => {
                self.stats.record_delete();
                self.release([entry.handle]);
                Ok(())
            }
            None => Err(CacheError::NotFound(key.to_string())),
        }
    }

    // == Sweep Expired ==
    /// Removes all expired entries from the cache.
    ///
    /// Walks the expiry index from the front, so the cost is proportional to
    /// the number of expired entries. Returns the number of entries removed.
    pub fn sweep_expired(&self) -> usize {
        let (handles, outcome) = {
            let mut indexes = self.indexes.write();
            let now = self.clock.now_ms();
            indexes.reap_expired(now)
        };

        let count = handles.len();
        self.release(handles);
        self.stats.record_expirations(count);
        match outcome {
            Err(err) => warn!(count, error = %err, "sweep stopped early"),
            Ok(()) if count > 0 => info!(count, "swept expired entries"),
            Ok(()) => debug!("sweep found no expired entries"),
        }
        count
    }

    // == Clear ==
    /// Removes every entry, returning how many were removed.
    pub fn clear(&self) -> usize {
        let old = {
            let mut indexes = self.indexes.write();
            mem::replace(&mut *indexes, Indexes::new(self.options.btree_order))
        };
        let count = old.by_key.len();
        self.release(old.by_key.iter().map(|(_, entry)| entry.handle));
        count
    }

    /// Verifies both indexes and their agreement with each other.
    pub fn check_invariants(&self) -> Result<()> {
        self.indexes.read().check_invariants()
    }
}

impl<K> Drop for TtlCache<K> {
    fn drop(&mut self) {
        let handles: Vec<_> = self
            .indexes
            .get_mut()
            .by_key
            .iter()
            .map(|(_, entry)| entry.handle)
            .collect();
        self.release(handles);
    }
}

impl<K> fmt::Debug for TtlCache<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TtlCache")
            .field("len", &self.len())
            .field("options", &self.options)
            .field("clock", &self.clock)
            .finish()
    }
}
