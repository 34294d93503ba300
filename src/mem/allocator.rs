//! Allocator Module
//!
//! Flagged allocation with lifecycle tracking. Every block is reached through
//! a generation-tagged [`MemHandle`]; `access` is the single choke point that
//! turns a handle into readable memory and fails fast on stale handles.
//!
//! Blocks may carry a lifetime measured on the allocator's [`Clock`]; once it
//! runs out, `access` denies the block until it is freed.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{AccessError, AllocError};
use crate::mem::block::{Backing, Block, BlockRef, RawBlock, MIN_ALIGN};
use crate::mem::registry::{LifecycleSnapshot, Registry};
use crate::mem::{cache_line_size, page_size, AllocFlags, MemHandle};

/// Default live-byte threshold above which memory pressure is reported.
pub const DEFAULT_HIGH_WATERMARK: usize = 512 * 1024 * 1024;

/// Access count above which `audit_anomalies` flags a live block by default.
pub const DEFAULT_ACCESS_ANOMALY_THRESHOLD: u64 = 1_000_000;

// == Allocator Config ==
/// Allocator tuning parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocatorConfig {
    /// Upper bound on bytes retained by live and dirty blocks, if any
    pub memory_limit_bytes: Option<usize>,
    /// Live bytes above which `is_pressure_high` reports true
    pub high_watermark_bytes: usize,
}

impl Default for AllocatorConfig {
    fn default() -> Self {
        Self {
            memory_limit_bytes: None,
            high_watermark_bytes: DEFAULT_HIGH_WATERMARK,
        }
    }
}

// == Memory Stats ==
/// Allocator counters and occupancy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    /// Blocks currently live
    pub live_allocations: usize,
    /// Bytes held by live blocks
    pub live_bytes: usize,
    /// Freed blocks awaiting reclamation
    pub dirty_pointers: usize,
    /// Bytes held by freed blocks awaiting reclamation
    pub dirty_bytes: usize,
    pub total_allocs: u64,
    pub total_frees: u64,
    /// Registry entries reclaimed by autoclean passes
    pub total_purged: u64,
    /// Blocks that obtained huge page backing
    pub huge_page_allocs: u64,
    /// Huge page requests served from the heap instead
    pub huge_page_fallbacks: u64,
    /// Allocations retried after an out-of-memory reclamation pass
    pub oom_retries: u64,
}

#[derive(Default)]
struct AllocCounters {
    allocs: AtomicU64,
    frees: AtomicU64,
    purged: AtomicU64,
    huge_pages: AtomicU64,
    huge_page_fallbacks: AtomicU64,
    oom_retries: AtomicU64,
}

struct AllocatorInner {
    registry: Registry,
    config: AllocatorConfig,
    counters: AllocCounters,
    clock: Arc<dyn Clock>,
}

impl Drop for AllocatorInner {
    fn drop(&mut self) {
        let leaked = self.registry.live_snapshots(|snapshot| !snapshot.is_forever());
        if !leaked.is_empty() {
            warn!(count = leaked.len(), "allocator dropped with live allocations");
        }
        self.registry.reclaim(false);
    }
}

// == Dirty Pointer Snapshot ==
/// Iterator over a point-in-time snapshot of the dirty pointer set.
#[derive(Debug)]
pub struct DirtyPointers {
    entries: std::vec::IntoIter<LifecycleSnapshot>,
}

impl Iterator for DirtyPointers {
    type Item = LifecycleSnapshot;

    fn next(&mut self) -> Option<Self::Item> {
        self.entries.next()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.entries.size_hint()
    }
}

impl ExactSizeIterator for DirtyPointers {}

// == Allocator ==
/// Shared handle to a lifecycle-tracking allocator.
///
/// Clones refer to the same registry, so the allocator can be handed to the
/// cache and to any other subsystem at once.
#[derive(Clone)]
pub struct Allocator {
    inner: Arc<AllocatorInner>,
}

impl Allocator {
    // == Constructor ==
    /// Creates an allocator with the default configuration.
    pub fn new() -> Self {
        Self::with_config(AllocatorConfig::default())
    }

    /// Creates an allocator with the given configuration.
    pub fn with_config(config: AllocatorConfig) -> Self {
        Self::with_clock(config, Arc::new(SystemClock::new()))
    }

    /// Creates an allocator whose block lifetimes are measured on `clock`.
    pub fn with_clock(config: AllocatorConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(AllocatorInner {
                registry: Registry::new(),
                config,
                counters: AllocCounters::default(),
                clock,
            }),
        }
    }

    pub fn config(&self) -> &AllocatorConfig {
        &self.inner.config
    }

    // == Alloc ==
    /// Allocates `size` zeroed bytes honoring `flags`.
    ///
    /// `CACHE_ALIGNED` aligns the block to [`cache_line_size`]. `HUGE_PAGES`
    /// falls back to the heap when huge pages are unavailable.
    pub fn alloc(&self, size: usize, flags: AllocFlags) -> Result<MemHandle, AllocError> {
        self.alloc_aligned(size, MIN_ALIGN, flags)
    }

    /// Same as [`Allocator::alloc`].
    pub fn alloc_with_flags(&self, size: usize, flags: AllocFlags) -> Result<MemHandle, AllocError> {
        self.alloc(size, flags)
    }

    /// Allocates `size` zeroed bytes aligned to `align`.
    ///
    /// # Errors
    /// - `AlignmentUnsatisfiable` if `align` is not a power of two or is
    ///   larger than the platform page size
    /// - `OutOfMemory` if storage cannot be obtained after one reclamation pass
    pub fn alloc_aligned(
        &self,
        size: usize,
        align: usize,
        flags: AllocFlags,
    ) -> Result<MemHandle, AllocError> {
        self.alloc_tracked(size, align, flags, None)
    }

    // == Alloc With Lifetime ==
    /// Allocates `size` zeroed bytes that stay accessible for `lifetime`.
    ///
    /// `FOREVER` overrides the lifetime. An expired block stays registered
    /// until it is freed; `access` rejects it with `LifetimeExpired` and
    /// [`Allocator::audit_anomalies`] reports it.
    pub fn alloc_with_lifetime(
        &self,
        size: usize,
        lifetime: Duration,
        flags: AllocFlags,
    ) -> Result<MemHandle, AllocError> {
        let expires_at_ms = if flags.is_forever() {
            None
        } else {
            let ms = u64::try_from(lifetime.as_millis()).unwrap_or(u64::MAX);
            Some(self.inner.clock.now_ms().saturating_add(ms))
        };
        self.alloc_tracked(size, MIN_ALIGN, flags, expires_at_ms)
    }

    fn alloc_tracked(
        &self,
        size: usize,
        align: usize,
        flags: AllocFlags,
        expires_at_ms: Option<u64>,
    ) -> Result<MemHandle, AllocError> {
        let align = if flags.contains(AllocFlags::CACHE_ALIGNED) {
            align.max(cache_line_size())
        } else {
            align
        };
        if !align.is_power_of_two() || align > page_size() {
            return Err(AllocError::AlignmentUnsatisfiable { align });
        }

        let handle = self.acquire(size, align, flags, expires_at_ms)?;
        self.inner.counters.allocs.fetch_add(1, Ordering::Relaxed);
        Ok(handle)
    }

    fn acquire(
        &self,
        size: usize,
        align: usize,
        flags: AllocFlags,
        expires_at_ms: Option<u64>,
    ) -> Result<MemHandle, AllocError> {
        match self.try_acquire(size, align, flags, expires_at_ms) {
            Err(AllocError::OutOfMemory { .. }) => {
                let purged = self.autoclean_dirty_pointers();
                self.inner.counters.oom_retries.fetch_add(1, Ordering::Relaxed);
                warn!(size, purged, "allocation failed, retrying after reclaiming dirty pointers");
                self.try_acquire(size, align, flags, expires_at_ms).inspect_err(|err| {
                    warn!(size, error = %err, "allocation failed after reclamation");
                })
            }
            other => other,
        }
    }

    fn try_acquire(
        &self,
        size: usize,
        align: usize,
        flags: AllocFlags,
        expires_at_ms: Option<u64>,
    ) -> Result<MemHandle, AllocError> {
        let limit = self.inner.config.memory_limit_bytes;
        // Early rejection only; the registry enforces the limit when the
        // block is registered.
        if let Some(limit) = limit {
            let counts = self.inner.registry.counts();
            let retained = counts.live_bytes + counts.dirty_bytes;
            if retained.saturating_add(size) > limit {
                return Err(AllocError::OutOfMemory { size });
            }
        }

        let raw = RawBlock::allocate(size, align, flags)?;
        let backing = raw.backing();
        let handle = self
            .inner
            .registry
            .register(Block::new(raw), size, flags, expires_at_ms, limit)?;

        if flags.contains(AllocFlags::HUGE_PAGES) {
            let counters = &self.inner.counters;
            if backing == Backing::HugePages {
                counters.huge_pages.fetch_add(1, Ordering::Relaxed);
            } else {
                counters.huge_page_fallbacks.fetch_add(1, Ordering::Relaxed);
                debug!(size, "huge pages unavailable, using heap backing");
            }
        }
        Ok(handle)
    }

    // == Realloc ==
    /// Moves a live block's contents into a new block of `new_size` bytes.
    ///
    /// The first `min(old, new)` bytes are preserved and the old handle is
    /// freed. The old block's `STRICT_CHECK` setting and expiry carry over.
    pub fn realloc(
        &self,
        handle: MemHandle,
        new_size: usize,
        flags: AllocFlags,
    ) -> Result<MemHandle, AllocError> {
        let (old_flags, old_expiry) = self
            .inner
            .registry
            .describe(handle)
            .map_err(|_| AllocError::InvalidHandle(handle))?;
        let old = self
            .access(handle)
            .map_err(|_| AllocError::InvalidHandle(handle))?;

        let mut flags = flags;
        flags.set(AllocFlags::STRICT_CHECK, old_flags.is_strict());
        let expires_at_ms = if flags.is_forever() { None } else { old_expiry };
        let new_handle = self.alloc_tracked(new_size, MIN_ALIGN, flags, expires_at_ms)?;

        match self.access(new_handle) {
            Ok(new) => {
                let src = old.read();
                let mut dst = new.write();
                let n = src.len().min(dst.len());
                dst[..n].copy_from_slice(&src[..n]);
            }
            Err(_) => return Err(AllocError::InvalidHandle(new_handle)),
        }

        match self.free(handle) {
            Ok(()) | Err(AccessError::Corrupted(_)) => Ok(new_handle),
            Err(_) => {
                // Lost a race with a concurrent free of the old handle.
                let _ = self.free(new_handle);
                Err(AllocError::InvalidHandle(handle))
            }
        }
    }

    // == Free ==
    /// Marks a live block as freed and adds it to the dirty pointer set.
    ///
    /// # Errors
    /// - `UseAfterFree` on double free
    /// - `UnknownHandle` for handles this allocator never issued
    /// - `Corrupted` when a strict block's canary was overwritten; the block
    ///   is still freed
    pub fn free(&self, handle: MemHandle) -> Result<(), AccessError> {
        let result = self.inner.registry.retire(handle);
        if matches!(result, Ok(()) | Err(AccessError::Corrupted(_))) {
            self.inner.counters.frees.fetch_add(1, Ordering::Relaxed);
        }
        result
    }

    // == Access ==
    /// Validates a handle and returns a reference to its block.
    pub fn access(&self, handle: MemHandle) -> Result<BlockRef, AccessError> {
        let block = self
            .inner
            .registry
            .validate(handle, self.inner.clock.now_ms())?;
        Ok(BlockRef::new(handle, block))
    }

    // == Dirty Pointers ==
    /// Returns a fresh snapshot of the dirty pointer set.
    pub fn inspect_dirty_pointers(&self) -> DirtyPointers {
        DirtyPointers {
            entries: self.inner.registry.dirty_snapshots().into_iter(),
        }
    }

    /// Reclaims every freed registry entry and returns how many were purged.
    pub fn autoclean_dirty_pointers(&self) -> usize {
        let (count, _) = self.inner.registry.reclaim(false);
        self.record_purge(count);
        count
    }

    /// Reclaims every freed registry entry and returns what was reclaimed.
    pub fn autoclean_and_inspect(&self) -> Vec<LifecycleSnapshot> {
        let (count, snapshots) = self.inner.registry.reclaim(true);
        self.record_purge(count);
        snapshots
    }

    fn record_purge(&self, count: usize) {
        if count > 0 {
            self.inner.counters.purged.fetch_add(count as u64, Ordering::Relaxed);
            debug!(count, "reclaimed dirty pointers");
        }
    }

    // == Auditing ==
    /// Live allocations not marked `FOREVER`.
    pub fn audit_leaks(&self) -> Vec<LifecycleSnapshot> {
        self.inner
            .registry
            .live_snapshots(|snapshot| !snapshot.is_forever())
    }

    /// Live allocations whose lifetime has run out or whose access count
    /// exceeds `access_threshold`.
    pub fn audit_anomalies(&self, access_threshold: u64) -> Vec<LifecycleSnapshot> {
        let now_ms = self.inner.clock.now_ms();
        let flagged = self.inner.registry.live_snapshots(|snapshot| {
            snapshot.is_expired(now_ms) || snapshot.access_count > access_threshold
        });
        if !flagged.is_empty() {
            warn!(count = flagged.len(), access_threshold, "anomalous live allocations");
        }
        flagged
    }

    /// Returns true when live bytes exceed the configured high watermark.
    pub fn is_pressure_high(&self) -> bool {
        self.inner.registry.counts().live_bytes > self.inner.config.high_watermark_bytes
    }

    pub fn stats(&self) -> MemoryStats {
        let counts = self.inner.registry.counts();
        let counters = &self.inner.counters;
        MemoryStats {
            live_allocations: counts.live_count,
            live_bytes: counts.live_bytes,
            dirty_pointers: counts.dirty_count,
            dirty_bytes: counts.dirty_bytes,
            total_allocs: counters.allocs.load(Ordering::Relaxed),
            total_frees: counters.frees.load(Ordering::Relaxed),
            total_purged: counters.purged.load(Ordering::Relaxed),
            huge_page_allocs: counters.huge_pages.load(Ordering::Relaxed),
            huge_page_fallbacks: counters.huge_page_fallbacks.load(Ordering::Relaxed),
            oom_retries: counters.oom_retries.load(Ordering::Relaxed),
        }
    }

    // == Shutdown ==
    /// Final purge. Logs live allocations that were never freed, excluding
    /// `FOREVER` blocks, and returns how many dirty entries were reclaimed.
    pub fn shutdown(&self) -> usize {
        let leaked = self.audit_leaks();
        let purged = self.autoclean_dirty_pointers();
        if leaked.is_empty() {
            info!(purged, "allocator shut down cleanly");
        } else {
            warn!(purged, leaked = leaked.len(), "allocator shut down with live allocations");
        }
        purged
    }
}

impl Default for Allocator {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Allocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts = self.inner.registry.counts();
        f.debug_struct("Allocator")
            .field("live_allocations", &counts.live_count)
            .field("dirty_pointers", &counts.dirty_count)
            .field("config", &self.inner.config)
            .finish()
    }
}
