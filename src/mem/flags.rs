//! Allocation Flags Module
//!
//! Behavioral flags accepted by the allocator, plus the cache line and page
//! size queries the flags depend on.

use bitflags::bitflags;
use serde::Serialize;

/// Fallback cache line size used when the platform does not report one.
pub const CACHE_LINE_SIZE: usize = 64;

/// Fallback page size used when the platform does not report one.
pub const DEFAULT_PAGE_SIZE: usize = 4096;

/// Huge page size requested for `HUGE_PAGES` mappings.
pub const HUGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

bitflags! {
    /// Flags controlling how a block is backed and checked.
    ///
    /// Flags are orthogonal and may be combined freely.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
    pub struct AllocFlags: u32 {
        /// Try to back the block with huge pages; falls back to the heap.
        const HUGE_PAGES = 1 << 0;
        /// Align the block to the cache line size.
        const CACHE_ALIGNED = 1 << 1;
        /// Surround the block with canaries verified on every access.
        const STRICT_CHECK = 1 << 2;
        /// The block lives for the whole process and is excluded from leak audits.
        const FOREVER = 1 << 3;
    }
}

impl AllocFlags {
    /// No special behavior.
    pub const DEFAULT: AllocFlags = AllocFlags::empty();

    /// Returns true when strict boundary checking is requested.
    pub fn is_strict(&self) -> bool {
        self.contains(AllocFlags::STRICT_CHECK)
    }

    /// Returns true when the block is marked as living forever.
    pub fn is_forever(&self) -> bool {
        self.contains(AllocFlags::FOREVER)
    }
}

// == Platform Queries ==
/// Returns the L1 data cache line size reported by the platform.
pub fn cache_line_size() -> usize {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: sysconf has no preconditions.
        let reported = unsafe { libc::sysconf(libc::_SC_LEVEL1_DCACHE_LINESIZE) };
        if reported > 0 {
            return reported as usize;
        }
    }
    CACHE_LINE_SIZE
}

/// Returns the platform page size.
pub fn page_size() -> usize {
    #[cfg(unix)]
    {
        // SAFETY: sysconf has no preconditions.
        let reported = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if reported > 0 {
            return reported as usize;
        }
    }
    DEFAULT_PAGE_SIZE
}
