//! Memory Module
//!
//! Lifecycle-tracked allocation. Blocks are addressed through
//! generation-tagged handles and validated on every access; freed blocks wait
//! in a dirty pointer set until an autoclean pass reclaims them.

mod allocator;
mod block;
mod flags;
mod handle;
mod registry;

#[cfg(test)]
mod property_tests;

pub use allocator::{
    Allocator, AllocatorConfig, DirtyPointers, MemoryStats, DEFAULT_ACCESS_ANOMALY_THRESHOLD, DEFAULT_HIGH_WATERMARK,
};
pub use block::{Backing, BlockRef};
pub use flags::{cache_line_size, page_size, AllocFlags, CACHE_LINE_SIZE, DEFAULT_PAGE_SIZE, HUGE_PAGE_SIZE};
pub use handle::MemHandle;
pub use registry::{LifecycleSnapshot, LifecycleState};
