//! lifecache - A lifecycle-tracked allocator and a TTL cache on top of it
//!
//! Value storage is handed out as generation-tagged handles so stale accesses
//! are reported instead of dereferenced. The cache keeps keys in a B-tree
//! ordered index and expiry times in a second B-tree, guarded by an epoch
//! lock for multithreaded use.

pub mod btree;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod mem;
pub mod sync;
pub mod tasks;

pub use btree::BTree;
pub use cache::{CacheOptions, CacheStats, TtlCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::Config;
pub use error::{AccessError, AllocError, CacheError, IndexError, Result};
pub use mem::{AllocFlags, Allocator, AllocatorConfig, MemHandle};
pub use sync::EpochLock;
pub use tasks::spawn_sweep_task;
