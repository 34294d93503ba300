//! Error types for the allocator, the ordered index and the cache
//!
//! Provides one error enum per layer using thiserror. Lower layers convert
//! into [`CacheError`] so cache callers receive a single typed result.

use thiserror::Error;

use crate::mem::MemHandle;

// == Allocation Error Enum ==
/// Failures reported by `alloc`, `alloc_aligned` and `realloc`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// The backing store could not satisfy the request, even after the
    /// huge page fallback and one reclamation pass.
    #[error("out of memory: could not acquire {size} bytes")]
    OutOfMemory { size: usize },

    /// The requested alignment cannot be honored on this platform.
    #[error("alignment of {align} bytes cannot be satisfied")]
    AlignmentUnsatisfiable { align: usize },

    /// The handle passed to `realloc` is not live.
    #[error("invalid handle {0}")]
    InvalidHandle(MemHandle),
}

// == Access Error Enum ==
/// Failures reported by the guarded dereference and by `free`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessError {
    /// The handle referred to a block that has since been freed or reclaimed.
    #[error("use after free through handle {0}")]
    UseAfterFree(MemHandle),

    /// The handle was never issued by this allocator.
    #[error("unknown handle {0}")]
    UnknownHandle(MemHandle),

    /// The block was allocated with a lifetime that has run out.
    #[error("lifetime expired for handle {0}")]
    LifetimeExpired(MemHandle),

    /// A strict-mode boundary canary was overwritten.
    #[error("boundary canary corrupted for handle {0}")]
    Corrupted(MemHandle),
}

impl AccessError {
    /// Returns true for failures that indicate a defect in the program rather
    /// than an ordinary stale access.
    pub fn is_defect(&self) -> bool {
        matches!(self, AccessError::Corrupted(_))
    }
}

// == Index Error Enum ==
/// Failures reported by the ordered index.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexError {
    /// No entry exists for the requested key.
    #[error("key not found in index")]
    NotFound,
}

// == Cache Error Enum ==
/// Unified error type for the TTL cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Key not found in cache
    #[error("Key not found: {0}")]
    NotFound(String),

    /// Key is present but its TTL has elapsed
    #[error("Key expired: {0}")]
    Expired(String),

    /// Cache cannot admit a new key
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Invalid request data
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Value storage could not be allocated
    #[error("Allocation failed: {0}")]
    Alloc(#[from] AllocError),

    /// Value storage could not be accessed
    #[error("Access failed: {0}")]
    Access(#[from] AccessError),

    /// Internal bookkeeping reached an impossible state
    #[error("Invariant violated: {0}")]
    InvariantViolation(String),
}

impl From<IndexError> for CacheError {
    fn from(err: IndexError) -> Self {
        match err {
            IndexError::NotFound => CacheError::NotFound(err.to_string()),
        }
    }
}

// == Result Type Alias ==
/// Convenience Result type for cache operations.
pub type Result<T> = std::result::Result<T, CacheError>;
