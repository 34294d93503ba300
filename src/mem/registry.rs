//! Lifecycle Registry Module
//!
//! Maps handles to lifecycle objects and tracks the dirty pointer set: blocks
//! that have been freed but whose registry entry has not been reclaimed yet.
//!
//! All mutation happens under the exclusive side of one `RwLock`; validation
//! takes the shared side, so a Live to Freed transition is observed by other
//! threads as a single step. Canary checks run after the registry lock is
//! released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tracing::error;

use crate::error::{AccessError, AllocError};
use crate::mem::block::Block;
use crate::mem::{AllocFlags, MemHandle};

/// First generation issued for a fresh slot.
const FIRST_GENERATION: u32 = 1;

// == Lifecycle State ==
/// Liveness of a registered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum LifecycleState {
    /// Allocated and not yet freed.
    Live,
    /// Freed and waiting in the dirty pointer set.
    Freed,
}

// == Lifecycle Snapshot ==
/// Point-in-time copy of a lifecycle object, used by inspection and audits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LifecycleSnapshot {
    pub handle: MemHandle,
    pub size: usize,
    pub flags: AllocFlags,
    pub state: LifecycleState,
    pub created_at: DateTime<Utc>,
    pub freed_at: Option<DateTime<Utc>>,
    /// Number of successful guarded accesses
    pub access_count: u64,
    /// Clock reading after which access is denied, if the block has a lifetime
    pub expires_at_ms: Option<u64>,
}

impl LifecycleSnapshot {
    /// Returns true for blocks allocated with the `FOREVER` marker.
    pub fn is_forever(&self) -> bool {
        self.flags.is_forever()
    }

    /// Returns true once the block's lifetime has run out at `now_ms`.
    pub fn is_expired(&self, now_ms: u64) -> bool {
        lifetime_over(self.expires_at_ms, now_ms)
    }
}

fn lifetime_over(expires_at_ms: Option<u64>, now_ms: u64) -> bool {
    expires_at_ms.is_some_and(|expires_at| now_ms > expires_at)
}

// == Lifecycle Object ==
struct Lifecycle {
    block: Arc<Block>,
    size: usize,
    footprint: usize,
    flags: AllocFlags,
    state: LifecycleState,
    created_at: DateTime<Utc>,
    freed_at: Option<DateTime<Utc>>,
    access_count: AtomicU64,
    expires_at_ms: Option<u64>,
}

impl Lifecycle {
    fn snapshot(&self, handle: MemHandle) -> LifecycleSnapshot {
        LifecycleSnapshot {
            handle,
            size: self.size,
            flags: self.flags,
            state: self.state,
            created_at: self.created_at,
            freed_at: self.freed_at,
            access_count: self.access_count.load(Ordering::Relaxed),
            expires_at_ms: self.expires_at_ms,
        }
    }
}

struct Slot {
    generation: u32,
    lifecycle: Option<Lifecycle>,
}

impl Slot {
    fn handle(&self, index: usize) -> MemHandle {
        MemHandle::new(index as u32, self.generation)
    }
}

#[derive(Default)]
struct RegistryInner {
    slots: Vec<Slot>,
    /// Reclaimed slots available for reuse
    vacant: Vec<u32>,
    /// Slots holding freed lifecycles, in free order
    dirty: Vec<u32>,
    live_count: usize,
    live_bytes: usize,
    dirty_bytes: usize,
}

impl RegistryInner {
    fn lookup(&self, handle: MemHandle) -> Result<&Lifecycle, AccessError> {
        let slot = self
            .slots
            .get(handle.slot() as usize)
            .ok_or(AccessError::UnknownHandle(handle))?;

        if handle.generation() < FIRST_GENERATION || handle.generation() > slot.generation {
            return Err(AccessError::UnknownHandle(handle));
        }
        if handle.generation() < slot.generation {
            return Err(AccessError::UseAfterFree(handle));
        }
        match &slot.lifecycle {
            Some(lifecycle) if lifecycle.state == LifecycleState::Live => Ok(lifecycle),
            _ => Err(AccessError::UseAfterFree(handle)),
        }
    }
}

// == Registry Counters ==
/// Occupancy figures read under a single lock acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RegistryCounts {
    pub live_count: usize,
    pub live_bytes: usize,
    pub dirty_count: usize,
    pub dirty_bytes: usize,
}

// == Registry ==
/// Handle to lifecycle mapping plus the dirty pointer set.
#[derive(Default)]
pub(crate) struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    // == Register ==
    /// Records a new live block and returns its handle.
    ///
    /// Reclaimed slots are reused with a bumped generation so handles issued
    /// to earlier occupants stay invalid. With a `limit`, the block is only
    /// admitted if live plus dirty bytes stay within it; the check and the
    /// charge happen under one write lock.
    pub(crate) fn register(
        &self,
        block: Block,
        size: usize,
        flags: AllocFlags,
        expires_at_ms: Option<u64>,
        limit: Option<usize>,
    ) -> Result<MemHandle, AllocError> {
        let footprint = block.footprint();
        let mut inner = self.inner.write();

        if let Some(limit) = limit {
            let retained = inner.live_bytes + inner.dirty_bytes;
            if retained.saturating_add(footprint) > limit {
                return Err(AllocError::OutOfMemory { size });
            }
        }

        let lifecycle = Lifecycle {
            block: Arc::new(block),
            size,
            footprint,
            flags,
            state: LifecycleState::Live,
            created_at: Utc::now(),
            freed_at: None,
            access_count: AtomicU64::new(0),
            expires_at_ms,
        };
        inner.live_count += 1;
        inner.live_bytes += footprint;

        let index = match inner.vacant.pop() {
            Some(index) => {
                let slot = &mut inner.slots[index as usize];
                slot.generation += 1;
                slot.lifecycle = Some(lifecycle);
                index as usize
            }
            None => {
                inner.slots.push(Slot {
                    generation: FIRST_GENERATION,
                    lifecycle: Some(lifecycle),
                });
                inner.slots.len() - 1
            }
        };
        Ok(inner.slots[index].handle(index))
    }

    // == Validate ==
    /// Guarded dereference: returns the block if the handle is live and its
    /// lifetime has not run out at `now_ms`.
    pub(crate) fn validate(&self, handle: MemHandle, now_ms: u64) -> Result<Arc<Block>, AccessError> {
        let (block, size) = {
            let inner = self.inner.read();
            let lifecycle = inner.lookup(handle)?;
            if lifetime_over(lifecycle.expires_at_ms, now_ms) {
                return Err(AccessError::LifetimeExpired(handle));
            }
            lifecycle.access_count.fetch_add(1, Ordering::Relaxed);
            (Arc::clone(&lifecycle.block), lifecycle.size)
        };

        if !block.canaries_intact() {
            error!(%handle, size, "boundary canary corrupted on access");
            return Err(AccessError::Corrupted(handle));
        }
        Ok(block)
    }

    /// Returns the flags and expiry of a live block.
    pub(crate) fn describe(&self, handle: MemHandle) -> Result<(AllocFlags, Option<u64>), AccessError> {
        let inner = self.inner.read();
        let lifecycle = inner.lookup(handle)?;
        Ok((lifecycle.flags, lifecycle.expires_at_ms))
    }

    // == Retire ==
    /// Transitions a live block to Freed and adds it to the dirty set.
    ///
    /// A strict block with a corrupted canary is still retired, but the
    /// corruption is reported to the caller.
    pub(crate) fn retire(&self, handle: MemHandle) -> Result<(), AccessError> {
        let block = {
            let mut inner = self.inner.write();
            inner.lookup(handle)?;

            let slot = &mut inner.slots[handle.slot() as usize];
            let Some(lifecycle) = slot.lifecycle.as_mut() else {
                return Err(AccessError::UseAfterFree(handle));
            };
            lifecycle.state = LifecycleState::Freed;
            lifecycle.freed_at = Some(Utc::now());
            let footprint = lifecycle.footprint;
            let block = Arc::clone(&lifecycle.block);

            inner.live_count -= 1;
            inner.live_bytes -= footprint;
            inner.dirty_bytes += footprint;
            inner.dirty.push(handle.slot());
            block
        };

        if !block.canaries_intact() {
            error!(%handle, "boundary canary corrupted on free");
            return Err(AccessError::Corrupted(handle));
        }
        Ok(())
    }

    // == Inspect ==
    /// Snapshots every lifecycle in the dirty set without changing it.
    pub(crate) fn dirty_snapshots(&self) -> Vec<LifecycleSnapshot> {
        let inner = self.inner.read();
        inner
            .dirty
            .iter()
            .filter_map(|&index| {
                let slot = &inner.slots[index as usize];
                slot.lifecycle
                    .as_ref()
                    .map(|lifecycle| lifecycle.snapshot(slot.handle(index as usize)))
            })
            .collect()
    }

    /// Snapshots live lifecycles matching `keep`.
    pub(crate) fn live_snapshots<F>(&self, keep: F) -> Vec<LifecycleSnapshot>
    where
        F: Fn(&LifecycleSnapshot) -> bool,
    {
        let inner = self.inner.read();
        inner
            .slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                slot.lifecycle
                    .as_ref()
                    .filter(|lifecycle| lifecycle.state == LifecycleState::Live)
                    .map(|lifecycle| lifecycle.snapshot(slot.handle(index)))
            })
            .filter(|snapshot| keep(snapshot))
            .collect()
    }

    // == Reclaim ==
    /// Drains the dirty set, returning the reclaimed entries when asked to.
    ///
    /// Slot bookkeeping happens under the write lock; the blocks themselves
    /// are dropped after it is released.
    pub(crate) fn reclaim(&self, with_snapshots: bool) -> (usize, Vec<LifecycleSnapshot>) {
        let mut snapshots = Vec::new();
        let mut released = Vec::new();
        {
            let mut inner = self.inner.write();
            let dirty = std::mem::take(&mut inner.dirty);
            for &index in &dirty {
                let slot = &mut inner.slots[index as usize];
                let handle = slot.handle(index as usize);
                let Some(lifecycle) = slot.lifecycle.take() else {
                    continue;
                };
                if with_snapshots {
                    snapshots.push(lifecycle.snapshot(handle));
                }
                // A slot whose generation counter is exhausted is never reused.
                let reusable = slot.generation < u32::MAX;
                inner.dirty_bytes -= lifecycle.footprint;
                if reusable {
                    inner.vacant.push(index);
                }
                released.push(lifecycle.block);
            }
        }
        let count = released.len();
        drop(released);
        (count, snapshots)
    }

    pub(crate) fn counts(&self) -> RegistryCounts {
        let inner = self.inner.read();
        RegistryCounts {
            live_count: inner.live_count,
            live_bytes: inner.live_bytes,
            dirty_count: inner.dirty.len(),
            dirty_bytes: inner.dirty_bytes,
        }
    }

    #[cfg(test)]
    pub(crate) fn smash_canary(&self, handle: MemHandle) {
        let inner = self.inner.read();
        if let Ok(lifecycle) = inner.lookup(handle) {
            lifecycle.block.smash_end_canary();
        }
    }
}
