//! Synchronization Module
//!
//! A reader/writer lock that counts released write permits. The count lets
//! readers tell whether anything changed between two observations without
//! holding the lock in between.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

// == Epoch Lock ==
/// `RwLock` wrapper whose epoch advances each time a write permit is released.
#[derive(Debug, Default)]
pub struct EpochLock<T> {
    inner: RwLock<T>,
    epoch: AtomicU64,
}

/// Shared access to the protected value.
#[derive(Debug)]
pub struct ReadPermit<'a, T> {
    guard: RwLockReadGuard<'a, T>,
}

/// Exclusive access to the protected value. Releasing it bumps the epoch.
#[derive(Debug)]
pub struct WritePermit<'a, T> {
    guard: RwLockWriteGuard<'a, T>,
    epoch: &'a AtomicU64,
}

impl<T> EpochLock<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: RwLock::new(value),
            epoch: AtomicU64::new(0),
        }
    }

    /// Blocks until shared access is available.
    pub fn read(&self) -> ReadPermit<'_, T> {
        ReadPermit {
            guard: self.inner.read(),
        }
    }

    /// Blocks until exclusive access is available.
    pub fn write(&self) -> WritePermit<'_, T> {
        WritePermit {
            guard: self.inner.write(),
            epoch: &self.epoch,
        }
    }

    /// Shared access, giving up after `timeout`.
    pub fn try_read_for(&self, timeout: Duration) -> Option<ReadPermit<'_, T>> {
        self.inner
            .try_read_for(timeout)
            .map(|guard| ReadPermit { guard })
    }

    /// Exclusive access, giving up after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> Option<WritePermit<'_, T>> {
        self.inner.try_write_for(timeout).map(|guard| WritePermit {
            guard,
            epoch: &self.epoch,
        })
    }

    /// Number of write permits released so far.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Mutable access without locking; the borrow checker proves exclusivity.
    pub fn get_mut(&mut self) -> &mut T {
        self.inner.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.inner.into_inner()
    }
}

impl<T> Deref for ReadPermit<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> Deref for WritePermit<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for WritePermit<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

impl<T> Drop for WritePermit<'_, T> {
    fn drop(&mut self) {
        // Runs before the guard field is dropped, so the new epoch is
        // visible to the next holder.
        self.epoch.fetch_add(1, Ordering::Release);
    }
}
