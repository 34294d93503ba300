//! Block Storage Module
//!
//! Raw backing storage for allocator blocks and the validated reference
//! handed out by `access`.

use std::alloc::{self, Layout};
use std::ptr::NonNull;
use std::sync::Arc;

use parking_lot::{MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::error::AllocError;
use crate::mem::{AllocFlags, MemHandle, HUGE_PAGE_SIZE};

/// Size of each boundary canary in bytes.
pub(crate) const CANARY_LEN: usize = 8;

/// Magic written immediately before a strict block's user region.
pub(crate) const CANARY_START: u64 = 0xDEAD_BEEF_DEAD_BEEF;

/// Magic written immediately after a strict block's user region.
pub(crate) const CANARY_END: u64 = 0xBEEF_DEAD_BEEF_DEAD;

/// Minimum alignment of every block.
pub(crate) const MIN_ALIGN: usize = 16;

// == Backing Kind ==
/// Where a block's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backing {
    /// Global heap allocation.
    Heap,
    /// Anonymous huge page mapping.
    HugePages,
}

// == Raw Block ==
/// Exclusively owned storage for one allocation.
///
/// Layout: `[padding | start canary][user bytes][end canary]`, where the
/// canaries exist only for strict blocks.
#[derive(Debug)]
pub(crate) struct RawBlock {
    base: NonNull<u8>,
    layout: Layout,
    mapped_len: usize,
    offset: usize,
    len: usize,
    strict: bool,
    backing: Backing,
}

// SAFETY: RawBlock uniquely owns its allocation; access is mediated by `&`/`&mut`.
unsafe impl Send for RawBlock {}
// SAFETY: shared references only permit reads of the owned bytes.
unsafe impl Sync for RawBlock {}

impl RawBlock {
    /// Acquires zeroed storage for `len` user bytes aligned to `align`.
    ///
    /// `align` must be a power of two. Huge page backing is attempted when
    /// requested and silently replaced by the heap when unavailable.
    pub(crate) fn allocate(len: usize, align: usize, flags: AllocFlags) -> Result<Self, AllocError> {
        let align = align.max(MIN_ALIGN);
        if !align.is_power_of_two() {
            return Err(AllocError::AlignmentUnsatisfiable { align });
        }

        let strict = flags.is_strict();
        let offset = if strict { align.max(CANARY_LEN) } else { 0 };
        let trailer = if strict { CANARY_LEN } else { 0 };
        let total = offset
            .checked_add(len)
            .and_then(|n| n.checked_add(trailer))
            .ok_or(AllocError::OutOfMemory { size: len })?
            .max(1);
        let layout =
            Layout::from_size_align(total, align).map_err(|_| AllocError::OutOfMemory { size: len })?;

        let mut block = None;
        if flags.contains(AllocFlags::HUGE_PAGES) {
            if let Some((base, mapped_len)) = map_huge(total) {
                block = Some(Self {
                    base,
                    layout,
                    mapped_len,
                    offset,
                    len,
                    strict,
                    backing: Backing::HugePages,
                });
            }
        }

        let mut block = match block {
            Some(block) => block,
            None => {
                // SAFETY: layout has a non-zero size.
                let ptr = unsafe { alloc::alloc_zeroed(layout) };
                let base = NonNull::new(ptr).ok_or(AllocError::OutOfMemory { size: len })?;
                Self {
                    base,
                    layout,
                    mapped_len: 0,
                    offset,
                    len,
                    strict,
                    backing: Backing::Heap,
                }
            }
        };

        if strict {
            block.write_canaries();
        }
        Ok(block)
    }

    fn write_canaries(&mut self) {
        // SAFETY: for strict blocks `offset >= CANARY_LEN` and the allocation
        // extends `CANARY_LEN` bytes past the user region.
        unsafe {
            let user = self.base.as_ptr().add(self.offset);
            (user.sub(CANARY_LEN) as *mut u64).write_unaligned(CANARY_START);
            (user.add(self.len) as *mut u64).write_unaligned(CANARY_END);
        }
    }

    /// Returns true when both canaries still hold their magic values.
    /// Non-strict blocks always pass.
    #[cfg(test)]
    pub(crate) fn canaries_intact(&self) -> bool {
        // SAFETY: see `write_canaries`.
        !self.strict || unsafe { read_canaries(self.user_ptr(), self.len) }
    }

    fn user_ptr(&self) -> NonNull<u8> {
        // SAFETY: offset lies within the allocation.
        unsafe { NonNull::new_unchecked(self.base.as_ptr().add(self.offset)) }
    }

    pub(crate) fn as_slice(&self) -> &[u8] {
        // SAFETY: the user region lies within the allocation and is initialized.
        unsafe { std::slice::from_raw_parts(self.user_ptr().as_ptr(), self.len) }
    }

    pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusivity.
        unsafe { std::slice::from_raw_parts_mut(self.user_ptr().as_ptr(), self.len) }
    }

    /// Address of the first user byte.
    #[cfg(test)]
    pub(crate) fn addr(&self) -> usize {
        self.user_ptr().as_ptr() as usize
    }

    /// Bytes charged against the allocator for this block.
    pub(crate) fn footprint(&self) -> usize {
        match self.backing {
            Backing::Heap => self.layout.size(),
            Backing::HugePages => self.mapped_len,
        }
    }

    pub(crate) fn backing(&self) -> Backing {
        self.backing
    }

    #[cfg(test)]
    pub(crate) fn smash_end_canary(&mut self) {
        // SAFETY: see `write_canaries`.
        unsafe {
            let user = self.base.as_ptr().add(self.offset);
            (user.add(self.len) as *mut u64).write_unaligned(0);
        }
    }
}

/// Compares the words on either side of a strict block's user region with
/// the canary magics.
///
/// # Safety
/// `user` must point at the user region of a live strict block of `len`
/// bytes. The canary words are never covered by a `BlockRef` guard, so they
/// may be read while such a guard is held.
unsafe fn read_canaries(user: NonNull<u8>, len: usize) -> bool {
    let user = user.as_ptr();
    // SAFETY: upheld by the caller.
    unsafe {
        let start = (user.sub(CANARY_LEN) as *const u64).read_unaligned();
        let end = (user.add(len) as *const u64).read_unaligned();
        start == CANARY_START && end == CANARY_END
    }
}

impl Drop for RawBlock {
    fn drop(&mut self) {
        match self.backing {
            // SAFETY: base was returned by `alloc_zeroed` with this layout.
            Backing::Heap => unsafe { alloc::dealloc(self.base.as_ptr(), self.layout) },
            Backing::HugePages => unmap_huge(self.base, self.mapped_len),
        }
    }
}

#[cfg(target_os = "linux")]
fn map_huge(total: usize) -> Option<(NonNull<u8>, usize)> {
    let len = total.checked_add(HUGE_PAGE_SIZE - 1)? & !(HUGE_PAGE_SIZE - 1);
    // SAFETY: anonymous private mapping with no address hint.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            len,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_HUGETLB,
            -1,
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return None;
    }
    NonNull::new(ptr as *mut u8).map(|base| (base, len))
}

#[cfg(not(target_os = "linux"))]
fn map_huge(_total: usize) -> Option<(NonNull<u8>, usize)> {
    None
}

#[cfg(target_os = "linux")]
fn unmap_huge(base: NonNull<u8>, len: usize) {
    // SAFETY: base/len describe a mapping created by `map_huge`.
    unsafe {
        libc::munmap(base.as_ptr() as *mut libc::c_void, len);
    }
}

#[cfg(not(target_os = "linux"))]
fn unmap_huge(_base: NonNull<u8>, _len: usize) {}

// == Shared Block ==
/// A block as stored in the registry: storage behind a reader/writer lock.
///
/// Everything fixed at allocation time is copied out of the lock so metadata
/// and canary checks never wait on a data guard.
#[derive(Debug)]
pub(crate) struct Block {
    raw: RwLock<RawBlock>,
    user: NonNull<u8>,
    len: usize,
    footprint: usize,
    backing: Backing,
    strict: bool,
}

// SAFETY: `user` points into storage owned by `raw`, which is Send + Sync;
// through it only the canary words outside the user region are read.
unsafe impl Send for Block {}
// SAFETY: as above.
unsafe impl Sync for Block {}

impl Block {
    pub(crate) fn new(raw: RawBlock) -> Self {
        Self {
            user: raw.user_ptr(),
            len: raw.len,
            footprint: raw.footprint(),
            backing: raw.backing(),
            strict: raw.strict,
            raw: RwLock::new(raw),
        }
    }

    /// Checks the canaries without taking the data lock.
    pub(crate) fn canaries_intact(&self) -> bool {
        // SAFETY: `user` and `len` were taken from the `RawBlock` this block
        // owns, which lives as long as `self`.
        !self.strict || unsafe { read_canaries(self.user, self.len) }
    }

    pub(crate) fn footprint(&self) -> usize {
        self.footprint
    }

    pub(crate) fn addr(&self) -> usize {
        self.user.as_ptr() as usize
    }

    pub(crate) fn backing(&self) -> Backing {
        self.backing
    }

    #[cfg(test)]
    pub(crate) fn smash_end_canary(&self) {
        self.raw.write().smash_end_canary();
    }
}

// == Block Reference ==
/// A validated reference to a live block, returned by `Allocator::access`.
///
/// The reference keeps the storage alive even if the block is freed while it
/// is held; the bytes are only returned to the system once every reference
/// is gone and the registry entry has been reclaimed.
#[derive(Clone)]
pub struct BlockRef {
    handle: MemHandle,
    block: Arc<Block>,
}

impl BlockRef {
    pub(crate) fn new(handle: MemHandle, block: Arc<Block>) -> Self {
        Self { handle, block }
    }

    /// Handle this reference was validated for.
    pub fn handle(&self) -> MemHandle {
        self.handle
    }

    /// Number of user bytes.
    pub fn len(&self) -> usize {
        self.block.len
    }

    /// Returns true for zero-sized blocks.
    pub fn is_empty(&self) -> bool {
        self.block.len == 0
    }

    /// Address of the first user byte.
    pub fn addr(&self) -> usize {
        self.block.addr()
    }

    /// Where the block's bytes live.
    pub fn backing(&self) -> Backing {
        self.block.backing()
    }

    /// Shared view of the block's bytes.
    pub fn read(&self) -> MappedRwLockReadGuard<'_, [u8]> {
        RwLockReadGuard::map(self.block.raw.read(), |raw| raw.as_slice())
    }

    /// Exclusive view of the block's bytes.
    pub fn write(&self) -> MappedRwLockWriteGuard<'_, [u8]> {
        RwLockWriteGuard::map(self.block.raw.write(), |raw| raw.as_mut_slice())
    }

    /// Copies the block's bytes out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.read().to_vec()
    }
}

impl std::fmt::Debug for BlockRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockRef")
            .field("handle", &self.handle)
            .field("len", &self.block.len)
            .finish()
    }
}
