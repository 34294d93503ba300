//! Memory Handle Module
//!
//! Generation-tagged handles that stand in for raw pointers.

use std::fmt;

use serde::Serialize;

// == Memory Handle ==
/// A reference to an allocator-owned block.
///
/// The slot index locates the lifecycle object in the registry; the
/// generation pins the handle to one occupant of that slot. Once the slot is
/// freed or reused the handle no longer validates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct MemHandle {
    slot: u32,
    generation: u32,
}

impl MemHandle {
    /// Creates a handle from its raw parts.
    pub const fn new(slot: u32, generation: u32) -> Self {
        Self { slot, generation }
    }

    /// Registry slot index.
    pub const fn slot(&self) -> u32 {
        self.slot
    }

    /// Generation captured at allocation time.
    pub const fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for MemHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.slot, self.generation)
    }
}
