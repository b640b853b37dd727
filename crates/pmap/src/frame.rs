use core::sync::atomic::{AtomicU8, Ordering};

use crate::pv::PvList;

/// Metadata for one managed physical frame.
///
/// Holds the referenced/modified emulation state and the reverse map of every
/// mapping of the frame.
pub struct Frame {
    /// Flags identifying the state of this frame.
    pub flags: FrameFlags,
    pv: PvList,
}

impl Frame {
    pub(crate) const fn new(flags: FrameFlags) -> Self {
        Self {
            flags,
            pv: PvList::new(),
        }
    }

    /// Returns true if the frame is ordinary RAM the pmap tracks.
    pub fn is_managed(&self) -> bool {
        !self.flags.test(FrameFlag::Reserved)
    }

    pub(crate) fn pv(&self) -> &PvList {
        &self.pv
    }
}

impl Default for Frame {
    fn default() -> Self {
        Self::new(FrameFlags::new())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameFlag {
    /// Frame is reserved (firmware, device window) and never managed.
    Reserved = 1 << 0,
    /// Some mapping of the frame has been accessed.
    Referenced = 1 << 1,
    /// Some mapping of the frame has been written.
    Modified = 1 << 2,
    /// The frame has been mapped executable since it was last written or reclaimed.
    Executable = 1 << 3,
}

/// Atomic flags for a physical memory frame.
#[derive(Default)]
pub struct FrameFlags(AtomicU8);

impl FrameFlags {
    /// Creates a new `FrameFlags` instance with all flags cleared.
    pub const fn new() -> Self {
        Self(AtomicU8::new(0))
    }

    /// Creates a new `FrameFlags` instance with the given flag set.
    pub const fn with(flag: FrameFlag) -> Self {
        Self(AtomicU8::new(flag as u8))
    }

    /// Sets the given flag.
    pub fn set(&self, flag: FrameFlag) {
        self.0.fetch_or(flag as u8, Ordering::AcqRel);
    }

    /// Clears the given flag, returning whether it was set.
    pub fn clear(&self, flag: FrameFlag) -> bool {
        let old = self.0.fetch_and(!(flag as u8), Ordering::AcqRel);
        old & flag as u8 != 0
    }

    /// Tests if the given flag is set.
    pub fn test(&self, flag: FrameFlag) -> bool {
        self.0.load(Ordering::Acquire) & flag as u8 != 0
    }

    /// Sets the given flag, returning whether it was already set.
    pub fn test_and_set(&self, flag: FrameFlag) -> bool {
        let old = self.0.fetch_or(flag as u8, Ordering::AcqRel);
        old & flag as u8 != 0
    }
}
