//! Memory map tracking physical frame metadata.
//!
//! Every usable range of the boot memory map becomes a segment holding one [`Frame`]
//! per page. Segments are kept sorted by base address, so finding the metadata for
//! a physical address is a binary search. Addresses outside every segment (device
//! windows, holes) have no metadata and are never managed.
//!
//! # Building a Memory Map
//!
//! Implement [`BootMemoryRegion`] on the bootloader's memory map entry type, then
//! call [`MemoryMap::from_boot_map`]:
//!
//! ```ignore
//! struct MyBootEntry { /* ... */ }
//!
//! impl BootMemoryRegion for MyBootEntry {
//!     fn base(&self) -> PhysicalAddress { /* ... */ }
//!     fn size(&self) -> usize { /* ... */ }
//!     fn is_usable(&self) -> bool { /* ... */ }
//! }
//!
//! let memory_map = MemoryMap::from_boot_map(boot_entries);
//! ```

use alloc::boxed::Box;
use alloc::vec::Vec;

use crate::address::PhysicalAddress;
use crate::arch;
use crate::frame::{Frame, FrameFlag, FrameFlags};
use crate::numbers::FrameNumber;

/// Represents a single entry in a boot-time memory map.
pub trait BootMemoryRegion {
    /// Returns the base physical address of this region.
    fn base(&self) -> PhysicalAddress;

    /// Returns the size of this region in bytes.
    fn size(&self) -> usize;

    /// Returns whether this region contains usable memory.
    ///
    /// Non-usable memory (reserved, firmware tables, device memory) returns `false`.
    fn is_usable(&self) -> bool;
}

/// Frames for one contiguous usable range.
struct Segment {
    start: FrameNumber,
    frames: Box<[Frame]>,
}

impl Segment {
    fn end(&self) -> FrameNumber {
        self.start + self.frames.len()
    }
}

/// Holds metadata for all usable physical frames.
pub struct MemoryMap {
    segments: Box<[Segment]>,
}

impl MemoryMap {
    /// Constructs a memory map from a boot-time memory map.
    ///
    /// Usable ranges are trimmed to whole pages and merged when they touch. When
    /// entries overlap, later entries take precedence: a frame covered by a later
    /// non-usable entry is marked reserved.
    pub fn from_boot_map<R: BootMemoryRegion>(boot_map: &[R]) -> Self {
        let mut spans: Vec<(usize, usize)> = boot_map
            .iter()
            .filter(|r| r.is_usable())
            .filter_map(|r| {
                let start = r.base().as_usize().div_ceil(arch::PAGE_SIZE);
                let end = (r.base().as_usize() + r.size()) / arch::PAGE_SIZE;
                (start < end).then_some((start, end))
            })
            .collect();
        spans.sort_unstable();

        let mut merged: Vec<(usize, usize)> = Vec::with_capacity(spans.len());
        for (start, end) in spans {
            match merged.last_mut() {
                Some(last) if start <= last.1 => last.1 = last.1.max(end),
                _ => merged.push((start, end)),
            }
        }

        let segments: Box<[Segment]> = merged
            .into_iter()
            .map(|(start, end)| {
                let frames: Box<[Frame]> = (start..end)
                    .map(|frame| {
                        let addr = FrameNumber::new(frame).start();
                        if Self::is_frame_usable(addr, boot_map) {
                            Frame::default()
                        } else {
                            Frame::new(FrameFlags::with(FrameFlag::Reserved))
                        }
                    })
                    .collect();
                log::trace!(
                    "memory map segment {:#x}..{:#x} ({} frames)",
                    start << arch::PAGE_SHIFT,
                    end << arch::PAGE_SHIFT,
                    end - start
                );
                Segment {
                    start: FrameNumber::new(start),
                    frames,
                }
            })
            .collect();

        Self { segments }
    }

    /// Returns a reference to the frame at the given frame number.
    pub fn frame(&self, frame_number: FrameNumber) -> Option<&Frame> {
        let index = self
            .segments
            .partition_point(|s| s.end() <= frame_number);
        let segment = self.segments.get(index)?;
        if frame_number < segment.start {
            return None;
        }
        segment.frames.get(frame_number - segment.start)
    }

    /// Returns a reference to the frame for the given physical address.
    pub fn frame_for(&self, address: PhysicalAddress) -> Option<&Frame> {
        self.frame(address.frame_number())
    }

    /// Returns the frame for `address` if it is ordinary, unreserved RAM.
    pub fn managed(&self, address: PhysicalAddress) -> Option<&Frame> {
        self.frame_for(address).filter(|f| f.is_managed())
    }

    /// Marks every frame in the range as reserved.
    pub fn reserve(&self, base: PhysicalAddress, size: usize) {
        let first = base.frame_number();
        let last = (base + size).align_up(arch::PAGE_SIZE).frame_number();
        let mut frame = first;
        while frame < last {
            if let Some(f) = self.frame(frame) {
                f.flags.set(FrameFlag::Reserved);
            }
            frame = frame + 1;
        }
    }

    /// Returns the number of frames that have metadata.
    pub fn frame_count(&self) -> usize {
        self.segments.iter().map(|s| s.frames.len()).sum()
    }

    /// Returns the number of frames currently managed.
    pub fn managed_count(&self) -> usize {
        self.segments
            .iter()
            .flat_map(|s| s.frames.iter())
            .filter(|f| f.is_managed())
            .count()
    }

    /// Iterates every frame that has metadata with its address.
    #[cfg(test)]
    pub(crate) fn frames(&self) -> impl Iterator<Item = (PhysicalAddress, &Frame)> {
        self.segments.iter().flat_map(|s| {
            s.frames
                .iter()
                .enumerate()
                .map(move |(i, frame)| ((s.start + i).start(), frame))
        })
    }

    /// Determines if a frame is usable based on the boot map.
    fn is_frame_usable<R: BootMemoryRegion>(addr: PhysicalAddress, boot_map: &[R]) -> bool {
        let mut usable = false;

        for region in boot_map {
            let region_end = region.base().as_usize() + region.size();
            if addr.as_usize() >= region.base().as_usize() && addr.as_usize() < region_end {
                usable = region.is_usable();
            }
        }

        usable
    }
}
