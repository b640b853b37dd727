//! Physical memory regions available before the page allocator exists.
//!
//! The region list starts out as the usable entries of the boot memory map. Ranges
//! that hold the kernel image, firmware tables or the boot loader's data are carved
//! out first, then the bootstrap phase steals page-aligned blocks from what remains.
//! Whatever is still available when bootstrap ends is handed to the page allocator.
//!
//! Region bookkeeping uses fixed arrays so that nothing here depends on the heap.

use alloc::vec::Vec;

use crate::address::PhysicalAddress;
use crate::arch::PAGE_SIZE;
use crate::error::RegionError;
use crate::pool::FrameAllocator;

/// Maximum number of regions tracked by one list.
const MAX_REGIONS: usize = 64;

/// A contiguous range of physical memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    base: PhysicalAddress,
    size: usize,
}

impl MemoryRegion {
    /// Creates a new memory region.
    pub const fn new(base: PhysicalAddress, size: usize) -> Self {
        Self { base, size }
    }

    /// Returns the base address of this region.
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }

    /// Returns the size of this region in bytes.
    pub const fn size(&self) -> usize {
        self.size
    }

    /// Returns the end address (exclusive) of this region.
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_usize() + self.size)
    }

    /// Returns true if this region overlaps with another region.
    pub const fn overlaps(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() < other.end().as_usize()
            && other.base.as_usize() < self.end().as_usize()
    }

    /// Returns true if the regions overlap or touch.
    pub const fn mergeable(&self, other: &MemoryRegion) -> bool {
        self.base.as_usize() <= other.end().as_usize()
            && other.base.as_usize() <= self.end().as_usize()
    }

    /// Returns the region spanning both. The regions must be mergeable.
    pub fn merge(&self, other: &MemoryRegion) -> MemoryRegion {
        let base = self.base.min(other.base);
        let end = self.end().max(other.end());
        MemoryRegion::new(base, end - base)
    }

    /// Shrinks the region inward to whole pages.
    pub fn trimmed(&self) -> Option<MemoryRegion> {
        let base = self.base.align_up(PAGE_SIZE);
        let end = self.end().align_down(PAGE_SIZE);
        (base < end).then(|| MemoryRegion::new(base, end - base))
    }

    /// Grows the region outward to whole pages.
    pub fn widened(&self) -> MemoryRegion {
        let base = self.base.align_down(PAGE_SIZE);
        let end = self.end().align_up(PAGE_SIZE);
        MemoryRegion::new(base, end - base)
    }
}

/// Sorted, non-overlapping regions in a fixed array.
#[derive(Debug)]
struct RegionArray {
    regions: [Option<MemoryRegion>; MAX_REGIONS],
    count: usize,
}

impl RegionArray {
    const fn new() -> Self {
        Self {
            regions: [None; MAX_REGIONS],
            count: 0,
        }
    }

    const fn len(&self) -> usize {
        self.count
    }

    fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions[..self.count].iter().filter_map(|r| r.as_ref())
    }

    fn get(&self, index: usize) -> Option<MemoryRegion> {
        self.regions[..self.count].get(index).copied().flatten()
    }

    fn insert(&mut self, index: usize, region: MemoryRegion) -> Result<(), RegionError> {
        if self.count >= MAX_REGIONS || index > self.count {
            return Err(RegionError::RegionsFull);
        }
        self.regions.copy_within(index..self.count, index + 1);
        self.regions[index] = Some(region);
        self.count += 1;
        Ok(())
    }

    fn remove(&mut self, index: usize) {
        if index >= self.count {
            return;
        }
        self.regions.copy_within(index + 1..self.count, index);
        self.regions[self.count - 1] = None;
        self.count -= 1;
    }

    /// Adds a region, merging it with every region it overlaps or touches.
    fn add(&mut self, region: MemoryRegion) -> Result<(), RegionError> {
        if region.size() == 0 {
            return Ok(());
        }
        let mut merged = region;
        let mut index = 0;
        while let Some(existing) = self.get(index) {
            if existing.end() < merged.base() {
                index += 1;
            } else if merged.end() < existing.base() {
                break;
            } else {
                merged = merged.merge(&existing);
                self.remove(index);
            }
        }
        self.insert(index, merged)
    }

    /// Removes a range, splitting regions that straddle it.
    fn subtract(&mut self, region: MemoryRegion) -> Result<(), RegionError> {
        if region.size() == 0 {
            return Ok(());
        }
        let mut index = 0;
        while let Some(existing) = self.get(index) {
            if !existing.overlaps(&region) {
                index += 1;
                continue;
            }
            self.remove(index);
            if existing.base() < region.base() {
                let before = MemoryRegion::new(existing.base(), region.base() - existing.base());
                self.insert(index, before)?;
                index += 1;
            }
            if existing.end() > region.end() {
                let after = MemoryRegion::new(region.end(), existing.end() - region.end());
                self.insert(index, after)?;
                index += 1;
            }
        }
        Ok(())
    }

    fn total_size(&self) -> usize {
        self.iter().map(|r| r.size()).sum()
    }
}

/// First-fit allocator over the bootstrap region list.
///
/// # Thread Safety
///
/// Bootstrap runs on one processor, but the lists sit behind `spin::Mutex` so the
/// stealer can serve as a [`FrameAllocator`] through a shared reference.
pub struct RegionStealer {
    available: spin::Mutex<RegionArray>,
    stolen: spin::Mutex<RegionArray>,
}

impl RegionStealer {
    pub const fn new() -> Self {
        Self {
            available: spin::Mutex::new(RegionArray::new()),
            stolen: spin::Mutex::new(RegionArray::new()),
        }
    }

    /// Adds usable memory, trimmed to whole pages.
    pub fn add(&self, base: PhysicalAddress, size: usize) -> Result<(), RegionError> {
        match MemoryRegion::new(base, size).trimmed() {
            Some(region) => self.available.lock().add(region),
            None => Ok(()),
        }
    }

    /// Withdraws a range from the available memory, widened to whole pages.
    pub fn reserve(&self, base: PhysicalAddress, size: usize) -> Result<(), RegionError> {
        if size == 0 {
            return Ok(());
        }
        self.available
            .lock()
            .subtract(MemoryRegion::new(base, size).widened())
    }

    /// Takes `size` bytes (rounded up to pages) aligned to `align`, first fit.
    pub fn steal(&self, size: usize, align: usize) -> Result<PhysicalAddress, RegionError> {
        if align == 0 || !align.is_power_of_two() {
            return Err(RegionError::InvalidAlignment);
        }
        if size == 0 {
            return Err(RegionError::OutOfMemory);
        }
        let size = size.next_multiple_of(PAGE_SIZE);
        let align = align.max(PAGE_SIZE);

        let mut available = self.available.lock();
        let candidate = available.iter().find_map(|region| {
            let base = region.base().align_up(align);
            (base >= region.base() && base.as_usize() + size <= region.end().as_usize())
                .then(|| MemoryRegion::new(base, size))
        });
        let Some(candidate) = candidate else {
            return Err(RegionError::OutOfMemory);
        };
        available.subtract(candidate)?;
        self.stolen.lock().add(candidate)?;
        log::trace!(
            "stole {:#x} bytes at {} (align {:#x})",
            size,
            candidate.base(),
            align
        );
        Ok(candidate.base())
    }

    /// Returns the regions still available.
    pub fn available(&self) -> Vec<MemoryRegion> {
        self.available.lock().iter().copied().collect()
    }

    /// Returns the regions handed out so far.
    pub fn stolen(&self) -> Vec<MemoryRegion> {
        self.stolen.lock().iter().copied().collect()
    }

    pub fn available_bytes(&self) -> usize {
        self.available.lock().total_size()
    }

    pub fn stolen_bytes(&self) -> usize {
        self.stolen.lock().total_size()
    }

    pub fn region_count(&self) -> usize {
        self.available.lock().len()
    }
}

impl Default for RegionStealer {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameAllocator for RegionStealer {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.steal(PAGE_SIZE, PAGE_SIZE).ok()
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        let region = MemoryRegion::new(frame, PAGE_SIZE);
        let returned = self
            .stolen
            .lock()
            .subtract(region)
            .and_then(|()| self.available.lock().add(region));
        if let Err(err) = returned {
            log::warn!("leaking bootstrap frame {}: {}", frame, err);
        }
    }
}
