//! Architecture support.
//!
//! Translation table geometry is fixed to the arm64 4 KiB granule: four levels of
//! 512-entry tables indexed by 9 address bits each. Cache and TLB maintenance comes
//! either from the hardware backend or from a recording software model.

// Hardware backend for real arm64 targets.
// NOTE: The module is compiled whenever we target aarch64 so that rust-analyzer can see it.
#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(all(
    target_arch = "aarch64",
    not(test),
    not(feature = "software-emulation")
))]
pub use aarch64::HardwareMmu;

// Use software emulation ONLY when:
// - Running tests, OR
// - software-emulation feature is explicitly enabled
#[cfg(any(test, feature = "software-emulation"))]
mod software;
#[cfg(any(test, feature = "software-emulation"))]
pub use software::{EmulatedMmu, TlbRecord};

use crate::tlb::MAX_CPUS;

/// The affinity fields of MPIDR_EL1: Aff3 and Aff2..Aff0.
pub const MPIDR_AFFINITY_MASK: u64 = 0xFF_00FF_FFFF;

/// Dense processor numbers for the processors of a machine.
///
/// Processors in different clusters share Aff0, so a processor is named by its
/// whole affinity value. The processor listed first is number 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuMap {
    affinities: [u64; MAX_CPUS],
    count: usize,
}

impl CpuMap {
    /// Numbers the processors with the given MPIDR_EL1 values.
    ///
    /// # Panics
    ///
    /// Panics if more than [`MAX_CPUS`] processors are listed or one is listed twice.
    pub fn new(mpidrs: &[u64]) -> Self {
        assert!(
            mpidrs.len() <= MAX_CPUS,
            "{} processors listed, at most {} supported",
            mpidrs.len(),
            MAX_CPUS
        );
        let mut map = Self {
            affinities: [0; MAX_CPUS],
            count: 0,
        };
        for &mpidr in mpidrs {
            assert!(
                map.index_of(mpidr).is_none(),
                "processor {:#x} listed twice",
                mpidr & MPIDR_AFFINITY_MASK
            );
            map.affinities[map.count] = mpidr & MPIDR_AFFINITY_MASK;
            map.count += 1;
        }
        map
    }

    /// Returns the number of the processor with the given MPIDR_EL1 value.
    pub fn index_of(&self, mpidr: u64) -> Option<usize> {
        let affinity = mpidr & MPIDR_AFFINITY_MASK;
        self.affinities[..self.count]
            .iter()
            .position(|a| *a == affinity)
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }
}

/// log2 of the page size.
pub const PAGE_SHIFT: usize = 12;

/// Page size in bytes (4 KiB granule).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Mask of the offset bits within a page.
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// Number of virtual address bits consumed by one table level.
pub const INDEX_BITS: usize = 9;

/// Number of entries in every translation table, at every level.
pub const ENTRIES_PER_TABLE: usize = 1 << INDEX_BITS;

/// Maximum number of bits in a physical address.
pub const MAX_PHYSICAL_BITS: usize = 48;

/// Maximum number of bits in a virtual address (per translation table base register).
pub const MAX_VIRTUAL_BITS: usize = 48;

/// A translation table level, numbered the way the architecture numbers them.
///
/// L0 is the widest level (512 GiB per entry) and only exists in 4-level trees,
/// L3 holds the page descriptors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Level {
    L0 = 0,
    L1 = 1,
    L2 = 2,
    L3 = 3,
}

impl Level {
    /// Returns the bit position of this level's index within a virtual address.
    #[inline]
    pub const fn shift(self) -> usize {
        PAGE_SHIFT + INDEX_BITS * (3 - self as usize)
    }

    /// Returns the number of bytes translated by one entry at this level.
    #[inline]
    pub const fn span(self) -> usize {
        1 << self.shift()
    }

    /// Returns the next level towards the leaves, if any.
    #[inline]
    pub const fn next(self) -> Option<Level> {
        match self {
            Level::L0 => Some(Level::L1),
            Level::L1 => Some(Level::L2),
            Level::L2 => Some(Level::L3),
            Level::L3 => None,
        }
    }
}

/// Returns the table index for a given virtual address at the specified level.
#[inline]
pub const fn page_index(address: usize, level: Level) -> usize {
    (address >> level.shift()) & (ENTRIES_PER_TABLE - 1)
}

/// Validates a physical address.
///
/// Physical addresses must not exceed the maximum output address width.
#[inline]
pub const fn validate_physical(addr: usize) -> bool {
    addr >> MAX_PHYSICAL_BITS == 0
}

/// Validates a virtual address.
///
/// The bits above the translated range must be all zeros (TTBR0, user) or all
/// ones (TTBR1, kernel).
#[inline]
pub const fn validate_virtual(addr: usize) -> bool {
    let top = addr >> MAX_VIRTUAL_BITS;
    top == 0 || top == (usize::MAX >> MAX_VIRTUAL_BITS)
}

/// Returns true if the address is translated through the kernel (TTBR1) tables.
#[inline]
pub const fn is_kernel_address(addr: usize) -> bool {
    addr >> 63 == 1
}
