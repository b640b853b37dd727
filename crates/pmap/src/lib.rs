#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # Polaris Physical Map (pmap)
//!
//! The machine-dependent half of the Polaris virtual memory system for arm64. It
//! turns "map this virtual page to that physical page with these rights" into
//! translation table entries and keeps the processors' translation caches
//! coherent with them. It provides:
//!
//! - Address spaces backed by 3- or 4-level radix trees of translation tables.
//! - Per-mapping descriptors holding the caller's protection next to the one the
//!   hardware currently grants, for referenced/modified emulation.
//! - A reverse map from every managed physical page to the mappings of it.
//! - Targeted TLB invalidation using paired address space identifiers.
//! - A bootstrap allocator that builds the kernel address space before the page
//!   allocator exists.
//! - Software emulation of the MMU for testing in non-kernel environments.
//!
//! Start with [`Bootstrap::new`], then hand the remaining memory to the page
//! allocator and call [`Bootstrap::finish`] to obtain the [`PmapSystem`].

extern crate alloc;

mod address;
mod arch;
mod arena;
mod asid;
mod bootstrap;
mod config;
mod descriptor;
mod error;
mod frame;
mod memmap;
mod numbers;
mod pmap;
mod pool;
mod prot;
mod pte;
mod pv;
mod radix;
mod regions;
mod system;
mod tlb;

#[cfg(test)]
mod testing;

pub use address::{DirectMap, PhysicalAddress, VirtualAddress};
pub use asid::{Asid, AsidAllocator, AsidPair};
pub use bootstrap::Bootstrap;
pub use config::{KERNEL_WINDOW_BASE, PmapConfig};
pub use error::{PmapError, RegionError};
pub use frame::{Frame, FrameFlag, FrameFlags};
pub use memmap::{BootMemoryRegion, MemoryMap};
pub use numbers::{FrameNumber, PageNumber};
pub use pmap::{Pmap, PmapId, PmapKind, PmapStats};
pub use pool::{FrameAllocator, Pool};
pub use prot::{CacheMode, EnterFlags, VmProt};
pub use pte::{PageEntry, PermissionTable};
pub use radix::WalkStep;
pub use regions::{MemoryRegion, RegionStealer};
pub use system::PmapSystem;
pub use tlb::{CpuSet, Mmu, Target, TlbOp};

#[cfg(all(
    target_arch = "aarch64",
    not(test),
    not(feature = "software-emulation")
))]
pub use arch::HardwareMmu;
#[cfg(any(test, feature = "software-emulation"))]
pub use arch::{EmulatedMmu, TlbRecord};
pub use arch::{CpuMap, Level, MPIDR_AFFINITY_MASK, PAGE_SIZE};
