//! The bootstrap phase.
//!
//! Before the page allocator exists, the pmap takes memory straight out of the boot
//! memory map. [`Bootstrap`] owns that capability: it builds the kernel address
//! space from stolen frames, pre-allocates every kernel table and descriptor for
//! the initial kernel window, and lets early code steal more memory and enter
//! kernel mappings. [`Bootstrap::finish`] consumes it and yields the
//! [`PmapSystem`]; nothing can be stolen afterwards.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, AtomicUsize};

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arch::{Level, PAGE_SIZE};
use crate::asid::AsidAllocator;
use crate::config::PmapConfig;
use crate::error::RegionError;
use crate::memmap::{BootMemoryRegion, MemoryMap};
use crate::pmap::{Context, Pmap, PmapId};
use crate::pool::{FrameAllocator, Pool};
use crate::prot::{CacheMode, VmProt};
use crate::regions::{MemoryRegion, RegionStealer};
use crate::system::{PmapSystem, kernel};
use crate::tlb::Mmu;

#[cfg(not(any(test, feature = "software-emulation")))]
static BOOTSTRAPPED: spin::Once<()> = spin::Once::new();

/// The kernel address space's identity.
pub(crate) const KERNEL_ID: PmapId = PmapId::from_raw(0);

/// The pmap before the page allocator is running.
pub struct Bootstrap {
    config: PmapConfig,
    dm: DirectMap,
    mmu: Arc<dyn Mmu>,
    stealer: RegionStealer,
    memmap: MemoryMap,
    kernel: Arc<Pmap>,
    nodes: Pool,
    descriptors: Pool,
}

impl Bootstrap {
    /// Builds the kernel address space over the initial kernel window.
    ///
    /// `reserved` lists ranges that must never be stolen or treated as ordinary
    /// RAM, such as the kernel image and the boot loader's data.
    ///
    /// # Panics
    ///
    /// Panics if the configuration is invalid, if the boot memory cannot hold the
    /// kernel tables, or (on hardware builds) if called more than once.
    pub fn new<R: BootMemoryRegion>(
        config: PmapConfig,
        dm: DirectMap,
        mmu: Arc<dyn Mmu>,
        boot_map: &[R],
        reserved: &[MemoryRegion],
    ) -> Self {
        #[cfg(not(any(test, feature = "software-emulation")))]
        {
            let mut first = false;
            BOOTSTRAPPED.call_once(|| first = true);
            assert!(first, "pmap already bootstrapped");
        }
        config.validate();

        let memmap = MemoryMap::from_boot_map(boot_map);
        let stealer = RegionStealer::new();
        let carve = |result: Result<(), RegionError>| {
            if let Err(err) = result {
                panic!("bootstrap exhausted: cannot track boot memory: {}", err);
            }
        };
        for region in boot_map.iter().filter(|r| r.is_usable()) {
            carve(stealer.add(region.base(), region.size()));
        }
        for region in boot_map.iter().filter(|r| !r.is_usable()) {
            carve(stealer.reserve(region.base(), region.size()));
        }
        for region in reserved {
            carve(stealer.reserve(region.base(), region.size()));
            memmap.reserve(region.base(), region.size());
        }

        let nodes = Pool::new("tables", None);
        let descriptors = Pool::new("descriptors", None);
        let kernel = {
            let ctx = Context {
                dm,
                mmu: mmu.as_ref(),
                frames: &stealer,
                memmap: &memmap,
                nodes: &nodes,
                descriptors: &descriptors,
                permissions: &config.permissions,
                cpus: config.cpu_count,
                tracking: false,
            };
            let kernel = Pmap::create(KERNEL_ID, None, Level::L1, &ctx)
                .unwrap_or_else(|err| panic!("bootstrap exhausted: kernel root table: {}", err));
            if let Err((block, err)) =
                kernel::populate(&ctx, &kernel, config.kernel_start, config.kernel_end)
            {
                panic!("bootstrap exhausted: kernel tables at {}: {}", block, err);
            }
            kernel
        };

        log::info!(
            "pmap bootstrap: kernel {}..{} with {} tables and {} descriptors, {} KiB stolen",
            config.kernel_start,
            config.kernel_end,
            nodes.live(),
            descriptors.live(),
            stealer.stolen_bytes() / 1024
        );

        Self {
            config,
            dm,
            mmu,
            stealer,
            memmap,
            kernel,
            nodes,
            descriptors,
        }
    }

    fn context(&self) -> Context<'_> {
        Context {
            dm: self.dm,
            mmu: self.mmu.as_ref(),
            frames: &self.stealer,
            memmap: &self.memmap,
            nodes: &self.nodes,
            descriptors: &self.descriptors,
            permissions: &self.config.permissions,
            cpus: self.config.cpu_count,
            tracking: false,
        }
    }

    /// Takes zeroed physical memory out of the boot regions.
    ///
    /// # Panics
    ///
    /// Panics if no region can hold the request.
    pub fn steal_physical(&self, size: usize, align: usize) -> PhysicalAddress {
        let pa = self.stealer.steal(size, align).unwrap_or_else(|err| {
            panic!(
                "bootstrap exhausted: {:#x} bytes aligned to {:#x}: {}",
                size, align, err
            )
        });
        let size = size.next_multiple_of(PAGE_SIZE);
        // SAFETY: the range was just removed from the free regions and is reachable
        // through the direct map.
        unsafe { core::ptr::write_bytes(self.dm.phys_to_ptr::<u8>(pa), 0, size) };
        pa
    }

    /// Enters a wired kernel mapping with the default cache mode.
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: VmProt) {
        kernel::enter(&self.context(), &self.kernel, va, pa, prot, None);
    }

    /// Enters a wired kernel mapping with an explicit cache mode.
    pub fn kenter_cache(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        cache: CacheMode,
    ) {
        kernel::enter(&self.context(), &self.kernel, va, pa, prot, Some(cache));
    }

    pub fn kernel(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    /// Memory still free, to be handed to the page allocator.
    pub fn available(&self) -> Vec<MemoryRegion> {
        self.stealer.available()
    }

    /// Memory taken so far.
    pub fn stolen(&self) -> Vec<MemoryRegion> {
        self.stealer.stolen()
    }

    /// Ends the bootstrap phase.
    ///
    /// Stolen memory is marked reserved so it is never treated as managed RAM, the
    /// table and descriptor pools switch to their configured caps, and managed
    /// mappings from here on are recorded in the reverse map.
    pub fn finish(self, frames: Arc<dyn FrameAllocator>) -> PmapSystem {
        for region in self.stealer.stolen() {
            self.memmap.reserve(region.base(), region.size());
        }

        let nodes = runtime_pool("tables", self.config.node_limit, &self.nodes);
        let descriptors =
            runtime_pool("descriptors", self.config.descriptor_limit, &self.descriptors);
        let asids = AsidAllocator::new(self.config.asid_bits);
        log::info!(
            "pmap ready: reverse map tracking {} frames, {} ASID pairs",
            self.memmap.managed_count(),
            asids.capacity()
        );

        PmapSystem {
            kernel_max: AtomicUsize::new(self.config.kernel_end.as_usize()),
            next_id: AtomicU64::new(KERNEL_ID.raw() + 1),
            config: self.config,
            dm: self.dm,
            mmu: self.mmu,
            frames,
            memmap: self.memmap,
            kernel: self.kernel,
            asids,
            nodes,
            descriptors,
        }
    }
}

fn runtime_pool(name: &'static str, limit: Option<usize>, boot: &Pool) -> Pool {
    let pool = Pool::new(name, limit.map(|limit| limit + boot.live()));
    pool.force_take(boot.live());
    pool
}
