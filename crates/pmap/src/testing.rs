//! Host fixtures shared by the unit tests.
//!
//! Physical memory is a page-aligned heap allocation and the direct map is the
//! identity, so "physical" addresses handed to the pmap are host pointers.

use std::alloc::{self, Layout};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::vec::Vec;

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arch::{EmulatedMmu, PAGE_SIZE};
use crate::bootstrap::Bootstrap;
use crate::config::{KERNEL_WINDOW_BASE, PmapConfig};
use crate::memmap::BootMemoryRegion;
use crate::pmap::Pmap;
use crate::pool::{FrameAllocator, Pool};
use crate::radix::TableEnv;
use crate::regions::MemoryRegion;
use crate::system::{LockToken, PmapSystem};

/// Page-aligned host memory standing in for RAM.
pub(crate) struct HostRam {
    ptr: *mut u8,
    layout: Layout,
}

// SAFETY: the allocation is plain memory owned by this value.
unsafe impl Send for HostRam {}
unsafe impl Sync for HostRam {}

impl HostRam {
    pub fn new(pages: usize) -> Self {
        let layout = Layout::from_size_align(pages * PAGE_SIZE, PAGE_SIZE).unwrap();
        // SAFETY: the layout has a non-zero size.
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        assert!(!ptr.is_null(), "host allocation failed");
        Self { ptr, layout }
    }

    pub fn base(&self) -> PhysicalAddress {
        PhysicalAddress::from_ptr(self.ptr)
    }

    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn page(&self, index: usize) -> PhysicalAddress {
        assert!(index * PAGE_SIZE < self.size());
        self.base() + index * PAGE_SIZE
    }
}

impl Drop for HostRam {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { alloc::dealloc(self.ptr, self.layout) };
    }
}

pub(crate) struct BootRegion {
    pub base: PhysicalAddress,
    pub size: usize,
    pub usable: bool,
}

impl BootMemoryRegion for BootRegion {
    fn base(&self) -> PhysicalAddress {
        self.base
    }

    fn size(&self) -> usize {
        self.size
    }

    fn is_usable(&self) -> bool {
        self.usable
    }
}

/// A counting frame allocator over a fixed set of host pages.
pub(crate) struct HostFrames {
    free: spin::Mutex<Vec<PhysicalAddress>>,
    live: AtomicUsize,
    exhausted: AtomicBool,
}

impl HostFrames {
    pub fn new(frames: impl IntoIterator<Item = PhysicalAddress>) -> Self {
        let mut free: Vec<_> = frames.into_iter().collect();
        free.reverse();
        Self {
            free: spin::Mutex::new(free),
            live: AtomicUsize::new(0),
            exhausted: AtomicBool::new(false),
        }
    }

    /// Frames handed out and not yet returned.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Makes every allocation fail until reset.
    pub fn set_exhausted(&self, exhausted: bool) {
        self.exhausted.store(exhausted, Ordering::SeqCst);
    }
}

impl FrameAllocator for HostFrames {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        if self.exhausted.load(Ordering::SeqCst) {
            return None;
        }
        let frame = self.free.lock().pop()?;
        self.live.fetch_add(1, Ordering::SeqCst);
        Some(frame)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        // Dirty the frame so a table reused without zeroing shows up.
        // SAFETY: the frame is host memory owned by the fixture.
        unsafe { core::ptr::write_bytes(frame.as_usize() as *mut u8, 0xA5, PAGE_SIZE) };
        self.live.fetch_sub(1, Ordering::SeqCst);
        self.free.lock().push(frame);
    }
}

/// Frames, a pool and an MMU for exercising a bare radix tree.
pub(crate) struct TableRig {
    pub frames: HostFrames,
    pub mmu: EmulatedMmu,
    pub nodes: Pool,
    _ram: HostRam,
}

impl TableRig {
    pub fn new(pages: usize) -> Self {
        Self::build(pages, None)
    }

    pub fn with_node_limit(pages: usize, limit: usize) -> Self {
        Self::build(pages, Some(limit))
    }

    fn build(pages: usize, limit: Option<usize>) -> Self {
        let ram = HostRam::new(pages);
        Self {
            frames: HostFrames::new((0..pages).map(|i| ram.page(i))),
            mmu: EmulatedMmu::new(1),
            nodes: Pool::new("tables", limit),
            _ram: ram,
        }
    }

    pub fn env(&self) -> TableEnv<'_> {
        TableEnv {
            dm: DirectMap::identity(),
            mmu: &self.mmu,
            frames: &self.frames,
            nodes: &self.nodes,
        }
    }
}

const MACHINE_PAGES: usize = 1024;
const MACHINE_TABLE_FRAMES: usize = 256;
const MACHINE_DEVICE_PAGES: usize = 4;

/// A booted pmap over host memory.
///
/// Fields drop in order: the system before the memory it points into.
pub(crate) struct Machine {
    pub system: PmapSystem,
    pub mmu: Arc<EmulatedMmu>,
    pub frames: Arc<HostFrames>,
    data: Vec<PhysicalAddress>,
    devices: Vec<PhysicalAddress>,
    _ram: HostRam,
}

impl Machine {
    pub fn new(cpus: usize) -> Self {
        Self::with_config(Self::config(cpus))
    }

    /// The configuration used by [`Machine::new`]: one 2 MiB block of kernel
    /// window populated at boot, room to grow to 8 MiB.
    pub fn config(cpus: usize) -> PmapConfig {
        PmapConfig {
            cpu_count: cpus,
            kernel_start: VirtualAddress::new(KERNEL_WINDOW_BASE),
            kernel_end: VirtualAddress::new(KERNEL_WINDOW_BASE + (2 << 20)),
            kernel_limit: VirtualAddress::new(KERNEL_WINDOW_BASE + (8 << 20)),
            ..PmapConfig::default()
        }
    }

    pub fn with_config(config: PmapConfig) -> Self {
        let ram = HostRam::new(MACHINE_PAGES);
        let mmu = Arc::new(EmulatedMmu::new(config.cpu_count));
        let boot_map = [BootRegion {
            base: ram.base(),
            size: ram.size(),
            usable: true,
        }];
        let devices: Vec<_> = (MACHINE_PAGES - MACHINE_DEVICE_PAGES..MACHINE_PAGES)
            .map(|i| ram.page(i))
            .collect();
        let reserved = [MemoryRegion::new(
            devices[0],
            MACHINE_DEVICE_PAGES * PAGE_SIZE,
        )];

        let boot = Bootstrap::new(
            config,
            DirectMap::identity(),
            mmu.clone(),
            &boot_map,
            &reserved,
        );
        let mut pages = boot
            .available()
            .into_iter()
            .flat_map(|r| (0..r.size() / PAGE_SIZE).map(move |i| r.base() + i * PAGE_SIZE));
        let frames = Arc::new(HostFrames::new(
            pages.by_ref().take(MACHINE_TABLE_FRAMES).collect::<Vec<_>>(),
        ));
        let data = pages.collect();
        let system = boot.finish(frames.clone());

        Self {
            system,
            mmu,
            frames,
            data,
            devices,
            _ram: ram,
        }
    }

    /// A managed RAM page no allocator will hand out.
    pub fn page(&self, index: usize) -> PhysicalAddress {
        self.data[index]
    }

    /// A reserved page, mapped as device memory.
    pub fn device(&self, index: usize) -> PhysicalAddress {
        self.devices[index]
    }

    /// Fills a page with `byte`.
    pub fn fill(&self, pa: PhysicalAddress, byte: u8) {
        // SAFETY: test pages are host memory owned by the fixture.
        unsafe { core::ptr::write_bytes(pa.as_usize() as *mut u8, byte, PAGE_SIZE) };
    }

    /// Copies a page out.
    pub fn contents(&self, pa: PhysicalAddress) -> Vec<u8> {
        // SAFETY: as in `fill`.
        unsafe { core::slice::from_raw_parts(pa.as_usize() as *const u8, PAGE_SIZE) }.to_vec()
    }

    /// Asserts that the reverse maps of all frames name exactly the valid managed
    /// mappings of `spaces`.
    ///
    /// `spaces` must list every live address space.
    pub fn assert_reverse_maps_consistent(&self, spaces: &[&Pmap]) {
        let mut described = Vec::new();
        for pm in spaces {
            let guard = self.system.lock(pm);
            described.extend(
                guard
                    .descriptors
                    .iter()
                    .map(|(_, d)| d)
                    .filter(|d| d.is_valid() && d.is_managed())
                    .map(|d| (d.pa.as_usize(), d.owner.raw(), d.va.as_usize())),
            );
            guard.unlock();
        }

        let token = LockToken::for_tests();
        let mut listed = Vec::new();
        for (pa, frame) in self.system.memory_map().frames() {
            let entries = frame.pv().lock_unordered(&token).snapshot();
            for entry in entries {
                assert!(
                    entry.space.upgrade().is_some(),
                    "reverse map of {} names dead {:?}",
                    pa,
                    entry.id
                );
                listed.push((pa.as_usize(), entry.id.raw(), entry.va.as_usize()));
            }
        }

        described.sort_unstable();
        listed.sort_unstable();
        assert_eq!(listed, described, "reverse maps disagree with descriptors");
    }
}
