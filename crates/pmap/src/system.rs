//! The running pmap.
//!
//! [`PmapSystem`] is the process-wide owner of the kernel address space, the
//! address space identifiers, the frame metadata and the structure pools. It is
//! created by [`Bootstrap::finish`](crate::Bootstrap::finish) and lives for the rest
//! of the kernel's run.
//!
//! Every public operation enters with no lock held, takes at most one
//! address-space lock at a time, and invalidates changed translations before that
//! lock is released.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arch::{Level, PAGE_SIZE};
use crate::asid::AsidAllocator;
use crate::config::{KERNEL_WINDOW_BASE, PmapConfig};
use crate::error::PmapError;
use crate::memmap::MemoryMap;
use crate::pmap::{Context, Pmap, PmapGuard, PmapId, PmapStats};
use crate::pool::{FrameAllocator, Pool};
use crate::prot::{EnterFlags, VmProt};
use crate::radix::{Unlinked, WalkStep};
use crate::tlb::{Mmu, PendingFlush};

pub(crate) mod kernel;
mod refmod;

/// Proof that the current call path holds no address-space lock.
///
/// Only the entry points of this module and its children mint tokens. Not `Send`:
/// a token belongs to the thread that entered the pmap.
pub(crate) struct LockToken {
    _not_send: PhantomData<*const ()>,
}

impl LockToken {
    fn enter() -> Self {
        Self {
            _not_send: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self::enter()
    }
}

/// The pmap after bootstrap.
pub struct PmapSystem {
    pub(crate) config: PmapConfig,
    pub(crate) dm: DirectMap,
    pub(crate) mmu: Arc<dyn Mmu>,
    pub(crate) frames: Arc<dyn FrameAllocator>,
    pub(crate) memmap: MemoryMap,
    pub(crate) kernel: Arc<Pmap>,
    pub(crate) asids: AsidAllocator,
    pub(crate) nodes: Pool,
    pub(crate) descriptors: Pool,
    pub(crate) kernel_max: AtomicUsize,
    pub(crate) next_id: AtomicU64,
}

impl PmapSystem {
    pub(crate) fn context(&self) -> Context<'_> {
        Context {
            dm: self.dm,
            mmu: self.mmu.as_ref(),
            frames: self.frames.as_ref(),
            memmap: &self.memmap,
            nodes: &self.nodes,
            descriptors: &self.descriptors,
            permissions: &self.config.permissions,
            cpus: self.config.cpu_count,
            tracking: true,
        }
    }

    /// Locks `pm` for one public operation.
    pub(crate) fn lock<'a>(&self, pm: &'a Pmap) -> PmapGuard<'a> {
        let guard = pm.lock(LockToken::enter());
        assert!(!guard.destroyed, "{:?} used after destruction", pm.id());
        guard
    }

    pub fn config(&self) -> &PmapConfig {
        &self.config
    }

    /// The kernel address space.
    pub fn kernel(&self) -> &Arc<Pmap> {
        &self.kernel
    }

    pub fn memory_map(&self) -> &MemoryMap {
        &self.memmap
    }

    /// Accounting for translation tables.
    pub fn node_pool(&self) -> &Pool {
        &self.nodes
    }

    /// Accounting for mapping descriptors.
    pub fn descriptor_pool(&self) -> &Pool {
        &self.descriptors
    }

    /// Number of identifier pairs held by live user spaces.
    pub fn asids_in_use(&self) -> usize {
        self.asids.in_use()
    }

    /// Creates an empty user address space with one reference.
    pub fn create(&self) -> Result<Arc<Pmap>, PmapError> {
        let Some(asids) = self.asids.allocate() else {
            log::warn!("no free ASID pair for a new address space");
            return Err(PmapError::AsidsExhausted);
        };
        let id = PmapId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let root_level = if self.config.four_level_user {
            Level::L0
        } else {
            Level::L1
        };
        match Pmap::create(id, Some(asids), root_level, &self.context()) {
            Ok(pm) => {
                log::debug!("{:?} created with ASIDs {:?}", id, asids.both());
                Ok(pm)
            }
            Err(err) => {
                self.asids.free(asids);
                Err(err)
            }
        }
    }

    /// Adds a reference to `pm`.
    pub fn reference(&self, pm: &Pmap) {
        pm.retain();
    }

    /// Drops a reference to `pm`, tearing it down when it was the last.
    ///
    /// # Panics
    ///
    /// Panics if `pm` is the kernel address space.
    pub fn destroy(&self, pm: &Pmap) {
        assert!(!pm.is_kernel(), "the kernel address space is never destroyed");
        if !pm.release() {
            return;
        }
        let ctx = self.context();
        let mut guard = self.lock(pm);
        let unlinked = guard.teardown(&ctx);
        let asids = pm.asids();
        if let Some(asids) = asids {
            ctx.invalidator().retire(asids);
        }
        guard.unlock();
        if let Some(asids) = asids {
            self.asids.free(asids);
        }
        unlinked.release(&ctx.tables());
        log::debug!("{:?} destroyed", pm.id());
    }

    /// Maps `va` to `pa` in `pm`, replacing whatever was mapped there.
    ///
    /// `flags` carries the access that caused the mapping (if any), whether the
    /// mapping is wired and whether running out of memory may be reported instead
    /// of panicking.
    pub fn enter(
        &self,
        pm: &Pmap,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        flags: EnterFlags,
    ) -> Result<(), PmapError> {
        self.check_page(pm, va);
        assert!(pa.is_aligned(PAGE_SIZE), "physical address {} is not page aligned", pa);
        let ctx = self.context();
        let mut guard = self.lock(pm);
        let mut flush = PendingFlush::new();
        let mut unlinked = Unlinked::none();
        let result = guard.enter(&ctx, va, pa, prot, flags, &mut flush, &mut unlinked);
        guard.finish(&ctx, flush, unlinked);
        result
    }

    /// Removes every mapping in `[start, end)`.
    pub fn remove(&self, pm: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        self.check_range(pm, start, end);
        let ctx = self.context();
        let mut guard = self.lock(pm);
        let mut flush = PendingFlush::for_range((end - start) / PAGE_SIZE);
        let unlinked = guard.remove(&ctx, start, end, &mut flush);
        guard.finish(&ctx, flush, unlinked);
    }

    /// Narrows every mapping in `[start, end)` to `prot`.
    ///
    /// A protection without read or execute removes the mappings instead.
    pub fn protect(&self, pm: &Pmap, start: VirtualAddress, end: VirtualAddress, prot: VmProt) {
        self.check_range(pm, start, end);
        let ctx = self.context();
        let mut guard = self.lock(pm);
        let mut flush = PendingFlush::for_range((end - start) / PAGE_SIZE);
        let unlinked = guard.protect(&ctx, start, end, prot, &mut flush);
        guard.finish(&ctx, flush, unlinked);
    }

    /// Returns the physical address `va` translates to, offset included.
    pub fn extract(&self, pm: &Pmap, va: VirtualAddress) -> Option<PhysicalAddress> {
        if !self.in_window(pm, va) {
            return None;
        }
        let guard = self.lock(pm);
        guard.extract(va)
    }

    /// Resolves a permission fault taken only because of referenced/modified
    /// emulation. Returns false if the fault is real.
    pub fn fault_fixup(&self, pm: &Pmap, va: VirtualAddress, access: VmProt) -> bool {
        if !self.in_window(pm, va) {
            return false;
        }
        let ctx = self.context();
        let mut guard = self.lock(pm);
        let mut flush = PendingFlush::new();
        let fixed = guard.fault_fixup(&ctx, va, access, &mut flush);
        guard.finish(&ctx, flush, Unlinked::none());
        fixed
    }

    /// Clears the wired bit of the mapping at `va`.
    pub fn unwire(&self, pm: &Pmap, va: VirtualAddress) {
        self.check_page(pm, va.align_down(PAGE_SIZE));
        self.lock(pm).unwire(va);
    }

    /// Makes `pm` the user address space of the calling processor.
    pub fn activate(&self, pm: &Pmap) {
        let (Some(asids), Some(ttbr)) = (pm.asids(), pm.ttbr()) else {
            return;
        };
        self.context()
            .invalidator()
            .activate(asids, pm.residency(), ttbr);
    }

    /// Records that the calling processor no longer runs `pm`.
    pub fn deactivate(&self, pm: &Pmap) {
        if !pm.is_kernel() {
            self.context().invalidator().deactivate(pm.residency());
        }
    }

    pub fn stats(&self, pm: &Pmap) -> PmapStats {
        self.lock(pm).stats
    }

    /// Walks the tables for `va`, logging each level.
    pub fn describe(&self, pm: &Pmap, va: VirtualAddress) -> Vec<WalkStep> {
        let guard = self.lock(pm);
        let steps = guard.walk(va, self.dm);
        log::debug!("{:?} walk for {}", pm.id(), va);
        for step in &steps {
            log::debug!(
                "  {:?}[{}] in table {}: {:?}",
                step.level,
                step.index,
                step.table,
                step.entry
            );
        }
        if let Some(d) = guard.mapping(va) {
            log::debug!(
                "  descriptor {} soft {:?} hw {:?} {:?} {:?}",
                d.pa,
                d.soft,
                d.hw,
                d.cache,
                d.flags
            );
        }
        steps
    }

    /// Fills a physical page with zeros.
    pub fn zero_page(&self, pa: PhysicalAddress) {
        assert!(pa.is_aligned(PAGE_SIZE), "page {} is not aligned", pa);
        // SAFETY: the page is reachable through the direct map and the caller owns it.
        unsafe { core::ptr::write_bytes(self.dm.phys_to_ptr::<u8>(pa), 0, PAGE_SIZE) };
    }

    /// Copies one physical page to another.
    pub fn copy_page(&self, src: PhysicalAddress, dst: PhysicalAddress) {
        assert!(
            src.is_aligned(PAGE_SIZE) && dst.is_aligned(PAGE_SIZE),
            "pages {} and {} are not aligned",
            src,
            dst
        );
        assert!(src != dst, "copying page {} onto itself", src);
        // SAFETY: distinct whole pages reachable through the direct map.
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.dm.phys_to_ptr::<u8>(src),
                self.dm.phys_to_ptr::<u8>(dst),
                PAGE_SIZE,
            )
        };
    }

    /// The kernel window currently backed by tables and descriptors.
    pub fn virtual_space(&self) -> (VirtualAddress, VirtualAddress) {
        (
            self.config.kernel_start,
            VirtualAddress::new(self.kernel_max.load(Ordering::Acquire)),
        )
    }

    /// Highest user address + 1 for spaces of this system.
    pub fn user_limit(&self) -> usize {
        if self.config.four_level_user {
            1 << 48
        } else {
            1 << 39
        }
    }

    fn in_window(&self, pm: &Pmap, va: VirtualAddress) -> bool {
        if pm.is_kernel() {
            va.as_usize() >= KERNEL_WINDOW_BASE
        } else {
            va.as_usize() < self.user_limit()
        }
    }

    fn check_page(&self, pm: &Pmap, va: VirtualAddress) {
        assert!(va.is_aligned(PAGE_SIZE), "address {} is not page aligned", va);
        assert!(
            self.in_window(pm, va),
            "address {} outside the {:?} window",
            va,
            pm.kind()
        );
    }

    fn check_range(&self, pm: &Pmap, start: VirtualAddress, end: VirtualAddress) {
        assert!(
            start.is_aligned(PAGE_SIZE) && end.is_aligned(PAGE_SIZE),
            "range {}..{} is not page aligned",
            start,
            end
        );
        assert!(start <= end, "range {}..{} is reversed", start, end);
        if start < end {
            self.check_page(pm, start);
            self.check_page(pm, end - PAGE_SIZE);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameFlag;
    use crate::testing::Machine;
    use crate::tlb::{Target, TlbOp};

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    #[test]
    fn enter_then_extract_round_trips() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(5);
        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RW, EnterFlags::empty())
            .unwrap();
        assert_eq!(m.system.extract(&pm, va(0x1000)), Some(pa));
        assert_eq!(m.system.extract(&pm, va(0x1abc)), Some(pa + 0xabc));
        assert_eq!(m.system.extract(&pm, va(0x2000)), None);
        assert_eq!(m.system.stats(&pm).resident, 1);
    }

    #[test]
    fn scenario_enter_protect_fault_remove_destroy() {
        let m = Machine::new(1);
        let baseline = m.system.node_pool().live();
        let descriptors = m.system.descriptor_pool().live();
        let pm = m.system.create().unwrap();
        let frame = m.page(5);

        m.system
            .enter(&pm, va(0x1000), frame, VmProt::RW, EnterFlags::empty())
            .unwrap();
        assert_eq!(m.system.extract(&pm, va(0x1000)), Some(frame));

        m.system.protect(&pm, va(0x1000), va(0x2000), VmProt::READ);
        assert_eq!(m.system.extract(&pm, va(0x1000)), Some(frame));
        assert!(!m.system.fault_fixup(&pm, va(0x1000), VmProt::WRITE));

        m.system.remove(&pm, va(0x1000), va(0x2000));
        assert_eq!(m.system.extract(&pm, va(0x1000)), None);

        m.system.destroy(&pm);
        assert_eq!(m.system.node_pool().live(), baseline);
        assert_eq!(m.system.descriptor_pool().live(), descriptors);
        assert_eq!(m.system.asids_in_use(), 0);
    }

    #[test]
    fn removing_unmapped_range_is_a_no_op() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.system.remove(&pm, va(0x1000), va(0x4000));
        m.system.remove(&pm, va(0x1000), va(0x1000));
        assert_eq!(m.system.stats(&pm), PmapStats::default());
    }

    #[test]
    fn overwrite_replaces_frame_and_protection() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let (a, b) = (m.page(1), m.page(2));
        m.system
            .enter(&pm, va(0x8000), a, VmProt::RW, EnterFlags::WIRED)
            .unwrap();
        m.system
            .enter(&pm, va(0x8000), b, VmProt::READ, EnterFlags::READ)
            .unwrap();
        assert_eq!(m.system.extract(&pm, va(0x8000)), Some(b));
        let stats = m.system.stats(&pm);
        assert_eq!(stats, PmapStats { resident: 1, wired: 0 });

        let token = LockToken::for_tests();
        let a_frame = m.system.memory_map().managed(a).unwrap();
        let b_frame = m.system.memory_map().managed(b).unwrap();
        assert!(a_frame.pv().lock_unordered(&token).is_empty());
        assert_eq!(b_frame.pv().lock_unordered(&token).len(), 1);
    }

    #[test]
    fn hardware_entry_matches_requested_access() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(3);
        m.system
            .enter(&pm, va(0x4000), pa, VmProt::RW, EnterFlags::READ)
            .unwrap();
        let entry = m.system.describe(&pm, va(0x4000)).last().unwrap().entry;
        assert_eq!(entry.address(), Some(pa));
        assert!(entry.accessed());
        assert!(!entry.writable(), "write stays withheld until the first write fault");
        assert_eq!(entry.mair_index(), crate::pte::MAIR_WRITE_BACK);
    }

    #[test]
    fn unmanaged_memory_is_device_and_untracked() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let dev = m.device(0);
        m.system
            .enter(&pm, va(0x4000), dev, VmProt::RW, EnterFlags::RW)
            .unwrap();
        let entry = m.system.describe(&pm, va(0x4000)).last().unwrap().entry;
        assert_eq!(entry.mair_index(), crate::pte::MAIR_DEVICE);
        assert!(entry.writable());
        assert!(!m.system.fault_fixup(&pm, va(0x4000), VmProt::WRITE));
    }

    #[test]
    fn entering_with_access_marks_page() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(7);
        let frame = m.system.memory_map().managed(pa).unwrap();

        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RW, EnterFlags::empty())
            .unwrap();
        assert!(!frame.flags.test(FrameFlag::Referenced));

        m.system
            .enter(&pm, va(0x2000), pa, VmProt::READ, EnterFlags::WRITE)
            .unwrap();
        assert!(frame.flags.test(FrameFlag::Referenced));
        assert!(!frame.flags.test(FrameFlag::Modified), "write not permitted by prot");

        m.system
            .enter(&pm, va(0x3000), pa, VmProt::RW, EnterFlags::WRITE)
            .unwrap();
        assert!(frame.flags.test(FrameFlag::Modified));
    }

    #[test]
    fn executable_flag_follows_mappings() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(8);
        let frame = m.system.memory_map().managed(pa).unwrap();
        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RX, EnterFlags::empty())
            .unwrap();
        assert!(frame.flags.test(FrameFlag::Executable));
        m.system
            .enter(&pm, va(0x2000), pa, VmProt::READ, EnterFlags::empty())
            .unwrap();
        assert!(frame.flags.test(FrameFlag::Executable));
        m.system
            .enter(&pm, va(0x3000), pa, VmProt::RW, EnterFlags::empty())
            .unwrap();
        assert!(!frame.flags.test(FrameFlag::Executable));
    }

    #[test]
    fn fault_fixup_follows_soft_protection() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(9);
        let frame = m.system.memory_map().managed(pa).unwrap();
        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RW, EnterFlags::empty())
            .unwrap();
        let entry = |m: &Machine| m.system.describe(&pm, va(0x1000)).last().unwrap().entry;
        assert!(!entry(&m).accessed());

        assert!(m.system.fault_fixup(&pm, va(0x1010), VmProt::READ));
        assert!(entry(&m).accessed());
        assert!(!entry(&m).writable());
        assert!(frame.flags.test(FrameFlag::Referenced));
        assert!(!frame.flags.test(FrameFlag::Modified));

        // Read access is already granted: a second read fault is real.
        assert!(!m.system.fault_fixup(&pm, va(0x1000), VmProt::READ));
        assert!(!m.system.fault_fixup(&pm, va(0x1000), VmProt::EXEC));

        assert!(m.system.fault_fixup(&pm, va(0x1000), VmProt::WRITE));
        assert!(entry(&m).writable());
        assert!(frame.flags.test(FrameFlag::Modified));

        assert!(!m.system.fault_fixup(&pm, va(0x5000), VmProt::READ));
    }

    #[test]
    fn can_fail_reports_out_of_memory() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.frames.set_exhausted(true);
        let flags = EnterFlags::CAN_FAIL;
        assert_eq!(
            m.system.enter(&pm, va(0x4000_0000), m.page(1), VmProt::READ, flags),
            Err(PmapError::OutOfMemory)
        );
        m.frames.set_exhausted(false);
        assert!(m
            .system
            .enter(&pm, va(0x4000_0000), m.page(1), VmProt::READ, flags)
            .is_ok());
    }

    #[test]
    #[should_panic(expected = "out of memory")]
    fn out_of_memory_without_can_fail_panics() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.frames.set_exhausted(true);
        let _ = m
            .system
            .enter(&pm, va(0x4000_0000), m.page(1), VmProt::READ, EnterFlags::empty());
    }

    #[test]
    fn descriptor_limit_is_enforced() {
        let m = Machine::with_config(PmapConfig {
            descriptor_limit: Some(2),
            ..Machine::config(1)
        });
        let pm = m.system.create().unwrap();
        for i in 0..2 {
            m.system
                .enter(&pm, va(0x1000 * (i + 1)), m.page(i), VmProt::READ, EnterFlags::CAN_FAIL)
                .unwrap();
        }
        assert_eq!(
            m.system
                .enter(&pm, va(0x3000), m.page(2), VmProt::READ, EnterFlags::CAN_FAIL),
            Err(PmapError::OutOfMemory)
        );
        assert_eq!(m.system.extract(&pm, va(0x3000)), None);
    }

    #[test]
    fn failed_enter_leaves_no_tables_behind() {
        let m = Machine::with_config(PmapConfig {
            descriptor_limit: Some(0),
            ..Machine::config(1)
        });
        let pm = m.system.create().unwrap();
        let nodes = m.system.node_pool().live();
        let frames = m.frames.live();
        let target = va(0x40_0000_0000);
        assert_eq!(
            m.system
                .enter(&pm, target, m.page(1), VmProt::READ, EnterFlags::CAN_FAIL),
            Err(PmapError::OutOfMemory)
        );
        assert_eq!(m.system.node_pool().live(), nodes);
        assert_eq!(m.frames.live(), frames);
        assert_eq!(m.system.describe(&pm, target).len(), 1);

        m.system.remove(&pm, target, target + PAGE_SIZE);
        assert_eq!(m.system.node_pool().live(), nodes);
    }

    #[test]
    fn failed_table_allocation_unlinks_the_partial_path() {
        // Room for the root and one more table.
        let m = Machine::with_config(PmapConfig {
            node_limit: Some(2),
            ..Machine::config(1)
        });
        let pm = m.system.create().unwrap();
        let nodes = m.system.node_pool().live();
        assert_eq!(
            m.system
                .enter(&pm, va(0x1000), m.page(1), VmProt::READ, EnterFlags::CAN_FAIL),
            Err(PmapError::OutOfMemory)
        );
        assert_eq!(m.system.node_pool().live(), nodes);
        let walk = m.system.describe(&pm, va(0x1000));
        assert_eq!(walk.len(), 1);
        assert!(!walk[0].entry.is_valid());
    }

    #[test]
    fn wired_mappings_are_counted_and_unwired() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.system
            .enter(&pm, va(0x1000), m.page(1), VmProt::READ, EnterFlags::WIRED)
            .unwrap();
        assert_eq!(m.system.stats(&pm).wired, 1);
        m.system.unwire(&pm, va(0x1000));
        m.system.unwire(&pm, va(0x1000));
        assert_eq!(m.system.stats(&pm), PmapStats { resident: 1, wired: 0 });
    }

    #[test]
    fn protect_without_read_or_exec_removes() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.system
            .enter(&pm, va(0x1000), m.page(1), VmProt::RW, EnterFlags::RW)
            .unwrap();
        m.system.protect(&pm, va(0x1000), va(0x2000), VmProt::WRITE);
        assert_eq!(m.system.extract(&pm, va(0x1000)), None);
    }

    #[test]
    fn removal_releases_empty_tables_after_invalidation() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        // The first mapping also sets up the descriptor arena, which stays.
        m.system
            .enter(&pm, va(0x1000), m.page(2), VmProt::READ, EnterFlags::empty())
            .unwrap();
        let before = m.frames.live();
        let nodes = m.system.node_pool().live();
        m.system
            .enter(&pm, va(0x40_0000_0000), m.page(1), VmProt::READ, EnterFlags::empty())
            .unwrap();
        // An L2 and an L3 table, each with its shadow.
        assert_eq!(m.frames.live(), before + 4);
        assert_eq!(m.system.node_pool().live(), nodes + 2);
        m.system.remove(&pm, va(0x40_0000_0000), va(0x40_0000_1000));
        assert_eq!(m.frames.live(), before);
        assert_eq!(m.system.node_pool().live(), nodes);
    }

    #[test]
    fn user_changes_reach_only_running_cpus() {
        let m = Machine::new(4);
        let pm = m.system.create().unwrap();
        let asids = pm.asids().unwrap();
        m.system
            .enter(&pm, va(0x1000), m.page(1), VmProt::READ, EnterFlags::empty())
            .unwrap();
        assert!(m.mmu.take_records().is_empty(), "nobody runs the space yet");

        m.system.activate(&pm);
        let records = m.mmu.take_records();
        assert_eq!(records.len(), 2, "first activation flushes both ASIDs locally");
        assert!(records.iter().all(|r| r.target == Target::Local));
        assert_eq!(m.mmu.ttbr(0) >> 48, u64::from(asids.user()));

        m.system.remove(&pm, va(0x1000), va(0x2000));
        let records = m.mmu.take_records();
        assert_eq!(
            records.iter().map(|r| r.op).collect::<Vec<_>>(),
            asids
                .both()
                .map(|asid| TlbOp::Page { va: va(0x1000), asid })
        );
        assert!(records.iter().all(|r| r.target == Target::Local));

        m.system.deactivate(&pm);
        m.system
            .enter(&pm, va(0x1000), m.page(1), VmProt::READ, EnterFlags::empty())
            .unwrap();
        assert!(m.mmu.take_records().is_empty());
    }

    #[test]
    fn destroy_retires_asids_everywhere() {
        let m = Machine::new(2);
        let pm = m.system.create().unwrap();
        let asids = pm.asids().unwrap();
        m.system.reference(&pm);
        m.system.destroy(&pm);
        assert_eq!(m.system.asids_in_use(), 1);
        m.mmu.take_records();
        m.system.destroy(&pm);
        let ops: Vec<_> = m.mmu.records().into_iter().map(|r| (r.op, r.target)).collect();
        assert_eq!(
            ops,
            asids
                .both()
                .map(|asid| (TlbOp::Asid(asid), Target::Broadcast))
        );
        assert_eq!(m.system.asids_in_use(), 0);
    }

    #[test]
    #[should_panic(expected = "used after destruction")]
    fn destroyed_space_cannot_be_used() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.system.destroy(&pm);
        m.system.extract(&pm, va(0x1000));
    }

    #[test]
    #[should_panic(expected = "never destroyed")]
    fn kernel_cannot_be_destroyed() {
        let m = Machine::new(1);
        m.system.destroy(m.system.kernel());
    }

    #[test]
    #[should_panic(expected = "outside the User window")]
    fn user_space_rejects_addresses_past_its_tree() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let _ = m
            .system
            .enter(&pm, va(1 << 39), m.page(1), VmProt::READ, EnterFlags::empty());
    }

    #[test]
    fn four_level_spaces_reach_48_bits() {
        let m = Machine::with_config(PmapConfig {
            four_level_user: true,
            ..Machine::config(1)
        });
        let pm = m.system.create().unwrap();
        let high = va(0x7FFF_FFFF_F000);
        m.system
            .enter(&pm, high, m.page(1), VmProt::READ, EnterFlags::empty())
            .unwrap();
        assert_eq!(m.system.extract(&pm, high), Some(m.page(1)));
        assert_eq!(m.system.describe(&pm, high).len(), 4);
    }

    #[test]
    fn zero_and_copy_pages() {
        let m = Machine::new(1);
        let (a, b) = (m.page(1), m.page(2));
        m.fill(a, 0x5A);
        m.system.copy_page(a, b);
        assert!(m.contents(b).iter().all(|x| *x == 0x5A));
        m.system.zero_page(a);
        assert!(m.contents(a).iter().all(|x| *x == 0));
    }

    #[test]
    fn reverse_maps_track_every_managed_mapping() {
        let m = Machine::new(2);
        let a = m.system.create().unwrap();
        let b = m.system.create().unwrap();
        let kernel = m.system.kernel().clone();
        let spaces = [&*a, &*b, &*kernel];
        let (p1, p2, p3) = (m.page(1), m.page(2), m.page(3));

        m.system
            .enter(&a, va(0x1000), p1, VmProt::RW, EnterFlags::empty())
            .unwrap();
        m.system
            .enter(&a, va(0x2000), p2, VmProt::READ, EnterFlags::WIRED)
            .unwrap();
        m.system
            .enter(&b, va(0x1000), p1, VmProt::READ, EnterFlags::empty())
            .unwrap();
        m.system
            .enter(&b, va(0x7000), p3, VmProt::RW, EnterFlags::RW)
            .unwrap();
        m.assert_reverse_maps_consistent(&spaces);

        // Overwrite moves the mapping from one reverse map to another.
        m.system
            .enter(&a, va(0x1000), p3, VmProt::READ, EnterFlags::empty())
            .unwrap();
        m.assert_reverse_maps_consistent(&spaces);

        let kva = VirtualAddress::new(KERNEL_WINDOW_BASE + 0x3000);
        m.system.kenter(kva, p2, VmProt::READ);
        m.assert_reverse_maps_consistent(&spaces);

        m.system.page_protect(p3, VmProt::READ);
        m.assert_reverse_maps_consistent(&spaces);

        m.system.page_protect(p3, VmProt::NONE);
        assert_eq!(m.system.extract(&a, va(0x1000)), None);
        assert_eq!(m.system.extract(&b, va(0x7000)), None);
        m.assert_reverse_maps_consistent(&spaces);

        m.system.remove(&b, va(0x1000), va(0x2000));
        m.assert_reverse_maps_consistent(&spaces);

        m.system
            .enter(&b, va(0x1000), p2, VmProt::RW, EnterFlags::empty())
            .unwrap();
        m.system.destroy(&a);
        m.assert_reverse_maps_consistent(&[&*b, &*kernel]);
        assert_eq!(m.system.extract(&kernel, kva), Some(p2));
    }

    #[test]
    fn large_ranges_flush_by_asid() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        m.system.activate(&pm);
        m.system
            .enter(&pm, va(0x1000), m.page(1), VmProt::READ, EnterFlags::empty())
            .unwrap();
        m.mmu.take_records();
        m.system.remove(&pm, va(0), va(0x20_0000));
        let ops: Vec<_> = m.mmu.take_records().into_iter().map(|r| r.op).collect();
        let asids = pm.asids().unwrap();
        assert_eq!(ops, asids.both().map(TlbOp::Asid));
    }
}
