//! Address spaces and the mapping operations performed under their lock.
//!
//! A [`Pmap`] owns one radix tree and the descriptors hanging off it. Every change
//! happens through a [`PmapGuard`], which is only obtainable by spending the
//! caller's [`LockToken`]. Hardware entries written under the guard are collected
//! in a [`PendingFlush`] and invalidated before the guard is released.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::ops::Deref;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arch::{ENTRIES_PER_TABLE, Level, PAGE_SIZE};
use crate::asid::AsidPair;
use crate::descriptor::{DescHandle, DescriptorFlags, DescriptorStore, MappingDescriptor};
use crate::error::PmapError;
use crate::frame::{Frame, FrameFlag};
use crate::memmap::MemoryMap;
use crate::pool::{FrameAllocator, Pool};
use crate::prot::{CacheMode, EnterFlags, VmProt};
use crate::pte::PermissionTable;
use crate::pv::{PvEntry, PvPermit};
use crate::radix::{LeafSlot, RadixTree, TableEnv, Unlinked, WalkStep};
use crate::system::LockToken;
use crate::tlb::{CpuSet, Invalidator, Mmu, PendingFlush, Residency, Scope};

/// Identity of an address space, stable for its whole life and never reused.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PmapId(u64);

impl PmapId {
    pub(crate) const fn from_raw(raw: u64) -> Self {
        PmapId(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Debug for PmapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pmap#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmapKind {
    Kernel,
    User,
}

/// Page counts of an address space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PmapStats {
    /// Valid mappings.
    pub resident: usize,
    /// Valid mappings that are pinned.
    pub wired: usize,
}

/// Shared state every mapping operation needs.
#[derive(Clone, Copy)]
pub(crate) struct Context<'a> {
    pub dm: DirectMap,
    pub mmu: &'a dyn Mmu,
    pub frames: &'a dyn FrameAllocator,
    pub memmap: &'a MemoryMap,
    pub nodes: &'a Pool,
    pub descriptors: &'a Pool,
    pub permissions: &'a PermissionTable,
    pub cpus: usize,
    /// Managed mappings are recorded in the reverse map.
    pub tracking: bool,
}

impl<'a> Context<'a> {
    pub fn tables(&self) -> TableEnv<'a> {
        TableEnv {
            dm: self.dm,
            mmu: self.mmu,
            frames: self.frames,
            nodes: self.nodes,
        }
    }

    pub fn invalidator(&self) -> Invalidator<'a> {
        Invalidator::new(self.mmu, self.cpus)
    }

    /// Returns the metadata of `pa` if it is ordinary RAM.
    pub fn ram(&self, pa: PhysicalAddress) -> Option<&'a Frame> {
        self.memmap.managed(pa)
    }
}

/// An address space.
pub struct Pmap {
    id: PmapId,
    this: Weak<Pmap>,
    asids: Option<AsidPair>,
    root: PhysicalAddress,
    refs: AtomicUsize,
    residency: Residency,
    inner: Mutex<PmapInner>,
}

pub(crate) struct PmapInner {
    pub tree: RadixTree,
    pub descriptors: DescriptorStore,
    pub stats: PmapStats,
    pub destroyed: bool,
}

impl Pmap {
    /// Creates an address space with an empty root table and one reference.
    ///
    /// `asids` is `None` for the kernel space.
    pub(crate) fn create(
        id: PmapId,
        asids: Option<AsidPair>,
        root_level: Level,
        ctx: &Context<'_>,
    ) -> Result<Arc<Pmap>, PmapError> {
        let tree = RadixTree::new(root_level, &ctx.tables())?;
        let root = tree.root_table();
        Ok(Arc::new_cyclic(|this| Pmap {
            id,
            this: this.clone(),
            asids,
            root,
            refs: AtomicUsize::new(1),
            residency: Residency::new(),
            inner: Mutex::new(PmapInner {
                tree,
                descriptors: DescriptorStore::new(ctx.dm),
                stats: PmapStats::default(),
                destroyed: false,
            }),
        }))
    }

    pub fn id(&self) -> PmapId {
        self.id
    }

    pub fn kind(&self) -> PmapKind {
        match self.asids {
            None => PmapKind::Kernel,
            Some(_) => PmapKind::User,
        }
    }

    pub fn is_kernel(&self) -> bool {
        self.asids.is_none()
    }

    /// The identifier pair of a user space.
    pub fn asids(&self) -> Option<AsidPair> {
        self.asids
    }

    /// Physical address of the root translation table.
    pub fn root_table(&self) -> PhysicalAddress {
        self.root
    }

    /// Translation table base register value for a user space.
    pub fn ttbr(&self) -> Option<u64> {
        self.asids
            .map(|pair| (u64::from(pair.user()) << 48) | self.root.as_usize() as u64)
    }

    /// Processors currently running this space.
    pub fn running_on(&self) -> CpuSet {
        self.residency.running()
    }

    pub fn references(&self) -> usize {
        self.refs.load(Ordering::Acquire)
    }

    pub(crate) fn residency(&self) -> &Residency {
        &self.residency
    }

    pub(crate) fn retain(&self) {
        let old = self.refs.fetch_add(1, Ordering::AcqRel);
        assert!(old != 0, "{:?} referenced after destruction", self.id);
    }

    /// Drops one reference, returning true when it was the last.
    pub(crate) fn release(&self) -> bool {
        let old = self.refs.fetch_sub(1, Ordering::AcqRel);
        assert!(old != 0, "{:?} reference count underflow", self.id);
        old == 1
    }

    pub(crate) fn scope(&self) -> Scope<'_> {
        match self.asids {
            None => Scope::Kernel,
            Some(asids) => Scope::User {
                asids,
                residency: &self.residency,
            },
        }
    }

    pub(crate) fn lock(&self, token: LockToken) -> PmapGuard<'_> {
        PmapGuard {
            pmap: self,
            inner: self.inner.lock(),
            token,
        }
    }
}

impl fmt::Debug for Pmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pmap")
            .field("id", &self.id)
            .field("asids", &self.asids)
            .field("root", &self.root)
            .finish_non_exhaustive()
    }
}

/// An address space's lock, held.
pub(crate) struct PmapGuard<'a> {
    pmap: &'a Pmap,
    inner: MutexGuard<'a, PmapInner>,
    token: LockToken,
}

impl<'a> Deref for PmapGuard<'a> {
    type Target = PmapInner;

    fn deref(&self) -> &PmapInner {
        &self.inner
    }
}

impl<'a> PmapGuard<'a> {
    /// Permission to lock a frame's reverse map while this guard is held.
    pub fn permit(&self) -> PvPermit<'_> {
        PvPermit::from_token(&self.token)
    }

    fn parts(&mut self) -> (&mut PmapInner, PvPermit<'_>) {
        (&mut self.inner, PvPermit::from_token(&self.token))
    }

    /// Invalidates the collected entries, releases the lock, then frees tables
    /// unlinked while it was held.
    pub fn finish(self, ctx: &Context<'_>, flush: PendingFlush, unlinked: Unlinked) -> LockToken {
        flush.flush(&ctx.invalidator(), self.pmap.scope());
        let token = self.unlock();
        if !unlinked.is_empty() {
            unlinked.release(&ctx.tables());
        }
        token
    }

    pub fn unlock(self) -> LockToken {
        drop(self.inner);
        self.token
    }

    /// Returns the valid mapping of the page containing `va`.
    pub fn mapping(&self, va: VirtualAddress) -> Option<&MappingDescriptor> {
        let (_, handle) = self.inner.tree.lookup(va.align_down(PAGE_SIZE))?;
        let d = self.inner.descriptors.get(handle?);
        d.is_valid().then_some(d)
    }

    pub fn extract(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.mapping(va).map(|d| d.pa + va.page_offset())
    }

    pub fn walk(&self, va: VirtualAddress, dm: DirectMap) -> Vec<WalkStep> {
        self.inner.tree.walk(va, dm)
    }

    /// Installs a mapping, replacing any mapping already at `va`.
    ///
    /// A failed enter leaves nothing new in a user tree: the descriptor is freed
    /// again and tables created for it are added to `unlinked`.
    #[allow(clippy::too_many_arguments)]
    pub fn enter(
        &mut self,
        ctx: &Context<'_>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        flags: EnterFlags,
        flush: &mut PendingFlush,
        unlinked: &mut Unlinked,
    ) -> Result<(), PmapError> {
        let pmap = self.pmap;
        let env = ctx.tables();
        let (inner, permit) = self.parts();

        let slot = match inner.tree.ensure_path(va, &env) {
            Ok(slot) => slot,
            Err(err) => {
                abandon(inner, ctx, pmap, va, None, unlinked);
                return soft_failure(flags, va, err);
            }
        };
        let handle = match inner.tree.descriptor(slot) {
            Some(handle) => {
                unmap(inner, permit, ctx, pmap.id, slot, handle, false, flush);
                handle
            }
            None => match inner
                .descriptors
                .allocate(ctx.descriptors, ctx.frames, pmap.id, va)
            {
                Ok(handle) => {
                    inner.tree.attach(slot, handle);
                    handle
                }
                Err(err) => {
                    abandon(inner, ctx, pmap, va, None, unlinked);
                    return soft_failure(flags, va, err);
                }
            },
        };

        let frame = ctx.ram(pa);
        let tracked = frame.filter(|_| ctx.tracking);
        if let Some(frame) = tracked {
            let entry = PvEntry {
                space: pmap.this.clone(),
                id: pmap.id,
                va,
            };
            let added = frame.pv().lock(permit).add(entry);
            if let Err(err) = added {
                abandon(inner, ctx, pmap, va, Some(slot), unlinked);
                return soft_failure(flags, va, err);
            }
        }

        let cache = match frame {
            Some(_) => CacheMode::WriteBack,
            None => CacheMode::Uncached,
        };
        if let Some(frame) = frame {
            if !flags.access().is_empty() {
                frame.flags.set(FrameFlag::Referenced);
            }
            if prot.contains(VmProt::WRITE) && flags.contains(EnterFlags::WRITE) {
                frame.flags.set(FrameFlag::Modified);
            }
        }

        let d = inner.descriptors.get_mut(handle);
        d.pa = pa;
        d.soft = prot;
        d.hw = prot & flags.access();
        d.cache = cache;
        d.flags = DescriptorFlags::VALID;
        if tracked.is_some() {
            d.flags |= DescriptorFlags::MANAGED;
        }
        if flags.contains(EnterFlags::WIRED) {
            d.flags |= DescriptorFlags::WIRED;
            inner.stats.wired += 1;
        }
        inner.stats.resident += 1;
        inner
            .tree
            .write(slot, d.entry(ctx.permissions, pmap.is_kernel()), &env);
        flush.push(va);

        if let Some(frame) = frame {
            if prot.contains(VmProt::EXEC) {
                frame.flags.set(FrameFlag::Executable);
            } else if prot.contains(VmProt::WRITE) {
                frame.flags.clear(FrameFlag::Executable);
            }
        }
        log::trace!(
            "{:?} enter {} -> {} {:?} hw {:?}",
            pmap.id,
            va,
            pa,
            prot,
            d.hw
        );
        Ok(())
    }

    /// Installs a wired kernel mapping into a preallocated descriptor.
    pub fn kenter(
        &mut self,
        ctx: &Context<'_>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        cache: CacheMode,
        flush: &mut PendingFlush,
    ) {
        let pmap = self.pmap;
        debug_assert!(pmap.is_kernel());
        let (inner, permit) = self.parts();
        let Some((slot, Some(handle))) = inner.tree.lookup(va) else {
            panic!("kernel descriptor not preallocated for {} (pa {})", va, pa);
        };
        unmap(inner, permit, ctx, pmap.id, slot, handle, false, flush);

        let d = inner.descriptors.get_mut(handle);
        d.pa = pa;
        d.soft = prot;
        d.hw = prot;
        d.cache = cache;
        d.flags = DescriptorFlags::VALID | DescriptorFlags::WIRED;
        inner.stats.resident += 1;
        inner.stats.wired += 1;
        inner.tree.write(slot, d.entry(ctx.permissions, true), &ctx.tables());
        flush.push(va);
    }

    /// Removes the kernel mapping at `va`, keeping its descriptor.
    pub fn kremove(&mut self, ctx: &Context<'_>, va: VirtualAddress, flush: &mut PendingFlush) {
        let pmap = self.pmap;
        let (inner, permit) = self.parts();
        if let Some((slot, Some(handle))) = inner.tree.lookup(va) {
            unmap(inner, permit, ctx, pmap.id, slot, handle, false, flush);
        }
    }

    /// Removes every mapping in `[start, end)`.
    ///
    /// User descriptors are freed and emptied tables unlinked; kernel descriptors
    /// stay in place for reuse.
    pub fn remove(
        &mut self,
        ctx: &Context<'_>,
        start: VirtualAddress,
        end: VirtualAddress,
        flush: &mut PendingFlush,
    ) -> Unlinked {
        let mut unlinked = Unlinked::none();
        if start >= end {
            return unlinked;
        }
        let pmap = self.pmap;
        let env = ctx.tables();
        let (inner, permit) = self.parts();
        for (va, slot, handle) in inner.tree.leaves(start, end - 1) {
            if pmap.is_kernel() {
                unmap(inner, permit, ctx, pmap.id, slot, handle, false, flush);
            } else if let Some(handle) =
                unmap(inner, permit, ctx, pmap.id, slot, handle, true, flush)
            {
                inner.descriptors.free(ctx.descriptors, handle);
                unlinked.append(inner.tree.prune(va, &env));
            }
        }
        unlinked
    }

    /// Narrows every mapping in `[start, end)` to `prot`, removing them if `prot`
    /// allows neither reads nor execution.
    pub fn protect(
        &mut self,
        ctx: &Context<'_>,
        start: VirtualAddress,
        end: VirtualAddress,
        prot: VmProt,
        flush: &mut PendingFlush,
    ) -> Unlinked {
        if !prot.intersects(VmProt::RX) {
            return self.remove(ctx, start, end, flush);
        }
        if start < end {
            let privileged = self.pmap.is_kernel();
            let env = ctx.tables();
            let inner = &mut *self.inner;
            for (_, slot, handle) in inner.tree.leaves(start, end - 1) {
                let d = inner.descriptors.get_mut(handle);
                if !d.is_valid() {
                    continue;
                }
                d.soft &= prot;
                d.hw &= d.soft;
                inner.tree.write(slot, d.entry(ctx.permissions, privileged), &env);
                flush.push(d.va);
            }
        }
        Unlinked::none()
    }

    /// Rewrites the mapping at `va` if it still maps `pa` and is in the reverse map.
    ///
    /// Returns false if the mapping changed underneath the caller.
    pub fn update_managed(
        &mut self,
        ctx: &Context<'_>,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flush: &mut PendingFlush,
        change: impl FnOnce(&mut MappingDescriptor),
    ) -> bool {
        let privileged = self.pmap.is_kernel();
        let inner = &mut *self.inner;
        let Some((slot, Some(handle))) = inner.tree.lookup(va) else {
            return false;
        };
        let d = inner.descriptors.get_mut(handle);
        if !d.is_valid() || !d.is_managed() || d.pa != pa {
            return false;
        }
        change(d);
        debug_assert!(d.soft.contains(d.hw));
        inner
            .tree
            .write(slot, d.entry(ctx.permissions, privileged), &ctx.tables());
        flush.push(va);
        true
    }

    /// Returns true if `va` holds a valid managed mapping of `pa`.
    pub fn maps_managed(&self, va: VirtualAddress, pa: PhysicalAddress) -> bool {
        self.mapping(va)
            .is_some_and(|d| d.is_managed() && d.pa == pa)
    }

    /// Grants the hardware access a fault proves was used, within the soft protection.
    pub fn fault_fixup(
        &mut self,
        ctx: &Context<'_>,
        va: VirtualAddress,
        access: VmProt,
        flush: &mut PendingFlush,
    ) -> bool {
        let va = va.align_down(PAGE_SIZE);
        let privileged = self.pmap.is_kernel();
        let inner = &mut *self.inner;
        let Some((slot, Some(handle))) = inner.tree.lookup(va) else {
            return false;
        };
        let d = inner.descriptors.get_mut(handle);
        if !d.is_valid() {
            return false;
        }
        let Some(frame) = ctx.ram(d.pa) else {
            return false;
        };
        if inner.tree.read(slot, ctx.dm).raw() == 0 {
            return false;
        }

        let missing = |p: VmProt| access.contains(p) && d.soft.contains(p) && !d.hw.contains(p);
        if missing(VmProt::WRITE) {
            frame.flags.set(FrameFlag::Modified);
            frame.flags.set(FrameFlag::Referenced);
            d.hw |= d.soft;
        } else if missing(VmProt::EXEC) || missing(VmProt::READ) {
            frame.flags.set(FrameFlag::Referenced);
            d.hw |= d.soft & VmProt::RX;
        } else {
            return false;
        }

        log::trace!("{:?} fixup {} {:?} -> hw {:?}", self.pmap.id, va, access, d.hw);
        inner
            .tree
            .write(slot, d.entry(ctx.permissions, privileged), &ctx.tables());
        flush.push(va);
        true
    }

    /// Clears the wired bit of the mapping at `va`.
    pub fn unwire(&mut self, va: VirtualAddress) {
        let inner = &mut *self.inner;
        let Some((_, Some(handle))) = inner.tree.lookup(va.align_down(PAGE_SIZE)) else {
            return;
        };
        let d = inner.descriptors.get_mut(handle);
        if d.is_valid() && d.is_wired() {
            d.flags.remove(DescriptorFlags::WIRED);
            inner.stats.wired -= 1;
        }
    }

    /// Allocates the tables and blank descriptors for the 2 MiB block at `block`.
    ///
    /// Descriptors are added all at once or not at all. Slots that already hold
    /// one are left alone.
    pub fn populate_block(
        &mut self,
        ctx: &Context<'_>,
        block: VirtualAddress,
    ) -> Result<(), PmapError> {
        debug_assert!(block.is_aligned(Level::L2.span()));
        let pmap = self.pmap;
        let inner = &mut *self.inner;
        let first = inner.tree.ensure_path(block, &ctx.tables())?;
        let vacant = (0..ENTRIES_PER_TABLE)
            .filter(|index| inner.tree.descriptor(first.with_index(*index)).is_none())
            .count();
        if vacant == 0 {
            return Ok(());
        }
        inner
            .descriptors
            .reserve(ctx.descriptors, ctx.frames, vacant)?;
        for index in 0..ENTRIES_PER_TABLE {
            let slot = first.with_index(index);
            if inner.tree.descriptor(slot).is_none() {
                let handle =
                    inner
                        .descriptors
                        .insert_reserved(ctx.frames, pmap.id, block + index * PAGE_SIZE);
                inner.tree.attach(slot, handle);
            }
        }
        Ok(())
    }

    /// Drops every mapping and unlinks every table, the root included.
    ///
    /// The caller retires the space's identifiers before releasing the tables.
    pub fn teardown(&mut self, ctx: &Context<'_>) -> Unlinked {
        let pmap = self.pmap;
        let (inner, permit) = self.parts();
        for (_, d) in inner.descriptors.iter() {
            if d.is_valid() && d.is_managed() {
                if let Some(frame) = ctx.memmap.frame_for(d.pa) {
                    frame.pv().lock(permit).remove(pmap.id, d.va);
                }
            }
        }
        let freed = inner.descriptors.free_all(ctx.descriptors, ctx.frames);
        inner.stats = PmapStats::default();
        inner.destroyed = true;
        let unlinked = inner.tree.teardown(&ctx.tables());
        log::debug!(
            "{:?} torn down: {} descriptors, {} tables",
            pmap.id,
            freed,
            unlinked.len()
        );
        unlinked
    }
}

/// Takes back what a failed enter left in a user tree: the descriptor at `slot`
/// and the tables on the path to `va` that are now empty. Kernel descriptors and
/// tables stay.
fn abandon(
    inner: &mut PmapInner,
    ctx: &Context<'_>,
    pmap: &Pmap,
    va: VirtualAddress,
    slot: Option<LeafSlot>,
    unlinked: &mut Unlinked,
) {
    if pmap.is_kernel() {
        return;
    }
    let env = ctx.tables();
    if let Some(handle) = slot.and_then(|slot| inner.tree.remove_leaf(slot, true, &env)) {
        inner.descriptors.free(ctx.descriptors, handle);
    }
    unlinked.append(inner.tree.prune(va, &env));
}

fn soft_failure(flags: EnterFlags, va: VirtualAddress, err: PmapError) -> Result<(), PmapError> {
    if flags.contains(EnterFlags::CAN_FAIL) {
        Err(err)
    } else {
        panic!("pmap enter {} failed: {}", va, err)
    }
}

/// Invalidates the mapping held by `handle`, optionally detaching the descriptor.
#[allow(clippy::too_many_arguments)]
fn unmap(
    inner: &mut PmapInner,
    permit: PvPermit<'_>,
    ctx: &Context<'_>,
    id: PmapId,
    slot: LeafSlot,
    handle: DescHandle,
    detach: bool,
    flush: &mut PendingFlush,
) -> Option<DescHandle> {
    let d = inner.descriptors.get_mut(handle);
    if d.is_valid() {
        if d.is_wired() {
            inner.stats.wired -= 1;
        }
        inner.stats.resident -= 1;
        if d.is_managed() {
            if let Some(frame) = ctx.memmap.frame_for(d.pa) {
                frame.pv().lock(permit).remove(id, d.va);
            }
        }
        log::trace!("{:?} remove {} -> {}", id, d.va, d.pa);
        flush.push(d.va);
        d.clear();
    } else if !detach {
        return None;
    }
    inner.tree.remove_leaf(slot, detach, &ctx.tables())
}
