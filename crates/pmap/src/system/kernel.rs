//! Kernel mappings.
//!
//! The kernel space is built at bootstrap with a table and a blank descriptor for
//! every page of its window, so entering a kernel mapping never allocates. The
//! window is extended 2 MiB at a time by [`PmapSystem::grow_kernel`].

use core::sync::atomic::Ordering;

use crate::address::{PhysicalAddress, VirtualAddress};
use crate::arch::{Level, PAGE_SIZE};
use crate::error::PmapError;
use crate::pmap::{Context, Pmap};
use crate::prot::{CacheMode, VmProt};
use crate::radix::Unlinked;
use crate::system::{LockToken, PmapSystem};
use crate::tlb::PendingFlush;

/// Enters a wired mapping into the kernel space.
///
/// Without an explicit cache mode RAM is mapped write-back and anything else as
/// device memory.
pub(crate) fn enter(
    ctx: &Context<'_>,
    kernel: &Pmap,
    va: VirtualAddress,
    pa: PhysicalAddress,
    prot: VmProt,
    cache: Option<CacheMode>,
) {
    assert!(
        va.is_aligned(PAGE_SIZE) && pa.is_aligned(PAGE_SIZE),
        "kernel mapping {} -> {} is not page aligned",
        va,
        pa
    );
    let cache = cache.unwrap_or_else(|| {
        if ctx.memmap.managed(pa).is_some() {
            CacheMode::WriteBack
        } else {
            log::warn!("kenter {}: {} is not RAM, mapping it uncached", va, pa);
            CacheMode::Uncached
        }
    });
    let mut guard = kernel.lock(LockToken::enter());
    let mut flush = PendingFlush::new();
    guard.kenter(ctx, va, pa, prot, cache, &mut flush);
    log::trace!("kenter {} -> {} {:?} {:?}", va, pa, prot, cache);
    guard.finish(ctx, flush, Unlinked::none());
}

/// Populates the kernel window over `[start, end)`, one 2 MiB block at a time.
///
/// On failure returns the block that could not be populated.
pub(crate) fn populate(
    ctx: &Context<'_>,
    kernel: &Pmap,
    start: VirtualAddress,
    end: VirtualAddress,
) -> Result<(), (VirtualAddress, PmapError)> {
    let mut guard = kernel.lock(LockToken::enter());
    let mut block = start;
    let mut result = Ok(());
    while block < end {
        if let Err(err) = guard.populate_block(ctx, block) {
            result = Err((block, err));
            break;
        }
        block = block + Level::L2.span();
    }
    guard.unlock();
    result
}

impl PmapSystem {
    /// Enters a wired kernel mapping with the default cache mode.
    ///
    /// # Panics
    ///
    /// Panics if `va` lies outside the populated kernel window.
    pub fn kenter(&self, va: VirtualAddress, pa: PhysicalAddress, prot: VmProt) {
        enter(&self.context(), &self.kernel, va, pa, prot, None);
    }

    /// Enters a wired kernel mapping with an explicit cache mode.
    pub fn kenter_cache(
        &self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        prot: VmProt,
        cache: CacheMode,
    ) {
        enter(&self.context(), &self.kernel, va, pa, prot, Some(cache));
    }

    /// Removes the kernel mappings in `[va, va + len)`.
    ///
    /// The descriptors stay in the tree for the next `kenter`.
    pub fn kremove(&self, va: VirtualAddress, len: usize) {
        assert!(
            va.is_aligned(PAGE_SIZE) && len % PAGE_SIZE == 0,
            "kernel range {} + {:#x} is not page aligned",
            va,
            len
        );
        let ctx = self.context();
        let pages = len / PAGE_SIZE;
        let mut guard = self.lock(&self.kernel);
        let mut flush = PendingFlush::for_range(pages);
        for page in 0..pages {
            guard.kremove(&ctx, va + page * PAGE_SIZE, &mut flush);
        }
        guard.finish(&ctx, flush, Unlinked::none());
    }

    /// Extends the populated kernel window to cover `limit`.
    ///
    /// The window never grows past the configured kernel limit. Returns the new end
    /// of the window, which falls short of `limit` if tables or descriptors ran out.
    pub fn grow_kernel(&self, limit: VirtualAddress) -> VirtualAddress {
        let block = Level::L2.span();
        let ceiling = self.config.kernel_limit.align_down(block);
        let target = limit.min(ceiling).align_up(block);

        let ctx = self.context();
        let mut guard = self.lock(&self.kernel);
        let start = VirtualAddress::new(self.kernel_max.load(Ordering::Acquire));
        let mut reached = start;
        while reached < target {
            if let Err(err) = guard.populate_block(&ctx, reached) {
                log::warn!(
                    "kernel growth stopped at {} of {}: {}",
                    reached,
                    target,
                    err
                );
                break;
            }
            reached = reached + block;
            self.kernel_max.store(reached.as_usize(), Ordering::Release);
        }
        guard.unlock();

        if reached > start {
            log::info!("kernel window grown from {} to {}", start, reached);
        }
        reached
    }
}
