//! Translation cache maintenance.
//!
//! The [`Mmu`] trait is the seam between the pmap and the processor: the hardware
//! backend issues `tlbi` instructions, the software backend records what would have
//! been issued. [`Invalidator`] decides *which* processors need to hear about a change.
//!
//! Kernel mappings are global and are invalidated on every processor. A user space
//! is invalidated only on the processors currently running it; processors that ran it
//! earlier are forgotten and flush its identifiers locally the next time they switch
//! to it (see [`Invalidator::activate`]).

use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::address::VirtualAddress;
use crate::asid::{Asid, AsidPair};

/// Maximum number of processors tracked in a [`CpuSet`].
pub const MAX_CPUS: usize = 64;

/// Ranges at least this many pages long are invalidated as a whole.
pub const RANGE_FLUSH_PAGES: usize = 512;

/// A set of processors, one bit per CPU index.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet {
    /// The empty set.
    pub const EMPTY: CpuSet = CpuSet(0);

    /// Returns the set containing only `cpu`.
    pub const fn single(cpu: usize) -> Self {
        assert!(cpu < MAX_CPUS, "cpu index out of range");
        CpuSet(1 << cpu)
    }

    /// Returns the set of the first `count` processors.
    pub const fn first(count: usize) -> Self {
        if count >= MAX_CPUS {
            CpuSet(u64::MAX)
        } else {
            CpuSet((1 << count) - 1)
        }
    }

    pub const fn from_bits(bits: u64) -> Self {
        CpuSet(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, cpu: usize) -> bool {
        cpu < MAX_CPUS && self.0 & (1 << cpu) != 0
    }

    /// Iterates the CPU indices in the set, lowest first.
    pub fn iter(self) -> impl Iterator<Item = usize> {
        (0..MAX_CPUS).filter(move |cpu| self.contains(*cpu))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A translation cache invalidation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlbOp {
    /// One page tagged with one ASID (`tlbi vae1`).
    Page { va: VirtualAddress, asid: Asid },
    /// One page in every ASID, for global kernel entries (`tlbi vaale1`).
    PageAllAsids { va: VirtualAddress },
    /// Every entry tagged with the ASID (`tlbi aside1`).
    Asid(Asid),
    /// Every entry (`tlbi vmalle1`).
    All,
}

/// The processors an invalidation must reach.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// Only the calling processor.
    Local,
    /// A specific set of processors.
    Cpus(CpuSet),
    /// Every processor in the inner shareable domain.
    Broadcast,
}

impl Target {
    /// Returns true if `cpu` observes an invalidation issued by `issuer`.
    pub fn reaches(self, issuer: usize, cpu: usize) -> bool {
        match self {
            Target::Local => issuer == cpu,
            Target::Cpus(set) => set.contains(cpu),
            Target::Broadcast => true,
        }
    }
}

/// Processor-side translation and cache maintenance.
pub trait Mmu: Send + Sync {
    /// Returns the index of the calling processor.
    fn current_cpu(&self) -> usize;

    /// Invalidates cached translations and waits for completion.
    fn invalidate(&self, op: TlbOp, target: Target);

    /// Makes a translation table entry write visible to the table walker.
    fn publish(&self, entry: *const u64);

    /// Loads the user translation table base register on the calling processor.
    fn load_user_table(&self, ttbr: u64);
}

/// Which processors may hold translations for a user space.
#[derive(Default)]
pub struct Residency {
    /// Processors that have the space loaded right now.
    running: AtomicU64,
    /// Processors whose translation caches may hold the space's entries.
    cached: AtomicU64,
}

impl Residency {
    pub const fn new() -> Self {
        Self {
            running: AtomicU64::new(0),
            cached: AtomicU64::new(0),
        }
    }

    pub fn running(&self) -> CpuSet {
        CpuSet(self.running.load(Ordering::SeqCst))
    }

    #[cfg(test)]
    pub fn cached(&self) -> CpuSet {
        CpuSet(self.cached.load(Ordering::SeqCst))
    }
}

/// The address space a change belongs to.
#[derive(Clone, Copy)]
pub enum Scope<'a> {
    /// The kernel space: global entries, every processor.
    Kernel,
    /// A user space with its identifier pair.
    User {
        asids: AsidPair,
        residency: &'a Residency,
    },
}

/// Issues invalidations for mapping changes.
pub struct Invalidator<'a> {
    mmu: &'a dyn Mmu,
    cpus: usize,
}

impl<'a> Invalidator<'a> {
    pub fn new(mmu: &'a dyn Mmu, cpus: usize) -> Self {
        Self { mmu, cpus }
    }

    /// Invalidates one page.
    pub fn page(&self, scope: Scope<'_>, va: VirtualAddress) {
        match scope {
            Scope::Kernel => self
                .mmu
                .invalidate(TlbOp::PageAllAsids { va }, self.everyone()),
            Scope::User { asids, residency } => {
                if let Some(target) = self.resident_target(residency) {
                    for asid in asids.both() {
                        self.mmu.invalidate(TlbOp::Page { va, asid }, target);
                    }
                }
            }
        }
    }

    /// Invalidates every entry of the space.
    pub fn space(&self, scope: Scope<'_>) {
        match scope {
            Scope::Kernel => self.mmu.invalidate(TlbOp::All, self.everyone()),
            Scope::User { asids, residency } => {
                if let Some(target) = self.resident_target(residency) {
                    for asid in asids.both() {
                        self.mmu.invalidate(TlbOp::Asid(asid), target);
                    }
                }
            }
        }
    }

    /// Flushes an identifier pair everywhere, used when the pair is released.
    pub fn retire(&self, asids: AsidPair) {
        for asid in asids.both() {
            self.mmu.invalidate(TlbOp::Asid(asid), self.everyone());
        }
    }

    /// Records that the calling processor now runs the space and loads its table.
    ///
    /// A processor that was dropped from the cached set while idle flushes the
    /// identifiers locally before it can translate through them again.
    pub fn activate(&self, asids: AsidPair, residency: &Residency, ttbr: u64) {
        let cpu = self.this_cpu();
        residency.running.fetch_or(cpu.0, Ordering::SeqCst);
        let cached = residency.cached.fetch_or(cpu.0, Ordering::SeqCst);
        if cached & cpu.0 == 0 {
            for asid in asids.both() {
                self.mmu.invalidate(TlbOp::Asid(asid), Target::Local);
            }
        }
        self.mmu.load_user_table(ttbr);
    }

    /// Records that the calling processor stopped running the space.
    pub fn deactivate(&self, residency: &Residency) {
        let cpu = self.this_cpu();
        residency.running.fetch_and(!cpu.0, Ordering::SeqCst);
    }

    fn this_cpu(&self) -> CpuSet {
        let cpu = self.mmu.current_cpu();
        assert!(
            cpu < self.cpus,
            "cpu {} is outside the {} configured processors",
            cpu,
            self.cpus
        );
        CpuSet::single(cpu)
    }

    fn everyone(&self) -> Target {
        if self.cpus <= 1 {
            Target::Local
        } else {
            Target::Broadcast
        }
    }

    // Forget idle processors first, then read the running set again: a processor
    // activating concurrently either sees its cached bit cleared or is running.
    fn resident_target(&self, residency: &Residency) -> Option<Target> {
        let running = residency.running.load(Ordering::SeqCst);
        residency.cached.fetch_and(running, Ordering::SeqCst);
        let running = CpuSet(residency.running.load(Ordering::SeqCst));
        if running.is_empty() {
            return None;
        }
        let me = self.this_cpu();
        if self.cpus <= 1 || running == me {
            Some(Target::Local)
        } else {
            Some(Target::Cpus(running))
        }
    }
}

/// Pages changed under one lock hold, invalidated together before the lock is released.
pub struct PendingFlush {
    pages: Vec<VirtualAddress>,
    whole: bool,
}

impl PendingFlush {
    pub fn new() -> Self {
        Self {
            pages: Vec::new(),
            whole: false,
        }
    }

    /// Starts a batch for a range known to be `pages` long.
    pub fn for_range(pages: usize) -> Self {
        Self {
            pages: Vec::new(),
            whole: pages >= RANGE_FLUSH_PAGES,
        }
    }

    pub fn push(&mut self, va: VirtualAddress) {
        if self.whole {
            return;
        }
        if self.pages.len() + 1 >= RANGE_FLUSH_PAGES || self.pages.try_reserve(1).is_err() {
            self.whole = true;
            self.pages.clear();
            return;
        }
        self.pages.push(va);
    }

    pub fn is_empty(&self) -> bool {
        !self.whole && self.pages.is_empty()
    }

    /// Issues the invalidations.
    pub fn flush(self, invalidator: &Invalidator<'_>, scope: Scope<'_>) {
        if self.whole {
            invalidator.space(scope);
        } else {
            for va in self.pages {
                invalidator.page(scope, va);
            }
        }
    }
}

impl Default for PendingFlush {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::{EmulatedMmu, TlbRecord};

    fn pair() -> AsidPair {
        AsidPair::from_index(3)
    }

    #[test]
    fn kernel_page_is_broadcast_on_multiprocessor() {
        let mmu = EmulatedMmu::new(4);
        let inv = Invalidator::new(&mmu, 4);
        let va = VirtualAddress::new(0xFFFF_FF80_0000_1000);
        inv.page(Scope::Kernel, va);
        assert_eq!(
            mmu.take_records(),
            [TlbRecord {
                issuer: 0,
                op: TlbOp::PageAllAsids { va },
                target: Target::Broadcast
            }]
        );
    }

    #[test]
    fn uniprocessor_stays_local() {
        let mmu = EmulatedMmu::new(1);
        let inv = Invalidator::new(&mmu, 1);
        inv.page(Scope::Kernel, VirtualAddress::new(0xFFFF_FF80_0000_1000));
        assert!(mmu.take_records().iter().all(|r| r.target == Target::Local));
    }

    #[test]
    fn idle_user_space_needs_no_invalidation() {
        let mmu = EmulatedMmu::new(4);
        let inv = Invalidator::new(&mmu, 4);
        let residency = Residency::new();
        inv.page(
            Scope::User {
                asids: pair(),
                residency: &residency,
            },
            VirtualAddress::new(0x1000),
        );
        assert!(mmu.take_records().is_empty());
    }

    #[test]
    fn user_page_hits_both_identifiers_on_running_cpus() {
        let mmu = EmulatedMmu::new(4);
        let inv = Invalidator::new(&mmu, 4);
        let residency = Residency::new();
        residency.running.store(0b0110, Ordering::SeqCst);
        let va = VirtualAddress::new(0x1000);
        inv.page(
            Scope::User {
                asids: pair(),
                residency: &residency,
            },
            va,
        );
        let records = mmu.take_records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].op, TlbOp::Page { va, asid: 6 });
        assert_eq!(records[1].op, TlbOp::Page { va, asid: 7 });
        assert!(
            records
                .iter()
                .all(|r| r.target == Target::Cpus(CpuSet::from_bits(0b0110)))
        );
    }

    #[test]
    fn change_forgets_idle_cpus_and_they_flush_on_activate() {
        let mmu = EmulatedMmu::new(2);
        let inv = Invalidator::new(&mmu, 2);
        let residency = Residency::new();

        inv.activate(pair(), &residency, 0x1234);
        assert_eq!(mmu.take_records().len(), 2, "first activation flushes locally");
        inv.deactivate(&residency);
        assert_eq!(residency.cached(), CpuSet::single(0));

        let scope = Scope::User {
            asids: pair(),
            residency: &residency,
        };
        inv.page(scope, VirtualAddress::new(0x1000));
        assert!(mmu.take_records().is_empty());
        assert!(residency.cached().is_empty());

        inv.activate(pair(), &residency, 0x1234);
        let records = mmu.take_records();
        assert_eq!(records.len(), 2);
        assert!(records.iter().all(|r| matches!(r.op, TlbOp::Asid(_))));
        assert_eq!(mmu.ttbr(0), 0x1234);
    }

    #[test]
    #[should_panic(expected = "outside the 2 configured processors")]
    fn unconfigured_cpu_is_rejected() {
        let mmu = EmulatedMmu::new(4);
        let inv = Invalidator::new(&mmu, 2);
        mmu.run_on(3);
        inv.activate(pair(), &Residency::new(), 1);
    }

    #[test]
    fn reactivation_without_changes_skips_flush() {
        let mmu = EmulatedMmu::new(2);
        let inv = Invalidator::new(&mmu, 2);
        let residency = Residency::new();
        inv.activate(pair(), &residency, 1);
        inv.deactivate(&residency);
        mmu.take_records();
        inv.activate(pair(), &residency, 1);
        assert!(mmu.take_records().is_empty());
    }

    #[test]
    fn long_batches_collapse_to_whole_space() {
        let mmu = EmulatedMmu::new(1);
        let inv = Invalidator::new(&mmu, 1);
        let mut batch = PendingFlush::new();
        for page in 0..RANGE_FLUSH_PAGES {
            batch.push(VirtualAddress::new(page << 12));
        }
        batch.flush(&inv, Scope::Kernel);
        assert_eq!(
            mmu.take_records(),
            [TlbRecord {
                issuer: 0,
                op: TlbOp::All,
                target: Target::Local
            }]
        );
    }
}
