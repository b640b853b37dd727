//! Software emulation of processor-side maintenance.
//!
//! The emulated MMU performs no translation. It records every invalidation together
//! with the processor that issued it, remembers the table base loaded on each
//! processor and counts table entry publications, so tests can check that the pmap
//! talks to the hardware the way it should.
//!
//! The "current CPU" is a per-thread value: a test thread calls
//! [`EmulatedMmu::run_on`] to act as a particular processor.

use core::cell::Cell;
use core::sync::atomic::{AtomicUsize, Ordering};
use std::vec::Vec;

use crate::tlb::{Mmu, Target, TlbOp};

std::thread_local! {
    static CURRENT_CPU: Cell<usize> = const { Cell::new(0) };
}

/// One invalidation as issued by the pmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TlbRecord {
    /// The processor that issued the invalidation.
    pub issuer: usize,
    pub op: TlbOp,
    pub target: Target,
}

impl TlbRecord {
    /// Returns true if `cpu` observes this invalidation.
    pub fn reaches(&self, cpu: usize) -> bool {
        self.target.reaches(self.issuer, cpu)
    }
}

/// A recording stand-in for the processor's MMU.
pub struct EmulatedMmu {
    cpus: usize,
    records: spin::Mutex<Vec<TlbRecord>>,
    ttbr: spin::Mutex<Vec<u64>>,
    publishes: AtomicUsize,
}

impl EmulatedMmu {
    /// Creates an emulated MMU for `cpus` processors.
    pub fn new(cpus: usize) -> Self {
        Self {
            cpus,
            records: spin::Mutex::new(Vec::new()),
            ttbr: spin::Mutex::new(alloc::vec![0; cpus]),
            publishes: AtomicUsize::new(0),
        }
    }

    /// Makes the calling thread act as processor `cpu`.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range.
    pub fn run_on(&self, cpu: usize) {
        assert!(cpu < self.cpus, "cpu {} out of range", cpu);
        CURRENT_CPU.with(|c| c.set(cpu));
    }

    /// Returns a copy of every invalidation recorded so far.
    pub fn records(&self) -> Vec<TlbRecord> {
        self.records.lock().clone()
    }

    /// Returns and clears the recorded invalidations.
    pub fn take_records(&self) -> Vec<TlbRecord> {
        core::mem::take(&mut *self.records.lock())
    }

    /// Returns the invalidations that reached `cpu`.
    pub fn received_by(&self, cpu: usize) -> Vec<TlbOp> {
        self.records
            .lock()
            .iter()
            .filter(|r| r.reaches(cpu))
            .map(|r| r.op)
            .collect()
    }

    /// Returns the user table base last loaded on `cpu`.
    pub fn ttbr(&self, cpu: usize) -> u64 {
        self.ttbr.lock()[cpu]
    }

    /// Returns the number of table entry writes made visible to the walker.
    pub fn publishes(&self) -> usize {
        self.publishes.load(Ordering::Relaxed)
    }
}

impl Mmu for EmulatedMmu {
    fn current_cpu(&self) -> usize {
        CURRENT_CPU.with(|c| c.get())
    }

    fn invalidate(&self, op: TlbOp, target: Target) {
        let issuer = self.current_cpu();
        self.records.lock().push(TlbRecord { issuer, op, target });
    }

    fn publish(&self, _entry: *const u64) {
        self.publishes.fetch_add(1, Ordering::Relaxed);
    }

    fn load_user_table(&self, ttbr: u64) {
        let cpu = self.current_cpu();
        self.ttbr.lock()[cpu] = ttbr;
    }
}
