//! arm64 hardware backend.

use core::arch::asm;

use aarch64_cpu::asm::barrier;
use aarch64_cpu::registers::*;

use crate::arch::{CpuMap, MPIDR_AFFINITY_MASK, PAGE_SHIFT};
use crate::tlb::{Mmu, Target, TlbOp};

/// Bits 0..43 of a TLBI operand carry VA[55:12].
const TLBI_VA_MASK: u64 = (1 << 44) - 1;

macro_rules! tlbi {
    ($op:literal) => {
        // SAFETY: TLB invalidation only drops cached translations.
        unsafe { asm!(concat!("tlbi ", $op), options(nostack, preserves_flags)) }
    };
    ($op:literal, $val:expr) => {
        // SAFETY: TLB invalidation only drops cached translations.
        unsafe {
            asm!(concat!("tlbi ", $op, ", {}"), in(reg) $val, options(nostack, preserves_flags))
        }
    };
}

/// The processor's own MMU.
pub struct HardwareMmu {
    cpus: CpuMap,
}

impl HardwareMmu {
    /// Creates the backend for the processors numbered by `cpus`.
    pub fn new(cpus: CpuMap) -> Self {
        Self { cpus }
    }
}

fn page_operand(va: usize, asid: u16) -> u64 {
    ((va as u64 >> PAGE_SHIFT) & TLBI_VA_MASK) | ((asid as u64) << 48)
}

impl Mmu for HardwareMmu {
    fn current_cpu(&self) -> usize {
        let mpidr = MPIDR_EL1.get();
        self.cpus.index_of(mpidr).unwrap_or_else(|| {
            panic!(
                "processor {:#x} missing from the cpu map",
                mpidr & MPIDR_AFFINITY_MASK
            )
        })
    }

    fn invalidate(&self, op: TlbOp, target: Target) {
        barrier::dsb(barrier::ISHST);
        // There is no way to aim an invalidation at a subset of processors, so
        // anything beyond the local processor goes to the whole shareable domain.
        let local = matches!(target, Target::Local);
        match (op, local) {
            (TlbOp::Page { va, asid }, true) => tlbi!("vae1", page_operand(va.as_usize(), asid)),
            (TlbOp::Page { va, asid }, false) => {
                tlbi!("vae1is", page_operand(va.as_usize(), asid))
            }
            (TlbOp::PageAllAsids { va }, true) => tlbi!("vaale1", page_operand(va.as_usize(), 0)),
            (TlbOp::PageAllAsids { va }, false) => {
                tlbi!("vaale1is", page_operand(va.as_usize(), 0))
            }
            (TlbOp::Asid(asid), true) => tlbi!("aside1", (asid as u64) << 48),
            (TlbOp::Asid(asid), false) => tlbi!("aside1is", (asid as u64) << 48),
            (TlbOp::All, true) => tlbi!("vmalle1"),
            (TlbOp::All, false) => tlbi!("vmalle1is"),
        }
        barrier::dsb(barrier::ISH);
        barrier::isb(barrier::SY);
    }

    fn publish(&self, entry: *const u64) {
        // SAFETY: cleaning a cache line by address has no architectural side effects
        // beyond making the line's contents visible to the table walker.
        unsafe {
            asm!("dc cvac, {}", in(reg) entry, options(nostack, preserves_flags));
        }
        barrier::dsb(barrier::SY);
    }

    fn load_user_table(&self, ttbr: u64) {
        TTBR0_EL1.set(ttbr);
        barrier::isb(barrier::SY);
    }
}
