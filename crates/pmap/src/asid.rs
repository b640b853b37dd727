//! Hardware address space identifiers.
//!
//! Identifiers are handed out in pairs: the even member tags translations made
//! while the kernel runs on behalf of the process (trap entry and exit), the odd
//! member tags translations of the process itself. Pair 0 is never handed out.
//!
//! The allocator is a bitmap of atomic words. Claiming a pair picks a random
//! candidate and sets its bit with a compare-and-swap, so processors creating
//! address spaces at the same time do not serialize on a lock.

use alloc::boxed::Box;
use core::sync::atomic::{AtomicU64, Ordering};

/// A hardware address space identifier, as placed in TTBR bits 48..63.
pub type Asid = u16;

/// Random picks attempted before falling back to a linear scan.
const RANDOM_PICKS: usize = 8;

/// An identifier pair assigned to one user address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AsidPair(u16);

impl AsidPair {
    /// Returns the pair with the given index.
    pub const fn from_index(index: u16) -> Self {
        AsidPair(index)
    }

    pub const fn index(self) -> u16 {
        self.0
    }

    /// Identifier used while the kernel services the process.
    pub const fn kernel(self) -> Asid {
        self.0 << 1
    }

    /// Identifier used while the process runs.
    pub const fn user(self) -> Asid {
        (self.0 << 1) | 1
    }

    /// Both identifiers, kernel side first.
    pub const fn both(self) -> [Asid; 2] {
        [self.kernel(), self.user()]
    }
}

/// Lock-free allocator of [`AsidPair`]s.
pub struct AsidAllocator {
    words: Box<[AtomicU64]>,
    pairs: usize,
    seed: AtomicU64,
}

impl AsidAllocator {
    /// Creates an allocator for identifiers `asid_bits` wide (8 or 16).
    ///
    /// # Panics
    ///
    /// Panics if `asid_bits` is neither 8 nor 16.
    pub fn new(asid_bits: u32) -> Self {
        assert!(
            asid_bits == 8 || asid_bits == 16,
            "ASID width must be 8 or 16 bits"
        );
        let pairs = 1usize << (asid_bits - 1);
        let words: Box<[AtomicU64]> = (0..pairs.div_ceil(64)).map(|_| AtomicU64::new(0)).collect();
        words[0].store(1, Ordering::Relaxed);
        Self {
            words,
            pairs,
            seed: AtomicU64::new(0x9E37_79B9_7F4A_7C15),
        }
    }

    /// Returns the number of pairs that can ever be live at once.
    pub fn capacity(&self) -> usize {
        self.pairs - 1
    }

    /// Returns the number of pairs currently claimed.
    pub fn in_use(&self) -> usize {
        let set: u32 = self
            .words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones())
            .sum();
        set as usize - 1
    }

    /// Claims a free pair, or returns `None` if every pair is live.
    pub fn allocate(&self) -> Option<AsidPair> {
        for _ in 0..RANDOM_PICKS {
            let candidate = (self.next_random() % self.pairs as u64) as usize;
            if self.try_claim(candidate) {
                return Some(AsidPair(candidate as u16));
            }
        }
        (1..self.pairs)
            .find(|&index| self.try_claim(index))
            .map(|index| AsidPair(index as u16))
    }

    /// Releases a pair for reuse.
    ///
    /// # Panics
    ///
    /// Panics if the pair is not currently claimed.
    pub fn free(&self, pair: AsidPair) {
        let index = pair.0 as usize;
        let mask = 1u64 << (index % 64);
        let old = self.words[index / 64].fetch_and(!mask, Ordering::AcqRel);
        assert!(old & mask != 0, "ASID pair {} released twice", index);
    }

    fn try_claim(&self, index: usize) -> bool {
        if index == 0 || index >= self.pairs {
            return false;
        }
        let word = &self.words[index / 64];
        let mask = 1u64 << (index % 64);
        let mut current = word.load(Ordering::Acquire);
        loop {
            if current & mask != 0 {
                return false;
            }
            match word.compare_exchange_weak(
                current,
                current | mask,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    // xorshift64; quality only needs to spread concurrent claimants apart.
    fn next_random(&self) -> u64 {
        let mut x = self.seed.load(Ordering::Relaxed);
        loop {
            let mut next = x;
            next ^= next << 13;
            next ^= next >> 7;
            next ^= next << 17;
            match self
                .seed
                .compare_exchange_weak(x, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => x = actual,
            }
        }
    }
}
