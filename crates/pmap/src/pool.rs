//! Backing storage for translation structures.
//!
//! Table frames come from a [`FrameAllocator`] supplied by the physical memory
//! manager (or, during bootstrap, from the region stealer). Tables and descriptors
//! are both accounted in a [`Pool`], which enforces an optional cap and keeps the
//! live and peak counts.

use core::sync::atomic::{AtomicUsize, Ordering};

use crate::address::PhysicalAddress;

/// Source of page-sized, page-aligned physical frames.
///
/// Implementations must not block: the pmap calls them with its locks held.
pub trait FrameAllocator: Send + Sync {
    /// Allocates one frame, or returns `None` if none is available right now.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Returns a frame obtained from [`allocate_frame`](Self::allocate_frame).
    fn free_frame(&self, frame: PhysicalAddress);
}

/// Accounting for one kind of translation structure.
#[derive(Debug)]
pub struct Pool {
    name: &'static str,
    live: AtomicUsize,
    peak: AtomicUsize,
    limit: Option<usize>,
}

impl Pool {
    pub const fn new(name: &'static str, limit: Option<usize>) -> Self {
        Self {
            name,
            live: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
            limit,
        }
    }

    /// Accounts for `count` new items, failing if that would exceed the cap.
    pub fn try_take(&self, count: usize) -> bool {
        let mut live = self.live.load(Ordering::Relaxed);
        loop {
            let next = live + count;
            if self.limit.is_some_and(|limit| next > limit) {
                log::trace!("{} pool exhausted at {} items", self.name, live);
                return false;
            }
            match self
                .live
                .compare_exchange_weak(live, next, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => {
                    self.peak.fetch_max(next, Ordering::Relaxed);
                    return true;
                }
                Err(actual) => live = actual,
            }
        }
    }

    /// Accounts for items created outside the cap (bootstrap preallocation).
    pub fn force_take(&self, count: usize) {
        let next = self.live.fetch_add(count, Ordering::AcqRel) + count;
        self.peak.fetch_max(next, Ordering::Relaxed);
    }

    /// Returns `count` items to the pool.
    pub fn give_back(&self, count: usize) {
        let old = self.live.fetch_sub(count, Ordering::AcqRel);
        debug_assert!(old >= count, "{} pool underflow", self.name);
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> Option<usize> {
        self.limit
    }
}
