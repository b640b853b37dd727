//! Reverse maps from physical frames to their mappings.
//!
//! Every managed frame carries a [`PvList`] naming each (address space, virtual
//! address) that maps it. Address-space locks and reverse-map locks nest in one
//! order only: an address space first, then a frame's list. The order is carried in
//! the types:
//!
//! - A [`LockToken`] is minted once per public entry point of the
//!   [`system`](crate::system) module, and nowhere else. Locking an address space
//!   consumes it, so a thread holds at most one address-space lock at a time.
//! - [`PvList::lock`] needs a [`PvPermit`], which only a held address-space guard
//!   hands out.
//! - [`PvList::lock_unordered`] borrows the token itself. While that list guard lives
//!   the token cannot be spent on an address-space lock.

use alloc::sync::Weak;
use alloc::vec::Vec;
use core::marker::PhantomData;

use spin::{Mutex, MutexGuard};

use crate::address::VirtualAddress;
use crate::error::PmapError;
use crate::pmap::{Pmap, PmapId};
use crate::system::LockToken;

/// Proof that an address-space lock is held, valid for as long as the lock is.
#[derive(Clone, Copy)]
pub(crate) struct PvPermit<'a> {
    _held: PhantomData<&'a LockToken>,
}

impl<'a> PvPermit<'a> {
    pub(crate) fn from_token(_token: &'a LockToken) -> Self {
        Self {
            _held: PhantomData,
        }
    }
}

/// One mapping of a frame.
#[derive(Clone)]
pub(crate) struct PvEntry {
    pub space: Weak<Pmap>,
    pub id: PmapId,
    pub va: VirtualAddress,
}

impl PvEntry {
    pub fn matches(&self, id: PmapId, va: VirtualAddress) -> bool {
        self.id == id && self.va == va
    }
}

/// The mappings of one frame.
pub(crate) struct PvList {
    entries: Mutex<Vec<PvEntry>>,
}

impl PvList {
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    /// Locks the list while an address-space lock is held.
    pub fn lock<'a>(&'a self, _permit: PvPermit<'a>) -> PvGuard<'a> {
        PvGuard(self.entries.lock())
    }

    /// Locks the list with no address-space lock held.
    pub fn lock_unordered<'a>(&'a self, _token: &'a LockToken) -> PvGuard<'a> {
        PvGuard(self.entries.lock())
    }
}

pub(crate) struct PvGuard<'a>(MutexGuard<'a, Vec<PvEntry>>);

impl PvGuard<'_> {
    /// Records a mapping without blocking on allocation.
    pub fn add(&mut self, entry: PvEntry) -> Result<(), PmapError> {
        self.0
            .try_reserve(1)
            .map_err(|_| PmapError::OutOfMemory)?;
        self.0.push(entry);
        Ok(())
    }

    /// Forgets a mapping, returning whether it was present.
    pub fn remove(&mut self, id: PmapId, va: VirtualAddress) -> bool {
        match self.0.iter().position(|e| e.matches(id, va)) {
            Some(index) => {
                self.0.swap_remove(index);
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, id: PmapId, va: VirtualAddress) -> bool {
        self.0.iter().any(|e| e.matches(id, va))
    }

    pub fn first(&self) -> Option<PvEntry> {
        self.0.first().cloned()
    }

    /// Copies the current entries.
    pub fn snapshot(&self) -> Vec<PvEntry> {
        self.0.clone()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}
