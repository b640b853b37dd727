//! Per-mapping descriptors.
//!
//! A descriptor is the software record of one virtual page mapping: where it points,
//! what the caller allowed (the soft protection) and what the hardware entry currently
//! grants. The two protections differ while referenced/modified emulation is
//! withholding access.

use bitflags::bitflags;

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arena::Arena;
use crate::error::PmapError;
use crate::pmap::PmapId;
use crate::pool::{FrameAllocator, Pool};
use crate::prot::{CacheMode, VmProt};
use crate::pte::{PageEntry, PermissionTable};

/// Index of a descriptor in its address space's store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct DescHandle(u32);

impl DescHandle {
    #[cfg(test)]
    pub(crate) const fn from_raw(index: u32) -> Self {
        DescHandle(index)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub(crate) struct DescriptorFlags: u8 {
        /// The descriptor describes a live mapping.
        const VALID = 1 << 0;
        /// The mapping is pinned.
        const WIRED = 1 << 1;
        /// The mapping is registered in its frame's reverse map.
        const MANAGED = 1 << 2;
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) struct MappingDescriptor {
    pub owner: PmapId,
    pub va: VirtualAddress,
    pub pa: PhysicalAddress,
    /// Protection the caller granted.
    pub soft: VmProt,
    /// Protection currently granted by the hardware entry, always within `soft`.
    pub hw: VmProt,
    pub cache: CacheMode,
    pub flags: DescriptorFlags,
}

impl MappingDescriptor {
    /// Returns an unused descriptor for `va`.
    pub fn blank(owner: PmapId, va: VirtualAddress) -> Self {
        Self {
            owner,
            va,
            pa: PhysicalAddress::new(0),
            soft: VmProt::NONE,
            hw: VmProt::NONE,
            cache: CacheMode::WriteBack,
            flags: DescriptorFlags::empty(),
        }
    }

    pub fn is_valid(&self) -> bool {
        self.flags.contains(DescriptorFlags::VALID)
    }

    pub fn is_wired(&self) -> bool {
        self.flags.contains(DescriptorFlags::WIRED)
    }

    pub fn is_managed(&self) -> bool {
        self.flags.contains(DescriptorFlags::MANAGED)
    }

    /// Resets the descriptor to the unused state, keeping its address.
    pub fn clear(&mut self) {
        *self = Self::blank(self.owner, self.va);
    }

    /// Encodes the hardware entry for the descriptor's current state.
    pub fn entry(&self, permissions: &PermissionTable, privileged: bool) -> PageEntry {
        PageEntry::page(self.pa, self.cache, permissions.bits(self.hw, privileged))
    }
}

/// Descriptor storage for one address space.
pub(crate) struct DescriptorStore {
    arena: Arena<MappingDescriptor>,
}

impl DescriptorStore {
    pub const fn new(dm: DirectMap) -> Self {
        Self {
            arena: Arena::new(dm),
        }
    }

    /// Allocates a blank descriptor without blocking.
    pub fn allocate(
        &mut self,
        pool: &Pool,
        frames: &dyn FrameAllocator,
        owner: PmapId,
        va: VirtualAddress,
    ) -> Result<DescHandle, PmapError> {
        if !pool.try_take(1) {
            return Err(PmapError::OutOfMemory);
        }
        match self.arena.try_insert(MappingDescriptor::blank(owner, va), frames) {
            Ok(index) => Ok(DescHandle(index)),
            Err(_) => {
                pool.give_back(1);
                Err(PmapError::OutOfMemory)
            }
        }
    }

    /// Sets aside room for `count` descriptors, or for none at all.
    pub fn reserve(
        &mut self,
        pool: &Pool,
        frames: &dyn FrameAllocator,
        count: usize,
    ) -> Result<(), PmapError> {
        if !self.arena.try_reserve(count, frames) || !pool.try_take(count) {
            return Err(PmapError::OutOfMemory);
        }
        Ok(())
    }

    /// Stores a blank descriptor in room set aside by [`reserve`](Self::reserve).
    pub fn insert_reserved(
        &mut self,
        frames: &dyn FrameAllocator,
        owner: PmapId,
        va: VirtualAddress,
    ) -> DescHandle {
        match self.arena.try_insert(MappingDescriptor::blank(owner, va), frames) {
            Ok(index) => DescHandle(index),
            Err(_) => unreachable!("descriptor space was reserved"),
        }
    }

    pub fn free(&mut self, pool: &Pool, handle: DescHandle) {
        if self.arena.remove(handle.0).is_some() {
            pool.give_back(1);
        }
    }

    /// Frees every descriptor and the frames holding them, returning how many
    /// descriptors there were.
    pub fn free_all(&mut self, pool: &Pool, frames: &dyn FrameAllocator) -> usize {
        let mut count = 0;
        self.arena.clear(frames, |_| count += 1);
        pool.give_back(count);
        count
    }

    pub fn get(&self, handle: DescHandle) -> &MappingDescriptor {
        self.arena
            .get(handle.0)
            .unwrap_or_else(|| panic!("invariant violation: dangling descriptor {:?}", handle))
    }

    pub fn get_mut(&mut self, handle: DescHandle) -> &mut MappingDescriptor {
        self.arena
            .get_mut(handle.0)
            .unwrap_or_else(|| panic!("invariant violation: dangling descriptor {:?}", handle))
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.arena.len()
    }

    /// Frames holding the descriptors.
    #[cfg(test)]
    pub fn frames(&self) -> usize {
        self.arena.frames()
    }

    pub fn iter(&self) -> impl Iterator<Item = (DescHandle, &MappingDescriptor)> {
        self.arena.iter().map(|(index, d)| (DescHandle(index), d))
    }
}
