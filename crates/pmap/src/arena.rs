//! Index-addressed slab storage carved out of physical frames.
//!
//! Radix nodes and mapping descriptors live in arenas and refer to each other by
//! index, so the tree, the reverse map and the descriptors never hold pointers
//! into one another.
//!
//! An arena grows one frame (a chunk) at a time from a [`FrameAllocator`] and
//! reaches its chunks through the direct map. Chunk addresses are kept in
//! directory frames, which are allocated the same way. During bootstrap the
//! allocator is the region stealer, so the kernel's structures never touch the
//! heap.

use core::marker::PhantomData;
use core::mem::size_of;

use crate::address::{DirectMap, PhysicalAddress};
use crate::arch::PAGE_SIZE;
use crate::pool::FrameAllocator;

/// Chunk addresses held by one directory frame.
const CHUNKS_PER_DIRECTORY: usize = PAGE_SIZE / size_of::<PhysicalAddress>();

/// Directory frames per arena.
const DIRECTORIES: usize = 64;

#[derive(Clone, Copy)]
enum Entry<T> {
    Occupied(T),
    Vacant { next: Option<u32> },
}

/// A slab whose slots are reused through a free list.
///
/// Values are plain data: the arena never runs destructors.
pub(crate) struct Arena<T: Copy> {
    dm: DirectMap,
    directories: [Option<PhysicalAddress>; DIRECTORIES],
    chunks: usize,
    /// Slots handed out so far. Every slot below is occupied or on the free list.
    high: u32,
    free: Option<u32>,
    len: usize,
    _values: PhantomData<T>,
}

impl<T: Copy> Arena<T> {
    const PER_CHUNK: usize = {
        assert!(size_of::<Entry<T>>() <= PAGE_SIZE, "arena entry larger than a page");
        PAGE_SIZE / size_of::<Entry<T>>()
    };

    pub const fn new(dm: DirectMap) -> Self {
        Self {
            dm,
            directories: [None; DIRECTORIES],
            chunks: 0,
            high: 0,
            free: None,
            len: 0,
            _values: PhantomData,
        }
    }

    /// Stores `value`, returning its index, or gives it back if the arena cannot grow.
    pub fn try_insert(&mut self, value: T, frames: &dyn FrameAllocator) -> Result<u32, T> {
        if let Some(index) = self.free {
            let slot = self.slot(index);
            // SAFETY: every index below `high` names an initialized entry.
            let Entry::Vacant { next } = (unsafe { slot.read() }) else {
                unreachable!("arena free list points at an occupied slot");
            };
            self.free = next;
            // SAFETY: as above; the entry is plain data and owned by the arena.
            unsafe { slot.write(Entry::Occupied(value)) };
            self.len += 1;
            return Ok(index);
        }
        if self.high as usize == self.capacity() && !self.grow(frames) {
            return Err(value);
        }
        let index = self.high;
        // SAFETY: `index` is below the capacity, inside a chunk owned by the arena.
        unsafe { self.slot(index).write(Entry::Occupied(value)) };
        self.high += 1;
        self.len += 1;
        Ok(index)
    }

    /// Makes room for `additional` more values without further allocation.
    pub fn try_reserve(&mut self, additional: usize, frames: &dyn FrameAllocator) -> bool {
        loop {
            let vacant = self.high as usize - self.len + (self.capacity() - self.high as usize);
            if additional <= vacant {
                return true;
            }
            if !self.grow(frames) {
                return false;
            }
        }
    }

    pub fn remove(&mut self, index: u32) -> Option<T> {
        if index >= self.high {
            return None;
        }
        let slot = self.slot(index);
        // SAFETY: every index below `high` names an initialized entry.
        let Entry::Occupied(value) = (unsafe { slot.read() }) else {
            return None;
        };
        // SAFETY: as above.
        unsafe { slot.write(Entry::Vacant { next: self.free }) };
        self.free = Some(index);
        self.len -= 1;
        Some(value)
    }

    pub fn get(&self, index: u32) -> Option<&T> {
        if index >= self.high {
            return None;
        }
        // SAFETY: initialized entry in a chunk owned by the arena; the borrow of
        // `self` keeps the chunk alive and unaliased by writers.
        match unsafe { &*self.slot(index) } {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut T> {
        if index >= self.high {
            return None;
        }
        // SAFETY: as in `get`, with the exclusive borrow of `self`.
        match unsafe { &mut *self.slot(index) } {
            Entry::Occupied(value) => Some(value),
            Entry::Vacant { .. } => None,
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.len
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Frames backing the arena, directories included.
    #[cfg(test)]
    pub fn frames(&self) -> usize {
        self.chunks + self.directories.iter().flatten().count()
    }

    /// Iterates the occupied slots with their indices.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &T)> {
        (0..self.high).filter_map(move |index| Some((index, self.get(index)?)))
    }

    /// Hands every value to `each`, then returns the arena's frames.
    pub fn clear(&mut self, frames: &dyn FrameAllocator, mut each: impl FnMut(T)) {
        for index in 0..self.high {
            // SAFETY: every index below `high` names an initialized entry.
            if let Entry::Occupied(value) = unsafe { self.slot(index).read() } {
                each(value);
            }
        }
        for chunk in 0..self.chunks {
            frames.free_frame(self.chunk(chunk));
        }
        for directory in self.directories.iter_mut() {
            if let Some(directory) = directory.take() {
                frames.free_frame(directory);
            }
        }
        self.chunks = 0;
        self.high = 0;
        self.free = None;
        self.len = 0;
    }

    fn capacity(&self) -> usize {
        self.chunks * Self::PER_CHUNK
    }

    fn grow(&mut self, frames: &dyn FrameAllocator) -> bool {
        if self.capacity() + Self::PER_CHUNK > u32::MAX as usize {
            return false;
        }
        let position = self.chunks % CHUNKS_PER_DIRECTORY;
        let Some(entry) = self.directories.get_mut(self.chunks / CHUNKS_PER_DIRECTORY) else {
            return false;
        };
        let directory = match *entry {
            Some(directory) => directory,
            None => {
                let Some(directory) = frames.allocate_frame() else {
                    return false;
                };
                *entry = Some(directory);
                directory
            }
        };
        let Some(chunk) = frames.allocate_frame() else {
            return false;
        };
        // SAFETY: the directory frame belongs to the arena and `position` is within it.
        unsafe {
            self.dm
                .phys_to_ptr::<PhysicalAddress>(directory)
                .add(position)
                .write(chunk)
        };
        self.chunks += 1;
        true
    }

    fn chunk(&self, chunk: usize) -> PhysicalAddress {
        debug_assert!(chunk < self.chunks);
        let directory = self.directories[chunk / CHUNKS_PER_DIRECTORY]
            .unwrap_or_else(|| panic!("invariant violation: arena chunk {} has no directory", chunk));
        // SAFETY: the directory frame belongs to the arena and names `chunk`.
        unsafe {
            self.dm
                .phys_to_ptr::<PhysicalAddress>(directory)
                .add(chunk % CHUNKS_PER_DIRECTORY)
                .read()
        }
    }

    fn slot(&self, index: u32) -> *mut Entry<T> {
        let index = index as usize;
        let chunk = self.chunk(index / Self::PER_CHUNK);
        self.dm
            .phys_to_ptr::<Entry<T>>(chunk)
            .wrapping_add(index % Self::PER_CHUNK)
    }
}
