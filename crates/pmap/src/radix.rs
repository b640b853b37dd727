//! Radix translation tables.
//!
//! Each node pairs a hardware table (a physical frame of 512 descriptors read by the
//! table walker) with a software shadow of the same width, kept in a second frame.
//! Shadow slots of intermediate nodes name the child node, shadow slots of leaf (L3)
//! nodes name the mapping descriptor. Nodes live in an arena owned by the tree and
//! are addressed by [`NodeHandle`].
//!
//! A tree is rooted at L0 (4 levels, 48-bit space) or L1 (3 levels, 39-bit space).
//! Below the root every level has the same shape.

use alloc::vec::Vec;
use core::mem::size_of;

use crate::address::{DirectMap, PhysicalAddress, VirtualAddress};
use crate::arch::{self, ENTRIES_PER_TABLE, Level, PAGE_SIZE};
use crate::arena::Arena;
use crate::descriptor::DescHandle;
use crate::error::PmapError;
use crate::pool::{FrameAllocator, Pool};
use crate::pte::PageEntry;
use crate::tlb::Mmu;

/// Index of a node in its tree's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct NodeHandle(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Slot {
    Empty,
    Table(NodeHandle),
    Leaf(DescHandle),
}

const _: () = assert!(size_of::<Slot>() * ENTRIES_PER_TABLE <= PAGE_SIZE);

#[derive(Clone, Copy)]
struct RadixNode {
    level: Level,
    table: PhysicalAddress,
    shadow: PhysicalAddress,
    used: usize,
}

/// Position of one leaf entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct LeafSlot {
    node: NodeHandle,
    index: usize,
}

impl LeafSlot {
    pub fn index(self) -> usize {
        self.index
    }

    /// Returns another slot of the same leaf table.
    pub fn with_index(self, index: usize) -> LeafSlot {
        debug_assert!(index < ENTRIES_PER_TABLE);
        LeafSlot {
            node: self.node,
            index,
        }
    }
}

/// Everything a tree needs to touch memory and hardware.
#[derive(Clone, Copy)]
pub(crate) struct TableEnv<'a> {
    pub dm: DirectMap,
    pub mmu: &'a dyn Mmu,
    pub frames: &'a dyn FrameAllocator,
    pub nodes: &'a Pool,
}

/// Nodes unlinked from a tree.
///
/// Their tables may still be cached by table walkers, so the frames are returned to
/// the allocator only after the covering invalidation has been issued.
#[must_use = "unlinked tables must be released after invalidation"]
pub(crate) struct Unlinked(Vec<RadixNode>);

impl Unlinked {
    pub fn none() -> Self {
        Unlinked(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn append(&mut self, mut other: Unlinked) {
        self.0.append(&mut other.0);
    }

    pub fn release(self, env: &TableEnv<'_>) {
        let count = self.0.len();
        for node in self.0 {
            env.frames.free_frame(node.table);
            env.frames.free_frame(node.shadow);
        }
        env.nodes.give_back(count);
    }
}

/// One line of a translation walk, for diagnostics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalkStep {
    pub level: Level,
    pub index: usize,
    pub table: PhysicalAddress,
    pub entry: PageEntry,
}

/// A radix tree of translation tables.
pub(crate) struct RadixTree {
    dm: DirectMap,
    root: NodeHandle,
    root_level: Level,
    nodes: Arena<RadixNode>,
}

impl RadixTree {
    /// Creates a tree with an empty root table.
    pub fn new(root_level: Level, env: &TableEnv<'_>) -> Result<Self, PmapError> {
        let mut nodes = Arena::new(env.dm);
        let root = allocate_node(&mut nodes, root_level, env)?;
        Ok(Self {
            dm: env.dm,
            root,
            root_level,
            nodes,
        })
    }

    /// Physical address of the root table, as loaded into a TTBR.
    pub fn root_table(&self) -> PhysicalAddress {
        self.node(self.root).table
    }

    #[cfg(test)]
    pub fn root_level(&self) -> Level {
        self.root_level
    }

    /// Number of bytes of address space the tree translates.
    pub fn span(&self) -> usize {
        self.root_level.span() * ENTRIES_PER_TABLE
    }

    /// Number of nodes, the root included.
    #[cfg(test)]
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Frames in use by the tree: two per node plus the node arena's own.
    #[cfg(test)]
    pub fn frames(&self) -> usize {
        2 * self.nodes.len() + self.nodes.frames()
    }

    /// Walks to the leaf slot for `va` without allocating.
    ///
    /// Returns `None` if any table on the way is missing.
    pub fn lookup(&self, va: VirtualAddress) -> Option<(LeafSlot, Option<DescHandle>)> {
        let mut handle = self.root;
        loop {
            let level = self.node(handle).level;
            let index = va.page_index(level);
            match (level, self.slot(handle, index)) {
                (Level::L3, Slot::Leaf(desc)) => {
                    return Some((LeafSlot { node: handle, index }, Some(desc)));
                }
                (Level::L3, Slot::Empty) => return Some((LeafSlot { node: handle, index }, None)),
                (_, Slot::Table(child)) => handle = child,
                (_, Slot::Empty) => return None,
                (level, slot) => panic!(
                    "invariant violation: {:?} slot {} at {:?} for {}",
                    slot, index, level, va
                ),
            }
        }
    }

    /// Walks to the leaf slot for `va`, creating missing tables.
    ///
    /// Tables created before a failing allocation stay linked; [`prune`](Self::prune)
    /// takes them out again.
    pub fn ensure_path(
        &mut self,
        va: VirtualAddress,
        env: &TableEnv<'_>,
    ) -> Result<LeafSlot, PmapError> {
        let mut handle = self.root;
        loop {
            let level = self.node(handle).level;
            let index = va.page_index(level);
            let Some(next_level) = level.next() else {
                return Ok(LeafSlot {
                    node: handle,
                    index,
                });
            };
            handle = match self.slot(handle, index) {
                Slot::Table(child) => child,
                Slot::Empty => {
                    let child = allocate_node(&mut self.nodes, next_level, env)?;
                    let child_table = self.node(child).table;
                    self.set_slot(handle, index, Slot::Table(child));
                    self.node_mut(handle).used += 1;
                    self.write_raw(handle, index, PageEntry::table(child_table), env);
                    child
                }
                Slot::Leaf(_) => panic!(
                    "invariant violation: descriptor in {:?} table for {}",
                    level, va
                ),
            };
        }
    }

    /// Returns the descriptor attached to a leaf slot.
    pub fn descriptor(&self, slot: LeafSlot) -> Option<DescHandle> {
        match self.slot(slot.node, slot.index) {
            Slot::Leaf(desc) => Some(desc),
            _ => None,
        }
    }

    /// Attaches a descriptor to an empty leaf slot.
    pub fn attach(&mut self, slot: LeafSlot, desc: DescHandle) {
        assert!(
            self.slot(slot.node, slot.index) == Slot::Empty,
            "invariant violation: leaf slot {} already occupied",
            slot.index
        );
        self.set_slot(slot.node, slot.index, Slot::Leaf(desc));
        self.node_mut(slot.node).used += 1;
    }

    /// Clears the hardware entry of a leaf slot and, if `detach` is set, unlinks
    /// its descriptor too.
    pub fn remove_leaf(
        &mut self,
        slot: LeafSlot,
        detach: bool,
        env: &TableEnv<'_>,
    ) -> Option<DescHandle> {
        self.write_raw(slot.node, slot.index, PageEntry::INVALID, env);
        if !detach {
            return None;
        }
        let Slot::Leaf(desc) = self.slot(slot.node, slot.index) else {
            return None;
        };
        self.set_slot(slot.node, slot.index, Slot::Empty);
        self.node_mut(slot.node).used -= 1;
        Some(desc)
    }

    /// Reads the hardware entry of a leaf slot.
    pub fn read(&self, slot: LeafSlot, dm: DirectMap) -> PageEntry {
        self.read_raw(slot.node, slot.index, dm)
    }

    /// Writes the hardware entry of a leaf slot.
    pub fn write(&self, slot: LeafSlot, entry: PageEntry, env: &TableEnv<'_>) {
        self.write_raw(slot.node, slot.index, entry, env);
    }

    /// Unlinks the empty tables on the path to `va`, leaves first. The root stays.
    pub fn prune(&mut self, va: VirtualAddress, env: &TableEnv<'_>) -> Unlinked {
        let mut path = Vec::with_capacity(4);
        let mut handle = self.root;
        loop {
            let index = va.page_index(self.node(handle).level);
            match self.slot(handle, index) {
                Slot::Table(child) => {
                    path.push((handle, index));
                    handle = child;
                }
                _ => break,
            }
        }

        let mut unlinked = Unlinked::none();
        while let Some((parent, index)) = path.pop() {
            let Slot::Table(child) = self.slot(parent, index) else {
                break;
            };
            if self.node(child).used != 0 {
                break;
            }
            self.write_raw(parent, index, PageEntry::INVALID, env);
            self.set_slot(parent, index, Slot::Empty);
            self.node_mut(parent).used -= 1;
            if let Some(node) = self.nodes.remove(child.0) {
                unlinked.0.push(node);
            }
        }
        unlinked
    }

    /// Lists every attached descriptor whose page lies in `[start, last]`.
    pub fn leaves(
        &self,
        start: VirtualAddress,
        last: VirtualAddress,
    ) -> Vec<(VirtualAddress, LeafSlot, DescHandle)> {
        let mut out = Vec::new();
        let base = start.as_usize() & !(self.span() - 1);
        self.collect(self.root, base, start.as_usize(), last.as_usize(), &mut out);
        out
    }

    fn collect(
        &self,
        handle: NodeHandle,
        base: usize,
        start: usize,
        last: usize,
        out: &mut Vec<(VirtualAddress, LeafSlot, DescHandle)>,
    ) {
        let level = self.node(handle).level;
        let span = level.span();
        let first_index = arch::page_index(start, level);
        let last_index = arch::page_index(last, level);
        for index in first_index..=last_index {
            let slot_base = base + index * span;
            let slot_last = slot_base + (span - 1);
            match self.slot(handle, index) {
                Slot::Empty => {}
                Slot::Table(child) => {
                    self.collect(child, slot_base, start.max(slot_base), last.min(slot_last), out)
                }
                Slot::Leaf(desc) => out.push((
                    VirtualAddress::new(slot_base),
                    LeafSlot {
                        node: handle,
                        index,
                    },
                    desc,
                )),
            }
        }
    }

    /// Records each level of the walk for `va`.
    pub fn walk(&self, va: VirtualAddress, dm: DirectMap) -> Vec<WalkStep> {
        let mut steps = Vec::with_capacity(4);
        let mut handle = self.root;
        loop {
            let node = self.node(handle);
            let index = va.page_index(node.level);
            steps.push(WalkStep {
                level: node.level,
                index,
                table: node.table,
                entry: self.read_raw(handle, index, dm),
            });
            match self.slot(handle, index) {
                Slot::Table(child) => handle = child,
                _ => return steps,
            }
        }
    }

    /// Unlinks every node, the root included, and returns the node arena's frames.
    pub fn teardown(&mut self, env: &TableEnv<'_>) -> Unlinked {
        let mut unlinked = Unlinked::none();
        self.nodes.clear(env.frames, |node| unlinked.0.push(node));
        unlinked
    }

    fn node(&self, handle: NodeHandle) -> &RadixNode {
        self.nodes
            .get(handle.0)
            .unwrap_or_else(|| panic!("invariant violation: dangling node {:?}", handle))
    }

    fn node_mut(&mut self, handle: NodeHandle) -> &mut RadixNode {
        self.nodes
            .get_mut(handle.0)
            .unwrap_or_else(|| panic!("invariant violation: dangling node {:?}", handle))
    }

    fn slot(&self, handle: NodeHandle, index: usize) -> Slot {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let shadow = self.node(handle).shadow;
        // SAFETY: the shadow frame belongs to the node, holds ENTRIES_PER_TABLE
        // initialized slots and is reachable through the direct map.
        unsafe { self.dm.phys_to_ptr::<Slot>(shadow).add(index).read() }
    }

    fn set_slot(&mut self, handle: NodeHandle, index: usize, slot: Slot) {
        debug_assert!(index < ENTRIES_PER_TABLE);
        let shadow = self.node(handle).shadow;
        // SAFETY: as in `slot`; `&mut self` makes this the only access.
        unsafe { self.dm.phys_to_ptr::<Slot>(shadow).add(index).write(slot) };
    }

    fn entry_ptr(&self, handle: NodeHandle, index: usize, dm: DirectMap) -> *mut u64 {
        debug_assert!(index < ENTRIES_PER_TABLE);
        dm.phys_to_ptr::<u64>(self.node(handle).table)
            .wrapping_add(index)
    }

    fn read_raw(&self, handle: NodeHandle, index: usize, dm: DirectMap) -> PageEntry {
        let ptr = self.entry_ptr(handle, index, dm);
        // SAFETY: the node's table frame is owned by this tree and reachable
        // through the direct map; the index is within the table.
        PageEntry::from_raw(unsafe { ptr.read_volatile() })
    }

    fn write_raw(&self, handle: NodeHandle, index: usize, entry: PageEntry, env: &TableEnv<'_>) {
        let ptr = self.entry_ptr(handle, index, env.dm);
        // SAFETY: as in `read_raw`; callers hold the owning address space's lock.
        unsafe { ptr.write_volatile(entry.raw()) };
        env.mmu.publish(ptr);
    }
}

fn allocate_node(
    nodes: &mut Arena<RadixNode>,
    level: Level,
    env: &TableEnv<'_>,
) -> Result<NodeHandle, PmapError> {
    if !env.nodes.try_take(1) {
        return Err(PmapError::OutOfMemory);
    }
    let fail = |frames: &[PhysicalAddress]| {
        for frame in frames {
            env.frames.free_frame(*frame);
        }
        env.nodes.give_back(1);
        Err(PmapError::OutOfMemory)
    };

    let Some(table) = env.frames.allocate_frame() else {
        return fail(&[]);
    };
    let Some(shadow) = env.frames.allocate_frame() else {
        return fail(&[table]);
    };
    debug_assert!(table.is_aligned(PAGE_SIZE), "misaligned table frame");

    // SAFETY: both frames were just handed to us and are reachable through the
    // direct map.
    unsafe {
        core::ptr::write_bytes(env.dm.phys_to_ptr::<u8>(table), 0, PAGE_SIZE);
        let slots = env.dm.phys_to_ptr::<Slot>(shadow);
        for index in 0..ENTRIES_PER_TABLE {
            slots.add(index).write(Slot::Empty);
        }
    }

    let node = RadixNode {
        level,
        table,
        shadow,
        used: 0,
    };
    match nodes.try_insert(node, env.frames) {
        Ok(index) => Ok(NodeHandle(index)),
        Err(_) => fail(&[table, shadow]),
    }
}
