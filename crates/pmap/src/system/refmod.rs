//! Page-wide operations through the reverse map.
//!
//! These start from a physical page instead of an address space, so they take the
//! locks the other way round: the frame's reverse map first, to find an entry, then
//! that entry's address space. The reverse-map lock is dropped before the address
//! space is locked, and the entry is looked up again under the address-space lock
//! before anything is changed.

use crate::address::PhysicalAddress;
use crate::arch::PAGE_SIZE;
use crate::descriptor::MappingDescriptor;
use crate::frame::{Frame, FrameFlag};
use crate::prot::VmProt;
use crate::radix::Unlinked;
use crate::system::{LockToken, PmapSystem};
use crate::tlb::PendingFlush;

impl PmapSystem {
    /// Narrows every mapping of the page at `pa` to `prot`.
    ///
    /// A protection without read or execute removes every mapping of the page.
    /// Pages that are not managed RAM are left alone.
    pub fn page_protect(&self, pa: PhysicalAddress, prot: VmProt) {
        let pa = pa.align_down(PAGE_SIZE);
        let Some(frame) = self.memmap.managed(pa) else {
            return;
        };
        if prot.intersects(VmProt::RX) {
            self.update_mappings(frame, pa, |d| {
                d.soft &= prot;
                d.hw &= d.soft;
            });
        } else {
            self.remove_mappings(frame, pa);
            frame.flags.clear(FrameFlag::Executable);
        }
    }

    /// Returns true if the page has been accessed since its reference bit was cleared.
    pub fn is_referenced(&self, pa: PhysicalAddress) -> bool {
        self.memmap
            .managed(pa)
            .is_some_and(|frame| frame.flags.test(FrameFlag::Referenced))
    }

    /// Returns true if the page has been written since its modify bit was cleared.
    pub fn is_modified(&self, pa: PhysicalAddress) -> bool {
        self.memmap
            .managed(pa)
            .is_some_and(|frame| frame.flags.test(FrameFlag::Modified))
    }

    /// Clears the page's reference bit and withdraws all hardware access, so the
    /// next access to any mapping faults and sets it again.
    ///
    /// Returns whether the bit was set.
    pub fn clear_reference(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.align_down(PAGE_SIZE);
        let Some(frame) = self.memmap.managed(pa) else {
            return false;
        };
        let was = frame.flags.clear(FrameFlag::Referenced);
        self.update_mappings(frame, pa, |d| d.hw = VmProt::NONE);
        was
    }

    /// Clears the page's modify bit and withdraws hardware write access.
    ///
    /// Returns whether the bit was set.
    pub fn clear_modify(&self, pa: PhysicalAddress) -> bool {
        let pa = pa.align_down(PAGE_SIZE);
        let Some(frame) = self.memmap.managed(pa) else {
            return false;
        };
        let was = frame.flags.clear(FrameFlag::Modified);
        self.update_mappings(frame, pa, |d| d.hw.remove(VmProt::WRITE));
        was
    }

    /// Applies `change` to every mapping of the page that is still in place once
    /// its address space is locked.
    fn update_mappings(
        &self,
        frame: &Frame,
        pa: PhysicalAddress,
        change: impl Fn(&mut MappingDescriptor),
    ) {
        let ctx = self.context();
        let mut token = LockToken::enter();
        let entries = frame.pv().lock_unordered(&token).snapshot();
        for entry in entries {
            let Some(space) = entry.space.upgrade() else {
                continue;
            };
            let mut guard = space.lock(token);
            let listed = frame.pv().lock(guard.permit()).contains(entry.id, entry.va);
            let mut flush = PendingFlush::new();
            if listed && !guard.destroyed {
                guard.update_managed(&ctx, entry.va, pa, &mut flush, &change);
            }
            token = guard.finish(&ctx, flush, Unlinked::none());
        }
    }

    /// Removes mappings of the page until its reverse map is empty.
    fn remove_mappings(&self, frame: &Frame, pa: PhysicalAddress) {
        let ctx = self.context();
        let mut removed = 0usize;
        loop {
            let token = LockToken::enter();
            let Some(entry) = frame.pv().lock_unordered(&token).first() else {
                break;
            };
            let Some(space) = entry.space.upgrade() else {
                frame
                    .pv()
                    .lock_unordered(&token)
                    .remove(entry.id, entry.va);
                continue;
            };

            let mut guard = space.lock(token);
            // The head may have been removed while no lock was held.
            if !frame.pv().lock(guard.permit()).contains(entry.id, entry.va) {
                continue;
            }
            assert!(
                guard.maps_managed(entry.va, pa),
                "invariant violation: reverse map of {} names {:?} {} which maps something else",
                pa,
                entry.id,
                entry.va
            );
            let mut flush = PendingFlush::new();
            let unlinked = guard.remove(&ctx, entry.va, entry.va + PAGE_SIZE, &mut flush);
            guard.finish(&ctx, flush, unlinked);
            removed += 1;
        }
        log::trace!("page {} unmapped from {} places", pa, removed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;

    use crate::address::VirtualAddress;
    use crate::pmap::PmapStats;
    use crate::prot::EnterFlags;
    use crate::testing::Machine;

    fn va(addr: usize) -> VirtualAddress {
        VirtualAddress::new(addr)
    }

    fn mappings(m: &Machine, pa: PhysicalAddress) -> usize {
        let token = LockToken::for_tests();
        m.system
            .memory_map()
            .managed(pa)
            .map_or(0, |frame| frame.pv().lock_unordered(&token).len())
    }

    #[test]
    fn read_only_narrows_every_mapping() {
        let m = Machine::new(2);
        let pa = m.page(3);
        let a = m.system.create().unwrap();
        let b = m.system.create().unwrap();
        m.system
            .enter(&a, va(0x1000), pa, VmProt::RW, EnterFlags::RW)
            .unwrap();
        m.system
            .enter(&b, va(0x7000), pa, VmProt::RW, EnterFlags::RW)
            .unwrap();

        m.system.page_protect(pa, VmProt::READ);

        for (pm, at) in [(&a, va(0x1000)), (&b, va(0x7000))] {
            assert_eq!(m.system.extract(pm, at), Some(pa));
            let entry = m.system.describe(pm, at).last().unwrap().entry;
            assert!(!entry.writable());
            assert!(!m.system.fault_fixup(pm, at, VmProt::WRITE));
        }
        assert_eq!(mappings(&m, pa), 2);
    }

    #[test]
    fn no_access_removes_every_mapping() {
        let m = Machine::new(1);
        let pa = m.page(3);
        let a = m.system.create().unwrap();
        let b = m.system.create().unwrap();
        m.system
            .enter(&a, va(0x1000), pa, VmProt::RX, EnterFlags::empty())
            .unwrap();
        m.system
            .enter(&a, va(0x2000), pa, VmProt::READ, EnterFlags::empty())
            .unwrap();
        m.system
            .enter(&b, va(0x1000), pa, VmProt::RW, EnterFlags::WIRED)
            .unwrap();
        m.system
            .enter(&b, va(0x3000), m.page(4), VmProt::READ, EnterFlags::empty())
            .unwrap();

        m.system.page_protect(pa, VmProt::NONE);

        assert_eq!(mappings(&m, pa), 0);
        assert_eq!(m.system.stats(&a), PmapStats::default());
        assert_eq!(m.system.stats(&b), PmapStats { resident: 1, wired: 0 });
        assert_eq!(m.system.extract(&b, va(0x3000)), Some(m.page(4)));
        assert!(!m
            .system
            .memory_map()
            .managed(pa)
            .unwrap()
            .flags
            .test(FrameFlag::Executable));
    }

    #[test]
    fn stale_entries_of_dropped_spaces_are_discarded() {
        let m = Machine::new(1);
        let pa = m.page(6);
        let live = m.system.create().unwrap();
        let dropped = m.system.create().unwrap();
        m.system
            .enter(&dropped, va(0x1000), pa, VmProt::READ, EnterFlags::empty())
            .unwrap();
        m.system
            .enter(&live, va(0x1000), pa, VmProt::READ, EnterFlags::empty())
            .unwrap();
        drop(dropped);

        m.system.page_protect(pa, VmProt::NONE);
        assert_eq!(mappings(&m, pa), 0);
        assert_eq!(m.system.extract(&live, va(0x1000)), None);
    }

    #[test]
    fn unmanaged_pages_are_ignored() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let dev = m.device(0);
        m.system
            .enter(&pm, va(0x1000), dev, VmProt::RW, EnterFlags::RW)
            .unwrap();
        m.system.page_protect(dev, VmProt::NONE);
        assert_eq!(m.system.extract(&pm, va(0x1000)), Some(dev));
        assert!(!m.system.clear_modify(dev));
        assert!(!m.system.is_referenced(dev));
    }

    #[test]
    fn clear_modify_withdraws_write_until_next_fault() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(2);
        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RW, EnterFlags::WRITE)
            .unwrap();
        assert!(m.system.is_modified(pa));

        assert!(m.system.clear_modify(pa));
        assert!(!m.system.clear_modify(pa));
        assert!(!m.system.is_modified(pa));
        let entry = m.system.describe(&pm, va(0x1000)).last().unwrap().entry;
        assert!(!entry.writable());
        assert!(m.system.is_referenced(pa));

        assert!(m.system.fault_fixup(&pm, va(0x1000), VmProt::WRITE));
        assert!(m.system.is_modified(pa));
    }

    #[test]
    fn clear_reference_withdraws_all_access() {
        let m = Machine::new(1);
        let pm = m.system.create().unwrap();
        let pa = m.page(2);
        m.system
            .enter(&pm, va(0x1000), pa, VmProt::RX, EnterFlags::READ)
            .unwrap();
        assert!(m.system.is_referenced(pa));

        assert!(m.system.clear_reference(pa));
        assert!(!m.system.is_referenced(pa));
        let entry = m.system.describe(&pm, va(0x1000)).last().unwrap().entry;
        assert!(!entry.accessed());
        assert_eq!(m.system.extract(&pm, va(0x1000)), Some(pa));

        assert!(m.system.fault_fixup(&pm, va(0x1000), VmProt::EXEC));
        assert!(m.system.is_referenced(pa));
        assert!(m.system.describe(&pm, va(0x1000)).last().unwrap().entry.accessed());
    }

    #[test]
    fn page_protect_races_with_enter_and_remove() {
        let m = Machine::new(4);
        let pa = m.page(3);
        let spaces: Vec<Arc<_>> = (0..3).map(|_| m.system.create().unwrap()).collect();
        let system = &m.system;
        let mmu = &m.mmu;

        std::thread::scope(|s| {
            for (cpu, pm) in spaces.iter().enumerate() {
                s.spawn(move || {
                    mmu.run_on(cpu + 1);
                    system.activate(pm);
                    for round in 0..200 {
                        let at = va(0x1000 * (1 + round % 8));
                        system
                            .enter(pm, at, pa, VmProt::RW, EnterFlags::WRITE)
                            .unwrap();
                        if round % 3 == 0 {
                            system.remove(pm, at, at + PAGE_SIZE);
                        }
                    }
                    system.deactivate(pm);
                });
            }
            s.spawn(move || {
                for _ in 0..100 {
                    system.page_protect(pa, VmProt::READ);
                    system.clear_modify(pa);
                    system.page_protect(pa, VmProt::NONE);
                }
            });
        });

        m.system.page_protect(pa, VmProt::NONE);
        assert_eq!(mappings(&m, pa), 0);
        for pm in &spaces {
            assert_eq!(m.system.stats(pm).resident, 0);
        }
    }
}
