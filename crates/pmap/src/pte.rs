//! arm64 stage 1 translation table descriptors.
//!
//! This is the one bit-exact format in the crate: the table walker reads it.
//! Descriptors are 64 bits wide. Bits 0..1 give the type, bits 12..47 the output
//! address, and the remaining low and high bits carry attributes.

use core::fmt;

use crate::address::PhysicalAddress;
use crate::prot::{CacheMode, VmProt};

/// Descriptor type at L0..L2: next-level table.
pub const TYPE_TABLE: u64 = 3;
/// Descriptor type at L3: page.
pub const TYPE_PAGE: u64 = 3;

/// Output address bits 12..47.
pub const ADDRESS_MASK: u64 = 0x0000_FFFF_FFFF_F000;

/// MAIR index field.
pub const fn attr_index(index: u64) -> u64 {
    index << 2
}

/// Access permission field.
pub const fn attr_ap(ap: u64) -> u64 {
    ap << 6
}

/// Shareability field.
pub const fn attr_sh(sh: u64) -> u64 {
    sh << 8
}

/// Shareability: inner shareable.
pub const SH_INNER: u64 = 3;
/// Access flag.
pub const ATTR_AF: u64 = 1 << 10;
/// Not global: translations are tagged with the ASID.
pub const ATTR_NG: u64 = 1 << 11;
/// Privileged execute never.
pub const ATTR_PXN: u64 = 1 << 53;
/// Unprivileged execute never.
pub const ATTR_UXN: u64 = 1 << 54;

/// MAIR slot: normal, inner and outer write-back.
pub const MAIR_WRITE_BACK: u64 = 0;
/// MAIR slot: normal, inner and outer non-cacheable.
pub const MAIR_NON_CACHEABLE: u64 = 1;
/// MAIR slot: device-nGnRnE.
pub const MAIR_DEVICE: u64 = 2;

/// Hardware access bits for every protection, for privileged and unprivileged spaces.
///
/// Rows are indexed by [`VmProt::table_index`]. A table for another MMU encoding can
/// be supplied through the configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PermissionTable {
    pub kernel: [u64; 8],
    pub user: [u64; 8],
}

impl PermissionTable {
    /// The arm64 encoding.
    ///
    /// Kernel entries are global. User entries are not global and never executable
    /// by the kernel. "No access" entries leave the access flag clear so that any
    /// access faults.
    pub const ARM64: PermissionTable = PermissionTable {
        kernel: [
            /* none */ ATTR_PXN | ATTR_UXN | attr_ap(2),
            /* r */ ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(2),
            /* w */ ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(0),
            /* rw */ ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(0),
            /* x */ ATTR_UXN | ATTR_AF | attr_ap(2),
            /* rx */ ATTR_UXN | ATTR_AF | attr_ap(2),
            /* wx */ ATTR_UXN | ATTR_AF | attr_ap(0),
            /* rwx */ ATTR_UXN | ATTR_AF | attr_ap(0),
        ],
        user: [
            /* none */ ATTR_NG | ATTR_PXN | ATTR_UXN | attr_ap(2),
            /* r */ ATTR_NG | ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(3),
            /* w */ ATTR_NG | ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(1),
            /* rw */ ATTR_NG | ATTR_PXN | ATTR_UXN | ATTR_AF | attr_ap(1),
            /* x */ ATTR_NG | ATTR_PXN | ATTR_AF | attr_ap(2),
            /* rx */ ATTR_NG | ATTR_PXN | ATTR_AF | attr_ap(3),
            /* wx */ ATTR_NG | ATTR_PXN | ATTR_AF | attr_ap(1),
            /* rwx */ ATTR_NG | ATTR_PXN | ATTR_AF | attr_ap(1),
        ],
    };

    /// Returns the access bits for `prot` in a privileged or unprivileged space.
    pub const fn bits(&self, prot: VmProt, privileged: bool) -> u64 {
        if privileged {
            self.kernel[prot.table_index()]
        } else {
            self.user[prot.table_index()]
        }
    }
}

impl Default for PermissionTable {
    fn default() -> Self {
        Self::ARM64
    }
}

/// Memory attribute bits for a cache mode.
pub const fn cache_bits(cache: CacheMode) -> u64 {
    match cache {
        CacheMode::WriteBack => attr_index(MAIR_WRITE_BACK) | attr_sh(SH_INNER),
        // Write-through is treated as uncached normal memory for now.
        CacheMode::WriteThrough => attr_index(MAIR_NON_CACHEABLE) | attr_sh(SH_INNER),
        CacheMode::Uncached => attr_index(MAIR_DEVICE),
        CacheMode::PageTable => attr_index(MAIR_NON_CACHEABLE) | attr_sh(SH_INNER),
    }
}

/// A single translation table descriptor.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct PageEntry(u64);

impl PageEntry {
    /// The invalid descriptor.
    pub const INVALID: PageEntry = PageEntry(0);

    /// Creates a next-level table descriptor.
    pub const fn table(next: PhysicalAddress) -> Self {
        PageEntry((next.as_usize() as u64 & ADDRESS_MASK) | TYPE_TABLE)
    }

    /// Creates an L3 page descriptor.
    pub const fn page(frame: PhysicalAddress, cache: CacheMode, access: u64) -> Self {
        PageEntry((frame.as_usize() as u64 & ADDRESS_MASK) | cache_bits(cache) | access | TYPE_PAGE)
    }

    pub const fn from_raw(raw: u64) -> Self {
        PageEntry(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }

    pub const fn is_valid(self) -> bool {
        self.0 & 1 != 0
    }

    /// Returns the output address, or `None` for an invalid descriptor.
    pub const fn address(self) -> Option<PhysicalAddress> {
        if self.is_valid() {
            Some(PhysicalAddress::new((self.0 & ADDRESS_MASK) as usize))
        } else {
            None
        }
    }

    /// Returns true if the access flag is set.
    pub const fn accessed(self) -> bool {
        self.0 & ATTR_AF != 0
    }

    /// Returns the two access permission bits.
    pub const fn ap(self) -> u64 {
        (self.0 >> 6) & 3
    }

    /// Returns true if the descriptor allows writes (AP[2] clear).
    pub const fn writable(self) -> bool {
        self.ap() & 2 == 0
    }

    /// Returns the MAIR slot.
    pub const fn mair_index(self) -> u64 {
        (self.0 >> 2) & 7
    }
}

impl fmt::Debug for PageEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PageEntry({:#018x})", self.0)
    }
}
