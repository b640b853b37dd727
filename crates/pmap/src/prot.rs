//! Protections, entry flags and cache modes as seen by callers.

use bitflags::bitflags;

bitflags! {
    /// Access rights of a mapping.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct VmProt: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl VmProt {
    pub const NONE: VmProt = VmProt::empty();
    pub const RW: VmProt = VmProt::READ.union(VmProt::WRITE);
    pub const RX: VmProt = VmProt::READ.union(VmProt::EXEC);

    /// Index into a permission table row.
    pub const fn table_index(self) -> usize {
        self.bits() as usize
    }
}

bitflags! {
    /// Flags accepted by `enter`.
    ///
    /// The access bits describe the access that caused the mapping to be entered.
    /// They decide which hardware permissions are granted right away, the rest of
    /// the protection is granted lazily by fault fixup.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct EnterFlags: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
        /// Pin the mapping against reclamation.
        const WIRED = 1 << 3;
        /// Report allocation failure as an error instead of panicking.
        const CAN_FAIL = 1 << 4;
    }
}

impl EnterFlags {
    /// A read or write access.
    pub const RW: EnterFlags = EnterFlags::READ.union(EnterFlags::WRITE);

    /// Returns the access type carried by the flags.
    pub const fn access(self) -> VmProt {
        VmProt::from_bits_truncate(self.bits() & VmProt::all().bits())
    }
}

impl From<VmProt> for EnterFlags {
    fn from(prot: VmProt) -> Self {
        EnterFlags::from_bits_truncate(prot.bits())
    }
}

/// Memory attribute of a mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheMode {
    /// Inner and outer write-back, inner shareable. Ordinary RAM.
    WriteBack,
    /// Write-through request; mapped non-cacheable normal memory.
    WriteThrough,
    /// Uncached: device-nGnRnE.
    Uncached,
    /// Attribute used for translation table pages; non-cacheable normal memory.
    PageTable,
}
