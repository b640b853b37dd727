//! Address types for physical and virtual memory management.
//!
//! This module provides wrappers around physical and virtual addresses, with methods
//! to manipulate them for translation table operations, and the [`DirectMap`] used to
//! reach physical memory from the kernel.

use core::fmt;
use core::ops::{Add, Sub};

use crate::arch::{self, Level};
use crate::numbers::{FrameNumber, PageNumber};

/// The kernel's linear window onto physical memory.
///
/// Every physical frame the pmap touches (translation tables, zeroed and copied pages)
/// is reached through this window. On hardware the window sits at a fixed offset in the
/// upper half. Under test the offset is zero and host memory stands in for RAM.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DirectMap {
    offset: usize,
}

impl DirectMap {
    /// Creates a direct map placed at the given virtual offset.
    pub const fn new(offset: usize) -> Self {
        Self { offset }
    }

    /// Creates a direct map where physical and virtual addresses coincide.
    pub const fn identity() -> Self {
        Self { offset: 0 }
    }

    /// Returns the virtual offset of the window.
    pub const fn offset(&self) -> usize {
        self.offset
    }

    /// Translates a physical address to its direct-mapped virtual address.
    #[inline]
    pub fn phys_to_virt(&self, phys: PhysicalAddress) -> VirtualAddress {
        VirtualAddress::new(phys.as_usize().wrapping_add(self.offset))
    }

    /// Translates a direct-mapped virtual address back to a physical address.
    #[inline]
    pub fn virt_to_phys(&self, virt: VirtualAddress) -> PhysicalAddress {
        PhysicalAddress::new(virt.as_usize().wrapping_sub(self.offset))
    }

    /// Translates a physical address to a typed pointer through the window.
    #[inline]
    pub fn phys_to_ptr<T>(&self, phys: PhysicalAddress) -> *mut T {
        self.phys_to_virt(phys).as_mut_ptr()
    }

    /// Translates a pointer inside the window to a physical address.
    #[inline]
    pub fn ptr_to_phys<T>(&self, ptr: *const T) -> PhysicalAddress {
        self.virt_to_phys(VirtualAddress::from_ptr(ptr))
    }
}

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Creates a new address without validation.
            ///
            /// # Safety
            ///
            /// The caller must ensure that the address is valid for the current architecture.
            #[inline]
            pub const unsafe fn new_unchecked(addr: usize) -> Self {
                Self(addr)
            }

            /// Creates an address from a pointer.
            #[inline]
            pub fn from_ptr<T>(ptr: *const T) -> Self {
                Self::new(ptr as usize)
            }

            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }

            /// Returns the offset of this address within its page.
            #[inline]
            pub const fn page_offset(self) -> usize {
                self.0 & arch::PAGE_MASK
            }
        }

        impl fmt::Pointer for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:p}", self.0 as *const u8)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(addr: u64) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address.\n\n\
     Physical addresses are limited to the 48-bit output address size of the\n\
     translation regime."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address exceeds the architecture's maximum physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            arch::validate_physical(addr),
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> arch::PAGE_SHIFT)
    }
}

impl_address_common!(
    VirtualAddress,
    "A virtual memory address.\n\n\
     Addresses with the top 16 bits clear translate through the user tables, addresses\n\
     with them set translate through the kernel tables. Anything else is rejected."
);

impl VirtualAddress {
    /// Creates a new virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address is not canonical for the architecture.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(arch::validate_virtual(addr), "address is not canonical");
        Self(addr)
    }

    /// Converts the address to a pointer.
    #[inline]
    pub const fn as_ptr<T>(self) -> *const T {
        self.0 as *const T
    }

    /// Converts the address to a mutable pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    /// Returns true if the address belongs to the kernel half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        arch::is_kernel_address(self.0)
    }

    /// Returns the translation table index at the specified level.
    #[inline]
    pub const fn page_index(self, level: Level) -> usize {
        arch::page_index(self.0, level)
    }

    /// Returns the page containing this address.
    #[inline]
    pub const fn page_number(self) -> PageNumber {
        PageNumber::new(self.0 >> arch::PAGE_SHIFT)
    }

    /// Returns the address `bytes` further on, or `None` if that leaves the half.
    #[inline]
    pub const fn checked_add(self, bytes: usize) -> Option<Self> {
        match self.0.checked_add(bytes) {
            Some(next) if arch::validate_virtual(next) => Some(Self(next)),
            _ => None,
        }
    }
}
