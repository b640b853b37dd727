use crate::address::VirtualAddress;
use crate::pte::PermissionTable;
use crate::tlb::MAX_CPUS;

/// Bottom of the kernel's translation window (the upper 39 bits of address space).
pub const KERNEL_WINDOW_BASE: usize = 0xFFFF_FF80_0000_0000;

/// Settings for one pmap instance, fixed at bootstrap.
#[derive(Debug, Clone)]
pub struct PmapConfig {
    /// User spaces use a 4-level, 48-bit tree instead of a 3-level, 39-bit one.
    pub four_level_user: bool,
    /// Number of processors. One selects the uniprocessor invalidation path.
    pub cpu_count: usize,
    /// Width of the hardware address-space identifier, 8 or 16 bits.
    pub asid_bits: u32,
    /// Start of the kernel range populated with tables during bootstrap.
    pub kernel_start: VirtualAddress,
    /// End (exclusive) of the kernel range populated during bootstrap.
    pub kernel_end: VirtualAddress,
    /// Highest address [`grow_kernel`](crate::PmapSystem::grow_kernel) may reach.
    pub kernel_limit: VirtualAddress,
    /// Hardware access bits for each protection.
    pub permissions: PermissionTable,
    /// Cap on descriptors allocated after bootstrap.
    pub descriptor_limit: Option<usize>,
    /// Cap on translation tables allocated after bootstrap.
    pub node_limit: Option<usize>,
}

impl PmapConfig {
    /// Checks the settings, panicking on values no machine can run with.
    pub(crate) fn validate(&self) {
        assert!(
            (1..=MAX_CPUS).contains(&self.cpu_count),
            "cpu_count must be between 1 and {}",
            MAX_CPUS
        );
        assert!(
            self.asid_bits == 8 || self.asid_bits == 16,
            "asid_bits must be 8 or 16"
        );
        for (name, va) in [
            ("kernel_start", self.kernel_start),
            ("kernel_end", self.kernel_end),
            ("kernel_limit", self.kernel_limit),
        ] {
            assert!(
                va.as_usize() >= KERNEL_WINDOW_BASE,
                "{} {} is outside the kernel window",
                name,
                va
            );
        }
        assert!(
            self.kernel_start.is_aligned(crate::arch::Level::L2.span())
                && self.kernel_end.is_aligned(crate::arch::Level::L2.span()),
            "kernel window must be 2 MiB aligned"
        );
        assert!(
            self.kernel_start <= self.kernel_end && self.kernel_end <= self.kernel_limit,
            "kernel window out of order"
        );
    }
}

impl Default for PmapConfig {
    fn default() -> Self {
        Self {
            four_level_user: false,
            cpu_count: 1,
            asid_bits: 16,
            kernel_start: VirtualAddress::new(KERNEL_WINDOW_BASE),
            kernel_end: VirtualAddress::new(KERNEL_WINDOW_BASE + (64 << 20)),
            kernel_limit: VirtualAddress::new(0xFFFF_FFFF_C000_0000),
            permissions: PermissionTable::ARM64,
            descriptor_limit: None,
            node_limit: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_is_valid() {
        PmapConfig::default().validate();
    }

    #[test]
    #[should_panic(expected = "asid_bits must be 8 or 16")]
    fn rejects_odd_asid_width() {
        PmapConfig {
            asid_bits: 12,
            ..PmapConfig::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "outside the kernel window")]
    fn rejects_user_kernel_window() {
        PmapConfig {
            kernel_start: VirtualAddress::new(0x1000_0000),
            ..PmapConfig::default()
        }
        .validate();
    }

    #[test]
    #[should_panic(expected = "cpu_count")]
    fn rejects_too_many_cpus() {
        PmapConfig {
            cpu_count: MAX_CPUS + 1,
            ..PmapConfig::default()
        }
        .validate();
    }
}
