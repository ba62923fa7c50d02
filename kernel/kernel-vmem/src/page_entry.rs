use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// A single 64-bit x86-64 page-table entry in its raw bitfield form.
///
/// Models the **common superset** of fields found in all four paging
/// levels (PML4E, PDPTE, PDE, PTE), so one type serves the whole walk.
/// An entry either points to a next-level node or, with
/// [`large_page`](Self::large_page) set at the directory level, directly
/// maps a 2 MiB physical region.
///
/// ### Bit layout
///
/// | Bits  | Name    | Meaning |
/// |-------|---------|----------|
/// | 0     | `P`     | Valid entry if set |
/// | 1     | `RW`    | Writable if set |
/// | 2     | `US`    | User-mode accessible if set |
/// | 3     | `PWT`   | Write-through caching |
/// | 4     | `PCD`   | Disable caching |
/// | 5     | `A`     | Accessed (set by CPU) |
/// | 6     | `D`     | Dirty (leaf only, set by CPU) |
/// | 7     | `PS`    | Large-page flag (PDE/PDPTE only) |
/// | 8     | `G`     | Global (leaf only) |
/// | 9-11  | -       | OS-available |
/// | 12-51 | `addr`  | Physical base bits [51:12] |
/// | 52-62 | -       | OS-available / protection key |
/// | 63    | `NX`    | Execute disable |
///
/// The physical address field omits the low 12 bits, which are implicitly
/// zero by alignment; 2 MiB leaves additionally require bits 20:12 clear.
#[bitfield(u64)]
pub struct PageEntryBits {
    /// Present (P, bit 0). Clear means "absent": the walk stops here and
    /// an access faults.
    pub present: bool,

    /// Writable (RW, bit 1). Clear makes the mapping read-only.
    pub writable: bool,

    /// User/Supervisor (US, bit 2). Clear restricts to supervisor mode.
    pub user_access: bool,

    /// Page Write-Through (PWT, bit 3).
    pub write_through: bool,

    /// Page Cache Disable (PCD, bit 4).
    pub cache_disabled: bool,

    /// Accessed (A, bit 5). Set by the CPU on first access.
    pub accessed: bool,

    /// Dirty (D, bit 6), leaf only. Set by the CPU on first write.
    pub dirty: bool,

    /// Large Page / Page Size (PS, bit 7).
    ///
    /// At the directory level: when **set**, the entry is a **leaf**
    /// mapping a 2 MiB page; when **clear**, it points to a page table.
    /// Must be clear in PML4 entries and 4 KiB PTEs.
    pub large_page: bool,

    /// Global (G, bit 8), leaf only. Survives CR3 reloads when CR4.PGE
    /// is enabled.
    pub global_translation: bool,

    /// OS-available (bits 9..=11). Hardware ignores these.
    #[bits(3)]
    pub os_available_low: u8,

    /// Physical base bits [51:12] (bits 12..=51).
    #[bits(40)]
    phys_addr_bits_51_12: u64,

    /// OS-available (bits 52..=58).
    #[bits(7)]
    pub os_available_high: u8,

    /// Protection key (bits 59..=62) if supported; otherwise OS use.
    #[bits(4)]
    pub protection_key: u8,

    /// No-Execute (NX, bit 63). Requires `EFER.NXE`.
    pub no_execute: bool,
}

impl PageEntryBits {
    /// Store a page-aligned physical base (bits [51:12]).
    #[inline]
    pub const fn set_physical_address(&mut self, phys: PhysicalAddress) {
        self.set_phys_addr_bits_51_12(phys.as_u64() >> 12);
    }

    /// Builder form of [`set_physical_address`](Self::set_physical_address).
    #[inline]
    #[must_use]
    pub const fn with_physical_address(self, phys: PhysicalAddress) -> Self {
        self.with_phys_addr_bits_51_12(phys.as_u64() >> 12)
    }

    /// The physical base this entry points at, with flag bits masked off.
    #[inline]
    #[must_use]
    pub const fn physical_address(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.phys_addr_bits_51_12() << 12)
    }

    /// Flags for a non-leaf node entry: present and writable, supervisor
    /// only, cacheable.
    #[inline]
    #[must_use]
    pub const fn new_node() -> Self {
        Self::new().with_present(true).with_writable(true)
    }

    /// Common kernel read/write data flags.
    #[inline]
    #[must_use]
    pub const fn new_kernel_rw() -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user_access(false)
            .with_no_execute(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packs_physical_address() {
        let mut e = PageEntryBits::new();
        e.set_present(true);
        e.set_writable(true);
        e.set_physical_address(PhysicalAddress::new(0x1234_5000));
        assert!(e.present());
        assert!(e.writable());
        assert_eq!(e.physical_address().as_u64(), 0x1234_5000);
        // Flag bits and address bits do not bleed into each other.
        assert_eq!(e.into_bits() & 0xFFF, 0b11);
    }

    #[test]
    fn large_page_bit_is_bit_seven() {
        let e = PageEntryBits::new().with_large_page(true);
        assert_eq!(e.into_bits(), 1 << 7);
    }

    #[test]
    fn nx_is_top_bit() {
        let e = PageEntryBits::new().with_no_execute(true);
        assert_eq!(e.into_bits(), 1 << 63);
    }

    #[test]
    fn node_flags() {
        let e = PageEntryBits::new_node();
        assert!(e.present());
        assert!(e.writable());
        assert!(!e.large_page());
        assert!(!e.user_access());
    }
}
