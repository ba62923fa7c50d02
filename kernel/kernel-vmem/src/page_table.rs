use crate::PageEntryBits;
use kernel_memory_addresses::VirtualAddress;

/// Entries per page-table node (hardware contract: 512 × 8 bytes = 4 KiB).
pub const PAGE_TABLE_ENTRIES: usize = 512;

/// One page-table node: a 4 KiB-aligned array of 512 entries.
///
/// The same layout serves all four levels; which fields of an entry are
/// meaningful depends on the level, see [`PageEntryBits`].
///
/// Ownership: each node is exclusively owned by the parent entry that
/// points at it; the root node is owned by
/// [`AddressSpace`](crate::AddressSpace).
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageEntryBits; PAGE_TABLE_ENTRIES],
}

impl PageTable {
    /// Clear every entry to absent.
    #[inline]
    pub const fn zero(&mut self) {
        self.entries = [PageEntryBits::new(); PAGE_TABLE_ENTRIES];
    }

    /// Read the entry at `idx`.
    #[inline]
    #[must_use]
    pub const fn entry(&self, idx: usize) -> PageEntryBits {
        self.entries[idx]
    }

    /// Overwrite the entry at `idx`.
    #[inline]
    pub const fn set_entry(&mut self, idx: usize, entry: PageEntryBits) {
        self.entries[idx] = entry;
    }

    /// Number of present entries, for diagnostics.
    #[must_use]
    pub fn present_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.present()).count()
    }
}

/// Decompose a virtual address into its four 9-bit table indices
/// (PML4, PDPT, PD, PT), taken from bits 39-47, 30-38, 21-29 and 12-20.
#[inline]
#[must_use]
pub const fn table_indices(va: VirtualAddress) -> (usize, usize, usize, usize) {
    let v = va.as_u64();
    (
        ((v >> 39) & 0x1ff) as usize,
        ((v >> 30) & 0x1ff) as usize,
        ((v >> 21) & 0x1ff) as usize,
        ((v >> 12) & 0x1ff) as usize,
    )
}
