//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses used by the paging and
//! allocation code.
//!
//! The two principal types are zero-cost newtypes over `u64`:
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | Physical memory or MMIO; what page-table leaves point at. |
//! | [`VirtualAddress`] | Page-table translated memory; what pointers dereference. |
//!
//! Keeping the two apart at compile time prevents the classic VA↔PA
//! mix-up that an all-`u64` code base invites. The [`PageSize`] marker
//! trait carries the two page sizes this kernel maps: [`Size4K`] base
//! frames and [`Size2M`] directory-level large pages.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

mod page_size;
mod physical_address;
mod virtual_address;

pub use page_size::{PageSize, Size2M, Size4K};
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Align `value` downwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align `value` upwards to `align` (must be a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + align - 1) & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0x1fff, 0x1000), 0x1000);
        assert_eq!(align_up(0x1001, 0x1000), 0x2000);
        assert_eq!(align_up(0x2000, 0x1000), 0x2000);
        assert_eq!(align_down(0, 0x1000), 0);
    }
}
