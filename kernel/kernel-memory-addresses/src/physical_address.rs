use crate::PageSize;
use core::fmt;
use core::ops::{Add, AddAssign};

/// Physical memory address.
///
/// A thin wrapper around `u64` that denotes **physical** addresses (host
/// RAM / MMIO). Like [`VirtualAddress`](crate::VirtualAddress), the type
/// carries intent and prevents accidental VA↔PA mix-ups.
///
/// ### Notes
/// - Page-table entries store a **page-aligned** physical base (low
///   `S::SHIFT` bits cleared); use [`align_to_page`](Self::align_to_page)
///   when a raw address needs to become a leaf target.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self::new(0)
    }

    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    /// The containing page base for page size `S` (low `S::SHIFT` bits
    /// cleared).
    #[inline]
    #[must_use]
    pub const fn align_to_page<S: PageSize>(self) -> Self {
        Self(self.0 & !(S::SIZE - 1))
    }

    /// The offset within the containing page of size `S`.
    #[inline]
    #[must_use]
    pub const fn page_offset<S: PageSize>(self) -> u64 {
        self.0 & (S::SIZE - 1)
    }

    /// Whether this address sits on an `S`-sized page boundary.
    #[inline]
    #[must_use]
    pub const fn is_page_aligned<S: PageSize>(self) -> bool {
        self.page_offset::<S>() == 0
    }

    /// The zero-based frame index (`addr / 4096`-style) for page size `S`.
    // Frame indices fit a usize on every paging-capable target.
    #[allow(clippy::cast_possible_truncation)]
    #[inline]
    #[must_use]
    pub const fn page_index<S: PageSize>(self) -> usize {
        (self.0 >> S::SHIFT) as usize
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.as_u64())
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.as_u64())
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Size2M, Size4K};

    #[test]
    fn page_math() {
        let pa = PhysicalAddress::new(0x0030_1234);
        assert_eq!(pa.align_to_page::<Size4K>().as_u64(), 0x0030_1000);
        assert_eq!(pa.page_offset::<Size4K>(), 0x234);
        assert_eq!(pa.page_index::<Size4K>(), 0x301);
        assert!(!pa.is_page_aligned::<Size4K>());
        assert_eq!(pa.align_to_page::<Size2M>().as_u64(), 0x0020_0000);
    }
}
