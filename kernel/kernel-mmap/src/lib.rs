//! # Firmware Memory Map
//!
//! A read-only view over the memory map the firmware hands the kernel at
//! boot: an array of fixed-stride descriptor records (region type,
//! physical start, page count, attribute bits).
//!
//! Two quirks of the format drive the design here:
//!
//! - **Stride, not `size_of`.** The firmware reports a per-descriptor
//!   size that may exceed the logical record; records must be visited at
//!   that stride. [`MemoryMap`] owns the stride and its iterator advances
//!   by it.
//! - **Trust only usable regions.** Every record contributes to the
//!   highest-address scan (it pins down how much physical address space
//!   exists), but only [`RegionType::CONVENTIONAL`] regions may ever back
//!   an allocation.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

use core::fmt;

use kernel_memory_addresses::{PageSize, PhysicalAddress, Size4K};

/// Firmware region classification.
///
/// Newtype over the firmware's `u32` type code so unknown codes survive
/// round-trips instead of becoming UB through an exhaustive enum.
#[repr(transparent)]
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct RegionType(pub u32);

impl RegionType {
    /// Loader code/data, reclaimable after boot (not reclaimed here).
    pub const LOADER_CODE: Self = Self(1);
    pub const LOADER_DATA: Self = Self(2);
    /// Boot-services code/data, reclaimable after `ExitBootServices`
    /// (not reclaimed here).
    pub const BOOT_SERVICES_CODE: Self = Self(3);
    pub const BOOT_SERVICES_DATA: Self = Self(4);
    /// General-purpose usable RAM. The only type the allocator trusts.
    pub const CONVENTIONAL: Self = Self(7);
    /// Firmware-reserved, ACPI, MMIO and everything else: untouchable.
    pub const RESERVED: Self = Self(0);

    /// Whether frames in this region may back allocations.
    #[inline]
    #[must_use]
    pub const fn is_usable(self) -> bool {
        self.0 == Self::CONVENTIONAL.0
    }
}

impl fmt::Debug for RegionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CONVENTIONAL => f.write_str("Conventional"),
            Self::LOADER_CODE => f.write_str("LoaderCode"),
            Self::LOADER_DATA => f.write_str("LoaderData"),
            Self::BOOT_SERVICES_CODE => f.write_str("BootServicesCode"),
            Self::BOOT_SERVICES_DATA => f.write_str("BootServicesData"),
            Self::RESERVED => f.write_str("Reserved"),
            Self(other) => write!(f, "Type({other})"),
        }
    }
}

/// One logical memory-map record.
///
/// Mirrors the firmware's `EFI_MEMORY_DESCRIPTOR` layout: the stride the
/// firmware reports may be larger than this struct, which is why the
/// iterator copies records out with [`core::ptr::read_unaligned`] instead
/// of borrowing them in place.
#[repr(C)]
#[derive(Copy, Clone, Debug)]
pub struct MemoryDescriptor {
    /// Region classification code.
    pub ty: RegionType,
    /// First physical byte of the region (4 KiB aligned by contract).
    pub phys_start: u64,
    /// Firmware-assigned virtual start; unused by this kernel.
    pub virt_start: u64,
    /// Length of the region in 4 KiB pages.
    pub page_count: u64,
    /// Firmware attribute bits (cacheability etc.); carried, not interpreted.
    pub attribute: u64,
}

impl MemoryDescriptor {
    /// Physical address one past the last byte of the region.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.phys_start + self.page_count * Size4K::SIZE
    }

    /// Length of the region in bytes.
    #[inline]
    #[must_use]
    pub const fn byte_len(&self) -> u64 {
        self.page_count * Size4K::SIZE
    }
}

/// Errors raised while validating the raw firmware buffer.
#[derive(Debug, Clone, Copy, thiserror::Error, Eq, PartialEq)]
pub enum MemoryMapError {
    /// The reported stride is smaller than one logical record.
    #[error("descriptor stride {0} is smaller than a descriptor record")]
    StrideTooSmall(usize),
    /// The buffer holds no complete descriptor.
    #[error("memory map buffer is empty")]
    Empty,
}

/// Borrowed, stride-aware view of the firmware memory map.
pub struct MemoryMap<'a> {
    buf: &'a [u8],
    stride: usize,
}

// Manual impl: the raw buffer bytes are noise, the record count and
// stride are what a diagnostic needs.
impl fmt::Debug for MemoryMap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryMap")
            .field("len", &self.len())
            .field("stride", &self.stride)
            .finish()
    }
}

impl<'a> MemoryMap<'a> {
    /// Wrap an in-memory copy of the firmware map.
    ///
    /// `stride` is the per-descriptor size the firmware reported; it must
    /// be at least `size_of::<MemoryDescriptor>()`. Trailing bytes shorter
    /// than one stride are ignored, matching how the firmware sizes the
    /// buffer.
    ///
    /// # Errors
    /// [`MemoryMapError::StrideTooSmall`] when the stride cannot hold one
    /// logical record; [`MemoryMapError::Empty`] when the buffer holds no
    /// complete record.
    pub const fn new(buf: &'a [u8], stride: usize) -> Result<Self, MemoryMapError> {
        if stride < size_of::<MemoryDescriptor>() {
            return Err(MemoryMapError::StrideTooSmall(stride));
        }
        if buf.len() < stride {
            return Err(MemoryMapError::Empty);
        }
        Ok(Self { buf, stride })
    }

    /// Wrap the raw buffer the loader recorded in the boot info.
    ///
    /// # Errors
    /// As for [`new`](Self::new).
    ///
    /// # Safety
    /// - `ptr` must point to `len` readable bytes that stay valid and
    ///   unmodified for `'a`.
    pub const unsafe fn from_raw(
        ptr: *const u8,
        len: usize,
        stride: usize,
    ) -> Result<Self, MemoryMapError> {
        let buf = unsafe { core::slice::from_raw_parts(ptr, len) };
        Self::new(buf, stride)
    }

    /// Number of complete descriptor records in the buffer.
    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.buf.len() / self.stride
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate every record, advancing by the firmware stride.
    #[must_use]
    pub const fn descriptors(&self) -> Descriptors<'a> {
        Descriptors {
            buf: self.buf,
            stride: self.stride,
            offset: 0,
        }
    }

    /// Iterate only the general-purpose usable regions.
    pub fn usable(&self) -> impl Iterator<Item = MemoryDescriptor> + 'a {
        self.descriptors().filter(|d| d.ty.is_usable())
    }

    /// Highest physical address referenced by **any** record.
    ///
    /// This fixes the span the frame bitmap must cover: reserved regions
    /// count too, because their frames still need a (permanently set) bit.
    #[must_use]
    pub fn highest_physical_address(&self) -> PhysicalAddress {
        let top = self
            .descriptors()
            .map(|d| d.end())
            .max()
            .unwrap_or_default();
        PhysicalAddress::new(top)
    }

    /// Total bytes of usable memory, for the boot log.
    #[must_use]
    pub fn usable_bytes(&self) -> u64 {
        self.usable().map(|d| d.byte_len()).sum()
    }
}

/// Stride-aware descriptor iterator, see [`MemoryMap::descriptors`].
pub struct Descriptors<'a> {
    buf: &'a [u8],
    stride: usize,
    offset: usize,
}

impl Iterator for Descriptors<'_> {
    type Item = MemoryDescriptor;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset + self.stride > self.buf.len() {
            return None;
        }
        // Safety: the bounds check above guarantees a full record (the
        // stride is validated to be at least one record long), and
        // read_unaligned tolerates firmware buffers without alignment
        // guarantees.
        let desc = unsafe {
            self.buf
                .as_ptr()
                .add(self.offset)
                .cast::<MemoryDescriptor>()
                .read_unaligned()
        };
        self.offset += self.stride;
        Some(desc)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = (self.buf.len() - self.offset) / self.stride;
        (remaining, Some(remaining))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Build a raw map buffer at the given stride from logical records.
    fn raw_map(entries: &[MemoryDescriptor], stride: usize) -> Vec<u8> {
        assert!(stride >= size_of::<MemoryDescriptor>());
        let mut buf = vec![0_u8; entries.len() * stride];
        for (i, e) in entries.iter().enumerate() {
            let bytes = unsafe {
                core::slice::from_raw_parts(
                    core::ptr::from_ref(e).cast::<u8>(),
                    size_of::<MemoryDescriptor>(),
                )
            };
            buf[i * stride..i * stride + bytes.len()].copy_from_slice(bytes);
        }
        buf
    }

    fn desc(ty: RegionType, start: u64, pages: u64) -> MemoryDescriptor {
        MemoryDescriptor {
            ty,
            phys_start: start,
            virt_start: 0,
            page_count: pages,
            attribute: 0,
        }
    }

    #[test]
    fn rejects_short_stride() {
        let buf = [0_u8; 256];
        assert_eq!(
            MemoryMap::new(&buf, 8).unwrap_err(),
            MemoryMapError::StrideTooSmall(8)
        );
    }

    #[test]
    fn rejects_empty_buffer() {
        let buf = [0_u8; 16];
        assert_eq!(
            MemoryMap::new(&buf, size_of::<MemoryDescriptor>()).unwrap_err(),
            MemoryMapError::Empty
        );
    }

    #[test]
    fn iterates_at_reported_stride() {
        let entries = [
            desc(RegionType::CONVENTIONAL, 0x10_0000, 16),
            desc(RegionType::RESERVED, 0x20_0000, 4),
            desc(RegionType::CONVENTIONAL, 0x30_0000, 8),
        ];
        // A stride wider than the record, as real firmware produces.
        let stride = size_of::<MemoryDescriptor>() + 8;
        let buf = raw_map(&entries, stride);
        let map = MemoryMap::new(&buf, stride).unwrap();

        assert_eq!(map.len(), 3);
        let collected: Vec<_> = map.descriptors().collect();
        assert_eq!(collected.len(), 3);
        assert_eq!(collected[0].phys_start, 0x10_0000);
        assert_eq!(collected[1].ty, RegionType::RESERVED);
        assert_eq!(collected[2].page_count, 8);
    }

    #[test]
    fn usable_filter_and_totals() {
        let entries = [
            desc(RegionType::CONVENTIONAL, 0x10_0000, 16),
            desc(RegionType::RESERVED, 0xf000_0000, 4),
            desc(RegionType::CONVENTIONAL, 0x30_0000, 8),
        ];
        let stride = size_of::<MemoryDescriptor>();
        let buf = raw_map(&entries, stride);
        let map = MemoryMap::new(&buf, stride).unwrap();

        assert_eq!(map.usable().count(), 2);
        assert_eq!(map.usable_bytes(), (16 + 8) * 4096);
        // The reserved entry is the highest; it still pins the span.
        assert_eq!(
            map.highest_physical_address().as_u64(),
            0xf000_0000 + 4 * 4096
        );
    }

    #[test]
    fn map_debug_reports_shape_not_bytes() {
        let entries = [desc(RegionType::CONVENTIONAL, 0x10_0000, 16)];
        let stride = size_of::<MemoryDescriptor>();
        let buf = raw_map(&entries, stride);
        let map = MemoryMap::new(&buf, stride).unwrap();

        let text = format!("{map:?}");
        assert!(text.contains("MemoryMap"));
        assert!(text.contains("len: 1"));
        // The raw buffer does not leak into the output.
        assert!(!text.contains('['));
    }

    #[test]
    fn region_type_classification() {
        assert!(RegionType::CONVENTIONAL.is_usable());
        assert!(!RegionType::RESERVED.is_usable());
        assert!(!RegionType::BOOT_SERVICES_DATA.is_usable());
        assert!(!RegionType(42).is_usable());
    }
}
