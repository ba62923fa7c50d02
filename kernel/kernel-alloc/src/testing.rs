//! Shared test fixtures: arena-backed fake physical memory, a bump
//! frame allocator and synthetic firmware memory maps.

use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::{MemoryDescriptor, RegionType};
use kernel_vmem::{FrameAlloc, PhysMapper};

use crate::ContiguousFrames;

/// Covers the 18 MiB physical span of the standard test scenario.
const ARENA_BYTES: usize = 18 * 1024 * 1024;

/// Fake physical memory: one contiguous page-aligned buffer where a
/// physical address is simply an offset from the base.
pub(crate) struct TestPhys {
    _storage: Vec<u8>,
    base: *mut u8,
}

impl TestPhys {
    pub(crate) fn new() -> Self {
        let mut storage = vec![0_u8; ARENA_BYTES + 4096];
        let offset = storage.as_ptr().align_offset(4096);
        let base = unsafe { storage.as_mut_ptr().add(offset) };
        Self {
            _storage: storage,
            base,
        }
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        let offset = usize::try_from(pa.as_u64()).unwrap();
        assert!(
            offset + size_of::<T>() <= ARENA_BYTES,
            "physical address {pa} outside the test arena"
        );
        unsafe { &mut *self.base.add(offset).cast::<T>() }
    }
}

/// Hands out arena frames in ascending order; trivially contiguous.
pub(crate) struct BumpFrames {
    next: u64,
    limit: u64,
}

impl BumpFrames {
    pub(crate) const fn new(frames: u64) -> Self {
        Self {
            next: 0,
            limit: frames * 4096,
        }
    }

    /// Frames handed out so far.
    pub(crate) const fn allocated(&self) -> usize {
        (self.next / 4096) as usize
    }
}

impl FrameAlloc for BumpFrames {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        if self.next >= self.limit {
            return None;
        }
        let pa = PhysicalAddress::new(self.next);
        self.next += 4096;
        Some(pa)
    }
}

impl ContiguousFrames for BumpFrames {
    fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        let bytes = count as u64 * 4096;
        if self.next + bytes > self.limit {
            return None;
        }
        let pa = PhysicalAddress::new(self.next);
        self.next += bytes;
        Some(pa)
    }
}

pub(crate) fn region(ty: RegionType, phys_start: u64, pages: u64) -> MemoryDescriptor {
    MemoryDescriptor {
        ty,
        phys_start,
        virt_start: 0,
        page_count: pages,
        attribute: 0,
    }
}

/// Serialize descriptors into a raw map buffer at natural stride.
pub(crate) fn map_buf(regions: &[MemoryDescriptor]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(regions.len() * size_of::<MemoryDescriptor>());
    for r in regions {
        let bytes = unsafe {
            core::slice::from_raw_parts(
                core::ptr::from_ref(r).cast::<u8>(),
                size_of::<MemoryDescriptor>(),
            )
        };
        buf.extend_from_slice(bytes);
    }
    buf
}

/// The standard scenario: one usable 16 MiB region at 2 MiB, everything
/// below reserved. 4096 usable frames; the bitmap spans 18 MiB.
pub(crate) fn scenario_map_buf() -> Vec<u8> {
    map_buf(&[
        region(RegionType::RESERVED, 0, 512),
        region(RegionType::CONVENTIONAL, 0x20_0000, 4096),
    ])
}
