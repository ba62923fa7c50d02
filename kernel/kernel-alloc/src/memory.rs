//! The kernel's memory context: physical frames, the boot address space
//! and the heap behind one facade.
//!
//! Bring-up order is fixed: frame allocator from the firmware map, then
//! the identity-mapped address space (activated before anything
//! dereferences identity pointers in earnest), then the heap on top.
//! Every later subsystem obtains memory through this type.

use core::fmt;
use core::ptr::NonNull;

use kernel_info::boot::MemoryMapInfo;
use kernel_info::memory::{IDENTITY_MAP_SPAN, LARGE_PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress, align_up};
use kernel_mmap::{MemoryMap, MemoryMapError};
use kernel_sync::SpinLock;
use kernel_vmem::{AddressSpace, MapError, PageEntryBits, PhysMapper};

use crate::frame_alloc::{BitmapFrameAllocator, FrameFreeError, PmmInitError};
use crate::heap::{HeapInitError, HeapUsageError, KernelHeap};

/// Why memory bring-up failed. All variants are bootstrap-fatal; the
/// caller has nothing to recover into and should halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MemoryInitError {
    /// The boot info carries no memory-map pointer.
    #[error("boot info carries no memory map")]
    MissingMemoryMap,

    #[error(transparent)]
    BadMemoryMap(#[from] MemoryMapError),

    #[error(transparent)]
    Pmm(#[from] PmmInitError),

    /// Ran out of frames while building the boot identity mapping.
    #[error(transparent)]
    AddressSpace(#[from] MapError),

    #[error(transparent)]
    Heap(#[from] HeapInitError),
}

/// Frame-count snapshot for diagnostics and the system monitor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameUsage {
    pub total: usize,
    pub free: usize,
    pub used: usize,
}

/// Owner of all memory-management state for one boot.
///
/// Created once at init, torn down never. Frame and heap traffic is
/// internally serialized through spinlocks (lock order: frames before
/// heap); page-table mutation takes `&mut self`, so callers serialize it
/// by ownership.
pub struct MemoryManager<M> {
    mapper: M,
    frames: SpinLock<BitmapFrameAllocator>,
    heap: SpinLock<KernelHeap>,
    address_space: AddressSpace,
}

// Manual impl: the locked fields cannot be formatted without taking
// their locks, which `fmt` must not do.
impl<M> fmt::Debug for MemoryManager<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("address_space", &self.address_space)
            .finish_non_exhaustive()
    }
}

impl<M: PhysMapper> MemoryManager<M> {
    /// Bring the memory subsystem online from the loader's handoff.
    ///
    /// Initializes the frame allocator from the firmware map, builds and
    /// activates an identity mapping over `[0, span)` with 2 MiB pages,
    /// where `span` is at least [`IDENTITY_MAP_SPAN`] and covers all
    /// physical memory present, then formats the heap's first page.
    ///
    /// # Errors
    /// [`MemoryInitError`]; every variant is bootstrap-fatal.
    ///
    /// # Safety
    /// - `boot` must describe a valid, stable firmware memory map.
    /// - `mapper` must make every described physical address accessible
    ///   for the lifetime of the manager.
    /// - Must be called at most once per boot, before any other context
    ///   touches physical memory.
    pub unsafe fn init(mapper: M, boot: &MemoryMapInfo) -> Result<Self, MemoryInitError> {
        if boot.mmap_ptr == 0 {
            return Err(MemoryInitError::MissingMemoryMap);
        }
        let map = unsafe {
            MemoryMap::from_raw(
                boot.mmap_ptr as *const u8,
                usize::try_from(boot.mmap_len).unwrap_or(0),
                usize::try_from(boot.mmap_desc_size).unwrap_or(0),
            )?
        };

        let mut frames = unsafe { BitmapFrameAllocator::new(&mapper, &map)? };

        let mut address_space = AddressSpace::new(&mut frames, &mapper)?;
        let span = align_up(map.highest_physical_address().as_u64(), LARGE_PAGE_SIZE)
            .max(IDENTITY_MAP_SPAN);
        address_space.identity_map(&mut frames, &mapper, span)?;
        // Safety: the identity mapping covers all physical memory, which
        // includes the code and stack currently executing.
        unsafe { address_space.activate() };

        let heap = KernelHeap::new(&mut frames, &mapper)?;

        log::info!(
            "memory: online, {} MiB usable, identity-mapped to {:#x}",
            map.usable_bytes() / (1024 * 1024),
            span
        );
        Ok(Self {
            mapper,
            frames: SpinLock::new(frames),
            heap: SpinLock::new(heap),
            address_space,
        })
    }

    /// Allocate one 4 KiB physical frame; `None` on exhaustion.
    pub fn alloc_frame(&self) -> Option<PhysicalAddress> {
        self.frames.lock().alloc_frame()
    }

    /// Return a frame to the pool.
    ///
    /// # Errors
    /// [`FrameFreeError`] on double free, out-of-range or reserved
    /// low-memory addresses; the incident is also logged, allocator
    /// state stays consistent.
    pub fn free_frame(&self, addr: PhysicalAddress) -> Result<(), FrameFreeError> {
        let result = self.frames.lock().free_frame(addr);
        if let Err(ref error) = result {
            log::warn!("pmm: {error}");
        }
        result
    }

    /// Current frame counters.
    pub fn frame_usage(&self) -> FrameUsage {
        let frames = self.frames.lock();
        FrameUsage {
            total: frames.total_frames(),
            free: frames.free_frames(),
            used: frames.used_frames(),
        }
    }

    /// Install a 4 KiB mapping in the kernel address space.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a page-table node cannot be backed.
    pub fn map_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let mut frames = self.frames.lock();
        self.address_space
            .map_page(&mut *frames, &self.mapper, va, pa, flags)
    }

    /// Install a 2 MiB mapping in the kernel address space.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a page-table node cannot be backed.
    pub fn map_large_page(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError> {
        let mut frames = self.frames.lock();
        self.address_space
            .map_large_page(&mut *frames, &self.mapper, va, pa, flags)
    }

    /// Resolve a virtual address through the kernel page tables.
    pub fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.address_space.translate(&self.mapper, va)
    }

    /// Physical address of the active top-level page table.
    #[must_use]
    pub const fn address_space_root(&self) -> PhysicalAddress {
        self.address_space.root()
    }

    /// Heap allocation, 8-byte aligned; `None` on exhaustion.
    pub fn allocate(&self, size: usize) -> Option<NonNull<u8>> {
        let mut frames = self.frames.lock();
        self.heap.lock().allocate(&mut *frames, &self.mapper, size)
    }

    /// Release a heap allocation. Null is a no-op.
    ///
    /// # Errors
    /// [`HeapUsageError`] on double free; also logged.
    ///
    /// # Safety
    /// - `ptr` must be null or a live payload address from
    ///   [`allocate`](Self::allocate). Aligned allocations go through
    ///   [`free_aligned`](Self::free_aligned).
    pub unsafe fn free(&self, ptr: *mut u8) -> Result<(), HeapUsageError> {
        let result = unsafe { self.heap.lock().free(ptr) };
        if let Err(ref error) = result {
            log::warn!("heap: {error}");
        }
        result
    }

    /// Heap allocation at a caller-chosen power-of-two alignment.
    pub fn allocate_aligned(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let mut frames = self.frames.lock();
        self.heap
            .lock()
            .allocate_aligned(&mut *frames, &self.mapper, size, align)
    }

    /// Release an aligned heap allocation. Null is a no-op.
    ///
    /// # Errors
    /// [`HeapUsageError`] on double free; also logged.
    ///
    /// # Safety
    /// - `ptr` must be null or a live address from
    ///   [`allocate_aligned`](Self::allocate_aligned).
    pub unsafe fn free_aligned(&self, ptr: *mut u8) -> Result<(), HeapUsageError> {
        let result = unsafe { self.heap.lock().free_aligned(ptr) };
        if let Err(ref error) = result {
            log::warn!("heap: {error}");
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{TestPhys, scenario_map_buf};
    use kernel_mmap::MemoryDescriptor;

    fn boot_info(buf: &[u8]) -> MemoryMapInfo {
        MemoryMapInfo {
            mmap_ptr: buf.as_ptr() as u64,
            mmap_len: buf.len() as u64,
            mmap_desc_size: size_of::<MemoryDescriptor>() as u64,
            mmap_desc_version: 1,
        }
    }

    fn manager() -> MemoryManager<&'static TestPhys> {
        // The mapper reference must outlive the manager; leak the arena
        // for the duration of the test process.
        let phys: &'static TestPhys = Box::leak(Box::new(TestPhys::new()));
        let buf = scenario_map_buf();
        unsafe { MemoryManager::init(phys, &boot_info(&buf)).unwrap() }
    }

    #[test]
    fn init_accounts_for_bitmap_tables_and_heap() {
        let mgr = manager();
        let usage = mgr.frame_usage();
        assert_eq!(usage.total, 4096);
        assert_eq!(usage.free + usage.used, usage.total);
        // bitmap (1) + root/PDPT/4 PDs (6) + heap page (1)
        assert_eq!(usage.used, 8);
    }

    #[test]
    fn identity_mapping_covers_low_memory() {
        let mgr = manager();
        for addr in [0_u64, 0xB8000, 0x20_0000, 0x11F_FFFF, 0xFFFF_FFFF] {
            assert_eq!(
                mgr.translate(VirtualAddress::new(addr)),
                Some(PhysicalAddress::new(addr))
            );
        }
        assert_eq!(mgr.translate(VirtualAddress::new(IDENTITY_MAP_SPAN)), None);
    }

    #[test]
    fn map_page_round_trips_through_translate() {
        let mut mgr = manager();
        let frame = mgr.alloc_frame().unwrap();
        let va = VirtualAddress::new(0xFFFF_8000_0000_0000);
        mgr.map_page(va, frame, PageEntryBits::new_kernel_rw()).unwrap();
        assert_eq!(mgr.translate(va), Some(frame));
    }

    #[test]
    fn frame_round_trip_preserves_usage() {
        let mgr = manager();
        let before = mgr.frame_usage();
        let frame = mgr.alloc_frame().unwrap();
        mgr.free_frame(frame).unwrap();
        assert_eq!(mgr.frame_usage(), before);
        assert!(matches!(
            mgr.free_frame(frame),
            Err(FrameFreeError::DoubleFree(_))
        ));
    }

    #[test]
    fn heap_allocations_work_end_to_end() {
        let mgr = manager();
        let p = mgr.allocate(256).unwrap();
        assert!(p.as_ptr().addr().is_multiple_of(8));
        unsafe {
            p.as_ptr().write_bytes(0x5A, 256);
            mgr.free(p.as_ptr()).unwrap();
            assert!(mgr.free(p.as_ptr()).is_err());
        }

        let aligned = mgr.allocate_aligned(64, 4096).unwrap();
        assert!(aligned.as_ptr().addr().is_multiple_of(4096));
        unsafe { mgr.free_aligned(aligned.as_ptr()).unwrap() };
    }

    #[test]
    fn manager_debug_skips_locked_state() {
        let mgr = manager();
        let text = format!("{mgr:?}");
        assert!(text.contains("MemoryManager"));
        assert!(text.contains("address_space"));
    }

    #[test]
    fn missing_map_pointer_is_rejected() {
        let phys = TestPhys::new();
        let info = MemoryMapInfo {
            mmap_ptr: 0,
            mmap_len: 0,
            mmap_desc_size: 48,
            mmap_desc_version: 1,
        };
        let err = unsafe { MemoryManager::init(&phys, &info).unwrap_err() };
        assert_eq!(err, MemoryInitError::MissingMemoryMap);
    }
}
