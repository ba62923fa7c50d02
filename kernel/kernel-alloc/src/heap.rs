//! Intrusive free-list heap for kernel-internal allocations.
//!
//! Every block carries a [`BlockHeader`] directly in front of its
//! payload: size, free flag and a link to the next block in address
//! order. Allocation is first-fit with splitting; freeing merges
//! physically adjacent free blocks (forward direction only, the list is
//! singly linked). The heap grows by appending one contiguous multi-frame
//! block per growth step and never shrinks.
//!
//! All payload addresses are virtual addresses inside the identity-mapped
//! region, so headers are reached by plain pointer arithmetic.

use core::ptr::{self, NonNull};

use kernel_info::memory::{FRAME_SIZE, HEAP_ALIGN, HEAP_SPLIT_SLACK};
use kernel_vmem::{FrameAlloc, PhysMapper};

use crate::ContiguousFrames;

const HEADER: usize = size_of::<BlockHeader>();

// One frame always fits a `usize`.
#[allow(clippy::cast_possible_truncation)]
const FRAME_BYTES: usize = FRAME_SIZE as usize;

/// Tracking record preceding every heap block's payload.
#[repr(C)]
struct BlockHeader {
    /// Payload bytes owned by this block, header excluded.
    size: usize,
    is_free: bool,
    /// Next block in address order within the list, null at the tail.
    next: *mut BlockHeader,
}

/// Heap bring-up failure; bootstrap-fatal like the allocator's own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapInitError {
    /// No frame was available for the initial heap page.
    #[error("no physical frame available for the initial heap page")]
    OutOfFrames,
}

/// Rejected free calls. Reported rather than silently corrupting the
/// list; prior corruption by the caller is not rolled back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum HeapUsageError {
    /// The block behind this payload address was already free.
    #[error("heap block at {0:#x} freed twice")]
    DoubleFree(usize),
}

/// First-fit free-list heap over frames from the physical allocator.
///
/// Not internally synchronized; wrap in a
/// [`SpinLock`](kernel_sync::SpinLock) before sharing.
#[derive(Debug)]
pub struct KernelHeap {
    head: *mut BlockHeader,
}

// The list pointers target frames exclusively owned by this heap.
unsafe impl Send for KernelHeap {}

impl KernelHeap {
    /// Take one frame and format it as a single free block.
    ///
    /// # Errors
    /// [`HeapInitError::OutOfFrames`] when the allocator is already dry.
    pub fn new<A, M>(alloc: &mut A, mapper: &M) -> Result<Self, HeapInitError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        let frame = alloc.alloc_4k().ok_or(HeapInitError::OutOfFrames)?;
        // Safety: the frame was just allocated, so it is exclusively ours
        // and covered by the mapper per its contract.
        let head: *mut BlockHeader = unsafe { mapper.phys_to_mut::<BlockHeader>(frame) };
        unsafe {
            head.write(BlockHeader {
                size: FRAME_BYTES - HEADER,
                is_free: true,
                next: ptr::null_mut(),
            });
        }
        log::info!(
            "heap: initial page at {frame}, {} bytes usable",
            FRAME_BYTES - HEADER
        );
        Ok(Self { head })
    }

    /// Allocate `size` bytes, 8-byte aligned.
    ///
    /// Rounds the request up to [`HEAP_ALIGN`], searches first-fit, and
    /// on a miss grows by exactly one contiguous block sized to fit the
    /// request before retrying once. Returns `None` for a zero-sized
    /// request or when frame exhaustion prevents growth.
    pub fn allocate<A, M>(&mut self, alloc: &mut A, mapper: &M, size: usize) -> Option<NonNull<u8>>
    where
        A: ContiguousFrames,
        M: PhysMapper,
    {
        if size == 0 {
            return None;
        }
        let size = size.next_multiple_of(HEAP_ALIGN);
        if let Some(payload) = self.take_first_fit(size) {
            return Some(payload);
        }
        self.grow(alloc, mapper, size)?;
        self.take_first_fit(size)
    }

    /// Release the block behind `ptr`. Null is a no-op.
    ///
    /// After marking the block free, every pair of physically adjacent
    /// free blocks is merged front to back, so two neighboring blocks
    /// collapse into one regardless of which was freed first.
    ///
    /// # Errors
    /// [`HeapUsageError::DoubleFree`] if the block was already free; the
    /// list is left unchanged.
    ///
    /// # Safety
    /// - `ptr` must be null or a payload address previously returned by
    ///   [`allocate`](Self::allocate) on this heap. Aligned allocations
    ///   must go through [`free_aligned`](Self::free_aligned) instead;
    ///   their payload address is not a block address.
    // Payload addresses are multiples of HEAP_ALIGN, which equals the
    // header alignment, so the cast lands on an aligned header.
    #[allow(clippy::cast_ptr_alignment)]
    pub unsafe fn free(&mut self, ptr: *mut u8) -> Result<(), HeapUsageError> {
        if ptr.is_null() {
            return Ok(());
        }
        let block = unsafe { ptr.sub(HEADER) }.cast::<BlockHeader>();
        unsafe {
            if (*block).is_free {
                return Err(HeapUsageError::DoubleFree(ptr.addr()));
            }
            (*block).is_free = true;
        }
        self.coalesce();
        Ok(())
    }

    /// Allocate `size` bytes whose address is a multiple of `align`.
    ///
    /// Over-allocates by `align` plus one pointer width, places the
    /// payload at the next aligned address leaving room for a stash
    /// word, and records the underlying block's payload address in that
    /// stash so [`free_aligned`](Self::free_aligned) can recover it.
    ///
    /// `align` must be a power of two; returns `None` otherwise.
    pub fn allocate_aligned<A, M>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        size: usize,
        align: usize,
    ) -> Option<NonNull<u8>>
    where
        A: ContiguousFrames,
        M: PhysMapper,
    {
        if !align.is_power_of_two() {
            return None;
        }
        let raw = self.allocate(alloc, mapper, size + align + size_of::<usize>())?;
        let addr = raw.as_ptr().addr();
        let aligned = (addr + size_of::<usize>()).next_multiple_of(align);
        // Safety: `aligned - size_of::<usize>() >= addr`, so the stash
        // lies inside the over-allocated block.
        unsafe {
            let stash = raw.as_ptr().add(aligned - size_of::<usize>() - addr).cast::<usize>();
            stash.write_unaligned(addr);
            Some(NonNull::new_unchecked(raw.as_ptr().add(aligned - addr)))
        }
    }

    /// Release an allocation made by [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// Reads back the stashed block address and frees the true block.
    /// Null is a no-op.
    ///
    /// # Errors
    /// [`HeapUsageError::DoubleFree`] as for [`free`](Self::free).
    ///
    /// # Safety
    /// - `ptr` must be null or an address previously returned by
    ///   `allocate_aligned` on this heap.
    pub unsafe fn free_aligned(&mut self, ptr: *mut u8) -> Result<(), HeapUsageError> {
        if ptr.is_null() {
            return Ok(());
        }
        let original = unsafe { ptr.sub(size_of::<usize>()).cast::<usize>().read_unaligned() };
        unsafe { self.free(original as *mut u8) }
    }

    /// Sum of free payload bytes across all blocks, for diagnostics.
    #[must_use]
    pub const fn free_bytes(&self) -> usize {
        let mut sum = 0;
        let mut block = self.head;
        while !block.is_null() {
            unsafe {
                if (*block).is_free {
                    sum += (*block).size;
                }
                block = (*block).next;
            }
        }
        sum
    }

    fn take_first_fit(&mut self, size: usize) -> Option<NonNull<u8>> {
        let mut block = self.head;
        while !block.is_null() {
            unsafe {
                if (*block).is_free && (*block).size >= size {
                    Self::split(block, size);
                    (*block).is_free = false;
                    return NonNull::new(block.cast::<u8>().add(HEADER));
                }
                block = (*block).next;
            }
        }
        None
    }

    /// Carve `size` bytes off the front of `block`, threading the
    /// remainder as a new free block, but only when the surplus is worth
    /// a header.
    // `size` is a HEAP_ALIGN multiple, so the tail header stays aligned.
    #[allow(clippy::cast_ptr_alignment)]
    unsafe fn split(block: *mut BlockHeader, size: usize) {
        unsafe {
            if (*block).size > size + HEADER + HEAP_SPLIT_SLACK {
                let tail = block.cast::<u8>().add(HEADER + size).cast::<BlockHeader>();
                tail.write(BlockHeader {
                    size: (*block).size - size - HEADER,
                    is_free: true,
                    next: (*block).next,
                });
                (*block).size = size;
                (*block).next = tail;
            }
        }
    }

    /// Grow by one contiguous block big enough for `size` plus a header,
    /// appended at the tail of the list.
    fn grow<A, M>(&mut self, alloc: &mut A, mapper: &M, size: usize) -> Option<()>
    where
        A: ContiguousFrames,
        M: PhysMapper,
    {
        let pages = (size + HEADER).div_ceil(FRAME_BYTES);
        let base = alloc.alloc_contiguous(pages)?;
        // Safety: freshly allocated frames, exclusively ours.
        let block: *mut BlockHeader = unsafe { mapper.phys_to_mut::<BlockHeader>(base) };
        unsafe {
            block.write(BlockHeader {
                size: pages * FRAME_BYTES - HEADER,
                is_free: true,
                next: ptr::null_mut(),
            });
            let mut last = self.head;
            while !(*last).next.is_null() {
                last = (*last).next;
            }
            (*last).next = block;
        }
        log::debug!("heap: grew by {pages} frames at {base}");
        Some(())
    }

    /// One merge pass over the list: a free block absorbs its successor
    /// while that successor is free and physically adjacent.
    fn coalesce(&mut self) {
        let mut block = self.head;
        while !block.is_null() {
            unsafe {
                let next = (*block).next;
                if (*block).is_free
                    && !next.is_null()
                    && (*next).is_free
                    && block.cast::<u8>().add(HEADER + (*block).size) == next.cast::<u8>()
                {
                    (*block).size += HEADER + (*next).size;
                    (*block).next = (*next).next;
                    // The new successor may be mergeable too.
                    continue;
                }
                block = next;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{BumpFrames, TestPhys};

    const PAGE: usize = FRAME_BYTES;

    fn heap() -> (TestPhys, BumpFrames, KernelHeap) {
        let phys = TestPhys::new();
        let mut frames = BumpFrames::new(64);
        let heap = KernelHeap::new(&mut frames, &phys).unwrap();
        (phys, frames, heap)
    }

    #[test]
    fn fresh_heap_spans_one_page_minus_header() {
        let (_phys, _frames, heap) = heap();
        assert_eq!(heap.free_bytes(), PAGE - HEADER);
    }

    #[test]
    fn allocations_are_eight_byte_aligned_and_writable() {
        let (phys, mut frames, mut heap) = heap();
        for request in [1, 7, 8, 13, 100] {
            let p = heap.allocate(&mut frames, &phys, request).unwrap();
            assert!(p.as_ptr().addr().is_multiple_of(8));
            // The region is really ours.
            unsafe { p.as_ptr().write_bytes(0xAB, request) };
        }
    }

    #[test]
    fn zero_sized_request_is_refused() {
        let (phys, mut frames, mut heap) = heap();
        assert!(heap.allocate(&mut frames, &phys, 0).is_none());
    }

    #[test]
    fn free_then_allocate_reuses_the_block() {
        let (phys, mut frames, mut heap) = heap();
        let first = heap.allocate(&mut frames, &phys, 128).unwrap();
        unsafe { heap.free(first.as_ptr()).unwrap() };
        let second = heap.allocate(&mut frames, &phys, 128).unwrap();
        assert_eq!(first, second);
        // No growth happened across the cycle.
        assert_eq!(frames.allocated(), 1);
    }

    #[test]
    fn splitting_leaves_the_surplus_allocatable() {
        let (phys, mut frames, mut heap) = heap();
        let a = heap.allocate(&mut frames, &phys, 64).unwrap();
        let b = heap.allocate(&mut frames, &phys, 64).unwrap();
        // Both came from the single initial page, back to back.
        assert_eq!(
            b.as_ptr().addr() - a.as_ptr().addr(),
            64 + HEADER
        );
        assert_eq!(frames.allocated(), 1);
    }

    #[test]
    fn adjacent_frees_coalesce_in_either_order() {
        for reverse in [false, true] {
            let (phys, mut frames, mut heap) = heap();
            let a = heap.allocate(&mut frames, &phys, 64).unwrap();
            let b = heap.allocate(&mut frames, &phys, 64).unwrap();
            let (first, second) = if reverse { (b, a) } else { (a, b) };
            unsafe {
                heap.free(first.as_ptr()).unwrap();
                heap.free(second.as_ptr()).unwrap();
            }
            // Everything merged back into one block spanning the page.
            assert_eq!(heap.free_bytes(), PAGE - HEADER);
            let big = heap.allocate(&mut frames, &phys, PAGE - HEADER).unwrap();
            assert_eq!(frames.allocated(), 1);
            unsafe { heap.free(big.as_ptr()).unwrap() };
        }
    }

    #[test]
    fn double_free_is_reported() {
        let (phys, mut frames, mut heap) = heap();
        let p = heap.allocate(&mut frames, &phys, 32).unwrap();
        unsafe {
            heap.free(p.as_ptr()).unwrap();
            let err = heap.free(p.as_ptr()).unwrap_err();
            assert_eq!(err, HeapUsageError::DoubleFree(p.as_ptr() as usize));
        }
    }

    #[test]
    fn freeing_null_is_a_no_op() {
        let (_phys, _frames, mut heap) = heap();
        unsafe { heap.free(ptr::null_mut()).unwrap() };
    }

    #[test]
    fn oversized_request_grows_by_one_contiguous_block() {
        let (phys, mut frames, mut heap) = heap();
        let p = heap.allocate(&mut frames, &phys, 2 * PAGE).unwrap();
        // ceil((2 pages + header) / page) = 3 frames, plus the initial one.
        assert_eq!(frames.allocated(), 4);
        unsafe { p.as_ptr().write_bytes(0xCD, 2 * PAGE) };
        unsafe { heap.free(p.as_ptr()).unwrap() };
        // The grown capacity stays with the heap.
        assert!(heap.free_bytes() >= 3 * PAGE - 2 * HEADER);
    }

    #[test]
    fn growth_failure_reports_exhaustion() {
        let phys = TestPhys::new();
        let mut frames = BumpFrames::new(1);
        let mut heap = KernelHeap::new(&mut frames, &phys).unwrap();
        assert!(heap.allocate(&mut frames, &phys, 2 * PAGE).is_none());
    }

    #[test]
    fn aligned_allocation_round_trip() {
        let (phys, mut frames, mut heap) = heap();
        for align in [16, 64, 256, 1024] {
            let p = heap
                .allocate_aligned(&mut frames, &phys, 100, align)
                .unwrap();
            assert!(p.as_ptr().addr().is_multiple_of(align));
            unsafe {
                p.as_ptr().write_bytes(0xEF, 100);
                heap.free_aligned(p.as_ptr()).unwrap();
            }
        }
        // All blocks returned; the heap is whole again.
        assert_eq!(heap.free_bytes(), PAGE - HEADER);
    }

    #[test]
    fn aligned_double_free_is_reported() {
        let (phys, mut frames, mut heap) = heap();
        let p = heap
            .allocate_aligned(&mut frames, &phys, 40, 128)
            .unwrap();
        unsafe {
            heap.free_aligned(p.as_ptr()).unwrap();
            assert!(heap.free_aligned(p.as_ptr()).is_err());
        }
    }

    #[test]
    fn non_power_of_two_alignment_is_refused() {
        let (phys, mut frames, mut heap) = heap();
        assert!(heap.allocate_aligned(&mut frames, &phys, 8, 24).is_none());
    }
}
