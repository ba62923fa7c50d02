//! Bitmap allocator for 4 KiB physical page frames.
//!
//! One bit per frame across `[0, highest-observed-physical-address)`,
//! set meaning "unavailable". The bitmap's own storage is carved out of
//! the first usable region with enough room at or above the legacy
//! low-memory bound; those frames are marked used before the allocator
//! hands out anything.

use core::slice;

use kernel_info::memory::{FRAME_SIZE, LOW_MEMORY_BOUND};
use kernel_memory_addresses::PhysicalAddress;
use kernel_mmap::MemoryMap;
use kernel_vmem::{FrameAlloc, PhysMapper};

use crate::ContiguousFrames;

const BITS_PER_WORD: usize = size_of::<u64>() * 8;

/// Errors during physical-memory bring-up. Both are bootstrap-fatal:
/// the caller has nothing to fall back to and must halt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PmmInitError {
    /// The firmware map names no usable region at all.
    #[error("memory map contains no usable memory")]
    NoUsableMemory,

    /// No single usable region can hold the frame bitmap.
    #[error("no usable region large enough for the {required_bytes} byte frame bitmap")]
    NoRoomForBitmap {
        /// Bitmap size that could not be placed.
        required_bytes: usize,
    },
}

/// Rejected [`BitmapFrameAllocator::free_frame`] calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameFreeError {
    /// The frame's bit was already clear. The free count was left
    /// untouched; allocator state before the call is preserved.
    #[error("frame at {0} freed twice")]
    DoubleFree(PhysicalAddress),

    /// The address lies below the legacy 1 MiB bound. Those frames are
    /// never allocated, so the caller cannot own one.
    #[error("frame at {0} is in reserved low memory")]
    ReservedLowMemory(PhysicalAddress),

    /// The address lies outside the bitmap's span.
    #[error("frame at {0} is outside managed physical memory")]
    OutOfRange(PhysicalAddress),
}

/// Bitmap allocator over physical page frames.
///
/// Holds a raw pointer into the (identity-mapped) bitmap storage rather
/// than a borrowed slice: the storage is physical memory the allocator
/// itself owns for the lifetime of the boot, and carrying a lifetime
/// here would infect every consumer. Not internally synchronized; wrap
/// in a [`SpinLock`](kernel_sync::SpinLock) before sharing.
#[derive(Debug)]
pub struct BitmapFrameAllocator {
    /// Word storage of the bitmap, one bit per frame, set = used.
    bitmap: *mut u64,
    /// Number of `u64` words behind `bitmap`.
    words: usize,
    /// Number of frame bits (the physical span in frames).
    span_frames: usize,
    /// Usable frames at or above [`LOW_MEMORY_BOUND`]. Fixed at init.
    total_frames: usize,
    /// Frames currently allocatable.
    free_frames: usize,
    /// First-fit search resumes here instead of rescanning from zero.
    cursor: usize,
}

// The bitmap pointer targets memory exclusively owned by this value.
unsafe impl Send for BitmapFrameAllocator {}

impl BitmapFrameAllocator {
    /// Build the allocator from the firmware memory map.
    ///
    /// Walks the map once to size the bitmap, places the bitmap in the
    /// first usable region with enough room at or above the 1 MiB legacy
    /// bound, marks everything used, then clears the bits of usable
    /// frames at or above that bound. The bitmap's own frames end up
    /// marked used.
    ///
    /// # Errors
    /// [`PmmInitError`]; both variants are bootstrap-fatal.
    ///
    /// # Safety
    /// - `mapper` must make every physical address in the map's span
    ///   accessible, and stay valid for the allocator's lifetime.
    /// - The chosen bitmap region must not be in use by anything else;
    ///   this is the first allocation decision of the boot.
    pub unsafe fn new<M: PhysMapper>(
        mapper: &M,
        map: &MemoryMap<'_>,
    ) -> Result<Self, PmmInitError> {
        let highest = map.highest_physical_address().as_u64();
        let span_frames = usize::try_from(highest.div_ceil(FRAME_SIZE)).unwrap_or(usize::MAX);
        let words = span_frames.div_ceil(BITS_PER_WORD);
        let bitmap_bytes = words * size_of::<u64>();

        if map.usable().next().is_none() {
            return Err(PmmInitError::NoUsableMemory);
        }

        // The bitmap lives in the first usable region that can hold it
        // whole at or above the legacy low-memory bound; placing it
        // lower would overwrite the BIOS/IVT area a region starting at
        // zero still covers.
        let bitmap_pa = map
            .usable()
            .map(|d| (d.phys_start.max(LOW_MEMORY_BOUND), d.end()))
            .find(|&(start, end)| end.saturating_sub(start) >= bitmap_bytes as u64)
            .map(|(start, _)| PhysicalAddress::new(start))
            .ok_or(PmmInitError::NoRoomForBitmap {
                required_bytes: bitmap_bytes,
            })?;
        let bitmap: *mut u64 = unsafe { mapper.phys_to_mut::<u64>(bitmap_pa) };

        let mut this = Self {
            bitmap,
            words,
            span_frames,
            total_frames: 0,
            free_frames: 0,
            cursor: 0,
        };

        // Everything starts out unavailable; only proven-usable frames
        // are cleared below.
        this.as_words_mut().fill(!0);

        // Second walk: release usable frames, skipping the legacy low
        // megabyte no matter what the map claims about it.
        for region in map.usable() {
            let first = region.phys_start.max(LOW_MEMORY_BOUND) / FRAME_SIZE;
            let last = region.end() / FRAME_SIZE;
            for frame in first..last {
                let idx = usize::try_from(frame).unwrap_or(usize::MAX);
                if idx >= this.span_frames {
                    break;
                }
                if this.test_bit(idx) {
                    this.clear_bit(idx);
                    this.total_frames += 1;
                    this.free_frames += 1;
                }
            }
        }

        // Claim the bitmap's own storage.
        let bitmap_frames = (bitmap_bytes as u64).div_ceil(FRAME_SIZE);
        let first_bitmap_frame = bitmap_pa.as_u64() / FRAME_SIZE;
        for frame in first_bitmap_frame..first_bitmap_frame + bitmap_frames {
            let idx = usize::try_from(frame).unwrap_or(usize::MAX);
            if idx < this.span_frames && !this.test_bit(idx) {
                this.set_bit(idx);
                this.free_frames -= 1;
            }
        }

        log::info!(
            "pmm: {} usable frames ({} free), bitmap {} bytes at {}",
            this.total_frames,
            this.free_frames,
            bitmap_bytes,
            bitmap_pa
        );
        Ok(this)
    }

    /// Allocate one frame, first-fit from the resume cursor.
    ///
    /// Returns `None` on exhaustion; the caller decides whether that is
    /// fatal. Performs no dynamic allocation, so it is safe to call
    /// before any heap exists.
    pub fn alloc_frame(&mut self) -> Option<PhysicalAddress> {
        if self.free_frames == 0 {
            return None;
        }

        let mut idx = self.cursor;
        for _ in 0..self.span_frames {
            if idx >= self.span_frames {
                idx = 0;
            }
            // Skip fully-used words wholesale.
            if idx.is_multiple_of(BITS_PER_WORD) && self.word(idx / BITS_PER_WORD) == !0 {
                idx += BITS_PER_WORD;
                continue;
            }
            if !self.test_bit(idx) {
                self.set_bit(idx);
                self.free_frames -= 1;
                self.cursor = idx + 1;
                return Some(PhysicalAddress::new(idx as u64 * FRAME_SIZE));
            }
            idx += 1;
        }
        None
    }

    /// Allocate `count` physically contiguous frames.
    ///
    /// Scans from frame zero rather than the cursor so runs are found
    /// even when single-frame traffic has fragmented the cursor's
    /// neighborhood. Used by the heap, which appends each growth step as
    /// one contiguous block.
    pub fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        if count == 0 || self.free_frames < count {
            return None;
        }

        let mut run_start = 0;
        let mut run_len = 0;
        for idx in 0..self.span_frames {
            if self.test_bit(idx) {
                run_len = 0;
                continue;
            }
            if run_len == 0 {
                run_start = idx;
            }
            run_len += 1;
            if run_len == count {
                for frame in run_start..=idx {
                    self.set_bit(frame);
                }
                self.free_frames -= count;
                return Some(PhysicalAddress::new(run_start as u64 * FRAME_SIZE));
            }
        }
        None
    }

    /// Mark a physical range unavailable, such as the kernel image or
    /// firmware tables the map reports as usable anyway.
    ///
    /// Frames already used stay used; the range may extend beyond the
    /// bitmap span, the excess is ignored.
    pub fn reserve_region(&mut self, start: PhysicalAddress, len: u64) {
        let first = usize::try_from(start.as_u64() / FRAME_SIZE).unwrap_or(usize::MAX);
        let last = usize::try_from((start.as_u64() + len).div_ceil(FRAME_SIZE)).unwrap_or(usize::MAX);
        for idx in first..last.min(self.span_frames) {
            if !self.test_bit(idx) {
                self.set_bit(idx);
                self.free_frames -= 1;
            }
        }
    }

    /// Return one frame to the pool.
    ///
    /// # Errors
    /// [`FrameFreeError::DoubleFree`] if the frame was not allocated;
    /// [`FrameFreeError::OutOfRange`] for addresses beyond the span;
    /// [`FrameFreeError::ReservedLowMemory`] below the 1 MiB bound,
    /// where the set bit means "reserved", not "allocated". None of
    /// them corrupts the free count.
    pub fn free_frame(&mut self, addr: PhysicalAddress) -> Result<(), FrameFreeError> {
        if addr.as_u64() < LOW_MEMORY_BOUND {
            return Err(FrameFreeError::ReservedLowMemory(addr));
        }
        let idx = usize::try_from(addr.as_u64() / FRAME_SIZE).unwrap_or(usize::MAX);
        if idx >= self.span_frames {
            return Err(FrameFreeError::OutOfRange(addr));
        }
        if !self.test_bit(idx) {
            return Err(FrameFreeError::DoubleFree(addr));
        }
        self.clear_bit(idx);
        self.free_frames += 1;
        Ok(())
    }

    /// Usable frames managed by this allocator (fixed at init).
    #[inline]
    #[must_use]
    pub const fn total_frames(&self) -> usize {
        self.total_frames
    }

    /// Frames currently allocatable.
    #[inline]
    #[must_use]
    pub const fn free_frames(&self) -> usize {
        self.free_frames
    }

    /// Frames currently handed out or reserved (bitmap storage included).
    #[inline]
    #[must_use]
    pub const fn used_frames(&self) -> usize {
        self.total_frames - self.free_frames
    }

    const fn as_words_mut(&mut self) -> &mut [u64] {
        // Safety: `bitmap` points at `words` exclusively owned words for
        // the lifetime of the allocator.
        unsafe { slice::from_raw_parts_mut(self.bitmap, self.words) }
    }

    #[inline]
    const fn word(&self, word_idx: usize) -> u64 {
        debug_assert!(word_idx < self.words);
        unsafe { self.bitmap.add(word_idx).read() }
    }

    #[inline]
    const fn test_bit(&self, idx: usize) -> bool {
        self.word(idx / BITS_PER_WORD) & (1 << (idx % BITS_PER_WORD)) != 0
    }

    #[inline]
    const fn set_bit(&mut self, idx: usize) {
        let word = idx / BITS_PER_WORD;
        debug_assert!(word < self.words);
        unsafe {
            let p = self.bitmap.add(word);
            p.write(p.read() | 1 << (idx % BITS_PER_WORD));
        }
    }

    #[inline]
    const fn clear_bit(&mut self, idx: usize) {
        let word = idx / BITS_PER_WORD;
        debug_assert!(word < self.words);
        unsafe {
            let p = self.bitmap.add(word);
            p.write(p.read() & !(1 << (idx % BITS_PER_WORD)));
        }
    }
}

impl FrameAlloc for BitmapFrameAllocator {
    fn alloc_4k(&mut self) -> Option<PhysicalAddress> {
        self.alloc_frame()
    }
}

impl ContiguousFrames for BitmapFrameAllocator {
    fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalAddress> {
        Self::alloc_contiguous(self, count)
    }
}
