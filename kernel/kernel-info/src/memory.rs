//! # Memory Layout
//!
//! Compile-time constants the memory subsystem is built around. These are
//! the single source of truth; the `const` block at the bottom rejects
//! inconsistent edits at build time.

/// Base page / physical frame size in bytes (x86-64 hardware contract).
pub const FRAME_SIZE: u64 = 4096;

/// Size of a 2 MiB large page, the directory-level leaf.
pub const LARGE_PAGE_SIZE: u64 = 2 * 1024 * 1024;

/// Physical memory below this bound is never handed out, regardless of
/// what the firmware map claims: BIOS data area, VGA memory, legacy DMA
/// buffers and other firmware leftovers live here.
pub const LOW_MEMORY_BOUND: u64 = 0x10_0000; // 1 MiB

/// Span of the boot identity mapping `[0, IDENTITY_MAP_SPAN)`, installed
/// with 2 MiB large pages. Early boot code, firmware structures and
/// memory-mapped devices all sit below 4 GiB, and large pages cover the
/// range with three orders of magnitude fewer table entries than 4 KiB
/// pages would.
pub const IDENTITY_MAP_SPAN: u64 = 4 * 1024 * 1024 * 1024; // 4 GiB

/// Minimum alignment of heap payloads in bytes.
pub const HEAP_ALIGN: usize = 8;

/// A free block is only split when the surplus beyond the request exceeds
/// one header plus this slack; tinier remainders are not worth tracking.
pub const HEAP_SPLIT_SLACK: usize = 16;

const _: () = {
    assert!(FRAME_SIZE.is_power_of_two());
    assert!(LARGE_PAGE_SIZE.is_power_of_two());
    assert!(LOW_MEMORY_BOUND.is_multiple_of(FRAME_SIZE));
    assert!(IDENTITY_MAP_SPAN.is_multiple_of(LARGE_PAGE_SIZE));
    assert!(HEAP_ALIGN.is_power_of_two());
};
