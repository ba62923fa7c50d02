//! # Kernel Memory Allocation
//!
//! The kernel's memory core: the bitmap physical frame allocator, the
//! free-list heap, and [`MemoryManager`] tying them together with the
//! boot address space from `kernel-vmem`.
//!
//! Layering, bottom up:
//!
//! 1. [`BitmapFrameAllocator`] parses the firmware memory map and hands
//!    out single 4 KiB frames (plus contiguous runs for the heap).
//! 2. `kernel-vmem`'s [`AddressSpace`](kernel_vmem::AddressSpace) takes
//!    frames from it to back page-table nodes; at boot it identity-maps
//!    low physical memory with 2 MiB pages.
//! 3. [`KernelHeap`] takes frames through the identity mapping and
//!    serves general-purpose `allocate`/`free` to everything above.
//!
//! Exhaustion is an explicit `None` at every layer; only bring-up
//! failures are fatal, and those surface as `Err` for the boot path to
//! halt on.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod frame_alloc;
mod heap;
mod memory;
mod phys_mapper;
#[cfg(test)]
mod testing;

pub use frame_alloc::{BitmapFrameAllocator, FrameFreeError, PmmInitError};
pub use heap::{HeapInitError, HeapUsageError, KernelHeap};
pub use memory::{FrameUsage, MemoryInitError, MemoryManager};
pub use phys_mapper::IdentityPhysMapper;

use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::FrameAlloc;

/// Frame allocation extended with physically contiguous runs.
///
/// The heap needs this: each growth step must append exactly one free
/// block, which is only sound when its backing frames are adjacent in
/// physical memory.
pub trait ContiguousFrames: FrameAlloc {
    /// Allocate `count` adjacent 4 KiB frames, returning the base.
    /// `None` when no run of that length exists.
    fn alloc_contiguous(&mut self, count: usize) -> Option<PhysicalAddress>;
}
