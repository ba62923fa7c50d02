//! # Virtual Memory Support
//!
//! x86-64 paging for the kernel: the page-table data model and the
//! 4-level walk that installs mappings into it.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! Each 48-bit virtual address is divided into five fields:
//!
//! ```text
//! | 47-39 | 38-30 | 29-21 | 20-12 | 11-0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! The CPU uses the first four fields as **indices** into four levels of
//! page tables, each level a 4 KiB node of 512 eight-byte entries. A walk
//! ends at a leaf: always at the PT level for 4 KiB pages, or early at the
//! PD level when the entry's PS bit marks a 2 MiB large page. This shape
//! is a hardware contract: the bit ranges must be reproduced exactly.
//!
//! ## What you get
//!
//! - [`PageEntryBits`]: the 64-bit entry word as a typed bitfield
//!   (present/writable/PS/NX/… plus the packed physical base), so the
//!   flag contract is checkable instead of smeared across masking code.
//! - [`PageTable`]: a 4 KiB-aligned node of 512 entries.
//! - [`FrameAlloc`] / [`PhysMapper`]: the two seams towards the physical
//!   world: where table nodes come from, and how a physical frame
//!   becomes a dereferenceable pointer in the current address space.
//! - [`AddressSpace`]: owns the root table; installs 4 KiB and 2 MiB
//!   mappings with lazy intermediate-node creation, translates addresses
//!   back for diagnostics, tiles identity mappings, and activates the
//!   table via CR3.
//!
//! Table nodes are created lazily on first use and **never freed**: this
//! kernel has no unmap path, a stated simplification rather than an
//! oversight. Callers must serialize mutation of one address space
//! externally; the walk itself takes no lock.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod address_space;
mod page_entry;
mod page_table;

pub use address_space::{AddressSpace, MapError};
pub use page_entry::PageEntryBits;
pub use page_table::{PAGE_TABLE_ENTRIES, PageTable, table_indices};

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// Minimal frame allocator used to obtain **physical** 4 KiB frames for
/// page-table nodes.
///
/// The implementation decides where frames come from (boot pool, bitmap).
/// Returned frames **must** be 4 KiB aligned. Returns `None` on
/// out-of-memory.
pub trait FrameAlloc {
    /// Allocate one 4 KiB physical frame. Must return page-aligned frames.
    fn alloc_4k(&mut self) -> Option<PhysicalAddress>;
}

/// Converts physical addresses to *temporarily* usable pointers in the
/// current virtual address space (identity map, HHDM, or a test arena).
///
/// # Safety
/// - Implementations must ensure `pa` is mapped writable in the current
///   page tables for the `&mut T` to be sound.
/// - Lifetime `'a` is purely borrow-checked; the mapping must remain
///   valid for `'a`.
/// - `T` must match the bytes at `pa` (no aliasing UB).
pub trait PhysMapper {
    /// Convert a physical address to a usable mutable pointer in the
    /// current address space.
    ///
    /// # Safety
    /// See the trait-level contract.
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T;
}

impl<P: PhysMapper> PhysMapper for &P {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { P::phys_to_mut(self, pa) }
    }
}

/// Invalidate the cached translation for one virtual address on this CPU.
///
/// Must be issued after every leaf write that touches a live address
/// space: stale TLB entries otherwise keep serving the old mapping or
/// fault. Compiled to `invlpg` on bare-metal x86-64 and to a no-op on
/// hosted targets, where there is no TLB to keep honest.
///
/// # Safety
/// - Must run at CPL0 on bare metal.
#[inline]
pub unsafe fn invalidate_tlb_page(va: VirtualAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = va;
}

/// Load `root` into CR3, making its table hierarchy the active address
/// space and discarding stale non-global translations.
///
/// No-op on hosted targets.
///
/// # Safety
/// - Must run at CPL0 with paging enabled.
/// - `root` must be the physical address of a valid, fully formed PML4
///   whose mappings cover the currently executing code.
#[inline]
pub unsafe fn load_root_table(root: PhysicalAddress) {
    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    unsafe {
        core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
    let _ = root;
}
