//! # Kernel Boot Information
//!
//! The handoff records passed from the loader to the kernel. Keep these
//! `#[repr(C)]` and prefer fixed-size integers at the ABI boundary.

/// Firmware memory map handoff.
///
/// The loader copies the raw UEFI memory map out of boot-services memory
/// and records where it lives. The buffer is an array of
/// `EFI_MEMORY_DESCRIPTOR` records laid out at a firmware-chosen stride:
/// `mmap_desc_size` may exceed the logical record size, so consumers must
/// advance by the stride, never by `size_of`.
#[repr(C)]
#[derive(Clone)]
pub struct MemoryMapInfo {
    /// Pointer to the raw memory map buffer, or 0 if not provided.
    pub mmap_ptr: u64,

    /// Length of the memory map buffer in **bytes**.
    pub mmap_len: u64,

    /// Size of a single memory descriptor in bytes (stride).
    pub mmap_desc_size: u64,

    /// Descriptor version (from UEFI). The kernel can check it matches
    /// expectations.
    pub mmap_desc_version: u32,
}
