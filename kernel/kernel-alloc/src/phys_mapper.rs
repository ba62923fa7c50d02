use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// Mapper for the boot identity mapping: a physical address *is* its
/// virtual address, so conversion is a cast.
///
/// Valid only while the identity-mapped address space built at init is
/// active, and only for addresses inside its span.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPhysMapper;

impl PhysMapper for IdentityPhysMapper {
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        // Safety: per the trait contract the caller guarantees `pa` is
        // identity-mapped, writable and correctly typed.
        unsafe { &mut *(pa.as_u64() as *mut T) }
    }
}
