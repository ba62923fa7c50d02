use crate::page_table::{PageTable, table_indices};
use crate::{FrameAlloc, PageEntryBits, PhysMapper, invalidate_tlb_page, load_root_table};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

const PAGE_4K: u64 = 4096;
const PAGE_2M: u64 = 2 * 1024 * 1024;

/// Errors raised while installing mappings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum MapError {
    /// The frame allocator ran dry while creating a table node at the
    /// given level (4 = PML4 .. 1 = PT).
    #[error("out of physical frames while creating a level-{level} page table")]
    OutOfFrames {
        /// Paging level of the node that could not be allocated.
        level: u8,
    },
}

/// One 4-level x86-64 address space, owned through its root (PML4) frame.
///
/// All mutation goes through a [`FrameAlloc`] (for fresh table nodes) and
/// a [`PhysMapper`] (to reach those nodes in the current address space);
/// neither is stored, so one allocator can serve many address spaces.
///
/// Not internally synchronized. Concurrent mutation of the same address
/// space must be serialized by the caller.
#[derive(Debug)]
pub struct AddressSpace {
    root: PhysicalAddress,
}

impl AddressSpace {
    /// Create an empty address space with a zeroed root table.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if no frame is available for the root.
    pub fn new<A, M>(alloc: &mut A, mapper: &M) -> Result<Self, MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        let root = Self::fresh_node(alloc, mapper, 4)?;
        Ok(Self { root })
    }

    /// Physical address of the root (PML4) table.
    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    /// Map one 4 KiB page at `va` to the frame at `pa`.
    ///
    /// Intermediate table nodes are created on demand. Re-mapping an
    /// already mapped page overwrites the leaf in place, so flag changes
    /// (e.g. dropping `writable`) take effect without an unmap step. If
    /// the PD slot holds a 2 MiB leaf it is replaced by a fresh, empty
    /// PT; the other 511 small pages of that large page become unmapped.
    ///
    /// The TLB entry for `va` is invalidated after the write.
    ///
    /// Both addresses must be 4 KiB aligned; low offset bits of either
    /// would otherwise leak into flag bits. `flags` supplies the
    /// permission bits; `present` and the physical base are set here.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a table node cannot be allocated.
    pub fn map_page<A, M>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        debug_assert!(va.as_u64().is_multiple_of(PAGE_4K));
        debug_assert!(pa.as_u64().is_multiple_of(PAGE_4K));

        let (l4, l3, l2, l1) = table_indices(va);

        let pdpt = self.descend(alloc, mapper, self.root, l4, 3)?;
        let pd = self.descend(alloc, mapper, pdpt, l3, 2)?;
        let pt = self.descend(alloc, mapper, pd, l2, 1)?;

        let leaf = flags
            .with_present(true)
            .with_large_page(false)
            .with_physical_address(pa);
        let table = unsafe { mapper.phys_to_mut::<PageTable>(pt) };
        table.set_entry(l1, leaf);

        unsafe { invalidate_tlb_page(va) };
        Ok(())
    }

    /// Map one 2 MiB page at `va` to the 2 MiB-aligned frame at `pa`.
    ///
    /// The leaf lives in the PD; the PT level is skipped entirely. An
    /// existing PD entry, large or a pointer to a PT, is overwritten.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a table node cannot be allocated.
    pub fn map_large_page<A, M>(
        &mut self,
        alloc: &mut A,
        mapper: &M,
        va: VirtualAddress,
        pa: PhysicalAddress,
        flags: PageEntryBits,
    ) -> Result<(), MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        debug_assert!(va.as_u64().is_multiple_of(PAGE_2M));
        debug_assert!(pa.as_u64().is_multiple_of(PAGE_2M));

        let (l4, l3, l2, _) = table_indices(va);

        let pdpt = self.descend(alloc, mapper, self.root, l4, 3)?;
        let pd = self.descend(alloc, mapper, pdpt, l3, 2)?;

        let leaf = flags
            .with_present(true)
            .with_large_page(true)
            .with_physical_address(pa);
        let table = unsafe { mapper.phys_to_mut::<PageTable>(pd) };
        table.set_entry(l2, leaf);

        unsafe { invalidate_tlb_page(va) };
        Ok(())
    }

    /// Identity-map `[0, limit)` with 2 MiB pages, kernel read/write.
    ///
    /// `limit` is rounded up to the next 2 MiB boundary, matching what
    /// the hardware maps anyway once the last large page is installed.
    ///
    /// # Errors
    /// [`MapError::OutOfFrames`] if a table node cannot be allocated.
    pub fn identity_map<A, M>(&mut self, alloc: &mut A, mapper: &M, limit: u64) -> Result<(), MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        let mut addr = 0;
        while addr < limit {
            self.map_large_page(
                alloc,
                mapper,
                VirtualAddress::new(addr),
                PhysicalAddress::new(addr),
                PageEntryBits::new_kernel_rw(),
            )?;
            addr += PAGE_2M;
        }
        Ok(())
    }

    /// Resolve `va` through the table hierarchy without modifying it.
    ///
    /// Returns the physical address the hardware would produce, honoring
    /// 2 MiB leaves at the PD level, or `None` when any level is absent.
    #[must_use]
    pub fn translate<M>(&self, mapper: &M, va: VirtualAddress) -> Option<PhysicalAddress>
    where
        M: PhysMapper,
    {
        let (l4, l3, l2, l1) = table_indices(va);
        let v = va.as_u64();

        let pml4 = unsafe { mapper.phys_to_mut::<PageTable>(self.root) };
        let e4 = pml4.entry(l4);
        if !e4.present() {
            return None;
        }

        let pdpt = unsafe { mapper.phys_to_mut::<PageTable>(e4.physical_address()) };
        let e3 = pdpt.entry(l3);
        if !e3.present() {
            return None;
        }

        let pd = unsafe { mapper.phys_to_mut::<PageTable>(e3.physical_address()) };
        let e2 = pd.entry(l2);
        if !e2.present() {
            return None;
        }
        if e2.large_page() {
            return Some(e2.physical_address() + (v & (PAGE_2M - 1)));
        }

        let pt = unsafe { mapper.phys_to_mut::<PageTable>(e2.physical_address()) };
        let e1 = pt.entry(l1);
        if !e1.present() {
            return None;
        }
        Some(e1.physical_address() + (v & (PAGE_4K - 1)))
    }

    /// Load this address space into CR3.
    ///
    /// # Safety
    /// - The hierarchy must map the currently executing code and stack,
    ///   or the CPU faults on the very next fetch.
    /// - Must run at CPL0 on bare metal; no-op on hosted targets.
    pub unsafe fn activate(&self) {
        unsafe { load_root_table(self.root) }
    }

    /// Walk one level down from the node at `table_pa`, creating the
    /// child on demand. A 2 MiB leaf found where a table pointer is
    /// needed is replaced by a fresh node, the small mapping wins.
    fn descend<A, M>(
        &self,
        alloc: &mut A,
        mapper: &M,
        table_pa: PhysicalAddress,
        idx: usize,
        child_level: u8,
    ) -> Result<PhysicalAddress, MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        let table = unsafe { mapper.phys_to_mut::<PageTable>(table_pa) };
        let entry = table.entry(idx);
        if entry.present() && !entry.large_page() {
            return Ok(entry.physical_address());
        }

        let child = Self::fresh_node(alloc, mapper, child_level)?;
        table.set_entry(idx, PageEntryBits::new_node().with_physical_address(child));
        Ok(child)
    }

    /// Allocate and zero one table node.
    fn fresh_node<A, M>(alloc: &mut A, mapper: &M, level: u8) -> Result<PhysicalAddress, MapError>
    where
        A: FrameAlloc,
        M: PhysMapper,
    {
        let frame = alloc.alloc_4k().ok_or(MapError::OutOfFrames { level })?;
        debug_assert!(frame.as_u64().is_multiple_of(PAGE_4K));
        let table = unsafe { mapper.phys_to_mut::<PageTable>(frame) };
        table.zero();
        Ok(frame)
    }
}
