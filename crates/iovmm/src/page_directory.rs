//! Two-level translation tables for one address space.
//!
//! A [`PageDirectory`] owns its directory page, every page table linked into it and the
//! per-slot count of present PTEs. A page table is created the first time a page in its
//! 4 MiB section is mapped and is only freed once its count drops back to zero.

use alloc::vec::Vec;

use crate::{
    AllocError, Asid, IoVirtualAddress, PhysicalAddress,
    entry::{Attributes, Pde, Pte},
    geometry,
    page::{Page, PageAllocator},
    tlb::{EntryLevel, TranslationCache},
};

/// Everything a table walk needs from its address space and device.
#[derive(Clone, Copy)]
pub struct TableContext<'a> {
    pub allocator: &'a dyn PageAllocator,
    pub cache: TranslationCache<'a>,
    pub asid: Asid,
    /// Attributes given to PDEs of newly linked page tables.
    pub pde_attributes: Attributes,
    pub verbose: bool,
}

/// The page directory of one address space.
pub struct PageDirectory {
    page: Page,
    tables: Vec<Option<Page>>,
    pte_count: Vec<u16>,
}

impl PageDirectory {
    /// Allocates a directory whose every slot is vacant and makes it visible to the SMMU.
    pub fn allocate(ctx: &TableContext<'_>) -> Result<Self, AllocError> {
        let mut page = ctx.allocator.allocate()?;
        for (index, pde) in page.entries_mut().iter_mut().enumerate() {
            *pde = Pde::vacant(index).bits();
        }
        page.flush(0, geometry::PDES_PER_DIRECTORY);
        ctx.cache.ptc_flush_addr(page.physical_address());
        ctx.cache.tlb_invalidate_asid(ctx.asid);

        let mut tables = Vec::with_capacity(geometry::PDES_PER_DIRECTORY);
        tables.resize_with(geometry::PDES_PER_DIRECTORY, || None);

        Ok(Self {
            page,
            tables,
            pte_count: alloc::vec![0; geometry::PDES_PER_DIRECTORY],
        })
    }

    /// Returns the physical address of the directory page.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.page.physical_address()
    }

    /// Returns the PDE in slot `index`.
    pub fn pde(&self, index: usize) -> Pde {
        Pde::from_bits(self.page.entries()[index])
    }

    /// Returns the PTE translating `iova`, or `None` if its section has no page table.
    pub fn pte(&self, iova: IoVirtualAddress) -> Option<Pte> {
        let table = self.tables[iova.directory_index()].as_ref()?;
        Some(Pte::from_bits(table.entries()[iova.table_index()]))
    }

    /// Returns the number of present PTEs in the page table of slot `index`.
    pub fn present_entries(&self, index: usize) -> usize {
        self.pte_count[index] as usize
    }

    /// Returns the number of page tables currently linked in.
    pub fn table_count(&self) -> usize {
        self.tables.iter().filter(|table| table.is_some()).count()
    }

    /// Finds the PTE slot translating `iova`.
    ///
    /// With `allocate` unset a vacant section yields `Ok(None)`. With `allocate` set a
    /// page table is created, filled with vacant PTEs and linked in first.
    pub fn locate_pte(
        &mut self,
        iova: IoVirtualAddress,
        allocate: bool,
        ctx: &TableContext<'_>,
    ) -> Result<Option<PteSlot<'_>>, AllocError> {
        let iova = iova.align_down(geometry::PAGE_SIZE);
        let pdn = iova.directory_index();

        if self.tables[pdn].is_none() {
            if !allocate {
                return Ok(None);
            }
            self.link_table(pdn, ctx)?;
        }

        let table = self.tables[pdn]
            .as_mut()
            .ok_or(AllocError::OutOfMemory)?;
        Ok(Some(PteSlot {
            table,
            count: &mut self.pte_count[pdn],
            iova,
        }))
    }

    fn link_table(&mut self, pdn: usize, ctx: &TableContext<'_>) -> Result<(), AllocError> {
        debug_assert!(self.pde(pdn).is_vacant_at(pdn), "unowned PDE is not vacant");

        let mut table = ctx.allocator.allocate().inspect_err(|_| {
            log::error!("failed to allocate page table for ASID {} pdn {:#x}", ctx.asid, pdn);
        })?;
        if ctx.verbose {
            log::trace!("new page table ASID {} pdn {:#x}", ctx.asid, pdn);
        }

        let section = IoVirtualAddress::from_directory_index(pdn);
        for (index, pte) in table.entries_mut().iter_mut().enumerate() {
            *pte = Pte::vacant(section + index * geometry::PAGE_SIZE).bits();
        }
        table.flush(0, geometry::PTES_PER_TABLE);

        let pde = Pde::new(table.physical_address(), ctx.pde_attributes, true);
        self.page.entries_mut()[pdn] = pde.bits();
        ctx.cache
            .publish_entry(&self.page, pdn, section, ctx.asid, EntryLevel::Directory);

        self.tables[pdn] = Some(table);
        Ok(())
    }

    /// Unlinks and frees the page table of the section holding `iova`.
    ///
    /// No-op when the section has no page table.
    ///
    /// # Panics
    ///
    /// Panics if the table still holds present entries.
    pub fn free_page_table(&mut self, iova: IoVirtualAddress, ctx: &TableContext<'_>) {
        let pdn = iova.directory_index();
        let Some(table) = self.tables[pdn].take() else {
            return;
        };
        assert_eq!(
            self.pte_count[pdn], 0,
            "page table freed with present entries"
        );
        if ctx.verbose {
            log::trace!("free page table ASID {} pdn {:#x}", ctx.asid, pdn);
        }

        let section = IoVirtualAddress::from_directory_index(pdn);
        self.page.entries_mut()[pdn] = Pde::vacant(pdn).bits();
        ctx.cache
            .publish_entry(&self.page, pdn, section, ctx.asid, EntryLevel::Directory);

        // SAFETY: The PDE no longer points at the table and the TLB/PTC were flushed.
        unsafe { ctx.allocator.free(table) };
    }

    /// Frees every page table and the directory page itself.
    ///
    /// # Safety
    ///
    /// No ASID may still point the hardware at this directory.
    pub unsafe fn release(mut self, allocator: &dyn PageAllocator) {
        for table in self.tables.iter_mut().filter_map(Option::take) {
            // SAFETY: The caller guarantees the directory is unreachable, and with it
            // every table it links.
            unsafe { allocator.free(table) };
        }
        // SAFETY: See above.
        unsafe { allocator.free(self.page) };
    }
}

impl core::fmt::Debug for PageDirectory {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageDirectory")
            .field("page", &self.page)
            .field("tables", &self.table_count())
            .finish()
    }
}

/// A located PTE together with the present-entry count of its table.
pub struct PteSlot<'d> {
    table: &'d mut Page,
    count: &'d mut u16,
    iova: IoVirtualAddress,
}

impl PteSlot<'_> {
    /// Returns the current entry.
    pub fn get(&self) -> Pte {
        Pte::from_bits(self.table.entries()[self.iova.table_index()])
    }

    /// Returns whether the slot holds its vacant placeholder.
    pub fn is_vacant(&self) -> bool {
        self.get().is_vacant_at(self.iova)
    }

    /// Returns the present-entry count of the table holding this slot.
    pub fn count(&self) -> usize {
        *self.count as usize
    }

    /// Writes `pte`, keeps the table count in step and publishes the entry.
    pub fn set(&mut self, pte: Pte, ctx: &TableContext<'_>) {
        if self.is_vacant() {
            *self.count += 1;
        }
        self.write(pte, ctx);
        // A frame equal to the page number with every attribute set encodes as vacant.
        if self.is_vacant() {
            *self.count -= 1;
        }
    }

    /// Resets the slot to vacant.
    ///
    /// Returns the table's remaining present entries, or `None` if the slot was already
    /// vacant and nothing was written.
    pub fn clear(&mut self, ctx: &TableContext<'_>) -> Option<usize> {
        if self.is_vacant() {
            return None;
        }
        self.write(Pte::vacant(self.iova), ctx);
        *self.count -= 1;
        Some(self.count())
    }

    fn write(&mut self, pte: Pte, ctx: &TableContext<'_>) {
        let index = self.iova.table_index();
        if cfg!(feature = "detailed-logging") || ctx.verbose {
            log::trace!("ASID {} PTE {} <- {:#010x}", ctx.asid, self.iova, pte.bits());
        }
        self.table.entries_mut()[index] = pte.bits();
        ctx.cache
            .publish_entry(self.table, index, self.iova, ctx.asid, EntryLevel::Table);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        FrameNumber,
        page::EmulatedMemory,
        registers::{EmulatedRegisters, FlushCommand},
    };

    struct Fixture {
        memory: EmulatedMemory,
        regs: EmulatedRegisters,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                memory: EmulatedMemory::new(PhysicalAddress::new(0x8000_0000), 16),
                regs: EmulatedRegisters::new(),
            }
        }

        fn ctx(&self) -> TableContext<'_> {
            TableContext {
                allocator: &self.memory,
                cache: TranslationCache::new(&self.regs),
                asid: 1,
                pde_attributes: Attributes::all(),
                verbose: false,
            }
        }
    }

    #[test]
    fn new_directory_is_vacant_and_flushed() {
        let fx = Fixture::new();
        let dir = PageDirectory::allocate(&fx.ctx()).unwrap();

        for index in 0..geometry::PDES_PER_DIRECTORY {
            assert!(dir.pde(index).is_vacant_at(index));
        }
        assert_eq!(
            fx.regs.take_commands(),
            [
                FlushCommand::Ptc(1 | 0x8000_0000),
                FlushCommand::Tlb(0x8000_0000 | (1 << 29)),
            ]
        );
        unsafe { dir.release(&fx.memory) };
        assert_eq!(fx.memory.allocated_pages(), 0);
    }

    #[test]
    fn probe_without_allocate_leaves_section_vacant() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();

        let iova = IoVirtualAddress::new(0x1000_0000);
        assert!(dir.locate_pte(iova, false, &ctx).unwrap().is_none());
        assert_eq!(dir.table_count(), 0);
        assert_eq!(fx.memory.allocated_pages(), 1);
        unsafe { dir.release(&fx.memory) };
    }

    #[test]
    fn allocate_links_a_vacant_table() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();
        fx.regs.take_commands();

        let iova = IoVirtualAddress::new(0x1000_5000);
        let slot = dir.locate_pte(iova, true, &ctx).unwrap().unwrap();
        assert!(slot.is_vacant());
        assert_eq!(slot.count(), 0);

        let pde = dir.pde(64);
        assert!(pde.is_next());
        assert_eq!(pde.frame(), fx.memory.frame_at(1));
        for page in 0..geometry::PTES_PER_TABLE {
            let iova = IoVirtualAddress::new(0x1000_0000 + page * geometry::PAGE_SIZE);
            assert!(dir.pte(iova).unwrap().is_vacant_at(iova));
        }

        let commands = fx.regs.take_commands();
        assert!(commands[0].is_ptc_flush_of(dir.physical_address().as_usize() as u32 + 64 * 4));
        assert_eq!(commands[1], FlushCommand::Tlb(0x8000_0000 | (1 << 29) | 0x1_0000 | 2));
        unsafe { dir.release(&fx.memory) };
    }

    #[test]
    fn set_and_clear_track_present_entries() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();
        let iova = IoVirtualAddress::new(0x40_0000);

        let mut slot = dir.locate_pte(iova, true, &ctx).unwrap().unwrap();
        slot.set(Pte::new(FrameNumber::new(0x5000), Attributes::all()), &ctx);
        assert_eq!(slot.count(), 1);
        // Remapping a present slot does not count twice.
        slot.set(Pte::new(FrameNumber::new(0x5001), Attributes::all()), &ctx);
        assert_eq!(slot.count(), 1);

        assert_eq!(slot.clear(&ctx), Some(0));
        assert_eq!(slot.clear(&ctx), None);

        dir.free_page_table(iova, &ctx);
        assert!(dir.pde(1).is_vacant_at(1));
        assert_eq!(fx.memory.allocated_pages(), 1);
        unsafe { dir.release(&fx.memory) };
    }

    #[test]
    fn vacant_colliding_frame_is_not_counted() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();
        let iova = IoVirtualAddress::new(0x40_3000);

        let mut slot = dir.locate_pte(iova, true, &ctx).unwrap().unwrap();
        slot.set(Pte::new(FrameNumber::new(iova.page_number()), Attributes::all()), &ctx);
        assert!(slot.is_vacant());
        assert_eq!(slot.count(), 0);
        unsafe { dir.release(&fx.memory) };
    }

    #[test]
    #[should_panic(expected = "page table freed with present entries")]
    fn freeing_a_live_table_is_a_bug() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();
        let iova = IoVirtualAddress::new(0x80_0000);

        let mut slot = dir.locate_pte(iova, true, &ctx).unwrap().unwrap();
        slot.set(Pte::new(FrameNumber::new(0x1234), Attributes::all()), &ctx);
        dir.free_page_table(iova, &ctx);
    }

    #[test]
    fn allocation_failure_leaves_section_vacant() {
        let fx = Fixture::new();
        let ctx = fx.ctx();
        let mut dir = PageDirectory::allocate(&ctx).unwrap();
        fx.memory.set_allocation_budget(Some(0));

        let iova = IoVirtualAddress::new(0x1000_0000);
        assert_eq!(
            dir.locate_pte(iova, true, &ctx).err(),
            Some(AllocError::OutOfMemory)
        );
        assert!(dir.pde(64).is_vacant_at(64));
        unsafe { dir.release(&fx.memory) };
    }
}
