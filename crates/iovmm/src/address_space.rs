//! Per-ASID translation contexts.
//!
//! An [`AddressSpace`] exists for every hardware ASID for the lifetime of the device.
//! Its page directory and bound client group come and go with domains. All table
//! mutation for one ASID happens under its lock, so different ASIDs never contend.

use alloc::vec::Vec;

use crate::{
    AllocError, Asid, FrameNumber, IoVirtualAddress, MapError, PhysicalAddress, ResolveError,
    arch,
    client::ClientGroup,
    entry::{Attributes, Pde, Pte},
    geometry,
    page::PageAllocator,
    page_directory::{PageDirectory, TableContext},
    registers::RegisterBlock,
    tlb::TranslationCache,
};

/// Turns buffer offsets into resident physical frames while a mapping is built.
pub trait PageResolver: Sync {
    /// Pins the page at byte `offset` of the buffer and returns its frame.
    fn resolve(&self, offset: usize) -> Result<FrameNumber, ResolveError>;

    /// Drops the pin taken by a successful [`Self::resolve`] of `offset`.
    fn release(&self, offset: usize) {
        let _ = offset;
    }
}

impl<F> PageResolver for F
where
    F: Fn(usize) -> Result<FrameNumber, ResolveError> + Sync,
{
    fn resolve(&self, offset: usize) -> Result<FrameNumber, ResolveError> {
        self(offset)
    }
}

/// A run of pages mapped back to back, resolved through one resolver.
#[derive(Clone, Copy)]
pub struct Segment<'a> {
    /// Length in bytes. Only whole pages are mapped.
    pub length: usize,
    pub resolver: &'a dyn PageResolver,
}

impl<'a> Segment<'a> {
    pub fn new(length: usize, resolver: &'a dyn PageResolver) -> Self {
        Self { length, resolver }
    }

    fn pages(&self) -> usize {
        self.length >> geometry::PAGE_SHIFT
    }
}

/// Attribute templates of one address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AsAttributes {
    /// Written with the directory frame to the PTB_DATA register.
    pub directory: Attributes,
    pub pde: Attributes,
    pub pte: Attributes,
}

/// Device resources an address space operation works with.
#[derive(Clone, Copy)]
pub struct SmmuContext<'a> {
    pub allocator: &'a dyn PageAllocator,
    pub regs: &'a dyn RegisterBlock,
    pub verbosity: u32,
    pub signature: bool,
}

/// State guarded by the address-space lock.
#[derive(Default)]
pub struct AsState {
    pub directory: Option<PageDirectory>,
    pub group: Option<&'static ClientGroup>,
    pub attributes: AsAttributes,
}

impl AsState {
    fn table_context<'a>(&self, ctx: &SmmuContext<'a>, asid: Asid) -> TableContext<'a> {
        TableContext {
            allocator: ctx.allocator,
            cache: TranslationCache::new(ctx.regs),
            asid,
            pde_attributes: self.attributes.pde,
            verbose: ctx.verbosity >= 2,
        }
    }

    /// Allocates the page directory unless one exists. Returns whether it was created.
    pub fn ensure_directory(&mut self, ctx: &SmmuContext<'_>, asid: Asid) -> Result<bool, AllocError> {
        if self.directory.is_some() {
            return Ok(false);
        }
        let directory = PageDirectory::allocate(&self.table_context(ctx, asid)).inspect_err(|_| {
            log::error!("failed to allocate page directory for ASID {}", asid);
        })?;
        self.directory = Some(directory);
        Ok(true)
    }

    /// Frees the page directory and every table it links.
    ///
    /// # Safety
    ///
    /// The ASID's PTB_DATA register must no longer point at the directory.
    pub unsafe fn release_directory(&mut self, allocator: &dyn PageAllocator) {
        if let Some(directory) = self.directory.take() {
            // SAFETY: Guaranteed by the caller.
            unsafe { directory.release(allocator) };
        }
    }
}

/// The translation context of one hardware ASID.
pub struct AddressSpace {
    asid: Asid,
    state: spin::Mutex<AsState>,
}

impl AddressSpace {
    pub fn new(asid: Asid) -> Self {
        Self {
            asid,
            state: spin::Mutex::new(AsState::default()),
        }
    }

    pub fn asid(&self) -> Asid {
        self.asid
    }

    /// Acquires the address-space lock.
    pub fn lock(&self) -> spin::MutexGuard<'_, AsState> {
        self.state.lock()
    }

    /// Maps `segments` back to back starting at `iova`.
    ///
    /// Either every page is mapped or, on error, every page mapped by this call is
    /// unmapped again and its resolver pin released before returning.
    pub fn map(
        &self,
        ctx: &SmmuContext<'_>,
        iova: IoVirtualAddress,
        segments: &[Segment<'_>],
    ) -> Result<(), MapError> {
        let pages = segments
            .iter()
            .flat_map(|segment| {
                (0..segment.pages()).map(move |page| (segment.resolver, page * geometry::PAGE_SIZE))
            })
            .collect::<Vec<_>>();
        check_range(iova, pages.len());
        if ctx.verbosity > 0 {
            log::debug!("map iova={} pages={} asid={}", iova, pages.len(), self.asid);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let tables = state.table_context(ctx, self.asid);
        let pte_attributes = state.attributes.pte;
        let directory = state.directory.as_mut().ok_or(MapError::NotBound)?;

        for (index, &(resolver, offset)) in pages.iter().enumerate() {
            let page_iova = iova + index * geometry::PAGE_SIZE;
            let frame = match resolver.resolve(offset) {
                Ok(frame) if frame.is_valid() => frame,
                resolved => {
                    log::error!("page {} at {} could not be made resident", index, page_iova);
                    // An out-of-range frame still holds the pin the resolver just took.
                    if resolved.is_ok() {
                        resolver.release(offset);
                    }
                    rollback(directory, &tables, iova, &pages[..index]);
                    return Err(MapError::ResolverFailed(index));
                }
            };

            if let Err(err) = map_page(directory, page_iova, frame, pte_attributes, &tables) {
                resolver.release(offset);
                rollback(directory, &tables, iova, &pages[..index]);
                return Err(err.into());
            }
            put_signature(ctx, page_iova, frame);
        }

        Ok(())
    }

    /// Maps the single page at `iova` to `frame`.
    ///
    /// # Panics
    ///
    /// Panics if `frame` is not addressable by the SMMU.
    pub fn map_single_frame(
        &self,
        ctx: &SmmuContext<'_>,
        iova: IoVirtualAddress,
        frame: FrameNumber,
    ) -> Result<(), MapError> {
        assert!(frame.is_valid(), "frame number exceeds the PFN field");
        check_range(iova, 1);
        if ctx.verbosity > 0 {
            log::debug!("map iova={} frame={} asid={}", iova, frame, self.asid);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let tables = state.table_context(ctx, self.asid);
        let pte_attributes = state.attributes.pte;
        let directory = state.directory.as_mut().ok_or(MapError::NotBound)?;

        map_page(directory, iova, frame, pte_attributes, &tables)?;
        put_signature(ctx, iova, frame);
        Ok(())
    }

    /// Unmaps `length` bytes starting at `iova`.
    ///
    /// Pages that are not mapped are skipped. With `decommit` set, page tables left
    /// without present entries are freed.
    pub fn unmap(&self, ctx: &SmmuContext<'_>, iova: IoVirtualAddress, length: usize, decommit: bool) {
        let pages = length >> geometry::PAGE_SHIFT;
        check_range(iova, pages);
        self.unmap_pages(ctx, iova, (0..pages).map(|_| None), decommit);
    }

    /// Unmaps a range previously mapped from `segments`, releasing each page's pin.
    pub fn unmap_segments(
        &self,
        ctx: &SmmuContext<'_>,
        iova: IoVirtualAddress,
        segments: &[Segment<'_>],
        decommit: bool,
    ) {
        check_range(iova, segments.iter().map(Segment::pages).sum());
        let pages = segments.iter().flat_map(|segment| {
            (0..segment.pages()).map(move |page| Some((segment.resolver, page * geometry::PAGE_SIZE)))
        });
        self.unmap_pages(ctx, iova, pages, decommit);
    }

    fn unmap_pages<'r>(
        &self,
        ctx: &SmmuContext<'_>,
        iova: IoVirtualAddress,
        pages: impl Iterator<Item = Option<(&'r dyn PageResolver, usize)>>,
        decommit: bool,
    ) {
        if ctx.verbosity > 0 {
            log::debug!("unmap iova={} asid={}", iova, self.asid);
        }

        let mut state = self.state.lock();
        let state = &mut *state;
        let tables = state.table_context(ctx, self.asid);
        let Some(directory) = state.directory.as_mut() else {
            return;
        };

        for (index, page) in pages.enumerate() {
            if let Some((resolver, offset)) = page {
                resolver.release(offset);
            }
            if unmap_page(directory, iova + index * geometry::PAGE_SIZE, &tables, decommit) {
                tables.cache.flush_everything();
            }
        }
    }

    /// Returns the attribute templates.
    pub fn attributes(&self) -> AsAttributes {
        self.state.lock().attributes
    }

    /// Returns the client group bound to this address space.
    pub fn bound_group(&self) -> Option<&'static ClientGroup> {
        self.state.lock().group
    }

    /// Returns the physical address of the page directory.
    pub fn directory_address(&self) -> Option<PhysicalAddress> {
        self.state.lock().directory.as_ref().map(PageDirectory::physical_address)
    }

    /// Returns the PDE in slot `index`.
    pub fn pde(&self, index: usize) -> Option<Pde> {
        self.state.lock().directory.as_ref().map(|dir| dir.pde(index))
    }

    /// Returns the PTE translating `iova`, if its section has a page table.
    pub fn pte(&self, iova: IoVirtualAddress) -> Option<Pte> {
        self.state.lock().directory.as_ref()?.pte(iova)
    }

    /// Returns the present-entry count of directory slot `index`.
    pub fn present_entries(&self, index: usize) -> usize {
        self.state
            .lock()
            .directory
            .as_ref()
            .map_or(0, |dir| dir.present_entries(index))
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("asid", &self.asid)
            .finish_non_exhaustive()
    }
}

fn check_range(iova: IoVirtualAddress, pages: usize) {
    assert!(
        iova.is_aligned(geometry::PAGE_SIZE),
        "IOVA must be page-aligned"
    );
    assert!(
        iova.as_usize() + pages * geometry::PAGE_SIZE <= geometry::MAX_IOVA + 1,
        "range exceeds the translatable range"
    );
}

fn map_page(
    directory: &mut PageDirectory,
    iova: IoVirtualAddress,
    frame: FrameNumber,
    attributes: Attributes,
    tables: &TableContext<'_>,
) -> Result<(), AllocError> {
    let mut slot = directory
        .locate_pte(iova, true, tables)?
        .ok_or(AllocError::OutOfMemory)?;
    slot.set(Pte::new(frame, attributes), tables);
    Ok(())
}

/// Resets the PTE at `iova`. Returns whether its page table was freed.
fn unmap_page(
    directory: &mut PageDirectory,
    iova: IoVirtualAddress,
    tables: &TableContext<'_>,
    decommit: bool,
) -> bool {
    let remaining = match directory.locate_pte(iova, false, tables) {
        Ok(Some(mut slot)) => slot.clear(tables),
        _ => None,
    };
    if remaining == Some(0) && decommit {
        directory.free_page_table(iova, tables);
        return true;
    }
    false
}

fn rollback(
    directory: &mut PageDirectory,
    tables: &TableContext<'_>,
    start: IoVirtualAddress,
    mapped: &[(&dyn PageResolver, usize)],
) {
    for (index, &(resolver, offset)) in mapped.iter().enumerate().rev() {
        resolver.release(offset);
        unmap_page(directory, start + index * geometry::PAGE_SIZE, tables, true);
    }
}

/// Stamps the first two words of a freshly mapped page with its IOVA and address.
fn put_signature(ctx: &SmmuContext<'_>, iova: IoVirtualAddress, frame: FrameNumber) {
    if !ctx.signature {
        return;
    }
    let Some(ptr) = ctx.allocator.frame_ptr(frame) else {
        return;
    };
    // SAFETY: `frame_ptr` returned a CPU view of the page, which the client just handed
    // over for DMA and therefore expects the device to overwrite.
    unsafe {
        ptr.as_ptr().write_volatile(iova.as_usize() as u32);
        ptr.as_ptr().add(1).write_volatile(frame.start().as_usize() as u32);
    }
    arch::flush_dcache_range(ptr.as_ptr() as *const u8, 2 * geometry::ENTRY_SIZE);
}

#[cfg(test)]
mod tests {
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{
        page::EmulatedMemory,
        registers::{EmulatedRegisters, FlushCommand},
    };

    struct Fixture {
        memory: EmulatedMemory,
        regs: EmulatedRegisters,
        space: AddressSpace,
    }

    impl Fixture {
        fn new() -> Self {
            let fx = Self {
                memory: EmulatedMemory::new(PhysicalAddress::new(0x8000_0000), 32),
                regs: EmulatedRegisters::new(),
                space: AddressSpace::new(1),
            };
            let ctx = fx.ctx();
            fx.space.lock().ensure_directory(&ctx, 1).unwrap();
            fx.regs.take_commands();
            fx
        }

        fn ctx(&self) -> SmmuContext<'_> {
            SmmuContext {
                allocator: &self.memory,
                regs: &self.regs,
                verbosity: 0,
                signature: false,
            }
        }
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            unsafe { self.space.lock().release_directory(&self.memory) };
        }
    }

    fn constant(frame: usize) -> impl Fn(usize) -> Result<FrameNumber, ResolveError> + Sync {
        move |_| Ok(FrameNumber::new(frame))
    }

    fn sequential(first: usize) -> impl Fn(usize) -> Result<FrameNumber, ResolveError> + Sync {
        move |offset| Ok(FrameNumber::new(first + offset / geometry::PAGE_SIZE))
    }

    /// Resolves the first `good` pages and records releases.
    struct FailingResolver {
        good: usize,
        released: AtomicUsize,
    }

    impl PageResolver for FailingResolver {
        fn resolve(&self, offset: usize) -> Result<FrameNumber, ResolveError> {
            let page = offset / geometry::PAGE_SIZE;
            if page < self.good {
                Ok(FrameNumber::new(0x9000 + page))
            } else {
                Err(ResolveError)
            }
        }

        fn release(&self, _offset: usize) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn assert_all_vacant(space: &AddressSpace, start: usize, pages: usize) {
        for page in 0..pages {
            let iova = IoVirtualAddress::new(start + page * geometry::PAGE_SIZE);
            if let Some(pte) = space.pte(iova) {
                assert!(pte.is_vacant_at(iova), "{} still mapped", iova);
            }
        }
    }

    #[test]
    fn map_writes_pte_with_templates() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x1000_0000);

        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x1000, &resolver)])
            .unwrap();

        assert!(fx.space.pde(64).unwrap().is_next());
        let pte = fx.space.pte(iova).unwrap();
        assert_eq!(pte.frame(), FrameNumber::new(0x5000));
        assert_eq!(pte.attributes(), Attributes::all());
        assert_eq!(fx.space.present_entries(64), 1);
    }

    #[test]
    fn every_pte_write_is_flushed_for_its_asid() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x1000_0000);
        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x1000, &resolver)])
            .unwrap();

        // Table link (PDE) then the PTE itself.
        let commands = fx.regs.take_commands();
        assert_eq!(commands.len(), 4);
        assert!(matches!(commands[2], FlushCommand::Ptc(_)));
        assert_eq!(commands[3], FlushCommand::Tlb(0x8000_0000 | (1 << 29) | 0x1_0000 | 3));
    }

    #[test]
    fn segments_are_mapped_back_to_back() {
        let fx = Fixture::new();
        let first = sequential(0x100);
        let second = sequential(0x200);
        let iova = IoVirtualAddress::new(0x3F_E000);

        fx.space
            .map(
                &fx.ctx(),
                iova,
                &[Segment::new(0x2000, &first), Segment::new(0x1000, &second)],
            )
            .unwrap();

        assert_eq!(fx.space.pte(iova).unwrap().frame(), FrameNumber::new(0x100));
        assert_eq!(fx.space.pte(iova + 0x1000).unwrap().frame(), FrameNumber::new(0x101));
        // Third page crosses into the next section.
        assert_eq!(fx.space.pte(iova + 0x2000).unwrap().frame(), FrameNumber::new(0x200));
        assert_eq!(fx.space.present_entries(0), 2);
        assert_eq!(fx.space.present_entries(1), 1);
    }

    #[test]
    fn map_then_unmap_restores_state() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x2000_0000);
        let pdn = iova.directory_index();
        let before = fx.space.pde(pdn).unwrap();
        let pages_before = fx.memory.allocated_pages();

        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x1000, &resolver)])
            .unwrap();
        fx.space.unmap(&fx.ctx(), iova, 0x1000, true);

        assert_eq!(fx.space.pde(pdn).unwrap(), before);
        assert_eq!(fx.space.pte(iova), None);
        assert_eq!(fx.space.present_entries(pdn), 0);
        assert_eq!(fx.memory.allocated_pages(), pages_before);
    }

    #[test]
    fn unmap_twice_is_a_no_op() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x40_0000);
        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x2000, &resolver)])
            .unwrap();
        fx.space.unmap(&fx.ctx(), iova, 0x1000, false);
        fx.regs.take_commands();

        fx.space.unmap(&fx.ctx(), iova, 0x1000, false);
        assert!(fx.regs.take_commands().is_empty());
        assert_eq!(fx.space.present_entries(1), 1);
    }

    #[test]
    fn unmap_of_never_mapped_range_is_tolerated() {
        let fx = Fixture::new();
        fx.space
            .unmap(&fx.ctx(), IoVirtualAddress::new(0x8000_0000), 0x10_0000, true);
        assert!(fx.regs.take_commands().is_empty());
    }

    #[test]
    fn unmap_without_decommit_keeps_table() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x40_0000);
        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x1000, &resolver)])
            .unwrap();

        fx.space.unmap(&fx.ctx(), iova, 0x1000, false);
        assert!(fx.space.pde(1).unwrap().is_next());
        assert!(fx.space.pte(iova).unwrap().is_vacant_at(iova));
    }

    #[test]
    fn decommit_freeing_a_table_flushes_everything() {
        let fx = Fixture::new();
        let resolver = constant(0x5000);
        let iova = IoVirtualAddress::new(0x40_0000);
        fx.space
            .map(&fx.ctx(), iova, &[Segment::new(0x1000, &resolver)])
            .unwrap();
        fx.regs.take_commands();

        fx.space.unmap(&fx.ctx(), iova, 0x1000, true);
        let commands = fx.regs.take_commands();
        assert_eq!(&commands[commands.len() - 2..], [FlushCommand::Ptc(0), FlushCommand::Tlb(0)]);
    }

    #[test]
    fn resolver_failure_rolls_back_everything() {
        let fx = Fixture::new();
        let resolver = FailingResolver {
            good: 5,
            released: AtomicUsize::new(0),
        };
        let start = 0x3F_D000;
        let pages_before = fx.memory.allocated_pages();

        let err = fx
            .space
            .map(
                &fx.ctx(),
                IoVirtualAddress::new(start),
                &[Segment::new(8 * geometry::PAGE_SIZE, &resolver)],
            )
            .unwrap_err();

        assert_eq!(err, MapError::ResolverFailed(5));
        assert_eq!(resolver.released.load(Ordering::SeqCst), 5);
        assert_all_vacant(&fx.space, start, 8);
        assert_eq!(fx.space.present_entries(0), 0);
        assert_eq!(fx.space.present_entries(1), 0);
        assert_eq!(fx.memory.allocated_pages(), pages_before);
    }

    #[test]
    fn invalid_frame_counts_as_resolver_failure() {
        let fx = Fixture::new();
        let resolver = constant(0x10_0000);
        let err = fx
            .space
            .map(&fx.ctx(), IoVirtualAddress::new(0x1000), &[Segment::new(0x1000, &resolver)])
            .unwrap_err();
        assert_eq!(err, MapError::ResolverFailed(0));
    }

    /// Pins every page it resolves; page `bad` resolves to a frame the SMMU cannot reach.
    struct OutOfRangeResolver {
        bad: usize,
        resolved: AtomicUsize,
        released: AtomicUsize,
    }

    impl PageResolver for OutOfRangeResolver {
        fn resolve(&self, offset: usize) -> Result<FrameNumber, ResolveError> {
            self.resolved.fetch_add(1, Ordering::SeqCst);
            let page = offset / geometry::PAGE_SIZE;
            if page == self.bad {
                Ok(FrameNumber::new(geometry::PFN_MASK as usize + 1))
            } else {
                Ok(FrameNumber::new(0x9000 + page))
            }
        }

        fn release(&self, _offset: usize) {
            self.released.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn out_of_range_frame_releases_its_pin() {
        let fx = Fixture::new();
        let resolver = OutOfRangeResolver {
            bad: 1,
            resolved: AtomicUsize::new(0),
            released: AtomicUsize::new(0),
        };
        let iova = IoVirtualAddress::new(0x20_0000);

        let err = fx
            .space
            .map(&fx.ctx(), iova, &[Segment::new(2 * geometry::PAGE_SIZE, &resolver)])
            .unwrap_err();

        assert_eq!(err, MapError::ResolverFailed(1));
        assert_eq!(resolver.resolved.load(Ordering::SeqCst), 2);
        assert_eq!(resolver.released.load(Ordering::SeqCst), 2);
        assert_all_vacant(&fx.space, 0x20_0000, 2);
    }

    #[test]
    #[should_panic(expected = "range exceeds the translatable range")]
    fn unmap_past_the_top_of_iova_space_is_rejected() {
        let fx = Fixture::new();
        fx.space
            .unmap(&fx.ctx(), IoVirtualAddress::new(0xFFFF_F000), 2 * geometry::PAGE_SIZE, false);
    }

    #[test]
    fn unmap_ending_at_the_top_of_iova_space_is_accepted() {
        let fx = Fixture::new();
        fx.space
            .unmap(&fx.ctx(), IoVirtualAddress::new(0xFFFF_F000), geometry::PAGE_SIZE, true);
        assert!(fx.regs.take_commands().is_empty());
    }

    #[test]
    fn table_allocation_failure_rolls_back() {
        let fx = Fixture::new();
        let resolver = FailingResolver {
            good: usize::MAX,
            released: AtomicUsize::new(0),
        };
        // Room for the first section's table only.
        fx.memory.set_allocation_budget(Some(1));
        let start = 0x3F_E000;

        let err = fx
            .space
            .map(
                &fx.ctx(),
                IoVirtualAddress::new(start),
                &[Segment::new(4 * geometry::PAGE_SIZE, &resolver)],
            )
            .unwrap_err();
        fx.memory.set_allocation_budget(None);

        assert_eq!(err, MapError::OutOfMemory);
        // Two mapped pages plus the page whose table could not be allocated.
        assert_eq!(resolver.released.load(Ordering::SeqCst), 3);
        assert_all_vacant(&fx.space, start, 4);
        assert!(fx.space.pde(0).unwrap().is_vacant_at(0));
    }

    #[test]
    fn table_is_freed_when_last_page_is_unmapped() {
        let fx = Fixture::new();
        let resolver = sequential(0x1_0000);
        let base = 0xC00_0000;
        let pdn = base >> geometry::SECTION_SHIFT;

        fx.space
            .map(
                &fx.ctx(),
                IoVirtualAddress::new(base),
                &[Segment::new(geometry::SECTION_SIZE, &resolver)],
            )
            .unwrap();
        assert_eq!(fx.space.present_entries(pdn), geometry::PTES_PER_TABLE);

        for page in 0..geometry::PTES_PER_TABLE {
            assert!(fx.space.pde(pdn).unwrap().is_next());
            let iova = IoVirtualAddress::new(base + page * geometry::PAGE_SIZE);
            fx.space.unmap(&fx.ctx(), iova, geometry::PAGE_SIZE, true);
        }

        assert!(fx.space.pde(pdn).unwrap().is_vacant_at(pdn));
        assert_eq!(fx.space.present_entries(pdn), 0);
    }

    #[test]
    fn unmap_segments_releases_pins() {
        let fx = Fixture::new();
        let resolver = FailingResolver {
            good: usize::MAX,
            released: AtomicUsize::new(0),
        };
        let iova = IoVirtualAddress::new(0x10_0000);
        let segments = [Segment::new(3 * geometry::PAGE_SIZE, &resolver)];

        fx.space.map(&fx.ctx(), iova, &segments).unwrap();
        fx.space.unmap_segments(&fx.ctx(), iova, &segments, true);

        assert_eq!(resolver.released.load(Ordering::SeqCst), 3);
        assert_all_vacant(&fx.space, 0x10_0000, 3);
    }

    #[test]
    fn single_frame_mapping() {
        let fx = Fixture::new();
        fx.space
            .map_single_frame(&fx.ctx(), IoVirtualAddress::new(0), FrameNumber::new(0x42))
            .unwrap();
        assert_eq!(
            fx.space.pte(IoVirtualAddress::new(0)).unwrap().frame(),
            FrameNumber::new(0x42)
        );
        assert_eq!(fx.space.present_entries(0), 1);
    }

    #[test]
    fn pte_attributes_follow_template() {
        let fx = Fixture::new();
        let mut attributes = AsAttributes::default();
        attributes.pte.set_writable(false);
        fx.space.lock().attributes = attributes;

        let iova = IoVirtualAddress::new(0x5000);
        fx.space
            .map_single_frame(&fx.ctx(), iova, FrameNumber::new(0x42))
            .unwrap();
        let pte = fx.space.pte(iova).unwrap();
        assert!(pte.attributes().is_readable());
        assert!(!pte.attributes().is_writable());
    }

    #[test]
    fn unbound_space_refuses_to_map() {
        let memory = EmulatedMemory::new(PhysicalAddress::new(0x8000_0000), 1);
        let regs = EmulatedRegisters::new();
        let space = AddressSpace::new(2);
        let ctx = SmmuContext {
            allocator: &memory,
            regs: &regs,
            verbosity: 0,
            signature: false,
        };
        let resolver = constant(0x5000);

        assert_eq!(
            space.map(&ctx, IoVirtualAddress::new(0), &[Segment::new(0x1000, &resolver)]),
            Err(MapError::NotBound)
        );
        space.unmap(&ctx, IoVirtualAddress::new(0), 0x1000, true);
    }

    #[test]
    fn signature_stamps_reachable_pages() {
        let fx = Fixture::new();
        let target = fx.memory.frame_at(31);
        let ctx = SmmuContext {
            signature: true,
            ..fx.ctx()
        };
        let iova = IoVirtualAddress::new(0x7000);

        fx.space.map_single_frame(&ctx, iova, target).unwrap();

        assert_eq!(fx.memory.read_word(target.start()), 0x7000);
        assert_eq!(
            fx.memory.read_word(target.start() + 4),
            target.start().as_usize() as u32
        );
        // Frames outside the pool are mapped without a signature.
        fx.space
            .map_single_frame(&ctx, iova + 0x1000, FrameNumber::new(0x42))
            .unwrap();
    }
}
