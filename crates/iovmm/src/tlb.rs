//! Translation cache maintenance.
//!
//! The SMMU caches directory and table entries in its page-table cache (PTC) and
//! completed translations in its TLB. Every entry mutation must be followed by a CPU
//! data-cache flush of the entry, a PTC flush of its physical address and a TLB
//! invalidate covering the affected IOVA range. [`TranslationCache`] is the only place
//! that issues the flush commands.

use crate::{
    Asid, IoVirtualAddress, PhysicalAddress,
    page::Page,
    registers::{self, RegisterBlock},
};

/// Which translation level an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryLevel {
    /// A page-directory entry; invalidates the whole 4 MiB section.
    Directory,
    /// A page-table entry; invalidates the 16 KiB group around the page.
    Table,
}

/// Issues PTC and TLB maintenance commands through a register block.
#[derive(Clone, Copy)]
pub struct TranslationCache<'r> {
    regs: &'r dyn RegisterBlock,
}

impl<'r> TranslationCache<'r> {
    pub fn new(regs: &'r dyn RegisterBlock) -> Self {
        Self { regs }
    }

    /// Flushes the CPU cache line holding entry `index` of `page`.
    pub fn flush_cache_line(&self, page: &Page, index: usize) {
        page.flush(index, 1);
    }

    /// Drops the PTC copy of the entry at `entry`.
    pub fn ptc_flush_addr(&self, entry: PhysicalAddress) {
        self.command(
            registers::PTC_FLUSH,
            registers::PTC_FLUSH_TYPE_ADR | entry.as_usize() as u32,
        );
    }

    /// Drops every PTC entry.
    pub fn ptc_flush_all(&self) {
        self.command(registers::PTC_FLUSH, registers::PTC_FLUSH_TYPE_ALL);
    }

    /// Invalidates the TLB for the 4 MiB section holding `iova` in `asid`.
    pub fn tlb_invalidate_section(&self, iova: IoVirtualAddress, asid: Asid) {
        let va = (iova.as_usize() as u32 & registers::TLB_FLUSH_VA_SECTION_MASK)
            >> registers::TLB_FLUSH_VA_SHIFT;
        self.command(
            registers::TLB_FLUSH,
            va | registers::TLB_FLUSH_VA_MATCH_SECTION | Self::asid_match(asid),
        );
    }

    /// Invalidates the TLB for the 16 KiB group holding `iova` in `asid`.
    pub fn tlb_invalidate_group(&self, iova: IoVirtualAddress, asid: Asid) {
        let va = (iova.as_usize() as u32 & registers::TLB_FLUSH_VA_GROUP_MASK)
            >> registers::TLB_FLUSH_VA_SHIFT;
        self.command(
            registers::TLB_FLUSH,
            va | registers::TLB_FLUSH_VA_MATCH_GROUP | Self::asid_match(asid),
        );
    }

    /// Invalidates every translation of `asid`.
    pub fn tlb_invalidate_asid(&self, asid: Asid) {
        self.command(
            registers::TLB_FLUSH,
            registers::TLB_FLUSH_VA_MATCH_ALL | Self::asid_match(asid),
        );
    }

    /// Invalidates every translation of every ASID.
    pub fn tlb_invalidate_all(&self) {
        self.command(registers::TLB_FLUSH, registers::TLB_FLUSH_VA_MATCH_ALL);
    }

    /// Makes a just-written entry visible to the hardware.
    ///
    /// `index` is the entry's slot in `page`, `iova` any address it translates.
    pub fn publish_entry(
        &self,
        page: &Page,
        index: usize,
        iova: IoVirtualAddress,
        asid: Asid,
        level: EntryLevel,
    ) {
        self.flush_cache_line(page, index);
        self.ptc_flush_addr(page.entry_address(index));
        match level {
            EntryLevel::Directory => self.tlb_invalidate_section(iova, asid),
            EntryLevel::Table => self.tlb_invalidate_group(iova, asid),
        }
    }

    /// Flushes the whole PTC and TLB.
    pub fn flush_everything(&self) {
        self.ptc_flush_all();
        self.tlb_invalidate_all();
    }

    /// Waits for posted register writes to land by reading a register back.
    pub fn barrier(&self) {
        let _ = self.regs.read(registers::CONFIG);
    }

    fn command(&self, offset: usize, value: u32) {
        if cfg!(feature = "detailed-logging") {
            log::trace!("smmu command {:#x} <- {:#010x}", offset, value);
        }
        self.regs.write(offset, value);
        self.barrier();
    }

    fn asid_match(asid: Asid) -> u32 {
        registers::TLB_FLUSH_ASID_MATCH | ((asid as u32) << registers::TLB_FLUSH_ASID_SHIFT)
    }
}
