//! Page-directory and page-table entry encoding.
//!
//! Both levels use the same 32-bit layout:
//! - Bits 0-19: Physical frame number (or, for vacant entries, an index-derived pattern)
//! - Bit 28: Next-level marker (PDEs only)
//! - Bit 29: Non-secure
//! - Bit 30: Writable
//! - Bit 31: Readable
//!
//! Vacant entries are never zero. A vacant PDE carries its own directory index shifted
//! into the frame field, a vacant PTE carries the IOVA page number it would translate.
//! Slots are therefore recognised as vacant by comparing against the value computed for
//! that slot, not by testing a valid bit.

use crate::{FrameNumber, IoVirtualAddress, PhysicalAddress, geometry};

/// Access attributes applied to directory pointers, PDEs and PTEs.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Attributes(u32);

impl Attributes {
    /// Non-secure bit (bit 29).
    const NONSECURE: u32 = 1 << 29;

    /// Writable bit (bit 30).
    const WRITABLE: u32 = 1 << 30;

    /// Readable bit (bit 31).
    const READABLE: u32 = 1 << 31;

    /// Every bit a caller is allowed to set.
    pub const MASK: u32 = Self::READABLE | Self::WRITABLE | Self::NONSECURE;

    /// Creates attributes with no access bits set.
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Readable, writable and non-secure; the default for every table level.
    pub const fn all() -> Self {
        Self(Self::MASK)
    }

    /// Creates attributes from raw bits, discarding anything outside [`Self::MASK`].
    pub const fn from_bits_truncate(bits: u32) -> Self {
        Self(bits & Self::MASK)
    }

    /// Returns the raw bits.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Returns whether the readable bit is set.
    pub fn is_readable(self) -> bool {
        (self.0 & Self::READABLE) != 0
    }

    /// Sets or clears the readable bit.
    pub fn set_readable(&mut self, readable: bool) {
        if readable {
            self.0 |= Self::READABLE;
        } else {
            self.0 &= !Self::READABLE;
        }
    }

    /// Returns whether the writable bit is set.
    pub fn is_writable(self) -> bool {
        (self.0 & Self::WRITABLE) != 0
    }

    /// Sets or clears the writable bit.
    pub fn set_writable(&mut self, writable: bool) {
        if writable {
            self.0 |= Self::WRITABLE;
        } else {
            self.0 &= !Self::WRITABLE;
        }
    }

    /// Returns whether the non-secure bit is set.
    pub fn is_nonsecure(self) -> bool {
        (self.0 & Self::NONSECURE) != 0
    }

    /// Sets or clears the non-secure bit.
    pub fn set_nonsecure(&mut self, nonsecure: bool) {
        if nonsecure {
            self.0 |= Self::NONSECURE;
        } else {
            self.0 &= !Self::NONSECURE;
        }
    }
}

impl Default for Attributes {
    fn default() -> Self {
        Self::all()
    }
}

impl core::fmt::Debug for Attributes {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "Attributes({}{}{})",
            if self.is_readable() { "R" } else { "-" },
            if self.is_writable() { "W" } else { "-" },
            if self.is_nonsecure() { "N" } else { "-" }
        )
    }
}

/// Attribute bits baked into every vacant entry.
///
/// Fixed rather than taken from the per-AS templates, so a tunable change never makes
/// an existing vacant slot look occupied.
const VACANT_ATTRIBUTES: Attributes = Attributes::all();

/// Next-level marker carried by PDEs that point at a page table (bit 28).
const PDE_NEXT: u32 = 1 << 28;

/// A page-directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pde(u32);

impl Pde {
    /// Encodes a PDE pointing at the page at `table`.
    ///
    /// `table` must be page-aligned.
    pub fn new(table: PhysicalAddress, attributes: Attributes, is_next: bool) -> Self {
        debug_assert!(
            table.is_aligned(geometry::PAGE_SIZE),
            "page table must be page-aligned"
        );

        let frame = (table.as_usize() >> geometry::PAGE_SHIFT) as u32 & geometry::PFN_MASK;
        let next = if is_next { PDE_NEXT } else { 0 };
        Self(frame | attributes.bits() | next)
    }

    /// Returns the placeholder stored in a directory slot that owns no page table.
    pub const fn vacant(directory_index: usize) -> Self {
        Self(((directory_index as u32) << 10) | VACANT_ATTRIBUTES.bits())
    }

    /// Returns whether this is the vacant placeholder for `directory_index`.
    pub fn is_vacant_at(self, directory_index: usize) -> bool {
        self == Self::vacant(directory_index)
    }

    /// Returns whether the next-level marker is set.
    pub const fn is_next(self) -> bool {
        (self.0 & PDE_NEXT) != 0
    }

    /// Returns the frame of the page table this entry points at.
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new((self.0 & geometry::PFN_MASK) as usize)
    }

    /// Returns the access attributes.
    pub const fn attributes(self) -> Attributes {
        Attributes::from_bits_truncate(self.0)
    }

    /// Returns the raw entry value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

/// A page-table entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(u32);

impl Pte {
    /// Encodes a PTE translating to `frame`.
    pub fn new(frame: FrameNumber, attributes: Attributes) -> Self {
        debug_assert!(frame.is_valid(), "frame number exceeds the PFN field");
        Self((frame.as_usize() as u32 & geometry::PFN_MASK) | attributes.bits())
    }

    /// Returns the placeholder stored in the slot translating `iova`.
    pub const fn vacant(iova: IoVirtualAddress) -> Self {
        Self(((iova.as_usize() >> geometry::PAGE_SHIFT) as u32) | VACANT_ATTRIBUTES.bits())
    }

    /// Returns whether this is the vacant placeholder for `iova`.
    pub fn is_vacant_at(self, iova: IoVirtualAddress) -> bool {
        self == Self::vacant(iova.align_down(geometry::PAGE_SIZE))
    }

    /// Returns the translated frame.
    pub const fn frame(self) -> FrameNumber {
        FrameNumber::new((self.0 & geometry::PFN_MASK) as usize)
    }

    /// Returns the access attributes.
    pub const fn attributes(self) -> Attributes {
        Attributes::from_bits_truncate(self.0)
    }

    /// Returns the raw entry value.
    pub const fn bits(self) -> u32 {
        self.0
    }

    /// Creates an entry from a raw value.
    pub const fn from_bits(bits: u32) -> Self {
        Self(bits)
    }
}

/// Encodes the value written to the page-directory base register for an ASID.
pub fn directory_pointer(directory: PhysicalAddress, attributes: Attributes) -> u32 {
    ((directory.as_usize() >> geometry::PAGE_SHIFT) as u32 & geometry::PFN_MASK) | attributes.bits()
}
