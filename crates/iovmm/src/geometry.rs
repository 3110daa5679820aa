//! Fixed translation geometry of the SMMU.
//!
//! Two levels of 1024 four-byte entries each: a 10-bit directory index, a 10-bit table
//! index and a 12-bit page offset, giving a 4 GiB translatable range.

/// Page shift used by the SMMU.
pub const PAGE_SHIFT: usize = 12;

/// Page size used by the SMMU (4 KiB).
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Shift of the directory index within an IOVA.
pub const SECTION_SHIFT: usize = 22;

/// Bytes of IOVA space covered by one directory slot (4 MiB).
pub const SECTION_SIZE: usize = 1 << SECTION_SHIFT;

/// Number of PDEs in a page directory.
pub const PDES_PER_DIRECTORY: usize = 1024;

/// Number of PTEs in a page table.
pub const PTES_PER_TABLE: usize = 1024;

/// Size in bytes of one PDE or PTE.
pub const ENTRY_SIZE: usize = core::mem::size_of::<u32>();

/// Mask selecting the frame number field of an entry.
pub const PFN_MASK: u32 = 0x000F_FFFF;

/// Highest translatable I/O virtual address.
pub const MAX_IOVA: usize = (PDES_PER_DIRECTORY << SECTION_SHIFT) - 1;

/// Highest physical address reachable through a 20-bit frame number.
pub const MAX_PHYSICAL_ADDRESS: usize = ((PFN_MASK as usize + 1) << PAGE_SHIFT) - 1;

/// Number of hardware address spaces the controller supports.
pub const MAX_ASIDS: usize = 4;
