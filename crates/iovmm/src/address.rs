//! Address types for the two sides of the translation.
//!
//! The SMMU translates I/O virtual addresses issued by bus masters into physical
//! addresses. Both are kept as distinct newtypes so that a physical page can never be
//! handed to a routine expecting an IOVA, or the other way around.

use core::fmt;
use core::ops::{Add, Sub};

use crate::{FrameNumber, geometry};

/// Macro to define common address type functionality.
///
/// This macro generates the basic structure and methods common to both physical
/// and I/O virtual address types, reducing code duplication.
macro_rules! impl_address_common {
    ($name:ident, $doc:expr) => {
        #[doc = $doc]
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
        #[repr(transparent)]
        pub struct $name(usize);

        impl $name {
            /// Returns the raw address value.
            #[inline]
            pub const fn as_usize(self) -> usize {
                self.0
            }

            /// Checks if the address is aligned to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn is_aligned(self, align: usize) -> bool {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                self.0 & (align - 1) == 0
            }

            /// Aligns the address down to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_down(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self(self.0 & !(align - 1))
            }

            /// Aligns the address up to the given alignment.
            ///
            /// # Panics
            ///
            /// Panics if `align` is not a power of two.
            #[inline]
            pub const fn align_up(self, align: usize) -> Self {
                assert!(align.is_power_of_two(), "alignment must be a power of two");
                Self((self.0 + align - 1) & !(align - 1))
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({:#x})", stringify!($name), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{:#x}", self.0)
            }
        }

        impl From<u32> for $name {
            #[inline]
            fn from(addr: u32) -> Self {
                Self::new(addr as usize)
            }
        }

        impl From<usize> for $name {
            #[inline]
            fn from(addr: usize) -> Self {
                Self::new(addr)
            }
        }

        impl Add<usize> for $name {
            type Output = Self;

            #[inline]
            fn add(self, rhs: usize) -> Self::Output {
                Self::new(self.0 + rhs)
            }
        }

        impl Sub<usize> for $name {
            type Output = Self;

            #[inline]
            fn sub(self, rhs: usize) -> Self::Output {
                Self::new(self.0 - rhs)
            }
        }

        impl Sub<$name> for $name {
            type Output = usize;

            #[inline]
            fn sub(self, rhs: $name) -> Self::Output {
                self.0 - rhs.0
            }
        }
    };
}

impl_address_common!(
    PhysicalAddress,
    "A physical memory address as seen by the memory controller.\n\n\
     The SMMU encodes 20-bit frame numbers, so every physical address it can reach\n\
     fits in 32 bits."
);

impl PhysicalAddress {
    /// Creates a new physical address.
    ///
    /// # Panics
    ///
    /// Panics if the address does not fit in the SMMU's physical address width.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr <= geometry::MAX_PHYSICAL_ADDRESS,
            "physical address exceeds maximum width"
        );
        Self(addr)
    }

    /// Returns the frame containing this address.
    #[inline]
    pub const fn frame_number(self) -> FrameNumber {
        FrameNumber::new(self.0 >> geometry::PAGE_SHIFT)
    }
}

impl_address_common!(
    IoVirtualAddress,
    "An I/O virtual address, as issued by a DMA-capable hardware client.\n\n\
     The translatable range is 4 GiB: a 10-bit directory index, a 10-bit table index\n\
     and a 12-bit page offset."
);

impl IoVirtualAddress {
    /// Creates a new I/O virtual address.
    ///
    /// # Panics
    ///
    /// Panics if the address lies outside the 4 GiB translatable range.
    #[inline]
    pub const fn new(addr: usize) -> Self {
        assert!(
            addr <= geometry::MAX_IOVA,
            "address outside the translatable range"
        );
        Self(addr)
    }

    /// Returns the address of the first page covered by the given directory slot.
    #[inline]
    pub const fn from_directory_index(index: usize) -> Self {
        Self::new(index << geometry::SECTION_SHIFT)
    }

    /// Returns the page-directory slot covering this address.
    #[inline]
    pub const fn directory_index(self) -> usize {
        self.0 >> geometry::SECTION_SHIFT
    }

    /// Returns the page-table slot covering this address within its directory slot.
    #[inline]
    pub const fn table_index(self) -> usize {
        (self.0 >> geometry::PAGE_SHIFT) % geometry::PTES_PER_TABLE
    }

    /// Returns the byte offset within the 4 KiB page.
    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (geometry::PAGE_SIZE - 1)
    }

    /// Returns the IOVA page number (the address shifted down by the page shift).
    #[inline]
    pub const fn page_number(self) -> usize {
        self.0 >> geometry::PAGE_SHIFT
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod physical_address {
        use super::*;

        #[test]
        fn new_valid_address() {
            let addr = PhysicalAddress::new(0x8000_1000);
            assert_eq!(addr.as_usize(), 0x8000_1000);
        }

        #[test]
        fn new_max_valid_address() {
            let addr = PhysicalAddress::new(geometry::MAX_PHYSICAL_ADDRESS);
            assert_eq!(addr.as_usize(), 0xFFFF_FFFF);
        }

        #[test]
        #[should_panic(expected = "physical address exceeds maximum width")]
        fn new_exceeds_max() {
            PhysicalAddress::new(geometry::MAX_PHYSICAL_ADDRESS + 1);
        }

        #[test]
        fn frame_number_drops_offset() {
            let addr = PhysicalAddress::new(0x5000_0123);
            assert_eq!(addr.frame_number(), FrameNumber::new(0x50000));
        }

        #[test]
        fn align_down_and_up() {
            let addr = PhysicalAddress::new(0x1124);
            assert_eq!(
                addr.align_down(geometry::PAGE_SIZE),
                PhysicalAddress::new(0x1000)
            );
            assert_eq!(
                addr.align_up(geometry::PAGE_SIZE),
                PhysicalAddress::new(0x2000)
            );
        }

        #[test]
        fn display_format() {
            let addr = PhysicalAddress::new(0x0100);
            assert_eq!(format!("{}", addr), "0x100");
            assert_eq!(format!("{:?}", addr), "PhysicalAddress(0x100)");
        }
    }

    mod io_virtual_address {
        use super::*;

        #[test]
        fn indices_split_the_address() {
            let addr = IoVirtualAddress::new(0x1000_0000);
            assert_eq!(addr.directory_index(), 64);
            assert_eq!(addr.table_index(), 0);
            assert_eq!(addr.page_offset(), 0);

            let addr = IoVirtualAddress::new(0xFFC0_3ABC);
            assert_eq!(addr.directory_index(), 0x3FF);
            assert_eq!(addr.table_index(), 3);
            assert_eq!(addr.page_offset(), 0xABC);
        }

        #[test]
        fn from_directory_index_round_trips() {
            for index in [0, 1, 64, 1023] {
                let addr = IoVirtualAddress::from_directory_index(index);
                assert_eq!(addr.directory_index(), index);
                assert_eq!(addr.table_index(), 0);
            }
        }

        #[test]
        #[should_panic(expected = "address outside the translatable range")]
        fn rejects_addresses_above_four_gib() {
            IoVirtualAddress::new(geometry::MAX_IOVA + 1);
        }

        #[test]
        fn arithmetic() {
            let a = IoVirtualAddress::new(0x2000);
            assert_eq!(a + geometry::PAGE_SIZE, IoVirtualAddress::new(0x3000));
            assert_eq!(a - geometry::PAGE_SIZE, IoVirtualAddress::new(0x1000));
            assert_eq!(IoVirtualAddress::new(0x5000) - a, 0x3000);
        }
    }
}
