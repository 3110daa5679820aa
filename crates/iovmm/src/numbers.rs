//! Physical frame numbers.
//!
//! Page-table entries carry frame numbers rather than addresses, and client drivers
//! resolve buffer pages to frames, so the frame number is the currency of the map path.

use core::{
    fmt,
    ops::{Add, Sub},
};

use crate::{address::PhysicalAddress, geometry};

/// A physical memory frame number.
///
/// Frame numbers are zero-indexed and correspond to 4 KiB-aligned physical addresses.
/// The SMMU stores them in the low 20 bits of a PDE or PTE.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct FrameNumber(usize);

impl FrameNumber {
    /// Creates a new frame number.
    #[inline]
    pub const fn new(number: usize) -> Self {
        Self(number)
    }

    /// Returns the raw frame number.
    #[inline]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns the physical address at the start of this frame.
    #[inline]
    pub const fn start(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << geometry::PAGE_SHIFT)
    }

    /// Returns true if the frame is addressable by the SMMU.
    #[inline]
    pub const fn is_valid(self) -> bool {
        self.0 <= geometry::PFN_MASK as usize
    }
}

impl fmt::Debug for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FrameNumber({:#x})", self.0)
    }
}

impl fmt::Display for FrameNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl From<PhysicalAddress> for FrameNumber {
    #[inline]
    fn from(addr: PhysicalAddress) -> Self {
        addr.frame_number()
    }
}

impl Add<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn add(self, rhs: usize) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl Sub<usize> for FrameNumber {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: usize) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl Sub<FrameNumber> for FrameNumber {
    type Output = usize;

    #[inline]
    fn sub(self, rhs: FrameNumber) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_address() {
        assert_eq!(FrameNumber::new(0x5000).start(), PhysicalAddress::new(0x500_0000));
    }

    #[test]
    fn validity_follows_pfn_width() {
        assert!(FrameNumber::new(0).is_valid());
        assert!(FrameNumber::new(0xF_FFFF).is_valid());
        assert!(!FrameNumber::new(0x10_0000).is_valid());
    }

    #[test]
    fn arithmetic() {
        let frame = FrameNumber::new(10);
        assert_eq!(frame + 2, FrameNumber::new(12));
        assert_eq!(frame - 2, FrameNumber::new(8));
        assert_eq!(FrameNumber::new(15) - frame, 5);
    }
}
