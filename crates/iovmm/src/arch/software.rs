//! Software model of the CPU cache.
//!
//! Hosts running the emulated SMMU share coherent memory with the "hardware", so a
//! flush only has to order the preceding stores.

use core::sync::atomic::{Ordering, fence};

/// Page shift of the CPU.
pub const PAGE_SHIFT: usize = 12;

/// Page size of the CPU in bytes.
pub const PAGE_SIZE: usize = 1 << PAGE_SHIFT;

/// Returns the page size the host is modelled with.
#[inline]
pub fn cpu_page_size() -> usize {
    PAGE_SIZE
}

/// Cleans and invalidates the data cache lines covering `len` bytes at `start`.
#[inline]
pub fn flush_dcache_range(start: *const u8, len: usize) {
    let _ = (start, len);
    fence(Ordering::SeqCst);
}
