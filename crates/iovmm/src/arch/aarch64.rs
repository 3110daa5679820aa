//! AArch64 data-cache maintenance and granule discovery.

use core::arch::asm;
use core::sync::atomic::{AtomicUsize, Ordering};

/// Returns the translation granule of the running kernel from `TCR_EL1.TG0`.
///
/// Must run at EL1 or above.
pub fn cpu_page_size() -> usize {
    let tcr: u64;
    // SAFETY: Reading TCR_EL1 has no side effects.
    unsafe {
        asm!("mrs {}, tcr_el1", out(reg) tcr, options(nomem, nostack, preserves_flags));
    }

    match (tcr >> 14) & 0b11 {
        0b01 => 64 * 1024,
        0b10 => 16 * 1024,
        _ => 4 * 1024,
    }
}

/// Cached data cache line size, 0 until first use.
static CACHE_LINE_SIZE: AtomicUsize = AtomicUsize::new(0);

/// Returns the minimum data cache line size from `CTR_EL0.DminLine`.
#[inline]
fn cache_line_size() -> usize {
    let cached = CACHE_LINE_SIZE.load(Ordering::Relaxed);
    if cached != 0 {
        return cached;
    }

    let ctr: u64;
    // SAFETY: Reading CTR_EL0 has no side effects.
    unsafe {
        asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack, preserves_flags));
    }

    let line_size = 4 << ((ctr >> 16) & 0xF) as usize;
    CACHE_LINE_SIZE.store(line_size, Ordering::Relaxed);
    line_size
}

/// Cleans and invalidates the data cache lines covering `len` bytes at `start`.
///
/// Completes with a full-system barrier so the SMMU observes the written entries.
#[inline]
pub fn flush_dcache_range(start: *const u8, len: usize) {
    let line = cache_line_size();
    let mut addr = start as usize & !(line - 1);
    let end = start as usize + len;

    while addr < end {
        // SAFETY: DC CIVAC on a mapped address only affects cache state.
        unsafe {
            asm!("dc civac, {}", in(reg) addr, options(nostack, preserves_flags));
        }
        addr += line;
    }

    // SAFETY: Barriers have no memory-safety implications.
    unsafe {
        asm!("dsb sy", options(nostack, preserves_flags));
    }
}
