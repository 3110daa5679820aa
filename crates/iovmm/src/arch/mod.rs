//! CPU-side cache maintenance for page-table writes.
//!
//! The SMMU walks page tables straight out of DRAM, so every PDE/PTE store has to be
//! pushed out of the CPU data cache before the hardware is told to re-read it.

// NOTE: We DO include the AArch64 module even during tests so that rust-analyzer can see it.
#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(all(
    target_arch = "aarch64",
    not(test),
    not(feature = "software-emulation")
))]
pub use aarch64::*;

// Use the software model when testing, emulating, or building for a host without
// explicit cache maintenance.
#[cfg(any(test, feature = "software-emulation", not(target_arch = "aarch64")))]
mod software;
#[cfg(any(test, feature = "software-emulation", not(target_arch = "aarch64")))]
pub use software::*;
