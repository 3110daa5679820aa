#![cfg_attr(not(any(test, feature = "software-emulation")), no_std)]

//! # I/O Virtual Memory Manager (IOVMM)
//!
//! Drives an SMMU-style translation unit that sits between DMA-capable hardware clients
//! and system memory. It provides:
//!
//! - Two-level page tables per address space, with present-entry accounting so that
//!   empty second-level tables can be reclaimed.
//! - Binding of named client groups to address spaces, all-or-nothing.
//! - Maintenance of the page-table cache (PTC) and TLB after every table write.
//! - Suspend and resume of the controller registers.
//! - A diagnostics surface of named registers and runtime tunables.
//! - Software emulation of the registers and physical memory for testing in
//!   non-kernel environments.

extern crate alloc;

mod address;
mod address_space;
mod arch;
mod client;
mod device;
mod diagnostics;
mod entry;
mod error;
mod geometry;
mod numbers;
mod page;
mod page_directory;
mod registers;
mod tlb;

/// Index of one of the controller's address spaces.
pub type Asid = usize;

pub use address::{IoVirtualAddress, PhysicalAddress};
pub use address_space::{AsAttributes, PageResolver, Segment};
pub use client::{CLIENT_GROUPS, ClientGroup, ClientState, HardwareClient};
pub use device::{Domain, IovaWindow, SavedState, SmmuConfig, SmmuDevice, SmmuResources};
pub use diagnostics::{MAX_VERBOSITY, Summary, Tunable, Tunables};
pub use entry::{Attributes, Pde, Pte};
pub use error::{AllocError, BindError, DiagError, InitError, MapError, ResolveError};
pub use geometry::{MAX_ASIDS, PAGE_SHIFT, PAGE_SIZE, PDES_PER_DIRECTORY, PTES_PER_TABLE};
pub use numbers::FrameNumber;
pub use page::{DirectMapAllocator, Page, PageAllocator};
pub use registers::{MmioRegisters, RegisterBlock};

#[cfg(any(test, feature = "software-emulation"))]
pub use page::EmulatedMemory;
#[cfg(any(test, feature = "software-emulation"))]
pub use registers::{EmulatedRegisters, FlushCommand};
