//! Error types returned across the manager's API.

use core::fmt;

use crate::{Asid, HardwareClient};

/// Errors that prevent the controller from being brought up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitError {
    /// A required platform resource (register window or IOVA window) was not supplied.
    MissingResource(&'static str),
    /// The SMMU page size differs from the CPU page size.
    PageSizeMismatch { cpu: usize, smmu: usize },
    /// The requested number of address spaces is zero or exceeds the hardware.
    InvalidAsidCount(usize),
    /// The IOVA window is empty, misaligned or outside the translatable range.
    InvalidWindow,
    /// The shared guard page could not be allocated.
    OutOfMemory,
}

impl fmt::Display for InitError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingResource(name) => write!(f, "missing SMMU resource `{}`", name),
            Self::PageSizeMismatch { cpu, smmu } => write!(
                f,
                "SMMU and CPU page sizes must match (cpu {:#x}, smmu {:#x})",
                cpu, smmu
            ),
            Self::InvalidAsidCount(count) => write!(f, "invalid address space count {}", count),
            Self::InvalidWindow => write!(f, "invalid IOVA window"),
            Self::OutOfMemory => write!(f, "out of memory"),
        }
    }
}

/// Errors that can occur while allocating pages or domains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocError {
    /// No physical page was available for a directory or table.
    OutOfMemory,
    /// Every usable address space is already bound to a client group.
    NoFreeAddressSpace,
    /// No hardware client group is registered under the requesting device's name.
    UnknownClient,
    /// A client of the group is already translated through another address space.
    ClientBusy { client: HardwareClient, asid: Asid },
}

impl fmt::Display for AllocError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NoFreeAddressSpace => write!(f, "no free address space"),
            Self::UnknownClient => write!(f, "no SMMU client group for device"),
            Self::ClientBusy { client, asid } => {
                write!(f, "hardware client {:?} busy for ASID {}", client, asid)
            }
        }
    }
}

impl From<BindError> for AllocError {
    fn from(err: BindError) -> Self {
        match err {
            BindError::ClientBusy { client, asid } => Self::ClientBusy { client, asid },
        }
    }
}

/// Errors reported by the two-phase client binding protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindError {
    /// `client` is enabled for `asid`, which differs from the requested address space.
    ClientBusy { client: HardwareClient, asid: Asid },
}

impl fmt::Display for BindError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClientBusy { client, asid } => {
                write!(f, "hardware client {:?} busy for ASID {}", client, asid)
            }
        }
    }
}

/// Error returned by a [`PageResolver`](crate::PageResolver) that cannot make a page resident.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolveError;

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page could not be made resident")
    }
}

/// Errors that abort a mapping request. The request is fully rolled back first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    /// The resolver returned no valid frame for the page at this index of the request.
    ResolverFailed(usize),
    /// A second-level page table could not be allocated.
    OutOfMemory,
    /// The address space has no page directory; the domain was freed or never bound.
    NotBound,
}

impl fmt::Display for MapError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ResolverFailed(page) => write!(f, "page {} could not be made resident", page),
            Self::OutOfMemory => write!(f, "out of memory"),
            Self::NotBound => write!(f, "address space is not bound"),
        }
    }
}

impl From<AllocError> for MapError {
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}

/// Errors returned by the diagnostics surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagError {
    /// No register is known by that name.
    UnknownRegister,
    /// No tunable is known by that name.
    UnknownTunable,
}

impl fmt::Display for DiagError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownRegister => write!(f, "unknown register"),
            Self::UnknownTunable => write!(f, "unknown tunable"),
        }
    }
}
