//! Runtime tunables and register introspection.

use alloc::vec::Vec;
use core::{
    fmt,
    sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
};

use crate::{
    DiagError, IoVirtualAddress, SmmuDevice,
    client::HardwareClient,
    entry::Attributes,
    registers,
};

/// Highest accepted value of the `verbose` tunable.
pub const MAX_VERBOSITY: u32 = 2;

/// Knobs that can be changed while the device runs.
///
/// Stores outside the accepted range are ignored.
#[derive(Debug)]
pub struct Tunables {
    asid_count: usize,
    lowest_asid: AtomicUsize,
    debug_asid: AtomicUsize,
    verbose: AtomicU32,
    signature: AtomicBool,
}

impl Tunables {
    pub fn new(asid_count: usize, lowest_asid: usize, verbose: u32, signature: bool) -> Self {
        let tunables = Self {
            asid_count,
            lowest_asid: AtomicUsize::new(0),
            debug_asid: AtomicUsize::new(0),
            verbose: AtomicU32::new(0),
            signature: AtomicBool::new(signature),
        };
        tunables.set_lowest_asid(lowest_asid);
        tunables.set_verbose(verbose);
        tunables
    }

    /// First ASID considered when allocating a domain.
    pub fn lowest_asid(&self) -> usize {
        self.lowest_asid.load(Ordering::Relaxed)
    }

    pub fn set_lowest_asid(&self, asid: usize) -> bool {
        Self::store_below(&self.lowest_asid, asid, self.asid_count)
    }

    /// ASID whose attribute templates the attribute tunables refer to.
    pub fn debug_asid(&self) -> usize {
        self.debug_asid.load(Ordering::Relaxed)
    }

    pub fn set_debug_asid(&self, asid: usize) -> bool {
        Self::store_below(&self.debug_asid, asid, self.asid_count)
    }

    pub fn verbose(&self) -> u32 {
        self.verbose.load(Ordering::Relaxed)
    }

    pub fn set_verbose(&self, level: u32) -> bool {
        if level > MAX_VERBOSITY {
            log::warn!("ignoring verbose level {}", level);
            return false;
        }
        self.verbose.store(level, Ordering::Relaxed);
        true
    }

    /// Whether mapped pages are stamped with their IOVA and physical address.
    pub fn signature(&self) -> bool {
        self.signature.load(Ordering::Relaxed)
    }

    pub fn set_signature(&self, enabled: bool) {
        self.signature.store(enabled, Ordering::Relaxed);
    }

    fn store_below(slot: &AtomicUsize, value: usize, limit: usize) -> bool {
        if value >= limit {
            log::warn!("ignoring ASID {} (only {} address spaces)", value, limit);
            return false;
        }
        slot.store(value, Ordering::Relaxed);
        true
    }
}

/// A named tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tunable {
    LowestAsid,
    DebugAsid,
    Verbose,
    Signature,
    /// Directory-pointer attributes of the debug ASID.
    DirectoryAttributes,
    /// PDE attributes of the debug ASID.
    PdeAttributes,
    /// PTE attributes of the debug ASID.
    PteAttributes,
}

impl Tunable {
    pub const ALL: [Tunable; 7] = [
        Self::LowestAsid,
        Self::DebugAsid,
        Self::Verbose,
        Self::Signature,
        Self::DirectoryAttributes,
        Self::PdeAttributes,
        Self::PteAttributes,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Self::LowestAsid => "lowest_asid",
            Self::DebugAsid => "debug_asid",
            Self::Verbose => "verbose",
            Self::Signature => "signature",
            Self::DirectoryAttributes => "pdir_attr",
            Self::PdeAttributes => "pde_attr",
            Self::PteAttributes => "pte_attr",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|tunable| tunable.name() == name)
    }
}

/// Controller registers visible to diagnostics, excluding the client ASID registers.
const GLOBAL_REGISTERS: &[(&str, usize)] = &[
    ("CONFIG", registers::CONFIG),
    ("TLB_CONFIG", registers::TLB_CONFIG),
    ("PTC_CONFIG", registers::PTC_CONFIG),
    ("PTB_ASID", registers::PTB_ASID),
    ("PTB_DATA", registers::PTB_DATA),
    ("TLB_FLUSH", registers::TLB_FLUSH),
    ("PTC_FLUSH", registers::PTC_FLUSH),
    ("ASID_SECURITY", registers::ASID_SECURITY),
    ("STATS_TLB_HIT_COUNT", registers::STATS_TLB_HIT_COUNT),
    ("STATS_TLB_MISS_COUNT", registers::STATS_TLB_MISS_COUNT),
    ("STATS_PTC_HIT_COUNT", registers::STATS_PTC_HIT_COUNT),
    ("STATS_PTC_MISS_COUNT", registers::STATS_PTC_MISS_COUNT),
    ("TRANSLATION_ENABLE_0", registers::TRANSLATION_ENABLE_0),
    ("TRANSLATION_ENABLE_1", registers::TRANSLATION_ENABLE_1),
    ("TRANSLATION_ENABLE_2", registers::TRANSLATION_ENABLE_2),
];

/// Iterates every named register with its offset.
pub fn named_registers() -> impl Iterator<Item = (&'static str, usize)> {
    GLOBAL_REGISTERS.iter().copied().chain(
        HardwareClient::ALL
            .into_iter()
            .map(|client| (client.register_name(), client.register())),
    )
}

/// Looks up a register offset by name.
pub fn register_offset(name: &str) -> Option<usize> {
    named_registers().find_map(|(candidate, offset)| (candidate == name).then_some(offset))
}

/// Bits a diagnostics write may change in the register at `offset`.
fn writable_mask(offset: usize) -> u32 {
    if cfg!(feature = "unrestricted-register-writes") {
        return u32::MAX;
    }
    match offset {
        registers::TLB_CONFIG => registers::TLB_CONFIG_STATS_MASK,
        registers::PTC_CONFIG => registers::PTC_CONFIG_STATS_MASK,
        _ => 0,
    }
}

/// Device overview printed by [`SmmuDevice::summary`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub window_base: IoVirtualAddress,
    pub page_count: usize,
    pub asid_count: usize,
    pub enabled: bool,
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "iovmm_base: {}", self.window_base)?;
        writeln!(f, "page_count: {:#x}", self.page_count)?;
        writeln!(f, "  num_ases: {}", self.asid_count)?;
        writeln!(f, "    enable: {}", if self.enabled { "yes" } else { "no" })
    }
}

impl SmmuDevice {
    /// Returns the runtime tunables.
    pub fn tunables(&self) -> &Tunables {
        &self.tunables
    }

    /// Reads the register called `name`.
    pub fn show_register(&self, name: &str) -> Result<u32, DiagError> {
        let offset = register_offset(name).ok_or(DiagError::UnknownRegister)?;
        Ok(self.regs.read(offset))
    }

    /// Writes `value` to the register called `name`.
    ///
    /// Unless unrestricted writes are compiled in, only the TLB and PTC statistics
    /// enables can change; other bits and registers keep their value.
    pub fn store_register(&self, name: &str, value: u32) -> Result<(), DiagError> {
        let offset = register_offset(name).ok_or(DiagError::UnknownRegister)?;
        let mask = writable_mask(offset);
        if mask == 0 {
            log::warn!("register {} is read-only", name);
            return Ok(());
        }

        let _device = self.state.lock();
        let current = self.regs.read(offset);
        self.regs.write(offset, (current & !mask) | (value & mask));
        Ok(())
    }

    /// Reads every named register.
    pub fn dump_registers(&self) -> Vec<(&'static str, u32)> {
        named_registers()
            .map(|(name, offset)| (name, self.regs.read(offset)))
            .collect()
    }

    /// Returns a short description of the device.
    pub fn summary(&self) -> Summary {
        Summary {
            window_base: self.window.base,
            page_count: self.window.page_count(),
            asid_count: self.spaces.len(),
            enabled: self.is_enabled(),
        }
    }

    /// Reads the tunable called `name`.
    pub fn show_tunable(&self, name: &str) -> Result<u32, DiagError> {
        let tunable = Tunable::from_name(name).ok_or(DiagError::UnknownTunable)?;
        let attributes = || self.spaces[self.tunables.debug_asid()].attributes();
        Ok(match tunable {
            Tunable::LowestAsid => self.tunables.lowest_asid() as u32,
            Tunable::DebugAsid => self.tunables.debug_asid() as u32,
            Tunable::Verbose => self.tunables.verbose(),
            Tunable::Signature => self.tunables.signature() as u32,
            Tunable::DirectoryAttributes => attributes().directory.bits(),
            Tunable::PdeAttributes => attributes().pde.bits(),
            Tunable::PteAttributes => attributes().pte.bits(),
        })
    }

    /// Changes the tunable called `name`. Out-of-range values are ignored.
    pub fn store_tunable(&self, name: &str, value: u32) -> Result<(), DiagError> {
        let tunable = Tunable::from_name(name).ok_or(DiagError::UnknownTunable)?;
        match tunable {
            Tunable::LowestAsid => {
                self.tunables.set_lowest_asid(value as usize);
            }
            Tunable::DebugAsid => {
                self.tunables.set_debug_asid(value as usize);
            }
            Tunable::Verbose => {
                self.tunables.set_verbose(value);
            }
            Tunable::Signature => self.tunables.set_signature(value != 0),
            Tunable::DirectoryAttributes | Tunable::PdeAttributes | Tunable::PteAttributes => {
                if value > Attributes::MASK {
                    log::warn!("ignoring {} value {:#x}", name, value);
                    return Ok(());
                }
                self.store_attributes(tunable, Attributes::from_bits_truncate(value));
            }
        }
        Ok(())
    }

    fn store_attributes(&self, tunable: Tunable, value: Attributes) {
        let asid = self.tunables.debug_asid();
        let space = &self.spaces[asid];
        let mut state = space.lock();
        match tunable {
            Tunable::PdeAttributes => state.attributes.pde = value,
            Tunable::PteAttributes => state.attributes.pte = value,
            _ => {
                state.attributes.directory = value;
                if state.directory.is_none() {
                    return;
                }
                let _device = self.state.lock();
                self.regs.write(registers::PTB_ASID, asid as u32);
                let pointer = self.regs.read(registers::PTB_DATA);
                self.program_directory(asid, (pointer & !Attributes::MASK) | value.bits());
            }
        }
    }
}
