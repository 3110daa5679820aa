//! Memory-controller register layout and access.
//!
//! Offsets are relative to the memory-controller window; the AHB arbiter has its own
//! window and only contributes the "SMMU init done" handshake bit.

use core::ptr::NonNull;

pub const CONFIG: usize = 0x10;
pub const CONFIG_ENABLE: u32 = 1;
pub const CONFIG_DISABLE: u32 = 0;

pub const TLB_CONFIG: usize = 0x14;
pub const TLB_CONFIG_STATS_MASK: u32 = 1 << 31;
pub const TLB_CONFIG_RESET_VAL: u32 = 0x2000_0010;

pub const PTC_CONFIG: usize = 0x18;
pub const PTC_CONFIG_STATS_MASK: u32 = 1 << 31;
pub const PTC_CONFIG_RESET_VAL: u32 = 0x2000_003F;

/// Selects which ASID the `PTB_DATA` window refers to.
pub const PTB_ASID: usize = 0x1C;

/// Page-directory base (frame | attributes) of the ASID selected by `PTB_ASID`.
pub const PTB_DATA: usize = 0x20;
pub const PTB_DATA_RESET_VAL: u32 = 0;

pub const TLB_FLUSH: usize = 0x30;
pub const TLB_FLUSH_VA_MATCH_ALL: u32 = 0;
pub const TLB_FLUSH_VA_MATCH_SECTION: u32 = 2;
pub const TLB_FLUSH_VA_MATCH_GROUP: u32 = 3;
pub const TLB_FLUSH_VA_SECTION_MASK: u32 = 0xFFC0_0000;
pub const TLB_FLUSH_VA_GROUP_MASK: u32 = 0xFFFF_C000;
pub const TLB_FLUSH_VA_SHIFT: u32 = 12;
pub const TLB_FLUSH_ASID_SHIFT: u32 = 29;
pub const TLB_FLUSH_ASID_MATCH: u32 = 1 << 31;

pub const PTC_FLUSH: usize = 0x34;
pub const PTC_FLUSH_TYPE_ALL: u32 = 0;
pub const PTC_FLUSH_TYPE_ADR: u32 = 1;

pub const ASID_SECURITY: usize = 0x38;

pub const STATS_TLB_HIT_COUNT: usize = 0x1F0;
pub const STATS_TLB_MISS_COUNT: usize = 0x1F4;
pub const STATS_PTC_HIT_COUNT: usize = 0x1F8;
pub const STATS_PTC_MISS_COUNT: usize = 0x1FC;

pub const TRANSLATION_ENABLE_0: usize = 0x228;
pub const TRANSLATION_ENABLE_1: usize = 0x22C;
pub const TRANSLATION_ENABLE_2: usize = 0x230;

/// Value of a client ASID register whose client bypasses translation.
pub const CLIENT_ASID_DISABLE: u32 = 0;
/// Bit marking a client ASID register as enabled.
pub const CLIENT_ASID_ENABLE: u32 = 1 << 31;

/// AHB arbiter crossbar control (arbiter window).
pub const AHB_XBAR_CTRL: usize = 0xE0;
pub const AHB_XBAR_CTRL_SMMU_INIT_DONE: u32 = 1 << 17;

/// A window of 32-bit device registers.
pub trait RegisterBlock: Send + Sync {
    /// Reads the register at `offset`.
    fn read(&self, offset: usize) -> u32;

    /// Writes `value` to the register at `offset`.
    fn write(&self, offset: usize, value: u32);
}

/// Registers accessed through a memory-mapped I/O window.
pub struct MmioRegisters {
    base: NonNull<u32>,
    size: usize,
}

// SAFETY: Volatile MMIO accesses may be issued from any thread; callers serialise
// read-modify-write sequences with the device lock.
unsafe impl Send for MmioRegisters {}
// SAFETY: See above.
unsafe impl Sync for MmioRegisters {}

impl MmioRegisters {
    /// Creates an accessor for `size` bytes of registers at `base`.
    ///
    /// # Safety
    ///
    /// `base` must be a device mapping valid for 32-bit volatile accesses over `size`
    /// bytes for the lifetime of the accessor.
    pub unsafe fn new(base: NonNull<u32>, size: usize) -> Self {
        Self { base, size }
    }

    fn register(&self, offset: usize) -> *mut u32 {
        assert!(
            offset % 4 == 0 && offset + 4 <= self.size,
            "register offset out of bounds"
        );
        // SAFETY: Bounds checked above against the window given to `new`.
        unsafe { self.base.as_ptr().add(offset / 4) }
    }
}

impl RegisterBlock for MmioRegisters {
    fn read(&self, offset: usize) -> u32 {
        // SAFETY: `register` returns an in-bounds pointer into the device mapping.
        unsafe { self.register(offset).read_volatile() }
    }

    fn write(&self, offset: usize, value: u32) {
        // SAFETY: `register` returns an in-bounds pointer into the device mapping.
        unsafe { self.register(offset).write_volatile(value) }
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::{EmulatedRegisters, FlushCommand};

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use alloc::{collections::BTreeMap, vec::Vec};

    use super::*;
    use crate::geometry::MAX_ASIDS;

    /// A flush command observed by the emulated controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum FlushCommand {
        /// Raw value written to `PTC_FLUSH`.
        Ptc(u32),
        /// Raw value written to `TLB_FLUSH`.
        Tlb(u32),
    }

    impl FlushCommand {
        /// Returns true for a PTC flush of the entry at `addr`.
        pub fn is_ptc_flush_of(self, addr: u32) -> bool {
            self == Self::Ptc(PTC_FLUSH_TYPE_ADR | addr)
        }

        /// Returns true for a TLB invalidate scoped to `asid`.
        pub fn is_tlb_flush_for(self, asid: usize) -> bool {
            match self {
                Self::Tlb(value) => {
                    value & TLB_FLUSH_ASID_MATCH != 0
                        && ((value >> TLB_FLUSH_ASID_SHIFT) & 0x3) as usize == asid
                }
                Self::Ptc(_) => false,
            }
        }
    }

    #[derive(Default)]
    struct State {
        file: BTreeMap<usize, u32>,
        page_directories: [u32; MAX_ASIDS],
        commands: Vec<FlushCommand>,
    }

    impl State {
        fn current_asid(&self) -> usize {
            self.file.get(&PTB_ASID).copied().unwrap_or(0) as usize % MAX_ASIDS
        }
    }

    /// Software model of the memory-controller register window.
    ///
    /// Plain registers behave as storage. `PTB_DATA` is banked per ASID behind
    /// `PTB_ASID`, and every write to a flush register is recorded.
    #[derive(Default)]
    pub struct EmulatedRegisters {
        state: spin::Mutex<State>,
    }

    impl EmulatedRegisters {
        /// Creates a register file in its reset state.
        pub fn new() -> Self {
            Self::default()
        }

        /// Returns the page-directory pointer programmed for `asid`.
        pub fn page_directory(&self, asid: usize) -> u32 {
            self.state.lock().page_directories[asid]
        }

        /// Returns every flush command recorded since the last [`Self::take_commands`].
        pub fn take_commands(&self) -> Vec<FlushCommand> {
            core::mem::take(&mut self.state.lock().commands)
        }

        /// Returns a copy of every plain register and every banked page-directory pointer.
        pub fn snapshot(&self) -> (BTreeMap<usize, u32>, [u32; MAX_ASIDS]) {
            let state = self.state.lock();
            (state.file.clone(), state.page_directories)
        }

        /// Forgets all register contents, as after a power transition.
        pub fn power_cycle(&self) {
            *self.state.lock() = State::default();
        }
    }

    impl RegisterBlock for EmulatedRegisters {
        fn read(&self, offset: usize) -> u32 {
            let state = self.state.lock();
            match offset {
                PTB_DATA => state.page_directories[state.current_asid()],
                _ => state.file.get(&offset).copied().unwrap_or(0),
            }
        }

        fn write(&self, offset: usize, value: u32) {
            let mut state = self.state.lock();
            match offset {
                PTB_DATA => {
                    let asid = state.current_asid();
                    state.page_directories[asid] = value;
                }
                PTC_FLUSH => state.commands.push(FlushCommand::Ptc(value)),
                TLB_FLUSH => state.commands.push(FlushCommand::Tlb(value)),
                _ => {
                    state.file.insert(offset, value);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_registers_store_values() {
        let regs = EmulatedRegisters::new();
        assert_eq!(regs.read(CONFIG), 0);
        regs.write(CONFIG, CONFIG_ENABLE);
        assert_eq!(regs.read(CONFIG), CONFIG_ENABLE);
    }

    #[test]
    fn page_directory_is_banked_by_asid() {
        let regs = EmulatedRegisters::new();
        regs.write(PTB_ASID, 1);
        regs.write(PTB_DATA, 0xE008_0001);
        regs.write(PTB_ASID, 2);
        regs.write(PTB_DATA, 0xE008_0002);

        assert_eq!(regs.read(PTB_DATA), 0xE008_0002);
        regs.write(PTB_ASID, 1);
        assert_eq!(regs.read(PTB_DATA), 0xE008_0001);
        assert_eq!(regs.page_directory(2), 0xE008_0002);
    }

    #[test]
    fn flush_writes_are_recorded() {
        let regs = EmulatedRegisters::new();
        regs.write(PTC_FLUSH, PTC_FLUSH_TYPE_ADR | 0x8000_0040);
        regs.write(TLB_FLUSH, TLB_FLUSH_ASID_MATCH | (2 << TLB_FLUSH_ASID_SHIFT));

        let commands = regs.take_commands();
        assert_eq!(commands.len(), 2);
        assert!(commands[0].is_ptc_flush_of(0x8000_0040));
        assert!(commands[1].is_tlb_flush_for(2));
        assert!(!commands[1].is_tlb_flush_for(1));
        assert!(regs.take_commands().is_empty());
    }

    #[test]
    fn power_cycle_forgets_everything() {
        let regs = EmulatedRegisters::new();
        regs.write(TRANSLATION_ENABLE_0, 0xFFFF_FFFF);
        regs.write(PTB_DATA, 0x1234);
        regs.power_cycle();

        assert_eq!(regs.read(TRANSLATION_ENABLE_0), 0);
        assert_eq!(regs.page_directory(0), 0);
    }

    #[test]
    fn mmio_accesses_are_bounded() {
        let mut window = [0u32; 4];
        let base = NonNull::new(window.as_mut_ptr()).unwrap();
        let regs = unsafe { MmioRegisters::new(base, 16) };
        regs.write(0x8, 0xCAFE);
        assert_eq!(regs.read(0x8), 0xCAFE);
        assert_eq!(window[2], 0xCAFE);
    }
}
