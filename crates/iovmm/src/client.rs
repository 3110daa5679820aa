//! Hardware clients and their ASID registers.
//!
//! Every DMA-capable IP block behind the memory controller has one register selecting
//! whether its traffic is translated and, if so, through which address space. Clients
//! are switched in named groups, and a group is only bound when none of its members is
//! owned by another address space.

use alloc::vec::Vec;
use core::fmt;

use crate::{
    Asid, BindError,
    registers::{self, RegisterBlock},
    tlb::TranslationCache,
};

/// A DMA-capable hardware client of the memory controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HardwareClient {
    /// PCIe root complex.
    Afi,
    Avpc,
    /// Display controller A.
    Dc,
    /// Display controller B.
    Dcb,
    Epp,
    G2,
    /// Host1x.
    Hc,
    /// HD audio.
    Hda,
    Isp,
    Mpe,
    Nv,
    Nv2,
    Ppcs,
    Sata,
    Vde,
    Vi,
}

impl HardwareClient {
    /// Number of known clients.
    pub const COUNT: usize = 16;

    /// Every client, in register order.
    pub const ALL: [HardwareClient; Self::COUNT] = [
        Self::Afi,
        Self::Avpc,
        Self::Dc,
        Self::Dcb,
        Self::Epp,
        Self::G2,
        Self::Hc,
        Self::Hda,
        Self::Isp,
        Self::Mpe,
        Self::Nv,
        Self::Nv2,
        Self::Ppcs,
        Self::Sata,
        Self::Vde,
        Self::Vi,
    ];

    /// Offset of the client's ASID register in the memory-controller window.
    pub const fn register(self) -> usize {
        match self {
            Self::Afi => 0x238,
            Self::Avpc => 0x23C,
            Self::Dc => 0x240,
            Self::Dcb => 0x244,
            Self::Epp => 0x248,
            Self::G2 => 0x24C,
            Self::Hc => 0x250,
            Self::Hda => 0x254,
            Self::Isp => 0x258,
            Self::Mpe => 0x264,
            Self::Nv => 0x268,
            Self::Nv2 => 0x26C,
            Self::Ppcs => 0x270,
            Self::Sata => 0x278,
            Self::Vde => 0x27C,
            Self::Vi => 0x280,
        }
    }

    /// Returns the register name used by the diagnostics surface.
    pub const fn register_name(self) -> &'static str {
        match self {
            Self::Afi => "AFI_ASID",
            Self::Avpc => "AVPC_ASID",
            Self::Dc => "DC_ASID",
            Self::Dcb => "DCB_ASID",
            Self::Epp => "EPP_ASID",
            Self::G2 => "G2_ASID",
            Self::Hc => "HC_ASID",
            Self::Hda => "HDA_ASID",
            Self::Isp => "ISP_ASID",
            Self::Mpe => "MPE_ASID",
            Self::Nv => "NV_ASID",
            Self::Nv2 => "NV2_ASID",
            Self::Ppcs => "PPCS_ASID",
            Self::Sata => "SATA_ASID",
            Self::Vde => "VDE_ASID",
            Self::Vi => "VI_ASID",
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

/// The last value written to a client's ASID register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ClientState {
    /// Traffic bypasses translation.
    #[default]
    Disabled,
    /// Traffic is translated through the given address space.
    Enabled(Asid),
}

impl ClientState {
    /// Encodes the register value.
    pub const fn register_value(self) -> u32 {
        match self {
            Self::Disabled => registers::CLIENT_ASID_DISABLE,
            Self::Enabled(asid) => registers::CLIENT_ASID_ENABLE | asid as u32,
        }
    }

    /// Decodes a register value.
    pub const fn from_register_value(value: u32) -> Self {
        if value & registers::CLIENT_ASID_ENABLE != 0 {
            Self::Enabled((value & !registers::CLIENT_ASID_ENABLE) as Asid)
        } else {
            Self::Disabled
        }
    }
}

/// A named set of clients that always share one address space.
#[derive(Debug, PartialEq, Eq)]
pub struct ClientGroup {
    /// Name of the device node that owns the group.
    pub name: &'static str,
    pub clients: &'static [HardwareClient],
}

impl ClientGroup {
    /// Finds the group registered for the device `name`.
    pub fn lookup(name: &str) -> Option<&'static ClientGroup> {
        CLIENT_GROUPS.iter().find(|group| group.name == name)
    }
}

impl fmt::Display for ClientGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// Every group a device can allocate a domain for.
pub static CLIENT_GROUPS: &[ClientGroup] = &[
    // The system memory-map allocator translates for every client at once.
    ClientGroup {
        name: "nvmap",
        clients: &HardwareClient::ALL,
    },
    ClientGroup {
        name: "display",
        clients: &[HardwareClient::Dc, HardwareClient::Dcb],
    },
    ClientGroup {
        name: "video",
        clients: &[
            HardwareClient::Epp,
            HardwareClient::Mpe,
            HardwareClient::Vde,
            HardwareClient::Vi,
        ],
    },
    ClientGroup {
        name: "pcie",
        clients: &[HardwareClient::Afi],
    },
    ClientGroup {
        name: "audio",
        clients: &[HardwareClient::Hda],
    },
];

/// One pending client register update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterWrite {
    pub client: HardwareClient,
    pub state: ClientState,
}

/// Software copy of every client ASID register.
///
/// The hardware registers are write-mostly and lost across power transitions, so this
/// table is the authority. It lives under the device lock.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BindingTable {
    states: [ClientState; HardwareClient::COUNT],
}

impl BindingTable {
    /// Creates a table with every client disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the recorded state of `client`.
    pub fn state(&self, client: HardwareClient) -> ClientState {
        self.states[client.index()]
    }

    /// Checks that `group` can move into `asid` and returns the writes that would do it.
    ///
    /// Nothing is modified. Clients already enabled for `asid` are rebound idempotently.
    pub fn validate(
        &self,
        group: &ClientGroup,
        asid: Asid,
    ) -> Result<Vec<RegisterWrite>, BindError> {
        group
            .clients
            .iter()
            .map(|&client| match self.state(client) {
                ClientState::Enabled(owner) if owner != asid => Err(BindError::ClientBusy {
                    client,
                    asid: owner,
                }),
                _ => Ok(RegisterWrite {
                    client,
                    state: ClientState::Enabled(asid),
                }),
            })
            .collect()
    }

    /// Applies writes produced by [`Self::validate`] to the table and the hardware.
    pub fn commit(&mut self, writes: &[RegisterWrite], regs: &dyn RegisterBlock) {
        for write in writes {
            self.states[write.client.index()] = write.state;
            regs.write(write.client.register(), write.state.register_value());
        }
        TranslationCache::new(regs).barrier();
    }

    /// Moves every client of `group` into `asid`, or nothing at all.
    ///
    /// `prepare` runs between validation and the client writes, and only when the
    /// bind is going to happen. It is where the ASID's directory pointer is programmed.
    pub fn bind_group(
        &mut self,
        group: &ClientGroup,
        asid: Asid,
        regs: &dyn RegisterBlock,
        prepare: impl FnOnce(),
    ) -> Result<(), BindError> {
        let writes = self.validate(group, asid)?;
        prepare();
        self.commit(&writes, regs);
        Ok(())
    }

    /// Disables every client of `group`.
    pub fn unbind_group(&mut self, group: &ClientGroup, regs: &dyn RegisterBlock) {
        let writes = group
            .clients
            .iter()
            .map(|&client| RegisterWrite {
                client,
                state: ClientState::Disabled,
            })
            .collect::<Vec<_>>();
        self.commit(&writes, regs);
    }

    /// Writes every recorded state back to the hardware.
    pub fn restore(&self, regs: &dyn RegisterBlock) {
        for client in HardwareClient::ALL {
            regs.write(client.register(), self.state(client).register_value());
        }
    }
}
