//! The SMMU device and the domains handed to client drivers.
//!
//! An [`SmmuDevice`] owns one [`AddressSpace`] per hardware ASID, the software copy of
//! every client ASID register and the shared guard page. Client drivers obtain a
//! [`Domain`] with [`SmmuDevice::alloc_domain`], map their buffers through it and give
//! it back with [`SmmuDevice::free_domain`].
//!
//! Locks are always taken address space first, device second.

use alloc::{sync::Arc, vec::Vec};
use core::sync::atomic::{AtomicBool, Ordering};

use crate::{
    AllocError, Asid, FrameNumber, InitError, IoVirtualAddress, MapError,
    address_space::{AddressSpace, AsState, Segment, SmmuContext},
    arch,
    client::{BindingTable, ClientGroup, ClientState, HardwareClient},
    diagnostics::Tunables,
    entry::{self, Pde, Pte},
    geometry,
    page::{Page, PageAllocator},
    registers::{self, RegisterBlock},
    tlb::TranslationCache,
};

/// The range of IOVA space the upper layers allocate buffers from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IovaWindow {
    pub base: IoVirtualAddress,
    /// Length in bytes.
    pub length: usize,
}

impl IovaWindow {
    pub fn new(base: IoVirtualAddress, length: usize) -> Self {
        Self { base, length }
    }

    /// Returns the number of pages in the window.
    pub fn page_count(&self) -> usize {
        self.length >> geometry::PAGE_SHIFT
    }

    fn is_valid(&self) -> bool {
        self.base.is_aligned(geometry::PAGE_SIZE)
            && self.length != 0
            && self.length % geometry::PAGE_SIZE == 0
            && self.base.as_usize() + self.length <= geometry::MAX_IOVA + 1
    }
}

/// Static configuration applied at bring-up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmmuConfig {
    /// Number of address spaces to manage.
    pub asid_count: usize,
    /// Page size of the CPU, which must equal the SMMU page size.
    ///
    /// Defaults to the granule the CPU is running with. Embedders that know better
    /// may override it.
    pub cpu_page_size: usize,
    /// Initial TRANSLATION_ENABLE_0..2 masks.
    pub translation_enable: [u32; 3],
    pub asid_security: u32,
    pub lowest_asid: usize,
    pub verbose: u32,
    pub signature: bool,
}

impl Default for SmmuConfig {
    fn default() -> Self {
        Self {
            asid_count: geometry::MAX_ASIDS,
            cpu_page_size: arch::cpu_page_size(),
            translation_enable: [u32::MAX; 3],
            asid_security: 0,
            lowest_asid: 0,
            verbose: 0,
            signature: false,
        }
    }
}

/// Platform resources the device is built from.
#[derive(Default)]
pub struct SmmuResources {
    /// Memory-controller register window.
    pub registers: Option<Arc<dyn RegisterBlock>>,
    /// AHB arbiter register window.
    pub ahb_arbiter: Option<Arc<dyn RegisterBlock>>,
    pub window: Option<IovaWindow>,
    pub allocator: Option<Arc<dyn PageAllocator>>,
}

/// Register state that does not survive a power transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SavedState {
    pub translation_enable: [u32; 3],
    pub asid_security: u32,
}

/// State guarded by the device lock.
pub(crate) struct DeviceState {
    pub clients: BindingTable,
    pub saved: SavedState,
}

/// One SMMU instance.
pub struct SmmuDevice {
    pub(crate) regs: Arc<dyn RegisterBlock>,
    ahb_arbiter: Arc<dyn RegisterBlock>,
    allocator: Arc<dyn PageAllocator>,
    pub(crate) window: IovaWindow,
    pub(crate) spaces: Vec<AddressSpace>,
    pub(crate) state: spin::Mutex<DeviceState>,
    pub(crate) tunables: Tunables,
    pub(crate) enabled: AtomicBool,
    guard_page: Option<Page>,
    guard_frame: FrameNumber,
}

impl SmmuDevice {
    /// Validates the platform, programs the controller and enables translation.
    pub fn global_init(config: SmmuConfig, resources: SmmuResources) -> Result<Self, InitError> {
        Self::init(config, resources).inspect_err(|err| {
            log::error!("failed to initialise SMMU: {}", err);
        })
    }

    fn init(config: SmmuConfig, resources: SmmuResources) -> Result<Self, InitError> {
        let regs = resources.registers.ok_or(InitError::MissingResource("mc"))?;
        let ahb_arbiter = resources
            .ahb_arbiter
            .ok_or(InitError::MissingResource("ahbarb"))?;
        let window = resources.window.ok_or(InitError::MissingResource("window"))?;
        let allocator = resources
            .allocator
            .ok_or(InitError::MissingResource("page allocator"))?;

        if config.cpu_page_size != geometry::PAGE_SIZE {
            return Err(InitError::PageSizeMismatch {
                cpu: config.cpu_page_size,
                smmu: geometry::PAGE_SIZE,
            });
        }
        if config.asid_count == 0 || config.asid_count > geometry::MAX_ASIDS {
            return Err(InitError::InvalidAsidCount(config.asid_count));
        }
        if !window.is_valid() {
            return Err(InitError::InvalidWindow);
        }

        let guard_page = allocator.allocate().map_err(|_| InitError::OutOfMemory)?;
        let guard_frame = guard_page.frame();

        let device = Self {
            regs,
            ahb_arbiter,
            allocator,
            window,
            spaces: (0..config.asid_count).map(AddressSpace::new).collect(),
            state: spin::Mutex::new(DeviceState {
                clients: BindingTable::new(),
                saved: SavedState {
                    translation_enable: config.translation_enable,
                    asid_security: config.asid_security,
                },
            }),
            tunables: Tunables::new(config.asid_count, config.lowest_asid, config.verbose, config.signature),
            enabled: AtomicBool::new(false),
            guard_page: Some(guard_page),
            guard_frame,
        };

        device.setup_registers();
        device.enabled.store(true, Ordering::SeqCst);
        log::info!(
            "initialised SMMU: window {}+{:#x}, {} address spaces",
            device.window.base,
            device.window.length,
            device.spaces.len()
        );
        Ok(device)
    }

    /// Returns the number of address spaces.
    pub fn asid_count(&self) -> usize {
        self.spaces.len()
    }

    /// Returns the IOVA window.
    pub fn window(&self) -> IovaWindow {
        self.window
    }

    /// Returns whether translation is enabled.
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Returns the frame every domain maps at IOVA zero.
    pub fn guard_frame(&self) -> FrameNumber {
        self.guard_frame
    }

    /// Returns the recorded ASID register state of `client`.
    pub fn client_state(&self, client: HardwareClient) -> ClientState {
        self.state.lock().clients.state(client)
    }

    pub(crate) fn context(&self) -> SmmuContext<'_> {
        SmmuContext {
            allocator: &*self.allocator,
            regs: &*self.regs,
            verbosity: self.tunables.verbose(),
            signature: self.tunables.signature(),
        }
    }

    fn cache(&self) -> TranslationCache<'_> {
        TranslationCache::new(&*self.regs)
    }

    /// Programs every register from software state.
    ///
    /// Run at bring-up and on resume, when the hardware has forgotten everything.
    pub fn setup_registers(&self) {
        // Directory pointers are gathered first so no AS lock is taken under the device lock.
        let pointers = self
            .spaces
            .iter()
            .map(|space| {
                let state = space.lock();
                state.directory.as_ref().map_or(registers::PTB_DATA_RESET_VAL, |dir| {
                    entry::directory_pointer(dir.physical_address(), state.attributes.directory)
                })
            })
            .collect::<Vec<_>>();

        let device = self.state.lock();
        for (asid, pointer) in pointers.into_iter().enumerate() {
            self.regs.write(registers::PTB_ASID, asid as u32);
            self.regs.write(registers::PTB_DATA, pointer);
        }

        device.clients.restore(&*self.regs);

        let saved = device.saved;
        self.regs
            .write(registers::TRANSLATION_ENABLE_0, saved.translation_enable[0]);
        self.regs
            .write(registers::TRANSLATION_ENABLE_1, saved.translation_enable[1]);
        self.regs
            .write(registers::TRANSLATION_ENABLE_2, saved.translation_enable[2]);
        self.regs.write(registers::ASID_SECURITY, saved.asid_security);
        self.regs
            .write(registers::TLB_CONFIG, registers::TLB_CONFIG_RESET_VAL);
        self.regs
            .write(registers::PTC_CONFIG, registers::PTC_CONFIG_RESET_VAL);

        let cache = self.cache();
        cache.flush_everything();
        self.regs.write(registers::CONFIG, registers::CONFIG_ENABLE);
        cache.barrier();

        let xbar = self.ahb_arbiter.read(registers::AHB_XBAR_CTRL);
        self.ahb_arbiter.write(
            registers::AHB_XBAR_CTRL,
            xbar | registers::AHB_XBAR_CTRL_SMMU_INIT_DONE,
        );
    }

    /// Points the hardware page-table base of `asid` at `pointer`. Device lock held.
    pub(crate) fn program_directory(&self, asid: Asid, pointer: u32) {
        self.regs.write(registers::PTB_ASID, asid as u32);
        self.regs.write(registers::PTB_DATA, pointer);
        self.cache().barrier();
    }

    /// Claims a free address space for the client group of the device `name`.
    ///
    /// Address spaces are scanned upwards from the `lowest_asid` tunable. The first
    /// unbound one gets a page directory, has every client of the group switched into
    /// it and the guard page mapped at IOVA zero.
    #[must_use = "a domain must be given back with `free_domain`"]
    pub fn alloc_domain(&self, name: &str) -> Result<Domain<'_>, AllocError> {
        let ctx = self.context();
        if ctx.verbosity > 0 {
            log::debug!("alloc domain for {}", name);
        }

        for space in &self.spaces[self.tunables.lowest_asid()..] {
            let state = space.lock();
            if state.group.is_some() {
                continue;
            }
            return self.claim(space, state, name, &ctx);
        }

        log::error!("no free address space for {}", name);
        Err(AllocError::NoFreeAddressSpace)
    }

    fn claim(
        &self,
        space: &AddressSpace,
        mut state: spin::MutexGuard<'_, AsState>,
        name: &str,
        ctx: &SmmuContext<'_>,
    ) -> Result<Domain<'_>, AllocError> {
        let asid = space.asid();
        let fresh = state.ensure_directory(ctx, asid)?;

        let bound = ClientGroup::lookup(name)
            .ok_or_else(|| {
                log::error!("no SMMU client group for {}", name);
                AllocError::UnknownClient
            })
            .and_then(|group| {
                self.bind(&state, asid, group)?;
                Ok(group)
            });
        let group = match bound {
            Ok(group) => group,
            Err(err) => {
                if fresh {
                    // SAFETY: PTB_DATA was never pointed at the new directory.
                    unsafe { state.release_directory(&*self.allocator) };
                }
                return Err(err);
            }
        };
        state.group = Some(group);
        drop(state);

        let domain = Domain { device: self, asid };
        let guard = SmmuContext {
            signature: false,
            ..*ctx
        };
        if let Err(err) = space.map_single_frame(&guard, IoVirtualAddress::new(0), self.guard_frame) {
            log::error!("failed to map guard page for ASID {}: {}", asid, err);
            self.free_domain(domain);
            return Err(AllocError::OutOfMemory);
        }

        if ctx.verbosity > 0 {
            log::debug!("domain for {} bound to ASID {}", group, asid);
        }
        Ok(domain)
    }

    /// Points `asid` at its directory and moves `group` into it, or changes nothing.
    fn bind(&self, state: &AsState, asid: Asid, group: &ClientGroup) -> Result<(), AllocError> {
        let pointer = state.directory.as_ref().map_or(registers::PTB_DATA_RESET_VAL, |dir| {
            entry::directory_pointer(dir.physical_address(), state.attributes.directory)
        });

        let mut device = self.state.lock();
        device
            .clients
            .bind_group(group, asid, &*self.regs, || self.program_directory(asid, pointer))
            .inspect_err(|err| {
                log::error!("cannot bind {} to ASID {}: {}", group, asid, err);
            })?;
        Ok(())
    }

    /// Detaches the domain's clients and frees its page directory.
    pub fn free_domain(&self, domain: Domain<'_>) {
        if self.tunables.verbose() > 0 {
            log::debug!("free domain ASID {}", domain.asid);
        }
        self.release_space(&self.spaces[domain.asid]);
    }

    fn release_space(&self, space: &AddressSpace) {
        let mut state = space.lock();
        let group = state.group.take();
        let has_directory = state.directory.is_some();

        {
            let mut device = self.state.lock();
            if let Some(group) = group {
                device.clients.unbind_group(group, &*self.regs);
            }
            if has_directory {
                self.program_directory(space.asid(), registers::PTB_DATA_RESET_VAL);
                let cache = self.cache();
                cache.ptc_flush_all();
                cache.tlb_invalidate_asid(space.asid());
            }
        }

        // SAFETY: PTB_DATA of this ASID was reset and its cached walks dropped above.
        unsafe { state.release_directory(&*self.allocator) };
    }

    /// Records the registers that are lost across a power transition.
    pub fn suspend(&self) -> SavedState {
        let mut device = self.state.lock();
        device.saved = SavedState {
            translation_enable: [
                self.regs.read(registers::TRANSLATION_ENABLE_0),
                self.regs.read(registers::TRANSLATION_ENABLE_1),
                self.regs.read(registers::TRANSLATION_ENABLE_2),
            ],
            asid_security: self.regs.read(registers::ASID_SECURITY),
        };
        device.saved
    }

    /// Reprograms the controller after a power transition.
    pub fn resume(&self, saved: SavedState) {
        if !self.is_enabled() {
            return;
        }
        self.state.lock().saved = saved;
        self.setup_registers();
    }
}

impl Drop for SmmuDevice {
    fn drop(&mut self) {
        if self.enabled.swap(false, Ordering::SeqCst) {
            self.regs.write(registers::CONFIG, registers::CONFIG_DISABLE);
            self.cache().barrier();
        }
        for space in &self.spaces {
            self.release_space(space);
        }
        if let Some(page) = self.guard_page.take() {
            // SAFETY: Every directory that could map the guard page has been released.
            unsafe { self.allocator.free(page) };
        }
    }
}

impl core::fmt::Debug for SmmuDevice {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SmmuDevice")
            .field("window", &self.window)
            .field("spaces", &self.spaces)
            .field("enabled", &self.is_enabled())
            .finish_non_exhaustive()
    }
}

/// An address space bound to one client group.
///
/// Give it back with [`SmmuDevice::free_domain`]; dropping it leaves the address space
/// claimed until the device itself is dropped.
#[derive(Debug)]
#[must_use = "dropping a domain leaves its address space claimed"]
pub struct Domain<'d> {
    device: &'d SmmuDevice,
    asid: Asid,
}

impl Domain<'_> {
    pub fn asid(&self) -> Asid {
        self.asid
    }

    fn space(&self) -> &AddressSpace {
        &self.device.spaces[self.asid]
    }

    /// Returns the client group translated through this domain.
    pub fn group(&self) -> Option<&'static ClientGroup> {
        self.space().bound_group()
    }

    /// Maps `segments` back to back starting at `iova`.
    pub fn map(&self, iova: IoVirtualAddress, segments: &[Segment<'_>]) -> Result<(), MapError> {
        self.space().map(&self.device.context(), iova, segments)
    }

    /// Maps one page at `iova` to `frame`.
    pub fn map_single_frame(&self, iova: IoVirtualAddress, frame: FrameNumber) -> Result<(), MapError> {
        self.space()
            .map_single_frame(&self.device.context(), iova, frame)
    }

    /// Unmaps `length` bytes at `iova`.
    pub fn unmap(&self, iova: IoVirtualAddress, length: usize, decommit: bool) {
        self.space()
            .unmap(&self.device.context(), iova, length, decommit);
    }

    /// Unmaps a range mapped from `segments`, releasing every page's pin.
    pub fn unmap_segments(&self, iova: IoVirtualAddress, segments: &[Segment<'_>], decommit: bool) {
        self.space()
            .unmap_segments(&self.device.context(), iova, segments, decommit);
    }

    /// Returns directory slot `index`.
    pub fn pde(&self, index: usize) -> Option<Pde> {
        self.space().pde(index)
    }

    /// Returns the PTE translating `iova`.
    pub fn pte(&self, iova: IoVirtualAddress) -> Option<Pte> {
        self.space().pte(iova)
    }

    /// Returns the number of present PTEs under directory slot `index`.
    pub fn present_entries(&self, index: usize) -> usize {
        self.space().present_entries(index)
    }
}
