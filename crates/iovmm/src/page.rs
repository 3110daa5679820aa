//! Physical pages holding translation tables.
//!
//! A [`Page`] is an owned handle to one 4 KiB physical page that the CPU can reach. The
//! page directory owns its directory page and every page table it links in; pages are
//! never shared between two owners and are returned to their [`PageAllocator`]
//! explicitly once the hardware can no longer observe them.

use core::ptr::NonNull;

use crate::{AllocError, FrameNumber, PhysicalAddress, arch, geometry};

/// Number of 32-bit words in a page.
const WORDS_PER_PAGE: usize = geometry::PAGE_SIZE / geometry::ENTRY_SIZE;

/// An exclusively owned physical page, viewed as 1024 32-bit entries.
pub struct Page {
    phys: PhysicalAddress,
    ptr: NonNull<u32>,
}

// SAFETY: A `Page` is the unique handle to its memory; moving it between threads moves
// ownership of the memory with it.
unsafe impl Send for Page {}
// SAFETY: Shared references only permit reads through `entries`.
unsafe impl Sync for Page {}

impl Page {
    /// Creates a page handle.
    ///
    /// # Safety
    ///
    /// `ptr` must be valid for reads and writes of 4 KiB, must not be aliased by any other
    /// `Page`, and must be the CPU view of the physical page at `phys`.
    pub unsafe fn from_raw(phys: PhysicalAddress, ptr: NonNull<u32>) -> Self {
        debug_assert!(
            phys.is_aligned(geometry::PAGE_SIZE),
            "physical page must be page-aligned"
        );
        Self { phys, ptr }
    }

    /// Returns the physical address of the page.
    pub fn physical_address(&self) -> PhysicalAddress {
        self.phys
    }

    /// Returns the frame number of the page.
    pub fn frame(&self) -> FrameNumber {
        self.phys.frame_number()
    }

    /// Returns the CPU pointer to the first word of the page.
    pub fn as_ptr(&self) -> *const u32 {
        self.ptr.as_ptr()
    }

    /// Returns the page contents as entries.
    pub fn entries(&self) -> &[u32; WORDS_PER_PAGE] {
        // SAFETY: `from_raw` guarantees 4 KiB of valid, unaliased memory.
        unsafe { &*(self.ptr.as_ptr() as *const [u32; WORDS_PER_PAGE]) }
    }

    /// Returns the page contents as mutable entries.
    pub fn entries_mut(&mut self) -> &mut [u32; WORDS_PER_PAGE] {
        // SAFETY: `from_raw` guarantees 4 KiB of valid, unaliased memory, and `&mut self`
        // makes this the only live view.
        unsafe { &mut *(self.ptr.as_ptr() as *mut [u32; WORDS_PER_PAGE]) }
    }

    /// Returns the physical address of the entry at `index`.
    pub fn entry_address(&self, index: usize) -> PhysicalAddress {
        assert!(index < WORDS_PER_PAGE, "entry index out of bounds");
        self.phys + index * geometry::ENTRY_SIZE
    }

    /// Flushes `count` entries starting at `index` out of the CPU data cache.
    pub fn flush(&self, index: usize, count: usize) {
        assert!(index + count <= WORDS_PER_PAGE, "flush range out of bounds");
        // SAFETY: The range was checked against the page bounds above.
        let start = unsafe { self.ptr.as_ptr().add(index) };
        arch::flush_dcache_range(start as *const u8, count * geometry::ENTRY_SIZE);
    }
}

impl core::fmt::Debug for Page {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "Page({:#x})", self.phys.as_usize())
    }
}

/// Source of physical pages for page directories, page tables and the guard page.
pub trait PageAllocator: Send + Sync {
    /// Allocates one zero-filled page.
    fn allocate(&self) -> Result<Page, AllocError>;

    /// Returns a page to the allocator.
    ///
    /// # Safety
    ///
    /// `page` must have come from this allocator, and no translation table reachable by
    /// the hardware may still reference it.
    unsafe fn free(&self, page: Page);

    /// Returns a CPU pointer to an arbitrary frame, if the allocator can reach it.
    fn frame_ptr(&self, frame: FrameNumber) -> Option<NonNull<u32>>;
}

/// Page allocator backed by the kernel heap, addressed through a fixed direct map.
///
/// Physical addresses are derived by subtracting `direct_map_offset` from the CPU
/// address of each page.
pub struct DirectMapAllocator {
    direct_map_offset: usize,
}

impl DirectMapAllocator {
    /// Creates a new allocator for a direct map at the given offset.
    pub const fn new(direct_map_offset: usize) -> Self {
        Self { direct_map_offset }
    }

    fn layout() -> core::alloc::Layout {
        // SAFETY: PAGE_SIZE is a non-zero power of two.
        unsafe { core::alloc::Layout::from_size_align_unchecked(geometry::PAGE_SIZE, geometry::PAGE_SIZE) }
    }
}

impl PageAllocator for DirectMapAllocator {
    fn allocate(&self) -> Result<Page, AllocError> {
        // SAFETY: The layout has a non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(Self::layout()) } as *mut u32;
        let ptr = NonNull::new(raw).ok_or(AllocError::OutOfMemory)?;

        let phys = (raw as usize).wrapping_sub(self.direct_map_offset);
        if phys > geometry::MAX_PHYSICAL_ADDRESS {
            log::error!("heap page {:p} is not reachable by the SMMU", raw);
            // SAFETY: Allocated above with the same layout.
            unsafe { alloc::alloc::dealloc(raw as *mut u8, Self::layout()) };
            return Err(AllocError::OutOfMemory);
        }

        // SAFETY: Freshly allocated, page-sized, page-aligned and unaliased.
        Ok(unsafe { Page::from_raw(PhysicalAddress::new(phys), ptr) })
    }

    unsafe fn free(&self, page: Page) {
        // SAFETY: The caller guarantees the page came from `allocate`.
        unsafe { alloc::alloc::dealloc(page.ptr.as_ptr() as *mut u8, Self::layout()) };
    }

    fn frame_ptr(&self, frame: FrameNumber) -> Option<NonNull<u32>> {
        NonNull::new(frame.start().as_usize().wrapping_add(self.direct_map_offset) as *mut u32)
    }
}

#[cfg(any(test, feature = "software-emulation"))]
pub use emulated::EmulatedMemory;

#[cfg(any(test, feature = "software-emulation"))]
mod emulated {
    use alloc::{boxed::Box, vec::Vec};
    use core::cell::UnsafeCell;
    use core::ptr::NonNull;
    use core::sync::atomic::{AtomicUsize, Ordering};

    use super::{Page, PageAllocator, WORDS_PER_PAGE};
    use crate::{AllocError, FrameNumber, PhysicalAddress, geometry};

    /// A bounded pool of emulated physical pages.
    ///
    /// Pages receive synthetic physical addresses starting at `base`. An optional
    /// allocation budget lets tests inject out-of-memory failures at a chosen point.
    pub struct EmulatedMemory {
        base: PhysicalAddress,
        frames: Box<[UnsafeCell<[u32; WORDS_PER_PAGE]>]>,
        free: spin::Mutex<Vec<usize>>,
        budget: AtomicUsize,
    }

    // SAFETY: Each frame is reachable through at most one `Page` at a time; the free list
    // is protected by its own lock.
    unsafe impl Sync for EmulatedMemory {}

    impl EmulatedMemory {
        /// Creates a pool of `pages` pages whose first page lives at `base`.
        pub fn new(base: PhysicalAddress, pages: usize) -> Self {
            assert!(
                base.is_aligned(geometry::PAGE_SIZE),
                "emulated memory base must be page-aligned"
            );
            assert!(
                base.as_usize() + pages * geometry::PAGE_SIZE - 1 <= geometry::MAX_PHYSICAL_ADDRESS,
                "emulated memory exceeds the physical address width"
            );

            let frames = (0..pages)
                .map(|_| UnsafeCell::new([0u32; WORDS_PER_PAGE]))
                .collect::<Vec<_>>()
                .into_boxed_slice();
            // Hand out low addresses first.
            let free = (0..pages).rev().collect();

            Self {
                base,
                frames,
                free: spin::Mutex::new(free),
                budget: AtomicUsize::new(usize::MAX),
            }
        }

        /// Limits the number of further successful allocations. `None` removes the limit.
        pub fn set_allocation_budget(&self, budget: Option<usize>) {
            self.budget
                .store(budget.unwrap_or(usize::MAX), Ordering::SeqCst);
        }

        /// Returns the number of pages currently handed out.
        pub fn allocated_pages(&self) -> usize {
            self.frames.len() - self.free.lock().len()
        }

        /// Returns the frame of the page at `index` within the pool.
        pub fn frame_at(&self, index: usize) -> FrameNumber {
            assert!(index < self.frames.len(), "page index out of bounds");
            (self.base + index * geometry::PAGE_SIZE).frame_number()
        }

        /// Reads one 32-bit word of emulated physical memory.
        pub fn read_word(&self, addr: PhysicalAddress) -> u32 {
            let index = self.index_of(addr.frame_number()).expect("address outside emulated memory");
            let word = (addr.as_usize() % geometry::PAGE_SIZE) / geometry::ENTRY_SIZE;
            // SAFETY: Reads of plain integers; concurrent writers only exist in tests that
            // synchronise before inspecting.
            unsafe { (*self.frames[index].get())[word] }
        }

        fn index_of(&self, frame: FrameNumber) -> Option<usize> {
            let first = self.base.frame_number();
            if frame < first {
                return None;
            }
            let index = frame - first;
            (index < self.frames.len()).then_some(index)
        }
    }

    impl PageAllocator for EmulatedMemory {
        fn allocate(&self) -> Result<Page, AllocError> {
            let budget = self.budget.load(Ordering::SeqCst);
            if budget == 0 {
                return Err(AllocError::OutOfMemory);
            }

            let index = self.free.lock().pop().ok_or(AllocError::OutOfMemory)?;
            if budget != usize::MAX {
                self.budget.fetch_sub(1, Ordering::SeqCst);
            }

            let cell = &self.frames[index];
            // SAFETY: The index was just taken off the free list, so nothing else views it.
            unsafe { (*cell.get()).fill(0) };
            let ptr = NonNull::new(cell.get() as *mut u32).ok_or(AllocError::OutOfMemory)?;
            let phys = self.base + index * geometry::PAGE_SIZE;

            // SAFETY: The frame is page-sized and exclusively owned by the new handle.
            Ok(unsafe { Page::from_raw(phys, ptr) })
        }

        unsafe fn free(&self, page: Page) {
            let index = self
                .index_of(page.frame())
                .expect("page does not belong to this pool");
            let mut free = self.free.lock();
            assert!(!free.contains(&index), "double free of emulated page");
            free.push(index);
        }

        fn frame_ptr(&self, frame: FrameNumber) -> Option<NonNull<u32>> {
            let index = self.index_of(frame)?;
            NonNull::new(self.frames[index].get() as *mut u32)
        }
    }
}
