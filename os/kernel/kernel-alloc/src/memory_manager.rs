//! # Memory Manager
//!
//! Ties the frame allocator, the heap, page maps and address spaces together:
//! boot-time bring-up in the one order that works, backed region allocation,
//! and the lazy population path the page-fault handler calls.
//!
//! ## Bring-up order
//!
//! ```text
//! heap.bootstrap(early)        bump allocation out of the static early heap
//! frames.bootstrap(map)        frames straight from the memory map
//! early_frames(frames)         caller's early page tables, stacks, ...
//! heap.allocate(bitmap bytes)  bitmap storage from the early heap
//! frames.initialize(..)        bitmap built, bootstrap runs kept
//! heap.initialize()            buckets and large tier on top of the frames
//! ```

use crate::address_space::{AddressSpace, RegionError};
use crate::fault::PageFaultInfo;
use crate::frame_alloc::{FrameAllocator, FrameError};
use crate::heap::{HeapError, KernelHeap, PageProvider};
use crate::region::{Access, Region};
use core::fmt;
use kernel_info::boot::BootMemoryInfo;
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::{AddressRange, VirtualAddress, checked_align_up};
use kernel_vmem::{FrameAlloc, MapError, PageAttributes, PageMap, PhysMapper, VirtualWindow, WindowError};
use log::{debug, error, info, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MemoryError {
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Map(#[from] MapError),
    #[error(transparent)]
    Window(#[from] WindowError),
    #[error(transparent)]
    Region(#[from] RegionError),
    #[error(transparent)]
    Heap(#[from] HeapError),
    #[error("out of physical memory")]
    OutOfMemory,
    #[error("early heap cannot hold the {0} byte frame bitmap")]
    EarlyHeapExhausted(usize),
    #[error("no region starts at {0}")]
    NotFound(VirtualAddress),
}

/// Result of [`MemoryManager::handle_page_fault`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum FaultOutcome {
    /// The region was backed and mapped; retry the access.
    Resolved(Region),
    /// No region allows the access.
    Violation(PageFaultInfo),
    /// Backing the region ran out of frames or table memory.
    OutOfMemory,
}

impl fmt::Display for FaultOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resolved(r) => write!(f, "resolved: {r}"),
            Self::Violation(info) => write!(f, "violation: {info}"),
            Self::OutOfMemory => f.write_str("out of memory"),
        }
    }
}

pub struct MemoryManager<'a, M: PhysMapper> {
    frames: &'a FrameAllocator<M>,
    window: &'a VirtualWindow,
}

impl<M: PhysMapper> MemoryManager<'static, M> {
    /// Bring up the heap and the frame allocator from the boot hand-off.
    ///
    /// # Errors
    /// The first failing step; the subsystems are left in whatever phase
    /// they reached.
    pub fn initialize<P: PageProvider>(
        frames: &'static FrameAllocator<M>,
        heap: &'static KernelHeap<P>,
        window: &'static VirtualWindow,
        boot: &BootMemoryInfo<'static>,
        early: &'static mut [u8],
    ) -> Result<Self, MemoryError> {
        Self::initialize_with(frames, heap, window, boot, early, |_| Ok(()))
    }

    /// As [`initialize`](Self::initialize), running `early_frames` while the
    /// frame allocator still bumps through the memory map. Frames taken there
    /// stay allocated once the bitmap is built.
    ///
    /// # Errors
    /// The first failing step, including an error from `early_frames`.
    pub fn initialize_with<P: PageProvider>(
        frames: &'static FrameAllocator<M>,
        heap: &'static KernelHeap<P>,
        window: &'static VirtualWindow,
        boot: &BootMemoryInfo<'static>,
        early: &'static mut [u8],
        early_frames: impl FnOnce(&FrameAllocator<M>) -> Result<(), MemoryError>,
    ) -> Result<Self, MemoryError> {
        info!(
            "mm: kernel at {} (virtual {}), direct map offset {:#x}, {:?} paging",
            boot.kernel_physical_base,
            boot.kernel_virtual_base,
            boot.higher_half_offset,
            boot.paging_mode
        );
        let map = boot.memory_map;

        heap.bootstrap(early)?;
        frames.bootstrap(map)?;
        early_frames(frames)?;

        let words = FrameAllocator::<M>::bitmap_words(&map, PAGE_SIZE)?;
        let bytes = words * size_of::<u64>();
        let storage = heap.allocate(bytes, align_of::<u64>());
        if storage.is_null() {
            error!("mm: early heap cannot hold {bytes} bitmap bytes");
            return Err(MemoryError::EarlyHeapExhausted(bytes));
        }
        // SAFETY: early heap memory is never freed or handed out twice.
        let bitmap = unsafe { core::slice::from_raw_parts_mut(storage.cast::<u64>(), words) };

        frames.initialize(map, PAGE_SIZE, bitmap)?;
        heap.initialize()?;
        info!("mm: ready");
        Ok(Self { frames, window })
    }
}

impl<'a, M: PhysMapper> MemoryManager<'a, M> {
    /// Manager over already initialized subsystems.
    pub const fn new(frames: &'a FrameAllocator<M>, window: &'a VirtualWindow) -> Self {
        Self { frames, window }
    }

    #[must_use]
    pub const fn frames(&self) -> &'a FrameAllocator<M> {
        self.frames
    }

    /// Zeroed frames mapped at fresh kernel window addresses and recorded in
    /// `space`.
    ///
    /// # Errors
    /// [`MemoryError::OutOfMemory`], window exhaustion, or the mapping and
    /// region errors. Frames are returned on every failure; window space is not.
    pub fn allocate_kernel_region<PM: PhysMapper, FA: FrameAlloc>(
        &self,
        map: &PageMap<'_, PM, FA>,
        space: &mut AddressSpace,
        bytes: u64,
        attributes: PageAttributes,
    ) -> Result<Region, MemoryError> {
        let (size, pages) = page_span(bytes)?;
        let phys = self.frames.callocate_pages(pages).ok_or(MemoryError::OutOfMemory)?;

        let result = self.window.allocate(size, 0).map_err(MemoryError::from).and_then(|virt| {
            let region = Region::backed(
                AddressRange::new(virt, size),
                phys,
                Access::from_attributes(attributes).with_user(false),
            );
            map.map_range(virt, phys, size, region.page_attributes())?;
            if let Err(e) = space.insert(region) {
                let _ = map.unmap_range(virt, size, region.page_attributes());
                return Err(e.into());
            }
            Ok(region)
        });
        match result {
            Ok(region) => {
                debug!("mm: kernel region {region}");
                Ok(region)
            }
            Err(e) => {
                warn!("mm: kernel region of {bytes} bytes failed: {e}");
                self.frames.free_pages(phys, pages);
                Err(e)
            }
        }
    }

    /// Reserve a user region without backing it; the first fault populates it.
    ///
    /// # Errors
    /// As [`AddressSpace::allocate_region`].
    pub fn reserve_user_region(
        &self,
        space: &mut AddressSpace,
        bytes: u64,
        attributes: PageAttributes,
    ) -> Result<Region, MemoryError> {
        let access = Access::from_attributes(attributes).with_user(true);
        Ok(space.allocate_region(bytes, 0, access)?)
    }

    /// Reserve, back and map a user region.
    ///
    /// # Errors
    /// Region reservation errors, [`MemoryError::OutOfMemory`], or mapping
    /// errors. Nothing stays reserved or allocated on failure.
    pub fn allocate_user_region<PM: PhysMapper, FA: FrameAlloc>(
        &self,
        map: &PageMap<'_, PM, FA>,
        space: &mut AddressSpace,
        bytes: u64,
        attributes: PageAttributes,
    ) -> Result<Region, MemoryError> {
        let region = self.reserve_user_region(space, bytes, attributes)?;
        match self.populate(map, space, region.base()) {
            Ok(region) => Ok(region),
            Err(e) => {
                space.erase(region.base());
                Err(e)
            }
        }
    }

    /// Unmap the region starting at `base`, free its frames and forget it.
    ///
    /// # Errors
    /// [`MemoryError::NotFound`] if no region starts at `base`.
    pub fn free_region<PM: PhysMapper, FA: FrameAlloc>(
        &self,
        map: &PageMap<'_, PM, FA>,
        space: &mut AddressSpace,
        base: VirtualAddress,
    ) -> Result<(), MemoryError> {
        let region = *space
            .find(base)
            .filter(|r| r.base() == base)
            .ok_or(MemoryError::NotFound(base))?;

        if let Some(phys) = region.physical_base() {
            if let Err(e) = map.unmap_range(base, region.size(), region.page_attributes()) {
                warn!("mm: freeing partially mapped region {region}: {e}");
            }
            self.frames.free_pages(phys, region.size() / PAGE_SIZE);
        }
        space.erase(base);
        debug!("mm: freed region {region}");
        Ok(())
    }

    /// Resolve a fault by backing the unbacked region around the faulting address.
    pub fn handle_page_fault<PM: PhysMapper, FA: FrameAlloc>(
        &self,
        map: &PageMap<'_, PM, FA>,
        space: &mut AddressSpace,
        info: PageFaultInfo,
    ) -> FaultOutcome {
        let Some(region) = space.find(info.address).copied() else {
            debug!("mm: {info}: no region");
            return FaultOutcome::Violation(info);
        };
        let reason = info.reason;
        let access = region.access();
        let denied = region.is_backed()
            || (reason.write() && !access.write())
            || (reason.instruction_fetch() && !access.execute())
            || (reason.user() && !access.user());
        if denied {
            debug!("mm: {info}: region {region} does not allow it");
            return FaultOutcome::Violation(info);
        }

        match self.populate(map, space, region.base()) {
            Ok(region) => FaultOutcome::Resolved(region),
            Err(MemoryError::OutOfMemory | MemoryError::Map(MapError::OutOfMemory)) => {
                warn!("mm: {info}: out of memory populating {region}");
                FaultOutcome::OutOfMemory
            }
            Err(e) => {
                error!("mm: {info}: populating {region} failed: {e}");
                FaultOutcome::Violation(info)
            }
        }
    }

    /// Back the unbacked region at `base` with zeroed frames and map it.
    fn populate<PM: PhysMapper, FA: FrameAlloc>(
        &self,
        map: &PageMap<'_, PM, FA>,
        space: &mut AddressSpace,
        base: VirtualAddress,
    ) -> Result<Region, MemoryError> {
        let region = space.find_mut(base).ok_or(MemoryError::NotFound(base))?;
        let pages = region.size() / PAGE_SIZE;
        let phys = self.frames.callocate_pages(pages).ok_or(MemoryError::OutOfMemory)?;
        if let Err(e) = map.map_range(region.base(), phys, region.size(), region.page_attributes()) {
            self.frames.free_pages(phys, pages);
            return Err(e.into());
        }
        region.set_physical_base(Some(phys));
        debug!("mm: populated {region}");
        Ok(*region)
    }
}

impl<M: PhysMapper> fmt::Debug for MemoryManager<'_, M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryManager")
            .field("frames", self.frames)
            .field("window", &self.window.range())
            .finish()
    }
}

/// Page-rounded size and page count of `bytes`.
fn page_span(bytes: u64) -> Result<(u64, u64), MemoryError> {
    if bytes == 0 {
        return Err(RegionError::ZeroSize.into());
    }
    let size = checked_align_up(bytes, PAGE_SIZE).ok_or(MemoryError::OutOfMemory)?;
    Ok((size, size / PAGE_SIZE))
}
