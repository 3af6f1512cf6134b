//! # Virtual Memory Support
//!
//! x86-64 page maps for the kernel and for user address spaces.
//!
//! ## What you get
//! - [`PageMap`]: one PML4-rooted tree of tables with map/unmap/remap,
//!   range operations that roll back on failure, translation and teardown.
//! - [`PageAttributes`] and [`CachingMode`]: the architecture-neutral
//!   description of a mapping, encoded into [`PageTableEntry`] leaves.
//! - [`VirtualWindow`]: bump allocation of kernel virtual space for device
//!   and kernel-region mappings.
//! - The seams a page map needs from the rest of the kernel: [`FrameAlloc`]
//!   for table frames and [`PhysMapper`] to reach them.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! ```
//!
//! ```text
//!  PML4  →  PDPT  →  PD  →  PT  →  Physical Page
//!            │        │        └───► PTE          → 4 KiB page
//!            │        └────────────► PDE, PS=1    → 2 MiB page
//!            └─────────────────────► PDPTE, PS=1  → 1 GiB page
//! ```
//!
//! PML4 entries `256..512` form the kernel half. The kernel page map
//! allocates all of them up front, so every user page map can copy them and
//! later kernel mappings show up everywhere without touching user roots.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

pub mod arch;
mod attributes;
mod entry;
mod page_map;
mod table;
mod window;

pub use crate::attributes::{CachingMode, PAT_MSR_VALUE, PageAttributes};
pub use crate::entry::PageTableEntry;
pub use crate::page_map::{MapError, MapKind, PageMap, Translation};
pub use crate::table::{Level, PageTable};
pub use crate::window::{VirtualWindow, WindowError};

/// Re-export constants as info module.
pub use kernel_info::memory as info;

use kernel_memory_addresses::{AddressRange, PhysicalAddress};

/// Source of **physical** 4 KiB frames for page tables.
///
/// Returned frames must be 4 KiB aligned and reachable through the
/// [`PhysMapper`] used alongside. Contents need not be zeroed.
pub trait FrameAlloc {
    /// `None` on out-of-memory.
    fn allocate_frame(&self) -> Option<PhysicalAddress>;

    /// Return a frame obtained from [`allocate_frame`](Self::allocate_frame).
    fn free_frame(&self, frame: PhysicalAddress);
}

impl<T: FrameAlloc> FrameAlloc for &T {
    #[inline]
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        (**self).allocate_frame()
    }

    #[inline]
    fn free_frame(&self, frame: PhysicalAddress) {
        (**self).free_frame(frame);
    }
}

/// Converts physical addresses to pointers in the current address space
/// (identity map in a loader, the direct map in the kernel) and back.
pub trait PhysMapper {
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;

    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress;

    /// Typed view of the memory at `pa`.
    ///
    /// # Safety
    /// - `pa` must be mapped writable and suitably aligned for `T`.
    /// - The bytes must be a valid `T` and not aliased for `'a`.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn phys_to_mut<'a, T>(&self, pa: PhysicalAddress) -> &'a mut T {
        unsafe { &mut *self.phys_to_ptr(pa).cast::<T>() }
    }
}

impl<T: PhysMapper> PhysMapper for &T {
    #[inline]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        (**self).phys_to_ptr(pa)
    }

    #[inline]
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        (**self).ptr_to_phys(ptr)
    }
}

/// A virtual range that knows where it is backed and how it may be accessed.
pub trait MappedRegion {
    fn virtual_range(&self) -> AddressRange;

    /// Backing frames, `None` while unpopulated.
    fn physical_base(&self) -> Option<PhysicalAddress>;

    fn page_attributes(&self) -> PageAttributes;
}
