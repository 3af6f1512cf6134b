//! # Static Heap
//!
//! The kernel-wide frame allocator and heap, the statically reserved early
//! heap they boot from, and the [`GlobalAlloc`] front the kernel binary
//! installs:
//!
//! ```rust,ignore
//! #[global_allocator]
//! static GLOBAL_ALLOCATOR: KernelAllocator = KernelAllocator;
//! ```

use crate::frame_alloc::FrameAllocator;
use crate::heap::KernelHeap;
use crate::phys_mapper::HhdmPhysMapper;
use core::alloc::{GlobalAlloc, Layout};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_info::memory::EARLY_HEAP_SIZE;

/// Early heap storage, page aligned for the bitmap and first slab pages.
#[repr(C, align(4096))]
struct EarlyHeapMem([u8; EARLY_HEAP_SIZE]);

/// Backing storage for the bootstrap tier, placed in a dedicated `.bss` section.
#[cfg_attr(target_os = "none", unsafe(link_section = ".bss.early_heap"))]
static mut EARLY_HEAP: EarlyHeapMem = EarlyHeapMem([0; EARLY_HEAP_SIZE]);

/// Set once the early heap has been handed out.
static EARLY_HEAP_TAKEN: AtomicBool = AtomicBool::new(false);

pub static FRAMES: FrameAllocator<HhdmPhysMapper> = FrameAllocator::new(HhdmPhysMapper::hhdm());

pub static HEAP: KernelHeap<&FrameAllocator<HhdmPhysMapper>> = KernelHeap::new(&FRAMES);

/// The early heap region; `None` after the first call.
pub fn early_heap_region() -> Option<&'static mut [u8]> {
    if EARLY_HEAP_TAKEN.swap(true, Ordering::AcqRel) {
        return None;
    }
    // SAFETY: the flag above hands the storage out exactly once.
    let region: &'static mut [u8] = unsafe { &mut (*(&raw mut EARLY_HEAP)).0 };
    Some(region)
}

/// The kernel's global allocator, backed by [`HEAP`].
pub struct KernelAllocator;

unsafe impl GlobalAlloc for KernelAllocator {
    /// # Safety
    /// The `GlobalAlloc` contract applies. Caller must handle a null return (OOM).
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        unsafe { HEAP.alloc(layout) }
    }

    /// # Safety
    /// The `GlobalAlloc` contract applies. `ptr` must come from this allocator.
    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        unsafe { HEAP.dealloc(ptr, layout) }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        unsafe { HEAP.alloc_zeroed(layout) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { HEAP.realloc(ptr, layout, new_size) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn early_heap_is_handed_out_once() {
        let region = early_heap_region().unwrap();
        assert_eq!(region.len(), EARLY_HEAP_SIZE);
        assert_eq!(region.as_ptr().addr() % 4096, 0);
        assert!(early_heap_region().is_none());

        // Before bring-up the global front refuses to allocate.
        let p = unsafe { KernelAllocator.alloc(Layout::new::<u64>()) };
        assert!(p.is_null());
    }
}
