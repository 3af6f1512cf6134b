//! # Kernel Heap
//!
//! Three tiers behind one entry point:
//!
//! | Tier      | Serves                              | Backing                         |
//! |-----------|-------------------------------------|---------------------------------|
//! | Bootstrap | everything before [`KernelHeap::initialize`] | static early heap, bump, never freed |
//! | Bucket    | `max(size, align) <= 1024`          | 4 KiB slab pages, `8 << i` byte chunks |
//! | Large     | everything bigger                   | `ceil(size / 4096) + 1` pages, header first |
//!
//! `free` tells the tiers apart by address alone: early-heap pointers are
//! ignored, page-aligned pointers are large allocations, anything else is a
//! bucket chunk whose page header names the bucket.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──bootstrap()──► Bootstrapping ──initialize()──► Ready
//! ```

mod early;
mod large;
mod slab;
mod stats;

pub use slab::BucketStats;
pub use stats::HeapStats;

use core::alloc::{GlobalAlloc, Layout};
use core::ptr::{self, NonNull, null_mut};
use core::sync::atomic::{AtomicU8, Ordering};
use early::EarlyHeap;
use kernel_info::memory::{HEAP_BUCKET_COUNT, PAGE_SIZE};
use log::{error, info, trace, warn};
use slab::Bucket;
use stats::Counters;

#[allow(clippy::cast_possible_truncation)]
pub(crate) const PAGE: usize = PAGE_SIZE as usize;

/// Source of whole, zero-filled, directly mapped pages.
pub trait PageProvider {
    /// `count` contiguous zeroed pages, page aligned.
    fn allocate_pages(&self, count: usize) -> Option<NonNull<u8>>;

    /// # Safety
    /// `ptr` and `count` must describe one earlier
    /// [`allocate_pages`](Self::allocate_pages) result.
    unsafe fn free_pages(&self, ptr: NonNull<u8>, count: usize);
}

impl<T: PageProvider> PageProvider for &T {
    #[inline]
    fn allocate_pages(&self, count: usize) -> Option<NonNull<u8>> {
        (**self).allocate_pages(count)
    }

    #[inline]
    unsafe fn free_pages(&self, ptr: NonNull<u8>, count: usize) {
        unsafe { (**self).free_pages(ptr, count) }
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("kernel heap is already {0}")]
    InvalidState(&'static str),
    #[error("early heap region is empty")]
    EmptyRegion,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Phase {
    Uninitialized = 0,
    Bootstrapping = 1,
    Ready = 2,
}

impl Phase {
    const fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Uninitialized,
            1 => Self::Bootstrapping,
            _ => Self::Ready,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Bootstrapping => "bootstrapping",
            Self::Ready => "ready",
        }
    }
}

/// The general-purpose kernel allocator.
pub struct KernelHeap<P: PageProvider> {
    provider: P,
    phase: AtomicU8,
    early: EarlyHeap,
    buckets: [Bucket; HEAP_BUCKET_COUNT],
    counters: Counters,
}

impl<P: PageProvider> KernelHeap<P> {
    pub const fn new(provider: P) -> Self {
        Self {
            provider,
            phase: AtomicU8::new(Phase::Uninitialized as u8),
            early: EarlyHeap::new(),
            buckets: [const { Bucket::new() }; HEAP_BUCKET_COUNT],
            counters: Counters::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn advance(&self, from: Phase, to: Phase) -> Result<(), HeapError> {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|current| HeapError::InvalidState(Phase::from_u8(current).as_str()))
    }

    /// Serve allocations from `region` until [`initialize`](Self::initialize).
    ///
    /// # Errors
    /// [`HeapError::EmptyRegion`], or [`HeapError::InvalidState`] unless
    /// uninitialized.
    pub fn bootstrap(&self, region: &'static mut [u8]) -> Result<(), HeapError> {
        if region.is_empty() {
            return Err(HeapError::EmptyRegion);
        }
        if self.phase() != Phase::Uninitialized {
            return Err(HeapError::InvalidState(self.phase().as_str()));
        }
        let len = region.len();
        self.early.set_region(region);
        self.advance(Phase::Uninitialized, Phase::Bootstrapping)?;
        info!("heap: bootstrapping with {} KiB early heap", len / 1024);
        Ok(())
    }

    /// Switch to the bucket and large tiers. The page provider must be able
    /// to serve from here on.
    ///
    /// # Errors
    /// [`HeapError::InvalidState`] if already ready.
    pub fn initialize(&self) -> Result<(), HeapError> {
        self.advance(Phase::Bootstrapping, Phase::Ready)
            .or_else(|_| self.advance(Phase::Uninitialized, Phase::Ready))?;
        info!(
            "heap: ready, {} bytes of early heap used",
            self.early.used()
        );
        Ok(())
    }

    /// `size` bytes aligned to `align`, or null.
    ///
    /// Zero-sized requests get the smallest chunk.
    pub fn allocate(&self, size: usize, align: usize) -> *mut u8 {
        if !align.is_power_of_two() {
            warn!("heap: alignment {align} is not a power of two");
            return null_mut();
        }
        let p = match self.phase() {
            Phase::Uninitialized => {
                error!("heap: allocation of {size} bytes before bootstrap");
                None
            }
            Phase::Bootstrapping => self.early.allocate(size, align),
            Phase::Ready => self.allocate_ready(size, align),
        };
        p.map_or(null_mut(), NonNull::as_ptr)
    }

    fn allocate_ready(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        if let Some(index) = Bucket::class_for(size.max(align)) {
            let p = self.buckets[index].allocate(index, &self.provider);
            match p {
                Some(_) => self.counters.allocated(Bucket::chunk_size(index)),
                None => warn!("heap: out of pages for {size} byte chunk"),
            }
            return p;
        }
        if align > PAGE {
            warn!("heap: alignment {align} above page size refused");
            return None;
        }
        let Some((p, pages)) = large::allocate(&self.provider, size) else {
            warn!("heap: out of pages for {size} byte allocation");
            return None;
        };
        self.counters.large_allocated(pages * PAGE);
        Some(p)
    }

    /// Like [`allocate`](Self::allocate), zero-filled.
    pub fn callocate(&self, size: usize, align: usize) -> *mut u8 {
        let p = self.allocate(size, align);
        if !p.is_null() {
            // SAFETY: `p` holds at least `size` bytes.
            unsafe { ptr::write_bytes(p, 0, size) };
        }
        p
    }

    /// Release `ptr`. Null and early-heap pointers are ignored.
    ///
    /// # Panics
    /// Before the heap is ready, and on corrupted block headers.
    ///
    /// # Safety
    /// `ptr` must be null or a live allocation of this heap.
    pub unsafe fn free(&self, ptr: *mut u8) {
        let Some(p) = NonNull::new(ptr) else {
            return;
        };
        if self.early.contains(ptr) {
            trace!("heap: ignoring free of early pointer {ptr:p}");
            return;
        }
        if self.phase() != Phase::Ready {
            error!("heap: free of {ptr:p} while {}", self.phase().as_str());
            panic!("heap free of {ptr:p} before the heap is ready");
        }

        if ptr.addr() % PAGE == 0 {
            let pages = unsafe { large::free(&self.provider, p) };
            self.counters.large_freed(pages * PAGE);
        } else {
            let index = unsafe { Bucket::owner(p) };
            unsafe { self.buckets[index].free(p, index) };
            self.counters.freed(Bucket::chunk_size(index));
        }
    }

    /// Resize `ptr` to `new_size` bytes.
    ///
    /// Null allocates; a zero size frees and returns null. On failure the old
    /// block is untouched and null is returned.
    ///
    /// # Safety
    /// As for [`free`](Self::free).
    pub unsafe fn reallocate(&self, ptr: *mut u8, new_size: usize, align: usize) -> *mut u8 {
        let Some(p) = NonNull::new(ptr) else {
            return self.allocate(new_size, align);
        };
        if new_size == 0 {
            unsafe { self.free(ptr) };
            return null_mut();
        }

        let old_size = if self.early.contains(ptr) {
            unsafe { EarlyHeap::size_of(p) }
        } else if ptr.addr() % PAGE == 0 {
            if align <= PAGE && unsafe { large::resize_in_place(p, new_size) } {
                return ptr;
            }
            unsafe { large::size_of(p) }
        } else {
            let index = unsafe { Bucket::owner(p) };
            if Bucket::class_for(new_size.max(align)) == Some(index) {
                return ptr;
            }
            Bucket::chunk_size(index)
        };

        let new = self.allocate(new_size, align);
        if new.is_null() {
            return new;
        }
        // SAFETY: distinct live blocks, each at least `min` bytes.
        unsafe {
            ptr::copy_nonoverlapping(ptr, new, old_size.min(new_size));
            self.free(ptr);
        }
        new
    }

    #[must_use]
    pub fn total_allocated(&self) -> usize {
        self.counters.total_allocated()
    }

    #[must_use]
    pub fn total_freed(&self) -> usize {
        self.counters.total_freed()
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.total_allocated() - self.total_freed()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            total_allocated: self.total_allocated(),
            total_freed: self.total_freed(),
            buckets: core::array::from_fn(|i| self.buckets[i].stats(i)),
            large_allocations: self.counters.large_allocations(),
            early_used: self.early.used(),
            early_capacity: self.early.capacity(),
        }
    }
}

unsafe impl<P: PageProvider> GlobalAlloc for KernelHeap<P> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.allocate(layout.size(), layout.align())
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        self.callocate(layout.size(), layout.align())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        unsafe { self.free(ptr) }
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        unsafe { self.reallocate(ptr, new_size, layout.align()) }
    }
}
