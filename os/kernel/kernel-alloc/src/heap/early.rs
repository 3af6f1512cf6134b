//! Bootstrap tier: a lock-free bump allocator over the static early heap.
//!
//! Every allocation is preceded by a `usize` holding its size, so a later
//! reallocation knows how much to copy. Nothing is ever freed.

use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use log::warn;

const HEADER: usize = size_of::<usize>();

pub(super) struct EarlyHeap {
    base: AtomicPtr<u8>,
    capacity: AtomicUsize,
    used: AtomicUsize,
}

impl EarlyHeap {
    pub const fn new() -> Self {
        Self {
            base: AtomicPtr::new(ptr::null_mut()),
            capacity: AtomicUsize::new(0),
            used: AtomicUsize::new(0),
        }
    }

    /// Hand the region to the bump allocator. Called once, before any allocation.
    pub fn set_region(&self, region: &'static mut [u8]) {
        self.capacity.store(region.len(), Ordering::Relaxed);
        self.used.store(0, Ordering::Relaxed);
        self.base.store(region.as_mut_ptr(), Ordering::Release);
    }

    pub fn allocate(&self, size: usize, align: usize) -> Option<NonNull<u8>> {
        let base = self.base.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        let capacity = self.capacity.load(Ordering::Relaxed);
        let align = align.max(HEADER);

        let mut used = self.used.load(Ordering::Relaxed);
        let offset = loop {
            let offset = (base.addr() + used + HEADER).checked_next_multiple_of(align)? - base.addr();
            let end = offset.checked_add(size)?;
            if end > capacity {
                warn!("heap: early heap exhausted ({size} bytes requested, {} left)", capacity - used);
                return None;
            }
            match self
                .used
                .compare_exchange_weak(used, end, Ordering::AcqRel, Ordering::Relaxed)
            {
                Ok(_) => break offset,
                Err(current) => used = current,
            }
        };

        // SAFETY: `offset + size <= capacity`; the header slot lies between the
        // previous allocation and this one and is aligned to `HEADER`.
        unsafe {
            let p = base.add(offset);
            p.sub(HEADER).cast::<usize>().write(size);
            Some(NonNull::new_unchecked(p))
        }
    }

    #[must_use]
    pub fn contains(&self, ptr: *const u8) -> bool {
        let base = self.base.load(Ordering::Acquire);
        !base.is_null()
            && ptr.addr() >= base.addr()
            && ptr.addr() < base.addr() + self.capacity.load(Ordering::Relaxed)
    }

    /// Requested size of an allocation made here.
    ///
    /// # Safety
    /// `ptr` must have been returned by [`allocate`](Self::allocate).
    pub unsafe fn size_of(ptr: NonNull<u8>) -> usize {
        unsafe { ptr.as_ptr().sub(HEADER).cast::<usize>().read() }
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.capacity.load(Ordering::Relaxed)
    }
}
