use super::slab::BucketStats;
use core::fmt;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::memory::HEAP_BUCKET_COUNT;

#[derive(Default)]
pub(super) struct Counters {
    allocated: AtomicUsize,
    freed: AtomicUsize,
    large: AtomicUsize,
}

impl Counters {
    pub const fn new() -> Self {
        Self {
            allocated: AtomicUsize::new(0),
            freed: AtomicUsize::new(0),
            large: AtomicUsize::new(0),
        }
    }

    pub fn allocated(&self, bytes: usize) {
        self.allocated.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn freed(&self, bytes: usize) {
        self.freed.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn large_allocated(&self, bytes: usize) {
        self.large.fetch_add(1, Ordering::Relaxed);
        self.allocated(bytes);
    }

    pub fn large_freed(&self, bytes: usize) {
        self.large.fetch_sub(1, Ordering::Relaxed);
        self.freed(bytes);
    }

    pub fn total_allocated(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }

    pub fn total_freed(&self) -> usize {
        self.freed.load(Ordering::Relaxed)
    }

    pub fn large_allocations(&self) -> usize {
        self.large.load(Ordering::Relaxed)
    }
}

/// Point-in-time view of the heap.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct HeapStats {
    /// Bytes handed out since boot: chunk sizes plus large allocation pages.
    pub total_allocated: usize,
    pub total_freed: usize,
    pub buckets: [BucketStats; HEAP_BUCKET_COUNT],
    /// Live large allocations.
    pub large_allocations: usize,
    pub early_used: usize,
    pub early_capacity: usize,
}

impl HeapStats {
    #[must_use]
    pub const fn used(&self) -> usize {
        self.total_allocated - self.total_freed
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "heap: {} bytes in use ({} allocated, {} freed), {} large",
            self.used(),
            self.total_allocated,
            self.total_freed,
            self.large_allocations
        )?;
        for b in &self.buckets {
            writeln!(
                f,
                "  {:>4}: {:>5}/{:<5} chunks, {} pages",
                b.chunk_size, b.in_use, b.capacity, b.pages
            )?;
        }
        write!(f, "  early: {}/{} bytes", self.early_used, self.early_capacity)
    }
}
