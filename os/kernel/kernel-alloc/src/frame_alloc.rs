//! # Physical Frame Allocator
//!
//! Bitmap over every page below the highest usable address (bit set = in
//! use), searched first-fit from a rotating cursor.
//!
//! ## Lifecycle
//!
//! ```text
//! Uninitialized ──bootstrap()──► Bootstrapping ──initialize()──► Ready
//!       └──────────────────────initialize()───────────────────────┘
//! ```
//!
//! * **Bootstrapping**: no bitmap exists yet. Allocations bump through the
//!   usable zones of the memory map and every carved run is remembered in a
//!   fixed table, so the bitmap built later marks them used. Nothing can be
//!   freed in this phase.
//! * **Ready**: allocations search the bitmap. Storage for the bitmap is
//!   handed in by the caller (the kernel takes it from the early heap), so it
//!   never eats into allocatable frames. A second bitmap of the same size
//!   marks the frames that were never allocatable (reserved zones, partial
//!   pages, page 0); freeing any of those is fatal.
//!
//! ## Accounting
//!
//! Total memory counts usable RAM plus the reclaimable kinds and the kernel
//! image. Everything that is not a free frame counts as used, so
//! `used + free == total` holds after every operation.

use crate::bitmap::Bitmap;
use crate::heap::PageProvider;
use core::fmt;
use core::ptr::{NonNull, write_bytes};
use kernel_info::boot::{MemoryMap, MemoryZone};
use kernel_info::memory::{MAX_BOOTSTRAP_RUNS, PAGE_SIZE};
use kernel_memory_addresses::{PhysicalAddress, align_up, div_round_up};
use kernel_sync::SpinLock;
use kernel_vmem::{FrameAlloc, PhysMapper};
use log::{debug, error, info, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum FrameError {
    #[error("page size {0:#x} is not a power of two")]
    InvalidPageSize(u64),
    #[error("memory map describes no memory")]
    OutOfMemory,
    #[error("bitmap needs {needed} words but only {provided} were provided")]
    BitmapTooSmall { needed: usize, provided: usize },
    #[error("frame allocator already {0}")]
    InvalidState(&'static str),
}

/// A run of pages carved before the bitmap existed.
#[derive(Copy, Clone, Debug, Default)]
struct Run {
    zone: usize,
    base: u64,
    pages: u64,
}

impl Run {
    const fn end(&self) -> u64 {
        self.base + self.pages * PAGE_SIZE
    }
}

struct Bootstrap {
    map: MemoryMap<'static>,
    runs: [Run; MAX_BOOTSTRAP_RUNS],
    run_count: usize,
}

impl Bootstrap {
    fn runs(&self) -> &[Run] {
        &self.runs[..self.run_count]
    }

    /// First page of `zone` not yet handed out. Page 0 is never handed out.
    fn next_free(&self, index: usize, zone: &MemoryZone) -> u64 {
        let start = align_up(zone.base.as_u64(), PAGE_SIZE).max(PAGE_SIZE);
        self.runs()
            .iter()
            .filter(|r| r.zone == index)
            .map(Run::end)
            .max()
            .unwrap_or(start)
    }

    fn allocate(&mut self, count: u64) -> Option<PhysicalAddress> {
        let bytes = count.checked_mul(PAGE_SIZE)?;
        for (index, zone) in self.map.iter().enumerate() {
            if !zone.is_usable() {
                continue;
            }
            let base = self.next_free(index, zone);
            if base.checked_add(bytes)? > zone.end().as_u64() {
                continue;
            }

            match self.runs[..self.run_count].iter_mut().rev().find(|r| r.zone == index) {
                Some(run) if run.end() == base => run.pages += count,
                _ => {
                    if self.run_count == MAX_BOOTSTRAP_RUNS {
                        warn!("pmm: bootstrap run table full");
                        return None;
                    }
                    self.runs[self.run_count] = Run { zone: index, base, pages: count };
                    self.run_count += 1;
                }
            }
            trace!("pmm: bootstrap carved {count} pages at {base:#x}");
            return Some(PhysicalAddress::new(base));
        }
        warn!("pmm: bootstrap cannot satisfy {count} pages");
        None
    }
}

struct Ready {
    bitmap: Bitmap<'static>,
    /// Set for frames outside every usable zone.
    reserved: Bitmap<'static>,
    cursor: usize,
    page_size: u64,
    total: u64,
    used: u64,
    memory_top: PhysicalAddress,
    usable_top: PhysicalAddress,
}

impl Ready {
    fn allocate(&mut self, count: u64) -> Option<PhysicalAddress> {
        let n = usize::try_from(count).ok()?;
        let bits = self.bitmap.len();
        let start = self
            .bitmap
            .find_clear_run(self.cursor, bits, n)
            .or_else(|| self.bitmap.find_clear_run(0, self.cursor, n));
        let Some(start) = start else {
            warn!(
                "pmm: no run of {count} free pages ({} bytes free)",
                self.total - self.used
            );
            return None;
        };

        self.bitmap.set_range(start, start + n);
        self.cursor = (start + n) % bits.max(1);
        self.used += count * self.page_size;
        self.check_accounting();
        Some(PhysicalAddress::new(start as u64 * self.page_size))
    }

    fn free(&mut self, base: PhysicalAddress, count: u64) {
        if base.is_null() {
            error!("pmm: attempt to free frame 0");
            panic!("freeing physical frame 0");
        }
        assert!(
            base.is_aligned_to(self.page_size),
            "freeing unaligned frame {base}"
        );
        let start = usize::try_from(base.as_u64() / self.page_size).unwrap_or(usize::MAX);
        let end = usize::try_from(count)
            .ok()
            .and_then(|n| start.checked_add(n))
            .unwrap_or(usize::MAX);
        if end > self.bitmap.len() {
            error!("pmm: free of {count} pages at {base} exceeds the bitmap");
            panic!("freeing {base} beyond the end of managed memory");
        }
        if self.reserved.any_set(start, end) {
            error!("pmm: free of {count} pages at {base} covers reserved frames");
            panic!("freeing reserved physical memory at {base}");
        }
        if !self.bitmap.all_set(start, end) {
            error!("pmm: free of {count} pages at {base} hits a free frame");
            panic!("double free of physical memory at {base}");
        }

        self.bitmap.clear_range(start, end);
        self.used -= count * self.page_size;
        self.check_accounting();
    }

    fn check_accounting(&self) {
        if self.used > self.total {
            error!("pmm: used {} exceeds total {}", self.used, self.total);
            panic!("frame accounting violated");
        }
    }
}

enum State {
    Uninitialized,
    Bootstrapping(Bootstrap),
    Ready(Ready),
}

impl State {
    const fn name(&self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Bootstrapping(_) => "bootstrapping",
            Self::Ready(_) => "ready",
        }
    }
}

/// Physical frame allocator for the whole machine.
pub struct FrameAllocator<M: PhysMapper> {
    mapper: M,
    state: SpinLock<State>,
}

impl<M: PhysMapper> FrameAllocator<M> {
    pub const fn new(mapper: M) -> Self {
        Self {
            mapper,
            state: SpinLock::named("frame-allocator", State::Uninitialized),
        }
    }

    #[inline]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }

    /// Number of `u64` words the bitmaps for `map` need at `page_size`.
    ///
    /// Covers both the occupancy and the reserved-frame bitmap.
    ///
    /// # Errors
    /// [`FrameError::InvalidPageSize`] if `page_size` is not a power of two.
    pub fn bitmap_words(map: &MemoryMap<'_>, page_size: u64) -> Result<usize, FrameError> {
        if !page_size.is_power_of_two() {
            return Err(FrameError::InvalidPageSize(page_size));
        }
        let bits = map.usable_top().as_u64() / page_size;
        usize::try_from(div_round_up(bits, 64))
            .ok()
            .and_then(|words| words.checked_mul(2))
            .ok_or(FrameError::OutOfMemory)
    }

    /// Serve page allocations straight from `map` until [`initialize`](Self::initialize).
    ///
    /// # Errors
    /// [`FrameError::InvalidState`] unless the allocator is uninitialized.
    pub fn bootstrap(&self, map: MemoryMap<'static>) -> Result<(), FrameError> {
        let mut state = self.state.lock_irq();
        if !matches!(*state, State::Uninitialized) {
            return Err(FrameError::InvalidState(state.name()));
        }
        *state = State::Bootstrapping(Bootstrap {
            map,
            runs: [Run::default(); MAX_BOOTSTRAP_RUNS],
            run_count: 0,
        });
        info!("pmm: bootstrapping from {} zones", map.len());
        Ok(())
    }

    /// Build the bitmap from `map` and switch to bitmap allocation.
    ///
    /// Runs carved while bootstrapping stay allocated.
    ///
    /// # Errors
    /// - [`FrameError::InvalidPageSize`] if `page_size` is not a power of two.
    /// - [`FrameError::OutOfMemory`] if the map is empty or has no usable top.
    /// - [`FrameError::BitmapTooSmall`] if `bitmap` is shorter than
    ///   [`bitmap_words`](Self::bitmap_words).
    /// - [`FrameError::InvalidState`] if already initialized.
    pub fn initialize(
        &self,
        map: MemoryMap<'_>,
        page_size: u64,
        bitmap: &'static mut [u64],
    ) -> Result<(), FrameError> {
        let needed = Self::bitmap_words(&map, page_size)?;
        if map.is_empty() || map.memory_top().is_null() || map.usable_top().is_null() {
            return Err(FrameError::OutOfMemory);
        }
        if bitmap.len() < needed {
            return Err(FrameError::BitmapTooSmall {
                needed,
                provided: bitmap.len(),
            });
        }

        let mut state = self.state.lock_irq();
        if matches!(*state, State::Ready(_)) {
            return Err(FrameError::InvalidState(state.name()));
        }

        let mut total = 0;
        for zone in map.iter() {
            info!(
                "pmm: {:#014x}..{:#014x} {}",
                zone.base.as_u64(),
                zone.end().as_u64(),
                zone.kind
            );
            if zone.kind.is_ram() {
                total += zone.length;
            }
        }

        let bits = usize::try_from(map.usable_top().as_u64() / page_size)
            .map_err(|_| FrameError::OutOfMemory)?;
        let (occupied, reserved) = bitmap[..needed].split_at_mut(needed / 2);
        let mut bm = Bitmap::new_full(occupied, bits);
        let mut reserved = Bitmap::new_full(reserved, bits);
        for zone in map.usable() {
            let first = div_round_up(zone.base.as_u64(), page_size).max(1);
            let last = zone.end().as_u64() / page_size;
            if first < last {
                bm.clear_range(to_index(first), to_index(last));
                reserved.clear_range(to_index(first), to_index(last));
            }
        }
        if let State::Bootstrapping(boot) = &*state {
            for run in boot.runs() {
                let first = run.base / page_size;
                let last = div_round_up(run.end(), page_size);
                bm.set_range(to_index(first), to_index(last));
                debug!("pmm: keeping bootstrap run {:#x}+{} pages", run.base, run.pages);
            }
        }

        let free = bm.count_clear() as u64 * page_size;
        let ready = Ready {
            bitmap: bm,
            reserved,
            cursor: 0,
            page_size,
            total,
            used: total.saturating_sub(free),
            memory_top: map.memory_top(),
            usable_top: map.usable_top(),
        };
        info!(
            "pmm: ready, {} KiB total, {} KiB free, {bits} pages tracked",
            ready.total / 1024,
            (ready.total - ready.used) / 1024
        );
        ready.check_accounting();
        *state = State::Ready(ready);
        Ok(())
    }

    /// Whether the bitmap is in place.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        matches!(*self.state.lock_irq(), State::Ready(_))
    }

    /// `count` contiguous pages, or `None`.
    pub fn allocate_pages(&self, count: u64) -> Option<PhysicalAddress> {
        if count == 0 {
            return None;
        }
        let mut state = self.state.lock_irq();
        match &mut *state {
            State::Ready(r) => r.allocate(count),
            State::Bootstrapping(b) => b.allocate(count),
            State::Uninitialized => {
                error!("pmm: allocation before bootstrap");
                None
            }
        }
    }

    /// Like [`allocate_pages`](Self::allocate_pages), zero-filled through the
    /// direct map.
    pub fn callocate_pages(&self, count: u64) -> Option<PhysicalAddress> {
        let base = self.allocate_pages(count)?;
        let bytes = usize::try_from(count * self.page_size()).ok()?;
        // SAFETY: the pages were just allocated and are reachable through the mapper.
        unsafe { write_bytes(self.mapper.phys_to_ptr(base), 0, bytes) };
        Some(base)
    }

    /// Return `count` pages starting at `base`.
    ///
    /// # Panics
    /// Before the bitmap is ready, for frame 0, unaligned or out-of-range
    /// bases, and for pages that are not currently allocated.
    pub fn free_pages(&self, base: PhysicalAddress, count: u64) {
        if count == 0 {
            return;
        }
        let mut state = self.state.lock_irq();
        match &mut *state {
            State::Ready(r) => r.free(base, count),
            other => {
                error!("pmm: free of {base} while {}", other.name());
                panic!("frames cannot be freed while the allocator is {}", other.name());
            }
        }
    }

    fn with_ready<R>(&self, default: R, f: impl FnOnce(&Ready) -> R) -> R {
        match &*self.state.lock_irq() {
            State::Ready(r) => f(r),
            _ => default,
        }
    }

    /// Bytes of RAM the machine has.
    #[must_use]
    pub fn total_memory(&self) -> u64 {
        self.with_ready(0, |r| r.total)
    }

    #[must_use]
    pub fn used_memory(&self) -> u64 {
        self.with_ready(0, |r| r.used)
    }

    #[must_use]
    pub fn free_memory(&self) -> u64 {
        self.with_ready(0, |r| r.total - r.used)
    }

    #[must_use]
    pub fn memory_top(&self) -> PhysicalAddress {
        self.with_ready(PhysicalAddress::zero(), |r| r.memory_top)
    }

    #[must_use]
    pub fn usable_memory_top(&self) -> PhysicalAddress {
        self.with_ready(PhysicalAddress::zero(), |r| r.usable_top)
    }

    /// Allocation granularity; the base page size until initialized.
    #[must_use]
    pub fn page_size(&self) -> u64 {
        self.with_ready(PAGE_SIZE, |r| r.page_size)
    }
}

impl<M: PhysMapper> fmt::Debug for FrameAllocator<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock_irq();
        let mut d = f.debug_struct("FrameAllocator");
        d.field("state", &state.name());
        if let State::Ready(r) = &*state {
            d.field("total", &r.total).field("used", &r.used);
        }
        d.finish_non_exhaustive()
    }
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn to_index(page: u64) -> usize {
    page as usize
}

impl<M: PhysMapper> FrameAlloc for FrameAllocator<M> {
    fn allocate_frame(&self) -> Option<PhysicalAddress> {
        self.callocate_pages(1)
    }

    fn free_frame(&self, frame: PhysicalAddress) {
        self.free_pages(frame, 1);
    }
}

impl<M: PhysMapper> PageProvider for FrameAllocator<M> {
    fn allocate_pages(&self, count: usize) -> Option<NonNull<u8>> {
        let base = self.callocate_pages(u64::try_from(count).ok()?)?;
        NonNull::new(self.mapper.phys_to_ptr(base))
    }

    unsafe fn free_pages(&self, ptr: NonNull<u8>, count: usize) {
        let base = self.mapper.ptr_to_phys(ptr.as_ptr());
        Self::free_pages(self, base, count as u64);
    }
}
