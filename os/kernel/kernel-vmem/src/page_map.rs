//! # Page Map (x86-64, PML4-rooted)
//!
//! A [`PageMap`] exclusively owns the tree of tables reachable from its root
//! and serializes every structural change behind its own lock.
//!
//! ## Highlights
//!
//! - [`PageMap::map`] walks or creates intermediate tables down to the level
//!   implied by the attributes' page size and writes one leaf.
//! - [`PageMap::map_range`] maps a span page by page and unmaps everything it
//!   did on failure, so no partial mapping is ever left behind.
//! - [`PageMap::virt2phys`] translates with a permission check and honors the
//!   in-page offset of 2 MiB / 1 GiB leaves.
//! - Dropping an owned map frees its table frames, never the leaf frames.
//!
//! ## Sharing the kernel half
//!
//! A user map copies PML4 entries `256..512` from the kernel map, so both
//! point to the same lower-level tables. Teardown of a user map therefore
//! only walks entries `0..256`, and a user map refuses to change anything in
//! the upper half ([`MapError::KernelHalf`]); those tables belong to the
//! kernel map and its lock.

use crate::arch;
use crate::attributes::PageAttributes;
use crate::entry::PageTableEntry;
use crate::table::{ENTRIES, Level, PageTable};
use crate::window::{VirtualWindow, WindowError};
use crate::{FrameAlloc, MappedRegion, PhysMapper};
use core::fmt;
use kernel_info::memory::KERNEL_PML4_START;
use kernel_memory_addresses::{PageSize, PhysicalAddress, VirtualAddress, div_round_up};
use kernel_sync::SpinLock;
use log::{debug, error, trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("address {address:#x} is not aligned to the {size} page size")]
    Unaligned { address: u64, size: PageSize },
    #[error("out of memory for page tables")]
    OutOfMemory,
    #[error("{0} is not mapped")]
    NotMapped(VirtualAddress),
    #[error("region at {0} has no backing frames")]
    Unbacked(VirtualAddress),
    #[error("range overflows the address space")]
    RangeOverflow,
    #[error("{0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("{0} lies in the kernel half shared by every user map")]
    KernelHalf(VirtualAddress),
    #[error(transparent)]
    Window(#[from] WindowError),
}

/// Which half of the PML4 a map owns.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum MapKind {
    /// Owns all 512 root entries.
    Kernel,
    /// Owns entries `0..256`; the rest is shared with the kernel map.
    User,
}

impl MapKind {
    const fn owned_root_entries(self) -> core::ops::Range<usize> {
        match self {
            Self::Kernel => 0..ENTRIES,
            Self::User => 0..KERNEL_PML4_START,
        }
    }
}

/// A resolved leaf.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    pub phys: PhysicalAddress,
    pub attributes: PageAttributes,
    pub size: PageSize,
}

pub struct PageMap<'m, M: PhysMapper, A: FrameAlloc> {
    mapper: &'m M,
    frames: &'m A,
    root: PhysicalAddress,
    kind: MapKind,
    /// Whether dropping the map frees its tables.
    owned: bool,
    lock: SpinLock<()>,
}

impl<'m, M: PhysMapper, A: FrameAlloc> PageMap<'m, M, A> {
    /// Create the kernel map with every kernel-half PML4 entry populated.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the root or a PDPT cannot be allocated;
    /// everything allocated so far is released.
    pub fn new_kernel(mapper: &'m M, frames: &'m A) -> Result<Self, MapError> {
        let map = Self::empty(mapper, frames, MapKind::Kernel)?;
        {
            // SAFETY: the root was just allocated for this map.
            let pml4 = unsafe { map.table(map.root) };
            for i in KERNEL_PML4_START..ENTRIES {
                // `map` drops on the error path and frees what is linked so far.
                let pdpt = map.alloc_table()?;
                pml4.set(i, PageTableEntry::table(pdpt, false));
            }
        }
        debug!("page map: kernel root at {}", map.root);
        Ok(map)
    }

    /// Create a user map sharing `kernel`'s upper half.
    ///
    /// # Errors
    /// [`MapError::OutOfMemory`] if the root cannot be allocated.
    pub fn new_user(kernel: &Self) -> Result<Self, MapError> {
        let map = Self::empty(kernel.mapper, kernel.frames, MapKind::User)?;
        let _guard = kernel.lock.lock();
        // SAFETY: both roots are table frames; they are distinct.
        let (src, dst) = unsafe { (kernel.table(kernel.root), map.table(map.root)) };
        for i in KERNEL_PML4_START..ENTRIES {
            dst.set(i, src.get(i));
        }
        debug!("page map: user root at {}", map.root);
        Ok(map)
    }

    /// Wrap an existing root, e.g. the one the loader left in CR3.
    ///
    /// The map does not take ownership: dropping it frees nothing.
    ///
    /// # Safety
    /// `root` must be a valid PML4 reachable through `mapper`, and nothing
    /// else may mutate the tree while this map exists.
    pub const unsafe fn from_root(
        mapper: &'m M,
        frames: &'m A,
        root: PhysicalAddress,
        kind: MapKind,
    ) -> Self {
        Self {
            mapper,
            frames,
            root,
            kind,
            owned: false,
            lock: SpinLock::named("page-map", ()),
        }
    }

    fn empty(mapper: &'m M, frames: &'m A, kind: MapKind) -> Result<Self, MapError> {
        let root = frames.allocate_frame().ok_or(MapError::OutOfMemory)?;
        let map = Self {
            mapper,
            frames,
            root,
            kind,
            owned: true,
            lock: SpinLock::named("page-map", ()),
        };
        // SAFETY: freshly allocated frame.
        unsafe { map.table(root).zero() };
        Ok(map)
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[inline]
    #[must_use]
    pub const fn kind(&self) -> MapKind {
        self.kind
    }

    /// Make this the active address space on the current CPU.
    ///
    /// # Safety
    /// The map must cover the executing code, the stack and the direct map.
    #[inline]
    pub unsafe fn load(&self) {
        debug!("page map: loading {}", self.root);
        unsafe { arch::write_cr3(self.root) }
    }

    /// Map one page `virt → phys` of the size implied by `attributes`.
    ///
    /// # Errors
    /// [`MapError::Unaligned`] or [`MapError::OutOfMemory`].
    ///
    /// # Panics
    /// If `virt` is already mapped at any level.
    pub fn map(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let _guard = self.lock.lock();
        self.map_locked(virt, phys, attributes)
    }

    /// Remove the leaf at `virt` and return the frame it mapped.
    ///
    /// Empty intermediate tables stay in place.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no leaf of the implied size.
    pub fn unmap(
        &self,
        virt: VirtualAddress,
        attributes: PageAttributes,
    ) -> Result<PhysicalAddress, MapError> {
        let _guard = self.lock.lock();
        self.unmap_locked(virt, attributes.page_size())
    }

    /// Move the mapping at `old` to `new`, keeping the frame.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if `old` is not mapped, or anything
    /// [`map`](Self::map) reports for `new`. On error `old` stays mapped.
    pub fn remap(
        &self,
        old: VirtualAddress,
        new: VirtualAddress,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        self.remap_range(old, new, attributes.page_size().bytes(), attributes)
    }

    /// Rewrite the attribute bits of the leaf at `virt`, keeping its frame.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if there is no leaf of the implied size.
    pub fn set_flags(&self, virt: VirtualAddress, attributes: PageAttributes) -> Result<(), MapError> {
        self.set_flags_range(virt, attributes.page_size().bytes(), attributes)
    }

    /// Map `[virt, virt + size)` to `[phys, phys + size)` with pages of the
    /// size implied by `attributes`.
    ///
    /// # Errors
    /// Whatever the failing page reports. Pages mapped by this call are
    /// unmapped again before returning.
    pub fn map_range(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let _guard = self.lock.lock();
        self.map_range_locked(virt, phys, size, attributes)
    }

    /// Unmap every page of `[virt, virt + size)`.
    ///
    /// Mapped pages are removed even when others in the span are missing.
    ///
    /// # Errors
    /// The first [`MapError::NotMapped`] encountered.
    pub fn unmap_range(
        &self,
        virt: VirtualAddress,
        size: u64,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let page = attributes.page_size();
        let count = page_count(virt, size, page)?;
        let _guard = self.lock.lock();
        let mut first_error = None;
        for i in 0..count {
            if let Err(e) = self.unmap_locked(virt + i * page.bytes(), page) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Move `[old, old + size)` to `new`, keeping the frames.
    ///
    /// The ranges may overlap; pages are moved in the order that never
    /// lands on a source page still waiting to move.
    ///
    /// # Errors
    /// Nothing is changed if any source page is missing
    /// ([`MapError::NotMapped`]) or a destination page outside the source is
    /// already mapped ([`MapError::AlreadyMapped`]). The error of a failing
    /// destination page moves everything back.
    pub fn remap_range(
        &self,
        old: VirtualAddress,
        new: VirtualAddress,
        size: u64,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let page = attributes.page_size();
        let stride = page.bytes();
        let count = page_count(old, size, page)?;
        check_aligned(new.as_u64(), page)?;
        new.checked_add(count * stride).ok_or(MapError::RangeOverflow)?;
        self.check_span_owned(old, count, page)?;
        self.check_span_owned(new, count, page)?;

        let _guard = self.lock.lock();
        self.check_all_mapped(old, count, page)?;
        let source_end = old.as_u64() + count * stride;
        for i in 0..count {
            let to = new + i * stride;
            let inside_source = (old.as_u64()..source_end).contains(&to.as_u64());
            if !inside_source && self.walk(to).is_some() {
                return Err(MapError::AlreadyMapped(to));
            }
        }

        let order = MoveOrder::new(old, new, count);
        for k in 0..count {
            let i = order.page(k);
            let (from, to) = (old + i * stride, new + i * stride);
            let frame = self.unmap_locked(from, page)?;
            if let Err(e) = self.map_locked(to, frame, attributes) {
                warn!("page map: remap of {from} failed after {k} pages: {e}");
                self.restore_locked(old, new, order, k, frame, attributes);
                return Err(e);
            }
        }
        trace!("page map: moved {count} {page} pages {old} → {new}");
        Ok(())
    }

    /// Rewrite the attributes of every leaf in `[virt, virt + size)`.
    ///
    /// Making a leaf `user` also opens the tables above it to ring 3.
    ///
    /// # Errors
    /// [`MapError::NotMapped`] if any page is missing; nothing is changed.
    pub fn set_flags_range(
        &self,
        virt: VirtualAddress,
        size: u64,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let page = attributes.page_size();
        let count = page_count(virt, size, page)?;
        self.check_span_owned(virt, count, page)?;
        let _guard = self.lock.lock();
        self.check_all_mapped(virt, count, page)?;

        let level = Level::leaf_for(page);
        for i in 0..count {
            let va = virt + i * page.bytes();
            let table_pa = if attributes.user() {
                // The path exists, so this only sets the user bits.
                self.ensure_leaf_table(va, page, true)?
            } else {
                self.find_leaf_table(va, page).ok_or(MapError::NotMapped(va))?
            };
            // SAFETY: table frame owned by this map, lock held.
            let table = unsafe { self.table(table_pa) };
            let idx = level.index_of(va);
            let frame = table.get(idx).frame(page);
            table.set(idx, attributes.to_entry(frame));
            arch::invalidate_page(va);
        }
        Ok(())
    }

    /// Map a backed region with pages of `page_size`.
    ///
    /// # Errors
    /// [`MapError::Unbacked`] if the region has no frames yet, otherwise as
    /// [`map_range`](Self::map_range).
    pub fn map_region<R: MappedRegion + ?Sized>(&self, region: &R, page_size: PageSize) -> Result<(), MapError> {
        let range = region.virtual_range();
        let phys = region
            .physical_base()
            .ok_or(MapError::Unbacked(range.base()))?;
        let attributes = region.page_attributes().with_page_size(page_size);
        self.map_range(range.base(), phys, range.size(), attributes)
    }

    /// Move a mapped region to `new_virt`.
    ///
    /// # Errors
    /// As [`remap_range`](Self::remap_range).
    pub fn remap_region<R: MappedRegion + ?Sized>(
        &self,
        region: &R,
        new_virt: VirtualAddress,
    ) -> Result<(), MapError> {
        let range = region.virtual_range();
        self.remap_range(range.base(), new_virt, range.size(), region.page_attributes())
    }

    /// Physical address behind `virt`, if a leaf maps it and the whole walk
    /// grants the write, user and executable bits `required` asks for.
    #[must_use]
    pub fn virt2phys(&self, virt: VirtualAddress, required: PageAttributes) -> Option<PhysicalAddress> {
        let t = self.translate(virt)?;
        if !t.attributes.permits(required) {
            return None;
        }
        Some(t.phys + virt.page_offset(t.size))
    }

    /// The leaf covering `virt`: its frame, size and effective attributes.
    ///
    /// Write and user access are reported only if every level of the walk
    /// allows them, as the MMU decides.
    #[must_use]
    pub fn translate(&self, virt: VirtualAddress) -> Option<Translation> {
        let _guard = self.lock.lock();
        let (entry, size) = self.walk(virt)?;
        Some(Translation {
            phys: entry.frame(size),
            attributes: PageAttributes::from_entry(entry, size),
            size,
        })
    }

    #[inline]
    #[must_use]
    pub fn is_mapped(&self, virt: VirtualAddress) -> bool {
        self.translate(virt).is_some()
    }

    /// Map `length` bytes of device memory at `phys` into fresh space from
    /// `window` and return the address corresponding to `phys`.
    ///
    /// The span is widened to whole 4 KiB pages.
    ///
    /// # Errors
    /// [`MapError::Window`] if the window is exhausted, otherwise as
    /// [`map_range`](Self::map_range). Window space is not returned on
    /// failure.
    pub fn map_io_region(
        &self,
        window: &VirtualWindow,
        phys: PhysicalAddress,
        length: u64,
        attributes: PageAttributes,
        alignment: u64,
    ) -> Result<VirtualAddress, MapError> {
        let page = PageSize::Size4K.bytes();
        let base = phys.align_down(page);
        let end = phys
            .checked_add(length)
            .and_then(|e| e.as_u64().checked_next_multiple_of(page))
            .ok_or(MapError::RangeOverflow)?;
        let span = (end - base.as_u64()).max(page);

        let virt = window.allocate(span, alignment)?;
        self.map_range(virt, base, span, attributes.with_page_size(PageSize::Size4K))?;
        debug!(
            "page map: io {base}+{span:#x} at {virt} ({})",
            attributes.caching().as_str()
        );
        Ok(virt + phys.page_offset(PageSize::Size4K))
    }

    // ---------------------------------------------------------------------
    // Internals. Callers hold `self.lock`.
    // ---------------------------------------------------------------------

    /// # Safety
    /// `pa` must be a table frame of this map (or a fresh frame), and the
    /// returned reference must not outlive the caller's critical section.
    #[inline]
    #[allow(clippy::mut_from_ref)]
    unsafe fn table(&self, pa: PhysicalAddress) -> &mut PageTable {
        unsafe { self.mapper.phys_to_mut::<PageTable>(pa) }
    }

    fn alloc_table(&self) -> Result<PhysicalAddress, MapError> {
        let pa = self.frames.allocate_frame().ok_or(MapError::OutOfMemory)?;
        // SAFETY: freshly allocated frame.
        unsafe { self.table(pa).zero() };
        Ok(pa)
    }

    /// Table holding the leaf slot for `va` at `size`, creating missing levels.
    fn ensure_leaf_table(&self, va: VirtualAddress, size: PageSize, user: bool) -> Result<PhysicalAddress, MapError> {
        let target = Level::leaf_for(size);
        let mut level = Level::PML4;
        let mut table_pa = self.root;
        while level != target {
            // SAFETY: walking tables owned by this map.
            let table = unsafe { self.table(table_pa) };
            let idx = level.index_of(va);
            let entry = table.get(idx);
            if entry.is_present() {
                if let Some(leaf_size) = level.page_size()
                    && entry.is_leaf_at(leaf_size)
                {
                    error!("page map: {va} already covered by {entry}");
                    panic!("{va} is already mapped by a {leaf_size} page");
                }
                if user && !entry.user() {
                    table.set(idx, entry.with_user(true));
                }
                table_pa = entry.frame(PageSize::Size4K);
            } else {
                let next = self.alloc_table()?;
                table.set(idx, PageTableEntry::table(next, user));
                table_pa = next;
            }
            level = level.next().unwrap_or(target);
        }
        Ok(table_pa)
    }

    /// Table holding the leaf slot for `va` at `size`, if the path exists.
    fn find_leaf_table(&self, va: VirtualAddress, size: PageSize) -> Option<PhysicalAddress> {
        let target = Level::leaf_for(size);
        let mut level = Level::PML4;
        let mut table_pa = self.root;
        while level != target {
            // SAFETY: walking tables owned by this map.
            let entry = unsafe { self.table(table_pa) }.get(level.index_of(va));
            table_pa = entry.next_table(level.page_size().unwrap_or(PageSize::Size1G))?;
            level = level.next()?;
        }
        Some(table_pa)
    }

    /// Leaf covering `va` at whichever level the walk stops, with the write
    /// and user bits narrowed by every table above it.
    fn walk(&self, va: VirtualAddress) -> Option<(PageTableEntry, PageSize)> {
        let mut level = Level::PML4;
        let mut table_pa = self.root;
        let (mut writable, mut user) = (true, true);
        loop {
            // SAFETY: walking tables owned by this map.
            let entry = unsafe { self.table(table_pa) }.get(level.index_of(va));
            if !entry.is_present() {
                return None;
            }
            writable &= entry.writable();
            user &= entry.user();
            if let Some(size) = level.page_size()
                && entry.is_leaf_at(size)
            {
                return Some((entry.with_writable(writable).with_user(user), size));
            }
            table_pa = entry.frame(PageSize::Size4K);
            level = level.next()?;
        }
    }

    /// A user map may not touch the kernel half it shares.
    fn check_owned(&self, va: VirtualAddress) -> Result<(), MapError> {
        if self.kind == MapKind::User && Level::PML4.index_of(va) >= KERNEL_PML4_START {
            warn!("page map: user map asked to change kernel address {va}");
            return Err(MapError::KernelHalf(va));
        }
        Ok(())
    }

    /// [`check_owned`](Self::check_owned) for the first and last of `count` pages.
    fn check_span_owned(&self, virt: VirtualAddress, count: u64, page: PageSize) -> Result<(), MapError> {
        if count == 0 {
            return Ok(());
        }
        self.check_owned(virt)?;
        self.check_owned(virt + (count - 1) * page.bytes())
    }

    fn map_locked(&self, va: VirtualAddress, pa: PhysicalAddress, attributes: PageAttributes) -> Result<(), MapError> {
        let size = attributes.page_size();
        check_aligned(va.as_u64(), size)?;
        check_aligned(pa.as_u64(), size)?;
        self.check_owned(va)?;

        let table_pa = self.ensure_leaf_table(va, size, attributes.user())?;
        // SAFETY: table frame owned by this map.
        let table = unsafe { self.table(table_pa) };
        let idx = Level::leaf_for(size).index_of(va);
        let existing = table.get(idx);
        if existing.is_present() {
            error!("page map: {va} already maps {existing}");
            panic!("{va} is already mapped");
        }
        table.set(idx, attributes.to_entry(pa));
        trace!("page map: {va} → {pa} [{attributes}]");
        Ok(())
    }

    fn unmap_locked(&self, va: VirtualAddress, size: PageSize) -> Result<PhysicalAddress, MapError> {
        check_aligned(va.as_u64(), size)?;
        self.check_owned(va)?;
        let table_pa = self.find_leaf_table(va, size).ok_or(MapError::NotMapped(va))?;
        // SAFETY: table frame owned by this map.
        let table = unsafe { self.table(table_pa) };
        let idx = Level::leaf_for(size).index_of(va);
        let entry = table.get(idx);
        if !entry.is_leaf_at(size) {
            return Err(MapError::NotMapped(va));
        }
        table.clear(idx);
        arch::invalidate_page(va);
        trace!("page map: unmapped {va}");
        Ok(entry.frame(size))
    }

    fn map_range_locked(
        &self,
        virt: VirtualAddress,
        phys: PhysicalAddress,
        size: u64,
        attributes: PageAttributes,
    ) -> Result<(), MapError> {
        let page = attributes.page_size();
        let stride = page.bytes();
        let count = page_count(virt, size, page)?;
        check_aligned(phys.as_u64(), page)?;
        phys.checked_add(count * stride).ok_or(MapError::RangeOverflow)?;

        for i in 0..count {
            let off = i * stride;
            if let Err(e) = self.map_locked(virt + off, phys + off, attributes) {
                warn!("page map: mapping {virt}+{size:#x} failed at page {i}: {e}");
                for j in 0..i {
                    // Mapped by this call, cannot be missing.
                    let _ = self.unmap_locked(virt + j * stride, page);
                }
                return Err(e);
            }
        }
        Ok(())
    }

    fn check_all_mapped(&self, virt: VirtualAddress, count: u64, page: PageSize) -> Result<(), MapError> {
        let level = Level::leaf_for(page);
        for i in 0..count {
            let va = virt + i * page.bytes();
            let present = self.find_leaf_table(va, page).is_some_and(|t| {
                // SAFETY: table frame owned by this map.
                unsafe { self.table(t) }.get(level.index_of(va)).is_leaf_at(page)
            });
            if !present {
                return Err(MapError::NotMapped(va));
            }
        }
        Ok(())
    }

    /// Undo a partially applied remap: the first `done` pages of `order`
    /// moved to `new`, the next one already unmapped from `old` and held in
    /// `pending`. Moves are undone newest first.
    fn restore_locked(
        &self,
        old: VirtualAddress,
        new: VirtualAddress,
        order: MoveOrder,
        done: u64,
        pending: PhysicalAddress,
        attributes: PageAttributes,
    ) {
        let page = attributes.page_size();
        let stride = page.bytes();
        // The old tables still exist, so these maps cannot run out of memory.
        let _ = self.map_locked(old + order.page(done) * stride, pending, attributes);
        for k in (0..done).rev() {
            let i = order.page(k);
            if let Ok(frame) = self.unmap_locked(new + i * stride, page) {
                let _ = self.map_locked(old + i * stride, frame, attributes);
            }
        }
    }

    /// Free `table_pa` and every table below it. Leaves are left alone.
    fn free_subtree(&self, table_pa: PhysicalAddress, level: Level) {
        if let (Some(next), Some(size)) = (level.next(), level.page_size()) {
            // SAFETY: table frame owned by this map; no other users during drop.
            let table = unsafe { self.table(table_pa) };
            for (_, entry) in table.iter() {
                if let Some(child) = entry.next_table(size) {
                    self.free_subtree(child, next);
                }
            }
        }
        self.frames.free_frame(table_pa);
    }
}

impl<M: PhysMapper, A: FrameAlloc> Drop for PageMap<'_, M, A> {
    fn drop(&mut self) {
        if !self.owned {
            return;
        }
        // SAFETY: the root belongs to this map.
        let pml4 = unsafe { self.table(self.root) };
        for i in self.kind.owned_root_entries() {
            if let Some(pdpt) = pml4.get(i).next_table(PageSize::Size1G) {
                self.free_subtree(pdpt, Level::PDPT);
            }
        }
        self.frames.free_frame(self.root);
        debug!("page map: released {:?} root {}", self.kind, self.root);
    }
}

impl<M: PhysMapper, A: FrameAlloc> fmt::Debug for PageMap<'_, M, A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PageMap")
            .field("root", &self.root)
            .field("kind", &self.kind)
            .field("owned", &self.owned)
            .finish_non_exhaustive()
    }
}

/// Order in which a remap moves its pages.
#[derive(Copy, Clone)]
struct MoveOrder {
    count: u64,
    /// Highest page first, for a destination above an overlapping source.
    descending: bool,
}

impl MoveOrder {
    fn new(old: VirtualAddress, new: VirtualAddress, count: u64) -> Self {
        Self {
            count,
            descending: new.as_u64() > old.as_u64(),
        }
    }

    /// Page index moved at step `k`.
    const fn page(self, k: u64) -> u64 {
        if self.descending { self.count - 1 - k } else { k }
    }
}

#[inline]
const fn check_aligned(address: u64, size: PageSize) -> Result<(), MapError> {
    if address & size.offset_mask() == 0 {
        Ok(())
    } else {
        Err(MapError::Unaligned { address, size })
    }
}

/// Pages of `size` covering `[virt, virt + len)`; validates alignment and
/// that the span fits the address space.
fn page_count(virt: VirtualAddress, len: u64, size: PageSize) -> Result<u64, MapError> {
    check_aligned(virt.as_u64(), size)?;
    let count = div_round_up(len, size.bytes());
    count
        .checked_mul(size.bytes())
        .and_then(|bytes| virt.checked_add(bytes))
        .ok_or(MapError::RangeOverflow)?;
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CachingMode;
    use core::cell::{Cell, RefCell};
    use kernel_memory_addresses::AddressRange;

    /// A 4 KiB-aligned raw frame. We use this as our "physical RAM" backing store in tests.
    #[repr(align(4096))]
    struct Aligned4K([u8; 4096]);

    /// Simulated RAM: physical address `n * 4096` is `frames[n]`.
    struct TestPhys {
        frames: Vec<Aligned4K>,
    }

    impl TestPhys {
        fn with_frames(n: usize) -> Self {
            Self {
                frames: (0..n).map(|_| Aligned4K([0xa5; 4096])).collect(),
            }
        }
    }

    impl PhysMapper for TestPhys {
        fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
            let idx = usize::try_from(pa.as_u64() >> 12).unwrap();
            let off = usize::try_from(pa.as_u64() & 0xfff).unwrap();
            assert!(idx < self.frames.len(), "{pa} outside simulated RAM");
            // SAFETY: in-bounds offset into an owned frame.
            unsafe { self.frames[idx].0.as_ptr().cast_mut().add(off) }
        }

        fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
            let base = self.frames.as_ptr().cast::<u8>();
            PhysicalAddress::new((ptr as u64) - (base as u64))
        }
    }

    /// Hands out frames `1..end`; `limit` caps how many allocations succeed.
    struct BumpAlloc {
        next: Cell<u64>,
        end: u64,
        limit: Cell<usize>,
        freed: RefCell<Vec<PhysicalAddress>>,
    }

    impl BumpAlloc {
        fn new(frames: u64) -> Self {
            Self {
                next: Cell::new(1),
                end: frames,
                limit: Cell::new(usize::MAX),
                freed: RefCell::new(Vec::new()),
            }
        }

        fn allocated(&self) -> u64 {
            self.next.get() - 1
        }
    }

    impl FrameAlloc for BumpAlloc {
        fn allocate_frame(&self) -> Option<PhysicalAddress> {
            if self.next.get() >= self.end || self.limit.get() == 0 {
                return None;
            }
            self.limit.set(self.limit.get() - 1);
            let n = self.next.get();
            self.next.set(n + 1);
            Some(PhysicalAddress::new(n << 12))
        }

        fn free_frame(&self, frame: PhysicalAddress) {
            let mut freed = self.freed.borrow_mut();
            assert!(!freed.contains(&frame), "double free of {frame}");
            freed.push(frame);
        }
    }

    const RW: PageAttributes = PageAttributes::new().with_read(true).with_write(true);

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    #[test]
    fn map_translate_unmap_round_trip() {
        let phys = TestPhys::with_frames(64);
        let alloc = BumpAlloc::new(64);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x40_0000), pa(0x30_0000), RW).unwrap();
        assert_eq!(map.virt2phys(va(0x40_0123), PageAttributes::new()), Some(pa(0x30_0123)));

        let t = map.translate(va(0x40_0000)).unwrap();
        assert_eq!(t.size, PageSize::Size4K);
        assert!(t.attributes.write());
        assert!(!t.attributes.executable());

        assert_eq!(map.unmap(va(0x40_0000), RW), Ok(pa(0x30_0000)));
        assert_eq!(map.virt2phys(va(0x40_0000), PageAttributes::new()), None);
        assert_eq!(map.unmap(va(0x40_0000), RW), Err(MapError::NotMapped(va(0x40_0000))));
    }

    #[test]
    fn virt2phys_checks_permissions() {
        let phys = TestPhys::with_frames(64);
        let alloc = BumpAlloc::new(64);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x1000), pa(0x5000), PageAttributes::KERNEL_RO).unwrap();
        assert!(map.virt2phys(va(0x1000), PageAttributes::new()).is_some());
        assert!(map.virt2phys(va(0x1000), PageAttributes::new().with_write(true)).is_none());
        assert!(map.virt2phys(va(0x1000), PageAttributes::new().with_user(true)).is_none());
        assert!(map.virt2phys(va(0x1000), PageAttributes::new().with_executable(true)).is_none());
    }

    #[test]
    fn large_leaves_honor_the_offset() {
        let phys = TestPhys::with_frames(64);
        let alloc = BumpAlloc::new(64);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        let two_m = RW.with_page_size(PageSize::Size2M);
        map.map(va(0x2000_0000), pa(0x400_0000), two_m).unwrap();
        assert_eq!(map.virt2phys(va(0x2012_3456), PageAttributes::new()), Some(pa(0x412_3456)));

        let one_g = RW.with_page_size(PageSize::Size1G);
        map.map(va(0x40_0000_0000), pa(0x4000_0000), one_g).unwrap();
        let t = map.translate(va(0x40_0000_0000)).unwrap();
        assert_eq!(t.size, PageSize::Size1G);
        assert_eq!(map.virt2phys(va(0x40_3fff_ffff), PageAttributes::new()), Some(pa(0x7fff_ffff)));
    }

    #[test]
    fn unaligned_requests_are_refused() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        let two_m = RW.with_page_size(PageSize::Size2M);
        assert_eq!(
            map.map(va(0x1000), pa(0), two_m),
            Err(MapError::Unaligned { address: 0x1000, size: PageSize::Size2M })
        );
        assert!(matches!(map.map(va(0), pa(0x10), RW), Err(MapError::Unaligned { .. })));
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn double_map_panics() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        map.map(va(0x1000), pa(0x1000), RW).unwrap();
        let _ = map.map(va(0x1000), pa(0x2000), RW);
    }

    #[test]
    #[should_panic(expected = "already mapped")]
    fn mapping_inside_a_large_leaf_panics() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        map.map(va(0x20_0000), pa(0x20_0000), RW.with_page_size(PageSize::Size2M))
            .unwrap();
        let _ = map.map(va(0x20_1000), pa(0x1000), RW);
    }

    #[test]
    fn failed_range_leaves_nothing_mapped() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        // PDPT, PD and the first PT fit; the PT for page 512 does not.
        alloc.limit.set(3);
        let base = va(0x20_0000);
        let err = map.map_range(base, pa(0x100_0000), 1024 * 4096, RW);
        assert_eq!(err, Err(MapError::OutOfMemory));
        for k in [0u64, 1, 255, 511] {
            assert_eq!(map.virt2phys(base + k * 4096, PageAttributes::new()), None, "page {k}");
        }

        // With room for the second table the same call succeeds.
        alloc.limit.set(1);
        map.map_range(base, pa(0x100_0000), 1024 * 4096, RW).unwrap();
        assert_eq!(map.virt2phys(base + 1023 * 4096, PageAttributes::new()), Some(pa(0x100_0000 + 1023 * 4096)));
    }

    #[test]
    fn unmap_range_reports_holes_but_clears_the_rest() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x1000), pa(0x1000), RW).unwrap();
        map.map(va(0x3000), pa(0x3000), RW).unwrap();
        assert_eq!(map.unmap_range(va(0x1000), 3 * 4096, RW), Err(MapError::NotMapped(va(0x2000))));
        assert!(!map.is_mapped(va(0x1000)));
        assert!(!map.is_mapped(va(0x3000)));
    }

    #[test]
    fn remap_moves_frames() {
        let phys = TestPhys::with_frames(32);
        let alloc = BumpAlloc::new(32);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map_range(va(0x10_0000), pa(0x70_0000), 2 * 4096, RW).unwrap();
        map.remap_range(va(0x10_0000), va(0x8000_0000), 2 * 4096, RW).unwrap();
        assert!(!map.is_mapped(va(0x10_0000)));
        assert_eq!(map.virt2phys(va(0x8000_1000), PageAttributes::new()), Some(pa(0x70_1000)));

        map.remap(va(0x8000_0000), va(0x20_0000), RW).unwrap();
        assert_eq!(map.virt2phys(va(0x20_0000), PageAttributes::new()), Some(pa(0x70_0000)));
    }

    #[test]
    fn remap_of_missing_source_changes_nothing() {
        let phys = TestPhys::with_frames(32);
        let alloc = BumpAlloc::new(32);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x10_0000), pa(0x70_0000), RW).unwrap();
        assert_eq!(
            map.remap_range(va(0x10_0000), va(0x8000_0000), 2 * 4096, RW),
            Err(MapError::NotMapped(va(0x10_1000)))
        );
        assert!(map.is_mapped(va(0x10_0000)));
        assert!(!map.is_mapped(va(0x8000_0000)));
    }

    #[test]
    fn remap_out_of_memory_moves_everything_back() {
        let phys = TestPhys::with_frames(32);
        let alloc = BumpAlloc::new(32);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x10_0000), pa(0x70_0000), RW).unwrap();
        alloc.limit.set(0);
        assert_eq!(map.remap(va(0x10_0000), va(0x7f00_0000_0000), RW), Err(MapError::OutOfMemory));
        assert_eq!(map.virt2phys(va(0x10_0000), PageAttributes::new()), Some(pa(0x70_0000)));
    }

    #[test]
    fn set_flags_keeps_the_frame() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        map.map(va(0x1000), pa(0x9000), RW).unwrap();
        map.set_flags(va(0x1000), PageAttributes::USER_RX).unwrap();
        let t = map.translate(va(0x1000)).unwrap();
        assert_eq!(t.phys, pa(0x9000));
        assert!(t.attributes.user() && t.attributes.executable() && !t.attributes.write());
        assert_eq!(map.set_flags(va(0x2000), RW), Err(MapError::NotMapped(va(0x2000))));
    }

    #[test]
    fn set_flags_opens_the_walk_to_user_mode() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        let v = va(0x40_0000);
        let user = PageAttributes::new().with_user(true);

        map.map(v, pa(0x5000), PageAttributes::KERNEL_RW).unwrap();
        assert_eq!(map.virt2phys(v, user), None);

        map.set_flags(v, PageAttributes::USER_RW).unwrap();
        assert_eq!(map.virt2phys(v, user), Some(pa(0x5000)));
        // SAFETY: the root belongs to the map.
        let pml4e = unsafe { map.table(map.root) }.get(Level::PML4.index_of(v));
        assert!(pml4e.user());
    }

    #[test]
    fn walk_narrows_access_to_every_level() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        let v = va(0x40_0000);

        map.map(v, pa(0x5000), PageAttributes::KERNEL_RW).unwrap();
        // A user leaf below kernel-only tables, as a foreign tree may hold.
        let table = map.find_leaf_table(v, PageSize::Size4K).unwrap();
        // SAFETY: table frame of this map.
        unsafe { map.table(table) }.set(
            Level::PT.index_of(v),
            PageAttributes::USER_RW.to_entry(pa(0x5000)),
        );

        let t = map.translate(v).unwrap();
        assert!(!t.attributes.user());
        assert!(t.attributes.write());
        assert_eq!(map.virt2phys(v, PageAttributes::new().with_user(true)), None);
        assert_eq!(map.virt2phys(v, PageAttributes::new().with_write(true)), Some(pa(0x5000)));
    }

    #[test]
    fn user_map_refuses_the_kernel_half() {
        let phys = TestPhys::with_frames(300);
        let alloc = BumpAlloc::new(300);
        let kernel = PageMap::new_kernel(&phys, &alloc).unwrap();
        let user = PageMap::new_user(&kernel).unwrap();
        let kva = va(0xffff_8880_0000_0000);
        let rw = PageAttributes::KERNEL_RW;

        assert_eq!(user.map(kva, pa(0x1000), rw), Err(MapError::KernelHalf(kva)));
        assert!(!kernel.is_mapped(kva));

        kernel.map(kva, pa(0x1000), rw).unwrap();
        assert_eq!(user.unmap(kva, rw), Err(MapError::KernelHalf(kva)));
        assert_eq!(user.set_flags(kva, PageAttributes::USER_RW), Err(MapError::KernelHalf(kva)));
        assert_eq!(user.remap(kva, va(0x40_0000), rw), Err(MapError::KernelHalf(kva)));
        assert!(kernel.is_mapped(kva));

        user.map(va(0x40_0000), pa(0x3000), PageAttributes::USER_RW).unwrap();
        assert_eq!(
            user.remap(va(0x40_0000), kva + 0x1000, PageAttributes::USER_RW),
            Err(MapError::KernelHalf(kva + 0x1000))
        );
        assert!(user.is_mapped(va(0x40_0000)));
        // The user map still reads the shared half.
        assert_eq!(user.virt2phys(kva, PageAttributes::new()), Some(pa(0x1000)));
    }

    #[test]
    fn overlapping_remaps_shift_in_both_directions() {
        let phys = TestPhys::with_frames(32);
        let alloc = BumpAlloc::new(32);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        let any = PageAttributes::new();

        map.map_range(va(0x1000), pa(0x9000), 2 * 4096, RW).unwrap();
        map.remap_range(va(0x1000), va(0x2000), 2 * 4096, RW).unwrap();
        assert!(!map.is_mapped(va(0x1000)));
        assert_eq!(map.virt2phys(va(0x2000), any), Some(pa(0x9000)));
        assert_eq!(map.virt2phys(va(0x3000), any), Some(pa(0xa000)));

        map.remap_range(va(0x2000), va(0x1000), 2 * 4096, RW).unwrap();
        assert_eq!(map.virt2phys(va(0x1000), any), Some(pa(0x9000)));
        assert_eq!(map.virt2phys(va(0x2000), any), Some(pa(0xa000)));
        assert!(!map.is_mapped(va(0x3000)));
    }

    #[test]
    fn remap_onto_a_foreign_mapping_changes_nothing() {
        let phys = TestPhys::with_frames(32);
        let alloc = BumpAlloc::new(32);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        let any = PageAttributes::new();

        map.map_range(va(0x1000), pa(0x9000), 2 * 4096, RW).unwrap();
        map.map(va(0x4000), pa(0xc000), RW).unwrap();
        assert_eq!(
            map.remap_range(va(0x1000), va(0x3000), 2 * 4096, RW),
            Err(MapError::AlreadyMapped(va(0x4000)))
        );
        assert_eq!(map.virt2phys(va(0x1000), any), Some(pa(0x9000)));
        assert_eq!(map.virt2phys(va(0x2000), any), Some(pa(0xa000)));
        assert_eq!(map.virt2phys(va(0x4000), any), Some(pa(0xc000)));
        assert!(!map.is_mapped(va(0x3000)));
    }

    struct Backed(AddressRange, Option<PhysicalAddress>);

    impl MappedRegion for Backed {
        fn virtual_range(&self) -> AddressRange {
            self.0
        }
        fn physical_base(&self) -> Option<PhysicalAddress> {
            self.1
        }
        fn page_attributes(&self) -> PageAttributes {
            PageAttributes::USER_RW
        }
    }

    #[test]
    fn map_region_needs_backing() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);

        let range = AddressRange::new(va(0x40_0000), 3 * 4096);
        assert_eq!(
            map.map_region(&Backed(range, None), PageSize::Size4K),
            Err(MapError::Unbacked(va(0x40_0000)))
        );
        map.map_region(&Backed(range, Some(pa(0x8_0000))), PageSize::Size4K).unwrap();
        let t = map.translate(va(0x40_2000)).unwrap();
        assert_eq!(t.phys, pa(0x8_2000));
        assert!(t.attributes.user());

        map.remap_region(&Backed(range, Some(pa(0x8_0000))), va(0x80_0000)).unwrap();
        assert!(map.is_mapped(va(0x80_2000)));
    }

    #[test]
    fn io_region_keeps_the_in_page_offset() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let map = PageMap::new_user_for_test(&phys, &alloc);
        let window = VirtualWindow::new(AddressRange::new(va(0x7000_0000_0000), 0x10_0000));

        let v = map
            .map_io_region(&window, pa(0xfee0_0020), 0x1000, PageAttributes::MMIO, 0)
            .unwrap();
        assert_eq!(v, va(0x7000_0000_0020));
        // 0x20 + 0x1000 crosses into a second page.
        let t = map.translate(va(0x7000_0000_1000)).unwrap();
        assert_eq!(t.phys, pa(0xfee0_1000));
        assert_eq!(t.attributes.caching(), CachingMode::UncacheableStrong);
        assert_eq!(window.remaining(), 0x10_0000 - 0x2000);
    }

    #[test]
    fn user_maps_share_the_kernel_half() {
        let phys = TestPhys::with_frames(300);
        let alloc = BumpAlloc::new(300);
        let kernel = PageMap::new_kernel(&phys, &alloc).unwrap();
        assert_eq!(alloc.allocated(), 1 + 256);

        let kva = va(0xffff_8880_0000_0000);
        kernel.map(kva, pa(0x1000), PageAttributes::KERNEL_RW).unwrap();

        let user = PageMap::new_user(&kernel).unwrap();
        assert_eq!(user.virt2phys(kva, PageAttributes::new()), Some(pa(0x1000)));

        // Mapped through the shared tables after the user map was created.
        kernel.map(kva + 0x1000, pa(0x2000), PageAttributes::KERNEL_RW).unwrap();
        assert_eq!(user.virt2phys(kva + 0x1000, PageAttributes::new()), Some(pa(0x2000)));

        user.map(va(0x40_0000), pa(0x3000), PageAttributes::USER_RW).unwrap();
        assert!(!kernel.is_mapped(va(0x40_0000)));
    }

    #[test]
    fn dropping_a_user_map_frees_only_its_lower_half() {
        let phys = TestPhys::with_frames(300);
        let alloc = BumpAlloc::new(300);
        let kernel = PageMap::new_kernel(&phys, &alloc).unwrap();
        let kva = va(0xffff_8880_0000_0000);
        kernel.map(kva, pa(0x1000), PageAttributes::KERNEL_RW).unwrap();

        let before = alloc.allocated();
        let user = PageMap::new_user(&kernel).unwrap();
        user.map(va(0x40_0000), pa(0x3000), PageAttributes::USER_RW).unwrap();
        // Root plus PDPT, PD, PT.
        assert_eq!(alloc.allocated() - before, 4);
        drop(user);

        assert_eq!(alloc.freed.borrow().len(), 4);
        assert_eq!(kernel.virt2phys(kva, PageAttributes::new()), Some(pa(0x1000)));

        drop(kernel);
        assert_eq!(u64::try_from(alloc.freed.borrow().len()).unwrap(), alloc.allocated());
    }

    #[test]
    fn wrapped_roots_are_not_freed() {
        let phys = TestPhys::with_frames(16);
        let alloc = BumpAlloc::new(16);
        let root = alloc.allocate_frame().unwrap();
        // SAFETY: fresh frame from simulated RAM.
        unsafe { phys.phys_to_mut::<PageTable>(root).zero() };
        {
            // SAFETY: nothing else touches the tree.
            let map = unsafe { PageMap::from_root(&phys, &alloc, root, MapKind::User) };
            map.map(va(0x1000), pa(0x1000), RW).unwrap();
        }
        assert!(alloc.freed.borrow().is_empty());
    }

    impl<'m, M: PhysMapper, A: FrameAlloc> PageMap<'m, M, A> {
        /// Standalone user map without a kernel half.
        fn new_user_for_test(mapper: &'m M, frames: &'m A) -> Self {
            Self::empty(mapper, frames, MapKind::User).unwrap()
        }
    }
}
