//! # Page table frame
//!
//! All four levels share one layout: 512 [`PageTableEntry`] slots filling a
//! 4 KiB-aligned frame. The level only changes how an entry is interpreted.

use crate::entry::PageTableEntry;
use kernel_memory_addresses::{PageSize, VirtualAddress};

/// Entries per table.
pub const ENTRIES: usize = 512;

#[doc(alias = "PML4")]
#[doc(alias = "PDPT")]
#[doc(alias = "PD")]
#[doc(alias = "PT")]
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [PageTableEntry; ENTRIES],
}

const _: () = assert!(size_of::<PageTable>() == 4096);

impl PageTable {
    #[inline]
    pub fn zero(&mut self) {
        self.entries.fill(PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub const fn get(&self, index: usize) -> PageTableEntry {
        self.entries[index]
    }

    #[inline]
    pub const fn set(&mut self, index: usize, entry: PageTableEntry) {
        self.entries[index] = entry;
    }

    #[inline]
    pub fn clear(&mut self, index: usize) {
        self.set(index, PageTableEntry::new());
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| !e.is_present())
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, PageTableEntry)> + '_ {
        self.entries.iter().copied().enumerate()
    }
}

/// Paging level of a table: 4 = PML4 .. 1 = PT.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Level(u32);

impl Level {
    pub const PML4: Self = Self(4);
    pub const PDPT: Self = Self(3);
    pub const PD: Self = Self(2);
    pub const PT: Self = Self(1);

    /// Level whose entries are leaves for pages of `size`.
    #[inline]
    #[must_use]
    pub const fn leaf_for(size: PageSize) -> Self {
        match size {
            PageSize::Size4K => Self::PT,
            PageSize::Size2M => Self::PD,
            PageSize::Size1G => Self::PDPT,
        }
    }

    #[inline]
    #[must_use]
    pub const fn number(self) -> u32 {
        self.0
    }

    /// Page size a leaf at this level maps; `None` for the PML4.
    #[inline]
    #[must_use]
    pub const fn page_size(self) -> Option<PageSize> {
        match self.0 {
            1 => Some(PageSize::Size4K),
            2 => Some(PageSize::Size2M),
            3 => Some(PageSize::Size1G),
            _ => None,
        }
    }

    /// One level closer to the leaves.
    #[inline]
    #[must_use]
    pub const fn next(self) -> Option<Self> {
        if self.0 > 1 { Some(Self(self.0 - 1)) } else { None }
    }

    #[inline]
    #[must_use]
    pub const fn index_of(self, va: VirtualAddress) -> usize {
        va.table_index(self.0)
    }
}
