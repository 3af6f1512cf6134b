//! # Hardware page-table entry
//!
//! One 64-bit slot, valid at every level of the walk. Whether it is a leaf
//! depends on the level (PT entries always are; PD and PDPT entries are when
//! `PS` is set), so level-dependent accessors take the [`PageSize`] the entry
//! maps at.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress};

/// Physical address bits 51..12 of an entry.
pub const ADDRESS_MASK: u64 = 0x000f_ffff_ffff_f000;

/// PAT selector of a 2 MiB / 1 GiB leaf (bit 12).
pub const LARGE_PAT_BIT: u64 = 1 << 12;

#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageTableEntry {
    /// **Present** (bit 0).
    pub present: bool,

    /// **Writable** (bit 1). Intersects across the walk.
    pub writable: bool,

    /// **User/Supervisor** (bit 2). Must be set at every level for ring 3 access.
    pub user: bool,

    /// **PWT** (bit 3): PAT index bit 0.
    pub write_through: bool,

    /// **PCD** (bit 4): PAT index bit 1.
    pub cache_disable: bool,

    /// **Accessed** (bit 5), set by the CPU.
    pub accessed: bool,

    /// **Dirty** (bit 6), set by the CPU on leaves.
    pub dirty: bool,

    /// **PS** (bit 7) on PD/PDPT entries; **PAT** on 4 KiB PTEs.
    pub ps_or_pat: bool,

    /// **Global** (bit 8): survives CR3 reloads when CR4.PGE is set.
    pub global: bool,

    /// Bits 9..11, ignored by hardware.
    #[bits(3)]
    pub os_available_low: u8,

    /// Bits 12..51: frame number (4 KiB granularity). On large leaves the low
    /// bit doubles as the PAT selector.
    #[bits(40)]
    frame_51_12: u64,

    /// Bits 52..58, ignored by hardware.
    #[bits(7)]
    pub os_available_high: u8,

    /// Bits 59..62: protection key when CR4.PKE is set.
    #[bits(4)]
    pub protection_key: u8,

    /// **NX** (bit 63): no instruction fetch when EFER.NXE is set.
    pub no_execute: bool,
}

impl PageTableEntry {
    /// A present, writable link to a next-level table.
    ///
    /// Permissions on links are permissive; leaves decide.
    #[inline]
    #[must_use]
    pub const fn table(phys: PhysicalAddress, user: bool) -> Self {
        debug_assert!(phys.is_aligned_to(0x1000));
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(user)
            .with_frame_51_12(phys.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn is_present(self) -> bool {
        self.present()
    }

    /// Whether this entry terminates the walk when read at a level that maps
    /// pages of `size`.
    #[inline]
    #[must_use]
    pub const fn is_leaf_at(self, size: PageSize) -> bool {
        match size {
            PageSize::Size4K => self.present(),
            PageSize::Size2M | PageSize::Size1G => self.present() && self.ps_or_pat(),
        }
    }

    /// Next-level table if this is a present non-leaf entry.
    ///
    /// `size` is the page size a leaf at this level would map.
    #[inline]
    #[must_use]
    pub const fn next_table(self, size: PageSize) -> Option<PhysicalAddress> {
        if !self.present() || self.is_leaf_at(size) || matches!(size, PageSize::Size4K) {
            return None;
        }
        Some(PhysicalAddress::new(self.into_bits() & ADDRESS_MASK))
    }

    /// Physical frame of a leaf mapping pages of `size`.
    ///
    /// Masks the PAT bit of large leaves out of the address.
    #[inline]
    #[must_use]
    pub const fn frame(self, size: PageSize) -> PhysicalAddress {
        PhysicalAddress::new(self.into_bits() & ADDRESS_MASK & !size.offset_mask())
    }

    /// Store `phys` in the address bits, leaving every flag untouched.
    #[inline]
    pub const fn set_frame(&mut self, phys: PhysicalAddress) {
        debug_assert!(phys.is_aligned_to(0x1000));
        self.set_frame_51_12(phys.as_u64() >> 12);
    }

    /// PAT selector bit of a leaf mapping pages of `size`.
    #[inline]
    #[must_use]
    pub const fn pat(self, size: PageSize) -> bool {
        match size {
            PageSize::Size4K => self.ps_or_pat(),
            PageSize::Size2M | PageSize::Size1G => self.into_bits() & LARGE_PAT_BIT != 0,
        }
    }

    /// Copy with the PAT selector bit of a `size` leaf set to `pat`.
    #[inline]
    #[must_use]
    pub const fn with_pat(self, size: PageSize, pat: bool) -> Self {
        match size {
            PageSize::Size4K => self.with_ps_or_pat(pat),
            PageSize::Size2M | PageSize::Size1G => {
                let bits = self.into_bits() & !LARGE_PAT_BIT;
                Self::from_bits(if pat { bits | LARGE_PAT_BIT } else { bits })
            }
        }
    }
}

impl fmt::Display for PageTableEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.present() {
            return f.write_str("-");
        }
        write!(
            f,
            "{:#x} {}{}{}{}{}{}",
            self.into_bits() & ADDRESS_MASK,
            if self.writable() { 'W' } else { 'r' },
            if self.user() { 'U' } else { 'k' },
            if self.no_execute() { '-' } else { 'X' },
            if self.ps_or_pat() { 'S' } else { '.' },
            if self.global() { 'G' } else { '.' },
            if self.cache_disable() { 'C' } else { '.' },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_link_is_not_a_leaf() {
        let e = PageTableEntry::table(PhysicalAddress::new(0x5000), false);
        assert!(e.is_present());
        assert!(!e.is_leaf_at(PageSize::Size2M));
        assert_eq!(e.next_table(PageSize::Size2M), Some(PhysicalAddress::new(0x5000)));
        assert_eq!(e.next_table(PageSize::Size4K), None);
    }

    #[test]
    fn large_pat_does_not_leak_into_frame() {
        let mut e = PageTableEntry::new().with_present(true).with_ps_or_pat(true);
        e.set_frame(PhysicalAddress::new(0x20_0000));
        let e = e.with_pat(PageSize::Size2M, true);
        assert!(e.pat(PageSize::Size2M));
        assert_eq!(e.frame(PageSize::Size2M).as_u64(), 0x20_0000);
        assert!(e.is_leaf_at(PageSize::Size2M));
    }

    #[test]
    fn empty_entry_displays_as_dash() {
        assert_eq!(format!("{}", PageTableEntry::new()), "-");
    }
}
