//! # Page attributes
//!
//! Architecture-neutral description of a mapping, translated to and from the
//! hardware [`PageTableEntry`] encoding.
//!
//! ## Caching
//!
//! The memory type of a leaf is selected through the PAT: the 3-bit index
//! `PAT << 2 | PCD << 1 | PWT` picks one of eight slots of the `IA32_PAT`
//! MSR. [`PAT_MSR_VALUE`] is the layout this crate encodes against; slots
//! 0..3 equal the power-on default, so mappings made before the MSR is
//! programmed keep their meaning.
//!
//! | Index | PAT | PCD | PWT | [`CachingMode`] |
//! |------:|:---:|:---:|:---:|-----------------|
//! | 0 | 0 | 0 | 0 | `WriteBack` |
//! | 1 | 0 | 0 | 1 | `WriteThrough` |
//! | 2 | 0 | 1 | 0 | `Uncacheable` (UC-) |
//! | 3 | 0 | 1 | 1 | `UncacheableStrong` (UC) |
//! | 4 | 1 | 0 | 0 | `WriteCombining` |
//! | 5 | 1 | 0 | 1 | `WriteProtected` |

use crate::entry::PageTableEntry;
use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{PageSize, PhysicalAddress};

/// Memory type of a mapping.
///
/// The discriminant is the PAT index the mode is encoded with.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum CachingMode {
    #[default]
    WriteBack = 0,
    WriteThrough = 1,
    /// UC-: uncached, but MTRRs may still upgrade to write-combining.
    Uncacheable = 2,
    /// UC: strictly uncached and ordered. Use for device registers.
    UncacheableStrong = 3,
    WriteCombining = 4,
    WriteProtected = 5,
}

impl CachingMode {
    pub const ALL: [Self; 6] = [
        Self::WriteBack,
        Self::WriteThrough,
        Self::Uncacheable,
        Self::UncacheableStrong,
        Self::WriteCombining,
        Self::WriteProtected,
    ];

    #[inline]
    #[must_use]
    pub const fn into_bits(self) -> u8 {
        self as u8
    }

    /// Decode a PAT index; the two spare slots alias their low-half twins.
    #[inline]
    #[must_use]
    pub const fn from_bits(v: u8) -> Self {
        match v & 0b111 {
            0 => Self::WriteBack,
            1 => Self::WriteThrough,
            2 | 6 => Self::Uncacheable,
            4 => Self::WriteCombining,
            5 => Self::WriteProtected,
            _ => Self::UncacheableStrong,
        }
    }

    /// The `IA32_PAT` memory-type encoding of this mode.
    #[inline]
    #[must_use]
    pub const fn memory_type(self) -> u8 {
        match self {
            Self::UncacheableStrong => 0x00,
            Self::WriteCombining => 0x01,
            Self::WriteThrough => 0x04,
            Self::WriteProtected => 0x05,
            Self::WriteBack => 0x06,
            Self::Uncacheable => 0x07,
        }
    }

    /// `(pwt, pcd, pat)` selector bits.
    #[inline]
    #[must_use]
    pub const fn selector(self) -> (bool, bool, bool) {
        let i = self.into_bits();
        (i & 0b001 != 0, i & 0b010 != 0, i & 0b100 != 0)
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_lossless)]
    pub const fn from_selector(pwt: bool, pcd: bool, pat: bool) -> Self {
        Self::from_bits((pat as u8) << 2 | (pcd as u8) << 1 | pwt as u8)
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WriteBack => "WB",
            Self::WriteThrough => "WT",
            Self::Uncacheable => "UC-",
            Self::UncacheableStrong => "UC",
            Self::WriteCombining => "WC",
            Self::WriteProtected => "WP",
        }
    }
}

/// Value to program into `IA32_PAT` so [`CachingMode`] selectors resolve as
/// documented above.
#[allow(clippy::cast_lossless)]
pub const PAT_MSR_VALUE: u64 = {
    let slots = [
        CachingMode::from_bits(0),
        CachingMode::from_bits(1),
        CachingMode::from_bits(2),
        CachingMode::from_bits(3),
        CachingMode::from_bits(4),
        CachingMode::from_bits(5),
        CachingMode::from_bits(6),
        CachingMode::from_bits(7),
    ];
    let mut value = 0u64;
    let mut i = 0;
    while i < slots.len() {
        value |= (slots[i].memory_type() as u64) << (i * 8);
        i += 1;
    }
    value
};

/// What a mapping allows and how it is cached.
#[bitfield(u32)]
#[derive(PartialEq, Eq, Hash)]
pub struct PageAttributes {
    /// x86-64 has no read-deny bit: every present leaf is readable, so this
    /// is not encoded and decodes as `present`.
    pub read: bool,
    pub write: bool,
    pub executable: bool,
    /// Accessible from ring 3.
    pub user: bool,
    /// Survives address space switches.
    pub global: bool,
    /// 2 MiB leaf.
    pub large_page: bool,
    /// 1 GiB leaf.
    pub huge_page: bool,
    #[bits(3)]
    pub caching: CachingMode,
    #[bits(22)]
    __: u32,
}

impl PageAttributes {
    /// Kernel read-only data.
    pub const KERNEL_RO: Self = Self::new().with_read(true).with_global(true);
    /// Kernel data.
    pub const KERNEL_RW: Self = Self::KERNEL_RO.with_write(true);
    /// Kernel code.
    pub const KERNEL_RX: Self = Self::KERNEL_RO.with_executable(true);
    /// User read-only data.
    pub const USER_RO: Self = Self::new().with_read(true).with_user(true);
    /// User data.
    pub const USER_RW: Self = Self::USER_RO.with_write(true);
    /// User code.
    pub const USER_RX: Self = Self::USER_RO.with_executable(true);
    /// Device registers.
    pub const MMIO: Self = Self::KERNEL_RW.with_caching(CachingMode::UncacheableStrong);

    /// Leaf size selected by the size bits.
    #[inline]
    #[must_use]
    pub const fn page_size(self) -> PageSize {
        if self.huge_page() {
            PageSize::Size1G
        } else if self.large_page() {
            PageSize::Size2M
        } else {
            PageSize::Size4K
        }
    }

    /// Copy with the size bits describing `size`.
    #[inline]
    #[must_use]
    pub const fn with_page_size(self, size: PageSize) -> Self {
        self.with_large_page(matches!(size, PageSize::Size2M))
            .with_huge_page(matches!(size, PageSize::Size1G))
    }

    /// Size attributes of the largest page not exceeding `len`.
    #[inline]
    #[must_use]
    pub const fn required_size(len: u64) -> Self {
        Self::new().with_page_size(PageSize::fitting(len))
    }

    /// Hardware leaf entry mapping `phys` with these attributes.
    ///
    /// The leaf is always present; [`read`](Self::read) has no encoding.
    #[must_use]
    pub const fn to_entry(self, phys: PhysicalAddress) -> PageTableEntry {
        let size = self.page_size();
        let (pwt, pcd, pat) = self.caching().selector();
        let mut e = PageTableEntry::new()
            .with_present(true)
            .with_writable(self.write())
            .with_user(self.user())
            .with_global(self.global())
            .with_no_execute(!self.executable())
            .with_write_through(pwt)
            .with_cache_disable(pcd);
        e.set_frame(phys);
        if !matches!(size, PageSize::Size4K) {
            e = e.with_ps_or_pat(true);
        }
        e.with_pat(size, pat)
    }

    /// Decode a leaf found at the level mapping pages of `size`.
    ///
    /// `read` is set exactly when the entry is present.
    #[must_use]
    pub const fn from_entry(entry: PageTableEntry, size: PageSize) -> Self {
        Self::new()
            .with_read(entry.present())
            .with_write(entry.writable())
            .with_executable(!entry.no_execute())
            .with_user(entry.user())
            .with_global(entry.global())
            .with_page_size(size)
            .with_caching(CachingMode::from_selector(
                entry.write_through(),
                entry.cache_disable(),
                entry.pat(size),
            ))
    }

    /// Whether a leaf with these attributes grants everything `required`
    /// asks for. Only the write, user and executable bits are compared.
    #[inline]
    #[must_use]
    pub const fn permits(self, required: Self) -> bool {
        (!required.write() || self.write())
            && (!required.user() || self.user())
            && (!required.executable() || self.executable())
    }
}

impl fmt::Display for PageAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}{}{}{}{} {} {}",
            if self.read() { 'r' } else { '-' },
            if self.write() { 'w' } else { '-' },
            if self.executable() { 'x' } else { '-' },
            if self.user() { 'u' } else { 'k' },
            if self.global() { 'g' } else { '-' },
            self.page_size(),
            self.caching().as_str(),
        )
    }
}
