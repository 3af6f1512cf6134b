use crate::{PageSize, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Physical memory address.
///
/// Denotes host RAM or MMIO. Frames handed out by the frame allocator, the
/// targets written into page-table leaves and the roots loaded into CR3 are
/// all `PhysicalAddress`es.
///
/// ### Examples
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
/// assert_eq!(pa.frame_index(PageSize::Size4K), 0x0010_2000_0042 >> 12);
/// assert_eq!(pa.page_offset(PageSize::Size4K), 0x42);
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct PhysicalAddress(u64);

impl PhysicalAddress {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn zero() -> Self {
        Self(0)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether the address is a multiple of `align` (a power of two).
    #[inline]
    #[must_use]
    pub const fn is_aligned_to(self, align: u64) -> bool {
        self.0 & (align - 1) == 0
    }

    #[inline]
    #[must_use]
    pub const fn align_down(self, align: u64) -> Self {
        Self(align_down(self.0, align))
    }

    #[inline]
    #[must_use]
    pub const fn align_up(self, align: u64) -> Self {
        Self(align_up(self.0, align))
    }

    /// Index of the frame containing this address for the given page size.
    #[inline]
    #[must_use]
    pub const fn frame_index(self, size: PageSize) -> u64 {
        self.0 >> size.shift()
    }

    /// Address of frame `index` for the given page size.
    #[inline]
    #[must_use]
    pub const fn from_frame_index(index: u64, size: PageSize) -> Self {
        Self(index << size.shift())
    }

    #[inline]
    #[must_use]
    pub const fn page_offset(self, size: PageSize) -> u64 {
        self.0 & size.offset_mask()
    }

    #[inline]
    #[must_use]
    pub const fn checked_add(self, rhs: u64) -> Option<Self> {
        match self.0.checked_add(rhs) {
            Some(v) => Some(Self(v)),
            None => None,
        }
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PA(0x{:016X})", self.0)
    }
}

impl fmt::Display for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::LowerHex for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for PhysicalAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<PhysicalAddress> for u64 {
    #[inline]
    fn from(v: PhysicalAddress) -> Self {
        v.0
    }
}

impl Add<u64> for PhysicalAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for PhysicalAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

/// Byte distance between two physical addresses.
impl Sub for PhysicalAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}
