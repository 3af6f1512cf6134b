use crate::{PageSize, align_down, align_up};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

/// Number of index bits per paging level.
const LEVEL_BITS: u32 = 9;

/// Virtual memory address.
///
/// A 48-bit canonical virtual address is split into four 9-bit table indices
/// and a 12-bit page offset:
///
/// ```text
/// | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
/// |  PML4 |  PDPT |   PD  |   PT  | Offset |
/// ```
///
/// [`table_index`](Self::table_index) returns the index used at a given level
/// (4 = PML4, 1 = PT).
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VirtualAddress(u64);

impl VirtualAddress {
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
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as u64)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }

    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

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

    #[inline]
    #[must_use]
    pub const fn page_offset(self, size: PageSize) -> u64 {
        self.0 & size.offset_mask()
    }

    /// Table index for paging `level` (1 = PT, 2 = PD, 3 = PDPT, 4 = PML4).
    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn table_index(self, level: u32) -> usize {
        debug_assert!(level >= 1 && level <= 4);
        let shift = 12 + LEVEL_BITS * (level - 1);
        ((self.0 >> shift) & 0x1ff) as usize
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

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VA(0x{:016X})", self.0)
    }
}

impl fmt::Display for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:016X}", self.0)
    }
}

impl fmt::LowerHex for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

impl From<u64> for VirtualAddress {
    #[inline]
    fn from(v: u64) -> Self {
        Self::new(v)
    }
}

impl From<VirtualAddress> for u64 {
    #[inline]
    fn from(v: VirtualAddress) -> Self {
        v.0
    }
}

impl Add<u64> for VirtualAddress {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl AddAssign<u64> for VirtualAddress {
    #[inline]
    fn add_assign(&mut self, rhs: u64) {
        self.0 += rhs;
    }
}

impl Sub for VirtualAddress {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn table_indices_split_the_address() {
        // PML4=1, PDPT=2, PD=3, PT=4, offset=0x567
        let va = VirtualAddress::new((1 << 39) | (2 << 30) | (3 << 21) | (4 << 12) | 0x567);
        assert_eq!(va.table_index(4), 1);
        assert_eq!(va.table_index(3), 2);
        assert_eq!(va.table_index(2), 3);
        assert_eq!(va.table_index(1), 4);
        assert_eq!(va.page_offset(PageSize::Size4K), 0x567);
    }

    #[test]
    fn higher_half_index() {
        let va = VirtualAddress::new(0xffff_8000_0000_0000);
        assert_eq!(va.table_index(4), 256);
    }
}
