use crate::VirtualAddress;
use core::fmt;

/// Half-open span `[base, base + size)` of virtual addresses.
///
/// Empty ranges contain nothing and overlap nothing.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct AddressRange {
    base: VirtualAddress,
    size: u64,
}

impl AddressRange {
    #[inline]
    #[must_use]
    pub const fn new(base: VirtualAddress, size: u64) -> Self {
        Self { base, size }
    }

    /// Range spanning `[start, end)`; `end` must not be below `start`.
    #[inline]
    #[must_use]
    pub const fn from_bounds(start: VirtualAddress, end: VirtualAddress) -> Self {
        debug_assert!(end.as_u64() >= start.as_u64());
        Self::new(start, end.as_u64() - start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Exclusive end. Saturates at the top of the address space.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        VirtualAddress::new(self.base.as_u64().saturating_add(self.size))
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        let a = address.as_u64();
        a >= self.base.as_u64() && a < self.end().as_u64()
    }

    /// Whether `other` lies completely inside this range.
    #[inline]
    #[must_use]
    pub const fn encloses(&self, other: &Self) -> bool {
        other.base.as_u64() >= self.base.as_u64() && other.end().as_u64() <= self.end().as_u64()
    }

    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty()
            && !other.is_empty()
            && self.base.as_u64() < other.end().as_u64()
            && other.base.as_u64() < self.end().as_u64()
    }
}

impl fmt::Debug for AddressRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:#x}..{:#x})", self.base.as_u64(), self.end().as_u64())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(base: u64, size: u64) -> AddressRange {
        AddressRange::new(VirtualAddress::new(base), size)
    }

    #[test]
    fn contains_is_half_open() {
        let r = range(0x1000, 0x2000);
        assert!(r.contains(VirtualAddress::new(0x1000)));
        assert!(r.contains(VirtualAddress::new(0x2fff)));
        assert!(!r.contains(VirtualAddress::new(0x3000)));
        assert!(!r.contains(VirtualAddress::new(0xfff)));
    }

    #[test]
    fn adjacent_ranges_do_not_overlap() {
        assert!(!range(0x1000, 0x1000).overlaps(&range(0x2000, 0x1000)));
        assert!(range(0x1000, 0x1001).overlaps(&range(0x2000, 0x1000)));
        assert!(!range(0x1000, 0).overlaps(&range(0x1000, 0x1000)));
    }

    #[test]
    fn enclosing() {
        assert!(range(0x1000, 0x4000).encloses(&range(0x2000, 0x1000)));
        assert!(!range(0x1000, 0x4000).encloses(&range(0x4000, 0x2000)));
    }
}
