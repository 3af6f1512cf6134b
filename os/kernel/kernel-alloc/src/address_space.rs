//! # Address Space Region Tracker
//!
//! Ordered, non-overlapping [`Region`]s inside a reserved virtual window.
//!
//! ```text
//!  window.base                                            window.end
//!      │  [region]   gap   [region][region]      gap         │
//!      └──────────────────────────────────────────────────────┘
//! ```
//!
//! New regions go into the first gap that fits (aligned first-fit). The
//! tracker only records ranges; mapping and freeing frames is up to the
//! caller.

use crate::region::{Access, Region};
use alloc::collections::BTreeMap;
use kernel_info::memory::{LAST_USERSPACE_ADDRESS, PAGE_SIZE, USERSPACE_BASE};
use kernel_memory_addresses::{AddressRange, VirtualAddress, checked_align_up};
use log::{debug, trace};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("region size is zero")]
    ZeroSize,
    #[error("alignment {0:#x} is not a power of two")]
    BadAlignment(u64),
    #[error("address {0} is not page aligned")]
    Unaligned(VirtualAddress),
    #[error("range {0:?} lies outside the address space window")]
    OutsideWindow(AddressRange),
    #[error("range {0:?} overlaps an existing region")]
    Overlaps(AddressRange),
    #[error("no gap of {size:#x} bytes left in the window")]
    NoSpace { size: u64 },
}

pub struct AddressSpace {
    window: AddressRange,
    regions: BTreeMap<u64, Region>,
}

impl AddressSpace {
    #[must_use]
    pub const fn new(window: AddressRange) -> Self {
        Self {
            window,
            regions: BTreeMap::new(),
        }
    }

    /// The user window `[USERSPACE_BASE, LAST_USERSPACE_ADDRESS)`.
    #[must_use]
    pub const fn user() -> Self {
        Self::new(AddressRange::from_bounds(
            VirtualAddress::new(USERSPACE_BASE),
            VirtualAddress::new(LAST_USERSPACE_ADDRESS),
        ))
    }

    #[inline]
    #[must_use]
    pub const fn window(&self) -> AddressRange {
        self.window
    }

    /// Reserve an unbacked region of `size` bytes (rounded up to pages).
    ///
    /// `alignment` 0 means page alignment.
    ///
    /// # Errors
    /// [`RegionError::ZeroSize`], [`RegionError::BadAlignment`], or
    /// [`RegionError::NoSpace`] when no gap fits.
    pub fn allocate_region(&mut self, size: u64, alignment: u64, access: Access) -> Result<Region, RegionError> {
        let size = page_size_of(size)?;
        let alignment = match alignment {
            0 => PAGE_SIZE,
            a if !a.is_power_of_two() => return Err(RegionError::BadAlignment(a)),
            a => a.max(PAGE_SIZE),
        };

        let end = self.window.end().as_u64();
        let mut cursor = self.window.base().as_u64();
        for region in self.regions.values() {
            if let Some(base) = fits(cursor, size, alignment, region.base().as_u64()) {
                return self.insert_unchecked(base, size, access);
            }
            cursor = cursor.max(region.end().as_u64());
        }
        match fits(cursor, size, alignment, end) {
            Some(base) => self.insert_unchecked(base, size, access),
            None => {
                debug!("address space: no gap for {size:#x} bytes aligned {alignment:#x}");
                Err(RegionError::NoSpace { size })
            }
        }
    }

    /// Reserve `[virt, virt + size)` exactly.
    ///
    /// # Errors
    /// [`RegionError::Unaligned`] for an unaligned `virt`,
    /// [`RegionError::OutsideWindow`], or [`RegionError::Overlaps`].
    pub fn allocate_fixed(&mut self, virt: VirtualAddress, size: u64, access: Access) -> Result<Region, RegionError> {
        let size = page_size_of(size)?;
        if !virt.is_aligned_to(PAGE_SIZE) {
            return Err(RegionError::Unaligned(virt));
        }
        let region = Region::new(AddressRange::new(virt, size), access);
        self.insert(region)?;
        Ok(region)
    }

    /// Add `region` to the tree.
    ///
    /// # Errors
    /// [`RegionError::ZeroSize`], [`RegionError::OutsideWindow`] or
    /// [`RegionError::Overlaps`]; the tree is unchanged on error.
    pub fn insert(&mut self, region: Region) -> Result<(), RegionError> {
        let range = region.virtual_range();
        if range.is_empty() {
            return Err(RegionError::ZeroSize);
        }
        if !self.window.encloses(&range) {
            return Err(RegionError::OutsideWindow(range));
        }
        if !self.is_available(range.base(), range.size()) {
            return Err(RegionError::Overlaps(range));
        }
        trace!("address space: + {region}");
        self.regions.insert(range.base().as_u64(), region);
        Ok(())
    }

    fn insert_unchecked(&mut self, base: u64, size: u64, access: Access) -> Result<Region, RegionError> {
        let region = Region::new(AddressRange::new(VirtualAddress::new(base), size), access);
        trace!("address space: + {region}");
        self.regions.insert(base, region);
        Ok(region)
    }

    /// The region containing `address`.
    #[must_use]
    pub fn find(&self, address: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=address.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(address))
    }

    pub fn find_mut(&mut self, address: VirtualAddress) -> Option<&mut Region> {
        self.regions
            .range_mut(..=address.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.contains(address))
    }

    /// Forget the region starting at `base`. Its mappings and frames are untouched.
    pub fn erase(&mut self, base: VirtualAddress) -> Option<Region> {
        let region = self.regions.remove(&base.as_u64());
        if let Some(r) = &region {
            trace!("address space: - {r}");
        }
        region
    }

    /// Whether `[base, base + len)` is free of regions.
    #[must_use]
    pub fn is_available(&self, base: VirtualAddress, len: u64) -> bool {
        let Some(end) = base.as_u64().checked_add(len) else {
            return false;
        };
        let range = AddressRange::new(base, len);
        // Only the last region starting before `end` can reach into the range.
        self.regions
            .range(..end)
            .next_back()
            .is_none_or(|(_, r)| !r.virtual_range().overlaps(&range))
    }

    pub fn clear(&mut self) {
        debug!("address space: dropping {} regions", self.regions.len());
        self.regions.clear();
    }

    /// Regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.regions.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl Default for AddressSpace {
    fn default() -> Self {
        Self::user()
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("window", &self.window)
            .field("regions", &self.regions.len())
            .finish()
    }
}

fn page_size_of(size: u64) -> Result<u64, RegionError> {
    if size == 0 {
        return Err(RegionError::ZeroSize);
    }
    checked_align_up(size, PAGE_SIZE).ok_or(RegionError::NoSpace { size })
}

/// Aligned base in `[cursor, limit)` with room for `size`, if any.
fn fits(cursor: u64, size: u64, alignment: u64, limit: u64) -> Option<u64> {
    let base = checked_align_up(cursor, alignment)?;
    (base.checked_add(size)? <= limit).then_some(base)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn small() -> AddressSpace {
        AddressSpace::new(AddressRange::new(va(0x10_0000), 0x10_0000))
    }

    fn assert_disjoint(space: &AddressSpace) {
        let regions: Vec<_> = space.iter().collect();
        for pair in regions.windows(2) {
            assert!(pair[0].end() <= pair[1].base(), "{} / {}", pair[0], pair[1]);
        }
    }

    #[test]
    fn first_fit_fills_gaps() {
        let mut s = small();
        let a = s.allocate_region(0x1000, 0, Access::USER_RW).unwrap();
        let b = s.allocate_region(0x1800, 0, Access::USER_RW).unwrap();
        assert_eq!(a.base(), va(0x10_0000));
        assert_eq!(b.base(), va(0x10_1000));
        assert_eq!(b.size(), 0x2000);

        s.erase(a.base()).unwrap();
        let c = s.allocate_region(0x1000, 0, Access::USER_RW).unwrap();
        assert_eq!(c.base(), va(0x10_0000));
        assert_disjoint(&s);
    }

    #[test]
    fn alignment_is_honored() {
        let mut s = small();
        s.allocate_region(0x1000, 0, Access::USER_RW).unwrap();
        let r = s.allocate_region(0x1000, 0x1_0000, Access::USER_RW).unwrap();
        assert_eq!(r.base(), va(0x11_0000));
        assert_eq!(
            s.allocate_region(0x1000, 0x3000, Access::USER_RW),
            Err(RegionError::BadAlignment(0x3000))
        );
    }

    #[test]
    fn fixed_regions_are_checked() {
        let mut s = small();
        s.allocate_fixed(va(0x10_4000), 0x2000, Access::USER_RW).unwrap();
        assert!(matches!(
            s.allocate_fixed(va(0x10_5000), 0x1000, Access::USER_RW),
            Err(RegionError::Overlaps(_))
        ));
        assert!(matches!(
            s.allocate_fixed(va(0x10_3000), 0x2000, Access::USER_RW),
            Err(RegionError::Overlaps(_))
        ));
        assert_eq!(
            s.allocate_fixed(va(0x10_0010), 0x1000, Access::USER_RW),
            Err(RegionError::Unaligned(va(0x10_0010)))
        );
        assert!(matches!(
            s.allocate_fixed(va(0x1ff_000), 0x2000, Access::USER_RW),
            Err(RegionError::OutsideWindow(_))
        ));
        s.allocate_fixed(va(0x10_3000), 0x1000, Access::USER_RW).unwrap();
        s.allocate_fixed(va(0x10_6000), 0x1000, Access::USER_RW).unwrap();
        assert_eq!(s.len(), 3);
        assert_disjoint(&s);

        // The allocator skips the fixed regions.
        let r = s.allocate_region(0x4000, 0, Access::USER_RW).unwrap();
        assert_eq!(r.base(), va(0x10_7000));
    }

    #[test]
    fn find_locates_containing_region() {
        let mut s = small();
        let r = s.allocate_fixed(va(0x10_2000), 0x2000, Access::USER_RW).unwrap();
        assert_eq!(s.find(va(0x10_2000)), Some(&r));
        assert_eq!(s.find(va(0x10_3fff)), Some(&r));
        assert_eq!(s.find(va(0x10_4000)), None);
        assert_eq!(s.find(va(0x10_1fff)), None);

        s.find_mut(va(0x10_3000))
            .unwrap()
            .set_physical_base(Some(kernel_memory_addresses::PhysicalAddress::new(0x5000)));
        assert!(s.find(va(0x10_2000)).unwrap().is_backed());
    }

    #[test]
    fn exhaustion_reports_no_space() {
        let mut s = small();
        s.allocate_region(0x10_0000, 0, Access::USER_RW).unwrap();
        assert_eq!(
            s.allocate_region(1, 0, Access::USER_RW),
            Err(RegionError::NoSpace { size: 0x1000 })
        );
        assert_eq!(s.allocate_region(0, 0, Access::USER_RW), Err(RegionError::ZeroSize));
        s.clear();
        assert!(s.is_empty());
    }

    #[test]
    fn mixed_sequences_never_overlap() {
        let mut s = small();
        let mut seed = 0x2545_f491_u64;
        let mut next = move || {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            seed
        };
        for _ in 0..500 {
            match next() % 3 {
                0 => {
                    let _ = s.allocate_region((next() % 8 + 1) * 0x800, 0, Access::USER_RW);
                }
                1 => {
                    let base = 0x10_0000 + (next() % 0x100) * 0x1000;
                    let _ = s.allocate_fixed(va(base), (next() % 4 + 1) * 0x1000, Access::USER_RW);
                }
                _ => {
                    let victim = s.iter().nth((next() % 4) as usize).map(Region::base);
                    if let Some(base) = victim {
                        s.erase(base);
                    }
                }
            }
            assert_disjoint(&s);
        }
    }

    #[test]
    fn default_is_the_user_window() {
        let s = AddressSpace::default();
        assert_eq!(s.window().base(), va(USERSPACE_BASE));
        assert_eq!(s.window().end(), va(LAST_USERSPACE_ADDRESS));
    }
}
