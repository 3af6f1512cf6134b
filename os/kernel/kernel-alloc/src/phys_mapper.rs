//! # HHDM-based PhysMapper
//!
//! With a higher-half direct map every physical address `pa` is visible at
//! `offset + pa`. The kernel uses [`HhdmPhysMapper::hhdm`]; host tests point
//! the offset at a buffer standing in for RAM.
//!
//! ## Example
//! ```rust
//! use kernel_alloc::phys_mapper::HhdmPhysMapper;
//! use kernel_memory_addresses::PhysicalAddress;
//! use kernel_vmem::PhysMapper;
//!
//! let mapper = HhdmPhysMapper::new(0xffff_8000_0000_0000);
//! let ptr = mapper.phys_to_ptr(PhysicalAddress::new(0x1000));
//! assert_eq!(ptr.addr(), 0xffff_8000_0000_1000);
//! assert_eq!(mapper.ptr_to_phys(ptr).as_u64(), 0x1000);
//! ```

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a direct map at a fixed offset.
///
/// The direct map must cover every physical address handed to it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct HhdmPhysMapper {
    offset: u64,
}

impl HhdmPhysMapper {
    #[inline]
    #[must_use]
    pub const fn new(offset: u64) -> Self {
        Self { offset }
    }

    /// The kernel's direct map at [`HHDM_BASE`].
    #[inline]
    #[must_use]
    pub const fn hhdm() -> Self {
        Self::new(HHDM_BASE)
    }

    #[inline]
    #[must_use]
    pub const fn offset(&self) -> u64 {
        self.offset
    }
}

impl Default for HhdmPhysMapper {
    fn default() -> Self {
        Self::hhdm()
    }
}

impl PhysMapper for HhdmPhysMapper {
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        core::ptr::with_exposed_provenance_mut(self.offset.wrapping_add(pa.as_u64()) as usize)
    }

    #[inline]
    fn ptr_to_phys(&self, ptr: *const u8) -> PhysicalAddress {
        PhysicalAddress::new((ptr.addr() as u64).wrapping_sub(self.offset))
    }
}
