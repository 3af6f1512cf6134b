//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses handled by the frame
//! allocator, the page map and the kernel heap.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A location in host RAM or MMIO space. |
//! | [`VirtualAddress`] | A page-table translated location. |
//! | [`PageSize`] | One of the three x86-64 leaf sizes (4 KiB, 2 MiB, 1 GiB). |
//! | [`AddressRange`] | A half-open `[base, base + size)` span of virtual addresses. |
//!
//! Both address types are `#[repr(transparent)]` over `u64`, implement
//! `Copy`, `Ord` and `Hash`, and never validate canonicality at runtime: they
//! carry the *kind* of an address so the two cannot be mixed up.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
//! assert_eq!(va.align_down(PageSize::Size4K.bytes()).as_u64(), 0xFFFF_FFFF_8000_1000);
//! assert_eq!(va.page_offset(PageSize::Size4K), 0x234);
//!
//! let pa = PhysicalAddress::new(0x0010_0000);
//! assert!(pa.is_aligned_to(PageSize::Size4K.bytes()));
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod address_range;
mod page_size;
mod physical_address;
mod virtual_address;

pub use address_range::AddressRange;
pub use page_size::PageSize;
pub use physical_address::PhysicalAddress;
pub use virtual_address::VirtualAddress;

/// Align `x` down to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two.
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x12345, 16), 0x12340);
/// assert_eq!(align_down(4096, 4096), 4096);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    x & !(a - 1)
}

/// Align `x` up to the nearest multiple of `a`.
///
/// `a` must be a non-zero power of two and `x + a - 1` must not overflow.
/// Use [`checked_align_up`] where the input is caller controlled.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(1, 4096), 4096);
/// assert_eq!(align_up(4096, 4096), 4096);
/// assert_eq!(align_up(0x12345, 16), 0x12350);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(x: u64, a: u64) -> u64 {
    debug_assert!(a.is_power_of_two());
    (x + a - 1) & !(a - 1)
}

/// Like [`align_up`], but returns `None` instead of overflowing.
#[inline]
#[must_use]
pub const fn checked_align_up(x: u64, a: u64) -> Option<u64> {
    match x.checked_add(a - 1) {
        Some(v) => Some(v & !(a - 1)),
        None => None,
    }
}

/// Number of `unit`-sized blocks needed to hold `bytes` (rounded up).
#[inline]
#[must_use]
pub const fn div_round_up(bytes: u64, unit: u64) -> u64 {
    bytes.div_ceil(unit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_down(0, 4096), 0);
        assert_eq!(align_down(8191, 4096), 4096);
        assert_eq!(align_up(0, 4096), 0);
        assert_eq!(align_up(4097, 4096), 8192);
        assert_eq!(checked_align_up(u64::MAX - 10, 4096), None);
        assert_eq!(checked_align_up(4095, 4096), Some(4096));
    }

    #[test]
    fn round_up_division() {
        assert_eq!(div_round_up(0, 4096), 0);
        assert_eq!(div_round_up(1, 4096), 1);
        assert_eq!(div_round_up(4096, 4096), 1);
        assert_eq!(div_round_up(1_000_000, 4096), 245);
    }
}
