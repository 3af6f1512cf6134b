//! Large tier: whole pages behind a one-page header.
//!
//! ```text
//!  ┌──────────────┬────────────────────────────────────┐
//!  │ header page  │ payload (ceil(size / 4096) pages)  │
//!  └──────────────┴────────────────────────────────────┘
//!                 ^ returned pointer (page aligned)
//! ```

use super::{PAGE, PageProvider};
use core::ptr::NonNull;
use log::{error, trace};

const LARGE_MAGIC: u64 = 0x1a46_e0b1_0c4e_a900;

#[repr(C)]
struct LargeHeader {
    magic: u64,
    pages: usize,
    size: usize,
}

/// Pages needed for `size` payload bytes, header included.
pub(super) fn pages_for(size: usize) -> Option<usize> {
    size.div_ceil(PAGE).max(1).checked_add(1)
}

/// Returns the payload pointer and the page count taken.
pub(super) fn allocate(provider: &impl PageProvider, size: usize) -> Option<(NonNull<u8>, usize)> {
    let pages = pages_for(size)?;
    let base = provider.allocate_pages(pages)?;
    // SAFETY: `pages >= 2` fresh pages.
    unsafe {
        base.cast::<LargeHeader>().write(LargeHeader {
            magic: LARGE_MAGIC,
            pages,
            size,
        });
        trace!("heap: large {size} bytes in {pages} pages at {base:p}");
        Some((base.add(PAGE), pages))
    }
}

/// # Panics
/// If the header page does not carry the large-allocation magic.
///
/// # Safety
/// `ptr` must be a live payload pointer of this tier.
unsafe fn header<'a>(ptr: NonNull<u8>) -> &'a mut LargeHeader {
    // SAFETY: the header page precedes every payload.
    let header = unsafe { &mut *ptr.as_ptr().sub(PAGE).cast::<LargeHeader>() };
    if header.magic != LARGE_MAGIC {
        error!("heap: bad large header {:#x} for {ptr:p}", header.magic);
        panic!("corrupted large allocation header for {ptr:p}");
    }
    header
}

/// Requested size recorded for `ptr`.
///
/// # Safety
/// As for [`free`].
pub(super) unsafe fn size_of(ptr: NonNull<u8>) -> usize {
    unsafe { header(ptr) }.size
}

/// Record a new size if it fits the pages already held.
///
/// # Safety
/// As for [`free`].
pub(super) unsafe fn resize_in_place(ptr: NonNull<u8>, size: usize) -> bool {
    let header = unsafe { header(ptr) };
    if pages_for(size) == Some(header.pages) {
        header.size = size;
        true
    } else {
        false
    }
}

/// Return every page of the allocation; yields the page count.
///
/// # Safety
/// `ptr` must be a live payload pointer of this tier.
pub(super) unsafe fn free(provider: &impl PageProvider, ptr: NonNull<u8>) -> usize {
    let pages = unsafe { header(ptr) }.pages;
    // SAFETY: the header page is the allocation's base.
    unsafe {
        let base = ptr.sub(PAGE);
        base.cast::<LargeHeader>().write(LargeHeader {
            magic: 0,
            pages: 0,
            size: 0,
        });
        provider.free_pages(base, pages);
    }
    pages
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_page_is_extra() {
        assert_eq!(pages_for(1025), Some(2));
        assert_eq!(pages_for(4096), Some(2));
        assert_eq!(pages_for(4097), Some(3));
        assert_eq!(pages_for(1_000_000), Some(246));
    }
}
