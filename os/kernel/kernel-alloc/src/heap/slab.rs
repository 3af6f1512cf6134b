//! Bucket tier.
//!
//! ```text
//!  page (4 KiB)
//!  ┌────────┬─────┬──────────┬──────────┬─────┬──────────┐
//!  │ header │ pad │ chunk 0  │ chunk 1  │ ... │ chunk n-1│
//!  └────────┴─────┴──────────┴──────────┴─────┴──────────┘
//!  ^ ptr & !0xfff  ^ align_up(size_of(header), chunk)
//! ```
//!
//! Free chunks hold the link to the next free chunk of the same bucket. The
//! header keeps one bit per chunk, set while the chunk is handed out, so a
//! repeated or misaligned free is caught instead of corrupting the list.

use super::{PAGE, PageProvider};
use core::ptr::NonNull;
use kernel_info::memory::{HEAP_BUCKET_COUNT, HEAP_MAX_BUCKET_SIZE};
use kernel_sync::SpinLock;
use log::{error, trace};

const SLAB_MAGIC: u32 = 0x51ab_c0de;

/// Occupancy words; enough for the 8-byte class.
const SLOT_WORDS: usize = PAGE / 8 / 64;

#[repr(C)]
struct SlabHeader {
    magic: u32,
    bucket: u32,
    used: [u64; SLOT_WORDS],
}

impl SlabHeader {
    /// Flip the occupancy bit of `slot` to `used`; `false` if it already was.
    fn mark(&mut self, slot: usize, used: bool) -> bool {
        let (word, bit) = (slot / 64, 1u64 << (slot % 64));
        if (self.used[word] & bit != 0) == used {
            return false;
        }
        self.used[word] ^= bit;
        true
    }
}

struct FreeChunk {
    next: Option<NonNull<FreeChunk>>,
}

struct FreeList {
    head: Option<NonNull<FreeChunk>>,
    pages: usize,
    in_use: usize,
}

// SAFETY: the chunks are owned by the bucket and only touched under its lock.
unsafe impl Send for FreeList {}

/// Usage of one size class.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct BucketStats {
    pub chunk_size: usize,
    pub pages: usize,
    /// Chunks carved so far, free or not.
    pub capacity: usize,
    pub in_use: usize,
}

pub(super) struct Bucket {
    list: SpinLock<FreeList>,
}

impl Bucket {
    pub const fn new() -> Self {
        Self {
            list: SpinLock::named("heap-bucket", FreeList {
                head: None,
                pages: 0,
                in_use: 0,
            }),
        }
    }

    #[inline]
    pub const fn chunk_size(index: usize) -> usize {
        8 << index
    }

    /// Smallest bucket holding `size` bytes, `None` above the largest chunk.
    pub fn class_for(size: usize) -> Option<usize> {
        if size > HEAP_MAX_BUCKET_SIZE {
            return None;
        }
        let chunk = size.max(8).next_power_of_two();
        Some((chunk.trailing_zeros() - 3) as usize)
    }

    /// Chunks a page of `index` holds.
    pub const fn chunks_per_page(index: usize) -> usize {
        (PAGE - Self::first_chunk(index)) / Self::chunk_size(index)
    }

    /// Offset of the first chunk in a page of `index`.
    const fn first_chunk(index: usize) -> usize {
        size_of::<SlabHeader>().next_multiple_of(Self::chunk_size(index))
    }

    /// Header of the page holding `ptr` and the chunk slot `ptr` starts.
    ///
    /// # Panics
    /// If `ptr` is not the start of a chunk of `index`.
    fn slot(ptr: NonNull<u8>, index: usize) -> (*mut SlabHeader, usize) {
        let offset = ptr.as_ptr().addr() & (PAGE - 1);
        let first = Self::first_chunk(index);
        let chunk = Self::chunk_size(index);
        if offset < first || (offset - first) % chunk != 0 {
            error!("heap: {ptr:p} is not a {chunk} byte chunk");
            panic!("heap free of {ptr:p} which is not a chunk start");
        }
        let header = ptr.as_ptr().map_addr(|a| a & !(PAGE - 1)).cast::<SlabHeader>();
        (header, (offset - first) / chunk)
    }

    pub fn allocate(&self, index: usize, provider: &impl PageProvider) -> Option<NonNull<u8>> {
        let mut list = self.list.lock_irq();
        if list.head.is_none() {
            Self::refill(&mut list, index, provider)?;
        }
        let chunk = list.head?;
        // SAFETY: free chunks on the list hold a valid link.
        list.head = unsafe { chunk.as_ref().next };
        let (header, slot) = Self::slot(chunk.cast(), index);
        // SAFETY: the page is a slab page of this bucket, guarded by its lock.
        if !unsafe { &mut *header }.mark(slot, true) {
            error!("heap: free chunk {chunk:p} is marked in use");
            panic!("corrupted free list in bucket {}", Self::chunk_size(index));
        }
        list.in_use += 1;
        Some(chunk.cast())
    }

    fn refill(list: &mut FreeList, index: usize, provider: &impl PageProvider) -> Option<()> {
        let page = provider.allocate_pages(1)?;
        let chunk = Self::chunk_size(index);
        let first = Self::first_chunk(index);
        #[allow(clippy::cast_possible_truncation)]
        let bucket = index as u32;

        // SAFETY: a fresh, exclusively owned page.
        unsafe {
            page.cast::<SlabHeader>().write(SlabHeader {
                magic: SLAB_MAGIC,
                bucket,
                used: [0; SLOT_WORDS],
            });
            for offset in (first..PAGE).step_by(chunk).rev() {
                let c = page.add(offset).cast::<FreeChunk>();
                c.write(FreeChunk { next: list.head });
                list.head = Some(c);
            }
        }
        list.pages += 1;
        trace!("heap: bucket {chunk} carved page {page:p}");
        Some(())
    }

    /// Bucket index recorded in the page header of `ptr`.
    ///
    /// # Panics
    /// If the header does not carry the slab magic.
    ///
    /// # Safety
    /// `ptr` must lie in a page carved by this tier.
    pub unsafe fn owner(ptr: NonNull<u8>) -> usize {
        let header = ptr.as_ptr().map_addr(|a| a & !(PAGE - 1)).cast::<SlabHeader>();
        // SAFETY: slab pages start with a header.
        let (magic, bucket) = unsafe { ((*header).magic, (*header).bucket) };
        let index = bucket as usize;
        if magic != SLAB_MAGIC || index >= HEAP_BUCKET_COUNT {
            error!("heap: bad slab header {magic:#x}/{bucket} for {ptr:p}");
            panic!("corrupted slab header for {ptr:p}");
        }
        index
    }

    /// # Panics
    /// If `ptr` is not a chunk start or the chunk is already free.
    ///
    /// # Safety
    /// `ptr` must lie in a slab page of this bucket.
    pub unsafe fn free(&self, ptr: NonNull<u8>, index: usize) {
        let mut list = self.list.lock_irq();
        let (header, slot) = Self::slot(ptr, index);
        // SAFETY: the page is a slab page of this bucket, guarded by its lock.
        if !unsafe { &mut *header }.mark(slot, false) {
            error!("heap: chunk {ptr:p} is already free");
            panic!("double free of heap chunk {ptr:p}");
        }
        let Some(in_use) = list.in_use.checked_sub(1) else {
            error!("heap: bucket {} has no chunks in use", Self::chunk_size(index));
            panic!("heap bucket accounting violated");
        };
        list.in_use = in_use;

        let chunk = ptr.cast::<FreeChunk>();
        // SAFETY: the chunk is ours again and large enough for a link.
        unsafe { chunk.write(FreeChunk { next: list.head }) };
        list.head = Some(chunk);
    }

    pub fn stats(&self, index: usize) -> BucketStats {
        let list = self.list.lock_irq();
        BucketStats {
            chunk_size: Self::chunk_size(index),
            pages: list.pages,
            capacity: list.pages * Self::chunks_per_page(index),
            in_use: list.in_use,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classes_round_up_to_powers_of_two() {
        assert_eq!(Bucket::class_for(0), Some(0));
        assert_eq!(Bucket::class_for(8), Some(0));
        assert_eq!(Bucket::class_for(9), Some(1));
        assert_eq!(Bucket::class_for(1023), Some(7));
        assert_eq!(Bucket::class_for(1024), Some(7));
        assert_eq!(Bucket::class_for(1025), None);
    }

    #[test]
    fn pages_hold_chunks_after_the_header() {
        assert_eq!(size_of::<SlabHeader>(), 72);
        assert_eq!(Bucket::chunks_per_page(0), 503);
        assert_eq!(Bucket::chunks_per_page(1), 251);
        assert_eq!(Bucket::chunks_per_page(6), 62);
        assert_eq!(Bucket::chunks_per_page(7), 3);
    }

    #[test]
    fn occupancy_bits_flip_once() {
        let mut header = SlabHeader {
            magic: SLAB_MAGIC,
            bucket: 0,
            used: [0; SLOT_WORDS],
        };
        assert!(header.mark(502, true));
        assert!(!header.mark(502, true));
        assert_eq!(header.used[7], 1 << (502 % 64));
        assert!(header.mark(502, false));
        assert!(!header.mark(502, false));
    }
}
