//! # Memory Layout
//!
//! Compile-time configuration shared by the frame allocator, the page maps
//! and the kernel heap.

/// Base page size used by the frame allocator and the kernel heap.
pub const PAGE_SIZE: u64 = 4096;

/// First virtual address handed out to user address spaces.
///
/// Everything below stays unmapped so null-pointer dereferences (plus small
/// offsets) always fault.
pub const USERSPACE_BASE: u64 = 0x0010_0000;

/// End of userspace VA range after which Kernel space begins.
pub const LAST_USERSPACE_ADDRESS: u64 = 0x0000_7fff_ffff_f000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything you map at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Size of the window reserved for the direct map (64 TiB).
pub const HHDM_SIZE: u64 = 0x0000_4000_0000_0000;

/// Kernel virtual window used for device (MMIO) mappings and kernel regions.
///
/// Sits right after the direct map, so both stay inside the kernel half of
/// every address space.
pub const KERNEL_WINDOW_BASE: u64 = HHDM_BASE + HHDM_SIZE;

/// Size of [`KERNEL_WINDOW_BASE`]'s window (1 TiB).
pub const KERNEL_WINDOW_SIZE: u64 = 0x0000_0100_0000_0000;

/// Where the kernel executes (VMA), matches the linker script.
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Where the kernel image is placed in *physical* memory (LMA).
pub const PHYS_LOAD: u64 = 0x0010_0000; // 1 MiB

/// First PML4 slot belonging to the kernel half.
pub const KERNEL_PML4_START: usize = 256;

/// Statically reserved early heap serving allocations before the frame
/// allocator is ready. Also holds the frame bitmap.
pub const EARLY_HEAP_SIZE: usize = 2 * 1024 * 1024;

/// Number of slab buckets in the kernel heap (`8 << 0` ..= `8 << 7`).
pub const HEAP_BUCKET_COUNT: usize = 8;

/// Largest request served by a slab bucket; anything above is a large allocation.
pub const HEAP_MAX_BUCKET_SIZE: usize = 8 << (HEAP_BUCKET_COUNT - 1);

/// Maximum number of memory zones the frame allocator bootstrap path tracks.
pub const MAX_BOOTSTRAP_RUNS: usize = 32;

const _: () = {
    assert!(PAGE_SIZE.is_power_of_two());
    assert!(USERSPACE_BASE.is_multiple_of(PAGE_SIZE));
    assert!(LAST_USERSPACE_ADDRESS < HHDM_BASE);
    assert!(KERNEL_WINDOW_BASE + KERNEL_WINDOW_SIZE < KERNEL_BASE);
    assert!(HEAP_MAX_BUCKET_SIZE == 1024);
    assert!(EARLY_HEAP_SIZE.is_multiple_of(PAGE_SIZE as usize));
    // The direct map and the kernel window must sit in the upper PML4 half.
    assert!(HHDM_BASE >= 0xffff_8000_0000_0000);
};
