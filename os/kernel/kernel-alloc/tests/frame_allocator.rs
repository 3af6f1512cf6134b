use kernel_alloc::frame_alloc::FrameAllocator;
use kernel_alloc::phys_mapper::HhdmPhysMapper;
use kernel_info::boot::{MemoryMap, MemoryZone, MemoryZoneKind};
use kernel_info::memory::PAGE_SIZE;
use kernel_memory_addresses::PhysicalAddress;

#[repr(align(4096))]
struct Page([u8; 4096]);

/// Simulated RAM covering physical `[0, pages * 4096)`.
fn ram(pages: usize) -> HhdmPhysMapper {
    let buf: &'static mut [Page] = (0..pages).map(|_| Page([0; 4096])).collect::<Vec<_>>().leak();
    HhdmPhysMapper::new(buf.as_mut_ptr().expose_provenance() as u64)
}

fn ready(zones: &'static [MemoryZone], ram_pages: usize) -> FrameAllocator<HhdmPhysMapper> {
    let map = MemoryMap::new(zones);
    let words = FrameAllocator::<HhdmPhysMapper>::bitmap_words(&map, PAGE_SIZE).unwrap();
    let pmm = FrameAllocator::new(ram(ram_pages));
    pmm.initialize(map, PAGE_SIZE, vec![0; words].leak()).unwrap();
    pmm
}

static SIXTEEN_PAGES: [MemoryZone; 1] = [MemoryZone::new(0x10_0000, 16 * 4096, MemoryZoneKind::Usable)];

#[test]
fn fragmentation_blocks_then_free_unblocks() {
    let pmm = ready(&SIXTEEN_PAGES, 0x110);

    assert_eq!(pmm.allocate_pages(4), Some(PhysicalAddress::new(0x10_0000)));
    assert_eq!(pmm.allocate_pages(16), None);

    pmm.free_pages(PhysicalAddress::new(0x10_0000), 4);
    assert_eq!(pmm.allocate_pages(16), Some(PhysicalAddress::new(0x10_0000)));
    assert_eq!(pmm.free_memory(), 0);
}

#[test]
fn accounting_balances_after_every_operation() {
    let pmm = ready(&SIXTEEN_PAGES, 0x110);
    let total = pmm.total_memory();
    assert_eq!(total, 16 * PAGE_SIZE);

    let mut live = Vec::new();
    for count in [1, 3, 2, 5] {
        live.push((pmm.allocate_pages(count).unwrap(), count));
        assert_eq!(pmm.used_memory() + pmm.free_memory(), total);
    }
    assert_eq!(pmm.used_memory(), 11 * PAGE_SIZE);

    // No frame is handed out twice while live.
    let mut frames: Vec<u64> = live
        .iter()
        .flat_map(|&(base, n)| (0..n).map(move |i| base.as_u64() + i * PAGE_SIZE))
        .collect();
    frames.sort_unstable();
    frames.dedup();
    assert_eq!(frames.len(), 11);

    for (base, count) in live {
        pmm.free_pages(base, count);
        assert_eq!(pmm.used_memory() + pmm.free_memory(), total);
    }
    assert_eq!(pmm.free_memory(), total);
}

#[test]
fn cursor_rotates_before_reusing_freed_frames() {
    let pmm = ready(&SIXTEEN_PAGES, 0x110);
    let a = pmm.allocate_pages(1).unwrap();
    pmm.free_pages(a, 1);
    let b = pmm.allocate_pages(1).unwrap();
    assert_eq!(b.as_u64(), a.as_u64() + PAGE_SIZE);
}

static MIXED: [MemoryZone; 4] = [
    MemoryZone::new(0, 0x8000, MemoryZoneKind::Usable),
    MemoryZone::new(0x8000, 0x2000, MemoryZoneKind::AcpiReclaimable),
    MemoryZone::new(0xa000, 0x6000, MemoryZoneKind::Usable),
    MemoryZone::new(0x10_0000, 0x1000, MemoryZoneKind::Framebuffer),
];

#[test]
fn reclaimable_memory_counts_as_used() {
    let pmm = ready(&MIXED, 0x10);
    assert_eq!(pmm.total_memory(), 0x8000 + 0x2000 + 0x6000);
    // Page 0 stays reserved.
    assert_eq!(pmm.free_memory(), 7 * PAGE_SIZE + 6 * PAGE_SIZE);
    assert_eq!(pmm.used_memory(), 3 * PAGE_SIZE);
    assert_eq!(pmm.memory_top().as_u64(), 0x10_1000);
    assert_eq!(pmm.usable_memory_top().as_u64(), 0x10_000);
    assert_eq!(pmm.page_size(), PAGE_SIZE);
}

#[test]
fn runs_never_span_reserved_frames() {
    let pmm = ready(&MIXED, 0x10);
    assert_eq!(pmm.allocate_pages(8), None);
    assert_eq!(pmm.allocate_pages(7).unwrap().as_u64(), 0x1000);
    assert_eq!(pmm.allocate_pages(6).unwrap().as_u64(), 0xa000);
    assert_eq!(pmm.allocate_pages(1), None);
}
