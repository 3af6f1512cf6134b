//! # Boot Memory Information
//!
//! The memory map handed over by the bootloader. It is immutable after the
//! hand-off and consumed exactly once, by the frame allocator.

use core::fmt;
use kernel_memory_addresses::PhysicalAddress;

/// Type tag of a bootloader-reported memory span.
#[repr(u32)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum MemoryZoneKind {
    /// Free RAM; the only kind that contributes allocatable frames.
    Usable = 0,
    Reserved = 1,
    /// ACPI tables; reclaimable once parsed. Counted as used.
    AcpiReclaimable = 2,
    AcpiNvs = 3,
    BadMemory = 4,
    /// Loader data structures; reclaimable later. Counted as used.
    BootloaderReclaimable = 5,
    /// The kernel image and boot modules. Counted as used.
    KernelAndModules = 6,
    Framebuffer = 7,
}

impl MemoryZoneKind {
    /// Whether the zone counts towards total memory.
    ///
    /// Usable RAM plus the kinds that hold live data which could be
    /// reclaimed later.
    #[must_use]
    pub const fn is_ram(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::AcpiReclaimable | Self::BootloaderReclaimable | Self::KernelAndModules
        )
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Usable => "Usable",
            Self::Reserved => "Reserved",
            Self::AcpiReclaimable => "ACPI Reclaimable",
            Self::AcpiNvs => "ACPI NVS",
            Self::BadMemory => "Bad Memory",
            Self::BootloaderReclaimable => "Bootloader Reclaimable",
            Self::KernelAndModules => "Kernel and Modules",
            Self::Framebuffer => "Framebuffer",
        }
    }
}

impl fmt::Display for MemoryZoneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One bootloader-reported span of physical memory.
#[repr(C)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MemoryZone {
    pub base: PhysicalAddress,
    pub length: u64,
    pub kind: MemoryZoneKind,
}

impl MemoryZone {
    #[must_use]
    pub const fn new(base: u64, length: u64, kind: MemoryZoneKind) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            length,
            kind,
        }
    }

    /// Exclusive end address.
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.base.as_u64().saturating_add(self.length))
    }

    #[must_use]
    pub const fn is_usable(&self) -> bool {
        matches!(self.kind, MemoryZoneKind::Usable)
    }
}

/// Borrowed view of the boot memory map.
#[derive(Copy, Clone, Debug)]
pub struct MemoryMap<'a> {
    zones: &'a [MemoryZone],
}

impl<'a> MemoryMap<'a> {
    #[must_use]
    pub const fn new(zones: &'a [MemoryZone]) -> Self {
        Self { zones }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.zones.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    #[must_use]
    pub const fn zones(&self) -> &'a [MemoryZone] {
        self.zones
    }

    pub fn iter(&self) -> impl Iterator<Item = &'a MemoryZone> + use<'a> {
        self.zones.iter()
    }

    pub fn usable(&self) -> impl Iterator<Item = &'a MemoryZone> + use<'a> {
        self.zones.iter().filter(|z| z.is_usable())
    }

    /// Highest end address of any zone.
    #[must_use]
    pub fn memory_top(&self) -> PhysicalAddress {
        self.iter().map(MemoryZone::end).max().unwrap_or_default()
    }

    /// Highest end address of any usable zone.
    #[must_use]
    pub fn usable_top(&self) -> PhysicalAddress {
        self.usable().map(MemoryZone::end).max().unwrap_or_default()
    }
}

/// Paging depth the bootloader left enabled.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PagingMode {
    #[default]
    Level4,
    Level5,
}

/// Everything the memory subsystem needs from the boot hand-off.
#[derive(Copy, Clone, Debug)]
pub struct BootMemoryInfo<'a> {
    pub kernel_physical_base: PhysicalAddress,
    pub kernel_virtual_base: u64,
    pub higher_half_offset: u64,
    pub paging_mode: PagingMode,
    pub memory_map: MemoryMap<'a>,
}
