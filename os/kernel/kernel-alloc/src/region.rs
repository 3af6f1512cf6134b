//! Virtual memory regions.

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::{AddressRange, PhysicalAddress, VirtualAddress};
use kernel_vmem::{CachingMode, MappedRegion, PageAttributes};

/// How a region may be accessed.
#[bitfield(u8)]
#[derive(PartialEq, Eq, Hash)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    pub user: bool,
    #[bits(4)]
    __: u8,
}

impl Access {
    pub const KERNEL_RW: Self = Self::new().with_read(true).with_write(true);
    pub const USER_RW: Self = Self::KERNEL_RW.with_user(true);
    pub const USER_RX: Self = Self::new().with_read(true).with_execute(true).with_user(true);

    /// Access implied by page attributes.
    #[must_use]
    pub const fn from_attributes(attributes: PageAttributes) -> Self {
        Self::new()
            .with_read(attributes.read())
            .with_write(attributes.write())
            .with_execute(attributes.executable())
            .with_user(attributes.user())
    }
}

impl fmt::Display for Access {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let flag = |on: bool, c: char| if on { c } else { '-' };
        write!(
            f,
            "{}{}{}{}",
            flag(self.read(), 'r'),
            flag(self.write(), 'w'),
            flag(self.execute(), 'x'),
            flag(self.user(), 'u')
        )
    }
}

/// One contiguous virtual range and the frames backing it, if any.
///
/// A region records where it is mapped. It does not own its frames.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    range: AddressRange,
    physical_base: Option<PhysicalAddress>,
    access: Access,
}

impl Region {
    #[must_use]
    pub const fn new(range: AddressRange, access: Access) -> Self {
        Self {
            range,
            physical_base: None,
            access,
        }
    }

    #[must_use]
    pub const fn backed(range: AddressRange, physical_base: PhysicalAddress, access: Access) -> Self {
        Self {
            range,
            physical_base: Some(physical_base),
            access,
        }
    }

    #[inline]
    #[must_use]
    pub const fn virtual_range(&self) -> AddressRange {
        self.range
    }

    #[inline]
    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.range.base()
    }

    /// Exclusive end.
    #[inline]
    #[must_use]
    pub const fn end(&self) -> VirtualAddress {
        self.range.end()
    }

    #[inline]
    #[must_use]
    pub const fn size(&self) -> u64 {
        self.range.size()
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, address: VirtualAddress) -> bool {
        self.range.contains(address)
    }

    #[inline]
    #[must_use]
    pub const fn physical_base(&self) -> Option<PhysicalAddress> {
        self.physical_base
    }

    pub const fn set_physical_base(&mut self, base: Option<PhysicalAddress>) {
        self.physical_base = base;
    }

    #[inline]
    #[must_use]
    pub const fn is_backed(&self) -> bool {
        self.physical_base.is_some()
    }

    #[inline]
    #[must_use]
    pub const fn access(&self) -> Access {
        self.access
    }

    pub const fn set_access(&mut self, access: Access) {
        self.access = access;
    }

    /// 4 KiB write-back attributes carrying this region's access.
    #[must_use]
    pub const fn page_attributes(&self) -> PageAttributes {
        PageAttributes::new()
            .with_read(self.access.read())
            .with_write(self.access.write())
            .with_executable(self.access.execute())
            .with_user(self.access.user())
            .with_global(!self.access.user())
            .with_caching(CachingMode::WriteBack)
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{} {}", self.base(), self.end(), self.access)?;
        match self.physical_base {
            Some(p) => write!(f, " -> {p}"),
            None => f.write_str(" (unbacked)"),
        }
    }
}

impl MappedRegion for Region {
    fn virtual_range(&self) -> AddressRange {
        self.range
    }

    fn physical_base(&self) -> Option<PhysicalAddress> {
        self.physical_base
    }

    fn page_attributes(&self) -> PageAttributes {
        Self::page_attributes(self)
    }
}
