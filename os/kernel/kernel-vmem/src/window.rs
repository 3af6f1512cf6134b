//! # Kernel virtual window
//!
//! A bump allocator over a fixed range of kernel virtual addresses. Space is
//! never returned: device mappings and kernel regions live for the lifetime of
//! the kernel.

use kernel_info::memory::{KERNEL_WINDOW_BASE, KERNEL_WINDOW_SIZE, PAGE_SIZE};
use kernel_memory_addresses::{AddressRange, VirtualAddress, checked_align_up};
use kernel_sync::SpinLock;
use log::{trace, warn};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WindowError {
    #[error("virtual window exhausted ({requested} bytes requested, {remaining} left)")]
    OutOfSpace { requested: u64, remaining: u64 },
    #[error("alignment {0:#x} is not a power of two no larger than a page")]
    BadAlignment(u64),
}

struct Cursor {
    next: u64,
}

pub struct VirtualWindow {
    range: AddressRange,
    cursor: SpinLock<Cursor>,
}

impl VirtualWindow {
    #[must_use]
    pub const fn new(range: AddressRange) -> Self {
        Self {
            range,
            cursor: SpinLock::named("virtual-window", Cursor {
                next: range.base().as_u64(),
            }),
        }
    }

    /// The window reserved for kernel device and region mappings.
    #[must_use]
    pub const fn kernel() -> Self {
        Self::new(AddressRange::new(
            VirtualAddress::new(KERNEL_WINDOW_BASE),
            KERNEL_WINDOW_SIZE,
        ))
    }

    #[must_use]
    pub const fn range(&self) -> AddressRange {
        self.range
    }

    /// Reserve `size` bytes aligned to `alignment` (0 means page alignment).
    ///
    /// # Errors
    /// [`WindowError::BadAlignment`] for alignments that are not a power of
    /// two or exceed the page size; [`WindowError::OutOfSpace`] when the
    /// window cannot hold the request.
    pub fn allocate(&self, size: u64, alignment: u64) -> Result<VirtualAddress, WindowError> {
        let alignment = if alignment == 0 { PAGE_SIZE } else { alignment };
        if !alignment.is_power_of_two() || alignment > PAGE_SIZE {
            return Err(WindowError::BadAlignment(alignment));
        }

        let end = self.range.end().as_u64();
        let mut cursor = self.cursor.lock();
        let remaining = end.saturating_sub(cursor.next);

        let base = checked_align_up(cursor.next, alignment);
        let new_next = base.and_then(|b| b.checked_add(size));
        match (base, new_next) {
            (Some(base), Some(next)) if next <= end => {
                cursor.next = next;
                trace!("window: {size:#x} bytes at {base:#x}");
                Ok(VirtualAddress::new(base))
            }
            _ => {
                warn!("window: cannot reserve {size:#x} bytes, {remaining:#x} left");
                Err(WindowError::OutOfSpace {
                    requested: size,
                    remaining,
                })
            }
        }
    }

    /// Bytes not yet handed out.
    pub fn remaining(&self) -> u64 {
        let next = self.cursor.lock().next;
        self.range.end().as_u64().saturating_sub(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> VirtualWindow {
        VirtualWindow::new(AddressRange::new(VirtualAddress::new(0x4000_0000), 0x10_000))
    }

    #[test]
    fn bumps_and_aligns() {
        let w = small();
        assert_eq!(w.allocate(0x10, 8).unwrap().as_u64(), 0x4000_0000);
        assert_eq!(w.allocate(0x1000, 0).unwrap().as_u64(), 0x4000_1000);
        assert_eq!(w.remaining(), 0xe000);
    }

    #[test]
    fn refuses_large_alignment() {
        let w = small();
        assert_eq!(w.allocate(0x1000, 0x2000), Err(WindowError::BadAlignment(0x2000)));
        assert_eq!(w.allocate(0x1000, 3), Err(WindowError::BadAlignment(3)));
    }

    #[test]
    fn exhaustion_leaves_cursor_alone() {
        let w = small();
        assert!(matches!(w.allocate(0x11_000, 0), Err(WindowError::OutOfSpace { .. })));
        assert_eq!(w.allocate(0x10_000, 0).unwrap().as_u64(), 0x4000_0000);
        assert_eq!(w.remaining(), 0);
        assert!(w.allocate(1, 1).is_err());
    }

    #[test]
    fn kernel_window_sits_in_upper_half() {
        let w = VirtualWindow::kernel();
        assert!(w.range().base().as_u64() >= 0xffff_8000_0000_0000);
    }
}
