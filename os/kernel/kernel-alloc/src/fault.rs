//! Page-fault information handed to [`MemoryManager::handle_page_fault`](crate::memory_manager::MemoryManager::handle_page_fault).

use bitfield_struct::bitfield;
use core::fmt;
use kernel_memory_addresses::VirtualAddress;

/// Page-fault error code layout (x86-64).
///
/// Reference: Intel SDM Vol. 3A, §6.15.1 "Page-Fault Exception (#PF)".
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultReason {
    /// 0 = non-present page, 1 = protection violation.
    pub present: bool, // bit 0

    /// 0 = read or execute, 1 = write.
    pub write: bool, // bit 1

    /// 0 = supervisor, 1 = user mode (CPL 3).
    pub user: bool, // bit 2

    /// Reserved bit set in a paging structure.
    pub reserved_bit: bool, // bit 3

    pub instruction_fetch: bool, // bit 4

    /// Protection-key violation (CR4.PKE=1).
    pub protection_key: bool, // bit 5

    /// Shadow stack access (CET-SS).
    pub shadow_stack: bool, // bit 6

    #[bits(8)]
    __reserved0: u8,

    /// SGX access-control violation.
    pub sgx: bool, // bit 15

    #[bits(48)]
    __reserved1: u64,
}

impl PageFaultReason {
    #[must_use]
    pub const fn explain(&self) -> &'static str {
        if !self.present() {
            "Non-present page"
        } else if self.reserved_bit() {
            "Reserved bit set in a paging structure"
        } else if self.protection_key() {
            "Protection-key violation"
        } else if self.shadow_stack() {
            "Shadow stack access to protected page"
        } else if self.sgx() {
            "SGX access-control violation"
        } else if self.instruction_fetch() {
            if self.user() {
                "User-mode instruction fetch on protected page (likely NX or SMEP)"
            } else {
                "Kernel instruction fetch on protected page"
            }
        } else if self.write() {
            "Write access to protected page"
        } else {
            "Read access to protected page"
        }
    }
}

impl fmt::Display for PageFaultReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = if self.instruction_fetch() {
            "fetch"
        } else if self.write() {
            "write"
        } else {
            "read"
        };
        let mode = if self.user() { "user" } else { "kernel" };
        write!(f, "{} ({mode} {access})", self.explain())
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PageFaultInfo {
    /// Faulting address (CR2).
    pub address: VirtualAddress,
    pub reason: PageFaultReason,
}

impl PageFaultInfo {
    #[must_use]
    pub const fn new(address: VirtualAddress, reason: PageFaultReason) -> Self {
        Self { address, reason }
    }
}

impl fmt::Display for PageFaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page fault at {}: {}", self.address, self.reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_error_code_bits() {
        let r = PageFaultReason::from_bits(0b111);
        assert!(r.present() && r.write() && r.user());
        assert!(PageFaultReason::from_bits(1 << 15).sgx());
        assert!(PageFaultReason::from_bits(1 << 6).shadow_stack());
    }

    #[test]
    fn explains_the_cause() {
        assert_eq!(PageFaultReason::new().explain(), "Non-present page");
        let nx = PageFaultReason::new()
            .with_present(true)
            .with_instruction_fetch(true)
            .with_user(true);
        assert!(nx.explain().contains("NX"));
        let info = PageFaultInfo::new(VirtualAddress::new(0x1000), PageFaultReason::new().with_write(true));
        let s = format!("{info}");
        assert!(s.contains("Non-present page (kernel write)"), "{s}");
    }
}
