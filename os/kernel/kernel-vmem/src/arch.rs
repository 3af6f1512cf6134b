//! # Paging control registers
//!
//! `CR3`, `invlpg` and the `IA32_PAT` MSR. On hosted builds (unit tests,
//! tooling) the privileged instructions are compiled out: writes do nothing
//! and reads return zero.

use bitfield_struct::bitfield;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

/// `IA32_PAT` MSR number.
pub const IA32_PAT: u32 = 0x277;

/// CR3 — Page-Map Level-4 Base Register (PCID disabled).
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–2: reserved.
    #[bits(3)]
    __reserved0: u8,

    /// Bit 3: PWT for PML4 accesses.
    pub pwt: bool,

    /// Bit 4: PCD for PML4 accesses.
    pub pcd: bool,

    /// Bits 5–11: reserved.
    #[bits(7)]
    __reserved1: u8,

    /// Bits 12–51: PML4 physical base >> 12.
    #[bits(40)]
    pml4_base_4k: u64,

    /// Bits 52–63: reserved.
    #[bits(12)]
    __reserved2: u16,
}

impl Cr3 {
    #[inline]
    #[must_use]
    pub const fn from_pml4_phys(pml4: PhysicalAddress) -> Self {
        debug_assert!(pml4.is_aligned_to(0x1000), "PML4 base must be 4K-aligned");
        Self::new().with_pml4_base_4k(pml4.as_u64() >> 12)
    }

    #[inline]
    #[must_use]
    pub const fn pml4_phys(self) -> PhysicalAddress {
        PhysicalAddress::new(self.pml4_base_4k() << 12)
    }
}

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod imp {
    use super::Cr3;

    #[inline]
    pub unsafe fn read_cr3() -> Cr3 {
        let v: u64;
        unsafe { core::arch::asm!("mov {}, cr3", out(reg) v, options(nomem, nostack, preserves_flags)) }
        Cr3::from_bits(v)
    }

    #[inline]
    pub unsafe fn write_cr3(cr3: Cr3) {
        let v = cr3.into_bits();
        unsafe { core::arch::asm!("mov cr3, {}", in(reg) v, options(nostack, preserves_flags)) }
    }

    #[inline]
    pub unsafe fn invlpg(va: u64) {
        unsafe { core::arch::asm!("invlpg [{}]", in(reg) va, options(nostack, preserves_flags)) }
    }

    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub unsafe fn wrmsr(msr: u32, value: u64) {
        let lo = value as u32;
        let hi = (value >> 32) as u32;
        unsafe {
            core::arch::asm!("wrmsr", in("ecx") msr, in("eax") lo, in("edx") hi, options(nostack, preserves_flags));
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod imp {
    use super::Cr3;

    #[inline]
    pub const unsafe fn read_cr3() -> Cr3 {
        Cr3::new()
    }

    #[inline]
    pub const unsafe fn write_cr3(_: Cr3) {}

    #[inline]
    pub const unsafe fn invlpg(_: u64) {}

    #[inline]
    pub const unsafe fn wrmsr(_: u32, _: u64) {}
}

/// Root of the active address space.
///
/// # Safety
/// Must run at CPL0 with paging enabled.
#[inline]
#[must_use]
pub unsafe fn read_cr3() -> Cr3 {
    unsafe { imp::read_cr3() }
}

/// Switch to the address space rooted at `pml4`.
///
/// # Safety
/// The new tables must map the currently executing code, the stack and
/// everything the caller touches next.
#[inline]
pub unsafe fn write_cr3(pml4: PhysicalAddress) {
    unsafe { imp::write_cr3(Cr3::from_pml4_phys(pml4)) }
}

/// Drop the TLB entry for `va` on this CPU.
#[inline]
pub fn invalidate_page(va: VirtualAddress) {
    // SAFETY: invlpg only drops cached translations.
    unsafe { imp::invlpg(va.as_u64()) }
}

/// Load [`PAT_MSR_VALUE`](crate::PAT_MSR_VALUE) into `IA32_PAT`.
///
/// # Safety
/// Must run at CPL0 on every CPU before any mapping relies on slots 4..7.
#[inline]
pub unsafe fn program_pat() {
    unsafe { imp::wrmsr(IA32_PAT, crate::PAT_MSR_VALUE) }
}
