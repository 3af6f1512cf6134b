//! Local interrupt masking.
//!
//! On the bare-metal x86-64 target these use `cli`/`sti` and `pushfq/pop`.
//! Hosted builds (unit tests, tooling) cannot execute privileged
//! instructions, so there the interrupt flag is reported as clear and the
//! guard does nothing.

/// `IF` bit in `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    #[inline]
    pub fn disable() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn enable() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    #[inline]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn disable() {}

    #[inline]
    pub const fn enable() {}

    #[inline]
    pub const fn rflags() -> u64 {
        0
    }
}

/// Whether local interrupts are currently enabled.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    arch::rflags() & RFLAGS_IF != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// Interrupts are only re-enabled if they were enabled when the guard was
/// created, so guards nest.
pub struct IrqGuard {
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            arch::disable();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether interrupts were enabled when this guard was taken.
    #[inline]
    #[must_use]
    pub const fn were_enabled(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        if self.were_enabled {
            arch::enable();
        }
    }
}
