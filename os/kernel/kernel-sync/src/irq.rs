//! Interrupt masking for critical sections shared with interrupt handlers.
//!
//! On bare-metal `x86_64` builds the guard saves `RFLAGS.IF` and executes
//! `cli`/`sti`. Hosted builds (unit and integration tests) have no interrupts
//! to mask, so the guard degrades to a no-op there.

/// Bit 9 of `RFLAGS`.
const RFLAGS_IF: u64 = 1 << 9;

#[cfg(all(target_arch = "x86_64", target_os = "none"))]
mod arch {
    /// Disables hardware interrupts (`cli`).
    ///
    /// # Safety & Privilege
    ///
    /// Must only be called in contexts where `cli` is permitted. Misuse can
    /// hang the system or violate execution environment rules.
    #[inline]
    pub fn cli_stop_interrupts() {
        unsafe { core::arch::asm!("cli", options(nomem, nostack, preserves_flags)) }
    }

    /// Enables hardware interrupts (`sti`).
    ///
    /// # Safety & Privilege
    ///
    /// Must only be called in contexts where `sti` is permitted. Typically used
    /// to restore a previously disabled interrupt state.
    #[inline]
    pub fn sti_enable_interrupts() {
        unsafe { core::arch::asm!("sti", options(nomem, nostack, preserves_flags)) }
    }

    /// Returns the current `RFLAGS` value (via `pushfq/pop`).
    #[inline]
    #[must_use]
    pub fn rflags() -> u64 {
        let r: u64;
        unsafe { core::arch::asm!("pushfq; pop {}", out(reg) r, options(nostack, preserves_flags)) }
        r
    }
}

#[cfg(not(all(target_arch = "x86_64", target_os = "none")))]
mod arch {
    #[inline]
    pub const fn cli_stop_interrupts() {}

    #[inline]
    pub const fn sti_enable_interrupts() {}

    /// Hosted targets report interrupts as disabled, which turns every
    /// [`IrqGuard`](super::IrqGuard) into a no-op.
    #[inline]
    #[must_use]
    pub const fn rflags() -> u64 {
        0
    }
}

pub use arch::{cli_stop_interrupts, rflags, sti_enable_interrupts};

/// Whether hardware interrupts are currently enabled on this CPU.
#[inline]
#[must_use]
pub fn interrupts_enabled() -> bool {
    (rflags() & RFLAGS_IF) != 0
}

/// RAII guard that disables interrupts on creation and restores them on drop.
///
/// `IrqGuard::new()` snapshots the `IF` bit (bit 9 of `RFLAGS`). If interrupts
/// were enabled, it executes `cli`. On drop, it executes `sti` **only** if
/// they were previously enabled, preserving the original state. Guards nest.
///
/// # Examples
///
/// ```
/// use kernel_sync::irq::{IrqGuard, interrupts_enabled};
///
/// let before = interrupts_enabled();
/// {
///     let _g = IrqGuard::new();
///     assert!(!interrupts_enabled());
/// }
/// assert_eq!(interrupts_enabled(), before);
/// ```
pub struct IrqGuard {
    /// Whether interrupts were enabled (IF=1) when the guard was created.
    were_enabled: bool,
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl IrqGuard {
    /// Disables interrupts if they are currently enabled and remembers the state.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        let enabled = interrupts_enabled();
        if enabled {
            cli_stop_interrupts();
        }
        Self {
            were_enabled: enabled,
        }
    }

    /// Whether this guard will re-enable interrupts when dropped.
    #[inline]
    #[must_use]
    pub const fn restores(&self) -> bool {
        self.were_enabled
    }
}

impl Drop for IrqGuard {
    /// Restores interrupts (`sti`) only if they were previously enabled.
    fn drop(&mut self) {
        if self.were_enabled {
            sti_enable_interrupts();
        }
    }
}
