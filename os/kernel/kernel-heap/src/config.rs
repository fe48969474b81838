/// Upper bound on bytes wiped with `0xff` when a debug build frees memory.
pub const CLEAR_MAX_DEBUG: usize = 1024;

/// Upper bound on bytes wiped with `0xff` when a release build frees memory.
pub const CLEAR_MAX_RELEASE: usize = 128;

/// Runtime switches of a heap.
///
/// The defaults follow `debug_assertions`: debug builds poison every
/// allocation and verify ownership and guard bytes on free.
#[derive(Debug, Copy, Clone)]
pub struct HeapConfig {
    /// Surround every allocation with guard bytes and a caller record.
    pub poison: bool,
    /// Verify the guard bytes on every free (needs `poison`).
    pub check_on_free: bool,
    /// Reject frees of addresses outside of the heap's ranges.
    pub ownership_check: bool,
    /// Bytes of a poisoned allocation wiped on free.
    pub clear_max: usize,
    /// Monotonic clock in seconds; throttles allocation dumps.
    ///
    /// Without a clock only the first throttled dump runs.
    pub clock: Option<fn() -> u64>,
}

impl HeapConfig {
    /// No poisoning and no checks.
    #[must_use]
    pub const fn unchecked() -> Self {
        Self {
            poison: false,
            check_on_free: false,
            ownership_check: false,
            clear_max: CLEAR_MAX_RELEASE,
            clock: None,
        }
    }

    /// Poisoning and every check enabled.
    #[must_use]
    pub const fn checked() -> Self {
        Self {
            poison: true,
            check_on_free: true,
            ownership_check: true,
            clear_max: CLEAR_MAX_DEBUG,
            clock: None,
        }
    }

    #[must_use]
    pub const fn with_clock(mut self, clock: fn() -> u64) -> Self {
        self.clock = Some(clock);
        self
    }
}

impl Default for HeapConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::checked()
        } else {
            Self::unchecked()
        }
    }
}
