use crate::{RELEASE_HIGH_WATER, RELEASE_LOW_WATER};

/// Debug switches and release thresholds of a [`HeapMgr`](crate::HeapMgr).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapMgrConfig {
    /// Put a filled page in front of every region and verify it on free.
    pub guard_page: bool,
    /// Fill free memory with a pattern and verify it before handing it out.
    pub free_region_check: bool,
    /// Free bytes above which a release is scheduled.
    pub release_high_water: usize,
    /// A release stops once free bytes drop to this.
    pub release_low_water: usize,
}

impl HeapMgrConfig {
    /// Release thresholds only.
    #[must_use]
    pub const fn unchecked() -> Self {
        Self {
            guard_page: false,
            free_region_check: false,
            release_high_water: RELEASE_HIGH_WATER,
            release_low_water: RELEASE_LOW_WATER,
        }
    }

    /// Guard pages and free-region checks enabled.
    #[must_use]
    pub const fn checked() -> Self {
        Self {
            guard_page: true,
            free_region_check: true,
            ..Self::unchecked()
        }
    }

    #[must_use]
    pub const fn with_release_water(mut self, high: usize, low: usize) -> Self {
        self.release_high_water = high;
        self.release_low_water = low;
        self
    }
}

impl Default for HeapMgrConfig {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::checked()
        } else {
            Self::unchecked()
        }
    }
}
