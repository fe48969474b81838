use crate::inner::SpaceInner;
use crate::range::{AddrRange, DynamicRange, Geometry, StaticRange};
use crate::scratch::Scratch;
use crate::stats::BuddyStats;
use crate::{BuddyError, MAX_REF_COUNT};
use core::hint::spin_loop;
use core::panic::Location;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use kernel_sync::SpinLock;
use log::{debug, trace, warn};

/// Color constraint of an allocation.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Color {
    /// Take a buffer of any color.
    Any,
    /// Take a buffer of this color, counted at the requested size class.
    Fixed(u32),
}

/// A buddy-managed range of locations.
///
/// All tables live in the scratch memory passed at creation and hot-add, which
/// the space borrows for `'a`. Operations take `&self`; share the space
/// between CPUs by reference.
pub struct MemorySpace<'a> {
    geo: Geometry,
    inner: SpinLock<SpaceInner<'a>>,
    /// Serializes hot-add; ordered before `inner`.
    hot_add: SpinLock<()>,
    ref_count: AtomicU32,
    destroying: AtomicBool,
    valid: AtomicBool,
}

/// Holds a reference on a space for the duration of one operation.
struct RefGuard<'s> {
    count: &'s AtomicU32,
}

impl Drop for RefGuard<'_> {
    fn drop(&mut self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
    }
}

impl<'a> MemorySpace<'a> {
    /// Create a space with a fixed extent.
    ///
    /// `scratch` must hold at least [`StaticRange::mem_req`] bytes. Every
    /// range in `carve` becomes free buffers right away.
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if the range is malformed or `scratch`
    /// is too small.
    pub fn create_static(
        range: &StaticRange,
        scratch: &'a mut [u8],
        carve: &[AddrRange],
    ) -> Result<Self, BuddyError> {
        Self::create(Geometry::new_static(range)?, scratch, carve)
    }

    /// Create a space that may grow up to `range.max_len` through
    /// [`hot_add_range`](Self::hot_add_range).
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if the range is malformed or `scratch`
    /// is too small.
    pub fn create_dynamic(
        range: &DynamicRange,
        scratch: &'a mut [u8],
        carve: &[AddrRange],
    ) -> Result<Self, BuddyError> {
        Self::create(Geometry::new_dynamic(range)?, scratch, carve)
    }

    fn create(geo: Geometry, scratch: &'a mut [u8], carve: &[AddrRange]) -> Result<Self, BuddyError> {
        let required = geo.mem_req();
        if scratch.len() < required {
            warn!(
                "buddy {}: scratch memory of {} bytes, {required} required",
                geo.name,
                scratch.len()
            );
            return Err(BuddyError::BadParameter);
        }

        let mut scratch = Scratch::new(scratch);
        let inner = SpaceInner::new(geo, &mut scratch)?;
        inner.check_storage(0, geo.initial_blocks)?;

        let space = Self {
            geo,
            inner: SpinLock::new(inner),
            hot_add: SpinLock::new(()),
            ref_count: AtomicU32::new(0),
            destroying: AtomicBool::new(false),
            valid: AtomicBool::new(true),
        };
        space.carve(carve);

        debug!(
            "buddy {}: created {} space [{:#x}, {:#x}) min {:#x} max {:#x}, {} scratch bytes left",
            geo.name,
            if geo.dynamic { "dynamic" } else { "static" },
            u64::from(geo.start_buf) << geo.min_shift,
            u64::from(geo.end_buf) << geo.min_shift,
            1u64 << geo.min_shift,
            1u64 << geo.max_shift,
            scratch.remaining()
        );
        Ok(space)
    }

    /// Take a reference, failing once a destroy has started.
    fn enter(&self) -> Result<RefGuard<'_>, BuddyError> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(BuddyError::InvalidHandle);
        }
        let prev = self.ref_count.fetch_add(1, Ordering::SeqCst);
        let guard = RefGuard {
            count: &self.ref_count,
        };
        debug_assert!(prev < MAX_REF_COUNT, "buddy {}: too many callers", self.geo.name);
        if self.destroying.load(Ordering::SeqCst) {
            return Err(BuddyError::Failure);
        }
        Ok(guard)
    }

    /// Split every range into free buffers, one aligned piece at a time.
    fn carve(&self, ranges: &[AddrRange]) {
        for range in ranges {
            let Some((start, end)) = self.inner.lock_irq().carve_bounds(range) else {
                continue;
            };
            let mut buf = start;
            while buf < end {
                let mut inner = self.inner.lock_irq();
                let (shift, units) = inner.next_piece(buf, end - buf);
                inner.carve_piece(buf, shift);
                buf += units;
            }
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.geo.name
    }

    /// Minimum buffer size in location units.
    #[must_use]
    pub const fn min_size(&self) -> u32 {
        1 << self.geo.min_shift
    }

    /// Maximum buffer size in location units.
    #[must_use]
    pub const fn max_size(&self) -> u32 {
        1 << self.geo.max_shift
    }

    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        self.geo.dynamic
    }

    /// Number of colors of the size class that serves `size`.
    #[must_use]
    pub fn num_colors(&self, size: u32) -> u32 {
        let shift = size.next_power_of_two().trailing_zeros().max(self.geo.min_shift);
        self.geo.num_colors(shift)
    }

    /// Color of `loc` when viewed as a buffer of `size`.
    #[must_use]
    pub fn color_of(&self, loc: u32, size: u32) -> u32 {
        let shift = size.next_power_of_two().trailing_zeros().max(self.geo.min_shift);
        self.geo.color_of(loc >> self.geo.min_shift, shift)
    }

    /// Allocate `size` location units of any color.
    ///
    /// # Errors
    /// See [`allocate_color`](Self::allocate_color).
    #[track_caller]
    pub fn allocate(&self, size: u32) -> Result<u32, BuddyError> {
        self.allocate_color(size, Color::Any)
    }

    /// Allocate `size` location units and return the location.
    ///
    /// The result is aligned to the size class of `size`. Only
    /// `size` rounded up to the minimum size stays allocated.
    ///
    /// # Errors
    /// * [`BuddyError::Unsupported`] for a zero size or one above [`max_size`](Self::max_size).
    /// * [`BuddyError::BadParameter`] for a color out of range.
    /// * [`BuddyError::NoBuffers`] if nothing fits.
    /// * [`BuddyError::Failure`] while the space is being destroyed.
    #[track_caller]
    pub fn allocate_color(&self, size: u32, color: Color) -> Result<u32, BuddyError> {
        let caller = Location::caller();
        let _ref = self.enter()?;
        let result = self.inner.lock_irq().allocate(size, color);
        match result {
            Ok(loc) => trace!("buddy {}: {size:#x} at {loc:#x} for {caller}", self.geo.name),
            Err(e) => trace!("buddy {}: {size:#x} ({color:?}) for {caller}: {e}", self.geo.name),
        }
        result
    }

    /// Free an allocation and return its size in location units.
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if `loc` is not an allocated location.
    pub fn free(&self, loc: u32) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        self.inner.lock_irq().free(loc)
    }

    /// Size of the allocation at `loc`.
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if `loc` is not an allocated location.
    pub fn get_loc_size(&self, loc: u32) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        self.inner.lock_irq().loc_size(loc)
    }

    /// Claim the free buffer that encloses `*loc`.
    ///
    /// On success `*loc` is moved to the start of the buffer and its size is
    /// returned. Otherwise `*loc` advances to the next free buffer (within a
    /// bounded scan) and [`BuddyError::NoBuffers`] is returned, so repeated
    /// calls sweep the space.
    ///
    /// # Errors
    /// [`BuddyError::Failure`] with `*loc` unchanged if it lies outside the space.
    pub fn alloc_range(&self, loc: &mut u32) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        self.inner.lock_irq().alloc_range(loc)
    }

    /// Block-aligned span of `[start, start + len)`, checked against the window.
    fn hot_add_span(&self, start: u32, len: u32) -> Option<(u64, u64)> {
        let (s, e) = self.geo.block_span(start, len);
        let window_start = u64::from(self.geo.start_buf) << self.geo.min_shift;
        let window_end = u64::from(self.geo.limit_buf) << self.geo.min_shift;
        (s >= window_start && e <= window_end).then_some((s, e))
    }

    /// Scratch bytes [`hot_add_range`](Self::hot_add_range) needs for this range.
    ///
    /// Zero if every touched block already has storage.
    ///
    /// # Errors
    /// * [`BuddyError::Failure`] for static spaces.
    /// * [`BuddyError::BadParameter`] if the range is outside the window.
    pub fn hot_add_mem_required(&self, start: u32, len: u32) -> Result<usize, BuddyError> {
        let _ref = self.enter()?;
        if !self.geo.dynamic {
            return Err(BuddyError::Failure);
        }
        let (s, e) = self.hot_add_span(start, len).ok_or(BuddyError::BadParameter)?;
        let inner = self.inner.lock_irq();
        let (first, last) = inner.block_indices(s, e);
        Ok(inner.storage_required(first, last))
    }

    /// Extend the space over `[start, start + len)` and carve `carve` into
    /// free buffers. Units that were carved before are left alone.
    ///
    /// # Errors
    /// * [`BuddyError::Failure`] for static spaces or ranges outside the window.
    /// * [`BuddyError::OutOfMemory`] if `scratch` does not cover the new blocks.
    pub fn hot_add_range(
        &self,
        scratch: &'a mut [u8],
        start: u32,
        len: u32,
        carve: &[AddrRange],
    ) -> Result<(), BuddyError> {
        let _ref = self.enter()?;
        if !self.geo.dynamic {
            return Err(BuddyError::Failure);
        }
        if len == 0 {
            debug!("buddy {}: empty hot-add at {start:#x}", self.geo.name);
            return Ok(());
        }

        let _serial = self.hot_add.lock_irq();
        let Some((s, e)) = self.hot_add_span(start, len) else {
            warn!(
                "buddy {}: hot-add {start:#x}+{len:#x} outside of the window",
                self.geo.name
            );
            return Err(BuddyError::Failure);
        };

        {
            let mut inner = self.inner.lock_irq();
            let (first, last) = inner.block_indices(s, e);
            let mut scratch = Scratch::new(scratch);
            inner.assign_storage(&mut scratch, first, last);
            inner.check_storage(first, last)?;
            #[allow(clippy::cast_possible_truncation)]
            let end_buf = (e >> self.geo.min_shift) as u32;
            inner.end_buf = inner.end_buf.max(end_buf);
        }

        self.carve(carve);
        debug!("buddy {}: hot-added {start:#x}+{len:#x}", self.geo.name);
        Ok(())
    }

    /// Free minimum units.
    ///
    /// # Errors
    /// Fails on a destroyed space.
    pub fn num_free_bufs(&self) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        Ok(self.inner.lock_irq().num_free_bufs())
    }

    /// Allocated minimum units.
    ///
    /// # Errors
    /// Fails on a destroyed space.
    pub fn num_used_bufs(&self) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        Ok(self.inner.lock_irq().num_used_bufs())
    }

    /// Free minimum units of color `color` (at the minimum size class).
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] for a color out of range.
    pub fn num_free_bufs_for_color(&self, color: u32) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        let (free, _) = self.inner.lock_irq().color_counts(color)?;
        Ok(free)
    }

    /// Allocated minimum units of color `color` (at the minimum size class).
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] for a color out of range.
    pub fn num_used_bufs_for_color(&self, color: u32) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        let (free, total) = self.inner.lock_irq().color_counts(color)?;
        Ok(total - free)
    }

    /// Snapshot of the statistics.
    ///
    /// # Errors
    /// Fails on a destroyed space.
    pub fn stats(&self) -> Result<BuddyStats, BuddyError> {
        let _ref = self.enter()?;
        Ok(self.inner.lock_irq().stats())
    }

    /// Log the statistics table.
    pub fn log_stats(&self) {
        if let Ok(_ref) = self.enter() {
            self.inner.lock_irq().log_stats();
        }
    }

    /// Log every allocated location and return how many there are.
    ///
    /// # Errors
    /// Fails on a destroyed space.
    pub fn dump_entries(&self) -> Result<u32, BuddyError> {
        let _ref = self.enter()?;
        Ok(self.inner.lock_irq().dump_entries())
    }

    /// Stop admitting callers, wait for the current ones to leave and
    /// invalidate the space.
    ///
    /// # Errors
    /// * [`BuddyError::InvalidHandle`] if the space was destroyed already.
    /// * [`BuddyError::Failure`] if another destroy is in progress.
    pub fn destroy(&self) -> Result<(), BuddyError> {
        if !self.valid.load(Ordering::Acquire) {
            return Err(BuddyError::InvalidHandle);
        }
        if self.destroying.swap(true, Ordering::SeqCst) {
            return Err(BuddyError::Failure);
        }
        while self.ref_count.load(Ordering::SeqCst) != 0 {
            spin_loop();
        }
        self.valid.store(false, Ordering::Release);

        if log::log_enabled!(log::Level::Debug) {
            self.inner.lock_irq().log_stats();
        }
        debug!("buddy {}: destroyed", self.geo.name);
        Ok(())
    }
}
