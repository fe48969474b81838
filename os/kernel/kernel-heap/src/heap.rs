use crate::callers::{CallerName, CallerTable};
use crate::chunk::{
    self, ChunkAllocator, ChunkInfo, FENCEPOST_SIZE, MALLOC_ALIGNMENT, MIN_CHUNK, align_down,
    align_up,
};
use crate::poison::{self, POISON_MAGIC, POISON_SUFFIX_SIZE};
use crate::{HeapConfig, HeapError, MemorySource, Region};
use core::fmt;
use core::hint::spin_loop;
use core::marker::PhantomData;
use core::panic::Location;
use core::ptr::{self, NonNull};
use core::sync::atomic::{AtomicBool, Ordering};
use kernel_sync::{IrqSpinLockGuard, SpinLock};
use log::{debug, info, trace, warn};

/// Maximum number of disjoint ranges of a growable heap.
pub const MAX_RANGES: usize = 10;

/// The first pressure message is logged once free space drops below this.
pub const PRESSURE_FIRST_MSG_PERCENT: usize = 20;
/// Further pressure messages follow every this many percentage points.
pub const PRESSURE_NTH_MSG_PERCENT: usize = 4;
/// Below this, the most frequent callers are tracked and logged.
pub const PRESSURE_LOG_USERS_PERCENT: usize = 10;
pub const PRESSURE_FIRST_DUMP_NTH_CALLER: u64 = 1024;
pub const PRESSURE_LATER_LOG_NTH_CALLER: u64 = 1024;
pub const PRESSURE_LATER_DUMP_NTH_CALLER: u64 = 1024 * 1024;

const INIT_LEAST_PERCENT_FREE: usize = PRESSURE_FIRST_MSG_PERCENT + PRESSURE_NTH_MSG_PERCENT;

/// Minimum time between two throttled allocation dumps.
pub const MIN_DUMP_PERIOD_SECONDS: u64 = 3600;

/// Spins destroy waits for an in-flight dump before giving up.
const DESTROY_WAIT_LOOPS: u32 = 1_000_000;

/// Bytes a custom heap requests on top of its initial size for its own state.
pub const MANAGEMENT_OVERHEAD: usize =
    align_up(size_of::<HeapShared<'static>>(), MALLOC_ALIGNMENT) + MALLOC_ALIGNMENT;

const _: () = assert!(align_of::<HeapShared<'static>>() <= MALLOC_ALIGNMENT);

/// State shared by all users of a heap, placed at the start of its memory.
struct HeapShared<'p> {
    name: &'static str,
    config: HeapConfig,
    dynamic: bool,
    /// A dump is logging with the lock released.
    logging_users: AtomicBool,
    /// Asks an in-flight dump to stop early.
    stop_logging: AtomicBool,
    state: SpinLock<HeapState<'p>>,
}

struct HeapState<'p> {
    alloc: ChunkAllocator,
    /// Ranges as known to the heap; growth ranges are trimmed to the headroom.
    ranges: [Region; MAX_RANGES],
    /// Regions as granted by the source; `granted[0]` holds the heap itself.
    granted: [Region; MAX_RANGES],
    cur_range: usize,
    /// Range 0 has been handed to the chunk allocator.
    initial_reported: bool,
    current: usize,
    maximum: usize,
    source: Option<&'p (dyn MemorySource + Sync)>,
    users: CallerTable,
    least_percent_free: usize,
    call_count: u64,
    last_dump: Option<u64>,
}

/// Snapshot of a heap's size accounting.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub current: usize,
    pub maximum: usize,
    /// Free bytes including the growth headroom.
    pub avail: usize,
    /// Free bytes of the memory the heap holds right now.
    pub current_avail: usize,
    pub ranges: usize,
    pub least_percent_free: usize,
}

/// A locked, corruption-checked arena over up to [`MAX_RANGES`] ranges.
///
/// Static heaps live in caller-provided memory. Custom heaps obtain their
/// memory from a [`MemorySource`] and grow on demand up to their maximum
/// size. Either way the heap keeps its own state at the start of its first
/// range, so the handle is a single pointer.
pub struct Heap<'p> {
    shared: NonNull<HeapShared<'p>>,
    _memory: PhantomData<&'p mut [u8]>,
}

// Safety: all access to the shared state goes through its spinlock or atomics.
unsafe impl Send for Heap<'_> {}
// Safety: see above.
unsafe impl Sync for Heap<'_> {}

impl<'p> Heap<'p> {
    /// Create a heap over `backing`.
    ///
    /// # Errors
    /// [`HeapError::BadParameter`] if `backing` cannot hold the heap state and
    /// one allocation.
    pub fn create_static(
        name: &'static str,
        backing: &'p mut [u8],
        config: HeapConfig,
    ) -> Result<Self, HeapError> {
        let region = Region::new(backing.as_mut_ptr() as usize, backing.len());
        // Safety: `backing` is exclusively borrowed for 'p.
        unsafe { Self::create(name, region, region, None, None, config) }
    }

    /// Create a heap of `initial` bytes that grows through `source` up to
    /// `maximum` bytes.
    ///
    /// # Errors
    /// * [`HeapError::BadParameter`] if `maximum < initial`.
    /// * [`HeapError::OutOfMemory`] if `source` cannot provide the initial memory.
    pub fn create_custom(
        name: &'static str,
        initial: usize,
        maximum: usize,
        source: &'p (dyn MemorySource + Sync),
        config: HeapConfig,
    ) -> Result<Self, HeapError> {
        if maximum < initial || maximum == 0 {
            warn!("{name}: maximum size {maximum} below initial size {initial}");
            return Err(HeapError::BadParameter);
        }

        let want = initial + MANAGEMENT_OVERHEAD;
        let granted = source.request(want).map_err(|e| {
            warn!("Could not allocate {want} bytes of initial memory for dynamic heap {name}: {e}");
            HeapError::OutOfMemory
        })?;
        if granted.len < want {
            warn!("{name}: initial request of {want} bytes served with {}", granted.len);
            let _ = source.release(granted);
            return Err(HeapError::OutOfMemory);
        }

        let layout = Region::new(granted.start, granted.len.min(maximum + MANAGEMENT_OVERHEAD));
        // Safety: the source handed `granted` to us until it is released.
        match unsafe { Self::create(name, layout, granted, Some(maximum), Some(source), config) } {
            Ok(heap) => {
                debug!("Dynamic heap {name} successfully created.");
                Ok(heap)
            }
            Err(e) => {
                warn!("Could not create dynamic heap {name}");
                let _ = source.release(granted);
                Err(e)
            }
        }
    }

    /// Lay out the heap state and range 0 in `layout`.
    ///
    /// # Safety
    /// `layout` must be valid, writable and exclusive to the heap for `'p`.
    unsafe fn create(
        name: &'static str,
        layout: Region,
        granted: Region,
        maximum: Option<usize>,
        source: Option<&'p (dyn MemorySource + Sync)>,
        config: HeapConfig,
    ) -> Result<Self, HeapError> {
        let base = align_up(layout.start, MALLOC_ALIGNMENT);
        let first = align_up(base + size_of::<HeapShared<'p>>(), MALLOC_ALIGNMENT);
        if first + MIN_CHUNK + FENCEPOST_SIZE > layout.end() {
            warn!("{name}: {} bytes cannot hold a heap", layout.len);
            return Err(HeapError::BadParameter);
        }

        let len0 = align_down(layout.end() - first, MALLOC_ALIGNMENT);
        let usable = len0 - FENCEPOST_SIZE;
        let maximum = maximum.unwrap_or(usable);
        let mut ranges = [Region::new(0, 0); MAX_RANGES];
        ranges[0] = Region::new(first, len0);
        let mut granted_ranges = [Region::new(0, 0); MAX_RANGES];
        granted_ranges[0] = granted;

        let state = HeapState {
            alloc: ChunkAllocator::new(),
            ranges,
            granted: granted_ranges,
            cur_range: 0,
            initial_reported: false,
            current: usable.min(maximum),
            maximum,
            source,
            users: CallerTable::new(),
            least_percent_free: INIT_LEAST_PERCENT_FREE,
            call_count: 0,
            last_dump: None,
        };
        let shared = base as *mut HeapShared<'p>;
        unsafe {
            ptr::write(
                shared,
                HeapShared {
                    name,
                    config,
                    dynamic: source.is_some(),
                    logging_users: AtomicBool::new(false),
                    stop_logging: AtomicBool::new(false),
                    state: SpinLock::new(state),
                },
            );
        }
        debug!(
            "{name}: heap at {base:#x}, range 0 [{first:#x}, {:#x}), maximum {maximum:#x}",
            first + len0
        );
        Ok(Self {
            // Safety: `base` lies inside `layout` and is not null.
            shared: unsafe { NonNull::new_unchecked(shared) },
            _memory: PhantomData,
        })
    }

    const fn shared(&self) -> &HeapShared<'p> {
        // Safety: the state stays in place until `destroy` consumes the handle.
        unsafe { self.shared.as_ref() }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.shared().name
    }

    #[must_use]
    pub const fn is_dynamic(&self) -> bool {
        self.shared().dynamic
    }

    #[must_use]
    pub const fn config(&self) -> HeapConfig {
        self.shared().config
    }

    /// Allocate `bytes` aligned to [`MALLOC_ALIGNMENT`].
    #[track_caller]
    #[must_use]
    pub fn alloc(&self, bytes: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned_by(bytes, MALLOC_ALIGNMENT, Location::caller())
    }

    /// Allocate `bytes` aligned to `alignment`.
    #[track_caller]
    #[must_use]
    pub fn alloc_aligned(&self, bytes: usize, alignment: usize) -> Option<NonNull<u8>> {
        self.alloc_aligned_by(bytes, alignment, Location::caller())
    }

    /// Allocate on behalf of `caller`.
    ///
    /// Wrappers that allocate for someone else pass their own caller here so
    /// dumps point at the code that actually owns the memory. Returns `None`
    /// for zero bytes, an alignment that is not a power of two, or when the
    /// heap cannot grow any further.
    #[must_use]
    pub fn alloc_aligned_by(
        &self,
        bytes: usize,
        alignment: usize,
        caller: &'static Location<'static>,
    ) -> Option<NonNull<u8>> {
        if bytes == 0 {
            return None;
        }
        let shared = self.shared();
        if !alignment.is_power_of_two() {
            warn!("{}: alignment {alignment} is not a power of two", shared.name);
            return None;
        }

        let mut state = shared.state.lock_irq();
        let (prefix, raw_bytes) = if shared.config.poison {
            let prefix = poison::prefix_len(alignment.max(MALLOC_ALIGNMENT));
            (prefix, bytes.checked_add(prefix + POISON_SUFFIX_SIZE))
        } else {
            (0, Some(bytes))
        };

        let raw = raw_bytes.and_then(|raw_bytes| state.memalign(shared.name, alignment, raw_bytes));
        let Some(raw) = raw else {
            drop(state);
            warn!(
                "Heap_Align({}, {bytes}/{} bytes, {alignment} align) failed.  caller: {caller}",
                shared.name,
                raw_bytes.unwrap_or(usize::MAX)
            );
            if shared.config.poison {
                self.dump_allocations(true);
            }
            return None;
        };

        let mem = if shared.config.poison {
            // Safety: the chunk holds `prefix + bytes + suffix` bytes.
            unsafe { poison::poison_chunk(raw, bytes, prefix, caller) }
        } else {
            raw
        };
        debug_assert_eq!(mem % alignment, 0);
        trace!("{}: {mem:#x} {bytes} bytes {alignment} alignment", shared.name);

        self.check_memory_pressure(state, bytes, caller, mem);
        NonNull::new(mem as *mut u8)
    }

    /// Free an allocation.
    ///
    /// # Safety
    /// `ptr` must have been returned by an allocation of this heap and not
    /// freed since.
    ///
    /// # Panics
    /// If the guard bytes were overwritten, or, with ownership checks, if
    /// `ptr` lies outside of the heap.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        let shared = self.shared();
        let name = shared.name;
        let mem = ptr.as_ptr() as usize;
        trace!("{name}: {mem:#x}");

        let mut state = shared.state.lock_irq();
        assert!(
            !shared.config.ownership_check || state.manages(mem),
            "{name}: freeing {mem:#x}, which the heap does not own"
        );

        let raw = if shared.config.poison {
            let record = unsafe { poison::record_of(mem) };
            assert!(
                record.magic == POISON_MAGIC,
                "{name}: no poison record in front of {mem:#x}"
            );
            let prefix = record.prefix_len as usize;
            let bytes = record.bytes;
            let raw = mem - prefix;
            if shared.config.check_on_free {
                unsafe {
                    let size = ChunkAllocator::usable_size(raw);
                    poison::check_poisoned_chunk(name, raw, size);
                }
            }
            unsafe {
                ptr::write_bytes(raw as *mut u8, 0xff, (prefix + bytes).min(shared.config.clear_max));
            }
            raw
        } else {
            mem
        };

        let freed = unsafe { state.alloc.free(raw) };
        assert!(freed, "{name}: {mem:#x} is not an allocated chunk");
    }

    /// Log pressure and sample the caller of a successful allocation.
    ///
    /// Consumes the guard: caller tables are logged with the lock released.
    fn check_memory_pressure(
        &self,
        mut state: IrqSpinLockGuard<'_, HeapState<'p>>,
        bytes: usize,
        caller: &'static Location<'static>,
        ptr: usize,
    ) {
        let shared = self.shared();
        let name = shared.name;

        let percent_free = state.fast_percent_free();
        if percent_free + PRESSURE_NTH_MSG_PERCENT < state.least_percent_free {
            info!("{name}: heap below {percent_free}% -- {} bytes free", state.avail());
            state.least_percent_free = percent_free;
        }
        if percent_free >= PRESSURE_LOG_USERS_PERCENT || shared.logging_users.load(Ordering::SeqCst) {
            return;
        }

        // Every caller is sampled at first, then only every n-th to keep the
        // log readable.
        state.call_count += 1;
        let dump = if state.call_count <= PRESSURE_FIRST_DUMP_NTH_CALLER {
            state.call_count == PRESSURE_FIRST_DUMP_NTH_CALLER
        } else if state.call_count % PRESSURE_LATER_LOG_NTH_CALLER != 0 {
            return;
        } else {
            state.call_count % PRESSURE_LATER_DUMP_NTH_CALLER == 0
        };
        state.users.sample(caller, bytes, ptr);
        if !dump {
            return;
        }

        shared.logging_users.store(true, Ordering::SeqCst);
        let avail = state.avail();
        let users = state.users.take();
        drop(state);

        info!("{name}: heap below {percent_free}% -- {avail} bytes free");
        users.log(name, || shared.stop_logging.load(Ordering::SeqCst));
        shared.logging_users.store(false, Ordering::SeqCst);
    }

    /// Log the live bytes per caller.
    ///
    /// Throttled dumps run at most once per [`MIN_DUMP_PERIOD_SECONDS`]
    /// according to the configured clock. Returns whether a dump ran.
    pub fn dump_allocations(&self, throttled: bool) -> bool {
        let shared = self.shared();
        let name = shared.name;
        let mut state = shared.state.lock_irq();

        if throttled && let Some(last) = state.last_dump {
            let Some(clock) = shared.config.clock else {
                return false;
            };
            let now = clock();
            if now < last || now - last < MIN_DUMP_PERIOD_SECONDS {
                return false;
            }
        }
        if shared.logging_users.load(Ordering::SeqCst) || shared.stop_logging.load(Ordering::SeqCst) {
            drop(state);
            info!("{name}: log busy");
            return false;
        }
        state.last_dump = Some(shared.config.clock.map_or(0, |clock| clock()));

        let poison = shared.config.poison;
        let mut users = CallerTable::new();
        state.for_each_chunk(|chunk| {
            if !chunk.in_use {
                return;
            }
            let caller = if poison {
                unsafe { poison::record_at(chunk.addr, chunk.len) }.map(|r| r.caller)
            } else {
                None
            };
            if !users.add_chunk(caller, chunk.len, chunk.addr) {
                info!("{name}: {} bytes allocated from {}.", chunk.len, CallerName(caller));
            }
        });

        shared.logging_users.store(true, Ordering::SeqCst);
        drop(state);

        info!("Contents of {name}:");
        users.log(name, || shared.stop_logging.load(Ordering::SeqCst));
        shared.logging_users.store(false, Ordering::SeqCst);
        true
    }

    /// Verify the guard bytes of every live allocation.
    ///
    /// Meant to be driven by a periodic timer.
    ///
    /// # Panics
    /// On the first corrupted allocation.
    pub fn check_poison(&self) {
        let shared = self.shared();
        if !shared.config.poison {
            debug!("{}: poisoning disabled", shared.name);
            return;
        }
        let state = shared.state.lock_irq();
        state.for_each_chunk(|chunk| {
            if chunk.in_use {
                // Safety: in-use chunks of a poisoning heap carry a record.
                unsafe { poison::check_poisoned_chunk(shared.name, chunk.addr, chunk.len) };
            }
        });
    }

    /// Free bytes including the room the heap may still grow by.
    #[must_use]
    pub fn avail(&self) -> usize {
        self.shared().state.lock_irq().avail()
    }

    /// Free bytes of the memory the heap holds right now.
    #[must_use]
    pub fn current_avail(&self) -> usize {
        self.shared().state.lock_irq().current_avail()
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        let state = self.shared().state.lock_irq();
        HeapStats {
            current: state.current,
            maximum: state.maximum,
            avail: state.avail(),
            current_avail: state.current_avail(),
            ranges: state.cur_range + 1,
            least_percent_free: state.least_percent_free,
        }
    }

    /// Log the size accounting.
    pub fn log_stats(&self) {
        let stats = self.stats();
        let name = self.name();
        let percent_free = 100 * stats.avail / stats.maximum.max(1);
        if self.is_dynamic() {
            info!(
                "Dynamic heap {name}: grown {} times (max {}), current {} bytes, {} available, maximum {} bytes, {} available ({percent_free}% free)",
                stats.ranges - 1,
                MAX_RANGES - 1,
                stats.current,
                stats.current_avail,
                stats.maximum,
                stats.avail
            );
        } else {
            info!(
                "Static heap {name}: maximum {} bytes, {} available ({percent_free}% free)",
                stats.maximum, stats.avail
            );
        }
        if stats.least_percent_free == INIT_LEAST_PERCENT_FREE {
            info!("{name}: least percent free >= {INIT_LEAST_PERCENT_FREE}%");
        } else {
            info!("{name}: least percent free {}%", stats.least_percent_free);
        }
    }

    /// Visit every chunk, optionally only the allocated ones.
    pub fn for_each_chunk(&self, in_use_only: bool, mut f: impl FnMut(ChunkInfo)) {
        let state = self.shared().state.lock_irq();
        state.for_each_chunk(|chunk| {
            if chunk.in_use || !in_use_only {
                f(chunk);
            }
        });
    }

    /// Call `f` with every range; the lock is dropped during each call.
    ///
    /// # Errors
    /// Stops at and returns the first error of `f`.
    pub fn dump<E>(&self, mut f: impl FnMut(Region) -> Result<(), E>) -> Result<(), E> {
        let mut index = 0;
        loop {
            let range = {
                let state = self.shared().state.lock_irq();
                if index > state.cur_range {
                    break;
                }
                state.ranges[index]
            };
            f(range)?;
            index += 1;
        }
        Ok(())
    }

    /// Destroy the heap; a non-empty heap panics in debug builds.
    ///
    /// # Errors
    /// See [`destroy_with_panic`](Self::destroy_with_panic).
    pub fn destroy(self) -> Result<(), HeapError> {
        self.destroy_with_panic(true)
    }

    /// Destroy the heap and return its memory to the source.
    ///
    /// # Errors
    /// * [`HeapError::Busy`] if a dump does not finish in time; the heap is
    ///   leaked.
    /// * [`HeapError::NonEmpty`] if allocations were outstanding; the heap is
    ///   destroyed anyway.
    /// * [`HeapError::Failure`] if the source refused a region.
    ///
    /// # Panics
    /// On a non-empty heap if `panic_if_non_empty` is set and debug
    /// assertions are enabled.
    pub fn destroy_with_panic(self, panic_if_non_empty: bool) -> Result<(), HeapError> {
        let shared = self.shared();
        let name = shared.name;

        shared.stop_logging.store(true, Ordering::SeqCst);
        let mut retries = DESTROY_WAIT_LOOPS;
        while shared.logging_users.load(Ordering::SeqCst) {
            if retries == 0 {
                warn!("Heap {name} busy logging heap usage, cannot destroy heap.");
                shared.stop_logging.store(false, Ordering::SeqCst);
                return Err(HeapError::Busy);
            }
            retries -= 1;
            spin_loop();
        }
        shared.stop_logging.store(false, Ordering::SeqCst);

        let mut status = Ok(());
        let (avail, current) = {
            let state = shared.state.lock_irq();
            (state.current_avail(), state.current)
        };
        if avail < current {
            warn!("Non-empty heap ({name}) being destroyed (avail is {avail}, should be {current}).");
            if shared.config.poison {
                self.dump_allocations(false);
            }
            assert!(
                !(panic_if_non_empty && cfg!(debug_assertions)),
                "Non-empty heap ({name}) being destroyed (avail is {avail}, should be {current})."
            );
            status = Err(HeapError::NonEmpty);
        } else {
            debug!("Heap {name} is empty and is being destroyed.");
        }

        // The state lives in the initial region; copy out what the release needs.
        let (source, granted, cur_range) = {
            let state = shared.state.lock_irq();
            (state.source, state.granted, state.cur_range)
        };
        unsafe {
            ptr::drop_in_place(self.shared.as_ptr());
            ptr::write_bytes(self.shared.as_ptr(), 0, 1);
        }

        if let Some(source) = source {
            for region in &granted[1..=cur_range] {
                if let Err(e) = source.release(*region) {
                    warn!("Unable to free memory at {:#x} in heap {name}: {e}", region.start);
                    status = status.and(Err(HeapError::Failure));
                }
            }
            if let Err(e) = source.release(granted[0]) {
                warn!("Unable to free memory at {:#x}: {e}", granted[0].start);
                status = status.and(Err(HeapError::Failure));
            }
        }
        status
    }
}

impl fmt::Debug for Heap<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Heap")
            .field("name", &self.name())
            .field("dynamic", &self.is_dynamic())
            .field("at", &self.shared)
            .finish_non_exhaustive()
    }
}

impl HeapState<'_> {
    /// Allocate from the chunk allocator, growing once if needed.
    ///
    /// Handing over the initial range does not count as growth.
    fn memalign(&mut self, name: &str, align: usize, bytes: usize) -> Option<usize> {
        if bytes > usize::MAX / 4 {
            return None;
        }
        if !self.initial_reported {
            let range = self.ranges[0];
            // Safety: range 0 was laid out at creation and belongs to the heap.
            unsafe { self.alloc.add_range(range.start, range.len) };
            self.initial_reported = true;
        }
        if let Some(p) = unsafe { self.alloc.memalign(align, bytes) } {
            return Some(p);
        }
        if !self.more_core(name, chunk::range_bytes_for(bytes, align)) {
            return None;
        }
        unsafe { self.alloc.memalign(align, bytes) }
    }

    /// Give the chunk allocator a new range of at least `size` bytes.
    fn more_core(&mut self, name: &str, size: usize) -> bool {
        trace!("{name}: more core for {size} bytes");

        if self.current >= self.maximum {
            warn!("Heap {name} already at its maximum size. Cannot expand.");
            return false;
        }
        let Some(source) = self.source else {
            warn!("Static heap {name} cannot be grown");
            return false;
        };
        if self.cur_range + 1 >= MAX_RANGES {
            warn!("Heap {name} could not be grown to accommodate the memory request");
            return false;
        }

        let headroom = self.maximum - self.current + MALLOC_ALIGNMENT;
        let request = self.ranges[self.cur_range]
            .len
            .max(self.maximum / MAX_RANGES)
            .max(size + MALLOC_ALIGNMENT)
            .min(headroom)
            .min(source.max_request());
        if request < size + MALLOC_ALIGNMENT {
            warn!("Request for more memory would exceed maximum size of heap {name}");
            return false;
        }

        let region = match source.request(request) {
            Ok(region) => region,
            Err(e) => {
                warn!("Could not allocate {request} bytes for dynamic heap {name}: {e}");
                return false;
            }
        };
        if region.len < size + MALLOC_ALIGNMENT || region.start % MALLOC_ALIGNMENT != 0 {
            warn!("{name}: unusable region {:#x}+{:#x}", region.start, region.len);
            let _ = source.release(region);
            return false;
        }

        // Ranges are entered past an alignment gap so that two of them never
        // look adjacent to the chunk allocator.
        let recognized = align_down(region.len.min(headroom), MALLOC_ALIGNMENT);
        self.cur_range += 1;
        self.ranges[self.cur_range] = Region::new(region.start, recognized);
        self.granted[self.cur_range] = region;
        self.current += recognized - MALLOC_ALIGNMENT - FENCEPOST_SIZE;
        debug_assert!(self.current <= self.maximum);
        // Safety: the source granted `region` to this heap.
        unsafe {
            self.alloc
                .add_range(region.start + MALLOC_ALIGNMENT, recognized - MALLOC_ALIGNMENT);
        }
        debug!(
            "{name}: range {} at {:#x}+{recognized:#x}, current size {}",
            self.cur_range, region.start, self.current
        );
        true
    }

    /// `mem` lies within one of the heap's ranges.
    fn manages(&self, mem: usize) -> bool {
        self.ranges[..=self.cur_range]
            .iter()
            .enumerate()
            .any(|(i, range)| {
                let skip = if i == 0 { 0 } else { MALLOC_ALIGNMENT };
                Region::new(range.start + skip, range.len - skip).contains(mem)
            })
    }

    fn current_avail(&self) -> usize {
        let mut avail = self.alloc.avail();
        if !self.initial_reported {
            avail += self.ranges[0].len - FENCEPOST_SIZE;
        }
        avail
    }

    fn avail(&self) -> usize {
        self.current_avail() + self.maximum - self.current
    }

    /// Percentage of the maximum size that is free, without counting an
    /// unreported initial range.
    fn fast_percent_free(&self) -> usize {
        (self.alloc.avail() + self.maximum - self.current) / (self.maximum / 100).max(1)
    }

    fn for_each_chunk(&self, mut f: impl FnMut(ChunkInfo)) {
        if !self.initial_reported {
            return;
        }
        for (i, range) in self.ranges[..=self.cur_range].iter().enumerate() {
            let start = if i == 0 {
                range.start
            } else {
                range.start + MALLOC_ALIGNMENT
            };
            // Safety: every listed range was adopted by the chunk allocator.
            unsafe { ChunkAllocator::for_each_chunk(start, &mut f) };
        }
    }
}
