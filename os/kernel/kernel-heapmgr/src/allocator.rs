use crate::granules::GranuleMap;
use crate::pattern::{FREE_REGION_VALUE, GUARD_PAGE_VALUE, check_pages, fill_pages};
use crate::{
    HeapMgrConfig, HeapMgrError, LARGE_PAGE_SIZE, LARGE_PAGES_PER_CHUNK, LargePage,
    LargePageMapper, MAX_BUF_PAGES, MAX_BUF_SIZE, MAX_GRANULES, MIN_BUF_PAGES, MIN_BUF_SIZE,
    MemKind, PAGE_SIZE, ReleaseSchedule,
};
use kernel_buddy::{AddrRange, DynamicRange, MemorySpace, StaticRange};
use kernel_heap::{HeapError, MemorySource, Region};
use kernel_sync::SpinLock;
use log::{debug, info, trace, warn};

#[allow(clippy::cast_possible_truncation)]
const CHUNK_UNITS: u32 = MAX_BUF_PAGES as u32;
#[allow(clippy::cast_possible_truncation)]
const MIN_UNITS: u32 = MIN_BUF_PAGES as u32;

/// Sizes of a pool at one point in time.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct PoolStats {
    /// Bytes the buddy space can hand out right now.
    pub free_bytes: usize,
    /// Bytes handed out, including chunks held back by a release.
    pub used_bytes: usize,
    /// Bytes currently mapped for this pool.
    pub mapped_bytes: usize,
    /// Bytes returned to the system and awaiting reclaim.
    pub released_bytes: usize,
    /// Management memory left for hot-adds.
    pub management_bytes_left: usize,
}

/// One buddy-managed pool of mapped large pages.
///
/// Locations in the buddy space are page numbers relative to the start of
/// the mapper's window. The space grows one chunk of [`MAX_BUF_SIZE`] at a
/// time, and shrinks by the deferred release.
pub struct HeapMgrAllocator<'a> {
    name: &'static str,
    kind: MemKind,
    config: HeapMgrConfig,
    window: Region,
    mapper: &'a (dyn LargePageMapper + Sync),
    release: &'a ReleaseSchedule<'a>,
    state: SpinLock<PoolState<'a>>,
}

struct PoolState<'a> {
    space: MemorySpace<'a>,
    /// Management memory not yet handed to the space.
    arena: &'a mut [u8],
    granules: GranuleMap,
}

/// Split `bytes` off the front of `arena`.
fn carve<'a>(arena: &mut &'a mut [u8], bytes: usize) -> Option<&'a mut [u8]> {
    if arena.len() < bytes {
        return None;
    }
    let (head, tail) = core::mem::take(arena).split_at_mut(bytes);
    *arena = tail;
    Some(head)
}

impl<'a> HeapMgrAllocator<'a> {
    /// Map the first chunk and build the buddy space over the mapper's window.
    ///
    /// Tables and later hot-adds are carved from `arena`.
    pub(crate) fn new(
        name: &'static str,
        kind: MemKind,
        mapper: &'a (dyn LargePageMapper + Sync),
        release: &'a ReleaseSchedule<'a>,
        mut arena: &'a mut [u8],
        config: HeapMgrConfig,
    ) -> Result<Self, HeapMgrError> {
        let window = mapper.window();
        let pages = window.len / PAGE_SIZE;
        if window.start % LARGE_PAGE_SIZE != 0
            || window.len % MAX_BUF_SIZE != 0
            || window.len / LARGE_PAGE_SIZE > MAX_GRANULES
            || pages == 0
        {
            warn!("{name}: unusable window {:#x}+{:#x}", window.start, window.len);
            return Err(HeapMgrError::BadParameter);
        }
        let window_pages = u32::try_from(pages).map_err(|_| HeapMgrError::BadParameter)?;

        let chunk = map_chunk(mapper, kind)?;
        let va = chunk.va;
        let space = match Self::create_space(name, window, window_pages, va, &mut arena, config) {
            Ok(space) => space,
            Err(e) => {
                warn!("{name}: failed to create the buddy space: {e}");
                chunk.unmap(mapper);
                return Err(e);
            }
        };

        let mut granules = GranuleMap::new();
        let first = (va - window.start) / LARGE_PAGE_SIZE;
        for i in 0..LARGE_PAGES_PER_CHUNK {
            granules.mark_mapped(first + i);
        }
        debug!("{name}: created with a first chunk at {va:#x}");

        Ok(Self {
            name,
            kind,
            config,
            window,
            mapper,
            release,
            state: SpinLock::new(PoolState {
                space,
                arena,
                granules,
            }),
        })
    }

    /// Build the dynamic space so that it covers the chunk at `va`.
    fn create_space(
        name: &'static str,
        window: Region,
        window_pages: u32,
        va: usize,
        arena: &mut &'a mut [u8],
        config: HeapMgrConfig,
    ) -> Result<MemorySpace<'a>, HeapMgrError> {
        let loc = loc_in(window, va)
            .filter(|&loc| loc % CHUNK_UNITS == 0)
            .ok_or(HeapMgrError::BadParameter)?;
        let range = DynamicRange::new(
            StaticRange::new(name, 0, loc + CHUNK_UNITS, MIN_UNITS, CHUNK_UNITS),
            window_pages,
            CHUNK_UNITS,
        );
        let bytes = range.mem_req()?;
        debug!("{name}: {bytes} management bytes required for the first chunk");
        let scratch = carve(arena, bytes).ok_or(HeapMgrError::OutOfMemory)?;

        if config.free_region_check {
            // Safety: the chunk was just mapped for this pool.
            unsafe { fill_pages(va, MAX_BUF_PAGES, FREE_REGION_VALUE) };
        }
        Ok(MemorySpace::create_dynamic(
            &range,
            scratch,
            &[AddrRange::new(loc, CHUNK_UNITS)],
        )?)
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }

    #[must_use]
    pub const fn kind(&self) -> MemKind {
        self.kind
    }

    const fn va_of(&self, loc: u32) -> usize {
        self.window.start + loc as usize * PAGE_SIZE
    }

    const fn granule_of(&self, va: usize) -> usize {
        (va - self.window.start) / LARGE_PAGE_SIZE
    }

    /// Obtain a region of at least `size` bytes.
    ///
    /// The region is page aligned and never larger than [`MAX_BUF_SIZE`].
    /// If the space is exhausted, one chunk is added and the allocation
    /// retried once.
    ///
    /// # Errors
    /// * [`HeapMgrError::BadParameter`] for zero or more than one chunk.
    /// * Whatever prevented the pool from growing.
    ///
    /// # Panics
    /// If the region's free pattern was overwritten.
    pub fn request_memory(&self, size: usize) -> Result<Region, HeapMgrError> {
        let padded = if self.config.guard_page {
            size.checked_add(PAGE_SIZE)
        } else {
            Some(size)
        };
        let pages = padded.map_or(usize::MAX, |p| p.div_ceil(PAGE_SIZE));
        if size == 0 || pages > MAX_BUF_PAGES {
            warn!("{}: request for {size:#x} bytes larger than max buffer size", self.name);
            return Err(HeapMgrError::BadParameter);
        }
        #[allow(clippy::cast_possible_truncation)]
        let units = pages as u32;
        trace!("{}: request for {size:#x} bytes, asking for {pages} pages", self.name);

        let mut state = self.state.lock_irq();
        let loc = if let Ok(loc) = state.space.allocate(units) {
            loc
        } else {
            if let Err((e, stranded)) = self.add_mem(&mut state) {
                drop(state);
                if let Some(chunk) = stranded {
                    chunk.unmap(self.mapper);
                }
                warn!("Could not add memory to heap allocator {}: {e}", self.name);
                return Err(e);
            }
            state.space.allocate(units).map_err(|e| {
                warn!(
                    "Could not satisfy request after adding memory to allocator {}: {e}",
                    self.name
                );
                HeapMgrError::from(e)
            })?
        };
        let granted = state.space.get_loc_size(loc)? as usize;
        let va = self.va_of(loc);

        if self.config.free_region_check {
            // Safety: the buffer is mapped and now owned by the caller.
            unsafe { check_pages(va, granted, FREE_REGION_VALUE) };
        }
        let region = if self.config.guard_page {
            // Safety: see above.
            unsafe { fill_pages(va, 1, GUARD_PAGE_VALUE) };
            Region::new(va + PAGE_SIZE, (granted - 1) * PAGE_SIZE)
        } else {
            Region::new(va, granted * PAGE_SIZE)
        };
        drop(state);

        trace!(
            "{}: satisfied request with {:#x} bytes at {:#x}",
            self.name, region.len, region.start
        );
        Ok(region)
    }

    /// Return a region obtained from [`request_memory`](Self::request_memory).
    ///
    /// `size` may be smaller than the region; the whole buffer is freed.
    /// Crossing the high-water mark schedules a release.
    ///
    /// # Errors
    /// [`HeapMgrError::BadParameter`] if `addr` is not the start of a region
    /// of this pool.
    ///
    /// # Panics
    /// If the guard page in front of the region was overwritten.
    pub fn free_memory(&self, addr: usize, size: usize) -> Result<(), HeapMgrError> {
        let start = if self.config.guard_page {
            addr.checked_sub(PAGE_SIZE)
        } else {
            Some(addr)
        };
        let Some(loc) = start.and_then(|start| loc_in(self.window, start)) else {
            warn!("{}: {addr:#x} is not a heap manager address", self.name);
            return Err(HeapMgrError::BadParameter);
        };
        let start = self.va_of(loc);

        let state = self.state.lock_irq();
        if state.granules.is_released(self.granule_of(start)) {
            warn!("{}: {addr:#x} lies in a released chunk", self.name);
            return Err(HeapMgrError::BadParameter);
        }
        let Ok(pages) = state.space.get_loc_size(loc) else {
            warn!("{}: no region allocated at {addr:#x}", self.name);
            return Err(HeapMgrError::BadParameter);
        };
        let pages = pages as usize;
        if self.config.guard_page {
            // Safety: the buffer at `start` is allocated and mapped.
            unsafe { check_pages(start, 1, GUARD_PAGE_VALUE) };
        }
        if self.config.free_region_check {
            // The caller may pass less than the buffer; fill all of it.
            // Safety: see above.
            unsafe { fill_pages(start, pages, FREE_REGION_VALUE) };
        }
        state.space.free(loc)?;
        let free_bytes = state.free_bytes();
        drop(state);

        if free_bytes > self.config.release_high_water {
            self.release.request();
        }
        trace!("{}: freed {size:#x} bytes at {addr:#x}, {pages} pages", self.name);
        Ok(())
    }

    /// Map one more chunk and give it to the space.
    ///
    /// A chunk the mapper hands out again after a release is freed back into
    /// the space; everything else is hot-added. A chunk the space cannot take
    /// is handed back still mapped: unmapping may block, and the caller holds
    /// the pool lock.
    fn add_mem(&self, state: &mut PoolState<'a>) -> Result<(), (HeapMgrError, Option<Chunk>)> {
        let chunk = map_chunk(self.mapper, self.kind).map_err(|e| (e, None))?;
        let va = chunk.va;
        match self.adopt_chunk(state, va) {
            Ok(()) => {
                debug!("{}: added {MAX_BUF_SIZE:#x} bytes at {va:#x}", self.name);
                Ok(())
            }
            Err(e) => {
                warn!("Failed to add memory to allocator {}: {e}", self.name);
                Err((e, Some(chunk)))
            }
        }
    }

    fn adopt_chunk(&self, state: &mut PoolState<'a>, va: usize) -> Result<(), HeapMgrError> {
        let loc = loc_in(self.window, va)
            .filter(|&loc| loc % CHUNK_UNITS == 0)
            .ok_or(HeapMgrError::BadParameter)?;
        let first = self.granule_of(va);

        if state.granules.is_released(first) {
            debug!("{}: pages at {va:#x} were previously released; buddy freeing", self.name);
            if self.config.free_region_check {
                // Safety: the chunk was just mapped for this pool.
                unsafe { fill_pages(va, MAX_BUF_PAGES, FREE_REGION_VALUE) };
            }
            state.space.free(loc)?;
            for i in 0..LARGE_PAGES_PER_CHUNK {
                state.granules.mark_mapped(first + i);
            }
            return Ok(());
        }

        let bytes = state.space.hot_add_mem_required(loc, CHUNK_UNITS)?;
        trace!("{}: {bytes} management bytes required for {va:#x}", self.name);
        let Some(scratch) = carve(&mut state.arena, bytes) else {
            warn!("{}: management memory exhausted", self.name);
            return Err(HeapMgrError::OutOfMemory);
        };
        if self.config.free_region_check {
            // Safety: see above.
            unsafe { fill_pages(va, MAX_BUF_PAGES, FREE_REGION_VALUE) };
        }
        state
            .space
            .hot_add_range(scratch, loc, CHUNK_UNITS, &[AddrRange::new(loc, CHUNK_UNITS)])?;
        for i in 0..LARGE_PAGES_PER_CHUNK {
            state.granules.mark_mapped(first + i);
        }
        Ok(())
    }

    /// Give whole chunks back to the system until free memory drops to the
    /// low-water mark.
    ///
    /// Unmapping may block; it happens with the pool lock released.
    pub(crate) fn release_memory(&self) {
        let mut released = 0;
        loop {
            let (va, pages) = {
                let mut state = self.state.lock_irq();
                if state.free_bytes() <= self.config.release_low_water {
                    break;
                }
                let Ok(loc) = state.space.allocate(CHUNK_UNITS) else {
                    break;
                };
                debug_assert_eq!(loc % CHUNK_UNITS, 0);
                let va = self.va_of(loc);
                if self.config.free_region_check {
                    // Safety: the chunk is mapped and was free until now.
                    unsafe { check_pages(va, MAX_BUF_PAGES, FREE_REGION_VALUE) };
                }

                let mut pages = [None; LARGE_PAGES_PER_CHUNK];
                for (i, page) in pages.iter_mut().enumerate() {
                    let granule_va = va + i * LARGE_PAGE_SIZE;
                    state.granules.mark_released(self.granule_of(granule_va));
                    *page = self.mapper.translate(granule_va);
                }
                (va, pages)
            };

            self.mapper.unmap(va, MAX_BUF_SIZE);
            for page in pages.into_iter().flatten() {
                self.mapper.free_large_page(page);
            }
            released += 1;
        }
        if released > 0 {
            info!("{}: released {released} chunks", self.name);
        }
    }

    /// Whether the large page at `addr` was returned to the system.
    #[must_use]
    pub fn is_released(&self, addr: usize) -> bool {
        if !self.window.contains(addr) {
            return false;
        }
        let granule = self.granule_of(addr);
        self.state.lock_irq().granules.is_released(granule)
    }

    /// Bytes the buddy space can hand out without growing.
    #[must_use]
    pub fn free_bytes(&self) -> usize {
        self.state.lock_irq().free_bytes()
    }

    #[must_use]
    pub fn stats(&self) -> PoolStats {
        let state = self.state.lock_irq();
        let used = state.space.num_used_bufs().unwrap_or(0) as usize;
        PoolStats {
            free_bytes: state.free_bytes(),
            used_bytes: used * MIN_BUF_SIZE,
            mapped_bytes: state.granules.mapped().count() * LARGE_PAGE_SIZE,
            released_bytes: state.granules.released_count() as usize * LARGE_PAGE_SIZE,
            management_bytes_left: state.arena.len(),
        }
    }

    /// Log the pool and its buddy space.
    pub fn log_stats(&self) {
        let stats = self.stats();
        info!(
            "{}: {:#x} bytes free, {:#x} used, {:#x} mapped, {:#x} released, {} management bytes left",
            self.name,
            stats.free_bytes,
            stats.used_bytes,
            stats.mapped_bytes,
            stats.released_bytes,
            stats.management_bytes_left
        );
        self.state.lock_irq().space.log_stats();
    }

    /// Destroy the space and return every mapped chunk to the system.
    pub(crate) fn shutdown(mut self) {
        let mapper = self.mapper;
        let window = self.window;
        let state = self.state.get_mut();
        if let Err(e) = state.space.destroy() {
            warn!("{}: destroying the buddy space failed: {e}", self.name);
        }
        for granule in state.granules.mapped() {
            let va = window.start + granule * LARGE_PAGE_SIZE;
            let page = mapper.translate(va);
            mapper.unmap(va, LARGE_PAGE_SIZE);
            if let Some(page) = page {
                mapper.free_large_page(page);
            }
        }
        debug!("{}: shut down", self.name);
    }
}

impl PoolState<'_> {
    fn free_bytes(&self) -> usize {
        self.space.num_free_bufs().unwrap_or(0) as usize * MIN_BUF_SIZE
    }
}

impl MemorySource for HeapMgrAllocator<'_> {
    fn request(&self, len: usize) -> Result<Region, HeapError> {
        Ok(self.request_memory(len)?)
    }

    fn release(&self, region: Region) -> Result<(), HeapError> {
        Ok(self.free_memory(region.start, region.len)?)
    }

    fn max_request(&self) -> usize {
        if self.config.guard_page {
            MAX_BUF_SIZE - PAGE_SIZE
        } else {
            MAX_BUF_SIZE
        }
    }
}

/// Page number of `va` within `window`, if it is page aligned and inside.
fn loc_in(window: Region, va: usize) -> Option<u32> {
    if !window.contains(va) || va % PAGE_SIZE != 0 {
        return None;
    }
    u32::try_from((va - window.start) / PAGE_SIZE).ok()
}

/// Large pages mapped as one chunk.
struct Chunk {
    va: usize,
    pages: [LargePage; LARGE_PAGES_PER_CHUNK],
}

impl Chunk {
    /// Undo [`map_chunk`]. May block.
    fn unmap(self, mapper: &dyn LargePageMapper) {
        mapper.unmap(self.va, MAX_BUF_SIZE);
        for page in self.pages {
            mapper.free_large_page(page);
        }
    }
}

/// Allocate and map the large pages of one chunk.
///
/// Alignment of the returned chunk is left to the caller to check.
fn map_chunk(mapper: &dyn LargePageMapper, kind: MemKind) -> Result<Chunk, HeapMgrError> {
    let mut pages = [LargePage(0); LARGE_PAGES_PER_CHUNK];
    let mut got = 0;
    while got < LARGE_PAGES_PER_CHUNK {
        let Some(page) = mapper.alloc_large_page(kind) else {
            warn!("Could not allocate large pages.");
            for &page in &pages[..got] {
                mapper.free_large_page(page);
            }
            return Err(HeapMgrError::OutOfMemory);
        };
        pages[got] = page;
        got += 1;
    }

    let Some(va) = mapper.map(&pages) else {
        warn!("Could not allocate address space for large pages.");
        for page in pages {
            mapper.free_large_page(page);
        }
        return Err(HeapMgrError::NoAddressSpace);
    };
    trace!("mapped {LARGE_PAGES_PER_CHUNK} large pages at {va:#x}");
    Ok(Chunk { va, pages })
}
