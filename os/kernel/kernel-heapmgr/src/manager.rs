use crate::{
    HeapMgrAllocator, HeapMgrConfig, HeapMgrError, LargePageMapper, MemKind, ReleaseSchedule,
};
use kernel_heap::{Heap, HeapConfig, HeapError, Region};
use log::{debug, info};

const ANY_MEM_NAME: &str = "HeapMgrAnyMem";
const LOW_MEM_NAME: &str = "HeapMgrLowMem";

/// The two page pools growable heaps draw from.
///
/// Regions come from mapped large pages. Once a pool has more than the
/// high-water mark free, a release is scheduled through the
/// [`ReleaseSchedule`]; the kernel answers it by calling
/// [`release_extra_memory`](Self::release_extra_memory) from a context that
/// may block.
pub struct HeapMgr<'a> {
    any: HeapMgrAllocator<'a>,
    low: HeapMgrAllocator<'a>,
    release: &'a ReleaseSchedule<'a>,
}

impl<'a> HeapMgr<'a> {
    /// Create both pools, each with its first chunk mapped.
    ///
    /// Each pool carves its buddy tables and hot-add storage from its arena.
    ///
    /// # Errors
    /// Whatever kept a pool from mapping its first chunk. No pages stay
    /// mapped on failure.
    pub fn new(
        mapper: &'a (dyn LargePageMapper + Sync),
        release: &'a ReleaseSchedule<'a>,
        any_arena: &'a mut [u8],
        low_arena: &'a mut [u8],
        config: HeapMgrConfig,
    ) -> Result<Self, HeapMgrError> {
        let any = HeapMgrAllocator::new(
            ANY_MEM_NAME,
            MemKind::Any,
            mapper,
            release,
            any_arena,
            config,
        )?;
        let low = match HeapMgrAllocator::new(
            LOW_MEM_NAME,
            MemKind::Low,
            mapper,
            release,
            low_arena,
            config,
        ) {
            Ok(low) => low,
            Err(e) => {
                any.shutdown();
                return Err(e);
            }
        };
        info!("heapmgr: initialized");
        Ok(Self { any, low, release })
    }

    /// The pool backed by any physical memory.
    #[must_use]
    pub const fn any(&self) -> &HeapMgrAllocator<'a> {
        &self.any
    }

    /// The pool backed by memory below 4 GiB.
    #[must_use]
    pub const fn low(&self) -> &HeapMgrAllocator<'a> {
        &self.low
    }

    /// # Errors
    /// See [`HeapMgrAllocator::request_memory`].
    pub fn request_any_mem(&self, size: usize) -> Result<Region, HeapMgrError> {
        self.any.request_memory(size)
    }

    /// # Errors
    /// See [`HeapMgrAllocator::request_memory`].
    pub fn request_low_mem(&self, size: usize) -> Result<Region, HeapMgrError> {
        self.low.request_memory(size)
    }

    /// # Errors
    /// See [`HeapMgrAllocator::free_memory`].
    pub fn free_any_mem(&self, addr: usize, size: usize) -> Result<(), HeapMgrError> {
        self.any.free_memory(addr, size)
    }

    /// # Errors
    /// See [`HeapMgrAllocator::free_memory`].
    pub fn free_low_mem(&self, addr: usize, size: usize) -> Result<(), HeapMgrError> {
        self.low.free_memory(addr, size)
    }

    /// Return free chunks of both pools to the system.
    ///
    /// Runs in answer to a scheduled release; unmapping may block.
    pub fn release_extra_memory(&self) {
        debug!("heapmgr: releasing extra memory");
        self.any.release_memory();
        self.low.release_memory();
        self.release.finish();
    }

    /// A growable heap fed from the any-memory pool.
    ///
    /// # Errors
    /// See [`Heap::create_custom`].
    pub fn create_dynamic_heap<'h>(
        &'h self,
        name: &'static str,
        initial: usize,
        maximum: usize,
        config: HeapConfig,
    ) -> Result<Heap<'h>, HeapError> {
        Heap::create_custom(name, initial, maximum, &self.any, config)
    }

    /// A growable heap fed from the low-memory pool.
    ///
    /// # Errors
    /// See [`Heap::create_custom`].
    pub fn create_dynamic_heap_low_mem<'h>(
        &'h self,
        name: &'static str,
        initial: usize,
        maximum: usize,
        config: HeapConfig,
    ) -> Result<Heap<'h>, HeapError> {
        Heap::create_custom(name, initial, maximum, &self.low, config)
    }

    pub fn log_stats(&self) {
        self.any.log_stats();
        self.low.log_stats();
    }

    /// Destroy both pools and return all their pages.
    ///
    /// Heaps created from the manager borrow it and are gone by now.
    pub fn shutdown(self) {
        self.any.shutdown();
        self.low.shutdown();
        info!("heapmgr: shut down");
    }
}
