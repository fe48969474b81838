//! Services the heap manager consumes from the rest of the kernel.

use core::sync::atomic::{AtomicBool, Ordering};
use kernel_heap::Region;
use log::{debug, warn};

/// Physical page number of a 2 MiB large page.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub struct LargePage(pub u64);

/// Which physical memory a pool is backed with.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum MemKind {
    /// Any physical address.
    Any,
    /// Below 4 GiB, for devices that cannot address more.
    Low,
}

/// Large physical pages and the virtual window they are mapped into.
///
/// Every method but [`unmap`](Self::unmap) is called with a pool lock held
/// and must not block.
pub trait LargePageMapper {
    /// The virtual window [`map`](Self::map) hands out addresses from.
    ///
    /// Start and length are multiples of the large page size.
    fn window(&self) -> Region;

    /// Allocate one large physical page of `kind`.
    fn alloc_large_page(&self, kind: MemKind) -> Option<LargePage>;

    fn free_large_page(&self, page: LargePage);

    /// Map `pages` at a contiguous, large page aligned address of the window.
    fn map(&self, pages: &[LargePage]) -> Option<usize>;

    /// Remove the mapping of `[va, va + len)`. May block.
    fn unmap(&self, va: usize, len: usize);

    /// The large page backing `va`.
    fn translate(&self, va: usize) -> Option<LargePage>;
}

/// Gets the deferred release running in a context that may block.
pub trait ReleaseNotifier {
    /// Arrange for [`HeapMgr::release_extra_memory`](crate::HeapMgr::release_extra_memory)
    /// to run. Returns `false` if that could not be arranged.
    fn schedule_release(&self) -> bool;
}

/// Single-shot release request shared by all pools.
pub struct ReleaseSchedule<'a> {
    scheduled: AtomicBool,
    notifier: &'a (dyn ReleaseNotifier + Sync),
}

impl<'a> ReleaseSchedule<'a> {
    #[must_use]
    pub const fn new(notifier: &'a (dyn ReleaseNotifier + Sync)) -> Self {
        Self {
            scheduled: AtomicBool::new(false),
            notifier,
        }
    }

    /// A release was requested and has not finished yet.
    #[must_use]
    pub fn is_scheduled(&self) -> bool {
        self.scheduled.load(Ordering::SeqCst)
    }

    /// Request a release unless one is pending already.
    pub(crate) fn request(&self) {
        if self.scheduled.swap(true, Ordering::SeqCst) {
            return;
        }
        if self.notifier.schedule_release() {
            debug!("heapmgr: release scheduled");
        } else {
            warn!("heapmgr: could not schedule a release");
            self.scheduled.store(false, Ordering::SeqCst);
        }
    }

    pub(crate) fn finish(&self) {
        self.scheduled.store(false, Ordering::SeqCst);
    }
}
