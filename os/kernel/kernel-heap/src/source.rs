use crate::HeapError;

/// A contiguous span of memory handed to a heap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Region {
    /// Virtual start address.
    pub start: usize,
    /// Length in bytes.
    pub len: usize,
}

impl Region {
    #[must_use]
    pub const fn new(start: usize, len: usize) -> Self {
        Self { start, len }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.start + self.len
    }

    #[must_use]
    pub const fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }
}

/// Where a growable heap gets its memory from.
///
/// Requests may be served with more than was asked for; the heap hands the
/// exact granted region back on release. Requests happen under the heap
/// lock, so implementations must not block.
pub trait MemorySource {
    /// Obtain at least `len` bytes.
    ///
    /// # Errors
    /// [`HeapError::OutOfMemory`] if the source is exhausted.
    fn request(&self, len: usize) -> Result<Region, HeapError>;

    /// Return a region obtained from [`request`](Self::request).
    ///
    /// # Errors
    /// Any error makes the heap report [`HeapError::Failure`] from destroy.
    fn release(&self, region: Region) -> Result<(), HeapError>;

    /// Largest `len` [`request`](Self::request) can serve at once.
    fn max_request(&self) -> usize {
        usize::MAX
    }
}
