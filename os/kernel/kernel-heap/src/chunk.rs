//! First-fit, split-and-coalesce chunk allocator.
//!
//! Every chunk, free or in use, starts with a [`ChunkHeader`]; chunks tile a
//! range back to back so a range can be walked from its start. A range is
//! terminated by an in-use *fencepost* header:
//!
//! ```text
//! range start                                               range end
//! ┌────────┬──────────┬────────┬───────────────┬────────┬───────────┐
//! │ header │ payload  │ header │  free payload │ header │ fencepost │
//! └────────┴──────────┴────────┴───────────────┴────────┴───────────┘
//!   in use               free (next ptr in payload)        in use
//! ```
//!
//! Free chunks additionally keep a `next` pointer in their payload and are
//! linked in **address order** so neighbors can be merged on insertion.

use core::ptr::{self, null_mut};

/// Alignment of every chunk and every payload.
pub const MALLOC_ALIGNMENT: usize = 16;

/// Bytes of bookkeeping in front of every payload.
pub const HEADER_SIZE: usize = size_of::<ChunkHeader>();

/// Bytes consumed at the end of every range to terminate the chunk walk.
pub const FENCEPOST_SIZE: usize = HEADER_SIZE;

/// Smallest chunk; a free chunk must hold its header and list link.
pub(crate) const MIN_CHUNK: usize = 2 * MALLOC_ALIGNMENT;

const IN_USE: usize = 1;
const FENCEPOST: usize = 2;

/// Header in front of every chunk.
#[repr(C, align(16))]
struct ChunkHeader {
    /// Total chunk size including this header.
    size: usize,
    flags: usize,
}

/// A free chunk: header plus the address-ordered list link.
#[repr(C)]
struct FreeChunk {
    header: ChunkHeader,
    next: *mut FreeChunk,
}

impl FreeChunk {
    const fn new(size: usize) -> Self {
        Self {
            header: ChunkHeader { size, flags: 0 },
            next: null_mut(),
        }
    }
}

#[inline]
pub(crate) const fn align_up(addr: usize, align: usize) -> usize {
    (addr + (align - 1)) & !(align - 1)
}

#[inline]
pub(crate) const fn align_down(addr: usize, align: usize) -> usize {
    addr & !(align - 1)
}

/// Chunk size that serves a payload of `bytes`.
#[inline]
const fn chunk_size(bytes: usize) -> usize {
    let size = align_up(bytes + HEADER_SIZE, MALLOC_ALIGNMENT);
    if size < MIN_CHUNK { MIN_CHUNK } else { size }
}

/// Range length that is guaranteed to serve `bytes` at `align`.
pub(crate) const fn range_bytes_for(bytes: usize, align: usize) -> usize {
    let slack = if align > MALLOC_ALIGNMENT {
        align + MIN_CHUNK
    } else {
        0
    };
    chunk_size(bytes) + slack + FENCEPOST_SIZE
}

/// One chunk as seen by a range walk.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct ChunkInfo {
    /// Payload address.
    pub addr: usize,
    /// Usable payload bytes.
    pub len: usize,
    pub in_use: bool,
}

/// # Invariants
/// - Free chunks are non-overlapping, sorted by address and never adjacent
///   to each other (they would have been merged).
/// - `head` is a sentinel; the first real chunk is at `head.next`.
/// - `free_bytes` is the sum of all free chunk sizes.
pub(crate) struct ChunkAllocator {
    head: FreeChunk,
    free_bytes: usize,
}

// Safety: only used under the heap lock; the raw pointers never escape it.
unsafe impl Send for ChunkAllocator {}

impl ChunkAllocator {
    pub(crate) const fn new() -> Self {
        Self {
            head: FreeChunk::new(0),
            free_bytes: 0,
        }
    }

    /// Free bytes, headers of free chunks included.
    pub(crate) const fn avail(&self) -> usize {
        self.free_bytes
    }

    /// Adopt `[start, start + len)` as a new range and return the bytes that
    /// became free.
    ///
    /// # Safety
    /// The range must be valid, writable, exclusive to this allocator and not
    /// adjacent to another adopted range. `start` must be aligned to
    /// [`MALLOC_ALIGNMENT`].
    pub(crate) unsafe fn add_range(&mut self, start: usize, len: usize) -> usize {
        debug_assert_eq!(start % MALLOC_ALIGNMENT, 0);
        let len = align_down(len, MALLOC_ALIGNMENT);
        if len < MIN_CHUNK + FENCEPOST_SIZE {
            return 0;
        }
        let body = len - FENCEPOST_SIZE;
        unsafe {
            ptr::write(
                (start + body) as *mut ChunkHeader,
                ChunkHeader {
                    size: FENCEPOST_SIZE,
                    flags: IN_USE | FENCEPOST,
                },
            );
            self.insert_free(start, body);
        }
        body
    }

    /// Link the free chunk `[addr, addr + size)` in address order and merge
    /// it with adjacent free chunks.
    ///
    /// # Safety
    /// The chunk must be valid, aligned and not yet in the list.
    unsafe fn insert_free(&mut self, addr: usize, size: usize) {
        self.free_bytes += size;

        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() && (current as usize) < addr {
            prev = current;
            current = unsafe { (*current).next };
        }
        let new = addr as *mut FreeChunk;
        unsafe {
            ptr::write(new, FreeChunk::new(size));
            (*new).next = current;
            (*prev).next = new;
            self.coalesce(prev);
        }
    }

    /// Merge the chunk after `prev` with its list neighbors if they touch.
    ///
    /// # Safety
    /// `prev` must be a node in the list, possibly the sentinel.
    unsafe fn coalesce(&mut self, prev: *mut FreeChunk) {
        let curr = unsafe { (*prev).next };
        if curr.is_null() {
            return;
        }
        let next = unsafe { (*curr).next };
        if !next.is_null() {
            let curr_end = curr as usize + unsafe { (*curr).header.size };
            if curr_end == next as usize {
                unsafe {
                    (*curr).header.size += (*next).header.size;
                    (*curr).next = (*next).next;
                }
            }
        }
        if !ptr::eq(prev, &raw const self.head) {
            let prev_end = prev as usize + unsafe { (*prev).header.size };
            if prev_end == curr as usize {
                unsafe {
                    (*prev).header.size += (*curr).header.size;
                    (*prev).next = (*curr).next;
                }
            }
        }
    }

    /// Carve a chunk with a payload of `bytes` aligned to `align`.
    ///
    /// Leading gaps and trailing remainders large enough to be chunks go
    /// back to the list; smaller remainders stay with the allocation.
    ///
    /// # Safety
    /// The list invariants must hold; `align` must be a power of two.
    pub(crate) unsafe fn memalign(&mut self, align: usize, bytes: usize) -> Option<usize> {
        let align = align.max(MALLOC_ALIGNMENT);
        let need = chunk_size(bytes);

        let mut prev = &raw mut self.head;
        let mut current = unsafe { (*prev).next };
        while !current.is_null() {
            let start = current as usize;
            let size = unsafe { (*current).header.size };
            let end = start + size;

            let mut payload = align_up(start + HEADER_SIZE, align);
            while payload - HEADER_SIZE != start && payload - HEADER_SIZE - start < MIN_CHUNK {
                payload += align;
            }
            let chunk = payload - HEADER_SIZE;

            if chunk + need <= end {
                unsafe {
                    (*prev).next = (*current).next;
                }
                self.free_bytes -= size;

                let lead = chunk - start;
                let tail = end - (chunk + need);
                let used = if tail < MIN_CHUNK { need + tail } else { need };
                unsafe {
                    ptr::write(
                        chunk as *mut ChunkHeader,
                        ChunkHeader {
                            size: used,
                            flags: IN_USE,
                        },
                    );
                    if tail >= MIN_CHUNK {
                        self.insert_free(chunk + need, tail);
                    }
                    if lead > 0 {
                        self.insert_free(start, lead);
                    }
                }
                return Some(payload);
            }
            prev = current;
            current = unsafe { (*current).next };
        }
        None
    }

    /// Return the chunk of `payload` to the list.
    ///
    /// Returns `false`, leaving everything untouched, if the header does not
    /// describe an in-use chunk.
    ///
    /// # Safety
    /// `payload` must point into memory adopted by this allocator.
    pub(crate) unsafe fn free(&mut self, payload: usize) -> bool {
        let header = (payload - HEADER_SIZE) as *mut ChunkHeader;
        let (size, flags) = unsafe { ((*header).size, (*header).flags) };
        if flags != IN_USE || size < MIN_CHUNK || size % MALLOC_ALIGNMENT != 0 {
            return false;
        }
        unsafe { self.insert_free(header as usize, size) };
        true
    }

    /// Usable bytes of the in-use chunk at `payload`.
    ///
    /// # Safety
    /// `payload` must have been returned by [`memalign`](Self::memalign).
    pub(crate) unsafe fn usable_size(payload: usize) -> usize {
        unsafe { (*((payload - HEADER_SIZE) as *const ChunkHeader)).size - HEADER_SIZE }
    }

    /// Walk the chunks of the range starting at `start` up to its fencepost.
    ///
    /// # Safety
    /// `start` must be the start of a range adopted by [`add_range`](Self::add_range).
    pub(crate) unsafe fn for_each_chunk(start: usize, mut f: impl FnMut(ChunkInfo)) {
        let mut addr = start;
        loop {
            let header = addr as *const ChunkHeader;
            let (size, flags) = unsafe { ((*header).size, (*header).flags) };
            if flags & FENCEPOST != 0 || size == 0 {
                break;
            }
            f(ChunkInfo {
                addr: addr + HEADER_SIZE,
                len: size - HEADER_SIZE,
                in_use: flags & IN_USE != 0,
            });
            addr += size;
        }
    }

    /// Number of chunks in the free list.
    #[cfg(test)]
    fn free_chunks(&self) -> usize {
        let mut n = 0;
        let mut current = self.head.next;
        while !current.is_null() {
            n += 1;
            current = unsafe { (*current).next };
        }
        n
    }
}
