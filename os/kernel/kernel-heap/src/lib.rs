//! # Kernel Heaps
//!
//! Locked, corruption-checked arenas for variable-sized allocations.
//!
//! A [`Heap`] manages up to [`MAX_RANGES`] disjoint memory ranges with a
//! first-fit chunk allocator. Its own state lives at the start of the first
//! range, so creating a heap needs no memory besides the one it manages.
//!
//! * **Static heaps** cover a single caller-provided buffer and never grow.
//! * **Custom heaps** obtain their memory from a [`MemorySource`] and grow by
//!   one range whenever an allocation does not fit, until the maximum size is
//!   reached.
//!
//! ## Accounting
//!
//! ```text
//!  avail = current_avail + (maximum - current)
//!
//!  ┌──────────────── maximum ─────────────────┐
//!  ┌─────────── current ──────────┐
//!  ┌──used──┬─free─┬──used──┬─free┐ ┄┄ headroom ┄┄
//! ```
//!
//! Every range loses one [`FENCEPOST_SIZE`] to the chunk walk terminator, and
//! every range after the first an additional [`MALLOC_ALIGNMENT`] that keeps
//! it from touching its predecessor. An empty heap always reports
//! `current_avail == current`.
//!
//! ## Poisoning
//!
//! With [`HeapConfig::poison`] every allocation is surrounded by guard bytes
//! and a record naming the call site. Guard violations found on free or by
//! [`Heap::check_poison`] panic. When free space runs low the heap logs its
//! pressure and samples the most frequent callers; see
//! [`Heap::dump_allocations`] for the full picture.
//!
//! ```
//! use kernel_heap::{Heap, HeapConfig};
//!
//! let backing = vec![0u8; 64 * 1024].leak();
//! let heap = Heap::create_static("doc", backing, HeapConfig::checked()).unwrap();
//!
//! let p = heap.alloc(100).unwrap();
//! assert!(heap.avail() < heap.stats().maximum);
//! unsafe { heap.free(p) };
//! heap.destroy().unwrap();
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod callers;
mod chunk;
mod config;
mod error;
mod heap;
mod poison;
mod source;

pub use callers::MAX_USERS_TO_DUMP;
pub use chunk::{ChunkInfo, FENCEPOST_SIZE, HEADER_SIZE, MALLOC_ALIGNMENT};
pub use config::{CLEAR_MAX_DEBUG, CLEAR_MAX_RELEASE, HeapConfig};
pub use error::HeapError;
pub use heap::{
    Heap, HeapStats, MANAGEMENT_OVERHEAD, MAX_RANGES, MIN_DUMP_PERIOD_SECONDS,
    PRESSURE_FIRST_DUMP_NTH_CALLER, PRESSURE_FIRST_MSG_PERCENT, PRESSURE_LATER_DUMP_NTH_CALLER,
    PRESSURE_LATER_LOG_NTH_CALLER, PRESSURE_LOG_USERS_PERCENT, PRESSURE_NTH_MSG_PERCENT,
};
pub use poison::{POISON_BYTE, POISON_MAGIC, POISON_PREFIX_SIZE, POISON_SUFFIX_SIZE};
pub use source::{MemorySource, Region};
