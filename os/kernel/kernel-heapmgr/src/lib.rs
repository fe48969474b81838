//! # Heap Manager
//!
//! Page-granular memory for growable [`Heap`](kernel_heap::Heap)s, backed by
//! large pages that are mapped on demand and given back when idle.
//!
//! The manager keeps two pools, one for any physical memory and one for
//! memory below 4 GiB. Each pool is a dynamic buddy space over the virtual
//! window of its [`LargePageMapper`], counted in 4 KiB pages:
//!
//! ```text
//!  window.start                                       window.end
//!  ├── 2 MiB ──┼── 2 MiB ──┼── 2 MiB ──┼── 2 MiB ──┼ ┄┄┄┄┄┄┄┄┄┤
//!  │  mapped   │ unmapped  │ released  │  mapped   │
//!  │ buddy free│           │buddy used │ buddy free│
//! ```
//!
//! Requests of up to [`MAX_BUF_SIZE`] are served from the buddy space. When
//! it runs dry, one more chunk is mapped and hot-added, or freed back into
//! the space if the mapper handed out a previously released chunk again.
//!
//! ## Ballooning
//!
//! Freeing memory past the high-water mark schedules a single release
//! through the [`ReleaseSchedule`]. [`HeapMgr::release_extra_memory`] then
//! allocates whole chunks out of the buddy space, unmaps them and returns
//! their large pages until the pool is down to the low-water mark. Released
//! chunks stay allocated in the buddy space, so nothing can hand out their
//! unmapped addresses.
//!
//! ## Debug checks
//!
//! [`HeapMgrConfig::checked`] puts a filled guard page in front of every
//! region and fills free memory with a pattern. Either being overwritten is
//! fatal.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod allocator;
mod config;
mod error;
mod granules;
mod manager;
mod mapper;
mod pattern;

pub use allocator::{HeapMgrAllocator, PoolStats};
pub use config::HeapMgrConfig;
pub use error::HeapMgrError;
pub use manager::HeapMgr;
pub use mapper::{LargePage, LargePageMapper, MemKind, ReleaseNotifier, ReleaseSchedule};
pub use pattern::{FREE_REGION_VALUE, GUARD_PAGE_VALUE};

pub const PAGE_SIZE: usize = 4096;
pub const LARGE_PAGE_SIZE: usize = 2 * 1024 * 1024;

/// Smallest region handed out.
pub const MIN_BUF_SIZE: usize = 64 * 1024;
pub const MIN_BUF_PAGES: usize = MIN_BUF_SIZE / PAGE_SIZE;

/// Largest region handed out, and the unit the pools grow and shrink by.
pub const MAX_BUF_SIZE: usize = LARGE_PAGE_SIZE * LARGE_PAGES_PER_CHUNK;
pub const MAX_BUF_PAGES: usize = MAX_BUF_SIZE / PAGE_SIZE;

pub const LARGE_PAGES_PER_CHUNK: usize = 1;

/// Default free bytes above which a release is scheduled.
pub const RELEASE_HIGH_WATER: usize = 12 * 1024 * 1024;

/// Default free bytes a release leaves behind.
pub const RELEASE_LOW_WATER: usize = 8 * 1024 * 1024;

/// Large pages in the biggest window a pool can manage.
pub const MAX_GRANULES: usize = 512;

const _: () = assert!(RELEASE_LOW_WATER < RELEASE_HIGH_WATER);
const _: () = assert!(MAX_GRANULES % (u32::BITS as usize) == 0);
