//! # Buddy Allocator
//!
//! Manages independent *memory spaces*: numeric ranges of equally sized
//! minimum units that are handed out as power-of-two sized, naturally aligned
//! buffers. The unit of a location is up to the caller. The heap manager
//! uses page numbers; the tests below mostly use plain byte offsets.
//!
//! ## Layout of a memory space
//!
//! ```text
//!  start_buf                                                   end_buf
//!  │◄──────────── block 0 ────────────►│◄────────── block 1 ───────────►│ ...
//!  ┌────────┬────────┬────────────────┬┴───────────────────────────────┐
//!  │ 1 unit │ 1 unit │    2 units     │            4 units             │
//!  └────────┴────────┴────────────────┴────────────────────────────────┘
//!   status table: one byte per unit (2-bit state, 6-bit size shift)
//!   list nodes:   one {prev, next} pair per two units
//!   free lists:   one doubly linked list per (size class, color)
//! ```
//!
//! * **Static spaces** have a single block covering the whole aligned range.
//! * **Dynamic spaces** reserve a block table for an entire window up front
//!   and receive storage for individual blocks when ranges are hot-added.
//!
//! All tables are carved from caller-supplied scratch memory; use
//! [`StaticRange::mem_req`] or [`DynamicRange::mem_req`] to size it. Buffers
//! are identified by their *buffer number* (`location >> min_shift`), never by
//! pointers, so the structure stays valid wherever the scratch memory lives.
//!
//! ## Allocation
//!
//! A request is rounded up to the smallest size class that fits and served
//! from the free lists of that class or the next larger one that has a
//! buffer. Larger buffers are split in halves, the half matching the
//! requested color is kept. When the request is not a power of two, the
//! unused tail is returned to the free lists right away and the real size is
//! recorded in the status table (see [`SizeEncoding`]).
//!
//! ## Concurrency
//!
//! Every space has a main lock for allocate/free and a second lock that only
//! serializes hot-add. Both are interrupt-masking [`kernel_sync::SpinLock`]s.
//! A reference count lets [`MemorySpace::destroy`] wait for in-flight callers
//! without blocking them.
//!
//! ```
//! use kernel_buddy::{AddrRange, Color, MemorySpace, StaticRange};
//!
//! let range = StaticRange::new("doc", 0, 1 << 20, 4096, 1 << 16);
//! let scratch = vec![0u8; range.mem_req().unwrap()].leak();
//! let space = MemorySpace::create_static(&range, scratch, &[AddrRange::new(0, 1 << 20)]).unwrap();
//!
//! let loc = space.allocate_color(3 * 4096, Color::Any).unwrap();
//! assert_eq!(space.free(loc).unwrap(), 3 * 4096);
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

mod error;
mod free_list;
mod inner;
mod range;
mod scratch;
mod space;
mod stats;
mod status;

pub use error::BuddyError;
pub use range::{AddrRange, DynamicRange, StaticRange};
pub use space::{Color, MemorySpace};
pub use stats::BuddyStats;
pub use status::{BufState, BufStatus, SizeEncoding, SizeType};

/// Maximum number of distinct buffer sizes per space.
pub const MAX_NUM_SIZES: usize = 16;

/// Largest supported buffer size shift (2 GiB location units).
pub const MAX_SIZE_SHIFT: u32 = 31;

/// Largest unit count the complex size encoding can store (24 bits).
pub const MAX_NUM_BUFFERS: u32 = 0x00ff_ffff;

/// Maximum length of a space name.
pub const MAX_NAME_LEN: usize = 16;

/// Upper bound of concurrent callers inside one space.
pub const MAX_REF_COUNT: u32 = 64;

/// Number of status entries [`MemorySpace::alloc_range`] inspects when
/// looking for the next free buffer.
pub const MAX_SCAN: u32 = 64 * 1024;
