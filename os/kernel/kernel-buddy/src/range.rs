//! Range descriptions and the geometry derived from them.

use crate::free_list::ListNode;
use crate::scratch::table_bytes;
use crate::status::BufStatus;
use crate::{BuddyError, MAX_NAME_LEN, MAX_NUM_SIZES, MAX_SIZE_SHIFT};

/// A contiguous range of locations, e.g. memory that should be carved into free buffers.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct AddrRange {
    pub start: u32,
    pub len: u32,
}

impl AddrRange {
    #[must_use]
    pub const fn new(start: u32, len: u32) -> Self {
        Self { start, len }
    }

    /// Exclusive end, computed without overflow.
    #[must_use]
    pub const fn end(&self) -> u64 {
        self.start as u64 + self.len as u64
    }
}

/// Description of a memory space with a fixed extent.
///
/// `min_size` and `max_size` are powers of two in location units. With
/// `color_bits = Some(b)` the low `b` bits of a location select its color;
/// size classes at or above `2^b` have a single color.
#[derive(Debug, Copy, Clone)]
pub struct StaticRange {
    pub name: &'static str,
    pub start: u32,
    pub len: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub color_bits: Option<u32>,
}

impl StaticRange {
    #[must_use]
    pub const fn new(name: &'static str, start: u32, len: u32, min_size: u32, max_size: u32) -> Self {
        Self {
            name,
            start,
            len,
            min_size,
            max_size,
            color_bits: None,
        }
    }

    #[must_use]
    pub const fn with_color_bits(mut self, bits: u32) -> Self {
        self.color_bits = Some(bits);
        self
    }

    /// Scratch bytes required by [`MemorySpace::create_static`](crate::MemorySpace::create_static).
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if the range is malformed.
    pub fn mem_req(&self) -> Result<usize, BuddyError> {
        Ok(Geometry::new_static(self)?.mem_req())
    }
}

/// Description of a memory space that can grow by hot-add.
///
/// The space reserves a block table for `[range.start, range.start + max_len)`.
/// Storage is committed one block at a time; a block is
/// `min_hot_add_len_hint` rounded up to a power of two.
#[derive(Debug, Copy, Clone)]
pub struct DynamicRange {
    pub range: StaticRange,
    pub max_len: u32,
    pub min_hot_add_len_hint: u32,
}

impl DynamicRange {
    #[must_use]
    pub const fn new(range: StaticRange, max_len: u32, min_hot_add_len_hint: u32) -> Self {
        Self {
            range,
            max_len,
            min_hot_add_len_hint,
        }
    }

    /// Scratch bytes required by [`MemorySpace::create_dynamic`](crate::MemorySpace::create_dynamic).
    ///
    /// # Errors
    /// [`BuddyError::BadParameter`] if the range is malformed.
    pub fn mem_req(&self) -> Result<usize, BuddyError> {
        Ok(Geometry::new_dynamic(self)?.mem_req())
    }
}

/// Everything about a space that follows from its range description.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Geometry {
    pub name: &'static str,
    pub min_shift: u32,
    pub max_shift: u32,
    /// Low location bits that determine the color; `min_shift` when uncolored.
    pub color_bits: u32,
    pub dynamic: bool,
    pub start_buf: u32,
    /// End of the initially covered range.
    pub end_buf: u32,
    /// End of the window reserved in the block table.
    pub limit_buf: u32,
    pub num_blocks: usize,
    /// Block length in location units.
    pub block_size: u64,
    /// Status entries per block.
    pub block_buffers: usize,
    pub block_shift: u32,
    pub block_mask: u32,
    /// Blocks that receive storage at creation.
    pub initial_blocks: usize,
}

const fn align_down(v: u64, align: u64) -> u64 {
    v & !(align - 1)
}

const fn align_up(v: u64, align: u64) -> u64 {
    (v + align - 1) & !(align - 1)
}

fn validate_sizes(r: &StaticRange) -> Result<(u32, u32, u32), BuddyError> {
    if r.name.len() > MAX_NAME_LEN {
        log::warn!("buddy: name '{}' exceeds {MAX_NAME_LEN} bytes", r.name);
        return Err(BuddyError::BadParameter);
    }
    if !r.min_size.is_power_of_two() || !r.max_size.is_power_of_two() || r.min_size >= r.max_size {
        log::warn!(
            "buddy {}: invalid buffer sizes min={:#x} max={:#x}",
            r.name,
            r.min_size,
            r.max_size
        );
        return Err(BuddyError::BadParameter);
    }
    let min_shift = r.min_size.trailing_zeros();
    let max_shift = r.max_size.trailing_zeros();
    if max_shift > MAX_SIZE_SHIFT || (max_shift - min_shift) as usize >= MAX_NUM_SIZES {
        log::warn!("buddy {}: too many size classes", r.name);
        return Err(BuddyError::BadParameter);
    }
    if r.len == 0 {
        log::warn!("buddy {}: empty range", r.name);
        return Err(BuddyError::BadParameter);
    }
    let color_bits = match r.color_bits {
        None => min_shift,
        Some(bits) if bits <= MAX_SIZE_SHIFT => bits,
        Some(bits) => {
            log::warn!("buddy {}: {bits} color bits not supported", r.name);
            return Err(BuddyError::BadParameter);
        }
    };
    Ok((min_shift, max_shift, color_bits))
}

/// Status entries and list nodes for `buffers` units, each padded for alignment.
pub(crate) const fn block_storage_bytes(buffers: usize) -> usize {
    table_bytes::<BufStatus>(buffers) + table_bytes::<ListNode>(buffers.div_ceil(2))
}

impl Geometry {
    pub(crate) fn new_static(r: &StaticRange) -> Result<Self, BuddyError> {
        let (min_shift, max_shift, color_bits) = validate_sizes(r)?;
        let max = u64::from(r.max_size);

        let start = align_down(u64::from(r.start), max);
        let end = align_up(AddrRange::new(r.start, r.len).end(), max);
        if end > align_down(u64::from(u32::MAX), max) {
            log::warn!("buddy {}: range end {end:#x} out of bounds", r.name);
            return Err(BuddyError::BadParameter);
        }

        let len = end - start;
        let rounded = len.next_power_of_two();
        let block_buffers = rounded >> min_shift;
        let (start_buf, end_buf) = Self::buf_bounds(start, end, min_shift);

        Ok(Self {
            name: r.name,
            min_shift,
            max_shift,
            color_bits,
            dynamic: false,
            start_buf,
            end_buf,
            limit_buf: end_buf,
            num_blocks: 1,
            block_size: len,
            // A static block only stores the units it actually covers.
            block_buffers: (end_buf - start_buf) as usize,
            block_shift: block_buffers.trailing_zeros(),
            #[allow(clippy::cast_possible_truncation)]
            block_mask: (block_buffers - 1) as u32,
            initial_blocks: 1,
        })
    }

    pub(crate) fn new_dynamic(d: &DynamicRange) -> Result<Self, BuddyError> {
        let r = &d.range;
        let (min_shift, max_shift, color_bits) = validate_sizes(r)?;

        if d.min_hot_add_len_hint < r.max_size || d.max_len < r.len {
            log::warn!(
                "buddy {}: hot-add hint {:#x} / max len {:#x} too small",
                r.name,
                d.min_hot_add_len_hint,
                d.max_len
            );
            return Err(BuddyError::BadParameter);
        }

        let block_size = u64::from(d.min_hot_add_len_hint).next_power_of_two();
        let window_start = align_down(u64::from(r.start), block_size);
        let window_end = align_up(AddrRange::new(r.start, d.max_len).end(), block_size);
        let initial_end = align_up(AddrRange::new(r.start, r.len).end(), block_size);
        if window_end > align_down(u64::from(u32::MAX), block_size) {
            log::warn!("buddy {}: window end {window_end:#x} out of bounds", r.name);
            return Err(BuddyError::BadParameter);
        }

        let final_len = window_end - window_start;
        let initial_len = initial_end - window_start;
        if final_len < u64::from(r.max_size) || final_len < initial_len {
            log::warn!("buddy {}: window smaller than the initial range", r.name);
            return Err(BuddyError::BadParameter);
        }

        let block_buffers = block_size >> min_shift;
        let (start_buf, end_buf) = Self::buf_bounds(window_start, initial_end, min_shift);
        let (_, limit_buf) = Self::buf_bounds(window_start, window_end, min_shift);

        #[allow(clippy::cast_possible_truncation)]
        Ok(Self {
            name: r.name,
            min_shift,
            max_shift,
            color_bits,
            dynamic: true,
            start_buf,
            end_buf,
            limit_buf,
            num_blocks: (final_len / block_size) as usize,
            block_size,
            block_buffers: block_buffers as usize,
            block_shift: block_buffers.trailing_zeros(),
            block_mask: (block_buffers - 1) as u32,
            initial_blocks: (initial_len / block_size) as usize,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    const fn buf_bounds(start: u64, end: u64, min_shift: u32) -> (u32, u32) {
        ((start >> min_shift) as u32, (end >> min_shift) as u32)
    }

    pub(crate) const fn num_sizes(&self) -> usize {
        (self.max_shift - self.min_shift + 1) as usize
    }

    pub(crate) const fn is_colored(&self) -> bool {
        self.min_shift < self.color_bits
    }

    /// Number of colors of size class `shift`.
    pub(crate) const fn num_colors(&self, shift: u32) -> u32 {
        if self.color_bits > shift {
            1 << (self.color_bits - shift)
        } else {
            1
        }
    }

    /// Color of the buffer `buf` when viewed at size class `shift`.
    pub(crate) const fn color_of(&self, buf: u32, shift: u32) -> u32 {
        if self.color_bits <= shift {
            0
        } else {
            (buf >> (shift - self.min_shift)) & ((1 << (self.color_bits - shift)) - 1)
        }
    }

    /// Bytes carved at creation: block table, free lists, color counters and
    /// the storage of the initially covered blocks.
    pub(crate) fn mem_req(&self) -> usize {
        let lists: usize = (self.min_shift..=self.max_shift)
            .map(|shift| self.num_colors(shift) as usize)
            .sum();
        let colors = self.num_colors(self.min_shift) as usize;

        table_bytes::<Option<crate::inner::BlockStorage<'static>>>(self.num_blocks)
            + 2 * table_bytes::<u32>(lists)
            + 2 * table_bytes::<u32>(colors)
            + self.initial_blocks * block_storage_bytes(self.block_buffers)
    }

    /// Block index of `[start, start + len)` aligned outward to whole blocks.
    pub(crate) fn block_span(&self, start: u32, len: u32) -> (u64, u64) {
        let s = align_down(u64::from(start), self.block_size);
        let e = align_up(AddrRange::new(start, len).end(), self.block_size);
        (s, e)
    }
}
