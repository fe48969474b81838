//! The buddy algorithm proper. Everything here runs under the main lock of
//! a [`MemorySpace`](crate::MemorySpace).

use crate::free_list::{FreeLists, INVALID_BUF, ListNode};
use crate::range::{AddrRange, Geometry};
use crate::scratch::Scratch;
use crate::space::Color;
use crate::stats::{BuddyStats, Counters};
use crate::status::{
    BufState, BufStatus, COMPLEX_SHIFT, INVALID_SHIFT, SizeEncoding, SizeType, THREE_UNITS_SHIFT,
};
use crate::{BuddyError, MAX_NUM_SIZES, MAX_SCAN};
use log::{info, warn};

/// Status entries and list nodes of one block.
pub(crate) struct BlockStorage<'a> {
    status: &'a mut [BufStatus],
    nodes: &'a mut [ListNode],
}

/// Maps buffer numbers to their status entry and list node.
pub(crate) struct BufTable<'a> {
    blocks: &'a mut [Option<BlockStorage<'a>>],
    start_buf: u32,
    block_shift: u32,
    block_mask: u32,
}

impl<'a> BufTable<'a> {
    #[inline]
    fn locate(&self, buf: u32) -> Option<(usize, usize)> {
        let rel = buf.checked_sub(self.start_buf)?;
        let block = rel.checked_shr(self.block_shift).unwrap_or(0) as usize;
        let ndx = (rel & self.block_mask) as usize;
        let storage = self.blocks.get(block)?.as_ref()?;
        (ndx < storage.status.len()).then_some((block, ndx))
    }

    #[inline]
    fn storage_mut(&mut self, buf: u32) -> Option<(&mut BlockStorage<'a>, usize)> {
        let (block, ndx) = self.locate(buf)?;
        let storage = self.blocks[block].as_mut()?;
        Some((storage, ndx))
    }

    /// Status of `buf`, `None` for units without storage.
    #[inline]
    pub(crate) fn status(&self, buf: u32) -> Option<BufStatus> {
        let (block, ndx) = self.locate(buf)?;
        self.blocks[block].as_ref().map(|s| s.status[ndx])
    }

    #[inline]
    pub(crate) fn set_status(&mut self, buf: u32, status: BufStatus) {
        match self.storage_mut(buf) {
            Some((storage, ndx)) => storage.status[ndx] = status,
            None => debug_assert!(false, "status update of buffer {buf} without storage"),
        }
    }

    #[inline]
    pub(crate) fn node(&self, buf: u32) -> Option<ListNode> {
        let (block, ndx) = self.locate(buf)?;
        self.blocks[block].as_ref().map(|s| s.nodes[ndx / 2])
    }

    #[inline]
    pub(crate) fn set_node(&mut self, buf: u32, node: ListNode) {
        self.update_node(buf, |n| *n = node);
    }

    #[inline]
    pub(crate) fn update_node(&mut self, buf: u32, f: impl FnOnce(&mut ListNode)) {
        match self.storage_mut(buf) {
            Some((storage, ndx)) => f(&mut storage.nodes[ndx / 2]),
            None => debug_assert!(false, "list update of buffer {buf} without storage"),
        }
    }
}

/// State of a memory space protected by its main lock.
pub(crate) struct SpaceInner<'a> {
    pub geo: Geometry,
    /// Exclusive end of the buffers that may currently be carved.
    pub end_buf: u32,
    table: BufTable<'a>,
    lists: FreeLists<'a>,
    counters: Counters<'a>,
}

impl<'a> SpaceInner<'a> {
    /// Carve the tables from `scratch` and give storage to the initial blocks.
    pub(crate) fn new(geo: Geometry, scratch: &mut Scratch<'a>) -> Result<Self, BuddyError> {
        let blocks = scratch
            .carve(geo.num_blocks, |_| None)
            .ok_or(BuddyError::BadParameter)?;

        let mut colors = [0u32; MAX_NUM_SIZES];
        for (i, shift) in (geo.min_shift..=geo.max_shift).enumerate() {
            colors[i] = geo.num_colors(shift);
        }
        let colors = &colors[..geo.num_sizes()];
        let num_lists = colors.iter().map(|&c| c as usize).sum();
        let heads = scratch.carve(num_lists, |_| 0).ok_or(BuddyError::BadParameter)?;
        let tails = scratch.carve(num_lists, |_| 0).ok_or(BuddyError::BadParameter)?;

        let num_colors = geo.num_colors(geo.min_shift) as usize;
        let color_free = scratch.carve(num_colors, |_| 0).ok_or(BuddyError::BadParameter)?;
        let color_tot = scratch.carve(num_colors, |_| 0).ok_or(BuddyError::BadParameter)?;

        let mut inner = Self {
            geo,
            end_buf: geo.end_buf,
            table: BufTable {
                blocks,
                start_buf: geo.start_buf,
                block_shift: geo.block_shift,
                block_mask: geo.block_mask,
            },
            lists: FreeLists::new(heads, tails, colors),
            counters: Counters {
                num_carved: 0,
                num_free_carved: 0,
                num_used: [0; MAX_NUM_SIZES],
                type_allocated: [0; 3],
                type_released: [0; 3],
                color_free,
                color_tot,
            },
        };
        inner.assign_storage(scratch, 0, geo.initial_blocks);
        Ok(inner)
    }

    #[inline]
    const fn units(&self, shift: u32) -> u32 {
        1 << (shift - self.geo.min_shift)
    }

    #[inline]
    const fn size_idx(&self, shift: u32) -> usize {
        (shift - self.geo.min_shift) as usize
    }

    #[inline]
    fn mark(&mut self, buf: u32, state: BufState, shift: u32) {
        #[allow(clippy::cast_possible_truncation)]
        self.table.set_status(buf, BufStatus::head(state, shift as u8));
    }

    #[inline]
    fn mark_free(&mut self, buf: u32) {
        if let Some(s) = self.table.status(buf) {
            self.table.set_status(buf, s.with_state(BufState::Free));
        }
    }

    /// `buf` heads a free buffer of size `shift` that sits on a free list.
    ///
    /// The link check rejects the raw count bytes of complex allocations,
    /// which can look like a free head.
    #[inline]
    fn is_free_at(&self, buf: u32, shift: u32) -> bool {
        self.table
            .status(buf)
            .is_some_and(|s| s.state() == BufState::Free && u32::from(s.shift()) == shift)
            && self.is_linked(buf)
    }

    #[inline]
    fn is_linked(&self, buf: u32) -> bool {
        self.table.node(buf).is_some_and(|n| n.prev != INVALID_BUF)
    }

    /// Largest aligned power of two that starts at `buf` and fits in `units`.
    #[inline]
    fn piece_shift(&self, buf: u32, units: u32) -> u32 {
        let fit = 1 << (u32::BITS - 1 - units.leading_zeros());
        let max_units = self.units(self.geo.max_shift);
        (fit | buf | max_units).trailing_zeros() + self.geo.min_shift
    }

    #[inline]
    fn color_slot(&self, unit: u32) -> usize {
        if self.geo.is_colored() {
            self.geo.color_of(unit, self.geo.min_shift) as usize
        } else {
            0
        }
    }

    fn adjust_color_free(&mut self, buf: u32, units: u32, increment: bool) {
        if !self.geo.is_colored() {
            let free = &mut self.counters.color_free[0];
            *free = if increment { *free + units } else { *free - units };
            return;
        }
        for unit in buf..buf + units {
            let slot = self.color_slot(unit);
            let free = &mut self.counters.color_free[slot];
            *free = if increment { *free + 1 } else { *free - 1 };
        }
    }

    fn insert_free(&mut self, buf: u32, shift: u32) {
        let color = self.geo.color_of(buf, shift);
        let idx = self.size_idx(shift);
        self.lists.insert(&mut self.table, buf, idx, color);
    }

    fn remove_free(&mut self, buf: u32, shift: u32) {
        let color = self.geo.color_of(buf, shift);
        let idx = self.size_idx(shift);
        self.lists.remove(&mut self.table, buf, idx, color);
    }

    /// Merge `buf` with its buddies for as long as they are free.
    fn coalesce(&mut self, mut buf: u32, mut shift: u32) -> (u32, u32) {
        while shift < self.geo.max_shift {
            let n = self.units(shift);
            let buddy = if buf & n == 0 { buf + n } else { buf - n };
            if !self.is_free_at(buddy, shift) {
                break;
            }
            let merged = buf.min(buddy);

            self.mark_free(buf);
            self.remove_free(buddy, shift);
            for b in [buf, buddy] {
                if let Some(s) = self.table.status(b) {
                    self.table.set_status(b, s.with_shift(INVALID_SHIFT));
                }
            }
            self.mark(merged, BufState::InUse, shift + 1);

            buf = merged;
            shift += 1;
        }
        (buf, shift)
    }

    /// Return an in-use buffer to the free lists.
    fn free_int(&mut self, buf: u32, shift: u32) {
        let (buf, shift) = self.coalesce(buf, shift);
        self.mark_free(buf);
        self.insert_free(buf, shift);
    }

    /// Turn a run of reserved units into a free buffer.
    fn add_buffer(&mut self, buf: u32, shift: u32) {
        let n = self.units(shift);
        for unit in buf..buf + n {
            self.table
                .set_status(unit, BufStatus::head(BufState::Free, INVALID_SHIFT));
            let slot = self.color_slot(unit);
            self.counters.color_tot[slot] += 1;
            self.counters.color_free[slot] += 1;
        }
        self.mark(buf, BufState::InUse, shift);
        self.counters.num_carved += n;
        self.counters.num_free_carved += n;
        self.free_int(buf, shift);
    }

    fn is_reserved(&self, buf: u32) -> bool {
        self.table
            .status(buf)
            .is_some_and(|s| s.state() == BufState::Reserved)
    }

    /// Carve one aligned piece. Units that were carved before are skipped.
    pub(crate) fn carve_piece(&mut self, buf: u32, shift: u32) {
        let n = self.units(shift);
        if (buf..buf + n).all(|u| self.is_reserved(u)) {
            self.add_buffer(buf, shift);
            return;
        }
        for unit in buf..buf + n {
            if self.is_reserved(unit) {
                self.add_buffer(unit, self.geo.min_shift);
            }
        }
    }

    /// Buffer-number bounds and piece sizes of a carve range.
    ///
    /// Returns `None` for ranges that round down to nothing or lie outside
    /// the space.
    pub(crate) fn carve_bounds(&self, range: &AddrRange) -> Option<(u32, u32)> {
        let min = 1u64 << self.geo.min_shift;
        let start = u64::from(range.start).div_ceil(min);
        let end = range.end() / min;
        if start >= end {
            return None;
        }
        if start < u64::from(self.geo.start_buf) || end > u64::from(self.end_buf) {
            warn!(
                "buddy {}: carve range {:#x}+{:#x} outside of the space",
                self.geo.name, range.start, range.len
            );
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        Some((start as u32, end as u32))
    }

    /// Next piece of the carve run `[buf, buf + units)`.
    pub(crate) fn next_piece(&self, buf: u32, units: u32) -> (u32, u32) {
        let shift = self.piece_shift(buf, units);
        (shift, self.units(shift))
    }

    fn size_to_shift(&self, size: u32) -> Result<u32, BuddyError> {
        if size == 0 || u64::from(size) > 1u64 << self.geo.max_shift {
            return Err(BuddyError::Unsupported);
        }
        Ok(size.next_power_of_two().trailing_zeros().max(self.geo.min_shift))
    }

    fn validate_color(&self, color: Color, shift: u32) -> Result<(), BuddyError> {
        match color {
            Color::Any => Ok(()),
            Color::Fixed(c) if c < self.geo.num_colors(shift) => Ok(()),
            Color::Fixed(c) => {
                warn!(
                    "buddy {}: color {c} out of range for size {:#x}",
                    self.geo.name,
                    1u64 << shift
                );
                Err(BuddyError::BadParameter)
            }
        }
    }

    /// Remove a free buffer of at least `req_shift` from the lists.
    fn get_free_buf(&mut self, req_shift: u32, color: Color) -> Option<(u32, u32)> {
        let mut color = color;
        for shift in req_shift..=self.geo.max_shift {
            let idx = self.size_idx(shift);
            match color {
                Color::Any => {
                    for c in 0..self.geo.num_colors(shift) {
                        if let Some(buf) = self.lists.remove_head(&mut self.table, idx, c) {
                            return Some((buf, shift));
                        }
                    }
                }
                Color::Fixed(c) => {
                    if let Some(buf) = self.lists.remove_head(&mut self.table, idx, c) {
                        return Some((buf, shift));
                    }
                    color = Color::Fixed(c >> 1);
                }
            }
        }
        None
    }

    /// Halve `buf` down to `req_shift`, keeping the half with the requested color.
    fn split(&mut self, mut buf: u32, mut shift: u32, req_shift: u32, color: Color) -> u32 {
        while shift > req_shift {
            self.mark_free(buf);
            let half = self.units(shift - 1);
            let keep_low = match color {
                Color::Any => true,
                Color::Fixed(c) => {
                    let wanted = c >> (shift - 1 - req_shift);
                    wanted == self.geo.color_of(buf, shift - 1)
                }
            };
            let other = if keep_low {
                buf + half
            } else {
                let low = buf;
                buf += half;
                low
            };
            self.mark(buf, BufState::InUse, shift - 1);
            self.mark(other, BufState::Free, shift - 1);
            self.insert_free(other, shift - 1);
            shift -= 1;
        }
        buf
    }

    /// Give back the unused tail of an allocation. Returns the retained units.
    fn reduce_fragmentation(&mut self, buf: u32, shift: u32, size: u32) -> u32 {
        let buf_units = self.units(shift);
        let units = size.div_ceil(1 << self.geo.min_shift);
        if units == buf_units {
            self.counters.num_used[self.size_idx(shift)] += 1;
            self.counters.num_free_carved -= buf_units;
            return buf_units;
        }

        self.mark_free(buf);

        // Pin the retained head first so freeing the tail cannot merge into it.
        let mut cur = buf;
        let mut left = units;
        while left > 0 {
            let (piece, n) = self.next_piece(cur, left);
            self.counters.num_used[self.size_idx(piece)] += 1;
            self.counters.num_free_carved -= n;
            self.mark(cur, BufState::InUse, piece);
            cur += n;
            left -= n;
        }

        let mut left = buf_units - units;
        while left > 0 {
            let (piece, n) = self.next_piece(cur, left);
            self.mark(cur, BufState::InUse, piece);
            self.free_int(cur, piece);
            cur += n;
            left -= n;
        }
        units
    }

    fn set_size(&mut self, buf: u32, units: u32) -> SizeEncoding {
        let encoding = SizeEncoding::for_units(units, self.geo.min_shift);
        match encoding {
            SizeEncoding::PowerOfTwo(shift) => self.mark(buf, BufState::InUse, u32::from(shift)),
            SizeEncoding::ThreeUnits => {
                self.table
                    .set_status(buf, BufStatus::head(BufState::InUse, THREE_UNITS_SHIFT));
            }
            SizeEncoding::Complex(units) => {
                self.table
                    .set_status(buf, BufStatus::head(BufState::InUse, COMPLEX_SHIFT));
                for i in 1..=3 {
                    #[allow(clippy::cast_possible_truncation)]
                    let byte = (units >> (8 * (i - 1))) as u8;
                    self.table.set_status(buf + i, BufStatus::from_bits(byte));
                }
            }
        }
        encoding
    }

    /// Decode the size recorded for the head unit `buf`.
    pub(crate) fn size_encoding(&self, buf: u32) -> Option<SizeEncoding> {
        let status = self.table.status(buf)?;
        match status.shift() {
            COMPLEX_SHIFT => {
                let mut units = 0;
                for i in 1..=3 {
                    let byte = self.table.status(buf + i)?.into_bits();
                    units |= u32::from(byte) << (8 * (i - 1));
                }
                Some(SizeEncoding::Complex(units))
            }
            THREE_UNITS_SHIFT => Some(SizeEncoding::ThreeUnits),
            shift if (self.geo.min_shift..=self.geo.max_shift).contains(&u32::from(shift)) => {
                Some(SizeEncoding::PowerOfTwo(shift))
            }
            _ => None,
        }
    }

    /// Restore the power-of-two view of a non power-of-two allocation.
    fn clear_size(&mut self, buf: u32, encoding: SizeEncoding) {
        let units = encoding.units(self.geo.min_shift);
        match encoding {
            SizeEncoding::PowerOfTwo(_) => {}
            SizeEncoding::ThreeUnits => {
                let shift = self.piece_shift(buf, units);
                self.mark(buf, BufState::InUse, shift);
            }
            SizeEncoding::Complex(_) => {
                let shift = self.piece_shift(buf, units);
                self.mark(buf, BufState::InUse, shift);
                for i in 1..=3 {
                    self.table
                        .set_status(buf + i, BufStatus::head(BufState::Free, INVALID_SHIFT));
                }
            }
        }
    }

    pub(crate) fn allocate(&mut self, size: u32, color: Color) -> Result<u32, BuddyError> {
        let req_shift = self.size_to_shift(size)?;
        self.validate_color(color, req_shift)?;

        let (buf, shift) = self
            .get_free_buf(req_shift, color)
            .ok_or(BuddyError::NoBuffers)?;
        self.mark(buf, BufState::InUse, shift);

        let buf = self.split(buf, shift, req_shift, color);
        let units = self.reduce_fragmentation(buf, req_shift, size);
        let encoding = self.set_size(buf, units);
        self.adjust_color_free(buf, units, false);
        self.counters.type_allocated[encoding.size_type() as usize] += 1;

        Ok(buf << self.geo.min_shift)
    }

    fn loc_to_buf(&self, loc: u32) -> Result<u32, BuddyError> {
        let buf = loc >> self.geo.min_shift;
        if loc & ((1 << self.geo.min_shift) - 1) != 0 || buf < self.geo.start_buf || buf >= self.end_buf {
            warn!("buddy {}: invalid location {loc:#x}", self.geo.name);
            return Err(BuddyError::BadParameter);
        }
        Ok(buf)
    }

    /// `buf` lies past the head of a live three-unit or complex allocation.
    ///
    /// Such allocations sit at the start of a buffer aligned to their rounded
    /// size, so only the aligned units below `buf` can be their head. This
    /// catches the heads of retained pieces and the raw count bytes.
    fn is_inside_encoded(&self, buf: u32) -> bool {
        (1..=self.geo.max_shift - self.geo.min_shift).any(|k| {
            let head = buf & !((1 << k) - 1);
            head != buf
                && self
                    .table
                    .status(head)
                    .is_some_and(|s| s.state() == BufState::InUse)
                && match self.size_encoding(head) {
                    Some(e @ (SizeEncoding::ThreeUnits | SizeEncoding::Complex(_))) => {
                        head + e.units(self.geo.min_shift) > buf
                    }
                    _ => false,
                }
        })
    }

    fn allocated_size(&self, loc: u32) -> Result<(u32, SizeEncoding), BuddyError> {
        let buf = self.loc_to_buf(loc)?;
        let encoding = self
            .table
            .status(buf)
            .filter(|s| s.state() == BufState::InUse)
            .filter(|_| !self.is_inside_encoded(buf))
            .and_then(|_| self.size_encoding(buf));
        match encoding {
            Some(encoding) => Ok((buf, encoding)),
            None => {
                warn!("buddy {}: location {loc:#x} is not allocated", self.geo.name);
                Err(BuddyError::BadParameter)
            }
        }
    }

    pub(crate) fn loc_size(&self, loc: u32) -> Result<u32, BuddyError> {
        let (_, encoding) = self.allocated_size(loc)?;
        Ok(encoding.units(self.geo.min_shift) << self.geo.min_shift)
    }

    pub(crate) fn free(&mut self, loc: u32) -> Result<u32, BuddyError> {
        let (buf, encoding) = self.allocated_size(loc)?;
        let units = encoding.units(self.geo.min_shift);
        self.clear_size(buf, encoding);
        self.counters.type_released[encoding.size_type() as usize] += 1;

        let mut cur = buf;
        let mut left = units;
        while left > 0 {
            let (piece, n) = self.next_piece(cur, left);
            self.counters.num_used[self.size_idx(piece)] -= 1;
            self.counters.num_free_carved += n;
            self.adjust_color_free(cur, n, true);
            self.free_int(cur, piece);
            cur += n;
            left -= n;
        }
        Ok(units << self.geo.min_shift)
    }

    /// Claim the free buffer enclosing `*loc`, or move `*loc` to the next candidate.
    pub(crate) fn alloc_range(&mut self, loc: &mut u32) -> Result<u32, BuddyError> {
        let mut loc_buf = *loc >> self.geo.min_shift;
        if loc_buf < self.geo.start_buf || loc_buf >= self.end_buf {
            return Err(BuddyError::Failure);
        }

        for shift in self.geo.min_shift..=self.geo.max_shift {
            let start = *loc & !((1u32 << shift) - 1);
            let start_buf = start >> self.geo.min_shift;
            let Some(status) = self.table.status(start_buf) else {
                break;
            };
            if status.state() != BufState::Free {
                break;
            }
            if !self.is_free_at(start_buf, shift) {
                continue;
            }

            let n = self.units(shift);
            self.remove_free(start_buf, shift);
            self.mark(start_buf, BufState::InUse, shift);
            self.counters.num_used[self.size_idx(shift)] += 1;
            self.counters.num_free_carved -= n;
            self.counters.type_allocated[SizeType::PowerOfTwo as usize] += 1;
            self.adjust_color_free(start_buf, n, false);
            *loc = start;
            return Ok(1 << shift);
        }

        let mut budget = MAX_SCAN;
        while loc_buf < self.end_buf && budget > 0 {
            loc_buf = match self.table.status(loc_buf) {
                None => self.next_block(loc_buf),
                Some(s) if s.state() == BufState::Free && self.is_free_at(loc_buf, u32::from(s.shift())) => {
                    break;
                }
                Some(s) if s.state() == BufState::InUse => match self.size_encoding(loc_buf) {
                    Some(e) => loc_buf + e.units(self.geo.min_shift),
                    None => loc_buf + 1,
                },
                Some(_) => loc_buf + 1,
            };
            budget -= 1;
        }
        *loc = loc_buf.min(self.end_buf) << self.geo.min_shift;
        Err(BuddyError::NoBuffers)
    }

    /// First buffer of the block after the one containing `buf`.
    fn next_block(&self, buf: u32) -> u32 {
        let block_buffers = self.geo.block_buffers as u64;
        let rel = u64::from(buf - self.geo.start_buf);
        let next = u64::from(self.geo.start_buf) + (rel / block_buffers + 1) * block_buffers;
        #[allow(clippy::cast_possible_truncation)]
        let next = next.min(u64::from(self.end_buf)) as u32;
        next
    }

    /// Block indices of the location span `[start, end)`.
    pub(crate) fn block_indices(&self, start: u64, end: u64) -> (usize, usize) {
        let base = u64::from(self.geo.start_buf) << self.geo.min_shift;
        #[allow(clippy::cast_possible_truncation)]
        (
            ((start - base) / self.geo.block_size) as usize,
            ((end - base) / self.geo.block_size) as usize,
        )
    }

    /// Scratch bytes needed to give storage to the blocks `[first, last)`.
    pub(crate) fn storage_required(&self, first: usize, last: usize) -> usize {
        let missing = self.table.blocks[first..last]
            .iter()
            .filter(|b| b.is_none())
            .count();
        missing * crate::range::block_storage_bytes(self.geo.block_buffers)
    }

    /// Give storage to the blocks `[first, last)` for as long as `scratch` lasts.
    pub(crate) fn assign_storage(&mut self, scratch: &mut Scratch<'a>, first: usize, last: usize) {
        let buffers = self.geo.block_buffers;
        for block in &mut self.table.blocks[first..last] {
            if block.is_some() {
                continue;
            }
            let Some(status) = scratch.carve(buffers, |_| BufStatus::RESERVED) else {
                break;
            };
            let Some(nodes) = scratch.carve(buffers.div_ceil(2), |_| ListNode::UNLINKED) else {
                break;
            };
            *block = Some(BlockStorage { status, nodes });
        }
    }

    /// Every block in `[first, last)` has storage.
    pub(crate) fn check_storage(&self, first: usize, last: usize) -> Result<(), BuddyError> {
        match self.table.blocks.get(first..last) {
            Some(blocks) if blocks.iter().all(Option::is_some) => Ok(()),
            Some(_) => Err(BuddyError::OutOfMemory),
            None => Err(BuddyError::Failure),
        }
    }

    pub(crate) fn num_free_bufs(&self) -> u32 {
        self.counters.num_free_carved
    }

    pub(crate) fn num_used_bufs(&self) -> u32 {
        self.counters.num_carved - self.counters.num_free_carved
    }

    pub(crate) fn color_counts(&self, color: u32) -> Result<(u32, u32), BuddyError> {
        let slot = color as usize;
        match (self.counters.color_free.get(slot), self.counters.color_tot.get(slot)) {
            (Some(&free), Some(&total)) => Ok((free, total)),
            _ => Err(BuddyError::BadParameter),
        }
    }

    pub(crate) fn stats(&self) -> BuddyStats {
        let mut free_bufs = [0; MAX_NUM_SIZES];
        for (idx, slot) in free_bufs.iter_mut().enumerate().take(self.geo.num_sizes()) {
            *slot = self.lists.num_free(idx);
        }
        BuddyStats {
            min_shift: self.geo.min_shift,
            num_sizes: self.geo.num_sizes(),
            num_carved: self.counters.num_carved,
            num_free: self.counters.num_free_carved,
            free_bufs,
            used_bufs: self.counters.num_used,
            allocated: self.counters.type_allocated,
            released: self.counters.type_released,
        }
    }

    pub(crate) fn log_stats(&self) {
        let colors = self
            .geo
            .is_colored()
            .then_some((&*self.counters.color_free, &*self.counters.color_tot));
        self.stats().log(self.geo.name, colors);
    }

    /// Log every allocated location. Returns the number of entries.
    pub(crate) fn dump_entries(&self) -> u32 {
        let mut total = 0;
        let mut buf = self.geo.start_buf;
        while buf < self.end_buf {
            buf = match self.table.status(buf) {
                None => self.next_block(buf),
                Some(s) if s.state() == BufState::InUse => match self.size_encoding(buf) {
                    Some(e) => {
                        let units = e.units(self.geo.min_shift);
                        info!(
                            "{}: loc {:#x} size {:#x}",
                            self.geo.name,
                            buf << self.geo.min_shift,
                            units << self.geo.min_shift
                        );
                        total += 1;
                        buf + units
                    }
                    None => buf + 1,
                },
                Some(_) => buf + 1,
            };
        }
        info!("{}: dumped {total} entries", self.geo.name);
        total
    }

    #[cfg(test)]
    pub(crate) fn is_listed_free(&self, buf: u32, shift: u32) -> bool {
        self.is_free_at(buf, shift)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::range::StaticRange;

    fn inner(range: &StaticRange) -> SpaceInner<'static> {
        let geo = crate::range::Geometry::new_static(range).unwrap();
        let mem = vec![0u8; geo.mem_req()].leak();
        let mut scratch = Scratch::new(mem);
        let mut inner = SpaceInner::new(geo, &mut scratch).unwrap();
        let r = AddrRange::new(range.start, range.len);
        let (mut buf, end) = inner.carve_bounds(&r).unwrap();
        while buf < end {
            let (shift, n) = inner.next_piece(buf, end - buf);
            inner.carve_piece(buf, shift);
            buf += n;
        }
        inner
    }

    #[test]
    fn piece_shift_follows_alignment() {
        let s = inner(&StaticRange::new("p", 0, 16, 1, 8));
        assert_eq!(s.piece_shift(0, 7), 2);
        assert_eq!(s.piece_shift(4, 3), 1);
        assert_eq!(s.piece_shift(6, 1), 0);
        assert_eq!(s.piece_shift(0, 16), 3);
    }

    #[test]
    fn carving_produces_max_sized_buffers() {
        let s = inner(&StaticRange::new("c", 0, 64, 1, 16));
        let st = s.stats();
        assert_eq!(st.num_carved, 64);
        assert_eq!(st.free_bufs[4], 4);
        assert!(s.is_listed_free(0, 4));
        assert!(s.is_listed_free(48, 4));
    }

    #[test]
    fn complex_size_is_stored_in_following_entries() {
        let mut s = inner(&StaticRange::new("x", 0, 16, 1, 16));
        let loc = s.allocate(11, Color::Any).unwrap();
        assert_eq!(s.size_encoding(loc), Some(SizeEncoding::Complex(11)));
        assert_eq!(s.table.status(loc + 1).unwrap().into_bits(), 11);
        assert_eq!(s.table.status(loc + 2).unwrap().into_bits(), 0);
        assert_eq!(s.free(loc).unwrap(), 11);
        assert!(s.is_listed_free(0, 4));
        assert_eq!(s.table.status(1).unwrap().shift(), INVALID_SHIFT);
    }

    #[test]
    fn fragmentation_tail_is_free_right_away() {
        let mut s = inner(&StaticRange::new("t", 0, 16, 1, 16));
        let loc = s.allocate(5, Color::Any).unwrap();
        assert_eq!(loc, 0);
        // 5 units pinned at 0..5, the tail 5..16 is free as 1 + 2 + 8.
        assert!(s.is_listed_free(5, 0));
        assert!(s.is_listed_free(6, 1));
        assert!(s.is_listed_free(8, 3));
        assert_eq!(s.num_free_bufs(), 11);
    }

    #[test]
    fn retained_pieces_are_not_allocations() {
        let mut s = inner(&StaticRange::new("r", 0, 16, 1, 16));
        let three = s.allocate(3, Color::Any).unwrap();
        assert_eq!(three, 0);
        // Kept as 2 + 1; the second piece has a head of its own.
        assert_eq!(s.table.status(2).unwrap().state(), BufState::InUse);
        assert_eq!(s.free(2), Err(BuddyError::BadParameter));
        assert_eq!(s.loc_size(2), Err(BuddyError::BadParameter));
        assert_eq!(s.free(three).unwrap(), 3);
        assert_eq!(s.num_free_bufs(), 16);
    }
}
