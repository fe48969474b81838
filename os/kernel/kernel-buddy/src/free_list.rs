//! Per-(size, color) doubly linked free lists.
//!
//! Lists link buffer numbers, not pointers. The node of a buffer lives in the
//! block storage at `ndx / 2`: two free buffers can never share a node,
//! because two free neighbors of the same size would have been coalesced.

use crate::inner::BufTable;
use crate::MAX_NUM_SIZES;

/// Link value of a node that is not on any list.
pub(crate) const INVALID_BUF: u32 = u32::MAX;
/// `prev` of the first node.
pub(crate) const LIST_HEAD: u32 = u32::MAX - 1;
/// `next` of the last node.
pub(crate) const LIST_TAIL: u32 = u32::MAX - 2;

#[derive(Debug, Copy, Clone)]
pub(crate) struct ListNode {
    pub prev: u32,
    pub next: u32,
}

impl ListNode {
    pub(crate) const UNLINKED: Self = Self {
        prev: INVALID_BUF,
        next: INVALID_BUF,
    };
}

pub(crate) struct FreeLists<'a> {
    /// First buffer of every list, `LIST_TAIL` when empty.
    heads: &'a mut [u32],
    /// Last buffer of every list, `LIST_HEAD` when empty.
    tails: &'a mut [u32],
    /// Index of the first list of each size class.
    offsets: [usize; MAX_NUM_SIZES],
    /// Lists per size class.
    colors: [u32; MAX_NUM_SIZES],
    /// Buffers currently on the lists, per size class.
    num_free: [u32; MAX_NUM_SIZES],
}

impl<'a> FreeLists<'a> {
    /// `heads` and `tails` must hold `colors.iter().sum()` entries.
    pub(crate) fn new(heads: &'a mut [u32], tails: &'a mut [u32], colors: &[u32]) -> Self {
        heads.fill(LIST_TAIL);
        tails.fill(LIST_HEAD);

        let mut offsets = [0; MAX_NUM_SIZES];
        let mut per_size = [0; MAX_NUM_SIZES];
        let mut next = 0;
        for (i, &n) in colors.iter().enumerate() {
            offsets[i] = next;
            per_size[i] = n;
            next += n as usize;
        }
        debug_assert_eq!(next, heads.len());

        Self {
            heads,
            tails,
            offsets,
            colors: per_size,
            num_free: [0; MAX_NUM_SIZES],
        }
    }

    #[inline]
    fn slot(&self, size_idx: usize, color: u32) -> usize {
        debug_assert!(color < self.colors[size_idx]);
        self.offsets[size_idx] + color as usize
    }

    pub(crate) const fn num_free(&self, size_idx: usize) -> u32 {
        self.num_free[size_idx]
    }

    /// Push `buf` to the front of its list.
    pub(crate) fn insert(&mut self, table: &mut BufTable<'_>, buf: u32, size_idx: usize, color: u32) {
        let slot = self.slot(size_idx, color);
        let old_head = self.heads[slot];

        table.set_node(
            buf,
            ListNode {
                prev: LIST_HEAD,
                next: old_head,
            },
        );
        if old_head == LIST_TAIL {
            self.tails[slot] = buf;
        } else {
            table.update_node(old_head, |n| n.prev = buf);
        }
        self.heads[slot] = buf;
        self.num_free[size_idx] += 1;
    }

    /// Unlink `buf` from its list.
    pub(crate) fn remove(&mut self, table: &mut BufTable<'_>, buf: u32, size_idx: usize, color: u32) {
        let slot = self.slot(size_idx, color);
        let Some(node) = table.node(buf) else {
            debug_assert!(false, "free buffer {buf} without list node");
            return;
        };
        debug_assert!(node.prev != INVALID_BUF && node.next != INVALID_BUF);

        if node.prev == LIST_HEAD {
            self.heads[slot] = node.next;
        } else {
            table.update_node(node.prev, |n| n.next = node.next);
        }
        if node.next == LIST_TAIL {
            self.tails[slot] = node.prev;
        } else {
            table.update_node(node.next, |n| n.prev = node.prev);
        }
        table.set_node(buf, ListNode::UNLINKED);
        self.num_free[size_idx] -= 1;
    }

    /// Pop the first buffer of a list.
    pub(crate) fn remove_head(&mut self, table: &mut BufTable<'_>, size_idx: usize, color: u32) -> Option<u32> {
        let head = self.heads[self.slot(size_idx, color)];
        if head == LIST_TAIL {
            return None;
        }
        self.remove(table, head, size_idx, color);
        Some(head)
    }
}
