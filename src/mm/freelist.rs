//! Free-List Index
//!
//! Free nodes of a region are threaded through doubly linked, intrusive
//! lists segregated by size class. Class `k` holds nodes whose size in
//! granules lies in `[2^k, 2^(k+1))`; the last class is open ended.
//!
//! Insertion pushes at the head of the class, so both insert and remove are
//! O(1). Lookup is first-fit: scan the request's own class until a node is
//! large enough, then take the head of the next non-empty class.

use super::config::GRANULE;
use super::node::{self, NIL};
use super::region::RegionMemory;

/// Number of size classes (covers every 31-bit node size).
pub(crate) const NUM_CLASSES: usize = 28;

/// Size class of a node of `size` bytes.
#[inline]
pub(crate) fn class_of(size: u32) -> usize {
    let units = (size as usize / GRANULE).max(1);
    ((usize::BITS - 1 - units.leading_zeros()) as usize).min(NUM_CLASSES - 1)
}

/// Per-region list heads, one per size class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct FreeIndex {
    heads: [u32; NUM_CLASSES],
    len: usize,
}

impl FreeIndex {
    pub const fn new() -> Self {
        Self {
            heads: [NIL; NUM_CLASSES],
            len: 0,
        }
    }

    /// Number of nodes currently linked.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn head(&self, class: usize) -> u32 {
        self.heads[class]
    }

    /// Link the free node at `offset` into the class for `size`.
    pub fn insert(&mut self, mem: &mut RegionMemory<'_>, offset: usize, size: u32) {
        let class = class_of(size);
        let head = self.heads[class];
        node::write_forward(mem, offset, head);
        node::write_backward(mem, offset, NIL);
        if head != NIL {
            node::write_backward(mem, head as usize, offset as u32);
        }
        self.heads[class] = offset as u32;
        self.len += 1;
    }

    /// Unlink the free node at `offset`, which was inserted with `size`.
    ///
    /// Returns `None` without touching memory if either link does not name a
    /// plausible node, so a corrupted list never turns into a wild store.
    pub fn remove(
        &mut self,
        mem: &mut RegionMemory<'_>,
        offset: usize,
        size: u32,
        header_size: usize,
    ) -> Option<()> {
        let forward = node::read_forward(mem, offset)?;
        let backward = node::read_backward(mem, offset)?;
        let valid = |link: u32| link == NIL || node::is_node_offset(mem, link, header_size);
        if !valid(forward) || !valid(backward) {
            return None;
        }

        if backward == NIL {
            let class = class_of(size);
            if self.heads[class] != offset as u32 {
                return None;
            }
            self.heads[class] = forward;
        } else {
            node::write_forward(mem, backward as usize, forward);
        }
        if forward != NIL {
            node::write_backward(mem, forward as usize, backward);
        }
        self.len -= 1;
        Some(())
    }

    /// First free node at least `required` bytes large.
    pub fn find(&self, mem: &RegionMemory<'_>, required: u32) -> Option<usize> {
        // A list longer than the region has granules can only be a cycle.
        let limit = mem.len() / GRANULE;
        for class in class_of(required)..NUM_CLASSES {
            let mut cursor = self.heads[class];
            let mut steps = 0;
            while cursor != NIL && steps < limit {
                let header = node::read_header(mem, cursor as usize)?;
                if header.size >= required {
                    return Some(cursor as usize);
                }
                cursor = node::read_forward(mem, cursor as usize)?;
                steps += 1;
            }
        }
        None
    }
}
