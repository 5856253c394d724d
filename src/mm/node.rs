//! Node Layout
//!
//! Every chunk in a region starts with the same boundary-tagged header.
//!
//! ```text
//! offset  allocated (compact)   allocated (tracked)   free
//! 0x00    size                  size                  size
//! 0x04    preceding | ALLOC     preceding | ALLOC     preceding
//! 0x08    -                     owner pid             forward link
//! 0x0c    -                     -                     backward link
//! 0x10                          call site (u64)
//! ```
//!
//! `size` covers the whole chunk, header included. `preceding` holds the
//! size of the node just below this one, and its top bit is the allocation
//! state of *this* node. Free-list links are region-relative offsets with
//! `NIL` as the terminator.

use core::fmt;
use core::panic::Location;

use super::config::{HeapConfig, ALLOC_BIT, GRANULE};
use super::region::RegionMemory;

/// Free-list terminator.
pub(crate) const NIL: u32 = u32::MAX;

const SIZE: usize = 0x00;
const PRECEDING: usize = 0x04;
const FORWARD: usize = 0x08;
const BACKWARD: usize = 0x0c;
const OWNER: usize = 0x08;
const CALL_SITE: usize = 0x10;

/// The two boundary-tag words common to every node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Header {
    pub size: u32,
    pub preceding: u32,
}

impl Header {
    #[inline]
    pub fn is_allocated(&self) -> bool {
        self.preceding & ALLOC_BIT != 0
    }

    /// Size of the previous node with the allocation bit masked off.
    #[inline]
    pub fn prev_size(&self) -> u32 {
        self.preceding & !ALLOC_BIT
    }
}

#[inline]
pub(crate) fn read_header(mem: &RegionMemory<'_>, offset: usize) -> Option<Header> {
    Some(Header {
        size: mem.load_u32(offset + SIZE)?,
        preceding: mem.load_u32(offset + PRECEDING)?,
    })
}

#[inline]
pub(crate) fn write_header(mem: &mut RegionMemory<'_>, offset: usize, header: Header) {
    mem.store_u32(offset + SIZE, header.size);
    mem.store_u32(offset + PRECEDING, header.preceding);
}

/// Rewrite the preceding-size tag of `offset`, keeping its allocation bit.
#[inline]
pub(crate) fn retag_preceding(mem: &mut RegionMemory<'_>, offset: usize, prev_size: u32) -> Option<()> {
    let old = mem.load_u32(offset + PRECEDING)?;
    mem.store_u32(offset + PRECEDING, prev_size | (old & ALLOC_BIT));
    Some(())
}

#[inline]
pub(crate) fn read_forward(mem: &RegionMemory<'_>, offset: usize) -> Option<u32> {
    mem.load_u32(offset + FORWARD)
}

#[inline]
pub(crate) fn read_backward(mem: &RegionMemory<'_>, offset: usize) -> Option<u32> {
    mem.load_u32(offset + BACKWARD)
}

#[inline]
pub(crate) fn write_forward(mem: &mut RegionMemory<'_>, offset: usize, link: u32) {
    mem.store_u32(offset + FORWARD, link);
}

#[inline]
pub(crate) fn write_backward(mem: &mut RegionMemory<'_>, offset: usize, link: u32) {
    mem.store_u32(offset + BACKWARD, link);
}

/// Whether `offset` could name a node header inside `mem`.
#[inline]
pub(crate) fn is_node_offset(mem: &RegionMemory<'_>, offset: u32, header_size: usize) -> bool {
    let offset = offset as usize;
    offset % GRANULE == 0 && offset.checked_add(header_size).is_some_and(|end| end <= mem.len())
}

/// Who allocated a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Owner {
    /// Task that performed the allocation.
    pub pid: u32,
    /// Address identifying the allocating call site.
    pub call_site: usize,
}

impl Owner {
    /// No attribution available.
    pub const UNKNOWN: Self = Self {
        pid: 0,
        call_site: 0,
    };

    /// Attribute to `pid` at the caller's location.
    ///
    /// The call site is the address of the compiler-emitted location record
    /// for the calling line, which symbolizes back to file and line.
    #[track_caller]
    pub fn caller(pid: u32) -> Self {
        Self {
            pid,
            call_site: Location::caller() as *const Location<'static> as usize,
        }
    }
}

pub(crate) fn write_owner(mem: &mut RegionMemory<'_>, offset: usize, owner: Owner) {
    mem.store_u32(offset + OWNER, owner.pid);
    mem.store_u32(offset + OWNER + 4, 0);
    mem.store_u64(offset + CALL_SITE, owner.call_site as u64);
}

fn read_owner(mem: &RegionMemory<'_>, offset: usize) -> Option<Owner> {
    Some(Owner {
        pid: mem.load_u32(offset + OWNER)?,
        call_site: mem.load_u64(offset + CALL_SITE)? as usize,
    })
}

/// Snapshot of one node, as reported by walks and the corruption checker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeInfo {
    /// Absolute address of the header.
    pub addr: usize,
    /// Offset of the header from the region base.
    pub offset: usize,
    /// Size field, header included.
    pub size: u32,
    /// Preceding-size field with the allocation bit masked off.
    pub prev_size: u32,
    /// Allocation bit.
    pub allocated: bool,
    /// Owner record, for allocated nodes when tracking is on.
    pub owner: Option<Owner>,
}

impl NodeInfo {
    pub(crate) fn read(mem: &RegionMemory<'_>, offset: usize, config: &HeapConfig) -> Option<Self> {
        let header = read_header(mem, offset)?;
        let owner = if config.track_owners && header.is_allocated() {
            read_owner(mem, offset)
        } else {
            None
        };
        Some(Self {
            addr: mem.base() + offset,
            offset,
            size: header.size,
            prev_size: header.prev_size(),
            allocated: header.is_allocated(),
            owner,
        })
    }

    /// Whether this node is free.
    #[inline]
    pub fn is_free(&self) -> bool {
        !self.allocated
    }
}

impl fmt::Display for NodeInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "addr = {:#010x} size = {} preceding size = {} type = {}",
            self.addr,
            self.size,
            self.prev_size,
            if self.allocated { 'A' } else { 'F' }
        )?;
        if let Some(owner) = self.owner {
            write!(
                f,
                " owner pid = {} call site = {:#010x}",
                owner.pid, owner.call_site
            )?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_bit_lives_in_own_preceding() {
        let header = Header {
            size: 64,
            preceding: 48 | ALLOC_BIT,
        };
        assert!(header.is_allocated());
        assert_eq!(header.prev_size(), 48);
    }

    #[test]
    fn retag_keeps_allocation_state() {
        let mut buf = [0u8; 128];
        let mut mem = RegionMemory::new(&mut buf);
        write_header(&mut mem, 32, Header { size: 32, preceding: 16 | ALLOC_BIT });
        retag_preceding(&mut mem, 32, 80).unwrap();
        let header = read_header(&mem, 32).unwrap();
        assert!(header.is_allocated());
        assert_eq!(header.prev_size(), 80);
    }

    #[test]
    fn owner_round_trips_in_tracked_header() {
        let mut buf = [0u8; 128];
        let mut mem = RegionMemory::new(&mut buf);
        let config = HeapConfig::DEFAULT.with_owner_tracking(true);
        let owner = Owner::caller(7);
        write_header(&mut mem, 0, Header { size: 64, preceding: ALLOC_BIT });
        write_owner(&mut mem, 0, owner);
        let info = NodeInfo::read(&mem, 0, &config).unwrap();
        assert_eq!(info.owner, Some(owner));
        assert_ne!(owner.call_site, 0);
    }

    #[test]
    fn node_offsets_must_be_aligned_and_inside() {
        let mut buf = [0u8; 128];
        let mem = RegionMemory::new(&mut buf);
        assert!(is_node_offset(&mem, 16, 16));
        assert!(!is_node_offset(&mem, 8, 16));
        assert!(!is_node_offset(&mem, NIL, 16));
        assert!(!is_node_offset(&mem, mem.len() as u32, 16));
    }
}
